//! The device model shared by the host router and the container agent:
//! a process-wide registry keyed by sysfs path, plus the [`SyncBuffer`]
//! used to carry a slice of a device's state across the host/container
//! boundary.

mod sync_buffer;

pub use sync_buffer::{SyncBuffer, SyncSelector};

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};

/// `(major, minor)`. `(0, 0)` means "no device node".
pub type DevNum = (u32, u32);

/// Everything the registry knows about one kernel device.
///
/// Identity is the sysfs path: two [`Registry::lookup_or_create`] calls
/// for the same path return handles to the same `Device`.
#[derive(Debug, Clone)]
pub struct Device {
    pub syspath: PathBuf,
    pub subsystem: String,
    pub sysname: String,
    pub devpath: String,
    pub devnode: Option<String>,
    pub devnum: DevNum,
    pub properties: HashMap<String, String>,
    pub tags: BTreeSet<String>,
    pub devlinks: Vec<PathBuf>,
}

impl Device {
    pub fn has_node(&self) -> bool {
        self.devnum != (0, 0)
    }

    /// Devpath with the `/sys` prefix removed, as the kernel/udev send it
    /// on the wire.
    pub fn wire_devpath(&self) -> &str {
        self.devpath
            .strip_prefix("/sys")
            .unwrap_or(&self.devpath)
    }

    /// Deterministic filename for the per-device persistence file:
    /// derived from devnum when the device has a node, otherwise from
    /// the devpath, escaped so it is always a single safe path
    /// component.
    pub fn id_filename(&self) -> Option<String> {
        if self.has_node() {
            let kind = if self.subsystem == "block" { 'b' } else { 'c' };
            Some(format!("{kind}{}:{}", self.devnum.0, self.devnum.1))
        } else if !self.devpath.is_empty() {
            Some(format!("+{}", crate::util::escape::escape_path(self.wire_devpath())))
        } else {
            None
        }
    }
}

/// External collaborator: constructs a [`Device`] by reading the sysfs
/// entry at a given syspath. The core never parses sysfs attribute
/// files itself; it only consumes this narrow interface.
pub trait SysfsSource {
    fn scrape(&self, syspath: &Path) -> Result<Device>;
}

/// Default [`SysfsSource`] backed by the `udev` crate's sysfs reader.
/// This is the low-level sysfs scraper kept external to the core: the
/// core only depends on it through the trait above.
pub struct UdevSysfsSource;

impl SysfsSource for UdevSysfsSource {
    fn scrape(&self, syspath: &Path) -> Result<Device> {
        let dev = udev::Device::from_syspath(syspath)
            .with_context(|| format!("failed to read sysfs device at {}", syspath.display()))?;
        Ok(device_from_udev(&dev))
    }
}

fn device_from_udev(dev: &udev::Device) -> Device {
    let devnum = dev
        .devnum()
        .map(|n| (rustix::fs::major(n), rustix::fs::minor(n)))
        .unwrap_or((0, 0));

    let properties = dev
        .properties()
        .map(|p| {
            (
                p.name().to_string_lossy().into_owned(),
                p.value().to_string_lossy().into_owned(),
            )
        })
        .collect();

    let tags = dev
        .tags()
        .map(|t| t.to_string_lossy().into_owned())
        .collect();

    Device {
        syspath: dev.syspath().to_owned(),
        subsystem: dev
            .subsystem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        sysname: dev.sysname().to_string_lossy().into_owned(),
        devpath: dev.devpath().to_string_lossy().into_owned(),
        devnode: dev.devnode().map(|p| p.to_string_lossy().into_owned()),
        devnum,
        properties,
        tags,
        devlinks: dev.devlinks().map(|l| l.to_owned()).collect(),
    }
}

/// Process-wide map from sysfs path to [`Device`], with lazy persistence.
///
/// Single-writer by construction: callers in this crate only ever touch a
/// `Registry` from the daemon's central event-processing task, so no
/// internal locking is needed. Shared ownership of an individual
/// `Device` handle across a single logical handler is modeled with `Rc`
/// rather than a lock.
pub struct Registry {
    source: Box<dyn SysfsSource>,
    devices: HashMap<PathBuf, Rc<Device>>,
    runtime_dir: Option<PathBuf>,
}

impl Registry {
    pub fn new(source: Box<dyn SysfsSource>) -> Self {
        Self {
            source,
            devices: HashMap::new(),
            runtime_dir: None,
        }
    }

    pub fn with_udev_source() -> Self {
        Self::new(Box::new(UdevSysfsSource))
    }

    /// Enable on-disk persistence under `dir`. Idempotent; only the host
    /// daemon is expected to call this.
    pub fn enable_persistent_registry(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create runtime directory {}", dir.display()))?;
        self.runtime_dir = Some(dir);
        Ok(())
    }

    pub fn lookup_or_create(&mut self, syspath: &Path) -> Result<Rc<Device>> {
        if let Some(device) = self.devices.get(syspath) {
            return Ok(device.clone());
        }
        let device = Rc::new(self.source.scrape(syspath)?);
        self.devices.insert(syspath.to_owned(), device.clone());
        Ok(device)
    }

    /// Insert (or replace) a device that was already fully constructed,
    /// e.g. from a live netlink event rather than a fresh sysfs scrape.
    pub fn insert(&mut self, device: Device) -> Rc<Device> {
        let device = Rc::new(device);
        self.devices.insert(device.syspath.clone(), device.clone());
        device
    }

    pub fn get(&self, syspath: &Path) -> Option<Rc<Device>> {
        self.devices.get(syspath).cloned()
    }

    /// Resolve a sysfs-relative child path, e.g. for `emit` directives.
    pub fn resolve_relative(&mut self, base: &Device, relative: &str) -> Result<Rc<Device>> {
        let syspath = base.syspath.join(relative);
        self.lookup_or_create(&syspath)
    }

    /// Remove a device from the registry. Any `Rc<Device>` already held
    /// by a caller remains valid for the remainder of its holder's
    /// operation; it simply won't be returned by a subsequent lookup.
    pub fn invalidate(&mut self, syspath: &Path) {
        self.devices.remove(syspath);
    }

    /// Serialize a device's mutable state (overlay properties, tags) to
    /// its persistence file, replacing the whole file for atomicity.
    pub fn flush(&self, device: &Device) -> Result<()> {
        let Some(dir) = &self.runtime_dir else {
            return Ok(());
        };
        let Some(filename) = device.id_filename() else {
            return Ok(());
        };
        let path = dir.join(filename);
        let buf = SyncBuffer::serialize(
            SyncSelector::ENV | SyncSelector::TAGS,
            &device.properties,
            &device.tags,
        );
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;
    impl SysfsSource for FixedSource {
        fn scrape(&self, syspath: &Path) -> Result<Device> {
            Ok(Device {
                syspath: syspath.to_owned(),
                subsystem: "sound".into(),
                sysname: "pcmC0D0p".into(),
                devpath: format!("/sys{}", syspath.display()),
                devnode: Some("snd/pcmC0D0p".into()),
                devnum: (116, 24),
                properties: HashMap::new(),
                tags: BTreeSet::new(),
                devlinks: Vec::new(),
            })
        }
    }

    #[test]
    fn lookup_or_create_returns_same_identity() {
        let mut registry = Registry::new(Box::new(FixedSource));
        let path = Path::new("/devices/virtual/sound/card0");
        let a = registry.lookup_or_create(path).unwrap();
        let b = registry.lookup_or_create(path).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalidate_makes_next_lookup_fresh() {
        let mut registry = Registry::new(Box::new(FixedSource));
        let path = Path::new("/devices/virtual/sound/card0");
        let a = registry.lookup_or_create(path).unwrap();
        registry.invalidate(path);
        let b = registry.lookup_or_create(path).unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn flush_without_persistence_enabled_is_a_noop() {
        let registry = Registry::new(Box::new(FixedSource));
        let device = Device {
            syspath: "/devices/x".into(),
            subsystem: "sound".into(),
            sysname: "x".into(),
            devpath: "/sys/devices/x".into(),
            devnode: None,
            devnum: (0, 0),
            properties: HashMap::new(),
            tags: BTreeSet::new(),
            devlinks: Vec::new(),
        };
        registry.flush(&device).unwrap();
    }
}
