//! Cgroup device arbitration.
//!
//! Cgroup controller drivers are external collaborators: the router
//! only calls through the narrow `allow`/`deny` interface below, keyed
//! by controller name (the strings a rule context collects into
//! `RuleContext::cgroups`).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::device::Device;

/// A single cgroup controller's device-access surface.
pub trait CgroupController: Send + Sync {
    /// Grant `container_name`'s cgroup access to `device`.
    fn allow(&self, container_name: &str, device: &Device) -> Result<()>;
    /// Revoke `container_name`'s cgroup access to `device`.
    fn deny(&self, container_name: &str, device: &Device) -> Result<()>;
}

fn device_rule(device: &Device) -> String {
    let kind = if device.subsystem == "block" { 'b' } else { 'c' };
    let (major, minor) = device.devnum;
    format!("{kind} {major}:{minor} rwm")
}

/// The classic cgroup v1 `devices` controller: a per-container directory
/// under `<root>/<container_name>` holding `devices.allow`/`devices.deny`
/// write-only files.
pub struct DeviceCgroupV1 {
    root: PathBuf,
}

impl DeviceCgroupV1 {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_dir(&self, container_name: &str) -> PathBuf {
        self.root.join(container_name)
    }
}

impl CgroupController for DeviceCgroupV1 {
    fn allow(&self, container_name: &str, device: &Device) -> Result<()> {
        if device.devnum == (0, 0) {
            return Ok(());
        }
        let path = self.container_dir(container_name).join("devices.allow");
        fs::write(&path, device_rule(device))
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn deny(&self, container_name: &str, device: &Device) -> Result<()> {
        if device.devnum == (0, 0) {
            return Ok(());
        }
        let path = self.container_dir(container_name).join("devices.deny");
        fs::write(&path, device_rule(device))
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

/// The set of controllers the router knows how to arbitrate, looked up
/// by the controller names a rule context requests.
#[derive(Default)]
pub struct CgroupControllers {
    controllers: HashMap<String, Box<dyn CgroupController>>,
}

impl CgroupControllers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, controller: Box<dyn CgroupController>) {
        self.controllers.insert(name.into(), controller);
    }

    /// Register the standard `devices` controller rooted at
    /// `/sys/fs/cgroup/devices`, or another root for testing.
    pub fn with_devices_v1(mut self, root: impl Into<PathBuf>) -> Self {
        self.register("devices", Box::new(DeviceCgroupV1::new(root)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn CgroupController> {
        self.controllers.get(name).map(|c| c.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap as Map};

    fn device(subsystem: &str, devnum: (u32, u32)) -> Device {
        Device {
            syspath: "/devices/x".into(),
            subsystem: subsystem.into(),
            sysname: "x".into(),
            devpath: "/devices/x".into(),
            devnode: Some("x".into()),
            devnum,
            properties: Map::new(),
            tags: BTreeSet::new(),
            devlinks: Vec::new(),
        }
    }

    #[test]
    fn allow_then_deny_write_expected_rule_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("my-container")).unwrap();
        let controller = DeviceCgroupV1::new(dir.path());

        controller.allow("my-container", &device("sound", (116, 24))).unwrap();
        let allow = std::fs::read_to_string(dir.path().join("my-container/devices.allow")).unwrap();
        assert_eq!(allow, "c 116:24 rwm");

        controller.deny("my-container", &device("sound", (116, 24))).unwrap();
        let deny = std::fs::read_to_string(dir.path().join("my-container/devices.deny")).unwrap();
        assert_eq!(deny, "c 116:24 rwm");
    }

    #[test]
    fn block_subsystem_uses_b_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("c")).unwrap();
        let controller = DeviceCgroupV1::new(dir.path());
        controller.allow("c", &device("block", (8, 0))).unwrap();
        let allow = std::fs::read_to_string(dir.path().join("c/devices.allow")).unwrap();
        assert_eq!(allow, "b 8:0 rwm");
    }

    #[test]
    fn no_node_device_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let controller = DeviceCgroupV1::new(dir.path());
        controller.allow("missing-dir", &device("usb", (0, 0))).unwrap();
    }

    #[test]
    fn lookup_by_name_finds_registered_controller() {
        let dir = tempfile::tempdir().unwrap();
        let controllers = CgroupControllers::new().with_devices_v1(dir.path());
        assert!(controllers.get("devices").is_some());
        assert!(controllers.get("freezer").is_none());
    }
}
