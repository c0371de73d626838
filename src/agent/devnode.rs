//! Device node materialization inside the container's private `/dev`:
//! `mknod`/`chown`/`chmod` on add, devlink and node teardown on remove.
//!
//! NSS user/group lookups and the `mknod`/`chown` syscalls are external
//! collaborators (`nix`); this module only decides paths, modes, and
//! ownership from a [`RuleContext`].

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Group, Uid, User};

use crate::rule::{Action, RuleContext};

const DEFAULT_MODE: u32 = 0o660;

fn should_materialize(ctx: &RuleContext) -> bool {
    ctx.device.has_node() && ctx.device.devnode.is_some()
}

fn effective_mode(ctx: &RuleContext) -> u32 {
    ctx.mode
        .or_else(|| {
            ctx.properties
                .get("MODE")
                .and_then(|m| u32::from_str_radix(m, 8).ok())
        })
        .unwrap_or(DEFAULT_MODE)
}

fn resolve_uid(name: &str) -> u32 {
    match User::from_name(name) {
        Ok(Some(user)) => user.uid.as_raw(),
        Ok(None) => {
            log::error!("no such user {name:?}, falling back to uid 0");
            0
        }
        Err(err) => {
            log::error!("user lookup for {name:?} failed: {err}, falling back to uid 0");
            0
        }
    }
}

fn resolve_gid(name: &str) -> u32 {
    match Group::from_name(name) {
        Ok(Some(group)) => group.gid.as_raw(),
        Ok(None) => {
            log::error!("no such group {name:?}, falling back to gid 0");
            0
        }
        Err(err) => {
            log::error!("group lookup for {name:?} failed: {err}, falling back to gid 0");
            0
        }
    }
}

fn effective_owner(ctx: &RuleContext) -> (u32, u32) {
    let uid = ctx
        .owner
        .as_deref()
        .or_else(|| ctx.properties.get("OWNER").map(String::as_str))
        .map(resolve_uid)
        .unwrap_or(0);
    let gid = ctx
        .group
        .as_deref()
        .or_else(|| ctx.properties.get("GROUP").map(String::as_str))
        .map(resolve_gid)
        .unwrap_or(0);
    (uid, gid)
}

/// Rebase an absolute `/dev/...` path onto `dev_root`.
fn rebase(dev_root: &Path, absolute: &Path) -> PathBuf {
    match absolute.strip_prefix("/dev") {
        Ok(rest) => dev_root.join(rest),
        Err(_) => dev_root.join(absolute.strip_prefix("/").unwrap_or(absolute)),
    }
}

fn remove_empty_parents(leaf: &Path, stop_at: &Path) {
    let mut dir = leaf.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        if fs::remove_dir(&d).is_err() {
            break;
        }
        dir = d.parent().map(Path::to_path_buf);
    }
}

/// Apply `ctx`'s device-node side effect for `ctx.action`, rooted at
/// `dev_root` (the real `/dev` in production, a tempdir under test).
pub fn materialize(ctx: &RuleContext, dev_root: &Path) -> Result<()> {
    if !should_materialize(ctx) {
        return Ok(());
    }
    match ctx.action {
        Action::Add => materialize_add(ctx, dev_root),
        Action::Remove => materialize_remove(ctx, dev_root),
        Action::Change => Ok(()),
    }
}

fn materialize_add(ctx: &RuleContext, dev_root: &Path) -> Result<()> {
    let device = &ctx.device;
    let devnode = device.devnode.as_ref().expect("checked by should_materialize");
    let path = dev_root.join(devnode);
    let mode = effective_mode(ctx);
    let (uid, gid) = effective_owner(ctx);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if path.symlink_metadata().is_ok() {
        log::error!("device node {} already exists, skipping creation", path.display());
    } else {
        let kind = if device.subsystem == "block" { SFlag::S_IFBLK } else { SFlag::S_IFCHR };
        let dev = makedev(device.devnum.0 as u64, device.devnum.1 as u64);
        mknod(&path, kind, Mode::from_bits_truncate(mode), dev)
            .with_context(|| format!("mknod {} failed", path.display()))?;
        chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .with_context(|| format!("chown {} failed", path.display()))?;
        // A second chmod after mknod/chown, since mknod's mode is subject to umask.
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {} failed", path.display()))?;
    }

    for devlink in &ctx.devlinks {
        let link_path = rebase(dev_root, devlink);
        if let Some(parent) = link_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if link_path.symlink_metadata().is_ok() {
            log::warn!("devlink {} already exists, skipping", link_path.display());
            continue;
        }
        if let Err(err) = symlink(&path, &link_path) {
            log::warn!("failed to create devlink {}: {err}", link_path.display());
        }
    }
    Ok(())
}

fn materialize_remove(ctx: &RuleContext, dev_root: &Path) -> Result<()> {
    let device = &ctx.device;
    let devnode = device.devnode.as_ref().expect("checked by should_materialize");
    let path = dev_root.join(devnode);

    for devlink in &ctx.devlinks {
        let link_path = rebase(dev_root, devlink);
        match fs::read_link(&link_path) {
            Ok(target) => {
                let resolved = if target.is_absolute() {
                    target
                } else {
                    link_path.parent().map(|p| p.join(&target)).unwrap_or(target)
                };
                if resolved != path {
                    log::warn!(
                        "devlink {} points at {}, not {}; skipping",
                        link_path.display(),
                        resolved.display(),
                        path.display()
                    );
                    continue;
                }
                if let Err(err) = fs::remove_file(&link_path) {
                    log::warn!("failed to remove devlink {}: {err}", link_path.display());
                    continue;
                }
                remove_empty_parents(&link_path, dev_root);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                log::warn!("{} is not a symlink, skipping", link_path.display());
            }
            Err(err) => log::warn!("failed to read devlink {}: {err}", link_path.display()),
        }
    }

    match fs::symlink_metadata(&path) {
        Ok(meta) => {
            let rdev = meta.rdev();
            let found = (rustix::fs::major(rdev), rustix::fs::minor(rdev));
            if found != device.devnum {
                log::warn!(
                    "{} has devnum {:?}, expected {:?}; skipping removal",
                    path.display(),
                    found,
                    device.devnum
                );
            } else if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove {}: {err}", path.display());
            } else {
                remove_empty_parents(&path, dev_root);
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to stat {}: {err}", path.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::rule::EventSource;
    use std::collections::{BTreeSet, HashMap};
    use std::rc::Rc;

    fn ctx(action: Action, devnode: &str, devlinks: Vec<PathBuf>) -> RuleContext {
        let device = Rc::new(Device {
            syspath: "/devices/virtual/sound/card0/pcmC0D0p".into(),
            subsystem: "sound".into(),
            sysname: "pcmC0D0p".into(),
            devpath: "/devices/virtual/sound/card0/pcmC0D0p".into(),
            devnode: Some(devnode.into()),
            devnum: (116, 24),
            properties: HashMap::new(),
            tags: BTreeSet::new(),
            devlinks,
        });
        RuleContext::new(device, action, EventSource::Udev)
    }

    #[test]
    fn effective_mode_prefers_context_override() {
        let mut c = ctx(Action::Add, "snd/pcmC0D0p", Vec::new());
        c.mode = Some(0o600);
        assert_eq!(effective_mode(&c), 0o600);
    }

    #[test]
    fn effective_mode_falls_back_to_default() {
        let c = ctx(Action::Add, "snd/pcmC0D0p", Vec::new());
        assert_eq!(effective_mode(&c), DEFAULT_MODE);
    }

    #[test]
    fn devlink_creation_skips_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let dev_root = dir.path();
        fs::create_dir_all(dev_root.join("snd")).unwrap();
        fs::write(dev_root.join("snd/pcmC0D0p"), b"").unwrap();

        let link = dev_root.join("dev/by-id/sound");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        fs::write(&link, b"").unwrap();

        let mut c = ctx(Action::Add, "snd/pcmC0D0p", vec![PathBuf::from("/dev/by-id/sound")]);
        c.mode = Some(0o660);

        // Exercise only the devlink loop by calling materialize_add with a
        // node path that already exists (so mknod, which needs root, is
        // skipped) and asserting the pre-existing link was left untouched.
        materialize_add(&c, dev_root).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"");
    }

    #[test]
    fn remove_empty_parents_stops_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        remove_empty_parents(&nested.join("leaf"), dir.path());
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().exists());
    }
}
