//! The host daemon's single event-processing task: owns the device
//! registry and the client list exclusively, fed by accepted
//! connections, per-client inbound frames, and the netlink listener.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

use crate::cgroup::CgroupControllers;
use crate::device::{Device, Registry, SyncSelector};
use crate::netlink::UEventMessage;
use crate::protocol::{Command, Frame};
use crate::rule::{Action, EventSource, RuleContext, Ruleset, RulesetCompiler};
use crate::util::task::{JoinHandleGuard, WithJoinHandleGuard};

use super::client::{run_client, ClientEvent, ClientId};

const RULE_TIMEOUT: Duration = Duration::from_secs(2);

pub enum RouterMsg {
    Accepted(UnixStream),
    Client(ClientEvent),
    Netlink(UEventMessage, bool),
}

struct ClientRecord {
    name: Option<String>,
    outbound: mpsc::Sender<Frame>,
    ready: bool,
    dry: bool,
    ruleset: Option<Box<dyn Ruleset>>,
    /// Frames from a `queue`d emit directive, drained at the start of the
    /// next event this client sees rather than sent on the spot.
    pending: Vec<Frame>,
}

pub struct Router {
    registry: Registry,
    cgroups: CgroupControllers,
    clients: HashMap<ClientId, ClientRecord>,
    /// Per-client I/O task handles. Dropping an entry (on disconnect, or
    /// all of them together when the router itself drops) aborts the
    /// task instead of leaving it running unsupervised.
    tasks: HashMap<ClientId, JoinHandleGuard<()>>,
    next_client_id: ClientId,
    container_rules_dir: PathBuf,
    compiler: Option<Box<dyn RulesetCompiler>>,
    events_tx: mpsc::Sender<RouterMsg>,
    shutdown_tx: watch::Sender<bool>,
}

impl Router {
    pub fn new(
        registry: Registry,
        cgroups: CgroupControllers,
        container_rules_dir: PathBuf,
        compiler: Option<Box<dyn RulesetCompiler>>,
        events_tx: mpsc::Sender<RouterMsg>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            registry,
            cgroups,
            clients: HashMap::new(),
            tasks: HashMap::new(),
            next_client_id: 0,
            container_rules_dir,
            compiler,
            events_tx,
            shutdown_tx,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<RouterMsg>) {
        while let Some(msg) = inbox.recv().await {
            match msg {
                RouterMsg::Accepted(stream) => self.accept(stream),
                RouterMsg::Client(event) => self.handle_client_event(event).await,
                RouterMsg::Netlink(event, needs_bloom) => {
                    self.handle_netlink_event(event, needs_bloom).await
                }
            }
        }
        let _ = self.shutdown_tx.send(true);
    }

    fn accept(&mut self, stream: UnixStream) {
        let id = self.next_client_id;
        self.next_client_id += 1;
        let handle = tokio::spawn(run_client(
            id,
            stream,
            self.events_tx.clone(),
            self.shutdown_tx.subscribe(),
        ))
        .guard();
        self.tasks.insert(id, handle);
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { id, outbound } => {
                self.clients.insert(
                    id,
                    ClientRecord {
                        name: None,
                        outbound,
                        ready: false,
                        dry: false,
                        ruleset: None,
                        pending: Vec::new(),
                    },
                );
            }
            ClientEvent::Named { id, name } => {
                let ruleset = self.load_ruleset(&name);
                if let Some(record) = self.clients.get_mut(&id) {
                    record.name = Some(name);
                    record.ready = true;
                    record.ruleset = ruleset;
                }
            }
            ClientEvent::Inbound { id, command } => self.handle_inbound(id, command).await,
            ClientEvent::Disconnected { id } => {
                self.clients.remove(&id);
                // The task is already winding down on its own (this event
                // came from it), so dropping the guard here just stops
                // tracking it rather than cutting it off mid-exit.
                self.tasks.remove(&id);
            }
        }
    }

    fn load_ruleset(&self, name: &str) -> Option<Box<dyn Ruleset>> {
        let compiler = self.compiler.as_ref()?;
        let path = ruleset_path(&self.container_rules_dir, name)?;
        match compiler.compile(&path) {
            Ok(ruleset) => Some(ruleset),
            Err(err) => {
                log::warn!("failed to compile ruleset {}: {err:#}", path.display());
                None
            }
        }
    }

    async fn handle_inbound(&mut self, id: ClientId, command: Command) {
        let ready = self.clients.get(&id).map(|r| r.ready).unwrap_or(false);
        if !ready {
            return;
        }
        self.flush_pending(id).await;
        let Some(record) = self.clients.get_mut(&id) else {
            return;
        };
        match command {
            Command::Bye(reason) => {
                log::info!("client {id} said bye: {reason:?}");
                let _ = record.outbound.send(Frame::server_bye("ack")).await;
                self.clients.remove(&id);
            }
            Command::DryRun => {
                record.dry = true;
            }
            Command::Echo(payload) => {
                let _ = record.outbound.send(Frame::echo_reply(&payload)).await;
            }
            Command::Boot => self.replay(id, Action::Add, "boot").await,
            Command::Shutdown => self.replay(id, Action::Remove, "shutdown").await,
            other => {
                log::warn!("client {id} sent unexpected command {other:?}");
            }
        }
    }

    async fn replay(&mut self, id: ClientId, action: Action, cmd: &str) {
        let Some(record) = self.clients.get(&id) else {
            return;
        };
        let _ = record.outbound.send(Frame::begincmd(cmd)).await;

        for syspath in sysfs_devices_with_uevent() {
            let device = match self.registry.lookup_or_create(&syspath) {
                Ok(device) => device,
                Err(err) => {
                    log::warn!("failed to scrape {}: {err:#}", syspath.display());
                    continue;
                }
            };
            self.handle_uevent(Some(id), device, action, None, EventSource::Sys).await;
        }

        if let Some(record) = self.clients.get(&id) {
            let _ = record.outbound.send(Frame::endcmd(cmd)).await;
        }
    }

    /// Sends whatever a prior `queue`d emit directive left waiting for
    /// this client.
    async fn flush_pending(&mut self, id: ClientId) {
        let Some(record) = self.clients.get_mut(&id) else {
            return;
        };
        if record.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut record.pending);
        for frame in pending {
            let _ = record.outbound.send(frame).await;
        }
    }

    async fn handle_netlink_event(&mut self, event: UEventMessage, needs_bloom: bool) {
        let syspath = PathBuf::from(format!("/sys{}", event.devpath));
        let device = match self.registry.lookup_or_create(&syspath) {
            Ok(device) => device,
            Err(err) => {
                log::warn!("failed to resolve {}: {err:#}", syspath.display());
                return;
            }
        };

        let mut event = event;
        if needs_bloom {
            event.tag_bloom = Some(crate::netlink::uevent::tag_bloom(&device.tags));
        }

        let action = event.action;
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.handle_uevent(Some(id), device.clone(), action, Some(event.clone()), EventSource::Kernel)
                .await;
        }

        if action == Action::Remove {
            self.registry.invalidate(&syspath);
        }
    }

    /// The filter pipeline shared by boot/shutdown replay and live
    /// netlink fan-out.
    async fn handle_uevent(
        &mut self,
        client_id: Option<ClientId>,
        device: Rc<Device>,
        action: Action,
        event: Option<UEventMessage>,
        source: EventSource,
    ) {
        let Some(id) = client_id else { return };
        let Some(record) = self.clients.get(&id) else {
            return;
        };
        if !record.ready {
            return;
        }
        self.flush_pending(id).await;

        let mut ctx = RuleContext::new(device.clone(), action, source);
        if let Some(record) = self.clients.get(&id) {
            if let Some(ruleset) = &record.ruleset {
                if tokio::time::timeout(RULE_TIMEOUT, ruleset.evaluate(&mut ctx))
                    .await
                    .is_err()
                {
                    log::warn!("rule evaluation for client {id} timed out after {RULE_TIMEOUT:?}");
                }
            }
        }

        if !ctx.result {
            return;
        }

        let dry = self.clients.get(&id).map(|r| r.dry).unwrap_or(false);

        // 1. Cgroup arbitration.
        if !ctx.cgroups.is_empty() && !dry && matches!(action, Action::Add | Action::Remove) {
            if let Some(name) = self.clients.get(&id).and_then(|r| r.name.clone()) {
                for controller_name in &ctx.cgroups {
                    let Some(controller) = self.cgroups.get(controller_name) else {
                        continue;
                    };
                    let result = match action {
                        Action::Add => controller.allow(&name, &device),
                        Action::Remove => controller.deny(&name, &device),
                        Action::Change => unreachable!(),
                    };
                    if let Err(err) = result {
                        log::warn!("cgroup {controller_name} update failed for {name}: {err:#}");
                    }
                }
            }
        }

        // 2. State forwarding.
        if device.id_filename().is_some() && action != Action::Remove && !ctx.forward.is_empty() {
            let buffer = crate::device::SyncBuffer::serialize(ctx.forward, &ctx.properties, &ctx.tags);
            let frame = Frame::sync(device.wire_devpath(), ctx.forward, &buffer);
            if let Some(record) = self.clients.get(&id) {
                let _ = record.outbound.send(frame).await;
            }
            if !dry {
                let _ = self.registry.flush(&device);
            }
        }

        // 3. Event emission.
        let outgoing = match &event {
            Some(event) if !ctx.forward.contains(SyncSelector::ENV) => event.stripped_of_env(),
            Some(event) => event.clone(),
            None => {
                let mut synthetic = UEventMessage::new(action, device.wire_devpath());
                synthetic.properties = ctx.properties.clone();
                synthetic
            }
        };
        if let Some(record) = self.clients.get(&id) {
            let _ = record.outbound.send(Frame::uevent(outgoing.encode_libudev())).await;
        }

        // 4. Emit directive.
        if let Some(directive) = ctx.emit.take() {
            let target = if directive.what.is_empty() || directive.what == "." {
                Some(device.clone())
            } else {
                self.registry.resolve_relative(&device, &directive.what).ok()
            };
            if let Some(target) = target {
                let mut secondary = UEventMessage::new(directive.action, target.wire_devpath());
                secondary.properties = target.properties.clone();
                if directive.options.noenv {
                    secondary = secondary.stripped_of_env();
                }
                let buffer = secondary.encode_libudev();
                if directive.options.queue {
                    if let Some(record) = self.clients.get_mut(&id) {
                        record.pending.push(Frame::uevent(buffer));
                    }
                } else if let Some(record) = self.clients.get(&id) {
                    let _ = record.outbound.send(Frame::uevent(buffer)).await;
                }
            }
        }

        if !dry {
            for modified in ctx.modified_devices.drain(..) {
                let _ = self.registry.flush(&modified);
            }
        }
    }
}

fn ruleset_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let candidate = dir.join(format!("{name}.rules"));
    if candidate.is_file() {
        return Some(candidate);
    }
    let lower = dir.join(format!("{}.rules", name.to_lowercase()));
    if lower.is_file() {
        return Some(lower);
    }
    None
}

/// Every directory under `/sys/devices` containing a `uevent` file,
/// top-down.
fn sysfs_devices_with_uevent() -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::from("/sys/devices")];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        if dir.join("uevent").is_file() {
            out.push(dir.clone());
        }
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ruleset_path_falls_back_to_lowercase() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.rules"), "").unwrap();
        assert_eq!(
            ruleset_path(dir.path(), "FOO"),
            Some(dir.path().join("foo.rules"))
        );
    }

    #[test]
    fn ruleset_path_is_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ruleset_path(dir.path(), "missing"), None);
    }
}
