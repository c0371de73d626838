//! The container agent: connects to the host daemon, evaluates the
//! container-local ruleset preset against forwarded events, materializes
//! device nodes, and rebroadcasts raw uevents on a container-local
//! netlink group.

pub mod cli;
mod devnode;

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub use cli::AgentArgs;

use crate::control::{ControlMessage, ControlSocket, ControlSource};
use crate::device::{Registry, SyncBuffer, SyncSelector};
use crate::netlink::{self, UEventMessage};
use crate::protocol::{Command, Frame, FrameCodec};
use crate::rule::{Action, EventSource, RuleContext, Ruleset, RulesetCompiler};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A compiled rules directory: every file that parsed, in lexical order,
/// each wrapped so a panicking rule doesn't take the whole preset down.
#[derive(Default)]
struct Preset {
    rulesets: Vec<(PathBuf, Box<dyn Ruleset>)>,
}

impl Preset {
    async fn evaluate(&self, ctx: &mut RuleContext) {
        for (path, ruleset) in &self.rulesets {
            let outcome = AssertUnwindSafe(ruleset.evaluate(ctx)).catch_unwind().await;
            if outcome.is_err() {
                log::error!("ruleset {} panicked while evaluating an event; isolating it", path.display());
            }
        }
    }
}

fn load_preset(dir: &Path, compiler: &dyn RulesetCompiler) -> Preset {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).filter(|p| p.is_file()).collect())
        .unwrap_or_default();
    paths.sort();

    let mut rulesets = Vec::new();
    for path in paths {
        match compiler.compile(&path) {
            Ok(ruleset) => rulesets.push((path, ruleset)),
            Err(err) => log::warn!("failed to compile {}: {err:#}", path.display()),
        }
    }
    Preset { rulesets }
}

async fn connect(args: &AgentArgs) -> Result<UnixStream> {
    UnixStream::connect(&args.socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", args.socket_path.display()))
}

/// Open this agent's own admin control socket per `--systemd`/
/// `--control-socket-path`, or `None` if neither yields a usable source.
fn open_control_socket(args: &AgentArgs) -> Result<Option<ControlSocket>> {
    let source = if args.systemd {
        ControlSource::InheritedFd(crate::runtime::systemd_inherited_fd()?)
    } else {
        ControlSource::Path(&args.control_socket_path)
    };
    ControlSocket::maybe_open(Some(source))
}

/// Awaits the next control message, or never resolves if no control
/// socket is open, so it can sit in a `tokio::select!` unconditionally.
async fn recv_control(control: &Option<ControlSocket>) -> Result<ControlMessage> {
    match control {
        Some(control) => control.recv().await,
        None => std::future::pending().await,
    }
}

pub async fn run(args: AgentArgs, compiler: Option<Box<dyn RulesetCompiler>>) -> Result<()> {
    args.validate()?;

    let mut registry = Registry::with_udev_source();
    if !args.dry {
        registry
            .enable_persistent_registry(crate::runtime_dir())
            .context("failed to enable persistent registry")?;
    }

    let stream = connect(&args).await?;
    let mut framed = Framed::new(stream, FrameCodec::default());

    match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) if frame.clone().into_command() == Command::Hello => {}
        _ => {
            let _ = framed.send(Frame::bye(Some("handshake timeout"))).await;
            anyhow::bail!("did not receive HELLO within {HANDSHAKE_TIMEOUT:?}");
        }
    }

    framed.send(Frame::client_hello(&args.name)).await?;
    if args.dry {
        framed.send(Frame::dry_run()).await?;
    }

    let mut preset = compiler
        .as_deref()
        .map(|c| load_preset(&args.rules_dir, c))
        .unwrap_or_default();

    let control = open_control_socket(&args).context("failed to open control socket")?;

    let rebroadcast = netlink::open_rebroadcast().context("failed to open rebroadcast socket")?;

    let replay_only = args.boot_only || args.shutdown;
    if args.boot || args.boot_only {
        framed.send(Frame::boot()).await?;
    }
    if args.shutdown {
        framed.send(Frame::shutdown()).await?;
    }

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame.into_command() {
                    Command::UEvent(data) => {
                        handle_uevent(&mut registry, &preset, &rebroadcast, &data, args.dry).await;
                    }
                    Command::Sync(devpath, selector, buffer) => {
                        apply_sync(&mut registry, &devpath, selector, &buffer);
                    }
                    Command::BeginCmd(_) => {}
                    Command::EndCmd(_) => {
                        if replay_only {
                            break;
                        }
                    }
                    Command::ServerBye(reason) => {
                        log::info!("host said bye: {reason}");
                        let _ = framed.send(Frame::bye(None)).await;
                        break;
                    }
                    Command::EchoReply(payload) => {
                        log::debug!("echo reply: {} bytes", payload.len());
                    }
                    other => log::warn!("unexpected command from host: {other:?}"),
                }
            }
            signal = crate::runtime::shutdown_signal() => {
                if let Ok(name) = signal {
                    log::info!("received {name}, disconnecting");
                }
                let _ = framed.send(Frame::bye(Some("shutting down"))).await;
                break;
            }
            message = recv_control(&control) => {
                match message {
                    Ok(ControlMessage::Reload) => {
                        log::info!("control: reloading rules from {}", args.rules_dir.display());
                        preset = compiler
                            .as_deref()
                            .map(|c| load_preset(&args.rules_dir, c))
                            .unwrap_or_default();
                    }
                    Ok(ControlMessage::Ping) => log::info!("control: ping"),
                    Ok(ControlMessage::SetLogLevel(level)) => {
                        log::info!("control: set-log-level {level} (ignored)");
                    }
                    Ok(ControlMessage::StopExecQueue) => log::info!("control: stop-exec-queue (ignored)"),
                    Ok(ControlMessage::StartExecQueue) => log::info!("control: start-exec-queue (ignored)"),
                    Ok(ControlMessage::SetEnv(kv)) => log::info!("control: set-env {kv} (ignored)"),
                    Ok(ControlMessage::SetChildrenMax(n)) => {
                        log::info!("control: set-children-max {n} (ignored, no worker pool)");
                    }
                    Ok(ControlMessage::Exit) => {
                        log::info!("control: exit requested, disconnecting");
                        let _ = framed.send(Frame::bye(Some("control exit"))).await;
                        break;
                    }
                    Ok(ControlMessage::Unknown(code)) => log::warn!("control: unknown message type {code}"),
                    Err(err) => log::warn!("control socket error: {err:#}"),
                }
            }
        }
    }

    Ok(())
}

async fn handle_uevent(
    registry: &mut Registry,
    preset: &Preset,
    rebroadcast: &netlink::NetlinkSocket,
    data: &[u8],
    dry: bool,
) {
    // The agent rebroadcasts the host's buffer verbatim, so it never needs
    // to rebuild a tag bloom filter itself.
    let (event, _needs_bloom) = match UEventMessage::decode(data) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::warn!("dropping malformed uevent: {err}");
            return;
        }
    };

    let syspath = PathBuf::from(format!("/sys{}", event.devpath));
    let device = match registry.lookup_or_create(&syspath) {
        Ok(device) => device,
        Err(err) => {
            log::warn!("failed to resolve {}: {err:#}", syspath.display());
            return;
        }
    };

    let mut ctx = RuleContext::new(device, event.action, EventSource::Udev);
    preset.evaluate(&mut ctx).await;

    if !dry {
        for modified in &ctx.modified_devices {
            let _ = registry.flush(modified);
        }
    }

    if !dry {
        if let Err(err) = devnode::materialize(&ctx, Path::new("/dev")) {
            log::warn!("device node materialization failed for {}: {err:#}", ctx.device.wire_devpath());
        }
    }

    if let Err(err) = rebroadcast.send(data, netlink::Group::Udev).await {
        log::warn!("failed to rebroadcast uevent: {err:#}");
    }
}

fn apply_sync(registry: &mut Registry, devpath: &str, selector: SyncSelector, buffer: &[u8]) {
    let syspath = PathBuf::from(format!("/sys{devpath}"));
    let Ok(device) = registry.lookup_or_create(&syspath) else {
        return;
    };
    let parsed = SyncBuffer::deserialize(buffer);
    let mut updated = (*device).clone();
    if selector.contains(SyncSelector::ENV) {
        if let Some(env) = parsed.env {
            updated.properties = env;
        }
    }
    if selector.contains(SyncSelector::TAGS) {
        if let Some(tags) = parsed.tags {
            updated.tags = tags;
        }
    }
    registry.insert(updated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::LocalBoxFuture;
    use std::collections::HashMap;

    struct PanicsOnce;
    impl Ruleset for PanicsOnce {
        fn evaluate<'a>(&'a self, _ctx: &'a mut RuleContext) -> LocalBoxFuture<'a, ()> {
            Box::pin(async { panic!("boom") })
        }
    }

    struct MarksForwarded;
    impl Ruleset for MarksForwarded {
        fn evaluate<'a>(&'a self, ctx: &'a mut RuleContext) -> LocalBoxFuture<'a, ()> {
            Box::pin(async move {
                ctx.forward = crate::device::SyncSelector::ENV;
            })
        }
    }

    fn device() -> std::rc::Rc<crate::device::Device> {
        std::rc::Rc::new(crate::device::Device {
            syspath: "/devices/x".into(),
            subsystem: "sound".into(),
            sysname: "x".into(),
            devpath: "/devices/x".into(),
            devnode: None,
            devnum: (0, 0),
            properties: HashMap::new(),
            tags: BTreeSet::new(),
            devlinks: Vec::new(),
        })
    }

    #[tokio::test]
    async fn panicking_ruleset_does_not_stop_the_rest() {
        let preset = Preset {
            rulesets: vec![
                (PathBuf::from("a.rules"), Box::new(PanicsOnce)),
                (PathBuf::from("b.rules"), Box::new(MarksForwarded)),
            ],
        };
        let mut ctx = RuleContext::new(device(), Action::Add, EventSource::Udev);
        preset.evaluate(&mut ctx).await;
        assert_eq!(ctx.forward, crate::device::SyncSelector::ENV);
    }
}
