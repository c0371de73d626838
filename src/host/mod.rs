//! The host daemon: accepts container-agent connections over a Unix
//! stream socket, tracks a device registry, and fans out netlink
//! uevents through each client's compiled ruleset.

pub mod cli;
mod client;
mod router;

use std::os::fd::FromRawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};

use crate::cgroup::CgroupControllers;
use crate::device::Registry;
use crate::netlink;
use crate::rule::RulesetCompiler;

pub use cli::HostArgs;
use router::{Router, RouterMsg};

pub async fn run(args: HostArgs, compiler: Option<Box<dyn RulesetCompiler>>) -> Result<()> {
    let listener = bind_listener(&args)?;

    let registry = {
        let mut registry = Registry::with_udev_source();
        registry
            .enable_persistent_registry(crate::runtime_dir())
            .context("failed to enable persistent registry")?;
        registry
    };
    let cgroups = CgroupControllers::new().with_devices_v1("/sys/fs/cgroup/devices");

    let (events_tx, events_rx) = mpsc::channel(256);
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);

    let router = Router::new(
        registry,
        cgroups,
        args.container_rules_dir.clone(),
        compiler,
        events_tx.clone(),
        shutdown_tx.clone(),
    );

    let accept_task = tokio::spawn(accept_loop(listener, events_tx.clone(), shutdown_tx.subscribe()));
    let netlink_task = tokio::spawn(netlink_loop(args.kernel_events, events_tx.clone(), shutdown_tx.subscribe()));

    tokio::select! {
        _ = router.run(events_rx) => {}
        signal = crate::runtime::shutdown_signal() => {
            if let Ok(name) = signal {
                log::info!("received {name}, shutting down");
            }
            let _ = shutdown_tx.send(true);
        }
    }

    accept_task.abort();
    netlink_task.abort();
    if let Some(path) = socket_cleanup_path(&args) {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn bind_listener(args: &HostArgs) -> Result<UnixListener> {
    if args.systemd {
        let fd = crate::runtime::systemd_inherited_fd()?;
        let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        return UnixListener::from_std(std_listener).context("failed to adopt inherited socket");
    }
    let _ = std::fs::remove_file(&args.socket_path);
    UnixListener::bind(&args.socket_path)
        .with_context(|| format!("failed to bind {}", args.socket_path.display()))
}

fn socket_cleanup_path(args: &HostArgs) -> Option<&PathBuf> {
    if args.systemd {
        None
    } else {
        Some(&args.socket_path)
    }
}

async fn accept_loop(listener: UnixListener, events: mpsc::Sender<RouterMsg>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        if events.send(RouterMsg::Accepted(stream)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log::warn!("accept failed: {err}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn netlink_loop(kernel_events: bool, events: mpsc::Sender<RouterMsg>, mut shutdown: watch::Receiver<bool>) {
    let socket = match netlink::open_upstream(kernel_events) {
        Ok(socket) => socket,
        Err(err) => {
            log::error!("failed to open netlink socket: {err:#}");
            return;
        }
    };
    loop {
        tokio::select! {
            received = socket.recv() => {
                match received {
                    Ok((event, needs_bloom)) => {
                        if events.send(RouterMsg::Netlink(event, needs_bloom)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log::warn!("failed to receive uevent: {err:#}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
