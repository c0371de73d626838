//! The shared pieces of daemon runtime both binaries need: a graceful
//! shutdown future driven by `SIGINT`/`SIGTERM`, and `--systemd` socket
//! activation.

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};

/// Completes the first time `SIGINT` or `SIGTERM` arrives, carrying the
/// signal's name. Clone-free: callers `select!` on the returned future
/// directly, and a second caller can await a second invocation of this
/// function since each one installs its own handlers.
pub async fn shutdown_signal() -> Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

/// Resolve the inherited control-socket fd under systemd socket
/// activation: only valid when `LISTEN_PID` names this process and
/// exactly one fd (`LISTEN_FDS`) was passed, which systemd places at 3.
pub fn systemd_inherited_fd() -> Result<i32> {
    let listen_pid: i32 = std::env::var("LISTEN_PID")
        .context("LISTEN_PID not set; not invoked under socket activation")?
        .parse()
        .context("LISTEN_PID is not a valid pid")?;
    if listen_pid != std::process::id() as i32 {
        bail!("LISTEN_PID {listen_pid} does not match this process");
    }
    let listen_fds: u32 = std::env::var("LISTEN_FDS")
        .context("LISTEN_FDS not set")?
        .parse()
        .context("LISTEN_FDS is not a valid count")?;
    if listen_fds != 1 {
        bail!("expected exactly one inherited fd, got {listen_fds}");
    }
    Ok(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // LISTEN_PID/LISTEN_FDS are process-global; serialize the two tests
    // that touch them so they don't race under a parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn systemd_inherited_fd_requires_matching_pid() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LISTEN_PID", "1");
        std::env::set_var("LISTEN_FDS", "1");
        assert!(systemd_inherited_fd().is_err());
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
    }

    #[test]
    fn systemd_inherited_fd_accepts_own_pid() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LISTEN_PID", std::process::id().to_string());
        std::env::set_var("LISTEN_FDS", "1");
        assert_eq!(systemd_inherited_fd().unwrap(), 3);
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
    }
}
