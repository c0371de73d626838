use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Container agent command line.
#[derive(Parser)]
#[command(name = "cdev-agent", about = "Device hotplug fabric: container agent")]
pub struct AgentArgs {
    /// Name this agent registers with the host under.
    #[arg(long)]
    pub name: String,

    /// Replay current devices as `add` after connecting.
    #[arg(long)]
    pub boot: bool,

    /// Replay current devices as `add`, then exit once the replay completes.
    #[arg(long)]
    pub boot_only: bool,

    /// Replay current devices as `remove`, then exit once the replay completes.
    #[arg(long)]
    pub shutdown: bool,

    /// Path of the host daemon's Unix stream socket.
    #[arg(long, default_value = "cdev.control")]
    pub socket_path: PathBuf,

    /// Directory of rules files, applied in lexical order.
    #[arg(long, default_value = "rules.d")]
    pub rules_dir: PathBuf,

    /// Path of this agent's own admin control socket (the udev-control-tool
    /// compatible endpoint), distinct from `--socket-path`.
    #[arg(long, default_value = "cdev-agent.control")]
    pub control_socket_path: PathBuf,

    /// Accept an inherited fd 3 for the control socket under systemd
    /// socket activation.
    #[arg(long)]
    pub systemd: bool,

    /// Disable device-node/persistence side effects.
    #[arg(long)]
    pub dry: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

impl AgentArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !(self.systemd && (self.boot_only || self.shutdown)),
            "--systemd is mutually exclusive with --boot-only and --shutdown"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemd_conflicts_with_boot_only() {
        let args = AgentArgs {
            name: "x".into(),
            boot: false,
            boot_only: true,
            shutdown: false,
            socket_path: "s".into(),
            rules_dir: "r".into(),
            control_socket_path: "c".into(),
            systemd: true,
            dry: false,
            verbosity: Verbosity::new(0, 0),
        };
        assert!(args.validate().is_err());
    }
}
