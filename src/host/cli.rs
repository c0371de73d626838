use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Host daemon command line.
#[derive(Parser)]
#[command(name = "cdev-host", about = "Device hotplug fabric: host daemon")]
pub struct HostArgs {
    /// Path of the Unix stream socket clients connect to.
    #[arg(long, default_value = "cdev.control")]
    pub socket_path: PathBuf,

    /// Directory holding one `<container-name>.rules` file per client.
    #[arg(long, default_value = "containers.d")]
    pub container_rules_dir: PathBuf,

    /// Listen on the raw kernel netlink channel instead of the udev
    /// rebroadcast channel.
    #[arg(long)]
    pub kernel_events: bool,

    /// Accept an inherited fd 3 under systemd socket activation
    /// (`LISTEN_PID` must equal this process).
    #[arg(long)]
    pub systemd: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}
