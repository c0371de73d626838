use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cdev::host::{self, HostArgs};

/// Map a result to the host daemon's exit-code contract: 0 clean,
/// negative errno on a fatal OS error, -1 otherwise. Exit codes are a
/// single byte, so negative values are taken mod 256 the way a libc
/// `exit()` call would truncate them.
fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.rem_euclid(256) as u8)
}

fn errno_of(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .and_then(std::io::Error::raw_os_error)
}

fn do_main() -> Result<()> {
    let args = HostArgs::parse();
    cdev::init_logger("cdev");

    if !rustix::process::geteuid().is_root() {
        anyhow::bail!("cdev-host must be run as root");
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(host::run(args, None));
    rt.shutdown_background();
    result
}

fn main() -> ExitCode {
    match do_main() {
        Ok(()) => exit_code(0),
        Err(err) => {
            log::error!("{err:?}");
            match errno_of(&err) {
                Some(errno) => exit_code(-errno),
                None => exit_code(-1),
            }
        }
    }
}
