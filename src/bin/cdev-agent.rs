use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cdev::agent::{self, AgentArgs};

/// Map a result to the agent's exit-code contract: 0 clean, `-EPERM` if
/// not root, `-EINVAL` on bad flag combinations, -1 otherwise.
fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.rem_euclid(256) as u8)
}

fn main() -> ExitCode {
    let args = AgentArgs::parse();
    cdev::init_logger("cdev");

    if !rustix::process::geteuid().is_root() {
        log::error!("cdev-agent must be run as root");
        return exit_code(-libc::EPERM);
    }

    if let Err(err) = args.validate() {
        log::error!("{err:?}");
        return exit_code(-libc::EINVAL);
    }

    let result = run(args);
    match result {
        Ok(()) => exit_code(0),
        Err(err) => {
            log::error!("{err:?}");
            exit_code(-1)
        }
    }
}

fn run(args: AgentArgs) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(agent::run(args, None));
    rt.shutdown_background();
    result
}
