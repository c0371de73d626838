pub mod cgroup;
pub mod control;
pub mod device;
pub mod netlink;
pub mod protocol;
pub mod rule;
pub mod runtime;
pub mod util;

pub mod agent;
pub mod host;

/// Default runtime directory for persisted per-device state, overridable
/// with `CDEV_RUNTIME_DIR` so tests and non-root development setups don't
/// have to write under `/run`.
pub fn runtime_dir() -> std::path::PathBuf {
    std::env::var_os("CDEV_RUNTIME_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/run/cdev"))
}

/// Configure the shared `env_logger` the way both binaries want it: quiet by
/// default, overridable through `LOG`, with the target module path hidden.
pub fn init_logger(filter_module: &'static str) {
    let log_env = env_logger::Env::default()
        .filter_or("LOG", "info")
        .write_style_or("LOG_STYLE", "auto");
    env_logger::Builder::new()
        .filter_module(filter_module, log::LevelFilter::Info)
        .format_target(false)
        .parse_env(log_env)
        .init();
}
