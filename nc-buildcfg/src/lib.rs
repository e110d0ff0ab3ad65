//! Exports configuration data fixed at build/package time.

pub const NETCACHE_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default system-wide configuration directory.
pub const CONFIGDIR: &str = "/etc/netcache";

/// Default config file name inside [`CONFIGDIR`].
pub const DEFAULT_CONFIG_FILE: &str = "netcached.conf";

#[macro_export]
macro_rules! NETCACHE_RUN_DIR_M {
    () => {
        "/run/netcache"
    };
}

#[macro_export]
macro_rules! NETCACHE_STATE_DIR_M {
    () => {
        "/var/lib/netcache"
    };
}

#[macro_export]
macro_rules! NETCACHE_LOG_DIR_M {
    () => {
        "/var/log/netcache"
    };
}

/// namespaced directory for in-memory (tmpfs) run state
pub const NETCACHE_RUN_DIR: &str = NETCACHE_RUN_DIR_M!();

/// namespaced directory for persistent state
pub const NETCACHE_STATE_DIR: &str = NETCACHE_STATE_DIR_M!();

/// namespaced directory for log files
pub const NETCACHE_LOG_DIR: &str = NETCACHE_LOG_DIR_M!();

/// Default prefix used for storage files inside a datastore directory,
/// e.g. `<prefix>1.db`, `<prefix>.index.db`.
pub const DEFAULT_STORAGE_PREFIX: &str = "nccache";

/// Name of the advisory "unclean shutdown" lock file, formatted with the pid.
pub fn started_lockfile_name(prefix: &str, pid: u32) -> String {
    format!("{prefix}_started_{pid}")
}
