//! Runtime configuration.
//!
//! All parameters can be set from the command line or the environment. The
//! defaults are chosen so that `nectar` comes up on a lab machine with a
//! local Docker daemon and a prepared `sshh` sandbox image.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime parameters for the honeypot proxy.
///
/// # Fields Overview
///
/// The configuration contains the following attributes:
/// - `bind_address`: listener address for inbound SSH
/// - `host_key_path`: private host key presented to attackers
/// - `database_path`: SQLite file backing the audit log
/// - `pool_capacity`: number of pre-warmed sandboxes kept ready
/// - `keep_alive_secs`: sandbox lifetime after a session is admitted
/// - `geo_api_key`: key for the geolocation provider (empty disables it)
/// - `sandbox_user` / `sandbox_password`: fixed credentials the proxy uses
///   against the sandbox's own sshd
#[derive(Parser, Debug, Clone)]
#[command(name = "nectar")]
#[command(about = "SSH honeypot proxy backed by disposable sandbox containers")]
pub struct Config {
    /// Address and port to listen on for inbound SSH.
    ///
    /// # Command Line
    /// Use `--bind-address <ADDR:PORT>` to set this value from the CLI
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:1337")]
    pub bind_address: String,

    /// Path to the SSH private host key presented to attackers.
    ///
    /// Failure to read or parse this key is fatal at startup.
    ///
    /// # Command Line
    /// Use `--host-key-path <PATH>` to set this value from the CLI
    #[arg(long, env = "HOST_KEY_PATH", default_value = "host_key")]
    pub host_key_path: PathBuf,

    /// SQLite file holding the audit log.
    ///
    /// Created (with its schema) on first run if missing.
    ///
    /// # Command Line
    /// Use `--database-path <PATH>` to set this value from the CLI
    #[arg(long, env = "DATABASE_PATH", default_value = "log.sqlite")]
    pub database_path: PathBuf,

    /// Number of pre-warmed sandbox containers kept ready for new sessions.
    ///
    /// A capacity of 1 is valid; admitted connections block until a ready
    /// sandbox is available.
    ///
    /// # Command Line
    /// Use `--pool-capacity <COUNT>` to set this value from the CLI
    #[arg(long, env = "POOL_CAPACITY", default_value_t = 2)]
    pub pool_capacity: usize,

    /// Seconds a sandbox is allowed to live after its session is admitted.
    ///
    /// When the timer fires the sandbox is stopped, which tears down the
    /// backend SSH session and ends the attacker's session with it.
    ///
    /// # Command Line
    /// Use `--keep-alive-secs <SECONDS>` to set this value from the CLI
    #[arg(long, env = "KEEP_ALIVE_SECS", default_value_t = 300)]
    pub keep_alive_secs: u64,

    /// API key for the geolocation provider.
    ///
    /// Leave empty to skip provider lookups entirely; sessions are then
    /// recorded with sentinel geo fields.
    ///
    /// # Command Line
    /// Use `--geo-api-key <KEY>` to set this value from the CLI
    #[arg(long, env = "GEO_API_KEY", default_value = "")]
    pub geo_api_key: String,

    /// Username the proxy authenticates with against the sandbox sshd.
    ///
    /// # Command Line
    /// Use `--sandbox-user <NAME>` to set this value from the CLI
    #[arg(long, env = "SANDBOX_USER", default_value = "root")]
    pub sandbox_user: String,

    /// Password the proxy authenticates with against the sandbox sshd.
    ///
    /// # Command Line
    /// Use `--sandbox-password <PASSWORD>` to set this value from the CLI
    #[arg(long, env = "SANDBOX_PASSWORD", default_value = "root")]
    pub sandbox_password: String,
}

impl Config {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_parse_from_env() {
        env::set_var("BIND_ADDRESS", "127.0.0.1:2222");
        env::set_var("HOST_KEY_PATH", "/tmp/test_host_key");
        env::set_var("DATABASE_PATH", "/tmp/test.sqlite");
        env::set_var("POOL_CAPACITY", "5");
        env::set_var("KEEP_ALIVE_SECS", "60");
        env::set_var("GEO_API_KEY", "abc123");
        env::set_var("SANDBOX_USER", "ssmp");
        env::set_var("SANDBOX_PASSWORD", "hunter2");

        let config = Config::parse_from(["nectar"]);

        assert_eq!(config.bind_address, "127.0.0.1:2222");
        assert_eq!(config.host_key_path, PathBuf::from("/tmp/test_host_key"));
        assert_eq!(config.database_path, PathBuf::from("/tmp/test.sqlite"));
        assert_eq!(config.pool_capacity, 5);
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.geo_api_key, "abc123");
        assert_eq!(config.sandbox_user, "ssmp");
        assert_eq!(config.sandbox_password, "hunter2");
    }
}
