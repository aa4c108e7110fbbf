use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DgrError, Result};

/// Role of this process within a replication group.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Role {
    /// Authoritative process; sends a snapshot every frame.
    Master,
    /// Applies the master's snapshots.
    Slave,
    /// No peers. Acts as its own master; nothing is sent or received.
    #[default]
    Standalone,
}

impl FromStr for Role {
    type Err = DgrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            "" | "none" | "standalone" => Ok(Role::Standalone),
            other => Err(DgrError::Config(format!(
                "unknown DGR mode {other:?} (expected master, slave or none)"
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Standalone => "standalone",
        })
    }
}

pub const ENV_MODE: &str = "DGR_MODE";
pub const ENV_MASTER_DEST_IP: &str = "DGR_MASTER_DEST_IP";
pub const ENV_MASTER_DEST_PORT: &str = "DGR_MASTER_DEST_PORT";
pub const ENV_SLAVE_LISTEN_PORT: &str = "DGR_SLAVE_LISTEN_PORT";
pub const ENV_SLAVE_RECV_TIMEOUT_MS: &str = "DGR_SLAVE_RECV_TIMEOUT_MS";

pub const DEFAULT_PORT: u16 = 5702;

/// Replication settings for one process.
///
/// Build in code or read from the `DGR_*` environment variables with
/// [`DgrConfig::from_env`].
#[derive(Debug, Clone)]
pub struct DgrConfig {
    pub role: Role,

    /// Master destination host. A broadcast address reaches every slave on
    /// the segment; use a relay to cross segments.
    pub dest_host: String,
    pub dest_port: u16,

    /// Port a slave listens on.
    pub listen_port: u16,

    /// How long a slave waits for the first datagram of a frame.
    ///
    /// Zero polls without blocking. Keep this well under one frame interval.
    pub recv_timeout: Duration,

    /// Master silence after which a slave logs a warning.
    pub silence_warning: Duration,
}

impl Default for DgrConfig {
    fn default() -> Self {
        Self {
            role: Role::Standalone,
            dest_host: "255.255.255.255".to_string(),
            dest_port: DEFAULT_PORT,
            listen_port: DEFAULT_PORT,
            recv_timeout: Duration::ZERO,
            silence_warning: Duration::from_secs(5),
        }
    }
}

impl DgrConfig {
    pub fn master(dest_host: impl Into<String>, dest_port: u16) -> Self {
        Self {
            role: Role::Master,
            dest_host: dest_host.into(),
            dest_port,
            ..Self::default()
        }
    }

    pub fn slave(listen_port: u16) -> Self {
        Self {
            role: Role::Slave,
            listen_port,
            ..Self::default()
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(mode) = lookup(ENV_MODE) {
            config.role = mode.parse()?;
        }
        if let Some(host) = lookup(ENV_MASTER_DEST_IP) {
            let host = host.trim();
            if host.is_empty() {
                return Err(DgrError::Config(format!("{ENV_MASTER_DEST_IP} is empty")));
            }
            config.dest_host = host.to_string();
        }
        if let Some(port) = lookup(ENV_MASTER_DEST_PORT) {
            config.dest_port = parse_port(ENV_MASTER_DEST_PORT, &port)?;
        }
        if let Some(port) = lookup(ENV_SLAVE_LISTEN_PORT) {
            config.listen_port = parse_port(ENV_SLAVE_LISTEN_PORT, &port)?;
        }
        if let Some(ms) = lookup(ENV_SLAVE_RECV_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                DgrError::Config(format!(
                    "{ENV_SLAVE_RECV_TIMEOUT_MS} must be milliseconds, got {ms:?}"
                ))
            })?;
            config.recv_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(DgrError::Config(format!(
            "{key} must be a port in 1..=65535, got {value:?}"
        ))),
        Ok(port) => Ok(port),
    }
}
