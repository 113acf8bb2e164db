//! Environment-driven daemon configuration.
//!
//! Every knob has a default and absence is never an error; an invalid
//! value logs a warning and falls back to the default, so a bad
//! deployment environment degrades instead of refusing to boot.
//! Durations are given in milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::monitor::{MonitorSettings, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_MEMORY_THRESHOLD_BYTES};
use crate::recovery::{
    RecoverySettings, DEFAULT_RECOVERY_DELAY, DEFAULT_RECOVERY_PAUSE, DEFAULT_RESTART_COMMAND,
    DEFAULT_RESTART_DELAY,
};
use crate::session::SessionSettings;

/// Default grace window for shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Default log directory, relative to the working directory.
pub const DEFAULT_LOG_DIRECTORY: &str = "./logs";

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub memory_threshold_bytes: u64,
    pub health_check_interval: Duration,
    pub shutdown_grace: Duration,
    pub restart_delay: Duration,
    pub max_workers: usize,
    pub log_directory: PathBuf,
    pub production: bool,
    pub reconnect_delay: Duration,
    pub reconnect_ceiling: u32,
    pub recovery_delay: Duration,
    pub recovery_pause: Duration,
    pub restart_command: String,
    pub tenants_file: Option<PathBuf>,
    pub spool_directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            restart_delay: DEFAULT_RESTART_DELAY,
            max_workers: usize::MAX,
            log_directory: PathBuf::from(DEFAULT_LOG_DIRECTORY),
            production: false,
            reconnect_delay: SessionSettings::default().reconnect_delay,
            reconnect_ceiling: SessionSettings::default().retry_ceiling,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            recovery_pause: DEFAULT_RECOVERY_PAUSE,
            restart_command: DEFAULT_RESTART_COMMAND.to_string(),
            tenants_file: None,
            spool_directory: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary lookup (tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            memory_threshold_bytes: parse_number(
                &lookup,
                "MAX_MEMORY_THRESHOLD",
                defaults.memory_threshold_bytes,
            ),
            health_check_interval: parse_millis(
                &lookup,
                "HEALTH_CHECK_INTERVAL",
                defaults.health_check_interval,
            ),
            shutdown_grace: parse_millis(&lookup, "SHUTDOWN_TIMEOUT", defaults.shutdown_grace),
            restart_delay: parse_millis(&lookup, "RESTART_DELAY", defaults.restart_delay),
            max_workers: parse_number(&lookup, "MAX_WORKERS", defaults.max_workers),
            log_directory: lookup("LOG_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_directory),
            production: lookup("RELAY_ENV").as_deref() == Some("production"),
            reconnect_delay: parse_millis(&lookup, "RECONNECT_DELAY", defaults.reconnect_delay),
            reconnect_ceiling: parse_number(
                &lookup,
                "RECONNECT_CEILING",
                defaults.reconnect_ceiling,
            ),
            recovery_delay: parse_millis(&lookup, "RECOVERY_DELAY", defaults.recovery_delay),
            recovery_pause: parse_millis(&lookup, "RECOVERY_PAUSE", defaults.recovery_pause),
            restart_command: lookup("RESTART_COMMAND").unwrap_or(defaults.restart_command),
            tenants_file: lookup("TENANTS_FILE").map(PathBuf::from),
            spool_directory: lookup("OUTBOUND_SPOOL").map(PathBuf::from),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            reconnect_delay: self.reconnect_delay,
            retry_ceiling: self.reconnect_ceiling,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            memory_threshold_bytes: self.memory_threshold_bytes,
            check_interval: self.health_check_interval,
        }
    }

    pub fn recovery_settings(&self) -> RecoverySettings {
        RecoverySettings {
            restart_delay: self.restart_delay,
            recovery_delay: self.recovery_delay,
            recovery_pause: self.recovery_pause,
        }
    }
}

fn parse_number<T>(lookup: impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

fn parse_millis(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Duration {
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => {
            warn!(var = name, value = %raw, "Invalid duration, using default");
            default
        }
    }
}
