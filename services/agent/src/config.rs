use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// What to do with state left on disk by a previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Rejoin executors that survived the restart.
    Reconnect,
    /// Shut every recovered executor down, then exit.
    Cleanup,
}

impl std::str::FromStr for RecoveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reconnect" => Ok(Self::Reconnect),
            "cleanup" => Ok(Self::Cleanup),
            other => bail!("unknown recovery mode '{other}', expected 'reconnect' or 'cleanup'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub recover: RecoveryMode,
    /// Strict recovery: refuse to start on unreadable checkpoint state.
    pub safe: bool,
    /// Whether this agent checkpoints at all.
    pub checkpoint: bool,
    pub work_dir: PathBuf,
    /// Advertised resources, `name:value;...`; unset names are auto-detected.
    pub resources: Option<String>,
    pub attributes: Option<String>,
    pub disk_watch_interval: Duration,
    pub gc_delay: Duration,
    pub executor_registration_timeout: Duration,
    pub executor_shutdown_grace_period: Duration,
    pub executor_reregister_timeout: Duration,
    pub resource_monitoring_interval: Duration,
    /// Directory holding the bundled task runner for command-only tasks.
    pub launcher_dir: PathBuf,
    pub registration_backoff: Duration,
    pub update_retry_interval: Duration,
    pub http_listen_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let recover = std::env::var("SKIFF_RECOVER")
            .unwrap_or_else(|_| "reconnect".to_string())
            .parse()?;

        let safe = env_bool("SKIFF_SAFE", true)?;
        let checkpoint = env_bool("SKIFF_CHECKPOINT", false)?;

        let work_dir =
            PathBuf::from(std::env::var("SKIFF_WORK_DIR").unwrap_or_else(|_| "/var/lib/skiff".to_string()));

        let resources = std::env::var("SKIFF_RESOURCES").ok();
        let attributes = std::env::var("SKIFF_ATTRIBUTES").ok();

        let disk_watch_interval = env_duration("SKIFF_DISK_WATCH_INTERVAL", "1m")?;
        let gc_delay = env_duration("SKIFF_GC_DELAY", "7d")?;
        let executor_registration_timeout = env_duration("SKIFF_EXECUTOR_REGISTRATION_TIMEOUT", "1m")?;
        let executor_shutdown_grace_period =
            env_duration("SKIFF_EXECUTOR_SHUTDOWN_GRACE_PERIOD", "5s")?;
        let executor_reregister_timeout = env_duration("SKIFF_EXECUTOR_REREGISTER_TIMEOUT", "2m")?;
        let resource_monitoring_interval = env_duration("SKIFF_RESOURCE_MONITORING_INTERVAL", "1s")?;

        let launcher_dir = PathBuf::from(
            std::env::var("SKIFF_LAUNCHER_DIR").unwrap_or_else(|_| "/usr/libexec/skiff".to_string()),
        );

        let http_listen_addr = std::env::var("SKIFF_HTTP_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5051".to_string())
            .parse()
            .context("invalid SKIFF_HTTP_LISTEN_ADDR")?;

        Ok(Self {
            recover,
            safe,
            checkpoint,
            work_dir,
            resources,
            attributes,
            disk_watch_interval,
            gc_delay,
            executor_registration_timeout,
            executor_shutdown_grace_period,
            executor_reregister_timeout,
            resource_monitoring_interval,
            launcher_dir,
            registration_backoff: Duration::from_secs(1),
            update_retry_interval: Duration::from_secs(10),
            http_listen_addr,
        })
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => bail!("invalid boolean for {name}: '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

fn env_duration(name: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    parse_duration(&raw).with_context(|| format!("invalid duration for {name}: '{raw}'"))
}

/// Parses `90`, `90s`, `5m`, `2h`, `14d` style durations (seconds if bare).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let (value, unit) = match s.find(|c: char| !(c.is_ascii_digit() || c == '.')) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };

    let value: f64 = value.parse().context("duration value is not a number")?;
    let secs = match unit {
        "s" | "secs" => value,
        "m" | "mins" => value * 60.0,
        "h" | "hrs" => value * 3600.0,
        "d" | "days" => value * 86400.0,
        "w" | "weeks" => value * 7.0 * 86400.0,
        other => bail!("unknown duration unit '{other}'"),
    };

    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("14d").unwrap(), Duration::from_secs(14 * 86400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_parse_duration_fractional() {
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5parsecs").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_recovery_mode_parse() {
        assert_eq!(
            "reconnect".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::Reconnect
        );
        assert_eq!(
            "cleanup".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::Cleanup
        );
        assert!("restore".parse::<RecoveryMode>().is_err());
    }
}
