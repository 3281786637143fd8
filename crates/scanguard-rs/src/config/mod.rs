use std::{env, fs, time::Duration};

use anyhow::{bail, Context};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{
    executor::ExecLimits,
    lifecycle::RetryPolicy,
    security::{TargetPolicy, MAX_IPV4_HOSTS, MAX_IPV6_HOSTS},
};

/// Ten years.
pub const MAX_RETRY_AGE_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub tool_path: String,
    pub hard_timeout_secs: u64,
    pub soft_timeout_secs: Option<u64>,
    pub kill_grace_secs: u64,
    pub max_concurrent_scans: usize,
    pub queue_capacity: usize,
    pub scope_allowlist: Vec<String>,
    pub max_ipv4_hosts: u64,
    pub max_ipv6_hosts: u64,
    pub retry_max_age_hours: i64,
    pub retry_max_attempts: u32,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANGUARD_CONFIG").unwrap_or_else(|_| "scanguard.json".to_string());
        let raw = fs::read_to_string(&path).ok();
        Self::from_parts(raw.as_deref(), |key| env::var(key).ok())
            .with_context(|| format!("invalid configuration (file {path})"))
    }

    /// File contents (if any) first, then `SG_*` overrides from `env`.
    pub fn from_parts(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg: AppConfig = match file {
            Some(raw) => serde_json::from_str(raw).context("failed to parse config file")?,
            None => Self::default(),
        };

        if let Some(v) = env("SG_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Some(v) = env("SG_TOOL_PATH") {
            cfg.tool_path = v;
        }
        if let Some(v) = env("SG_HARD_TIMEOUT_SECS") {
            cfg.hard_timeout_secs = v.trim().parse().context("SG_HARD_TIMEOUT_SECS")?;
        }
        if let Some(v) = env("SG_SOFT_TIMEOUT_SECS") {
            let v = v.trim();
            cfg.soft_timeout_secs = if v.is_empty() {
                None
            } else {
                Some(v.parse().context("SG_SOFT_TIMEOUT_SECS")?)
            };
        }
        if let Some(v) = env("SG_MAX_CONCURRENT_SCANS") {
            cfg.max_concurrent_scans = v.trim().parse().context("SG_MAX_CONCURRENT_SCANS")?;
        }
        if let Some(v) = env("SG_SCOPE_ALLOWLIST") {
            cfg.scope_allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env("SG_LOG_FORMAT") {
            cfg.log_format = match v.trim() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => bail!("SG_LOG_FORMAT must be json or text, got `{other}`"),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hard_timeout_secs == 0 {
            bail!("hard_timeout_secs must be positive");
        }
        if let Some(soft) = self.soft_timeout_secs {
            if soft >= self.hard_timeout_secs {
                bail!(
                    "soft_timeout_secs ({soft}) must be below hard_timeout_secs ({})",
                    self.hard_timeout_secs
                );
            }
        }
        if self.max_concurrent_scans == 0 {
            bail!("max_concurrent_scans must be positive");
        }
        if !(0..=MAX_RETRY_AGE_HOURS).contains(&self.retry_max_age_hours) {
            bail!(
                "retry_max_age_hours must be between 0 and {MAX_RETRY_AGE_HOURS}, got {}",
                self.retry_max_age_hours
            );
        }
        self.allowlist()?;
        Ok(())
    }

    fn allowlist(&self) -> anyhow::Result<Vec<IpNet>> {
        self.scope_allowlist
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<std::net::IpAddr>().map(IpNet::from))
                    .with_context(|| format!("invalid scope_allowlist entry `{entry}`"))
            })
            .collect()
    }

    pub fn target_policy(&self) -> anyhow::Result<TargetPolicy> {
        Ok(TargetPolicy {
            max_ipv4_hosts: u128::from(self.max_ipv4_hosts),
            max_ipv6_hosts: u128::from(self.max_ipv6_hosts),
            scope_allowlist: self.allowlist()?,
        })
    }

    pub fn exec_limits(&self) -> ExecLimits {
        ExecLimits {
            hard_timeout: Duration::from_secs(self.hard_timeout_secs),
            soft_timeout: self.soft_timeout_secs.map(Duration::from_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_age: chrono::Duration::hours(self.retry_max_age_hours.clamp(0, MAX_RETRY_AGE_HOURS)),
            max_attempts: self.retry_max_attempts,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://scanguard.db".to_string(),
            tool_path: "/usr/bin/nmap".to_string(),
            hard_timeout_secs: 300,
            soft_timeout_secs: Some(240),
            kill_grace_secs: 5,
            max_concurrent_scans: 10,
            queue_capacity: 128,
            scope_allowlist: vec![],
            max_ipv4_hosts: MAX_IPV4_HOSTS as u64,
            max_ipv6_hosts: MAX_IPV6_HOSTS as u64,
            retry_max_age_hours: 24,
            retry_max_attempts: 3,
            log_format: LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let cfg = AppConfig::from_parts(None, env_of(&[])).unwrap();
        assert_eq!(cfg.tool_path, "/usr/bin/nmap");
        assert_eq!(cfg.exec_limits().hard_timeout, Duration::from_secs(300));
        assert_eq!(cfg.exec_limits().soft_timeout, Some(Duration::from_secs(240)));
        assert_eq!(cfg.max_concurrent_scans, 10);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.target_policy().unwrap().scope_allowlist.is_empty());
    }

    #[test]
    fn env_overrides_file() {
        let file = r#"{"tool_path": "/opt/nmap/bin/nmap", "hard_timeout_secs": 120, "soft_timeout_secs": 90}"#;
        let cfg = AppConfig::from_parts(
            Some(file),
            env_of(&[
                ("SG_HARD_TIMEOUT_SECS", "60"),
                ("SG_SOFT_TIMEOUT_SECS", ""),
                ("SG_SCOPE_ALLOWLIST", "192.168.0.0/16, 10.1.1.1"),
                ("SG_LOG_FORMAT", "text"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.tool_path, "/opt/nmap/bin/nmap");
        assert_eq!(cfg.hard_timeout_secs, 60);
        assert_eq!(cfg.soft_timeout_secs, None);
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.target_policy().unwrap().scope_allowlist.len(), 2);
        // untouched fields keep their defaults
        assert_eq!(cfg.queue_capacity, 128);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        for (key, value) in [
            ("SG_HARD_TIMEOUT_SECS", "0"),
            ("SG_HARD_TIMEOUT_SECS", "soon"),
            ("SG_SOFT_TIMEOUT_SECS", "300"),
            ("SG_MAX_CONCURRENT_SCANS", "0"),
            ("SG_SCOPE_ALLOWLIST", "corp.example.com"),
            ("SG_LOG_FORMAT", "xml"),
        ] {
            assert!(
                AppConfig::from_parts(None, env_of(&[(key, value)])).is_err(),
                "{key}={value}"
            );
        }
        assert!(AppConfig::from_parts(Some("{not json"), env_of(&[])).is_err());
    }

    #[test]
    fn retry_age_is_bounded() {
        for hours in ["-1", "9223372036854775807", "87601"] {
            let file = format!(r#"{{"retry_max_age_hours": {hours}}}"#);
            assert!(AppConfig::from_parts(Some(&file), env_of(&[])).is_err(), "{hours}");
        }
        let cfg = AppConfig::from_parts(Some(r#"{"retry_max_age_hours": 87600}"#), env_of(&[])).unwrap();
        assert_eq!(cfg.retry_policy().max_age, chrono::Duration::days(3650));

        let mut unchecked = AppConfig::default();
        unchecked.retry_max_age_hours = i64::MAX;
        assert_eq!(unchecked.retry_policy().max_age, chrono::Duration::hours(MAX_RETRY_AGE_HOURS));
    }
}
