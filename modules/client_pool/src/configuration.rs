//! Pool configuration, parsed from a `config::Config` section.

use anyhow::{bail, Result};
use config::Config;

use argus_common::ClientKind;

const DEFAULT_FOLLOW_DISTANCE: u64 = 64;
const DEFAULT_FORK_DISTANCE: u64 = 2;

/// Scheduling strategy for `get_ready_endpoint`. Only round robin is
/// defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    RoundRobin,
}

/// One endpoint entry of a pool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub kind: ClientKind,

    /// Optional value for an Authorization header the transport should send
    #[serde(default)]
    pub auth_header: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool label used in logs ("consensus", "execution")
    pub name: String,

    /// Minimum slot span retained below the highest seen slot
    pub follow_distance: u64,

    /// Maximum ancestry distance from a fork's head a ready client may lag
    pub fork_distance: u64,

    pub scheduler: SchedulerMode,

    pub endpoints: Vec<EndpointConfig>,
}

impl PoolConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let name = config.get_string("name").unwrap_or("default".to_string());
        let follow_distance =
            config.get_int("follow-distance").unwrap_or(DEFAULT_FOLLOW_DISTANCE as i64);
        if follow_distance < 0 {
            bail!("follow-distance must not be negative");
        }
        let fork_distance = config.get_int("fork-distance").unwrap_or(DEFAULT_FORK_DISTANCE as i64);
        if fork_distance < 0 {
            bail!("fork-distance must not be negative");
        }
        let scheduler = match config.get_string("scheduler").as_deref() {
            Ok("round-robin") | Err(_) => SchedulerMode::RoundRobin,
            Ok(other) => bail!("unknown scheduler mode '{other}'"),
        };
        let endpoints: Vec<EndpointConfig> = config.get("endpoints").unwrap_or_default();
        Ok(Self {
            name,
            follow_distance: follow_distance as u64,
            fork_distance: fork_distance as u64,
            scheduler,
            endpoints,
        })
    }

    /// Config with defaults and no endpoints, for programmatic setup.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            follow_distance: DEFAULT_FOLLOW_DISTANCE,
            fork_distance: DEFAULT_FORK_DISTANCE,
            scheduler: SchedulerMode::RoundRobin,
            endpoints: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn load(toml: &str) -> Result<PoolConfig> {
        let config =
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)).build()?;
        PoolConfig::try_load(&config)
    }

    #[test]
    fn defaults_apply() {
        let cfg = load("name = \"consensus\"").unwrap();
        assert_eq!(cfg.follow_distance, DEFAULT_FOLLOW_DISTANCE);
        assert_eq!(cfg.fork_distance, DEFAULT_FORK_DISTANCE);
        assert_eq!(cfg.scheduler, SchedulerMode::RoundRobin);
        assert!(cfg.endpoints.is_empty());
    }

    #[test]
    fn parses_endpoints() {
        let cfg = load(
            r#"
            name = "execution"
            follow-distance = 32
            fork-distance = 4

            [[endpoints]]
            name = "node-1"
            url = "http://10.0.0.1:8545"
            kind = "geth"

            [[endpoints]]
            name = "node-2"
            url = "http://10.0.0.2:8545"
            kind = "reth"
            auth_header = "Bearer abc"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.follow_distance, 32);
        assert_eq!(cfg.fork_distance, 4);
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoints[0].kind.as_str(), "geth");
        assert_eq!(cfg.endpoints[1].auth_header.as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn rejects_unknown_scheduler() {
        assert!(load("scheduler = \"random\"").is_err());
    }
}
