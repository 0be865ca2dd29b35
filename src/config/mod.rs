//! Configuration management for a consensus node
//!
//! One TOML file with a section per component. Missing sections and fields
//! fall back to defaults, `BITCRAPS_*` environment variables override the
//! file, and `validate` rejects combinations the engine cannot run with.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::protocol::consensus::{ConsensusConfig, DisputeConfig, RandomnessConfig};
use crate::protocol::network_consensus_bridge::NetworkConsensusBridgeConfig;
use crate::transport::{TransportConfig, TransportKind};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub consensus: ConsensusConfig,
    pub bridge: NetworkConsensusBridgeConfig,
    pub randomness: RandomnessConfig,
    pub dispute: DisputeConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load a file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.override_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Override configuration with environment variables
    pub fn override_from_env(&mut self) -> Result<()> {
        self.override_from(|key| env::var(key).ok())
    }

    fn override_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        // Logging overrides
        if let Some(val) = lookup("BITCRAPS_LOG_LEVEL") {
            self.logging.level = val;
        }

        // Transport overrides
        if let Some(val) = lookup("BITCRAPS_TRANSPORT") {
            self.transport.kind = match val.to_lowercase().as_str() {
                "in-memory" | "memory" => TransportKind::InMemory,
                "nats" => TransportKind::Nats,
                other => return Err(Error::Config(format!("Unknown transport '{}'", other))),
            };
        }
        if let Some(val) = lookup("BITCRAPS_NATS_URL") {
            self.transport.nats_url = val;
        }

        // Consensus overrides
        if let Some(val) = lookup("BITCRAPS_CONSENSUS_TIMEOUT") {
            let timeout = parse_duration("BITCRAPS_CONSENSUS_TIMEOUT", &val)?;
            self.bridge.consensus_timeout = timeout;
            self.consensus.proposal_timeout = timeout;
        }
        if let Some(val) = lookup("BITCRAPS_STATE_SYNC_INTERVAL") {
            self.bridge.state_sync_interval = parse_duration("BITCRAPS_STATE_SYNC_INTERVAL", &val)?;
        }
        if let Some(val) = lookup("BITCRAPS_MAX_PENDING_OPERATIONS") {
            self.bridge.max_pending_operations = val
                .parse()
                .map_err(|_| Error::Config("Invalid max pending operations".to_string()))?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Consensus validation
        if self.consensus.min_bet == 0 {
            return Err(Error::Config("Min bet must be > 0".to_string()));
        }
        if self.consensus.min_bet > self.consensus.max_bet {
            return Err(Error::Config("Min bet cannot exceed max bet".to_string()));
        }
        if self.consensus.max_bet > self.consensus.initial_balance.max(self.consensus.treasury_balance) {
            log::warn!("Max bet {} exceeds every starting balance", self.consensus.max_bet);
        }
        if self.consensus.max_pending_proposals == 0 {
            return Err(Error::Config("Max pending proposals must be > 0".to_string()));
        }
        if self.consensus.vote_skew_percent > 100 || self.consensus.low_participation_percent > 100 {
            return Err(Error::Config("Byzantine detector percentages must be <= 100".to_string()));
        }
        if self.consensus.state_history == 0 {
            return Err(Error::Config("State history must keep at least one state".to_string()));
        }

        // Bridge validation
        for (name, interval) in [
            ("state sync interval", self.bridge.state_sync_interval),
            ("cleanup interval", self.bridge.cleanup_interval),
            ("deadline check interval", self.bridge.deadline_check_interval),
            ("consensus timeout", self.bridge.consensus_timeout),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("Bridge {} must be > 0", name)));
            }
        }
        if self.bridge.max_pending_operations == 0 {
            return Err(Error::Config("Max pending operations must be > 0".to_string()));
        }
        if self.bridge.dedup_cache_size == 0 {
            return Err(Error::Config("Dedup cache size must be > 0".to_string()));
        }

        // Randomness and dispute validation
        if self.randomness.commit_timeout.is_zero() || self.randomness.reveal_timeout.is_zero() {
            return Err(Error::Config("Commit and reveal timeouts must be > 0".to_string()));
        }
        if self.dispute.resolution_timeout.is_zero() {
            return Err(Error::Config("Dispute resolution timeout must be > 0".to_string()));
        }

        // Transport validation
        if self.transport.channel_capacity == 0 {
            return Err(Error::Config("Transport channel capacity must be > 0".to_string()));
        }
        if self.transport.kind == TransportKind::Nats && self.transport.nats_url.is_empty() {
            return Err(Error::Config("NATS transport needs a server URL".to_string()));
        }

        self.logging.env_filter()?;
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents).map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("Invalid duration in {}: {}", key, e)))
}
