//! Logging setup
//!
//! Library code logs through the `log` facade. `init_logging` installs a
//! `tracing-subscriber` registry that also captures `log` records, so both
//! end up in the same formatted output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{Error, Result};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    pub level: String,
    /// Module-specific log levels
    pub module_levels: BTreeMap<String, String>,
    /// Include module targets in each line
    pub with_target: bool,
    pub with_thread_ids: bool,
    /// Single-line output instead of the full format
    pub compact: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = BTreeMap::new();
        module_levels.insert("bitcraps_consensus::transport".to_string(), "info".to_string());
        module_levels.insert("async_nats".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            module_levels,
            with_target: true,
            with_thread_ids: false,
            compact: true,
        }
    }
}

impl LoggingConfig {
    /// Build the filter; `RUST_LOG` replaces the configured directives when set
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", self.level, e)))?;
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level)
                .parse()
                .map_err(|e| Error::Config(format!("Invalid log directive for {}: {}", module, e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops and return `Ok`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }
    let filter = config.env_filter()?;

    let result = if config.compact {
        Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };

    // Another subscriber (e.g. a test harness) may already be installed
    if let Err(e) = result {
        log::debug!("Global subscriber already set: {}", e);
    }
    let _ = INITIALIZED.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_builds() {
        assert!(LoggingConfig::default().env_filter().is_ok());
    }

    #[test]
    fn test_invalid_module_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let mut config = LoggingConfig::default();
        config
            .module_levels
            .insert("bitcraps_consensus".to_string(), "loudest".to_string());
        assert!(matches!(config.env_filter(), Err(Error::Config(_))));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }
}
