//! Configuration management for the risk guard.
//!
//! Loaded once at startup and immutable afterwards. Sources, lowest priority
//! first: built-in defaults, an optional config file, `GUARD__*` environment
//! variables (a `.env` file is honoured).

use guard_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::alert_dedup::DedupConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::exit_controller::ExitConfig;
use crate::sizing::SizingConfig;

/// Environment prefix, e.g. `GUARD__DEDUP__WINDOW_MINUTES=15`.
pub const ENV_PREFIX: &str = "GUARD";

/// Complete guard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub exit: ExitConfig,
    pub sizing: SizingConfig,
    pub dedup: DedupConfig,
}

impl GuardConfig {
    /// Load configuration from an optional file plus environment overrides,
    /// then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("circuit_breaker.veto_phrases")
                .try_parsing(true),
        );

        let loaded: GuardConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;

        info!(
            source = %path.map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".to_string()),
            veto_phrases = loaded.circuit_breaker.veto_phrases.len(),
            lock_hours = loaded.circuit_breaker.lock_duration_hours,
            dedup_window_minutes = loaded.dedup.window_minutes,
            dedup_capacity = loaded.dedup.capacity,
            "Loaded guard configuration"
        );
        Ok(loaded)
    }

    /// Parse a TOML document (no environment overrides). Mostly for tests and tooling.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let loaded: GuardConfig = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check every section; fails on the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate()?;
        self.exit.validate()?;
        self.sizing.validate()?;
        self.dedup.validate()?;
        Ok(())
    }

    /// Serialize as pretty JSON for operator display.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }
}
