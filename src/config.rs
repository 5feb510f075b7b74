//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - weft.toml (default configuration)
//! - weft.local.toml (git-ignored local overrides)
//! - Environment variables (WEFT_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # weft.toml
//! [optimization]
//! constant_folding = true
//! qualifier_simplification = true
//!
//! [scheduler]
//! max_content_cycles = 100
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! WEFT_OPTIMIZATION__CONSTANT_FOLDING=false
//! WEFT_SCHEDULER__MAX_CONTENT_CYCLES=50
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Compiler optimization toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Evaluate builtins with constant arguments at compile time
    #[serde(default = "default_true")]
    pub constant_folding: bool,

    /// Drop variant alternatives impossible under the qualifier context
    #[serde(default = "default_true")]
    pub qualifier_simplification: bool,

    /// Rewrite area queries to boolean gates / child-area chains
    #[serde(default = "default_true")]
    pub area_query_rewrites: bool,

    /// Cap on compiler rewrite passes per node
    #[serde(default = "default_fixpoint_iterations")]
    pub max_fixpoint_iterations: usize,
}

/// Scheduler guards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Content/write ping-pong count that trips the possible-loop block
    #[serde(default = "default_max_content_cycles")]
    pub max_content_cycles: u32,

    /// Export re-entries per stub cycle before compilation aborts
    #[serde(default = "default_max_export_reentry")]
    pub max_export_reentry: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "weft=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted events
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_fixpoint_iterations() -> usize {
    10
}

fn default_max_content_cycles() -> u32 {
    100
}

fn default_max_export_reentry() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        OptimizationConfig {
            constant_folding: true,
            qualifier_simplification: true,
            area_query_rewrites: true,
            max_fixpoint_iterations: default_fixpoint_iterations(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_content_cycles: default_max_content_cycles(),
            max_export_reentry: default_max_export_reentry(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration: defaults <- weft.toml <- weft.local.toml <- env.
    pub fn load() -> Result<Config, figment::Error> {
        Self::figment().extract()
    }

    /// Load from an explicit file path (plus env overrides); used by tests.
    pub fn load_from(path: &std::path::Path) -> Result<Config, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("WEFT_").split("__"))
            .extract()
    }

    fn figment() -> Figment {
        Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file("weft.toml"))
            .merge(Toml::file("weft.local.toml"))
            .merge(Env::prefixed("WEFT_").split("__"))
    }
}

/// Initialize the tracing subscriber from the logging section. Safe to call
/// more than once; later calls are ignored.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A subscriber may already be installed (tests, embedding application).
    drop(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sound() {
        let config = Config::default();
        assert!(config.optimization.constant_folding);
        assert!(config.optimization.qualifier_simplification);
        assert_eq!(config.scheduler.max_content_cycles, 100);
        assert_eq!(config.scheduler.max_export_reentry, 10);
        assert_eq!(config.logging.level, "info");
    }
}
