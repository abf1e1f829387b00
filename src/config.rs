use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::behavior::FeedbackDenominator;
use crate::error::{EvolutionError, Result};
use crate::firewall::FirewallConfig;

/// Evolution core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root data directory; evolution state lives in `<data_dir>/evolution`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Propagate strategy write failures instead of only recording them
    #[serde(default)]
    pub strict_persistence: bool,

    #[serde(default)]
    pub mutation: MutationConfig,

    #[serde(default)]
    pub behavior: BehaviorConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_behavior_rate")]
    pub behavior_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_feedback_capacity")]
    pub feedback_capacity: usize,
    #[serde(default)]
    pub denominator: FeedbackDenominator,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_ema_alpha() -> f64 {
    crate::fitness::DEFAULT_EMA_ALPHA
}

fn default_behavior_rate() -> f64 {
    0.1
}

fn default_feedback_capacity() -> usize {
    100
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            ema_alpha: default_ema_alpha(),
            behavior_rate: default_behavior_rate(),
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            feedback_capacity: default_feedback_capacity(),
            denominator: FeedbackDenominator::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            strict_persistence: false,
            mutation: MutationConfig::default(),
            behavior: BehaviorConfig::default(),
            firewall: FirewallConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EvolutionError::Persistence {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(data_dir = %config.data_dir.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EvolutionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding strategy, genome and snapshot files
    pub fn evolution_dir(&self) -> PathBuf {
        self.data_dir.join("evolution")
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.mutation.ema_alpha > 0.0 && self.mutation.ema_alpha <= 1.0) {
            return Err(EvolutionError::Config(format!(
                "mutation.ema_alpha must be in (0, 1], got {}",
                self.mutation.ema_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation.behavior_rate) {
            return Err(EvolutionError::Config(format!(
                "mutation.behavior_rate must be in [0, 1], got {}",
                self.mutation.behavior_rate
            )));
        }
        if self.behavior.feedback_capacity == 0 {
            return Err(EvolutionError::Config(
                "behavior.feedback_capacity must be at least 1".to_string(),
            ));
        }
        if self.firewall.max_snapshots == 0 {
            return Err(EvolutionError::Config(
                "firewall.max_snapshots must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.firewall.fitness_drop_threshold) {
            return Err(EvolutionError::Config(format!(
                "firewall.fitness_drop_threshold must be in [0, 1], got {}",
                self.firewall.fitness_drop_threshold
            )));
        }
        Ok(())
    }
}
