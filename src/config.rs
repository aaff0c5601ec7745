//! Simulation configuration loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::simulation::error::TopologyError;
use crate::simulation::message;
use crate::simulation::pacing::{MAX_SPEED_PERCENT, MIN_SPEED_PERCENT};
use crate::simulation::resolver::{LinkResolver, ObstacleAwareResolver, RangeResolver, RangeRule, ToroidalResolver};

/// Which built-in link resolver the topology starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverKind {
    /// Euclidean distance against the communication ranges.
    #[default]
    Range,
    /// Wrap-around world of `world-width x world-height`.
    Toroidal,
    /// Range rule plus line-of-sight through the obstacle set.
    ObstacleAware,
}

/// Global simulation parameters. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulationConfig {
    pub world_width: f64,
    pub world_height: f64,
    /// Communication range given to new nodes.
    pub communication_range: f64,
    /// Sensing range given to new nodes (0 disables sensing).
    pub sensing_range: f64,
    pub resolver: ResolverKind,
    pub range_rule: RangeRule,
    /// Ticks between a send and the earliest delivery (at least 1).
    pub message_delay: u64,
    /// Wall-clock length of one tick at 100% speed.
    pub tick_period_ms: u64,
    pub speed_percent: u32,
    /// Fixed seed for reproducible runs; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            world_width: 800.0,
            world_height: 600.0,
            communication_range: 100.0,
            sensing_range: 0.0,
            resolver: ResolverKind::Range,
            range_rule: RangeRule::Symmetric,
            message_delay: 1,
            tick_period_ms: 10,
            speed_percent: 100,
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Returns
    /// * `Ok(SimulationConfig)` if the file was read, parsed and validated
    /// * `Err(String)` with a descriptive error message otherwise
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// Derive the config path from a scene file path.
    ///
    /// Replaces the scene filename with "config.toml" in the same directory.
    pub fn config_path_from_scene(scene_path: &str) -> PathBuf {
        let scene = Path::new(scene_path);
        scene.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        let non_negative = |value: f64| value.is_finite() && value >= 0.0;

        if !positive(self.world_width) || !positive(self.world_height) {
            return Err(invalid(format!(
                "world size must be positive and finite, got {} x {}",
                self.world_width, self.world_height
            )));
        }
        if !non_negative(self.communication_range) {
            return Err(invalid(format!("communication-range must be >= 0, got {}", self.communication_range)));
        }
        if !non_negative(self.sensing_range) {
            return Err(invalid(format!("sensing-range must be >= 0, got {}", self.sensing_range)));
        }
        message::validate_delay(self.message_delay)?;
        if self.tick_period_ms == 0 {
            return Err(invalid("tick-period-ms must be positive".to_string()));
        }
        if !(MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT).contains(&self.speed_percent) {
            return Err(invalid(format!(
                "speed-percent must be within {}..={}, got {}",
                MIN_SPEED_PERCENT, MAX_SPEED_PERCENT, self.speed_percent
            )));
        }
        Ok(())
    }

    pub fn build_resolver(&self) -> Result<Arc<dyn LinkResolver>, TopologyError> {
        let resolver: Arc<dyn LinkResolver> = match self.resolver {
            ResolverKind::Range => Arc::new(RangeResolver::new(self.range_rule)),
            ResolverKind::Toroidal => Arc::new(ToroidalResolver::with_rule(self.world_width, self.world_height, self.range_rule)?),
            ResolverKind::ObstacleAware => Arc::new(ObstacleAwareResolver::new(Arc::new(RangeResolver::new(self.range_rule)))),
        };
        Ok(resolver)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

fn invalid(message: String) -> TopologyError {
    TopologyError::InvalidConfiguration(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = SimulationConfig::parse("").unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.tick_period(), Duration::from_millis(10));
    }

    #[test]
    fn kebab_case_keys_are_read() {
        let config = SimulationConfig::parse(
            r#"
            world-width = 100.0
            world-height = 50.0
            resolver = "toroidal"
            range-rule = "asymmetric"
            message-delay = 3
            seed = 42
            "#,
        )
        .unwrap();
        assert_eq!(config.resolver, ResolverKind::Toroidal);
        assert_eq!(config.range_rule, RangeRule::Asymmetric);
        assert_eq!(config.message_delay, 3);
        assert_eq!(config.seed, Some(42));

        let resolver = config.build_resolver().unwrap();
        assert!(!resolver.is_symmetric());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SimulationConfig::parse("message-delay = 0").is_err());
        assert!(SimulationConfig::parse("message-delay = 9223372036854775807").is_err());
        assert!(SimulationConfig::parse("speed-percent = 5000").is_err());
        assert!(SimulationConfig::parse("world-width = -1.0").is_err());
        assert!(SimulationConfig::parse("resolver = \"teleport\"").is_err());
    }

    #[test]
    fn config_path_sits_next_to_the_scene() {
        let path = SimulationConfig::config_path_from_scene("scenes/grid.json");
        assert_eq!(path, Path::new("scenes").join("config.toml"));
    }
}
