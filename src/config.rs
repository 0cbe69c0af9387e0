//! Planner configuration loaded from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::motion::axis::{Axis, AxisArray};
use crate::motion::kinematics::KinematicsType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub axes: AxesConfig,
    #[serde(default)]
    pub leveling: Option<LevelingConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PlannerConfig {
    /// Ring capacity; one slot always stays free.
    #[serde(default = "default_block_buffer_size")]
    pub block_buffer_size: usize,
    #[serde(default = "default_min_steps_per_segment")]
    pub min_steps_per_segment: u32,
    /// Floor for initial and final step rates (steps/s).
    #[serde(default = "default_minimal_step_rate")]
    pub minimal_step_rate: u32,
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    #[serde(default = "default_retract_acceleration")]
    pub retract_acceleration: f64,
    #[serde(default = "default_travel_acceleration")]
    pub travel_acceleration: f64,
    #[serde(default)]
    pub min_feedrate: f64,
    #[serde(default)]
    pub min_travel_feedrate: f64,
    #[serde(default = "default_min_segment_time_us")]
    pub min_segment_time_us: u64,
    #[serde(default = "default_true")]
    pub slowdown: bool,
    #[serde(default)]
    pub kinematics: KinematicsType,
    #[serde(default = "default_fan_count")]
    pub fan_count: usize,
    #[serde(default = "default_tool_count")]
    pub tool_count: u8,
    /// Longest extrusion (mm) accepted in a single move.
    #[serde(default)]
    pub max_extrude_length: Option<f64>,
    /// Actuators powered down whenever no queued block moves them.
    #[serde(default)]
    pub disable_inactive: Vec<Axis>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            block_buffer_size: default_block_buffer_size(),
            min_steps_per_segment: default_min_steps_per_segment(),
            minimal_step_rate: default_minimal_step_rate(),
            acceleration: default_acceleration(),
            retract_acceleration: default_retract_acceleration(),
            travel_acceleration: default_travel_acceleration(),
            min_feedrate: 0.0,
            min_travel_feedrate: 0.0,
            min_segment_time_us: default_min_segment_time_us(),
            slowdown: true,
            kinematics: KinematicsType::default(),
            fan_count: default_fan_count(),
            tool_count: default_tool_count(),
            max_extrude_length: None,
            disable_inactive: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AxisConfig {
    pub steps_per_mm: f64,
    /// mm/s
    pub max_feedrate: f64,
    /// mm/s²
    pub max_acceleration: f64,
    /// Largest instantaneous speed change, mm/s.
    pub max_jerk: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AxesConfig {
    #[serde(default = "default_xy_axis")]
    pub x: AxisConfig,
    #[serde(default = "default_xy_axis")]
    pub y: AxisConfig,
    #[serde(default = "default_z_axis")]
    pub z: AxisConfig,
    #[serde(default = "default_e_axis")]
    pub e: AxisConfig,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            x: default_xy_axis(),
            y: default_xy_axis(),
            z: default_z_axis(),
            e: default_e_axis(),
        }
    }
}

impl AxesConfig {
    pub fn get(&self, axis: Axis) -> &AxisConfig {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
            Axis::E => &self.e,
        }
    }

    pub fn get_mut(&mut self, axis: Axis) -> &mut AxisConfig {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
            Axis::E => &mut self.e,
        }
    }

    /// Collects one field of every axis.
    pub fn collect<T>(&self, f: impl Fn(&AxisConfig) -> T) -> AxisArray<T> {
        AxisArray::from_fn(|axis| f(self.get(axis)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LevelingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Above this height no correction is applied; below it mesh
    /// corrections are scaled down linearly.
    #[serde(default)]
    pub fade_height: Option<f64>,
    #[serde(default)]
    pub planar: Option<PlanarConfig>,
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PlanarConfig {
    pub matrix: [[f64; 3]; 3],
    #[serde(default)]
    pub fulcrum: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MeshConfig {
    pub origin: [f64; 2],
    pub spacing: [f64; 2],
    /// Rows along Y, columns along X.
    pub z: Vec<Vec<f64>>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let planner = &self.planner;
        if planner.block_buffer_size < 2 {
            return Err(invalid(format!(
                "block_buffer_size must be at least 2, got {}",
                planner.block_buffer_size
            )));
        }
        if planner.min_steps_per_segment == 0 {
            return Err(invalid("min_steps_per_segment must be > 0".to_string()));
        }
        if planner.tool_count == 0 {
            return Err(invalid("tool_count must be > 0".to_string()));
        }
        if planner.fan_count > crate::motion::block::MAX_FANS {
            return Err(invalid(format!(
                "fan_count must be at most {}",
                crate::motion::block::MAX_FANS
            )));
        }
        for (name, value) in [
            ("acceleration", planner.acceleration),
            ("retract_acceleration", planner.retract_acceleration),
            ("travel_acceleration", planner.travel_acceleration),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("{} must be > 0, got {}", name, value)));
            }
        }
        if planner.min_feedrate < 0.0 || planner.min_travel_feedrate < 0.0 {
            return Err(invalid("minimum feed rates must not be negative".to_string()));
        }
        if let Some(limit) = planner.max_extrude_length {
            if !(limit > 0.0) {
                return Err(invalid(format!("max_extrude_length must be > 0, got {}", limit)));
            }
        }

        for axis in Axis::ALL {
            let cfg = self.axes.get(axis);
            for (name, value) in [
                ("steps_per_mm", cfg.steps_per_mm),
                ("max_feedrate", cfg.max_feedrate),
                ("max_acceleration", cfg.max_acceleration),
            ] {
                if !(value.is_finite() && value > 0.0) {
                    return Err(invalid(format!(
                        "{} for axis '{}' must be > 0, got {}",
                        name, axis, value
                    )));
                }
            }
            if !(cfg.max_jerk.is_finite() && cfg.max_jerk >= 0.0) {
                return Err(invalid(format!(
                    "max_jerk for axis '{}' must not be negative",
                    axis
                )));
            }
        }

        if let Some(leveling) = &self.leveling {
            leveling.validate()?;
        }
        Ok(())
    }
}

impl LevelingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.planar, &self.mesh) {
            (Some(_), Some(_)) => {
                return Err(invalid("leveling takes either planar or mesh, not both".to_string()));
            }
            (None, None) => {
                return Err(invalid("leveling needs a planar or mesh section".to_string()));
            }
            _ => {}
        }
        if let Some(fade) = self.fade_height {
            if !(fade > 0.0) {
                return Err(invalid(format!("fade_height must be > 0, got {}", fade)));
            }
        }
        if let Some(mesh) = &self.mesh {
            if mesh.spacing.iter().any(|s| !(*s > 0.0)) {
                return Err(invalid("mesh spacing must be > 0".to_string()));
            }
            let rows = mesh.z.len();
            let cols = mesh.z.first().map_or(0, Vec::len);
            if rows < 2 || cols < 2 {
                return Err(invalid(format!(
                    "mesh needs at least 2x2 points, got {}x{}",
                    cols, rows
                )));
            }
            if mesh.z.iter().any(|row| row.len() != cols) {
                return Err(invalid("mesh rows must all have the same length".to_string()));
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

fn default_block_buffer_size() -> usize { 16 }
fn default_min_steps_per_segment() -> u32 { 6 }
fn default_minimal_step_rate() -> u32 { 120 }
fn default_acceleration() -> f64 { 1000.0 }
fn default_retract_acceleration() -> f64 { 3000.0 }
fn default_travel_acceleration() -> f64 { 1000.0 }
fn default_min_segment_time_us() -> u64 { 20_000 }
fn default_fan_count() -> usize { 1 }
fn default_tool_count() -> u8 { 1 }
fn default_true() -> bool { true }

fn default_xy_axis() -> AxisConfig {
    AxisConfig { steps_per_mm: 80.0, max_feedrate: 300.0, max_acceleration: 3000.0, max_jerk: 10.0 }
}

fn default_z_axis() -> AxisConfig {
    AxisConfig { steps_per_mm: 400.0, max_feedrate: 5.0, max_acceleration: 100.0, max_jerk: 0.4 }
}

fn default_e_axis() -> AxisConfig {
    AxisConfig { steps_per_mm: 93.0, max_feedrate: 25.0, max_acceleration: 10000.0, max_jerk: 5.0 }
}

/// Reads and validates a TOML configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path.display(), e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &Config, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let toml_string = toml::to_string(config)?;
    std::fs::write(path, toml_string)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.planner.block_buffer_size, 16);
        assert_eq!(config.planner.minimal_step_rate, 120);
        assert_eq!(config.axes.z.steps_per_mm, 400.0);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [planner]
            block_buffer_size = 8
            kinematics = "corexy"
            disable_inactive = ["e", "z"]

            [axes.x]
            steps_per_mm = 100.0
            max_feedrate = 200.0
            max_acceleration = 2000.0
            max_jerk = 8.0
            "#,
        )
        .unwrap();
        assert_eq!(config.planner.block_buffer_size, 8);
        assert_eq!(config.planner.kinematics, KinematicsType::CoreXY);
        assert_eq!(config.planner.disable_inactive, vec![Axis::E, Axis::Z]);
        assert_eq!(config.axes.x.steps_per_mm, 100.0);
        assert_eq!(config.axes.y.steps_per_mm, 80.0);
        assert!(config.leveling.is_none());
    }

    #[test]
    fn test_rejects_tiny_buffer() {
        let mut config = Config::default();
        config.planner.block_buffer_size = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_steps_per_mm() {
        let mut config = Config::default();
        config.axes.get_mut(Axis::E).steps_per_mm = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("steps_per_mm"));
    }

    #[test]
    fn test_rejects_ragged_mesh() {
        let mut config = Config::default();
        config.leveling = Some(LevelingConfig {
            enabled: true,
            fade_height: None,
            planar: None,
            mesh: Some(MeshConfig {
                origin: [0.0, 0.0],
                spacing: [10.0, 10.0],
                z: vec![vec![0.0, 0.1], vec![0.2]],
            }),
        });
        assert!(config.validate().is_err());
    }
}
