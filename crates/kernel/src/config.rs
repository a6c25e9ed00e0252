//! Tuned constants of the kernel, loadable from JSON.

use std::fs;
use std::path::{Path, PathBuf};

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recorder::DEFAULT_RECORDER_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config json: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    #[error("parse config json at {path}: {source}")]
    ParseAt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("validation failed at {path}: {message}")]
    Invalid { path: &'static str, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub movement: MovementConfig,
    pub traversal: TraversalConfig,
    pub fluid: FluidConfig,
    pub leash: LeashConfig,
    pub rules: WorldRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub recorder_capacity: usize,
    /// Largest per-axis displacement a piston-class mover may cause per world tick.
    pub piston_limit: f64,
    /// Entities this far below the level's minimum height are discarded.
    pub below_world_margin: f64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            recorder_capacity: DEFAULT_RECORDER_CAPACITY,
            piston_limit: 0.51,
            below_world_margin: 64.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub max_steps: usize,
    pub report_air: bool,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_steps: 16,
            report_air: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidConfig {
    pub water_flow_scale: f64,
    pub lava_flow_scale: f64,
    /// Existing horizontal speed below which the minimum impulse kicks in.
    pub min_velocity_threshold: f64,
    /// Floor applied to the flow impulse in that case.
    pub min_impulse: f64,
    pub partial_submersion: f64,
    /// Water depth above which buoyancy counters gravity.
    pub buoyancy_threshold: f64,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            water_flow_scale: 0.014,
            lava_flow_scale: 0.002_333_333_3,
            min_velocity_threshold: 0.003,
            min_impulse: 0.0045,
            partial_submersion: 0.4,
            buoyancy_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeashConfig {
    pub snap_distance: f64,
    pub elastic_distance: f64,
    pub stiffness: f64,
    pub torsional_elasticity: f64,
    pub damping: f64,
    pub axis_elasticity: [f64; 3],
    pub single_point_scale: f64,
    pub quad_point_scale: f64,
    /// Ticks a pending attachment may stay unresolved before it is abandoned.
    pub restore_grace_ticks: u32,
    /// Fraction of the correction fed back into a movable holder.
    pub holder_reaction: f64,
}

impl Default for LeashConfig {
    fn default() -> Self {
        Self {
            snap_distance: 12.0,
            elastic_distance: 6.0,
            stiffness: 0.11,
            torsional_elasticity: 10.0,
            damping: 0.5,
            axis_elasticity: [1.0, 0.2, 1.0],
            single_point_scale: 1.0,
            quad_point_scale: 0.25,
            restore_grace_ticks: 100,
            holder_reaction: 0.05,
        }
    }
}

impl LeashConfig {
    pub fn axis_elasticity(&self) -> DVec3 {
        DVec3::from_array(self.axis_elasticity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldRules {
    /// When false, broken leashes vanish instead of dropping an item.
    pub entity_drops: bool,
}

impl Default for WorldRules {
    fn default() -> Self {
        Self { entity_drops: true }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.movement.recorder_capacity < 2 {
            return Err(invalid(
                "movement.recorder_capacity",
                format!("expected at least 2, got {}", self.movement.recorder_capacity),
            ));
        }
        positive("movement.piston_limit", self.movement.piston_limit)?;
        non_negative("movement.below_world_margin", self.movement.below_world_margin)?;
        if self.traversal.max_steps == 0 {
            return Err(invalid("traversal.max_steps", "expected at least 1, got 0"));
        }

        let fluid = &self.fluid;
        non_negative("fluid.water_flow_scale", fluid.water_flow_scale)?;
        non_negative("fluid.lava_flow_scale", fluid.lava_flow_scale)?;
        non_negative("fluid.min_velocity_threshold", fluid.min_velocity_threshold)?;
        non_negative("fluid.min_impulse", fluid.min_impulse)?;
        unit_interval("fluid.partial_submersion", fluid.partial_submersion)?;
        non_negative("fluid.buoyancy_threshold", fluid.buoyancy_threshold)?;

        let leash = &self.leash;
        positive("leash.snap_distance", leash.snap_distance)?;
        positive("leash.elastic_distance", leash.elastic_distance)?;
        if leash.elastic_distance > leash.snap_distance {
            return Err(invalid(
                "leash.elastic_distance",
                format!(
                    "expected no more than snap_distance {}, got {}",
                    leash.snap_distance, leash.elastic_distance
                ),
            ));
        }
        non_negative("leash.stiffness", leash.stiffness)?;
        non_negative("leash.torsional_elasticity", leash.torsional_elasticity)?;
        unit_interval("leash.damping", leash.damping)?;
        for value in leash.axis_elasticity {
            non_negative("leash.axis_elasticity", value)?;
        }
        non_negative("leash.single_point_scale", leash.single_point_scale)?;
        non_negative("leash.quad_point_scale", leash.quad_point_scale)?;
        unit_interval("leash.holder_reaction", leash.holder_reaction)?;
        Ok(())
    }
}

fn invalid(path: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path,
        message: message.into(),
    }
}

fn non_negative(path: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(path, format!("expected finite value >= 0, got {value}")))
    }
}

fn positive(path: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(path, format!("expected finite value > 0, got {value}")))
    }
}

fn unit_interval(path: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(path, format!("expected value in [0, 1], got {value}")))
    }
}

/// Parses and validates a config document. Missing fields take defaults.
pub fn parse_config_json(raw: &str) -> Result<KernelConfig, ConfigError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    let config = match serde_path_to_error::deserialize::<_, KernelConfig>(&mut deserializer) {
        Ok(config) => config,
        Err(error) => {
            let path = error.path().to_string();
            let source = error.into_inner();
            return Err(if path.is_empty() || path == "." {
                ConfigError::Parse { source }
            } else {
                ConfigError::ParseAt { path, source }
            });
        }
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config_file(path: &Path) -> Result<KernelConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_json(&raw)
}
