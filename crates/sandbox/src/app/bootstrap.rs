use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use motion_kernel::{load_config_file, ConfigError, KernelConfig};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use super::scenario::{Scenario, ScenarioError};

pub(crate) const CONFIG_ENV_VAR: &str = "MOTION_CONFIG";
pub(crate) const TICKS_ENV_VAR: &str = "MOTION_TICKS";
pub(crate) const TPS_ENV_VAR: &str = "MOTION_TPS";

#[derive(Debug, Error)]
pub(crate) enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to load kernel config: {0}")]
    Config(#[source] ConfigError),
    #[error("failed to build scenario: {0}")]
    Scenario(#[source] ScenarioError),
}

#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub(crate) total_ticks: u64,
    /// Zero runs ticks back to back without pacing.
    pub(crate) target_tps: u32,
    pub(crate) max_ticks_per_frame: u32,
    pub(crate) max_frame_delta: Duration,
    pub(crate) metrics_log_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            total_ticks: 600,
            target_tps: 20,
            max_ticks_per_frame: 5,
            max_frame_delta: Duration::from_millis(250),
            metrics_log_interval: Duration::from_secs(1),
        }
    }
}

pub(crate) struct AppWiring {
    pub(crate) settings: LoopSettings,
    pub(crate) scenario: Scenario,
}

pub(crate) fn build_app() -> Result<AppWiring, StartupError> {
    init_tracing();
    info!("=== Motion Sandbox Startup ===");

    let kernel = load_kernel_config()?;
    let defaults = LoopSettings::default();
    let settings = LoopSettings {
        total_ticks: read_env_number(TICKS_ENV_VAR, defaults.total_ticks),
        target_tps: read_env_number(TPS_ENV_VAR, defaults.target_tps),
        ..defaults
    };
    let scenario = Scenario::build(kernel).map_err(StartupError::Scenario)?;

    Ok(AppWiring { settings, scenario })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn load_kernel_config() -> Result<KernelConfig, StartupError> {
    match env::var(CONFIG_ENV_VAR) {
        Ok(raw) => {
            let path = PathBuf::from(raw);
            let config = load_config_file(&path).map_err(StartupError::Config)?;
            info!(path = %path.display(), "kernel_config_loaded");
            Ok(config)
        }
        Err(env::VarError::NotPresent) => Ok(KernelConfig::default()),
        Err(source) => Err(StartupError::EnvVar {
            var: CONFIG_ENV_VAR,
            source,
        }),
    }
}

fn read_env_number<T: FromStr + fmt::Display + Copy>(var: &'static str, fallback: T) -> T {
    match env::var(var) {
        Ok(value) => parse_number(var, &value, fallback),
        Err(env::VarError::NotPresent) => fallback,
        Err(err) => {
            warn!(
                env_var = var,
                error = %err,
                "unable to read env var; falling back to default"
            );
            fallback
        }
    }
}

fn parse_number<T: FromStr + fmt::Display + Copy>(var: &'static str, value: &str, fallback: T) -> T {
    match value.trim().parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                env_var = var,
                value,
                fallback = %fallback,
                "invalid env var value; falling back to default"
            );
            fallback
        }
    }
}
