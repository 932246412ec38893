//! Configuration loading
//!
//! Bootstrap configuration comes from a TOML file resolved in this order:
//! 1. Explicit path (command-line argument)
//! 2. `ISOPREP_CONFIG` environment variable
//! 3. Built-in defaults
//!
//! A missing or unreadable file is never fatal: a warning is logged and the
//! built-in defaults are used. A file that exists but fails to parse is an
//! error, since silently ignoring a typo in a dilution limit would produce
//! wrong worklists.

use crate::pipetting::{PipettingSpecs, Pipettor, ReservoirSpecs};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the TOML configuration file
pub const CONFIG_ENV_VAR: &str = "ISOPREP_CONFIG";

/// Environment variable overriding the database path
pub const DATABASE_ENV_VAR: &str = "ISOPREP_DATABASE";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-pipettor overrides of the built-in machine constants
    #[serde(default)]
    pub pipetting: PipettingConfig,

    #[serde(default)]
    pub volumes: VolumeConfig,

    /// Additional plate types (replace built-ins with the same name)
    #[serde(default)]
    pub reservoirs: Vec<ReservoirSpecs>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            logging: LoggingConfig::default(),
            pipetting: PipettingConfig::default(),
            volumes: VolumeConfig::default(),
            reservoirs: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Partial override of one pipettor's limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipettingOverride {
    pub min_transfer_volume: Option<f64>,
    pub max_transfer_volume: Option<f64>,
    pub max_dilution_factor: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipettingConfig {
    #[serde(default)]
    pub biomek_stock: Option<PipettingOverride>,
    #[serde(default)]
    pub biomek: Option<PipettingOverride>,
    #[serde(default)]
    pub cybio: Option<PipettingOverride>,
    #[serde(default)]
    pub manual: Option<PipettingOverride>,
}

impl PipettingConfig {
    fn override_for(&self, pipettor: Pipettor) -> Option<PipettingOverride> {
        match pipettor {
            Pipettor::BiomekStock => self.biomek_stock,
            Pipettor::Biomek => self.biomek,
            Pipettor::CyBio => self.cybio,
            Pipettor::Manual => self.manual,
        }
    }
}

/// Volume rules that are not tied to a single pipettor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume that stays in a stock tube (µl)
    #[serde(default = "default_stock_dead_volume")]
    pub stock_dead_volume: f64,

    /// Dynamic dead volume growth per additional target well (µl)
    #[serde(default = "default_dead_volume_increment")]
    pub dead_volume_increment: f64,

    /// Largest number of intermediate wells inserted for one dilution
    #[serde(default = "default_max_intermediate_steps")]
    pub max_intermediate_steps: u32,

    /// Control volume added to each library plate well (µl)
    #[serde(default = "default_library_transfer_volume")]
    pub library_transfer_volume: f64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            stock_dead_volume: default_stock_dead_volume(),
            dead_volume_increment: default_dead_volume_increment(),
            max_intermediate_steps: default_max_intermediate_steps(),
            library_transfer_volume: default_library_transfer_volume(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("isoprep.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stock_dead_volume() -> f64 {
    5.0
}

fn default_dead_volume_increment() -> f64 {
    0.5
}

fn default_max_intermediate_steps() -> u32 {
    3
}

fn default_library_transfer_volume() -> f64 {
    4.0
}

/// Resolved machine constants handed to the planner, assigner and executor
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConstants {
    specs: Vec<PipettingSpecs>,
    pub volumes: VolumeConfig,
    pub reservoirs: Vec<ReservoirSpecs>,
}

impl Default for MachineConstants {
    fn default() -> Self {
        Self::from_config(&TomlConfig::default())
    }
}

impl MachineConstants {
    /// Overlay the TOML overrides onto the built-in defaults
    pub fn from_config(config: &TomlConfig) -> Self {
        let specs = Pipettor::ALL
            .iter()
            .map(|&pipettor| {
                let mut specs = PipettingSpecs::default_for(pipettor);
                if let Some(over) = config.pipetting.override_for(pipettor) {
                    if let Some(value) = over.min_transfer_volume {
                        specs.min_transfer_volume = value;
                    }
                    if let Some(value) = over.max_transfer_volume {
                        specs.max_transfer_volume = value;
                    }
                    if let Some(value) = over.max_dilution_factor {
                        specs.max_dilution_factor = value;
                    }
                }
                specs
            })
            .collect();

        let mut reservoirs = vec![
            ReservoirSpecs::standard_96(),
            ReservoirSpecs::standard_384(),
            ReservoirSpecs::deep_96(),
        ];
        for custom in &config.reservoirs {
            reservoirs.retain(|r| r.name != custom.name);
            reservoirs.push(custom.clone());
        }

        Self {
            specs,
            volumes: config.volumes,
            reservoirs,
        }
    }

    /// Limits of one pipettor
    pub fn specs(&self, pipettor: Pipettor) -> PipettingSpecs {
        self.specs
            .iter()
            .copied()
            .find(|s| s.pipettor == pipettor)
            .unwrap_or_else(|| PipettingSpecs::default_for(pipettor))
    }

    /// Plate type by name
    pub fn reservoir(&self, name: &str) -> Option<&ReservoirSpecs> {
        self.reservoirs.iter().find(|r| r.name == name)
    }

    /// Default plate type for a plate geometry
    pub fn default_reservoir(&self, number_rows: u8, number_columns: u8) -> Option<&ReservoirSpecs> {
        let name = if number_rows == 16 && number_columns == 24 {
            "standard 384"
        } else {
            "standard 96"
        };
        self.reservoir(name)
            .filter(|r| r.number_rows == number_rows && r.number_columns == number_columns)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        for specs in &self.specs {
            if specs.min_transfer_volume <= 0.0 || specs.max_transfer_volume < specs.min_transfer_volume {
                return Err(Error::Config(format!(
                    "Invalid transfer volume range for {}: {} - {}",
                    specs.pipettor, specs.min_transfer_volume, specs.max_transfer_volume
                )));
            }
            if specs.max_dilution_factor < 1.0 {
                return Err(Error::Config(format!(
                    "Invalid maximum dilution factor for {}: {}",
                    specs.pipettor, specs.max_dilution_factor
                )));
            }
        }
        if self.volumes.stock_dead_volume < 0.0 || self.volumes.dead_volume_increment < 0.0 {
            return Err(Error::Config("Dead volumes must not be negative".to_string()));
        }
        if self.volumes.library_transfer_volume <= 0.0 {
            return Err(Error::Config("Library transfer volume must be positive".to_string()));
        }
        for reservoir in &self.reservoirs {
            if reservoir.min_dead_volume > reservoir.max_dead_volume
                || reservoir.max_dead_volume >= reservoir.max_volume
            {
                return Err(Error::Config(format!(
                    "Inconsistent dead volumes for reservoir '{}'",
                    reservoir.name
                )));
            }
        }
        Ok(())
    }
}

/// Resolve the configuration file path (explicit → environment → none)
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

/// Load the TOML configuration with graceful degradation
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match resolve_config_path(cli_arg) {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(content) => {
                let parsed: TomlConfig = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e))
                })?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            Err(e) => {
                warn!(
                    "Configuration file {} not readable ({}), using built-in defaults",
                    path.display(),
                    e
                );
                TomlConfig::default()
            }
        },
        None => {
            info!("No configuration file given, using built-in defaults");
            TomlConfig::default()
        }
    };

    if let Ok(db_path) = std::env::var(DATABASE_ENV_VAR) {
        config.database_path = PathBuf::from(db_path);
    }

    Ok(config)
}

/// Render a configuration as TOML (used to print the effective defaults)
pub fn to_toml_string(config: &TomlConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))
}
