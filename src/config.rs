//! Configuration loading using Figment
//!
//! The module collection is described by one TOML file:
//!
//! ```toml
//! [application]
//! name = "Cryo AFM"
//! log_level = "info"
//!
//! [storage]
//! output_dir = "data"
//!
//! [[hardware]]
//! id = "laser"
//! type = "cobolt"
//! config = { resource = "ASRL3::INSTR" }
//!
//! [[logic]]
//! id = "laserlogic"
//! type = "laser"
//! connect = { laser = "laser", counter = "counter" }
//! ```
//!
//! Environment variables prefixed with `DAQ_MODULES_` override file values,
//! with `__` separating nested keys (`DAQ_MODULES_APPLICATION__LOG_LEVEL=debug`).
//!
//! # Example
//! ```no_run
//! use daq_modules::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_from("config/daq_modules.toml")?;
//! config.validate()?;
//! for module in config.enabled_hardware() {
//!     println!("{} -> {}", module.id, module.r#type);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::tracing_setup::LogFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_modules.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where measurement files go
    #[serde(default)]
    pub storage: StorageConfig,
    /// Hardware module definitions
    #[serde(default)]
    pub hardware: Vec<ModuleDefinition>,
    /// Logic module definitions
    #[serde(default)]
    pub logic: Vec<ModuleDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for data files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// One hardware or logic module in the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    /// Unique module identifier
    pub id: String,
    /// Module type (e.g., "cobolt", "sg6000pro", "pid")
    pub r#type: String,
    /// Whether this module is activated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connector name -> id of the module it binds to
    #[serde(default)]
    pub connect: BTreeMap<String, String>,
    /// Module-specific options, deserialized by the module itself
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

impl ModuleDefinition {
    /// Deserialize the free-form `config` table into a module's option struct.
    pub fn options<T: DeserializeOwned>(&self) -> AppResult<T> {
        self.config.clone().try_into().map_err(|e: toml::de::Error| {
            DaqError::Configuration(format!("module '{}': {}", self.id, e))
        })
    }

    /// Id of the module bound to `connector`.
    pub fn connector(&self, connector: &str) -> AppResult<&str> {
        self.connect.get(connector).map(String::as_str).ok_or_else(|| {
            DaqError::Configuration(format!(
                "module '{}' has no connector '{}'",
                self.id, connector
            ))
        })
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl AppConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_MODULES_").split("__"))
            .extract()
    }

    /// Parse configuration from an in-memory TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(content)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.application.log_format.parse::<LogFormat>().is_err() {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: pretty, compact, json",
                self.application.log_format
            ));
        }

        let mut ids = HashSet::new();
        for module in self.hardware.iter().chain(self.logic.iter()) {
            if !ids.insert(module.id.as_str()) {
                return Err(format!("Duplicate module ID: {}", module.id));
            }
        }

        for module in &self.logic {
            for (connector, target) in &module.connect {
                if !ids.contains(target.as_str()) {
                    return Err(format!(
                        "Module '{}' connector '{}' refers to unknown module '{}'",
                        module.id, connector, target
                    ));
                }
            }
        }

        Ok(())
    }

    /// Hardware modules that should be activated
    pub fn enabled_hardware(&self) -> impl Iterator<Item = &ModuleDefinition> {
        self.hardware.iter().filter(|m| m.enabled)
    }

    /// Logic modules that should be activated
    pub fn enabled_logic(&self) -> impl Iterator<Item = &ModuleDefinition> {
        self.logic.iter().filter(|m| m.enabled)
    }

    /// Look up any module by id
    pub fn module(&self, id: &str) -> Option<&ModuleDefinition> {
        self.hardware
            .iter()
            .chain(self.logic.iter())
            .find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "Test"
        log_level = "debug"

        [[hardware]]
        id = "laser"
        type = "cobolt"
        config = { resource = "ASRL3::INSTR", baud_rate = 115200 }

        [[hardware]]
        id = "counter"
        type = "mock_counter"

        [[logic]]
        id = "laserlogic"
        type = "laser"
        connect = { laser = "laser", counter = "counter" }
    "#;

    #[derive(Deserialize)]
    struct LaserOptions {
        resource: String,
        #[serde(default)]
        baud_rate: u32,
    }

    #[test]
    fn parses_modules_and_options() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.output_dir, PathBuf::from("data"));
        assert_eq!(config.enabled_hardware().count(), 2);

        let laser: LaserOptions = config.module("laser").unwrap().options().unwrap();
        assert_eq!(laser.resource, "ASRL3::INSTR");
        assert_eq!(laser.baud_rate, 115200);

        let logic = config.module("laserlogic").unwrap();
        assert_eq!(logic.connector("counter").unwrap(), "counter");
        assert!(logic.connector("stage").is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_module_ids() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let dup = config.hardware[0].clone();
        config.logic.push(ModuleDefinition {
            r#type: "pid".into(),
            ..dup
        });
        let err = config.validate().unwrap_err();
        assert!(err.contains("Duplicate module ID: laser"));
    }

    #[test]
    fn dangling_connector_is_rejected() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        config.logic[0]
            .connect
            .insert("stage".into(), "missing_stage".into());
        let err = config.validate().unwrap_err();
        assert!(err.contains("missing_stage"));
    }

    #[test]
    fn options_error_names_module() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let result: AppResult<LaserOptions> = config.module("counter").unwrap().options();
        let err = result.err().unwrap().to_string();
        assert!(err.contains("counter"));
    }
}
