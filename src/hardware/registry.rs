//! Module Registry for Runtime Hardware Management
//!
//! The registry turns `[[hardware]]` entries of the configuration into live
//! driver instances and hands them out by interface, the way a host resolves a
//! logic module's connector to whatever module satisfies it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ModuleRegistry                            │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────┐  ┌─────────┐      │
//! │  │ "laser"    │  │ "mw_source" │  │ "pid"    │  │ "awg"   │ ...  │
//! │  └────────────┘  └─────────────┘  └──────────┘  └─────────┘      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                       Interface Traits                           │
//! │  SimpleLaser | Microwave | PidController | Motor | LineScanner   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                        Hardware Drivers                          │
//! │  Cobolt06Mld | Sg6000Pro | Smbv | Lakeshore335 | Pi3Motor | ...  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Known module types
//!
//! | `type` | Driver | Interfaces |
//! |--------|--------|------------|
//! | `cobolt` | `Cobolt06Mld` | SimpleLaser |
//! | `opus532` | `Opus532` | SimpleLaser |
//! | `sg6000pro` | `Sg6000Pro` | Microwave |
//! | `smbv` | `Smbv` | Microwave |
//! | `lakeshore335` | `Lakeshore335` | PidController |
//! | `lm510` | `Lm510` | LevelSensor |
//! | `pi3` | `Pi3Motor` | Motor |
//! | `aps100` | `Aps100` | VectorMagnet |
//! | `spectrum_awg` | `Awg` | (inherent API) |
//! | `spm_sim` | `SimulatedLineScanner` | LineScanner |
//! | `mock_*` | `mock` module | per mock |
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use daq_modules::config::AppConfig;
//! use daq_modules::hardware::registry::ModuleRegistry;
//!
//! let config = AppConfig::load()?;
//! let registry = ModuleRegistry::from_config(&config)?;
//! registry.activate_all().await?;
//!
//! if let Some(laser) = registry.get_laser("laser") {
//!     laser.on().await?;
//! }
//! ```

use crate::config::{AppConfig, ModuleDefinition};
use crate::error::DaqError;
use crate::hardware::aps100::{Aps100, Aps100Config};
use crate::hardware::awg::{Awg, AwgConfig};
use crate::hardware::capabilities::{
    Camera, LevelSensor, LineScanner, Microwave, Motor, Movable, PidController, SimpleLaser,
    SlowCounter, VectorMagnet,
};
use crate::hardware::cobolt::{Cobolt06Mld, CoboltConfig};
use crate::hardware::lakeshore335::{Lakeshore335, Lakeshore335Config};
use crate::hardware::lm510::{Lm510, Lm510Config};
use crate::hardware::mock::{MockCamera, MockCounter, MockLaser, MockPidController, MockStage};
use crate::hardware::opus532::{Opus532, Opus532Config};
use crate::hardware::pi3::{Pi3Config, Pi3Motor};
use crate::hardware::sg6000pro::{Sg6000Pro, Sg6000ProConfig};
use crate::hardware::smbv::{Smbv, SmbvConfig};
use crate::hardware::spm_sim::SimulatedLineScanner;
use crate::module::Module;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

// =============================================================================
// Interface identification
// =============================================================================

/// Interfaces a module can provide (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Laser with power/current control
    SimpleLaser,
    /// Microwave source
    Microwave,
    /// Regulator with process and control value
    PidController,
    /// Cryogen level meter
    LevelSensor,
    /// Multi-axis motor
    Motor,
    /// Three-axis magnet supply
    VectorMagnet,
    /// Camera
    Camera,
    /// Counter returning mean and standard deviation
    SlowCounter,
    /// Single-axis stage
    Movable,
    /// SPM line scanner
    LineScanner,
    /// Arbitrary waveform generator
    Awg,
}

/// Information about a registered module (returned by list operations)
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Module id from the configuration
    pub id: String,
    /// Module `type` string
    pub module_type: String,
    /// Interfaces the module satisfies
    pub capabilities: Vec<Capability>,
}

// =============================================================================
// Registered module (internal)
// =============================================================================

#[derive(Default)]
struct Handles {
    lifecycle: Option<Arc<dyn Module>>,
    laser: Option<Arc<dyn SimpleLaser>>,
    microwave: Option<Arc<dyn Microwave>>,
    pid: Option<Arc<dyn PidController>>,
    level: Option<Arc<dyn LevelSensor>>,
    motor: Option<Arc<dyn Motor>>,
    magnet: Option<Arc<dyn VectorMagnet>>,
    camera: Option<Arc<dyn Camera>>,
    counter: Option<Arc<dyn SlowCounter>>,
    movable: Option<Arc<dyn Movable>>,
    scanner: Option<Arc<dyn LineScanner>>,
    awg: Option<Arc<Awg>>,
}

impl Handles {
    fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        let mut add = |present: bool, cap| {
            if present {
                caps.push(cap);
            }
        };
        add(self.laser.is_some(), Capability::SimpleLaser);
        add(self.microwave.is_some(), Capability::Microwave);
        add(self.pid.is_some(), Capability::PidController);
        add(self.level.is_some(), Capability::LevelSensor);
        add(self.motor.is_some(), Capability::Motor);
        add(self.magnet.is_some(), Capability::VectorMagnet);
        add(self.camera.is_some(), Capability::Camera);
        add(self.counter.is_some(), Capability::SlowCounter);
        add(self.movable.is_some(), Capability::Movable);
        add(self.scanner.is_some(), Capability::LineScanner);
        add(self.awg.is_some(), Capability::Awg);
        caps
    }
}

struct RegisteredModule {
    module_type: String,
    handles: Handles,
}

// Options of the mock types.

#[derive(Debug, Deserialize)]
struct MockLaserOptions {
    #[serde(default = "default_mock_max_power")]
    max_power: f64,
}

fn default_mock_max_power() -> f64 {
    0.1
}

#[derive(Debug, Deserialize)]
struct MockStageOptions {
    #[serde(default)]
    initial_position: f64,
}

#[derive(Debug, Deserialize)]
struct MockPidOptions {
    #[serde(default = "default_mock_temperature")]
    temperature: f64,
}

fn default_mock_temperature() -> f64 {
    4.2
}

#[derive(Debug, Deserialize)]
struct MockCameraOptions {
    #[serde(default = "default_mock_size")]
    width: u32,
    #[serde(default = "default_mock_size")]
    height: u32,
}

fn default_mock_size() -> u32 {
    64
}

// =============================================================================
// Module Registry
// =============================================================================

/// Central registry for hardware module instances
pub struct ModuleRegistry {
    modules: BTreeMap<String, RegisteredModule>,
    order: Vec<String>,
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            modules: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Instantiate every enabled `[[hardware]]` entry, in file order.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        for definition in config.enabled_hardware() {
            registry
                .register(definition)
                .with_context(|| format!("registering hardware module '{}'", definition.id))?;
        }
        Ok(registry)
    }

    /// Instantiate the driver for one definition.
    ///
    /// # Errors
    /// Returns error if the id is taken, the type is unknown, or its options
    /// do not deserialize.
    pub fn register(&mut self, definition: &ModuleDefinition) -> Result<()> {
        if self.modules.contains_key(&definition.id) {
            return Err(anyhow!("Module '{}' is already registered", definition.id));
        }
        let handles = self.instantiate(definition)?;
        info!(
            module = %definition.id,
            module_type = %definition.r#type,
            capabilities = ?handles.capabilities(),
            "Registered hardware module"
        );
        self.order.push(definition.id.clone());
        self.modules.insert(
            definition.id.clone(),
            RegisteredModule {
                module_type: definition.r#type.clone(),
                handles,
            },
        );
        Ok(())
    }

    /// Remove a module, returning whether it was present
    pub fn unregister(&mut self, id: &str) -> bool {
        self.order.retain(|m| m != id);
        self.modules.remove(id).is_some()
    }

    /// List all registered modules in registration order
    pub fn list_modules(&self) -> Vec<ModuleInfo> {
        self.order
            .iter()
            .filter_map(|id| self.get_module_info(id))
            .collect()
    }

    /// Module info by id
    pub fn get_module_info(&self, id: &str) -> Option<ModuleInfo> {
        self.modules.get(id).map(|m| ModuleInfo {
            id: id.to_string(),
            module_type: m.module_type.clone(),
            capabilities: m.handles.capabilities(),
        })
    }

    /// Check if a module is registered
    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// Number of registered modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Ids of all modules providing `capability`
    pub fn modules_with_capability(&self, capability: Capability) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.modules
                    .get(id.as_str())
                    .is_some_and(|m| m.handles.capabilities().contains(&capability))
            })
            .cloned()
            .collect()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Activate all modules in registration order.
    ///
    /// Stops at the first failure; modules activated so far stay active.
    pub async fn activate_all(&self) -> Result<()> {
        for id in &self.order {
            if let Some(module) = self.modules.get(id).and_then(|m| m.handles.lifecycle.clone()) {
                if let Err(e) = module.on_activate().await {
                    error!(module = %id, error = %e, "Activation failed");
                    return Err(e.context(format!("activating '{}'", id)));
                }
            }
        }
        Ok(())
    }

    /// Deactivate all modules in reverse order, logging failures.
    pub async fn deactivate_all(&self) {
        for id in self.order.iter().rev() {
            if let Some(module) = self.modules.get(id).and_then(|m| m.handles.lifecycle.clone()) {
                if let Err(e) = module.on_deactivate().await {
                    error!(module = %id, error = %e, "Deactivation failed");
                }
            }
        }
    }

    // =========================================================================
    // Interface Access
    // =========================================================================

    fn handles(&self, id: &str) -> Option<&Handles> {
        self.modules.get(id).map(|m| &m.handles)
    }

    /// Lifecycle handle of a module (mocks have none)
    pub fn get_module(&self, id: &str) -> Option<Arc<dyn Module>> {
        self.handles(id).and_then(|h| h.lifecycle.clone())
    }

    /// Module as SimpleLaser
    pub fn get_laser(&self, id: &str) -> Option<Arc<dyn SimpleLaser>> {
        self.handles(id).and_then(|h| h.laser.clone())
    }

    /// Module as Microwave
    pub fn get_microwave(&self, id: &str) -> Option<Arc<dyn Microwave>> {
        self.handles(id).and_then(|h| h.microwave.clone())
    }

    /// Module as PidController
    pub fn get_pid(&self, id: &str) -> Option<Arc<dyn PidController>> {
        self.handles(id).and_then(|h| h.pid.clone())
    }

    /// Module as LevelSensor
    pub fn get_level_sensor(&self, id: &str) -> Option<Arc<dyn LevelSensor>> {
        self.handles(id).and_then(|h| h.level.clone())
    }

    /// Module as Motor
    pub fn get_motor(&self, id: &str) -> Option<Arc<dyn Motor>> {
        self.handles(id).and_then(|h| h.motor.clone())
    }

    /// Module as VectorMagnet
    pub fn get_magnet(&self, id: &str) -> Option<Arc<dyn VectorMagnet>> {
        self.handles(id).and_then(|h| h.magnet.clone())
    }

    /// Module as Camera
    pub fn get_camera(&self, id: &str) -> Option<Arc<dyn Camera>> {
        self.handles(id).and_then(|h| h.camera.clone())
    }

    /// Module as SlowCounter
    pub fn get_counter(&self, id: &str) -> Option<Arc<dyn SlowCounter>> {
        self.handles(id).and_then(|h| h.counter.clone())
    }

    /// Module as Movable
    pub fn get_movable(&self, id: &str) -> Option<Arc<dyn Movable>> {
        self.handles(id).and_then(|h| h.movable.clone())
    }

    /// Module as LineScanner
    pub fn get_line_scanner(&self, id: &str) -> Option<Arc<dyn LineScanner>> {
        self.handles(id).and_then(|h| h.scanner.clone())
    }

    /// The AWG module
    pub fn get_awg(&self, id: &str) -> Option<Arc<Awg>> {
        self.handles(id).and_then(|h| h.awg.clone())
    }

    // =========================================================================
    // Instantiation (private)
    // =========================================================================

    fn instantiate(&self, definition: &ModuleDefinition) -> Result<Handles> {
        let id = definition.id.as_str();
        let handles = match definition.r#type.as_str() {
            "cobolt" => {
                let driver = Arc::new(Cobolt06Mld::from_config(id, definition.options::<CoboltConfig>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    laser: Some(driver),
                    ..Default::default()
                }
            }
            "opus532" => {
                let driver = Arc::new(Opus532::from_config(id, definition.options::<Opus532Config>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    laser: Some(driver),
                    ..Default::default()
                }
            }
            "sg6000pro" => {
                let driver = Arc::new(Sg6000Pro::from_config(id, definition.options::<Sg6000ProConfig>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    microwave: Some(driver),
                    ..Default::default()
                }
            }
            "smbv" => {
                let driver = Arc::new(Smbv::from_config(id, definition.options::<SmbvConfig>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    microwave: Some(driver),
                    ..Default::default()
                }
            }
            "lakeshore335" => {
                let driver =
                    Arc::new(Lakeshore335::from_config(id, definition.options::<Lakeshore335Config>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    pid: Some(driver),
                    ..Default::default()
                }
            }
            "lm510" => {
                let driver = Arc::new(Lm510::from_config(id, definition.options::<Lm510Config>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    level: Some(driver),
                    ..Default::default()
                }
            }
            "pi3" => {
                let driver = Arc::new(Pi3Motor::from_config(id, definition.options::<Pi3Config>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    motor: Some(driver),
                    ..Default::default()
                }
            }
            "aps100" => {
                let driver = Arc::new(Aps100::from_config(id, definition.options::<Aps100Config>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    magnet: Some(driver),
                    ..Default::default()
                }
            }
            "spectrum_awg" => {
                let driver = Arc::new(Awg::from_config(id, definition.options::<AwgConfig>()?)?);
                Handles {
                    lifecycle: Some(driver.clone()),
                    awg: Some(driver),
                    ..Default::default()
                }
            }
            "spm_sim" => {
                let driver = Arc::new(SimulatedLineScanner::new(id));
                Handles {
                    lifecycle: Some(driver.clone()),
                    scanner: Some(driver),
                    ..Default::default()
                }
            }
            "mock_laser" => {
                let options: MockLaserOptions = definition.options()?;
                Handles {
                    laser: Some(Arc::new(MockLaser::new(options.max_power))),
                    ..Default::default()
                }
            }
            "mock_counter" => {
                let mut counter = MockCounter::new();
                if let Some(laser_id) = definition.connect.get("laser") {
                    let laser = self.get_laser(laser_id).ok_or_else(|| {
                        DaqError::Configuration(format!(
                            "module '{}': '{}' is not a registered laser",
                            id, laser_id
                        ))
                    })?;
                    counter = counter.excited_by(laser);
                }
                Handles {
                    counter: Some(Arc::new(counter)),
                    ..Default::default()
                }
            }
            "mock_stage" => {
                let options: MockStageOptions = definition.options()?;
                Handles {
                    movable: Some(Arc::new(MockStage::with_position(options.initial_position))),
                    ..Default::default()
                }
            }
            "mock_pid" => {
                let options: MockPidOptions = definition.options()?;
                Handles {
                    pid: Some(Arc::new(MockPidController::new(options.temperature))),
                    ..Default::default()
                }
            }
            "mock_camera" => {
                let options: MockCameraOptions = definition.options()?;
                Handles {
                    camera: Some(Arc::new(MockCamera::new(options.width, options.height))),
                    ..Default::default()
                }
            }
            other => {
                return Err(DaqError::Configuration(format!(
                    "module '{}': unknown hardware type '{}'",
                    id, other
                ))
                .into())
            }
        };
        Ok(handles)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Registry of in-process devices: a mock laser exciting a mock counter, a
/// mock thermal stage, two mock stages, the simulated SPM scanner and the
/// simulated AWG.
pub fn create_simulated_registry() -> Result<ModuleRegistry> {
    let config = AppConfig::from_toml_str(SIMULATED_SETUP)?;
    ModuleRegistry::from_config(&config)
}

const SIMULATED_SETUP: &str = r#"
[application]
name = "simulated setup"

[[hardware]]
id = "laser"
type = "mock_laser"
config = { max_power = 0.03 }

[[hardware]]
id = "counter"
type = "mock_counter"
connect = { laser = "laser" }

[[hardware]]
id = "pid"
type = "mock_pid"

[[hardware]]
id = "stage_x"
type = "mock_stage"

[[hardware]]
id = "stage_y"
type = "mock_stage"

[[hardware]]
id = "spm"
type = "spm_sim"

[[hardware]]
id = "awg"
type = "spectrum_awg"
config = { simulate = true }
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_registry() {
        let registry = create_simulated_registry().unwrap();
        assert_eq!(registry.len(), 7);
        assert!(registry.contains("counter"));

        let ids: Vec<String> = registry.list_modules().into_iter().map(|m| m.id).collect();
        assert_eq!(ids[0], "laser");
        assert_eq!(ids[6], "awg");
    }

    #[tokio::test]
    async fn test_capability_lookup() {
        let registry = create_simulated_registry().unwrap();

        assert!(registry.get_laser("laser").is_some());
        assert!(registry.get_laser("counter").is_none());
        assert!(registry.get_counter("counter").is_some());
        assert!(registry.get_line_scanner("spm").is_some());
        assert!(registry.get_awg("awg").is_some());
        assert!(registry.get_module("laser").is_none());

        let movables = registry.modules_with_capability(Capability::Movable);
        assert_eq!(movables, vec!["stage_x".to_string(), "stage_y".to_string()]);

        let counter = registry.get_module_info("counter").unwrap();
        assert_eq!(counter.capabilities, vec![Capability::SlowCounter]);
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let registry = create_simulated_registry().unwrap();
        registry.activate_all().await.unwrap();
        let spm = registry.get_module("spm").unwrap();
        assert_eq!(spm.state(), crate::module::ModuleState::Idle);
        registry.deactivate_all().await;
        assert_eq!(spm.state(), crate::module::ModuleState::Deactivated);
    }

    #[test]
    fn test_duplicate_and_unknown_types() {
        let config = AppConfig::from_toml_str(
            r#"
            [application]
            name = "t"
            [[hardware]]
            id = "x"
            type = "flux_capacitor"
            "#,
        )
        .unwrap();
        let err = ModuleRegistry::from_config(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("flux_capacitor"));

        let mut registry = ModuleRegistry::new();
        let stage = ModuleDefinition {
            id: "s".into(),
            r#type: "mock_stage".into(),
            enabled: true,
            connect: BTreeMap::new(),
            config: toml::Value::Table(toml::map::Map::new()),
        };
        registry.register(&stage).unwrap();
        assert!(registry.register(&stage).is_err());
        assert!(registry.unregister("s"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_counter_needs_known_laser() {
        let config = AppConfig::from_toml_str(
            r#"
            [application]
            name = "t"
            [[hardware]]
            id = "counter"
            type = "mock_counter"
            connect = { laser = "nowhere" }
            "#,
        )
        .unwrap();
        assert!(ModuleRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_serial_driver_from_config() {
        let config = AppConfig::from_toml_str(
            r#"
            [application]
            name = "t"
            [[hardware]]
            id = "mw"
            type = "sg6000pro"
            config = { resource = "tcp://127.0.0.1:5025" }
            "#,
        )
        .unwrap();
        let registry = ModuleRegistry::from_config(&config).unwrap();
        let info = registry.get_module_info("mw").unwrap();
        assert_eq!(info.capabilities, vec![Capability::Microwave]);
    }
}
