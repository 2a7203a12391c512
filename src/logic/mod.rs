//! Logic modules
//!
//! Measurement procedures that sit on top of the hardware interfaces. Each
//! logic module holds `Arc<dyn Interface>` handles resolved from its
//! `connect` table and owns its background task.
//!
//! - **`pid`**: polls a `PidController`, keeps a history, logs to file
//! - **`level_sensor`**: the same for a `LevelSensor`
//! - **`laser`**: laser control and the saturation curve measurement
//! - **`scanner`**: line-based area scans and point-by-point scans
//! - **`positioner`**: thin front end to a `Motor`

pub mod history;
pub mod laser;
pub mod level_sensor;
pub mod pid;
pub mod poll;
pub mod positioner;
pub mod scanner;

use crate::config::ModuleDefinition;
use crate::error::DaqError;
use crate::hardware::registry::ModuleRegistry;
use crate::module::Module;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

pub use laser::{LaserLogic, LaserLogicConfig, SaturationPoint, SaturationSettings};
pub use level_sensor::LevelSensorLogic;
pub use pid::PidLogic;
pub use positioner::PositionerLogic;
pub use scanner::{AreaScan, ScanPath, ScannerLogic};

/// `n` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// A constructed logic module.
#[derive(Clone)]
pub enum LogicModule {
    /// `type = "pid"`
    Pid(Arc<PidLogic>),
    /// `type = "level_sensor"`
    LevelSensor(Arc<LevelSensorLogic>),
    /// `type = "laser"`
    Laser(Arc<LaserLogic>),
    /// `type = "scanner"`
    Scanner(Arc<ScannerLogic>),
    /// `type = "positioner"`
    Positioner(Arc<PositionerLogic>),
}

impl LogicModule {
    /// Build a `[[logic]]` entry, resolving its connectors in `registry`.
    pub fn from_definition(
        definition: &ModuleDefinition,
        registry: &ModuleRegistry,
        output_dir: &Path,
    ) -> Result<Self> {
        let id = definition.id.as_str();
        let resolve = |connector: &str| -> Result<String> { Ok(definition.connector(connector)?.to_string()) };
        let missing = |connector: &str, target: &str, interface: &str| -> anyhow::Error {
            DaqError::Configuration(format!(
                "module '{}': connector '{}' -> '{}' is not a {}",
                id, connector, target, interface
            ))
            .into()
        };

        let module = match definition.r#type.as_str() {
            "pid" => {
                let target = resolve("controller")?;
                let controller = registry
                    .get_pid(&target)
                    .ok_or_else(|| missing("controller", &target, "PidController"))?;
                LogicModule::Pid(Arc::new(PidLogic::new(
                    id,
                    controller,
                    definition.options()?,
                    output_dir.to_path_buf(),
                )))
            }
            "level_sensor" => {
                let target = resolve("sensor")?;
                let sensor = registry
                    .get_level_sensor(&target)
                    .ok_or_else(|| missing("sensor", &target, "LevelSensor"))?;
                LogicModule::LevelSensor(Arc::new(LevelSensorLogic::new(
                    id,
                    sensor,
                    definition.options()?,
                    output_dir.to_path_buf(),
                )))
            }
            "laser" => {
                let laser_id = resolve("laser")?;
                let laser = registry
                    .get_laser(&laser_id)
                    .ok_or_else(|| missing("laser", &laser_id, "SimpleLaser"))?;
                let counter_id = resolve("counter")?;
                let counter = registry
                    .get_counter(&counter_id)
                    .ok_or_else(|| missing("counter", &counter_id, "SlowCounter"))?;
                LogicModule::Laser(Arc::new(LaserLogic::new(
                    id,
                    laser,
                    counter,
                    definition.options()?,
                    output_dir.to_path_buf(),
                )))
            }
            "scanner" => {
                let target = resolve("spm")?;
                let spm = registry
                    .get_line_scanner(&target)
                    .ok_or_else(|| missing("spm", &target, "LineScanner"))?;
                let mut logic = ScannerLogic::new(id, spm);
                if definition.connect.contains_key("stage_x") {
                    let (x, y, c) = (resolve("stage_x")?, resolve("stage_y")?, resolve("counter")?);
                    let stage_x = registry.get_movable(&x).ok_or_else(|| missing("stage_x", &x, "Movable"))?;
                    let stage_y = registry.get_movable(&y).ok_or_else(|| missing("stage_y", &y, "Movable"))?;
                    let counter = registry
                        .get_counter(&c)
                        .ok_or_else(|| missing("counter", &c, "SlowCounter"))?;
                    logic = logic.with_point_scanner(stage_x, stage_y, counter);
                }
                LogicModule::Scanner(Arc::new(logic))
            }
            "positioner" => {
                let target = resolve("motor")?;
                let motor = registry
                    .get_motor(&target)
                    .ok_or_else(|| missing("motor", &target, "Motor"))?;
                LogicModule::Positioner(Arc::new(PositionerLogic::new(id, motor)))
            }
            other => {
                return Err(DaqError::Configuration(format!(
                    "module '{}': unknown logic type '{}'",
                    id, other
                ))
                .into())
            }
        };
        Ok(module)
    }

    /// Lifecycle handle
    pub fn module(&self) -> Arc<dyn Module> {
        match self {
            LogicModule::Pid(m) => m.clone(),
            LogicModule::LevelSensor(m) => m.clone(),
            LogicModule::Laser(m) => m.clone(),
            LogicModule::Scanner(m) => m.clone(),
            LogicModule::Positioner(m) => m.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn linspace_includes_both_ends() {
        assert_eq!(linspace(1.0, 3.0, 3), vec![1.0, 2.0, 3.0]);
        assert_eq!(linspace(5.0, 9.0, 1), vec![5.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        let powers = linspace(1e-3, 22e-3, 17);
        assert_eq!(powers.len(), 17);
        assert!((powers[16] - 22e-3).abs() < 1e-15);
    }

    #[test]
    fn logic_modules_resolve_connectors() {
        let config = AppConfig::from_toml_str(
            r#"
            [application]
            name = "t"

            [[hardware]]
            id = "laser"
            type = "mock_laser"
            [[hardware]]
            id = "counter"
            type = "mock_counter"
            connect = { laser = "laser" }
            [[hardware]]
            id = "spm"
            type = "spm_sim"

            [[logic]]
            id = "laserlogic"
            type = "laser"
            connect = { laser = "laser", counter = "counter" }
            [[logic]]
            id = "afm"
            type = "scanner"
            connect = { spm = "spm" }
            [[logic]]
            id = "wrong"
            type = "pid"
            connect = { controller = "laser" }
            "#,
        )
        .unwrap();
        let registry = ModuleRegistry::from_config(&config).unwrap();
        let dir = std::env::temp_dir();

        let laser = LogicModule::from_definition(&config.logic[0], &registry, &dir).unwrap();
        assert_eq!(laser.module().name(), "laserlogic");
        assert!(matches!(
            LogicModule::from_definition(&config.logic[1], &registry, &dir).unwrap(),
            LogicModule::Scanner(_)
        ));
        let err = LogicModule::from_definition(&config.logic[2], &registry, &dir)
            .err()
            .unwrap();
        assert!(err.to_string().contains("PidController"));
    }
}
