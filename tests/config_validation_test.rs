//! The shipped configuration loads, validates and wires up.

use daq_modules::config::AppConfig;
use daq_modules::hardware::registry::{Capability, ModuleRegistry};
use daq_modules::logic::LogicModule;
use serial_test::serial;
use std::path::PathBuf;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/daq_modules.toml")
}

#[test]
#[serial]
fn shipped_config_is_valid() {
    let config = AppConfig::load_from(shipped_config()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.application.name, "Cryo AFM");

    let registry = ModuleRegistry::from_config(&config).unwrap();
    assert_eq!(registry.len(), config.enabled_hardware().count());
    assert!(!registry.contains("opus"));
    assert_eq!(registry.modules_with_capability(Capability::PidController), vec!["tempcontroller"]);
    assert_eq!(registry.modules_with_capability(Capability::Awg), vec!["awg"]);
}

#[test]
#[serial]
fn every_logic_module_resolves() {
    let config = AppConfig::load_from(shipped_config()).unwrap();
    let registry = ModuleRegistry::from_config(&config).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let kinds: Vec<&str> = config
        .enabled_logic()
        .map(|definition| {
            match LogicModule::from_definition(definition, &registry, dir.path()).unwrap() {
                LogicModule::Pid(_) => "pid",
                LogicModule::LevelSensor(_) => "level_sensor",
                LogicModule::Laser(_) => "laser",
                LogicModule::Scanner(_) => "scanner",
                LogicModule::Positioner(_) => "positioner",
            }
        })
        .collect();
    assert_eq!(kinds, vec!["laser", "pid", "level_sensor", "scanner", "positioner"]);
}

#[test]
#[serial]
fn environment_overrides_file() {
    std::env::set_var("DAQ_MODULES_APPLICATION__LOG_LEVEL", "debug");
    let config = AppConfig::load_from(shipped_config());
    std::env::remove_var("DAQ_MODULES_APPLICATION__LOG_LEVEL");

    assert_eq!(config.unwrap().application.log_level, "debug");
}

#[test]
fn broken_wiring_is_reported() {
    let config = AppConfig::from_toml_str(
        r#"
        [application]
        name = "broken"

        [[hardware]]
        id = "laser"
        type = "mock_laser"

        [[logic]]
        id = "laserlogic"
        type = "laser"
        connect = { laser = "laser", counter = "missing" }
        "#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("missing"));
}
