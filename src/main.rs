//! CLI Entry Point for daq-modules
//!
//! Brings up the configured modules (or the simulated setup) and runs one
//! measurement:
//! - `validate`: check a configuration file and list its modules
//! - `saturation`: laser saturation curve
//! - `scan`: area scan on the line scanner
//! - `pid-log`: PID polling loop with file logging
//! - `awg-info`: AWG identification
//!
//! # Usage
//!
//! ```bash
//! daq-modules validate config/daq_modules.toml
//! daq-modules saturation --simulate --tag nv7
//! daq-modules pid-log --seconds 30
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_modules::config::{AppConfig, StorageConfig, DEFAULT_CONFIG_PATH};
use daq_modules::data::save_table;
use daq_modules::hardware::registry::{create_simulated_registry, Capability, ModuleRegistry};
use daq_modules::logic::{AreaScan, LogicModule, SaturationSettings};
use daq_modules::module::Module;
use daq_modules::tracing_setup::{self, LogSettings};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Logic wiring for the simulated registry.
const SIMULATED_LOGIC: &str = r#"
[application]
name = "simulated setup"

[[logic]]
id = "laserlogic"
type = "laser"
connect = { laser = "laser", counter = "counter" }

[[logic]]
id = "afm"
type = "scanner"
connect = { spm = "spm", stage_x = "stage_x", stage_y = "stage_y", counter = "counter" }

[[logic]]
id = "pidlogic"
type = "pid"
connect = { controller = "pid" }
config = { timestep = 0.2 }
"#;

#[derive(Parser)]
#[command(name = "daq-modules")]
#[command(about = "Instrument modules and measurement logic for a scanning NV setup", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-process simulated devices instead of the configured hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration, then list its modules
    Validate {
        /// Path to the TOML file (defaults to --config)
        path: Option<PathBuf>,
    },

    /// Record a laser saturation curve and save it
    Saturation {
        /// Tag inserted into the file name
        #[arg(long, default_value = "")]
        tag: String,

        /// Dwell per power step in seconds
        #[arg(long)]
        time_per_point: Option<f64>,

        /// Number of power steps
        #[arg(long)]
        points: Option<usize>,
    },

    /// Run an area scan and save it
    Scan {
        /// Tag inserted into the file name
        #[arg(long, default_value = "")]
        tag: String,

        /// Samples per line
        #[arg(long, default_value_t = 40)]
        points: usize,

        /// Number of rows
        #[arg(long, default_value_t = 40)]
        lines: usize,

        /// Duration of one line in seconds
        #[arg(long, default_value_t = 1.5)]
        line_time: f64,
    },

    /// Poll the PID controller and log it to file
    PidLog {
        /// How long to log
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Tag inserted into the file name
        #[arg(long, default_value = "")]
        tag: String,
    },

    /// Bring up the AWG and print its identification
    AwgInfo,
}

struct Setup {
    config: AppConfig,
    registry: ModuleRegistry,
    output_dir: PathBuf,
}

impl Setup {
    fn open(config_path: &Path, simulate: bool) -> Result<Self> {
        if simulate {
            let output_dir = AppConfig::load_from(config_path)
                .map(|c| c.storage.output_dir)
                .unwrap_or_else(|_| StorageConfig::default().output_dir);
            return Ok(Self {
                config: AppConfig::from_toml_str(SIMULATED_LOGIC)?,
                registry: create_simulated_registry()?,
                output_dir,
            });
        }

        let config = AppConfig::load_from(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        config.validate().map_err(|e| anyhow!(e))?;
        let registry = ModuleRegistry::from_config(&config)?;
        let output_dir = config.storage.output_dir.clone();
        Ok(Self {
            config,
            registry,
            output_dir,
        })
    }

    /// Activate the hardware and the first enabled logic module of `kind`.
    async fn logic(&self, kind: &str) -> Result<LogicModule> {
        let definition = self
            .config
            .enabled_logic()
            .find(|d| d.r#type == kind)
            .ok_or_else(|| anyhow!("no enabled logic module of type '{}'", kind))?;
        let logic = LogicModule::from_definition(definition, &self.registry, &self.output_dir)?;
        self.registry.activate_all().await?;
        logic.module().on_activate().await?;
        Ok(logic)
    }

    async fn shutdown(&self, logic: Option<&LogicModule>) {
        if let Some(logic) = logic {
            if let Err(e) = logic.module().on_deactivate().await {
                warn!(error = %e, "Logic deactivation failed");
            }
        }
        self.registry.deactivate_all().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match AppConfig::load_from(&cli.config) {
        Ok(config) => tracing_setup::init_from_config(&config),
        Err(_) => tracing_setup::init(LogSettings::default()),
    }
    .map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Validate { path } => validate(path.as_deref().unwrap_or(&cli.config)),
        Commands::Saturation {
            tag,
            time_per_point,
            points,
        } => {
            let setup = Setup::open(&cli.config, cli.simulate)?;
            // Simulated runs default to a quick dwell.
            let time_per_point = time_per_point.or(cli.simulate.then_some(0.05));
            let logic = setup.logic("laser").await?;
            let result = saturation(&logic, time_per_point, points, &tag).await;
            setup.shutdown(Some(&logic)).await;
            result
        }
        Commands::Scan {
            tag,
            points,
            lines,
            line_time,
        } => {
            let setup = Setup::open(&cli.config, cli.simulate)?;
            let scan = AreaScan {
                x_num: points,
                y_num: lines,
                time_forward: line_time,
                time_back: line_time,
                ..Default::default()
            };
            let logic = setup.logic("scanner").await?;
            let result = area_scan(&logic, &scan, &setup.output_dir, &tag).await;
            setup.shutdown(Some(&logic)).await;
            result
        }
        Commands::PidLog { seconds, tag } => {
            let setup = Setup::open(&cli.config, cli.simulate)?;
            let logic = setup.logic("pid").await?;
            let result = pid_log(&logic, Duration::from_secs(seconds), &tag).await;
            setup.shutdown(Some(&logic)).await;
            result
        }
        Commands::AwgInfo => {
            let setup = Setup::open(&cli.config, cli.simulate)?;
            let result = awg_info(&setup).await;
            setup.shutdown(None).await;
            result
        }
    }
}

fn validate(path: &Path) -> Result<()> {
    let config = AppConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    let registry = ModuleRegistry::from_config(&config)?;

    println!("Configuration '{}' is valid", config.application.name);
    println!("Hardware:");
    for module in registry.list_modules() {
        let capabilities: Vec<String> = module.capabilities.iter().map(|c| format!("{:?}", c)).collect();
        println!("  {:<16} {:<14} [{}]", module.id, module.module_type, capabilities.join(", "));
    }
    println!("Logic:");
    for definition in config.enabled_logic() {
        LogicModule::from_definition(definition, &registry, &config.storage.output_dir)?;
        let connections: Vec<String> = definition
            .connect
            .iter()
            .map(|(connector, target)| format!("{} -> {}", connector, target))
            .collect();
        println!("  {:<16} {:<14} {}", definition.id, definition.r#type, connections.join(", "));
    }
    Ok(())
}

async fn saturation(
    logic: &LogicModule,
    time_per_point: Option<f64>,
    points: Option<usize>,
    tag: &str,
) -> Result<()> {
    let LogicModule::Laser(laser) = logic else {
        return Err(anyhow!("not a laser logic module"));
    };
    let defaults = laser.default_saturation_settings();
    let settings = SaturationSettings {
        time_per_point: time_per_point.unwrap_or(defaults.time_per_point),
        num_points: points.unwrap_or(defaults.num_points),
        ..defaults
    };
    laser.on().await?;
    info!(
        points = settings.num_points,
        start_w = settings.start_power,
        stop_w = settings.stop_power,
        "Recording saturation curve"
    );
    laser.start_saturation_curve(settings)?;
    laser.wait_for_saturation_curve().await?;

    for point in laser.saturation_data() {
        println!(
            "{:>10.3} mW  {:>12.0} c/s  ± {:>8.0}",
            point.power * 1e3,
            point.fluorescence,
            point.stddev
        );
    }
    match laser.fit_saturation() {
        Ok(fit) => println!(
            "Fit: I_sat {:.0} c/s  P_sat {:.3} mW  background {:.0} c/s + {:.0} c/s/mW",
            fit.i_sat,
            fit.p_sat * 1e3,
            fit.offset,
            fit.slope * 1e-3
        ),
        Err(e) => warn!(error = %e, "No saturation fit"),
    }
    if let Some(path) = laser.save_saturation_data(tag)? {
        println!("Saved {}", path.display());
    }
    Ok(())
}

async fn area_scan(logic: &LogicModule, scan: &AreaScan, output_dir: &Path, tag: &str) -> Result<()> {
    let LogicModule::Scanner(scanner) = logic else {
        return Err(anyhow!("not a scanner logic module"));
    };
    let params = scanner.create_meas_params(&scan.params);
    let image = scanner.scan_area(scan).await?;
    let rows: Vec<Vec<f64>> = image
        .iter()
        .map(|line| line.iter().map(|&v| f64::from(v)).collect())
        .collect();
    let columns: Vec<&str> = params.iter().map(String::as_str).collect();
    let path = save_table(
        output_dir,
        tag,
        "area_scan",
        &[
            ("Plane", scan.plane.clone()),
            ("X range (um)", format!("{} {}", scan.x_start, scan.x_stop)),
            ("Y range (um)", format!("{} {}", scan.y_start, scan.y_stop)),
            ("Points per line", scan.x_num.to_string()),
            ("Path", format!("{:?}", scan.path)),
        ],
        &columns,
        &rows,
    )?;
    println!("Scanned {} lines, saved {}", rows.len(), path.display());
    Ok(())
}

async fn pid_log(logic: &LogicModule, duration: Duration, tag: &str) -> Result<()> {
    let LogicModule::Pid(pid) = logic else {
        return Err(anyhow!("not a PID logic module"));
    };
    let path = pid.start_saving(tag).await?;
    pid.set_enabled(true);
    info!(seconds = duration.as_secs(), path = %path.display(), "PID logging");
    tokio::time::sleep(duration).await;
    pid.set_enabled(false);
    println!(
        "PV {:.4}  SP {:.4}  CV {:.4}",
        pid.get_pv(),
        pid.get_sp(),
        pid.get_cv()
    );
    if let Some(path) = pid.stop_saving()? {
        println!("Saved {}", path.display());
    }
    Ok(())
}

async fn awg_info(setup: &Setup) -> Result<()> {
    let id = setup
        .registry
        .modules_with_capability(Capability::Awg)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no AWG configured"))?;
    let awg = setup
        .registry
        .get_awg(&id)
        .ok_or_else(|| anyhow!("module '{}' is not an AWG", id))?;
    setup.registry.activate_all().await?;
    let info = awg.info()?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
