//! CLI Entry Point for scope-oiler
//!
//! Provides a command-line front-end for:
//! - Inspecting and editing the settings file
//! - Finding and checking the oiler
//! - Running the low-to-high and re-oil procedures
//!
//! # Usage
//!
//! Oil and switch to the objective at turret position 4:
//! ```bash
//! scope-oiler low-to-high --target 4
//! ```
//!
//! Try everything without hardware:
//! ```bash
//! scope-oiler --simulate re-oil
//! ```
//!
//! Ctrl+C during a procedure stops it at the next step boundary; a dispense or stage
//! move that has already started always completes.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use scope_oiler::app::Orchestrator;
use scope_oiler::config::{Settings, DEFAULT_SETTINGS_FILE};
use scope_oiler::hardware::instrument::InstrumentOptions;
use scope_oiler::hardware::oiler::{PeripheralOptions, WirelessAdapter};
use scope_oiler::hardware::simulated::{SimulatedController, SimulatedOiler};
use scope_oiler::logging::{self, LoggingConfig, OutputFormat};
use scope_oiler::messages::RunEvent;
use scope_oiler::error::OilerError;
use scope_oiler::procedures::ProcedureKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "scope-oiler")]
#[command(about = "Oil a microscope objective with the wireless oiler", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// trace, debug, info, warn or error (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    /// pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Use an in-process controller and oiler instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective settings
    ShowConfig,

    /// Store the wireless address of an oiler
    Remember { identity: String, address: String },

    /// Scan for an oiler (the selected one by default) and remember its address
    Scan { identity: Option<String> },

    /// Connect to the oiler and report its battery
    Battery,

    /// Oil, then switch to the target objective
    LowToHigh {
        /// Turret position to finish on
        #[arg(long)]
        target: u32,
    },

    /// Oil, then return to the current objective
    ReOil,

    /// Drop the stage by the configured distance
    LowerStage,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(LoggingConfig::new(cli.log_level).with_format(cli.log_format))?;

    match cli.command {
        Commands::ShowConfig => {
            let settings = Settings::load(&cli.config)?;
            println!("📄 {}", cli.config.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Remember { identity, address } => {
            let settings = Settings::load(&cli.config)?.remember_peripheral(&identity, &address);
            settings.save(&cli.config)?;
            println!("✅ Remembered {} at {}", identity.to_ascii_uppercase(), address);
            Ok(())
        }
        command => run_with_devices(&cli.config, cli.simulate, command).await,
    }
}

async fn run_with_devices(config: &Path, simulate: bool, command: Commands) -> Result<()> {
    let mut settings = Settings::load(config)?;
    let mut settings_path = config.to_path_buf();

    // Keep the simulators (and the scratch settings dir) alive for the whole command
    let mut _controller = None;
    let mut _scratch = None;
    let adapter: Arc<dyn WirelessAdapter> = if simulate {
        println!("🔧 Starting simulated controller and oiler...");
        let controller = SimulatedController::start(1).await?;
        settings.instrument = controller.endpoint();

        let identity = settings.peripheral.identity.clone();
        let address = settings
            .known_address(&identity)
            .map(str::to_string)
            .unwrap_or_else(|| format!("SIM:{identity}"));
        let oiler = SimulatedOiler::new();
        oiler.advertise(&identity, &address).await;

        let scratch = tempfile::tempdir()?;
        settings_path = scratch.path().join(DEFAULT_SETTINGS_FILE);
        _controller = Some(controller);
        _scratch = Some(scratch);
        Arc::new(oiler)
    } else {
        hardware_adapter()?
    };

    let orchestrator = Orchestrator::with_options(
        settings_path,
        settings,
        adapter,
        InstrumentOptions::default(),
        PeripheralOptions::default(),
    )?;

    let result = execute(&orchestrator, command).await;
    orchestrator.shutdown().await;
    result
}

#[cfg(feature = "ble")]
fn hardware_adapter() -> Result<Arc<dyn WirelessAdapter>> {
    Ok(Arc::new(scope_oiler::hardware::oiler::ble::BluestAdapter::new()))
}

#[cfg(not(feature = "ble"))]
fn hardware_adapter() -> Result<Arc<dyn WirelessAdapter>> {
    bail!("built without Bluetooth support; rebuild with `--features ble` or pass --simulate")
}

async fn execute(orchestrator: &Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Scan { identity } => {
            let identity =
                identity.unwrap_or_else(|| orchestrator.settings().peripheral.identity.clone());
            println!("📡 Scanning for OILBOY_{}...", identity.to_ascii_uppercase());
            let resolved = orchestrator.peripheral().scan(&identity).await?;
            let next = orchestrator
                .settings()
                .remember_peripheral(&resolved.identity, &resolved.address);
            orchestrator.save_settings(next).await?;
            println!("✅ Found {} at {}", resolved.identity, resolved.address);
            Ok(())
        }
        Commands::Battery => {
            connect_oiler(orchestrator).await?;
            let reading = orchestrator.query_battery().await?;
            let source = if reading.on_usb_power { "USB" } else { "battery" };
            println!("🔋 {:.2} V ({})", reading.voltage, source);
            Ok(())
        }
        Commands::LowerStage => {
            orchestrator.connect_instrument().await?;
            orchestrator.lower_stage().await?;
            println!(
                "✅ Stage lowered by {} µm",
                orchestrator.settings().operation.default_z_drop_microns
            );
            Ok(())
        }
        Commands::LowToHigh { target } => {
            run_procedure(
                orchestrator,
                ProcedureKind::LowToHigh {
                    target_objective: target,
                },
            )
            .await
        }
        Commands::ReOil => run_procedure(orchestrator, ProcedureKind::ReOil).await,
        Commands::ShowConfig | Commands::Remember { .. } => Ok(()),
    }
}

async fn connect_oiler(orchestrator: &Orchestrator) -> Result<()> {
    let resolved = orchestrator.connect_peripheral(None).await?;
    if resolved.discovered {
        println!("📌 Remembered {} at {}", resolved.identity, resolved.address);
    }
    println!("✅ Oiler {} connected", resolved.identity);
    Ok(())
}

async fn run_procedure(orchestrator: &Orchestrator, kind: ProcedureKind) -> Result<()> {
    println!("🔌 Connecting to controller...");
    orchestrator.connect_instrument().await?;
    connect_oiler(orchestrator).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handle = orchestrator.start_procedure(kind, Some(tx))?;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    println!("▶️  Running {} (Ctrl+C to stop at the next step)", kind);
    let run = loop {
        tokio::select! {
            finished = &mut handle => break finished?,
            _ = tokio::signal::ctrl_c() => {
                if orchestrator.cancel() {
                    println!("⏹️  Stopping after the current step...");
                }
            }
        }
    };
    let _ = printer.await;

    match run.outcome.to_result() {
        Ok(()) => {
            println!("✅ Procedure finished in {} ms", run.elapsed().num_milliseconds());
            Ok(())
        }
        Err(OilerError::Aborted) => {
            eprintln!("⏹️  Procedure {}", run.outcome);
            Err(OilerError::Aborted.into())
        }
        Err(e) => {
            eprintln!("❌ Procedure {}", run.outcome);
            eprintln!("   Check the microscope before retrying.");
            Err(e.into())
        }
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Started { run_id, .. } => println!("   run {}", run_id),
        RunEvent::StepStarted { step, name } => println!("   [{}/6] {}...", step, name),
        RunEvent::StepCompleted { step, name } => println!("   [{}/6] {} ✓", step, name),
        RunEvent::StepFailed {
            step, name, reason, ..
        } => eprintln!("   [{}/6] {} ✗ {}", step, name, reason),
        RunEvent::Finished { .. } => {}
    }
}
