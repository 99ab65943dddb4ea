//! Entry point for the solenoid drive system.
//!
//! Claims the process-wide serial-line lock, loads the options and element
//! maps, connects to the motor box (or its simulation), and runs the
//! position poller and duty-cycle governors until interrupted. The GUI,
//! interactive shell and resource monitor are separate collaborators; this
//! binary runs the core and prints position snapshots to the console.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use solenoid_drive::axis::{default_axis_table, AxisBank};
use solenoid_drive::client::DriveController;
use solenoid_drive::duty::{self, DutyGovernor, DutyWindow};
use solenoid_drive::elements::ElementRegistry;
use solenoid_drive::link::{SerialLink, SerialTransport, Transport, SIMULATOR_PORT};
use solenoid_drive::lock::ProcessLock;
use solenoid_drive::options::{OptionsStore, OptionValue};
use solenoid_drive::poller::{Poller, UPDATE_INTERVAL};
use solenoid_drive::sim::SimTransport;
use solenoid_drive::telemetry::{self, TelemetrySink};

/// Motor control for the solenoid spectrometer drive system.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Serial device of the motor box; pass "sim" to run against the
    /// built-in simulation.
    #[arg(short, long)]
    port: Option<String>,

    /// Options file controlling the drive system.
    #[arg(long, value_name = "file")]
    options_file: Option<PathBuf>,

    /// Periodically print CPU, memory and thread usage.
    #[arg(short, long)]
    monitor: bool,

    /// Draw the GUI collaborator in dark mode.
    #[arg(short, long)]
    dark_mode: bool,

    /// Run without the GUI collaborator.
    #[arg(long)]
    no_gui: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // Nothing touches the serial device before the lock is ours.
    let lock = match ProcessLock::acquire() {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let options = match load_options(&cli) {
        Ok(options) => options,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    let elements = match load_elements(&options) {
        Ok(elements) => elements,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(3);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(&options, elements));
    drop(lock);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Build the options store: declared defaults, then the file, then the
/// command-line overrides.
fn load_options(cli: &Cli) -> anyhow::Result<OptionsStore> {
    let mut options = OptionsStore::new();

    if let Some(port) = &cli.port {
        options.set_value("SerialPort", OptionValue::Str(port.clone()));
    }
    if let Some(path) = &cli.options_file {
        options.set_value(
            "OptionsFile",
            OptionValue::Str(path.display().to_string()),
        );
    }
    options.set_value("MonitorResources", OptionValue::Bool(cli.monitor));
    options.set_value("DarkMode", OptionValue::Bool(cli.dark_mode));
    options.set_value("NoGUI", OptionValue::Bool(cli.no_gui));

    let path = options
        .get_str("OptionsFile")
        .map(PathBuf::from)
        .context("no options file path")?;
    options.load_file(&path)?;

    // Command-line values win over anything the file set.
    if let Some(port) = &cli.port {
        options.set_value("SerialPort", OptionValue::Str(port.clone()));
    }

    options.ensure_required()?;
    options.log_all();
    Ok(options)
}

fn load_elements(options: &OptionsStore) -> anyhow::Result<ElementRegistry> {
    let mut elements = ElementRegistry::new();
    let label_path = options
        .get_str("2DLadderLabelMapPath")
        .map(PathBuf::from)
        .context("no label map path")?;
    elements.load_labels(&label_path)?;
    let coord_path = options
        .get_str("2DLadderEncoderPositionMapPath")
        .map(PathBuf::from)
        .context("no encoder position map path")?;
    elements
        .load_coordinates(&coord_path)
        .context("cannot load the element coordinate map; nothing can be moved with confidence")?;
    Ok(elements)
}

async fn run(options: &OptionsStore, elements: ElementRegistry) -> anyhow::Result<()> {
    // The registry anchors every named move; surface the configured
    // reference points so a bad map is obvious in the log.
    for key in ["TargetLadderReferencePointID", "BeamBlockerReferencePointID"] {
        if let Some(reference) = options.get_str(key) {
            let (horizontal, vertical) = elements.coords(reference);
            info!(
                "{key}: {} ({reference}) at ({horizontal}, {vertical})",
                elements.label(reference)
            );
        }
    }

    let port = options.get_str("SerialPort").unwrap_or(SIMULATOR_PORT);

    let transport: Box<dyn Transport> = if port == SIMULATOR_PORT {
        info!("running against the built-in motor box simulation");
        Box::new(SimTransport::new())
    } else {
        Box::new(SerialTransport::new(port))
    };
    let link = SerialLink::new(transport);
    link.open().await.context("cannot open the serial link")?;

    // Telemetry only makes sense against the real box.
    let telemetry = if link.is_simulated() {
        info!("telemetry push disabled: not talking to the real motor box");
        None
    } else {
        options
            .get_str("TelemetryAuthentication")
            .map(PathBuf::from)
            .and_then(|path| telemetry::read_auth_file(&path))
            .map(TelemetrySink::spawn)
    };

    let disabled: Vec<u8> = options
        .get_int_list("DisabledAxes")
        .into_iter()
        .map(|axis| axis as u8)
        .collect();
    let axes = AxisBank::new(default_axis_table(), &disabled)?;
    let experimental_mode = options.get_bool("ExperimentalMode").unwrap_or(true);
    let client = Arc::new(DriveController::new(
        link.clone(),
        axes,
        experimental_mode,
        telemetry,
    ));

    // Duty-cycle governors for the configured axes.
    let mut governors = Vec::new();
    let governed: Vec<u8> = options
        .get_int_list("DutyCycleAxes")
        .into_iter()
        .map(|axis| axis as u8)
        .collect();
    if !governed.is_empty() {
        let force = options.get_f64("MotorForce").unwrap_or(f64::MAX);
        let environment = options.get_str("Environment").unwrap_or("vacuum").to_string();
        match duty::params_for(force, &environment) {
            Some(params) => {
                for axis in governed {
                    if !client.axes().contains(axis) {
                        warn!("DutyCycleAxes names axis {axis}, which does not exist");
                        continue;
                    }
                    let window = Arc::new(DutyWindow::new(params));
                    client.register_duty_window(axis, window.clone());
                    governors.push(DutyGovernor::spawn(axis, window, client.clone()));
                }
            }
            None => info!("duty-cycle load allows unlimited running; no governors started"),
        }
    }

    if options.get_bool("MonitorResources").unwrap_or(false) {
        info!("resource monitoring is handled by the external monitor collaborator");
    }
    if !options.get_bool("NoGUI").unwrap_or(false) {
        info!("no GUI in this binary; running headless (the GUI collaborator subscribes to snapshots)");
    }

    let poller = Poller::spawn(client.clone(), UPDATE_INTERVAL);

    // Print each snapshot the way the control-room console expects it:
    // one row per tick, disabled axes starred.
    let mut snapshots = poller.subscribe();
    let printer_client = client.clone();
    let printer = tokio::spawn(async move {
        loop {
            let snapshot = match snapshots.recv().await {
                Ok(snapshot) => snapshot,
                // Fell behind; skip to the freshest snapshot.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let row: Vec<String> = snapshot
                .positions
                .iter()
                .enumerate()
                .map(|(index, position)| {
                    let axis = index as u8 + 1;
                    if printer_client.axes().is_enabled(axis) {
                        format!("{position:>7}")
                    } else {
                        format!("{position:>6}*")
                    }
                })
                .collect();
            info!("[ {} ]", row.join(","));
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for ctrl-c")?;
    info!("shutting down");

    // Reverse start order: governors, poller, printer, link.
    for governor in governors {
        governor.shutdown().await;
    }
    poller.shutdown().await;
    printer.abort();
    link.close().await?;

    // Give the telemetry sink a moment to drain.
    if let Ok(mut client) = Arc::try_unwrap(client).map_err(|_| ()) {
        client.shutdown_telemetry().await;
    } else {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("BYE");
    Ok(())
}
