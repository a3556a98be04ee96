//! # Turret Host
//!
//! Motion and targeting core for a pan/tilt laser turret. The process wires
//! four subsystems together and runs them as concurrent tasks:
//!
//! *   Two stepper axes behind a single mover thread (the only place motor
//!     pulses are emitted).
//! *   A laser safety controller gating the PWM output.
//! *   A command arbiter fanning joystick, detector, and operator input into
//!     the mover and the laser, with safety commands taking priority.
//! *   A telemetry publisher and a line-based operator control socket.
//!
//! Video capture, detection backends, and the web UI live in separate
//! processes; they talk to this core through the control socket and the
//! detector bridge.

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gpio_hal::{GpioBackend, MockGpio, RpiGpio};
use laser::{LaserOutput, LaserSafetyController};
use motion::StepperAxis;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracking::{Axis, DetectorBridge, TrackingController};

use turret_host::arbiter::CommandArbiter;
use turret_host::command::Command;
use turret_host::config::TurretConfig;
use turret_host::control_socket::{self, SnapshotFn};
use turret_host::remote;
use turret_host::telemetry::{self, ErrorLog};

/// Motion and targeting core for a pan/tilt laser turret.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the turret core.
    Run(RunArgs),
    /// Validate the configuration file and print the resolved pin map.
    Check(CheckArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the turret configuration file.
    #[arg(short, long, default_value = "turret.cfg")]
    config_path: PathBuf,

    /// Run against the in-memory GPIO backend instead of real hardware.
    #[arg(long)]
    mock_gpio: bool,

    /// Path of the operator control socket.
    #[arg(long, default_value = "/tmp/turret")]
    socket_path: String,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Path to the turret configuration file.
    #[arg(short, long, default_value = "turret.cfg")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_server(args).await,
        Commands::Check(args) => check_config(args),
    }
}

fn check_config(args: CheckArgs) -> Result<()> {
    let config = TurretConfig::load(&args.config_path)?;
    println!("configuration ok");
    for (name, motor, cw, ccw) in [
        (
            "x",
            &config.motor_x,
            config.gpio.x_cw_limit_pin,
            config.gpio.x_ccw_limit_pin,
        ),
        (
            "y",
            &config.motor_y,
            config.gpio.y_cw_limit_pin,
            config.gpio.y_ccw_limit_pin,
        ),
    ] {
        println!(
            "motor {name}: step={} dir={} enable={} limits cw={cw} ccw={ccw} microsteps={}",
            motor.step_pin, motor.dir_pin, motor.enable_pin, motor.microsteps
        );
    }
    println!(
        "laser: pin={} max_power={}%",
        config.laser.pin, config.laser.max_power_pct
    );
    match &config.remote {
        Some(remote) => println!("remote: {}:{} topic {}", remote.host, remote.port, remote.topic),
        None => println!("remote: disabled"),
    }
    Ok(())
}

/// Initializes the hardware and runs all server components as concurrent
/// tasks until a shutdown signal arrives.
async fn run_server(args: RunArgs) -> Result<()> {
    info!("starting turret core");

    let config = TurretConfig::load(&args.config_path)
        .with_context(|| format!("loading configuration from {:?}", args.config_path))?;

    let gpio: Arc<dyn GpioBackend> = if args.mock_gpio {
        info!("using the mock gpio backend");
        Arc::new(MockGpio::new())
    } else {
        Arc::new(RpiGpio::new().context("opening the gpio chip")?)
    };

    let x = Arc::new(StepperAxis::new(gpio.clone(), config.axis_config(Axis::X))?);
    let y = Arc::new(StepperAxis::new(gpio.clone(), config.axis_config(Axis::Y))?);
    let output = LaserOutput::new(
        gpio.as_ref(),
        config.laser.pin,
        config.laser.pwm_freq_hz,
        config.laser.max_power_pct,
    )?;
    let laser = Arc::new(LaserSafetyController::new(output, config.laser_limits()));
    let tracker = TrackingController::spawn(x, y, config.tracker_config())?;
    info!("hardware initialized");

    let errors = Arc::new(ErrorLog::new());
    let (handle, arbiter) = CommandArbiter::new(
        tracker.clone(),
        laser.clone(),
        errors.clone(),
        config.idle_timeout(),
    );
    tokio::spawn(arbiter.run());

    // The detector bridge is the entry point handed to the capture
    // pipeline; it feeds the arbiter like any other producer and stays
    // alive for the process lifetime.
    let detector_handle = handle.clone();
    let _detector = Arc::new(DetectorBridge::new(
        config.tracking.frame_w,
        config.tracking.frame_h,
        Box::new(move |cx, cy, frame_w, frame_h, ts| {
            if !detector_handle.post(Command::TrackTarget {
                cx,
                cy,
                frame_w,
                frame_h,
                ts,
            }) {
                debug!("command lane full, dropping detector sample");
            }
        }),
    ));

    if let Some(settings) = config.remote_settings() {
        tokio::spawn(remote::run_remote_ingestor(
            settings,
            handle.clone(),
            laser.clone(),
        ));
        info!("remote ingestor started");
    } else {
        info!("no [remote] section, joystick ingestor disabled");
    }

    let telemetry_tx = telemetry::spawn_publisher(tracker.clone(), laser.clone(), errors.clone());

    let snapshot: SnapshotFn = {
        let tracker = tracker.clone();
        let laser = laser.clone();
        let errors = errors.clone();
        Arc::new(move || telemetry::snapshot(&tracker, &laser, &errors))
    };
    let socket_path = args.socket_path.clone();
    let socket_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) =
            control_socket::run_control_socket(socket_path, socket_handle, snapshot, telemetry_tx)
                .await
        {
            error!(error = %err, "control socket failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    shutdown(&tracker, &laser, gpio.as_ref());
    let _ = std::fs::remove_file(&args.socket_path);
    Ok(())
}

/// Tears the hardware down to a safe state: mover stopped, drivers
/// released, laser disarmed, every pin deasserted. Idempotent, so a signal
/// racing normal exit is harmless.
fn shutdown(tracker: &TrackingController, laser: &LaserSafetyController, gpio: &dyn GpioBackend) {
    tracker.shutdown();
    if let Err(err) = laser.arm(false) {
        error!(error = %err, "disarming laser at shutdown failed");
    }
    if let Err(err) = gpio.cleanup() {
        error!(error = %err, "gpio cleanup failed");
    }
    info!("hardware released");
}
