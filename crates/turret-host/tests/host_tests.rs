//! End-to-end tests: the full mock stack behind the arbiter, the idle
//! watchdog, the joystick mapping, and the operator control socket.

use gpio_hal::{GpioBackend, Level, MockGpio};
use laser::{LaserLimits, LaserOutput, LaserSafetyController};
use motion::{AxisConfig, Direction, StepperAxis};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tracking::{Axis, Calibration, TrackerConfig, TrackingController};
use turret_host::arbiter::{ArbiterHandle, CommandArbiter};
use turret_host::command::{Command, CommandOutcome};
use turret_host::control_socket::{run_control_socket, SnapshotFn};
use turret_host::remote::{apply_sample, parse_joystick_line, RemoteSettings};
use turret_host::telemetry::{self, ErrorLog, TelemetrySnapshot};

const X_STEP: u8 = 2;
const X_ENABLE: u8 = 4;
const LASER_PIN: u8 = 18;

fn axis_config(name: &str, base: u8) -> AxisConfig {
    AxisConfig {
        name: name.into(),
        step_pin: base,
        dir_pin: base + 1,
        enable_pin: base + 2,
        cw_limit_pin: base + 3,
        ccw_limit_pin: base + 4,
        microstep_pins: None,
        steps_per_rev: 200,
        microsteps: 4,
        step_delay_s: 0.0005,
        acceleration_steps: 2,
        backoff_steps: 4,
        home_timeout: Duration::from_secs(10),
    }
}

fn defaults() -> Calibration {
    Calibration {
        x_steps_per_pixel: 0.1,
        y_steps_per_pixel: 0.1,
        dead_zone_pixels: 20,
        x_max_steps_from_home: 500,
        y_max_steps_from_home: 500,
        kp: 1.0,
        ki: 0.0,
        kd: 0.0,
        recenter_on_loss: false,
    }
}

struct Stack {
    gpio: Arc<MockGpio>,
    tracker: Arc<TrackingController>,
    laser: Arc<LaserSafetyController>,
    errors: Arc<ErrorLog>,
}

fn components() -> Stack {
    let gpio = Arc::new(MockGpio::new());
    let x = Arc::new(
        StepperAxis::new(gpio.clone() as Arc<dyn GpioBackend>, axis_config("x", X_STEP)).unwrap(),
    );
    let y = Arc::new(
        StepperAxis::new(gpio.clone() as Arc<dyn GpioBackend>, axis_config("y", 7)).unwrap(),
    );
    let tracker = TrackingController::spawn(
        x,
        y,
        TrackerConfig {
            step_delay_s: 0.0005,
            loss_timeout: Duration::from_secs(5),
            home_recenter_rate: 0,
            defaults: defaults(),
            calibration_path: None,
        },
    )
    .unwrap();
    let output = LaserOutput::new(gpio.as_ref(), LASER_PIN, 1000.0, 100).unwrap();
    let laser = Arc::new(LaserSafetyController::new(
        output,
        LaserLimits {
            cooldown: Duration::from_millis(100),
            default_pulse: Duration::from_millis(30),
            max_pulse: Duration::from_secs(5),
        },
    ));
    Stack {
        gpio,
        tracker,
        laser,
        errors: Arc::new(ErrorLog::new()),
    }
}

/// Spawns the arbiter over the stack and returns its handle.
fn running(stack: &Stack, idle_timeout: Duration) -> ArbiterHandle {
    let (handle, arbiter) = CommandArbiter::new(
        stack.tracker.clone(),
        stack.laser.clone(),
        stack.errors.clone(),
        idle_timeout,
    );
    tokio::spawn(arbiter.run());
    handle
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn jog_through_the_arbiter_moves_the_axis() {
    let stack = components();
    let handle = running(&stack, Duration::from_secs(60));

    let outcome = handle
        .submit(Command::Jog {
            axis: Axis::X,
            steps: 10,
            direction: Direction::Cw,
        })
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
    stack.tracker.flush().await;
    assert_eq!(stack.tracker.telemetry().x.position, 10);
}

#[tokio::test]
async fn safety_commands_overtake_buffered_traffic() {
    let stack = components();
    stack.laser.arm(true).unwrap();
    stack.laser.set_power(50);

    // Buffer a fire on the general lane and a disarm on the safety lane
    // before the consumer starts: the disarm must win.
    let (handle, arbiter) = CommandArbiter::new(
        stack.tracker.clone(),
        stack.laser.clone(),
        stack.errors.clone(),
        Duration::from_secs(60),
    );
    assert!(handle.post(Command::LaserFire { duration_ms: 40 }));
    assert!(handle.post(Command::LaserArm(false)));
    tokio::spawn(arbiter.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!stack.laser.armed());
    assert_eq!(stack.laser.status().fire_count, 0);
    let report = stack.errors.last().expect("the fire rejection is recorded");
    assert!(report.message.contains("laser_fire"), "{report:?}");
}

#[tokio::test]
async fn idle_watchdog_releases_hardware_and_input_restores_it() {
    let stack = components();
    let handle = running(&stack, Duration::from_millis(200));

    assert!(handle.submit(Command::LaserArm(true)).await.is_ok());
    assert!(handle
        .submit(Command::Jog {
            axis: Axis::X,
            steps: 5,
            direction: Direction::Cw,
        })
        .await
        .is_ok());
    stack.tracker.flush().await;
    assert_eq!(stack.tracker.telemetry().x.position, 5);

    // Silence: the watchdog releases the drivers and disarms the laser.
    let gpio = stack.gpio.clone();
    wait_for("idle suspension", move || {
        gpio.level(X_ENABLE) == Some(Level::High)
    })
    .await;
    assert!(!stack.laser.armed());

    // The next command re-enables before the motion runs.
    let outcome = handle
        .submit(Command::Jog {
            axis: Axis::X,
            steps: 5,
            direction: Direction::Cw,
        })
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
    stack.tracker.flush().await;
    assert_eq!(stack.tracker.telemetry().x.position, 10);
    assert_eq!(stack.gpio.level(X_ENABLE), Some(Level::Low));
}

#[tokio::test]
async fn joystick_samples_map_to_jogs_and_edge_triggered_fire() {
    let stack = components();
    let handle = running(&stack, Duration::from_secs(60));
    let settings = RemoteSettings {
        host: "localhost".into(),
        port: 1883,
        topic: "turret/joystick".into(),
        client_id: "test".into(),
        deadzone: 5,
        speed_scaling: 0.10,
        max_steps_per_update: 50,
    };
    let mut prev_btn = false;

    let sample = parse_joystick_line("50,-30,false,false,0").unwrap();
    apply_sample(&sample, &settings, &handle, &stack.laser, &mut prev_btn);

    let tracker = stack.tracker.clone();
    wait_for("joystick jogs", move || {
        let t = tracker.telemetry();
        t.x.position == 2 && t.y.position == -1
    })
    .await;

    // Rising fire button while armed: one default pulse at the sample's
    // power. Holding the button does not re-fire.
    stack.laser.arm(true).unwrap();
    let firing = parse_joystick_line("0,0,false,true,60").unwrap();
    apply_sample(&firing, &settings, &handle, &stack.laser, &mut prev_btn);
    let laser = stack.laser.clone();
    wait_for("fire", move || laser.status().fire_count == 1).await;
    assert_eq!(stack.laser.status().power_pct, 60);

    apply_sample(&firing, &settings, &handle, &stack.laser, &mut prev_btn);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stack.laser.status().fire_count, 1);
}

#[tokio::test]
async fn overlapping_fire_submissions_get_an_honest_busy() {
    let stack = components();
    let handle = running(&stack, Duration::from_secs(60));

    assert!(handle.submit(Command::LaserArm(true)).await.is_ok());
    assert!(handle
        .submit(Command::LaserSetPower { pct: 40 })
        .await
        .is_ok());

    // The laser is reserved before the first reply goes out, so the second
    // submission is rejected instead of silently losing its shot.
    let first = handle.submit(Command::LaserFire { duration_ms: 300 }).await;
    assert!(first.is_ok(), "{first:?}");
    let second = handle.submit(Command::LaserFire { duration_ms: 300 }).await;
    match second {
        CommandOutcome::Rejected(reason) => assert!(reason.contains("busy"), "{reason}"),
        other => panic!("expected a busy rejection, got {other:?}"),
    }

    let laser = stack.laser.clone();
    wait_for("first fire to finish", move || {
        laser.status().fire_count == 1
    })
    .await;
}

#[tokio::test]
async fn control_socket_round_trips_commands_and_status() {
    let stack = components();
    let handle = running(&stack, Duration::from_secs(60));

    let path = format!("/tmp/turret-test-{}", rand::random::<u32>());
    let snapshot: SnapshotFn = {
        let tracker = stack.tracker.clone();
        let laser = stack.laser.clone();
        let errors = stack.errors.clone();
        Arc::new(move || telemetry::snapshot(&tracker, &laser, &errors))
    };
    let (telemetry_tx, _) = broadcast::channel::<TelemetrySnapshot>(16);
    let socket_path = path.clone();
    tokio::spawn(async move {
        let _ = run_control_socket(socket_path, handle, snapshot, telemetry_tx).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = UnixStream::connect(&path).await.unwrap();
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"jog x 5\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim(), "ok");

    line.clear();
    writer.write_all(b"status\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert!(value["tracker"]["x"]["position"].is_number());
    assert_eq!(value["laser"]["armed"], serde_json::Value::Bool(false));

    line.clear();
    writer.write_all(b"warp 9\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.trim().starts_with("rejected:"), "{line}");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn error_log_sequence_numbers_increase() {
    let errors = ErrorLog::new();
    errors.record("first");
    let first = errors.last().unwrap();
    errors.record("second");
    let second = errors.last().unwrap();
    assert_eq!(first.seq, 1);
    assert_eq!(second.seq, 2);
    assert_eq!(second.message, "second");
}
