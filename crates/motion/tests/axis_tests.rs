//! Behavioral tests for `StepperAxis` against the mock GPIO backend.

use gpio_hal::{GpioBackend, Level, MockGpio};
use motion::{AxisConfig, AxisStatus, CancelToken, Direction, FaultKind, StepperAxis, Termination};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STEP: u8 = 2;
const DIR: u8 = 3;
const ENABLE: u8 = 4;
const CW_LIMIT: u8 = 5;
const CCW_LIMIT: u8 = 6;

fn axis_config(step_delay_s: f64) -> AxisConfig {
    AxisConfig {
        name: "x".into(),
        step_pin: STEP,
        dir_pin: DIR,
        enable_pin: ENABLE,
        cw_limit_pin: CW_LIMIT,
        ccw_limit_pin: CCW_LIMIT,
        microstep_pins: Some([7, 8, 9]),
        steps_per_rev: 200,
        microsteps: 8,
        step_delay_s,
        acceleration_steps: 4,
        backoff_steps: 10,
        home_timeout: Duration::from_secs(10),
    }
}

fn setup(step_delay_s: f64) -> (Arc<MockGpio>, Arc<StepperAxis>) {
    let gpio = Arc::new(MockGpio::new());
    let axis = Arc::new(
        StepperAxis::new(gpio.clone() as Arc<dyn GpioBackend>, axis_config(step_delay_s)).unwrap(),
    );
    axis.enable().unwrap();
    (gpio, axis)
}

#[test]
fn position_tracks_pulses_in_both_directions() {
    let (gpio, axis) = setup(0.0005);
    let cancel = CancelToken::new();

    let out = axis.step(Direction::Cw, 30, 0.0005, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 30);
    assert_eq!(out.termination, Termination::Completed);

    let out = axis.step(Direction::Ccw, 12, 0.0005, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 12);

    assert_eq!(axis.position(), 18);
    assert_eq!(gpio.pulse_count(STEP), 42);
    assert_eq!(axis.status(), AxisStatus::Idle);
    assert_eq!(axis.last_direction(), Some(Direction::Ccw));
}

#[test]
fn negative_count_is_rejected() {
    let (_gpio, axis) = setup(0.0005);
    assert!(axis
        .step(Direction::Cw, -1, 0.0005, &CancelToken::new())
        .is_err());
}

#[test]
fn stepping_a_released_axis_is_refused() {
    let (gpio, axis) = setup(0.0005);
    axis.release().unwrap();
    assert!(axis
        .step(Direction::Cw, 5, 0.0005, &CancelToken::new())
        .is_err());
    assert_eq!(gpio.pulse_count(STEP), 0);
}

#[test]
fn latched_limit_blocks_direction_until_motion_reverses() {
    let (gpio, axis) = setup(0.0005);
    let cancel = CancelToken::new();

    gpio.set_input(CW_LIMIT, Level::Low);
    gpio.settle();
    assert_eq!(axis.triggered_limit(), Some(Direction::Cw));

    // Every CW request is refused without a pulse.
    for _ in 0..3 {
        let out = axis.step(Direction::Cw, 50, 0.0005, &cancel).unwrap();
        assert_eq!(out.steps_emitted, 0);
        assert_eq!(out.termination, Termination::LimitHit);
    }
    assert_eq!(axis.position(), 0);
    assert_eq!(gpio.pulse_count(STEP), 0);
    assert_eq!(axis.status(), AxisStatus::LimitReached(Direction::Cw));

    // Backing away clears the latch.
    gpio.set_input(CW_LIMIT, Level::High);
    let out = axis.step(Direction::Ccw, 5, 0.0005, &cancel).unwrap();
    assert_eq!(out.steps_emitted, 5);
    assert_eq!(axis.position(), -5);
    assert_eq!(axis.triggered_limit(), None);
    assert_eq!(axis.status(), AxisStatus::Idle);
}

#[test]
fn limit_edge_stops_a_move_in_flight() {
    let (gpio, axis) = setup(0.002);
    let cancel = CancelToken::new();

    let worker = {
        let axis = axis.clone();
        std::thread::spawn(move || axis.step(Direction::Cw, 200, 0.002, &cancel))
    };
    std::thread::sleep(Duration::from_millis(80));
    gpio.set_input(CW_LIMIT, Level::Low);

    let out = worker.join().unwrap().unwrap();
    assert_eq!(out.termination, Termination::LimitHit);
    assert!(out.steps_emitted > 0 && out.steps_emitted < 200);
    assert_eq!(axis.position(), out.steps_emitted as i64);
    assert_eq!(axis.status(), AxisStatus::LimitReached(Direction::Cw));
}

#[test]
fn cancellation_stops_between_pulses() {
    let (_gpio, axis) = setup(0.002);
    let cancel = CancelToken::new();

    let worker = {
        let axis = axis.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || axis.step(Direction::Ccw, 500, 0.002, &cancel))
    };
    std::thread::sleep(Duration::from_millis(60));
    cancel.cancel();

    let out = worker.join().unwrap().unwrap();
    assert_eq!(out.termination, Termination::Cancelled);
    assert!(out.steps_emitted < 500);
    assert_eq!(axis.position(), -(out.steps_emitted as i64));
    assert_eq!(axis.status(), AxisStatus::Idle);
}

#[test]
fn homing_measures_travel_and_centers() {
    // 5 ms per step so switch latching (poll + confirm read, ~1.2 ms)
    // settles well inside one step period.
    let (gpio, axis) = setup(0.005);
    let travel_end: i64 = 60;

    // Simulated end stops: active low while the axis sits at either end of
    // its travel.
    let running = Arc::new(AtomicBool::new(true));
    let sim = {
        let gpio = gpio.clone();
        let axis = axis.clone();
        let running = running.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let p = axis.position();
                gpio.set_input(
                    CCW_LIMIT,
                    if p <= 0 { Level::Low } else { Level::High },
                );
                gpio.set_input(
                    CW_LIMIT,
                    if p >= travel_end { Level::Low } else { Level::High },
                );
                std::thread::sleep(Duration::from_micros(100));
            }
        })
    };
    // Let the initial CCW latch land before homing starts.
    std::thread::sleep(Duration::from_millis(10));
    gpio.settle();

    let result = axis.home(&CancelToken::new());
    running.store(false, Ordering::Relaxed);
    sim.join().unwrap();

    result.unwrap();
    assert_eq!(axis.position(), 0);
    assert_eq!(axis.status(), AxisStatus::Idle);
    // Sweep ran from the back-off point (10) to the far stop (60).
    assert_eq!(axis.measured_travel(), travel_end - 10);
}

#[test]
fn homing_times_out_when_no_limit_ever_triggers() {
    let gpio = Arc::new(MockGpio::new());
    let mut cfg = axis_config(0.0005);
    cfg.home_timeout = Duration::from_millis(150);
    let axis = StepperAxis::new(gpio.clone() as Arc<dyn GpioBackend>, cfg).unwrap();
    axis.enable().unwrap();

    let err = axis.home(&CancelToken::new()).unwrap_err();
    assert!(matches!(err, motion::MotionError::HomeTimeout(_)));
    assert_eq!(axis.status(), AxisStatus::Fault(FaultKind::Timeout));
    // The driver is released on the way out.
    assert_eq!(gpio.level(ENABLE), Some(Level::High));
    assert!(!axis.is_enabled());
}

#[test]
fn set_home_here_zeroes_without_moving() {
    let (gpio, axis) = setup(0.0005);
    axis.step(Direction::Cw, 25, 0.0005, &CancelToken::new())
        .unwrap();
    let pulses = gpio.pulse_count(STEP);

    axis.set_home_here();
    assert_eq!(axis.position(), 0);
    assert_eq!(gpio.pulse_count(STEP), pulses);
}

#[test]
fn microstep_select_lines_follow_the_truth_table() {
    let gpio = Arc::new(MockGpio::new());
    let mut cfg = axis_config(0.0005);
    cfg.microsteps = 16;
    StepperAxis::new(gpio.clone() as Arc<dyn GpioBackend>, cfg).unwrap();
    assert_eq!(gpio.level(7), Some(Level::Low));
    assert_eq!(gpio.level(8), Some(Level::Low));
    assert_eq!(gpio.level(9), Some(Level::High));
}
