//! One motor: step/dir/enable lines plus two limit switches.

use gpio_hal::{Edge, GpioBackend, Level, Pin, PinMode, Pull};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{profile, CancelToken, MotionError};

/// Debounce window applied to both limit switches.
pub const LIMIT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Direction-line setup time before the first pulse.
const DIR_SETUP: Duration = Duration::from_micros(2);

/// Minimum width of the step pulse high phase.
const STEP_PULSE: Duration = Duration::from_micros(2);

/// Pulses emitted per homing sweep segment between limit/cancel checks.
const HOMING_CHUNK: u64 = 64;

/// Floor for the per-step wall-clock budget.
const STEP_BUDGET_FLOOR: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Direction {
    Cw,
    Ccw,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Cw => Direction::Ccw,
            Direction::Ccw => Direction::Cw,
        }
    }

    fn level(self) -> Level {
        match self {
            Direction::Cw => Level::High,
            Direction::Ccw => Level::Low,
        }
    }

    fn delta(self) -> i64 {
        match self {
            Direction::Cw => 1,
            Direction::Ccw => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FaultKind {
    Timeout,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AxisStatus {
    Idle,
    Moving,
    Homing,
    LimitReached(Direction),
    Fault(FaultKind),
}

/// How a pulse train ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    LimitHit,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    pub steps_emitted: u64,
    pub termination: Termination,
}

/// Immutable wiring and motion parameters for one axis.
#[derive(Debug, Clone)]
pub struct AxisConfig {
    pub name: String,
    pub step_pin: Pin,
    pub dir_pin: Pin,
    pub enable_pin: Pin,
    pub cw_limit_pin: Pin,
    pub ccw_limit_pin: Pin,
    /// M0/M1/M2 select lines; absent when the driver is configured over a
    /// serial bus.
    pub microstep_pins: Option<[Pin; 3]>,
    pub steps_per_rev: u32,
    pub microsteps: u8,
    /// Minimum inter-step delay in seconds.
    pub step_delay_s: f64,
    pub acceleration_steps: u32,
    /// Steps retreated from the first limit before the measuring sweep.
    pub backoff_steps: u32,
    pub home_timeout: Duration,
}

impl AxisConfig {
    fn validate(&self) -> Result<(), MotionError> {
        if self.steps_per_rev == 0 {
            return Err(MotionError::InvalidConfig(format!(
                "axis {}: steps_per_rev must be positive",
                self.name
            )));
        }
        if !matches!(self.microsteps, 1 | 2 | 4 | 8 | 16) {
            return Err(MotionError::InvalidConfig(format!(
                "axis {}: microsteps {} not one of 1/2/4/8/16",
                self.name, self.microsteps
            )));
        }
        if !(self.step_delay_s > 0.0) {
            return Err(MotionError::InvalidConfig(format!(
                "axis {}: step_delay_s must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// DRV8825 microstep-select truth table, [M0, M1, M2].
    fn microstep_levels(&self) -> [Level; 3] {
        match self.microsteps {
            2 => [Level::High, Level::Low, Level::Low],
            4 => [Level::Low, Level::High, Level::Low],
            8 => [Level::High, Level::High, Level::Low],
            16 => [Level::Low, Level::Low, Level::High],
            _ => [Level::Low, Level::Low, Level::Low],
        }
    }
}

/// A single stepper axis.
///
/// The `motion` mutex gives exactly one caller at a time the right to emit
/// pulses; position and status stay readable from other threads while a move
/// is in flight.
pub struct StepperAxis {
    cfg: AxisConfig,
    gpio: Arc<dyn GpioBackend>,
    motion: Mutex<()>,
    status: Mutex<AxisStatus>,
    last_direction: Mutex<Option<Direction>>,
    position: AtomicI64,
    measured_travel: AtomicI64,
    enabled: AtomicBool,
    cw_limit: Arc<AtomicBool>,
    ccw_limit: Arc<AtomicBool>,
}

impl StepperAxis {
    /// Claims the axis pins from `gpio` and wires up both limit watchers.
    /// The driver starts released; call [`StepperAxis::enable`] before
    /// moving.
    pub fn new(gpio: Arc<dyn GpioBackend>, cfg: AxisConfig) -> Result<Self, MotionError> {
        cfg.validate()?;

        gpio.configure(cfg.step_pin, PinMode::Output, Pull::None)?;
        gpio.configure(cfg.dir_pin, PinMode::Output, Pull::None)?;
        gpio.configure(cfg.enable_pin, PinMode::Output, Pull::None)?;
        // nENABLE is active low; park it released.
        gpio.write(cfg.enable_pin, Level::High)?;

        if let Some(select) = cfg.microstep_pins {
            let levels = cfg.microstep_levels();
            for (pin, level) in select.iter().zip(levels) {
                gpio.configure(*pin, PinMode::Output, Pull::None)?;
                gpio.write(*pin, level)?;
            }
        }

        gpio.configure(cfg.cw_limit_pin, PinMode::Input, Pull::Up)?;
        gpio.configure(cfg.ccw_limit_pin, PinMode::Input, Pull::Up)?;

        let cw_limit = Arc::new(AtomicBool::new(false));
        let ccw_limit = Arc::new(AtomicBool::new(false));
        // The switches pull the line low when the mechanism hits the stop.
        // Handlers run on the gpio event thread and only latch the flag.
        let cw_flag = cw_limit.clone();
        gpio.watch(
            cfg.cw_limit_pin,
            Edge::Falling,
            LIMIT_DEBOUNCE,
            Box::new(move |_| cw_flag.store(true, Ordering::Release)),
        )?;
        let ccw_flag = ccw_limit.clone();
        gpio.watch(
            cfg.ccw_limit_pin,
            Edge::Falling,
            LIMIT_DEBOUNCE,
            Box::new(move |_| ccw_flag.store(true, Ordering::Release)),
        )?;

        info!(axis = %cfg.name, "stepper axis initialized");
        Ok(Self {
            cfg,
            gpio,
            motion: Mutex::new(()),
            status: Mutex::new(AxisStatus::Idle),
            last_direction: Mutex::new(None),
            position: AtomicI64::new(0),
            measured_travel: AtomicI64::new(0),
            enabled: AtomicBool::new(false),
            cw_limit,
            ccw_limit,
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn status(&self) -> AxisStatus {
        *self.status.lock()
    }

    pub fn last_direction(&self) -> Option<Direction> {
        *self.last_direction.lock()
    }

    /// Travel in steps measured by the last successful homing run.
    pub fn measured_travel(&self) -> i64 {
        self.measured_travel.load(Ordering::Acquire)
    }

    /// Which limit is currently latched, if any.
    pub fn triggered_limit(&self) -> Option<Direction> {
        if self.cw_limit.load(Ordering::Acquire) {
            Some(Direction::Cw)
        } else if self.ccw_limit.load(Ordering::Acquire) {
            Some(Direction::Ccw)
        } else {
            None
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Asserts the driver enable line.
    pub fn enable(&self) -> Result<(), MotionError> {
        self.gpio.write(self.cfg.enable_pin, Level::Low)?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases the driver; the motor freewheels and pulses are ignored.
    pub fn release(&self) -> Result<(), MotionError> {
        self.gpio.write(self.cfg.enable_pin, Level::High)?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    /// Declares the current position to be home without moving.
    pub fn set_home_here(&self) {
        self.position.store(0, Ordering::Release);
        debug!(axis = %self.cfg.name, "home set in place");
    }

    fn limit_flag(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::Cw => &self.cw_limit,
            Direction::Ccw => &self.ccw_limit,
        }
    }

    fn set_status(&self, status: AxisStatus) {
        *self.status.lock() = status;
    }

    /// Emits up to `count` pulses in `direction` with the trapezoidal delay
    /// profile.
    ///
    /// A latched limit in the commanded direction refuses the whole request
    /// with zero pulses; stepping away from a latched limit clears it. The
    /// returned outcome reports how many pulses actually went out and why
    /// the train stopped.
    pub fn step(
        &self,
        direction: Direction,
        count: i64,
        min_delay_s: f64,
        cancel: &CancelToken,
    ) -> Result<StepOutcome, MotionError> {
        if count < 0 {
            return Err(MotionError::InvalidRequest(format!(
                "negative step count {count}"
            )));
        }
        if !(min_delay_s > 0.0) {
            return Err(MotionError::InvalidRequest(format!(
                "non-positive step delay {min_delay_s}"
            )));
        }
        if !self.is_enabled() {
            return Err(MotionError::Disabled);
        }

        let _motion = self.motion.lock();
        if count == 0 {
            return Ok(StepOutcome {
                steps_emitted: 0,
                termination: Termination::Completed,
            });
        }
        if self.limit_flag(direction).load(Ordering::Acquire) {
            self.set_status(AxisStatus::LimitReached(direction));
            return Ok(StepOutcome {
                steps_emitted: 0,
                termination: Termination::LimitHit,
            });
        }
        // Moving away from a stop releases its latch.
        self.limit_flag(direction.opposite())
            .store(false, Ordering::Release);

        self.set_status(AxisStatus::Moving);
        let result = self.run_steps(direction, count as u64, min_delay_s, cancel);
        match &result {
            Ok(outcome) => {
                let status = match outcome.termination {
                    Termination::LimitHit => AxisStatus::LimitReached(direction),
                    _ => AxisStatus::Idle,
                };
                self.set_status(status);
            }
            Err(err) => self.fault(err),
        }
        result
    }

    /// Homing: seek the CCW stop, back off, sweep to the CW stop counting
    /// travel, then park centered with position zero.
    pub fn home(&self, cancel: &CancelToken) -> Result<(), MotionError> {
        if !self.is_enabled() {
            return Err(MotionError::Disabled);
        }
        let _motion = self.motion.lock();
        let deadline = Instant::now() + self.cfg.home_timeout;
        self.set_status(AxisStatus::Homing);
        info!(axis = %self.cfg.name, "homing");

        let result = self.home_inner(cancel, deadline);
        match &result {
            Ok(travel) => {
                self.measured_travel.store(*travel, Ordering::Release);
                self.position.store(0, Ordering::Release);
                self.set_status(AxisStatus::Idle);
                info!(axis = %self.cfg.name, travel, "homed");
            }
            Err(err) => self.fault(err),
        }
        result.map(|_| ())
    }

    fn home_inner(&self, cancel: &CancelToken, deadline: Instant) -> Result<i64, MotionError> {
        let delay = self.cfg.step_delay_s;

        self.seek_limit(Direction::Ccw, delay, cancel, deadline)?;

        let backoff = self.cfg.backoff_steps as u64;
        if backoff > 0 {
            let outcome = self.run_steps(Direction::Cw, backoff, delay, cancel)?;
            if outcome.termination == Termination::Cancelled {
                return Err(MotionError::Cancelled);
            }
        }
        // Off the switch now; drop the latch before the measuring sweep.
        self.ccw_limit.store(false, Ordering::Release);

        let counted = self.seek_limit(Direction::Cw, delay, cancel, deadline)?;

        let center = counted / 2;
        if center > 0 {
            let outcome = self.run_steps(Direction::Ccw, center, delay, cancel)?;
            if outcome.termination == Termination::Cancelled {
                return Err(MotionError::Cancelled);
            }
        }
        self.cw_limit.store(false, Ordering::Release);
        Ok(counted as i64)
    }

    /// Sweeps toward `direction` until its limit latches, returning the
    /// pulses emitted on the way.
    fn seek_limit(
        &self,
        direction: Direction,
        min_delay_s: f64,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> Result<u64, MotionError> {
        let mut total = 0u64;
        loop {
            let outcome = self.run_steps(direction, HOMING_CHUNK, min_delay_s, cancel)?;
            total += outcome.steps_emitted;
            match outcome.termination {
                Termination::LimitHit => return Ok(total),
                Termination::Cancelled => return Err(MotionError::Cancelled),
                Termination::Completed => {
                    if Instant::now() >= deadline {
                        return Err(MotionError::HomeTimeout(self.cfg.home_timeout));
                    }
                }
            }
        }
    }

    /// The pulse loop. Callers hold the motion mutex.
    fn run_steps(
        &self,
        direction: Direction,
        count: u64,
        min_delay_s: f64,
        cancel: &CancelToken,
    ) -> Result<StepOutcome, MotionError> {
        self.gpio.write(self.cfg.dir_pin, direction.level())?;
        *self.last_direction.lock() = Some(direction);
        spin_wait(DIR_SETUP);

        let flag = self.limit_flag(direction);
        let budget =
            Duration::from_secs_f64(min_delay_s * 50.0).max(STEP_BUDGET_FLOOR);
        let accel = self.cfg.acceleration_steps as u64;
        let mut emitted = 0u64;

        for index in 0..count {
            if flag.load(Ordering::Acquire) {
                return Ok(StepOutcome {
                    steps_emitted: emitted,
                    termination: Termination::LimitHit,
                });
            }
            if cancel.is_cancelled() {
                return Ok(StepOutcome {
                    steps_emitted: emitted,
                    termination: Termination::Cancelled,
                });
            }

            let started = Instant::now();
            self.gpio.write(self.cfg.step_pin, Level::High)?;
            spin_wait(STEP_PULSE);
            self.gpio.write(self.cfg.step_pin, Level::Low)?;
            self.position.fetch_add(direction.delta(), Ordering::AcqRel);
            emitted += 1;

            let delay = Duration::from_secs_f64(profile::step_delay(
                index,
                count,
                accel,
                min_delay_s,
            ));
            let elapsed = started.elapsed();
            if elapsed < delay {
                std::thread::sleep(delay - elapsed);
            }
            if started.elapsed() > budget {
                return Err(MotionError::StepTimeout(budget));
            }
        }

        Ok(StepOutcome {
            steps_emitted: emitted,
            termination: Termination::Completed,
        })
    }

    /// Parks the axis after an error: driver released, fault latched.
    fn fault(&self, err: &MotionError) {
        let kind = match err {
            MotionError::StepTimeout(_) | MotionError::HomeTimeout(_) => FaultKind::Timeout,
            MotionError::Cancelled => {
                self.set_status(AxisStatus::Idle);
                return;
            }
            _ => FaultKind::Hardware,
        };
        self.set_status(AxisStatus::Fault(kind));
        warn!(axis = %self.cfg.name, error = %err, "axis faulted, releasing driver");
        if let Err(release_err) = self.release() {
            warn!(axis = %self.cfg.name, error = %release_err, "release after fault failed");
        }
    }
}

/// Busy-waits for sub-scheduler-resolution delays (pulse widths, direction
/// setup).
fn spin_wait(duration: Duration) {
    let end = Instant::now() + duration;
    while Instant::now() < end {
        std::hint::spin_loop();
    }
}
