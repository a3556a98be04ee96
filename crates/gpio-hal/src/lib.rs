//! Hardware-neutral GPIO access for the turret.
//!
//! The motion and laser crates never touch pins directly; they go through the
//! [`GpioBackend`] trait. Two backends exist: [`RpiGpio`] drives the
//! Raspberry Pi header through `rppal`, and [`MockGpio`] keeps an in-memory
//! pin table with scripted edge injection for tests. The backend is selected
//! once at process start and shared behind an `Arc`.
//!
//! Edge debouncing lives entirely inside this crate: watchers get a
//! suppression window plus a confirmation re-read, so handlers registered by
//! the rest of the system only ever see debounced, confirmed edges. Handlers
//! run on a backend event thread and must only record state.

mod mock;
mod rpi;

pub use mock::MockGpio;
pub use rpi::RpiGpio;

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// A GPIO line in BCM numbering.
pub type Pin = u8;

/// Highest BCM line exposed on the 40-pin header.
pub const MAX_BCM_PIN: Pin = 27;

/// Interval between a raw edge and the confirmation re-read.
const CONFIRM_DELAY: Duration = Duration::from_millis(1);

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        matches!(self, Level::High)
    }
}

/// Direction a pin is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// Internal pull resistor selection for inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// Edge polarity a watcher fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// The level the pin must still hold at the confirmation re-read for the
    /// edge to be accepted.
    fn confirmation_level(self, seen: Level) -> Level {
        match self {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
            Edge::Both => seen,
        }
    }

    fn matches(self, level: Level) -> bool {
        match self {
            Edge::Rising => level == Level::High,
            Edge::Falling => level == Level::Low,
            Edge::Both => true,
        }
    }
}

/// Callback invoked from the backend event thread on a confirmed edge.
///
/// Handlers run on the thread that services every watched pin and must not
/// block; they only record the observed state and return.
pub type EdgeHandler = Box<dyn Fn(Level) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("pin {0} is not configured")]
    NotConfigured(Pin),

    #[error("pin {pin} is configured as {actual:?}, expected {expected:?}")]
    WrongMode {
        pin: Pin,
        expected: PinMode,
        actual: PinMode,
    },

    #[error("pin {0} already has an edge watcher")]
    AlreadyWatched(Pin),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("gpio backend failure: {0}")]
    Backend(String),
}

/// A PWM output opened on a single pin.
///
/// Duty cycles are percentages. Values above 100 clamp to 100; negative or
/// NaN values are refused with [`GpioError::InvalidArgument`].
pub trait PwmChannel: Send {
    fn start(&mut self, duty_pct: f64) -> Result<(), GpioError>;
    fn set_duty(&mut self, duty_pct: f64) -> Result<(), GpioError>;
    fn set_freq(&mut self, freq_hz: f64) -> Result<(), GpioError>;
    fn stop(&mut self) -> Result<(), GpioError>;

    /// Live duty cycle in percent; 0.0 when stopped.
    fn duty(&self) -> f64;
}

/// The capability set every GPIO backend provides.
pub trait GpioBackend: Send + Sync {
    fn configure(&self, pin: Pin, mode: PinMode, pull: Pull) -> Result<(), GpioError>;

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError>;

    fn read(&self, pin: Pin) -> Result<Level, GpioError>;

    /// Registers an edge watcher on an input pin.
    ///
    /// Debouncing happens inside the backend: edges within `debounce` of the
    /// last accepted edge are suppressed, and each surviving edge is re-read
    /// after 1 ms and dropped if the pin no longer holds the edge's active
    /// level. Only one watcher per pin.
    fn watch(
        &self,
        pin: Pin,
        edge: Edge,
        debounce: Duration,
        handler: EdgeHandler,
    ) -> Result<(), GpioError>;

    /// Opens a PWM output on `pin` at `freq_hz`. The channel starts stopped.
    fn pwm_open(&self, pin: Pin, freq_hz: f64) -> Result<Box<dyn PwmChannel>, GpioError>;

    /// Releases every pin this backend configured: watchers dropped, PWM
    /// stopped, and outputs reverted to high-impedance inputs so nothing
    /// stays asserted. Safe to call more than once.
    fn cleanup(&self) -> Result<(), GpioError>;
}

/// Validates a duty-cycle percentage, clamping the high end.
pub fn normalize_duty(duty_pct: f64) -> Result<f64, GpioError> {
    if duty_pct.is_nan() || duty_pct < 0.0 {
        return Err(GpioError::InvalidArgument(format!(
            "duty cycle {duty_pct} out of range"
        )));
    }
    Ok(duty_pct.min(100.0))
}

/// Validates a PWM frequency.
pub(crate) fn check_freq(freq_hz: f64) -> Result<f64, GpioError> {
    if !freq_hz.is_finite() || freq_hz <= 0.0 {
        return Err(GpioError::InvalidArgument(format!(
            "pwm frequency {freq_hz} Hz out of range"
        )));
    }
    Ok(freq_hz)
}

/// Debounce state shared by both backends. Lives on the event thread side of
/// a watcher registration.
pub(crate) struct Watcher {
    edge: Edge,
    debounce: Duration,
    last_accepted: Mutex<Option<Instant>>,
    handler: EdgeHandler,
}

impl Watcher {
    pub(crate) fn new(edge: Edge, debounce: Duration, handler: EdgeHandler) -> Self {
        Self {
            edge,
            debounce,
            last_accepted: Mutex::new(None),
            handler,
        }
    }

    pub(crate) fn edge(&self) -> Edge {
        self.edge
    }

    /// Services one raw edge. `read_back` samples the pin for the
    /// confirmation read; `None` means the pin is gone (cleanup raced the
    /// event) and the edge is dropped.
    pub(crate) fn service(&self, seen: Level, read_back: impl Fn() -> Option<Level>) {
        if !self.edge.matches(seen) {
            return;
        }
        {
            let last = self.last_accepted.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.debounce {
                    trace!("edge suppressed inside debounce window");
                    return;
                }
            }
        }
        std::thread::sleep(CONFIRM_DELAY);
        let expected = self.edge.confirmation_level(seen);
        match read_back() {
            Some(level) if level == expected => {
                *self.last_accepted.lock() = Some(Instant::now());
                (self.handler)(seen);
            }
            _ => trace!("edge rejected by confirmation read"),
        }
    }
}
