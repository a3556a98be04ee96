//! In-memory GPIO backend for tests.
//!
//! `MockGpio` keeps a pin table instead of a chip. Tests script input edges
//! with [`MockGpio::set_input`] and inspect what the system did through the
//! write and pulse counters. Edge events are delivered on a dedicated event
//! thread, so handlers run off-caller exactly as they do on real hardware.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use crate::{
    check_freq, normalize_duty, Edge, EdgeHandler, GpioBackend, GpioError, Level, Pin, PinMode,
    Pull, PwmChannel, Watcher,
};

struct MockPin {
    mode: PinMode,
    level: Level,
    writes: u64,
    pulses: u64,
    watcher: Option<Arc<Watcher>>,
}

impl MockPin {
    fn new(mode: PinMode, pull: Pull) -> Self {
        // An input with a pull-up idles high, everything else idles low.
        let level = match (mode, pull) {
            (PinMode::Input, Pull::Up) => Level::High,
            _ => Level::Low,
        };
        Self {
            mode,
            level,
            writes: 0,
            pulses: 0,
            watcher: None,
        }
    }
}

struct PwmState {
    freq_hz: f64,
    duty_pct: f64,
    running: bool,
    history: Vec<f64>,
}

struct MockPwm {
    pin: Pin,
    state: Arc<Mutex<PwmState>>,
}

impl PwmChannel for MockPwm {
    fn start(&mut self, duty_pct: f64) -> Result<(), GpioError> {
        let duty = normalize_duty(duty_pct)?;
        let mut st = self.state.lock();
        st.duty_pct = duty;
        st.running = true;
        st.history.push(duty);
        trace!(pin = self.pin, duty, "mock pwm start");
        Ok(())
    }

    fn set_duty(&mut self, duty_pct: f64) -> Result<(), GpioError> {
        let duty = normalize_duty(duty_pct)?;
        let mut st = self.state.lock();
        st.duty_pct = duty;
        if st.running {
            st.history.push(duty);
        }
        Ok(())
    }

    fn set_freq(&mut self, freq_hz: f64) -> Result<(), GpioError> {
        let freq = check_freq(freq_hz)?;
        self.state.lock().freq_hz = freq;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), GpioError> {
        let mut st = self.state.lock();
        if st.running {
            st.running = false;
            st.duty_pct = 0.0;
            st.history.push(0.0);
        }
        Ok(())
    }

    fn duty(&self) -> f64 {
        let st = self.state.lock();
        if st.running {
            st.duty_pct
        } else {
            0.0
        }
    }
}

enum MockEvent {
    Edge { pin: Pin, level: Level },
    Sync(Sender<()>),
}

struct MockInner {
    pins: Mutex<HashMap<Pin, MockPin>>,
    pwms: Mutex<HashMap<Pin, Arc<Mutex<PwmState>>>>,
}

/// The in-memory backend.
pub struct MockGpio {
    inner: Arc<MockInner>,
    events_tx: Sender<MockEvent>,
}

impl MockGpio {
    pub fn new() -> Self {
        let inner = Arc::new(MockInner {
            pins: Mutex::new(HashMap::new()),
            pwms: Mutex::new(HashMap::new()),
        });
        let (events_tx, events_rx) = unbounded();
        let thread_inner = inner.clone();
        thread::Builder::new()
            .name("mock-gpio-events".into())
            .spawn(move || event_loop(thread_inner, events_rx))
            .expect("spawning mock gpio event thread");
        Self { inner, events_tx }
    }

    /// Scripts the level of an input pin. A transition matching the pin's
    /// watcher is delivered through the event thread (debounce and
    /// confirmation included), just like a real edge.
    pub fn set_input(&self, pin: Pin, level: Level) {
        let mut pins = self.inner.pins.lock();
        let Some(entry) = pins.get_mut(&pin) else {
            debug!(pin, "set_input on unconfigured pin ignored");
            return;
        };
        let previous = entry.level;
        entry.level = level;
        if previous == level {
            return;
        }
        if let Some(watcher) = &entry.watcher {
            if watcher.edge().matches(level) {
                let _ = self.events_tx.send(MockEvent::Edge { pin, level });
            }
        }
    }

    /// Blocks until every event injected so far has been serviced.
    pub fn settle(&self) {
        let (tx, rx) = bounded(1);
        if self.events_tx.send(MockEvent::Sync(tx)).is_ok() {
            let _ = rx.recv_timeout(Duration::from_secs(2));
        }
    }

    /// Level last written to (or scripted on) a pin.
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.inner.pins.lock().get(&pin).map(|p| p.level)
    }

    /// Number of writes issued to an output pin.
    pub fn write_count(&self, pin: Pin) -> u64 {
        self.inner.pins.lock().get(&pin).map_or(0, |p| p.writes)
    }

    /// Number of low-to-high transitions written to an output pin.
    pub fn pulse_count(&self, pin: Pin) -> u64 {
        self.inner.pins.lock().get(&pin).map_or(0, |p| p.pulses)
    }

    /// Live duty cycle of an opened PWM pin; 0.0 when stopped.
    pub fn pwm_duty(&self, pin: Pin) -> Option<f64> {
        self.inner.pwms.lock().get(&pin).map(|st| {
            let st = st.lock();
            if st.running {
                st.duty_pct
            } else {
                0.0
            }
        })
    }

    /// Every duty value a PWM pin has been driven through, in order.
    pub fn pwm_history(&self, pin: Pin) -> Vec<f64> {
        self.inner
            .pwms
            .lock()
            .get(&pin)
            .map_or_else(Vec::new, |st| st.lock().history.clone())
    }
}

impl Default for MockGpio {
    fn default() -> Self {
        Self::new()
    }
}

fn event_loop(inner: Arc<MockInner>, events_rx: Receiver<MockEvent>) {
    while let Ok(event) = events_rx.recv() {
        match event {
            MockEvent::Edge { pin, level } => {
                let watcher = inner.pins.lock().get(&pin).and_then(|p| p.watcher.clone());
                if let Some(watcher) = watcher {
                    let read_inner = inner.clone();
                    watcher.service(level, move || {
                        read_inner.pins.lock().get(&pin).map(|p| p.level)
                    });
                }
            }
            MockEvent::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
    trace!("mock gpio event thread exiting");
}

impl GpioBackend for MockGpio {
    fn configure(&self, pin: Pin, mode: PinMode, pull: Pull) -> Result<(), GpioError> {
        self.inner.pins.lock().insert(pin, MockPin::new(mode, pull));
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let mut pins = self.inner.pins.lock();
        let entry = pins.get_mut(&pin).ok_or(GpioError::NotConfigured(pin))?;
        if entry.mode != PinMode::Output {
            return Err(GpioError::WrongMode {
                pin,
                expected: PinMode::Output,
                actual: entry.mode,
            });
        }
        if entry.level == Level::Low && level == Level::High {
            entry.pulses += 1;
        }
        entry.writes += 1;
        entry.level = level;
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        self.inner
            .pins
            .lock()
            .get(&pin)
            .map(|p| p.level)
            .ok_or(GpioError::NotConfigured(pin))
    }

    fn watch(
        &self,
        pin: Pin,
        edge: Edge,
        debounce: Duration,
        handler: EdgeHandler,
    ) -> Result<(), GpioError> {
        let mut pins = self.inner.pins.lock();
        let entry = pins.get_mut(&pin).ok_or(GpioError::NotConfigured(pin))?;
        if entry.mode != PinMode::Input {
            return Err(GpioError::WrongMode {
                pin,
                expected: PinMode::Input,
                actual: entry.mode,
            });
        }
        if entry.watcher.is_some() {
            return Err(GpioError::AlreadyWatched(pin));
        }
        entry.watcher = Some(Arc::new(Watcher::new(edge, debounce, handler)));
        Ok(())
    }

    fn pwm_open(&self, pin: Pin, freq_hz: f64) -> Result<Box<dyn PwmChannel>, GpioError> {
        let freq = check_freq(freq_hz)?;
        let mut pwms = self.inner.pwms.lock();
        if pwms.contains_key(&pin) {
            return Err(GpioError::InvalidArgument(format!(
                "pwm already open on pin {pin}"
            )));
        }
        let state = Arc::new(Mutex::new(PwmState {
            freq_hz: freq,
            duty_pct: 0.0,
            running: false,
            history: Vec::new(),
        }));
        pwms.insert(pin, state.clone());
        Ok(Box::new(MockPwm { pin, state }))
    }

    fn cleanup(&self) -> Result<(), GpioError> {
        let mut pins = self.inner.pins.lock();
        for (pin, entry) in pins.iter_mut() {
            entry.watcher = None;
            if entry.mode == PinMode::Output {
                trace!(pin = *pin, "cleanup reverting output to a floating input");
                entry.mode = PinMode::Input;
                entry.level = Level::Low;
            }
        }
        drop(pins);
        for state in self.inner.pwms.lock().values() {
            let mut st = state.lock();
            if st.running {
                st.running = false;
                st.duty_pct = 0.0;
                st.history.push(0.0);
            }
        }
        debug!("mock gpio cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LIMIT: Pin = 5;

    fn watched(debounce: Duration) -> (MockGpio, Arc<AtomicUsize>) {
        let gpio = MockGpio::new();
        gpio.configure(LIMIT, PinMode::Input, Pull::Up).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        gpio.watch(
            LIMIT,
            Edge::Falling,
            debounce,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (gpio, hits)
    }

    #[test]
    fn confirmed_edge_reaches_handler() {
        let (gpio, hits) = watched(Duration::from_millis(100));
        gpio.set_input(LIMIT, Level::Low);
        gpio.settle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bounce_is_rejected_by_confirmation_read() {
        let (gpio, hits) = watched(Duration::from_millis(100));
        // The line recovers before the confirmation read samples it.
        gpio.set_input(LIMIT, Level::Low);
        gpio.set_input(LIMIT, Level::High);
        gpio.settle();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn edges_inside_the_window_are_suppressed() {
        let (gpio, hits) = watched(Duration::from_millis(100));
        gpio.set_input(LIMIT, Level::Low);
        gpio.settle();
        gpio.set_input(LIMIT, Level::High);
        gpio.set_input(LIMIT, Level::Low);
        gpio.settle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Outside the window the next edge is delivered again.
        std::thread::sleep(Duration::from_millis(120));
        gpio.set_input(LIMIT, Level::High);
        gpio.set_input(LIMIT, Level::Low);
        gpio.settle();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cleanup_is_idempotent_and_deasserts_outputs() {
        let gpio = MockGpio::new();
        gpio.configure(2, PinMode::Output, Pull::None).unwrap();
        gpio.write(2, Level::High).unwrap();
        let mut pwm = gpio.pwm_open(12, 1000.0).unwrap();
        pwm.start(60.0).unwrap();

        gpio.cleanup().unwrap();
        assert_eq!(gpio.level(2), Some(Level::Low));
        assert_eq!(gpio.pwm_duty(12), Some(0.0));
        // The line is released; nothing can assert it anymore.
        assert!(gpio.write(2, Level::High).is_err());

        gpio.cleanup().unwrap();
        assert_eq!(gpio.level(2), Some(Level::Low));
        assert_eq!(gpio.pwm_history(12), vec![60.0, 0.0]);
    }

    #[test]
    fn pulse_counter_tracks_rising_writes() {
        let gpio = MockGpio::new();
        gpio.configure(3, PinMode::Output, Pull::None).unwrap();
        for _ in 0..4 {
            gpio.write(3, Level::High).unwrap();
            gpio.write(3, Level::Low).unwrap();
        }
        assert_eq!(gpio.pulse_count(3), 4);
        assert_eq!(gpio.write_count(3), 8);
    }

    #[test]
    fn write_to_input_pin_is_refused() {
        let gpio = MockGpio::new();
        gpio.configure(4, PinMode::Input, Pull::Up).unwrap();
        assert!(matches!(
            gpio.write(4, Level::High),
            Err(GpioError::WrongMode { .. })
        ));
    }
}
