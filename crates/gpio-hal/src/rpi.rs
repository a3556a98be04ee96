//! Raspberry Pi backend over `rppal`.
//!
//! Uses the memory-mapped GPIO peripheral for digital I/O and `rppal`'s
//! software PWM for the laser output, so no pin is tied to the two hardware
//! PWM channels. Edge interrupts arrive on `rppal`'s interrupt thread and go
//! through the shared debounce/confirmation path before any handler runs.

use parking_lot::Mutex;
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    check_freq, normalize_duty, Edge, EdgeHandler, GpioBackend, GpioError, Level, Pin, PinMode,
    Pull, PwmChannel, Watcher,
};

fn backend_err(err: impl Display) -> GpioError {
    GpioError::Backend(err.to_string())
}

fn to_rppal(level: Level) -> rppal::gpio::Level {
    match level {
        Level::Low => rppal::gpio::Level::Low,
        Level::High => rppal::gpio::Level::High,
    }
}

fn from_rppal(level: rppal::gpio::Level) -> Level {
    match level {
        rppal::gpio::Level::Low => Level::Low,
        rppal::gpio::Level::High => Level::High,
    }
}

enum RpiPin {
    Output(OutputPin),
    Input(Arc<Mutex<InputPin>>),
    Pwm(Arc<Mutex<OutputPin>>),
}

/// Backend for the Raspberry Pi GPIO header.
pub struct RpiGpio {
    chip: Gpio,
    pins: Mutex<HashMap<Pin, RpiPin>>,
}

impl RpiGpio {
    /// Opens the GPIO peripheral. Fails off-target or without permissions.
    pub fn new() -> Result<Self, GpioError> {
        let chip = Gpio::new().map_err(backend_err)?;
        info!("opened raspberry pi gpio peripheral");
        Ok(Self {
            chip,
            pins: Mutex::new(HashMap::new()),
        })
    }
}

struct RpiPwm {
    pin: Arc<Mutex<OutputPin>>,
    freq_hz: f64,
    duty_pct: f64,
    running: bool,
}

impl RpiPwm {
    fn apply(&mut self) -> Result<(), GpioError> {
        self.pin
            .lock()
            .set_pwm_frequency(self.freq_hz, self.duty_pct / 100.0)
            .map_err(backend_err)
    }
}

impl PwmChannel for RpiPwm {
    fn start(&mut self, duty_pct: f64) -> Result<(), GpioError> {
        self.duty_pct = normalize_duty(duty_pct)?;
        self.apply()?;
        self.running = true;
        Ok(())
    }

    fn set_duty(&mut self, duty_pct: f64) -> Result<(), GpioError> {
        self.duty_pct = normalize_duty(duty_pct)?;
        if self.running {
            self.apply()?;
        }
        Ok(())
    }

    fn set_freq(&mut self, freq_hz: f64) -> Result<(), GpioError> {
        self.freq_hz = check_freq(freq_hz)?;
        if self.running {
            self.apply()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), GpioError> {
        if self.running {
            let mut pin = self.pin.lock();
            pin.clear_pwm().map_err(backend_err)?;
            pin.set_low();
            self.running = false;
            self.duty_pct = 0.0;
        }
        Ok(())
    }

    fn duty(&self) -> f64 {
        if self.running {
            self.duty_pct
        } else {
            0.0
        }
    }
}

impl GpioBackend for RpiGpio {
    fn configure(&self, pin: Pin, mode: PinMode, pull: Pull) -> Result<(), GpioError> {
        let hw = self.chip.get(pin).map_err(backend_err)?;
        let entry = match mode {
            PinMode::Output => RpiPin::Output(hw.into_output_low()),
            PinMode::Input => {
                let input = match pull {
                    Pull::Up => hw.into_input_pullup(),
                    Pull::Down => hw.into_input_pulldown(),
                    Pull::None => hw.into_input(),
                };
                RpiPin::Input(Arc::new(Mutex::new(input)))
            }
        };
        self.pins.lock().insert(pin, entry);
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        match pins.get_mut(&pin) {
            Some(RpiPin::Output(out)) => {
                out.write(to_rppal(level));
                Ok(())
            }
            Some(_) => Err(GpioError::WrongMode {
                pin,
                expected: PinMode::Output,
                actual: PinMode::Input,
            }),
            None => Err(GpioError::NotConfigured(pin)),
        }
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        let pins = self.pins.lock();
        match pins.get(&pin) {
            Some(RpiPin::Input(slot)) => Ok(from_rppal(slot.lock().read())),
            Some(RpiPin::Output(out)) => Ok(if out.is_set_high() {
                Level::High
            } else {
                Level::Low
            }),
            Some(RpiPin::Pwm(_)) => Err(GpioError::WrongMode {
                pin,
                expected: PinMode::Input,
                actual: PinMode::Output,
            }),
            None => Err(GpioError::NotConfigured(pin)),
        }
    }

    fn watch(
        &self,
        pin: Pin,
        edge: Edge,
        debounce: Duration,
        handler: EdgeHandler,
    ) -> Result<(), GpioError> {
        let pins = self.pins.lock();
        let slot = match pins.get(&pin) {
            Some(RpiPin::Input(slot)) => slot.clone(),
            Some(_) => {
                return Err(GpioError::WrongMode {
                    pin,
                    expected: PinMode::Input,
                    actual: PinMode::Output,
                })
            }
            None => return Err(GpioError::NotConfigured(pin)),
        };
        let trigger = match edge {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
            Edge::Both => Trigger::Both,
        };
        let watcher = Arc::new(Watcher::new(edge, debounce, handler));
        let confirm = Arc::downgrade(&slot);
        let result = slot
            .lock()
            .set_async_interrupt(trigger, move |level| {
                let seen = from_rppal(level);
                let confirm = confirm.clone();
                // Bounded wait on the pin lock: cleanup() may hold it while
                // joining this very thread, so blocking here forever would
                // wedge teardown. A missed confirmation read just drops the
                // edge.
                watcher.service(seen, move || {
                    confirm.upgrade().and_then(|slot| {
                        slot.try_lock_for(Duration::from_millis(5))
                            .map(|pin| from_rppal(pin.read()))
                    })
                });
            })
            .map_err(backend_err);
        result
    }

    fn pwm_open(&self, pin: Pin, freq_hz: f64) -> Result<Box<dyn PwmChannel>, GpioError> {
        let freq = check_freq(freq_hz)?;
        let mut pins = self.pins.lock();
        if pins.contains_key(&pin) {
            return Err(GpioError::InvalidArgument(format!(
                "pin {pin} is already configured"
            )));
        }
        let out = self.chip.get(pin).map_err(backend_err)?.into_output_low();
        let slot = Arc::new(Mutex::new(out));
        pins.insert(pin, RpiPin::Pwm(slot.clone()));
        Ok(Box::new(RpiPwm {
            pin: slot,
            freq_hz: freq,
            duty_pct: 0.0,
            running: false,
        }))
    }

    fn cleanup(&self) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        // Dropping an rppal pin reverts it to a high-impedance input.
        for (pin, entry) in pins.drain() {
            match entry {
                RpiPin::Output(out) => drop(out),
                RpiPin::Pwm(slot) => {
                    let _ = slot.lock().clear_pwm();
                }
                RpiPin::Input(slot) => {
                    let _ = slot.lock().clear_async_interrupt();
                }
            }
            debug!(pin, "released gpio line");
        }
        Ok(())
    }
}
