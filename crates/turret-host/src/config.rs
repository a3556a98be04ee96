//! Turret configuration loader.
//!
//! Parses the INI-style `turret.cfg` into strongly-typed structs and
//! validates the whole pin assignment up front: any duplicate or
//! out-of-range pin is fatal before a single GPIO line is touched.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use gpio_hal::{Pin, MAX_BCM_PIN};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracking::{Axis, Calibration, TrackerConfig};

use crate::remote::RemoteSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("BCM pin {0} is assigned more than once")]
    DuplicatePin(Pin),

    #[error("BCM pin {0} is outside the valid range 0..={MAX_BCM_PIN}")]
    PinOutOfRange(Pin),

    #[error("invalid value for '{key}' in [{section}]: {message}")]
    InvalidValue {
        section: String,
        key: String,
        message: String,
    },
}

fn invalid(section: &str, key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.into(),
        key: key.into(),
        message: message.into(),
    }
}

/// Limit-switch wiring, per axis and direction.
#[derive(Debug, Clone)]
pub struct GpioConfig {
    pub x_cw_limit_pin: Pin,
    pub x_ccw_limit_pin: Pin,
    pub y_cw_limit_pin: Pin,
    pub y_ccw_limit_pin: Pin,
}

/// One motor's control lines and stepping parameters.
#[derive(Debug, Clone)]
pub struct MotorConfig {
    pub step_pin: Pin,
    pub dir_pin: Pin,
    pub enable_pin: Pin,
    /// M0/M1/M2 select lines; omit when the driver is strapped externally.
    pub microstep_pins: Option<[Pin; 3]>,
    pub microsteps: u8,
    pub steps_per_rev: u32,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub max_steps_per_update: u32,
    pub deadzone: u8,
    pub speed_scaling: f64,
    /// Minimum inter-step delay in seconds.
    pub step_delay: f64,
    pub idle_timeout_sec: u64,
    pub acceleration_steps: u32,
    pub backoff_steps: u32,
    pub home_timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct LaserConfig {
    pub pin: Pin,
    pub max_power_pct: u8,
    pub cooldown_ms: u64,
    pub pulse_ms: u64,
    pub max_pulse_ms: u64,
    pub pwm_freq_hz: f64,
}

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub dead_zone_pixels: u32,
    pub x_steps_per_pixel: f64,
    pub y_steps_per_pixel: f64,
    pub x_max_steps_from_home: i64,
    pub y_max_steps_from_home: i64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub recenter_on_loss: bool,
    pub loss_timeout_ms: u64,
    pub home_recenter_rate: u32,
    pub frame_w: u32,
    pub frame_h: u32,
    pub calibration_path: Option<PathBuf>,
}

/// MQTT broker for the joystick feed. Absent section disables the ingestor.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct TurretConfig {
    pub gpio: GpioConfig,
    pub motor_x: MotorConfig,
    pub motor_y: MotorConfig,
    pub control: ControlConfig,
    pub laser: LaserConfig,
    pub tracking: TrackingConfig,
    pub remote: Option<RemoteConfig>,
}

fn req(ini: &Ini, section: &str, key: &str) -> Result<String> {
    ini.get(section, key)
        .with_context(|| format!("[{section}] {key} is not set"))
}

fn parse_req<T: FromStr>(ini: &Ini, section: &str, key: &str) -> Result<T> {
    let raw = req(ini, section, key)?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("[{section}] {key}: invalid value '{raw}'"))
}

fn parse_opt<T: FromStr>(ini: &Ini, section: &str, key: &str, default: T) -> Result<T> {
    match ini.get(section, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("[{section}] {key}: invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn parse_microstep_pins(ini: &Ini, section: &str) -> Result<Option<[Pin; 3]>> {
    let Some(raw) = ini.get(section, "microstep_pins") else {
        return Ok(None);
    };
    let pins: Vec<Pin> = raw
        .split(',')
        .map(|part| part.trim().parse::<Pin>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("[{section}] microstep_pins: invalid value '{raw}'"))?;
    let pins: [Pin; 3] = pins
        .try_into()
        .map_err(|_| anyhow::anyhow!("[{section}] microstep_pins: exactly 3 pins required"))?;
    Ok(Some(pins))
}

fn load_motor(ini: &Ini, section: &str) -> Result<MotorConfig> {
    Ok(MotorConfig {
        step_pin: parse_req(ini, section, "step_pin")?,
        dir_pin: parse_req(ini, section, "dir_pin")?,
        enable_pin: parse_req(ini, section, "enable_pin")?,
        microstep_pins: parse_microstep_pins(ini, section)?,
        microsteps: parse_opt(ini, section, "microsteps", 1)?,
        steps_per_rev: parse_req(ini, section, "steps_per_rev")?,
    })
}

impl TurretConfig {
    /// Loads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("failed to load configuration file {path:?}"))?;

        let gpio = GpioConfig {
            x_cw_limit_pin: parse_req(&ini, "gpio", "x_cw_limit_pin")?,
            x_ccw_limit_pin: parse_req(&ini, "gpio", "x_ccw_limit_pin")?,
            y_cw_limit_pin: parse_req(&ini, "gpio", "y_cw_limit_pin")?,
            y_ccw_limit_pin: parse_req(&ini, "gpio", "y_ccw_limit_pin")?,
        };
        let motor_x = load_motor(&ini, "motor_x")?;
        let motor_y = load_motor(&ini, "motor_y")?;
        let control = ControlConfig {
            max_steps_per_update: parse_opt(&ini, "control", "max_steps_per_update", 50)?,
            deadzone: parse_opt(&ini, "control", "deadzone", 5)?,
            speed_scaling: parse_opt(&ini, "control", "speed_scaling", 1.0)?,
            step_delay: parse_req(&ini, "control", "step_delay")?,
            idle_timeout_sec: parse_opt(&ini, "control", "idle_timeout_sec", 120)?,
            acceleration_steps: parse_opt(&ini, "control", "acceleration_steps", 0)?,
            backoff_steps: parse_opt(&ini, "control", "backoff_steps", 16)?,
            home_timeout_sec: parse_opt(&ini, "control", "home_timeout_sec", 30)?,
        };
        let laser = LaserConfig {
            pin: parse_req(&ini, "laser", "pin")?,
            max_power_pct: parse_req(&ini, "laser", "max_power_pct")?,
            cooldown_ms: parse_opt(&ini, "laser", "cooldown_ms", 2000)?,
            pulse_ms: parse_opt(&ini, "laser", "pulse_ms", 500)?,
            max_pulse_ms: parse_opt(&ini, "laser", "max_pulse_ms", 5000)?,
            pwm_freq_hz: parse_opt(&ini, "laser", "pwm_freq_hz", 1000.0)?,
        };
        let tracking = TrackingConfig {
            dead_zone_pixels: parse_opt(&ini, "tracking", "dead_zone_pixels", 20)?,
            x_steps_per_pixel: parse_req(&ini, "tracking", "x_steps_per_pixel")?,
            y_steps_per_pixel: parse_req(&ini, "tracking", "y_steps_per_pixel")?,
            x_max_steps_from_home: parse_req(&ini, "tracking", "x_max_steps_from_home")?,
            y_max_steps_from_home: parse_req(&ini, "tracking", "y_max_steps_from_home")?,
            kp: parse_opt(&ini, "tracking", "kp", 1.0)?,
            ki: parse_opt(&ini, "tracking", "ki", 0.0)?,
            kd: parse_opt(&ini, "tracking", "kd", 0.0)?,
            recenter_on_loss: parse_opt(&ini, "tracking", "recenter_on_loss", false)?,
            loss_timeout_ms: parse_opt(&ini, "tracking", "loss_timeout_ms", 500)?,
            home_recenter_rate: parse_opt(&ini, "tracking", "home_recenter_rate", 10)?,
            frame_w: parse_opt(&ini, "tracking", "frame_w", 1920)?,
            frame_h: parse_opt(&ini, "tracking", "frame_h", 1080)?,
            calibration_path: ini
                .get("tracking", "calibration_path")
                .map(PathBuf::from),
        };
        let remote = match ini.get("remote", "host") {
            Some(host) => Some(RemoteConfig {
                host,
                port: parse_opt(&ini, "remote", "port", 1883)?,
                topic: parse_req(&ini, "remote", "topic")?,
                client_id: parse_opt(&ini, "remote", "client_id", "turret-core".to_string())?,
            }),
            None => None,
        };

        let config = TurretConfig {
            gpio,
            motor_x,
            motor_y,
            control,
            laser,
            tracking,
            remote,
        };
        config.validate()?;
        Ok(config)
    }

    /// Whole-assignment validation; errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<Pin> = HashSet::new();
        let mut claim = |pin: Pin| -> Result<(), ConfigError> {
            if pin > MAX_BCM_PIN {
                return Err(ConfigError::PinOutOfRange(pin));
            }
            if !seen.insert(pin) {
                return Err(ConfigError::DuplicatePin(pin));
            }
            Ok(())
        };

        for motor in [&self.motor_x, &self.motor_y] {
            claim(motor.step_pin)?;
            claim(motor.dir_pin)?;
            claim(motor.enable_pin)?;
            if let Some(select) = motor.microstep_pins {
                for pin in select {
                    claim(pin)?;
                }
            }
        }
        claim(self.gpio.x_cw_limit_pin)?;
        claim(self.gpio.x_ccw_limit_pin)?;
        claim(self.gpio.y_cw_limit_pin)?;
        claim(self.gpio.y_ccw_limit_pin)?;
        claim(self.laser.pin)?;

        for (section, motor) in [("motor_x", &self.motor_x), ("motor_y", &self.motor_y)] {
            if !matches!(motor.microsteps, 1 | 2 | 4 | 8 | 16) {
                return Err(invalid(section, "microsteps", "must be one of 1/2/4/8/16"));
            }
            if motor.steps_per_rev == 0 {
                return Err(invalid(section, "steps_per_rev", "must be positive"));
            }
        }
        if !(self.control.step_delay > 0.0) {
            return Err(invalid("control", "step_delay", "must be positive"));
        }
        if !(self.control.speed_scaling > 0.0) {
            return Err(invalid("control", "speed_scaling", "must be positive"));
        }
        if self.control.deadzone >= 100 {
            return Err(invalid("control", "deadzone", "must be below 100"));
        }
        if self.laser.max_power_pct > 100 {
            return Err(invalid("laser", "max_power_pct", "must be 0..=100"));
        }
        if !(self.tracking.x_steps_per_pixel > 0.0) || !(self.tracking.y_steps_per_pixel > 0.0) {
            return Err(invalid("tracking", "steps_per_pixel", "must be positive"));
        }
        if self.tracking.x_max_steps_from_home <= 0 || self.tracking.y_max_steps_from_home <= 0 {
            return Err(invalid("tracking", "max_steps_from_home", "must be positive"));
        }
        for (key, gain) in [
            ("kp", self.tracking.kp),
            ("ki", self.tracking.ki),
            ("kd", self.tracking.kd),
        ] {
            if !gain.is_finite() || gain < 0.0 {
                return Err(invalid("tracking", key, "must be finite and non-negative"));
            }
        }
        Ok(())
    }

    pub fn axis_config(&self, axis: Axis) -> motion::AxisConfig {
        let (name, motor, cw_limit_pin, ccw_limit_pin) = match axis {
            Axis::X => (
                "x",
                &self.motor_x,
                self.gpio.x_cw_limit_pin,
                self.gpio.x_ccw_limit_pin,
            ),
            Axis::Y => (
                "y",
                &self.motor_y,
                self.gpio.y_cw_limit_pin,
                self.gpio.y_ccw_limit_pin,
            ),
        };
        motion::AxisConfig {
            name: name.into(),
            step_pin: motor.step_pin,
            dir_pin: motor.dir_pin,
            enable_pin: motor.enable_pin,
            cw_limit_pin,
            ccw_limit_pin,
            microstep_pins: motor.microstep_pins,
            steps_per_rev: motor.steps_per_rev,
            microsteps: motor.microsteps,
            step_delay_s: self.control.step_delay,
            acceleration_steps: self.control.acceleration_steps,
            backoff_steps: self.control.backoff_steps,
            home_timeout: Duration::from_secs(self.control.home_timeout_sec),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            step_delay_s: self.control.step_delay,
            loss_timeout: Duration::from_millis(self.tracking.loss_timeout_ms),
            home_recenter_rate: self.tracking.home_recenter_rate,
            defaults: Calibration {
                x_steps_per_pixel: self.tracking.x_steps_per_pixel,
                y_steps_per_pixel: self.tracking.y_steps_per_pixel,
                dead_zone_pixels: self.tracking.dead_zone_pixels,
                x_max_steps_from_home: self.tracking.x_max_steps_from_home,
                y_max_steps_from_home: self.tracking.y_max_steps_from_home,
                kp: self.tracking.kp,
                ki: self.tracking.ki,
                kd: self.tracking.kd,
                recenter_on_loss: self.tracking.recenter_on_loss,
            },
            calibration_path: self.tracking.calibration_path.clone(),
        }
    }

    pub fn laser_limits(&self) -> laser::LaserLimits {
        laser::LaserLimits {
            cooldown: Duration::from_millis(self.laser.cooldown_ms),
            default_pulse: Duration::from_millis(self.laser.pulse_ms),
            max_pulse: Duration::from_millis(self.laser.max_pulse_ms),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.control.idle_timeout_sec)
    }

    pub fn remote_settings(&self) -> Option<RemoteSettings> {
        self.remote.as_ref().map(|remote| RemoteSettings {
            host: remote.host.clone(),
            port: remote.port,
            topic: remote.topic.clone(),
            client_id: remote.client_id.clone(),
            deadzone: self.control.deadzone,
            speed_scaling: self.control.speed_scaling,
            max_steps_per_update: self.control.max_steps_per_update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
[gpio]
x_cw_limit_pin = 20
x_ccw_limit_pin = 21
y_cw_limit_pin = 22
y_ccw_limit_pin = 23

[motor_x]
step_pin = 2
dir_pin = 3
enable_pin = 4
microstep_pins = 14, 15, 16
microsteps = 8
steps_per_rev = 200

[motor_y]
step_pin = 5
dir_pin = 6
enable_pin = 7
microsteps = 8
steps_per_rev = 200

[control]
max_steps_per_update = 50
deadzone = 5
speed_scaling = 0.10
step_delay = 0.001
idle_timeout_sec = 120
acceleration_steps = 16

[laser]
pin = 18
max_power_pct = 80

[tracking]
x_steps_per_pixel = 0.1
y_steps_per_pixel = 0.1
x_max_steps_from_home = 500
y_max_steps_from_home = 500
recenter_on_loss = true

[remote]
host = localhost
topic = turret/joystick
";

    fn write_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("turret-cfg-{}", rand::random::<u32>()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn full_config_loads() {
        let path = write_config(SAMPLE);
        let config = TurretConfig::load(&path).unwrap();
        assert_eq!(config.motor_x.step_pin, 2);
        assert_eq!(config.motor_x.microstep_pins, Some([14, 15, 16]));
        assert_eq!(config.motor_y.microstep_pins, None);
        assert_eq!(config.control.deadzone, 5);
        assert_eq!(config.laser.max_power_pct, 80);
        assert!(config.tracking.recenter_on_loss);
        let remote = config.remote_settings().unwrap();
        assert_eq!(remote.port, 1883);
        assert_eq!(remote.topic, "turret/joystick");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn duplicate_pin_is_fatal() {
        let doctored = SAMPLE.replace("pin = 18", "pin = 2");
        let path = write_config(&doctored);
        let err = TurretConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn out_of_range_pin_is_fatal() {
        let doctored = SAMPLE.replace("step_pin = 2\n", "step_pin = 99\n");
        let path = write_config(&doctored);
        let err = TurretConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("outside the valid range"), "{err}");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn bad_microsteps_are_fatal() {
        let doctored = SAMPLE.replacen("microsteps = 8", "microsteps = 3", 1);
        let path = write_config(&doctored);
        let err = TurretConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("microsteps"), "{err}");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let doctored = SAMPLE.replace("step_delay = 0.001\n", "");
        let path = write_config(&doctored);
        let err = TurretConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("step_delay"), "{err}");
        let _ = std::fs::remove_file(path);
    }
}
