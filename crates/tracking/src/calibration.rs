//! Persisted tracking calibration.
//!
//! One small key-value blob survives restarts: pixel-to-step scale factors,
//! the dead zone, travel bounds, PID gains, and the loss-recenter switch.
//! Writes are atomic (write to a sibling temp file, then rename) so a crash
//! mid-save never leaves a torn blob behind.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::{ControlError, PidGains};

/// Pixel-to-step mapping and tracking tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub x_steps_per_pixel: f64,
    pub y_steps_per_pixel: f64,
    pub dead_zone_pixels: u32,
    pub x_max_steps_from_home: i64,
    pub y_max_steps_from_home: i64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub recenter_on_loss: bool,
}

impl Calibration {
    pub fn gains(&self) -> PidGains {
        PidGains {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
        }
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if !(self.x_steps_per_pixel > 0.0) || !(self.y_steps_per_pixel > 0.0) {
            return Err(ControlError::InvalidCalibration(
                "steps_per_pixel must be positive".into(),
            ));
        }
        if self.x_max_steps_from_home <= 0 || self.y_max_steps_from_home <= 0 {
            return Err(ControlError::InvalidCalibration(
                "max_steps_from_home must be positive".into(),
            ));
        }
        self.gains().validate()
    }
}

fn parse_into<T: FromStr>(value: &str, slot: &mut T) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

/// `key: value` file storage for [`Calibration`].
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads the blob, falling back to `defaults` when the file is absent.
    /// Individual missing keys keep their default; unknown keys warn.
    pub fn load_or(&self, defaults: &Calibration) -> Result<Calibration, ControlError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no calibration blob, using defaults");
                return Ok(defaults.clone());
            }
            Err(err) => return Err(err.into()),
        };

        let mut cal = defaults.clone();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                warn!(line = index + 1, "skipping malformed calibration line");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            let parsed = match key {
                "x_steps_per_pixel" => parse_into(value, &mut cal.x_steps_per_pixel),
                "y_steps_per_pixel" => parse_into(value, &mut cal.y_steps_per_pixel),
                "dead_zone_pixels" => parse_into(value, &mut cal.dead_zone_pixels),
                "x_max_steps_from_home" => parse_into(value, &mut cal.x_max_steps_from_home),
                "y_max_steps_from_home" => parse_into(value, &mut cal.y_max_steps_from_home),
                "kp" => parse_into(value, &mut cal.kp),
                "ki" => parse_into(value, &mut cal.ki),
                "kd" => parse_into(value, &mut cal.kd),
                "recenter_on_loss" => parse_into(value, &mut cal.recenter_on_loss),
                _ => {
                    warn!(key, "unknown calibration key");
                    true
                }
            };
            if !parsed {
                warn!(key, line = index + 1, "unparseable calibration value, keeping default");
            }
        }
        debug!(path = %self.path.display(), "calibration loaded");
        Ok(cal)
    }

    /// Atomic write-rename.
    pub fn save(&self, cal: &Calibration) -> Result<(), ControlError> {
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        write!(
            file,
            "x_steps_per_pixel: {}\n\
             y_steps_per_pixel: {}\n\
             dead_zone_pixels: {}\n\
             x_max_steps_from_home: {}\n\
             y_max_steps_from_home: {}\n\
             kp: {}\n\
             ki: {}\n\
             kd: {}\n\
             recenter_on_loss: {}\n",
            cal.x_steps_per_pixel,
            cal.y_steps_per_pixel,
            cal.dead_zone_pixels,
            cal.x_max_steps_from_home,
            cal.y_max_steps_from_home,
            cal.kp,
            cal.ki,
            cal.kd,
            cal.recenter_on_loss,
        )?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "calibration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Calibration {
        Calibration {
            x_steps_per_pixel: 0.1,
            y_steps_per_pixel: 0.12,
            dead_zone_pixels: 20,
            x_max_steps_from_home: 500,
            y_max_steps_from_home: 400,
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            recenter_on_loss: true,
        }
    }

    fn temp_store() -> CalibrationStore {
        let path = std::env::temp_dir().join(format!("turret-cal-{}", rand::random::<u32>()));
        CalibrationStore::new(path)
    }

    #[test]
    fn absent_file_yields_defaults() {
        let store = temp_store();
        let cal = store.load_or(&defaults()).unwrap();
        assert_eq!(cal, defaults());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = temp_store();
        let mut cal = defaults();
        cal.x_steps_per_pixel = 0.25;
        cal.kp = 2.5;
        cal.recenter_on_loss = false;

        store.save(&cal).unwrap();
        let loaded = store.load_or(&defaults()).unwrap();
        assert_eq!(loaded, cal);
    }

    #[test]
    fn unknown_and_torn_lines_keep_defaults() {
        let store = temp_store();
        store.save(&defaults()).unwrap();
        let path = store.path.clone();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("mystery_key: 7\nkp garbage\nki: not-a-number\n");
        fs::write(&path, text).unwrap();

        let loaded = store.load_or(&defaults()).unwrap();
        assert_eq!(loaded, defaults());
    }

    #[test]
    fn validation_rejects_nonpositive_scale() {
        let mut cal = defaults();
        cal.x_steps_per_pixel = 0.0;
        assert!(cal.validate().is_err());
    }
}
