//! Remote joystick ingestor.
//!
//! Samples arrive over MQTT on a single topic as ASCII CSV
//! `"x,y,joy_btn,laser_btn,power"` with `x, y` in -100..=100 and `power` in
//! 0..=100. Deflections map to bounded jogs; a rising edge on the fire
//! button triggers the default pulse at the sample's power, but only while
//! the laser is armed. Malformed payloads are dropped with a warning and do
//! not count as activity for the idle watchdog.

use laser::LaserSafetyController;
use motion::Direction;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use tracking::Axis;

use crate::arbiter::ArbiterHandle;
use crate::command::Command;

/// Reconnect backoff after a broker error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    /// Stick deflection below this magnitude is ignored.
    pub deadzone: u8,
    pub speed_scaling: f64,
    pub max_steps_per_update: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("field '{0}' is malformed")]
    Field(&'static str),
    #[error("'{0}' out of range")]
    Range(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoystickSample {
    pub x: i32,
    pub y: i32,
    pub joy_btn: bool,
    pub laser_btn: bool,
    pub power: u8,
}

pub fn parse_joystick_line(line: &str) -> Result<JoystickSample, RemoteParseError> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.len() != 5 {
        return Err(RemoteParseError::FieldCount(fields.len()));
    }
    let parse_bool = |raw: &str, name: &'static str| match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(RemoteParseError::Field(name)),
    };
    let x: i32 = fields[0]
        .trim()
        .parse()
        .map_err(|_| RemoteParseError::Field("x"))?;
    let y: i32 = fields[1]
        .trim()
        .parse()
        .map_err(|_| RemoteParseError::Field("y"))?;
    let joy_btn = parse_bool(fields[2], "joy_btn")?;
    let laser_btn = parse_bool(fields[3], "laser_btn")?;
    let power: u8 = fields[4]
        .trim()
        .parse()
        .map_err(|_| RemoteParseError::Field("power"))?;
    if !(-100..=100).contains(&x) {
        return Err(RemoteParseError::Range("x"));
    }
    if !(-100..=100).contains(&y) {
        return Err(RemoteParseError::Range("y"));
    }
    if power > 100 {
        return Err(RemoteParseError::Range("power"));
    }
    Ok(JoystickSample {
        x,
        y,
        joy_btn,
        laser_btn,
        power,
    })
}

/// Maps one stick axis to a signed step count:
/// `round((|v| - deadzone) * speed_scaling * max_steps_per_update /
/// (100 - deadzone))`, zero inside the deadzone.
pub fn joystick_steps(
    value: i32,
    deadzone: u8,
    speed_scaling: f64,
    max_steps_per_update: u32,
) -> i64 {
    let magnitude = value.unsigned_abs() as f64;
    let dz = deadzone as f64;
    if magnitude < dz || dz >= 100.0 {
        return 0;
    }
    let span = 100.0 - dz;
    let scaled = (magnitude - dz).min(span) * speed_scaling * max_steps_per_update as f64 / span;
    let steps = scaled.round() as i64;
    if value < 0 {
        -steps
    } else {
        steps
    }
}

/// Turns one joystick sample into commands. `prev_laser_btn` carries the
/// button state across samples for edge detection.
pub fn apply_sample(
    sample: &JoystickSample,
    settings: &RemoteSettings,
    handle: &ArbiterHandle,
    laser: &LaserSafetyController,
    prev_laser_btn: &mut bool,
) {
    let dx = joystick_steps(
        sample.x,
        settings.deadzone,
        settings.speed_scaling,
        settings.max_steps_per_update,
    );
    let dy = joystick_steps(
        sample.y,
        settings.deadzone,
        settings.speed_scaling,
        settings.max_steps_per_update,
    );
    for (axis, delta) in [(Axis::X, dx), (Axis::Y, dy)] {
        if delta == 0 {
            continue;
        }
        let command = Command::Jog {
            axis,
            steps: delta.unsigned_abs() as u32,
            direction: if delta > 0 {
                Direction::Cw
            } else {
                Direction::Ccw
            },
        };
        if !handle.post(command) {
            debug!("command lane full, dropping joystick jog");
        }
    }

    let rising = sample.laser_btn && !*prev_laser_btn;
    *prev_laser_btn = sample.laser_btn;
    if rising {
        if laser.armed() {
            let pulse_ms = laser.default_pulse().as_millis() as u64;
            // The pulse is only posted once the power it belongs to made it
            // into the lane; a fire at a stale power is never queued.
            if !handle.post(Command::LaserSetPower { pct: sample.power }) {
                debug!("command lane full, dropping power update and fire request");
            } else if !handle.post(Command::LaserFire {
                duration_ms: pulse_ms,
            }) {
                debug!("command lane full, dropping fire request");
            }
        } else {
            debug!("fire button ignored, laser disarmed");
        }
    }
}

/// Connects to the broker and feeds joystick samples into the pipeline
/// until the process shuts down. Broker loss is retried forever.
pub async fn run_remote_ingestor(
    settings: RemoteSettings,
    handle: ArbiterHandle,
    laser: Arc<LaserSafetyController>,
) {
    let mut options = MqttOptions::new(
        settings.client_id.clone(),
        settings.host.clone(),
        settings.port,
    );
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    info!(host = %settings.host, port = settings.port, topic = %settings.topic, "remote ingestor starting");

    let mut prev_laser_btn = false;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to broker, subscribing");
                if let Err(err) = client
                    .subscribe(settings.topic.clone(), QoS::AtMostOnce)
                    .await
                {
                    warn!(error = %err, "subscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match std::str::from_utf8(&publish.payload) {
                    Ok(text) => match parse_joystick_line(text) {
                        Ok(sample) => {
                            apply_sample(&sample, &settings, &handle, &laser, &mut prev_laser_btn)
                        }
                        Err(err) => warn!(error = %err, "dropping malformed joystick sample"),
                    },
                    Err(_) => warn!("dropping non-utf8 joystick payload"),
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "broker connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
