//! Operator-facing command set.
//!
//! Every producer (joystick, detector, operator socket) talks to the core
//! through these tagged variants; there is no other way to reach the motors
//! or the laser.

use motion::Direction;
use std::fmt::Display;
use std::time::Instant;
use tracking::{Axis, TrackMode};

/// Tagged commands consumed by the arbiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bounded manual step request on one axis.
    Jog {
        axis: Axis,
        steps: u32,
        direction: Direction,
    },
    /// Move to an absolute position relative to home.
    MoveAbsolute { x_steps: i64, y_steps: i64 },
    /// Convert a clicked pixel into a step delta and enqueue it.
    CenterOnPixel {
        x: f64,
        y: f64,
        frame_w: u32,
        frame_h: u32,
    },
    /// Detector-sourced centroid; subject to PID and the dead zone.
    TrackTarget {
        cx: f64,
        cy: f64,
        frame_w: u32,
        frame_h: u32,
        ts: Instant,
    },
    SetMode(TrackMode),
    Home,
    SetHome,
    Enable,
    Disable,
    LaserArm(bool),
    LaserSetPower { pct: u8 },
    /// `duration_ms == 0` selects the configured default pulse.
    LaserFire { duration_ms: u64 },
    LaserBurst { count: u32, on_ms: u64, off_ms: u64 },
}

impl Command {
    /// Safety commands jump ahead of buffered general traffic.
    pub fn is_safety(&self) -> bool {
        matches!(self, Command::Disable | Command::LaserArm(false))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Jog { .. } => "jog",
            Command::MoveAbsolute { .. } => "move_absolute",
            Command::CenterOnPixel { .. } => "center_on_pixel",
            Command::TrackTarget { .. } => "track_target",
            Command::SetMode(_) => "set_mode",
            Command::Home => "home",
            Command::SetHome => "set_home",
            Command::Enable => "enable",
            Command::Disable => "disable",
            Command::LaserArm(_) => "laser_arm",
            Command::LaserSetPower { .. } => "laser_set_power",
            Command::LaserFire { .. } => "laser_fire",
            Command::LaserBurst { .. } => "laser_burst",
        }
    }
}

/// Reply to a submitted command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Ok,
    Rejected(String),
}

impl CommandOutcome {
    pub fn rejected(reason: impl Display) -> Self {
        CommandOutcome::Rejected(reason.to_string())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Ok)
    }
}
