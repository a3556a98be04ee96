//! Single-consumer command pipeline.
//!
//! Every producer posts onto one of two bounded lanes; one consumer
//! dispatches to the tracking controller and the laser. Safety commands
//! (`Disable`, `LaserArm(false)`) travel on their own lane and a biased
//! select drains it first, so they overtake any buffered motion traffic.
//! The same consumer runs the idle watchdog: after `idle_timeout` without
//! input the motors are released and the laser disarmed, and the next
//! general command re-enables the motors before it is dispatched.

use laser::LaserSafetyController;
use motion::Direction;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracking::{Axis, TrackingController};

use crate::command::{Command, CommandOutcome};
use crate::telemetry::ErrorLog;

/// Depth of the general command lane.
pub const GENERAL_QUEUE_DEPTH: usize = 64;
const SAFETY_QUEUE_DEPTH: usize = 8;

pub struct CommandRequest {
    command: Command,
    reply: Option<oneshot::Sender<CommandOutcome>>,
}

/// Cloneable producer side of the pipeline.
#[derive(Clone)]
pub struct ArbiterHandle {
    general: mpsc::Sender<CommandRequest>,
    safety: mpsc::Sender<CommandRequest>,
}

impl ArbiterHandle {
    fn lane(&self, command: &Command) -> &mpsc::Sender<CommandRequest> {
        if command.is_safety() {
            &self.safety
        } else {
            &self.general
        }
    }

    /// Submits a command and waits for its outcome.
    pub async fn submit(&self, command: Command) -> CommandOutcome {
        let (tx, rx) = oneshot::channel();
        let lane = self.lane(&command);
        let request = CommandRequest {
            command,
            reply: Some(tx),
        };
        if lane.send(request).await.is_err() {
            return CommandOutcome::rejected("arbiter is gone");
        }
        rx.await
            .unwrap_or_else(|_| CommandOutcome::rejected("arbiter dropped the command"))
    }

    /// Non-blocking post for producers that must not stall (joystick,
    /// detector). Returns `false` when the lane is full; callers drop the
    /// sample and wait for the next one instead of spinning.
    pub fn post(&self, command: Command) -> bool {
        self.lane(&command)
            .try_send(CommandRequest {
                command,
                reply: None,
            })
            .is_ok()
    }
}

/// The consumer half. Built once, then driven by [`CommandArbiter::run`].
pub struct CommandArbiter {
    dispatcher: Dispatcher,
    general_rx: mpsc::Receiver<CommandRequest>,
    safety_rx: mpsc::Receiver<CommandRequest>,
}

impl CommandArbiter {
    pub fn new(
        tracker: Arc<TrackingController>,
        laser: Arc<LaserSafetyController>,
        errors: Arc<ErrorLog>,
        idle_timeout: Duration,
    ) -> (ArbiterHandle, CommandArbiter) {
        let (general_tx, general_rx) = mpsc::channel(GENERAL_QUEUE_DEPTH);
        let (safety_tx, safety_rx) = mpsc::channel(SAFETY_QUEUE_DEPTH);
        (
            ArbiterHandle {
                general: general_tx,
                safety: safety_tx,
            },
            CommandArbiter {
                dispatcher: Dispatcher {
                    tracker,
                    laser,
                    errors,
                    idle_timeout,
                    last_input: Instant::now(),
                    suspended: false,
                },
                general_rx,
                safety_rx,
            },
        )
    }

    /// Drains both lanes until every handle is dropped.
    pub async fn run(self) {
        let CommandArbiter {
            mut dispatcher,
            mut general_rx,
            mut safety_rx,
        } = self;
        let poll = (dispatcher.idle_timeout / 4)
            .clamp(Duration::from_millis(25), Duration::from_secs(1));
        let mut ticker = tokio::time::interval(poll);
        info!("command arbiter running");
        loop {
            tokio::select! {
                biased;
                request = safety_rx.recv() => match request {
                    Some(request) => dispatcher.handle(request).await,
                    None => break,
                },
                request = general_rx.recv() => match request {
                    Some(request) => {
                        dispatcher.touch();
                        dispatcher.handle(request).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => dispatcher.idle_check(),
            }
        }
        info!("command arbiter exiting");
    }
}

fn outcome<T, E: std::fmt::Display>(result: Result<T, E>) -> CommandOutcome {
    match result {
        Ok(_) => CommandOutcome::Ok,
        Err(err) => CommandOutcome::rejected(err),
    }
}

struct Dispatcher {
    tracker: Arc<TrackingController>,
    laser: Arc<LaserSafetyController>,
    errors: Arc<ErrorLog>,
    idle_timeout: Duration,
    last_input: Instant,
    suspended: bool,
}

impl Dispatcher {
    /// Marks producer activity; the first command after an idle suspension
    /// re-enables the motors before it is dispatched.
    fn touch(&mut self) {
        self.last_input = Instant::now();
        if self.suspended {
            info!("input resumed, re-enabling motors");
            if let Err(err) = self.tracker.enable() {
                warn!(error = %err, "re-enable after idle failed");
            }
            self.suspended = false;
        }
    }

    fn idle_check(&mut self) {
        if self.suspended || self.last_input.elapsed() < self.idle_timeout {
            return;
        }
        info!(timeout = ?self.idle_timeout, "idle timeout, releasing motors and disarming laser");
        if let Err(err) = self.tracker.disable() {
            warn!(error = %err, "idle disable failed");
        }
        if let Err(err) = self.laser.arm(false) {
            warn!(error = %err, "idle disarm failed");
        }
        self.suspended = true;
    }

    async fn handle(&mut self, request: CommandRequest) {
        let name = request.command.name();
        let result = self.dispatch(request.command).await;
        if let CommandOutcome::Rejected(reason) = &result {
            warn!(command = name, %reason, "command rejected");
            self.errors.record(format!("{name}: {reason}"));
        }
        if let Some(reply) = request.reply {
            let _ = reply.send(result);
        }
    }

    async fn dispatch(&mut self, command: Command) -> CommandOutcome {
        match command {
            Command::Jog {
                axis,
                steps,
                direction,
            } => {
                let delta = match direction {
                    Direction::Cw => steps as i64,
                    Direction::Ccw => -(steps as i64),
                };
                let (dx, dy) = match axis {
                    Axis::X => (delta, 0),
                    Axis::Y => (0, delta),
                };
                outcome(self.tracker.move_by(dx, dy))
            }
            Command::MoveAbsolute { x_steps, y_steps } => {
                outcome(self.tracker.move_to(x_steps, y_steps))
            }
            Command::CenterOnPixel {
                x,
                y,
                frame_w,
                frame_h,
            } => outcome(self.tracker.center_on_pixel(x, y, frame_w, frame_h)),
            Command::TrackTarget {
                cx,
                cy,
                frame_w,
                frame_h,
                ts,
            } => outcome(self.tracker.track_target(cx, cy, frame_w, frame_h, ts)),
            Command::SetMode(mode) => outcome(self.tracker.set_mode(mode).await),
            Command::Home => outcome(self.tracker.home().await),
            Command::SetHome => {
                self.tracker.set_home_here();
                CommandOutcome::Ok
            }
            Command::Enable => outcome(self.tracker.enable()),
            Command::Disable => outcome(self.tracker.disable()),
            Command::LaserArm(armed) => outcome(self.laser.arm(armed)),
            Command::LaserSetPower { pct } => {
                let applied = self.laser.set_power(pct);
                info!(requested = pct, applied, "laser power set");
                CommandOutcome::Ok
            }
            Command::LaserFire { duration_ms } => {
                let duration = if duration_ms == 0 {
                    self.laser.default_pulse()
                } else {
                    Duration::from_millis(duration_ms)
                };
                self.spawn_fire(duration)
            }
            Command::LaserBurst {
                count,
                on_ms,
                off_ms,
            } => self.spawn_burst(count, on_ms, off_ms),
        }
    }

    /// Reserves the laser synchronously so the reply is authoritative even
    /// under back-to-back submissions; only the pulse timing runs in the
    /// background.
    fn spawn_fire(&self, duration: Duration) -> CommandOutcome {
        let claim = match self.laser.claim() {
            Ok(claim) => claim,
            Err(err) => return CommandOutcome::rejected(err),
        };
        let laser = self.laser.clone();
        let errors = self.errors.clone();
        tokio::spawn(async move {
            if let Err(err) = laser.fire_claimed(claim, duration).await {
                warn!(error = %err, "fire failed");
                errors.record(format!("laser_fire: {err}"));
            }
        });
        CommandOutcome::Ok
    }

    fn spawn_burst(&self, count: u32, on_ms: u64, off_ms: u64) -> CommandOutcome {
        if count == 0 {
            return CommandOutcome::rejected("burst of zero pulses");
        }
        let claim = match self.laser.claim() {
            Ok(claim) => claim,
            Err(err) => return CommandOutcome::rejected(err),
        };
        let laser = self.laser.clone();
        let errors = self.errors.clone();
        tokio::spawn(async move {
            match laser
                .burst_claimed(
                    claim,
                    count,
                    Duration::from_millis(on_ms),
                    Duration::from_millis(off_ms),
                )
                .await
            {
                Ok(completed) => info!(completed, requested = count, "burst finished"),
                Err(err) => {
                    warn!(error = %err, "burst failed");
                    errors.record(format!("laser_burst: {err}"));
                }
            }
        });
        CommandOutcome::Ok
    }
}
