//! The tracking controller and its mover thread.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use motion::{AxisStatus, CancelToken, Direction, MotionError, StepperAxis, Termination};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{AxisPid, Calibration, CalibrationStore, ControlError, PidGains};

/// Wake interval of the idle mover; paces the loss-of-target check and
/// recenter steps.
const MOVER_TICK: Duration = Duration::from_millis(25);

/// Depth of the mover mailbox.
const MOVER_QUEUE_DEPTH: usize = 64;

/// Bounds on the inter-sample interval fed to the PID.
const MIN_DT: Duration = Duration::from_millis(1);
const MAX_DT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

/// Operator-selectable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    /// Reticle only; all motor motion refused.
    Crosshair,
    /// Motors live, manual and auto tracking available.
    Camera,
}

/// Full mode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Crosshair,
    CameraIdle,
    CameraHoming,
    CameraTracking,
    CameraDisabled,
}

/// One detector observation.
#[derive(Debug, Clone, Copy)]
struct TrackSample {
    cx: f64,
    cy: f64,
    frame_w: u32,
    frame_h: u32,
    ts: Instant,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum inter-step delay handed to the axes.
    pub step_delay_s: f64,
    /// Silence on the target feed before loss handling kicks in.
    pub loss_timeout: Duration,
    /// Steps per mover tick when easing back home after target loss.
    pub home_recenter_rate: u32,
    /// Seed calibration; the persisted blob overrides it when present.
    pub defaults: Calibration,
    pub calibration_path: Option<PathBuf>,
}

enum MoverRequest {
    Relative { dx: i64, dy: i64 },
    Absolute { x: i64, y: i64 },
    Track,
    Home { done: oneshot::Sender<Result<(), ControlError>> },
    SetMode { mode: TrackMode, done: oneshot::Sender<Result<(), ControlError>> },
    Flush { done: oneshot::Sender<()> },
    Shutdown,
}

/// Last PID evaluation, echoed into telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PidEcho {
    pub x_integral: f64,
    pub y_integral: f64,
    /// Controller outputs in pixel units.
    pub x_output: f64,
    pub y_output: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AxisTelemetry {
    pub position: i64,
    pub status: AxisStatus,
    pub triggered_limit: Option<Direction>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerTelemetry {
    pub mode: ControlState,
    pub x: AxisTelemetry,
    pub y: AxisTelemetry,
    pub last_target_age_ms: Option<u64>,
    pub pid: PidGains,
    pub pid_echo: PidEcho,
    pub calibration: Calibration,
}

struct TrackerShared {
    x: Arc<StepperAxis>,
    y: Arc<StepperAxis>,
    cfg: TrackerConfig,
    calibration: RwLock<Calibration>,
    store: Option<CalibrationStore>,
    state: Mutex<ControlState>,
    /// Latest unprocessed detector sample; newest always wins.
    pending_track: Mutex<Option<TrackSample>>,
    last_target: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    pid_echo: Mutex<PidEcho>,
    cancel: CancelToken,
    shutting_down: AtomicBool,
}

impl TrackerShared {
    fn axis(&self, axis: Axis) -> &StepperAxis {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
        }
    }

    fn record_error(&self, message: String) {
        warn!(%message, "motion error");
        *self.last_error.lock() = Some(message);
    }
}

/// Owns the axis pair and the single mover thread.
pub struct TrackingController {
    shared: Arc<TrackerShared>,
    tx: Sender<MoverRequest>,
    mover: Mutex<Option<JoinHandle<()>>>,
}

impl TrackingController {
    /// Loads the persisted calibration, enables both axes, and starts the
    /// mover. The controller comes up in `CameraIdle`.
    pub fn spawn(
        x: Arc<StepperAxis>,
        y: Arc<StepperAxis>,
        cfg: TrackerConfig,
    ) -> Result<Arc<Self>, ControlError> {
        cfg.defaults.validate()?;
        let store = cfg.calibration_path.clone().map(CalibrationStore::new);
        let calibration = match &store {
            Some(store) => {
                let cal = store.load_or(&cfg.defaults)?;
                cal.validate()?;
                cal
            }
            None => cfg.defaults.clone(),
        };

        x.enable()?;
        y.enable()?;

        let (tx, rx) = bounded(MOVER_QUEUE_DEPTH);
        let shared = Arc::new(TrackerShared {
            x,
            y,
            cfg,
            calibration: RwLock::new(calibration),
            store,
            state: Mutex::new(ControlState::CameraIdle),
            pending_track: Mutex::new(None),
            last_target: Mutex::new(None),
            last_error: Mutex::new(None),
            pid_echo: Mutex::new(PidEcho::default()),
            cancel: CancelToken::new(),
            shutting_down: AtomicBool::new(false),
        });

        let mover_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("turret-mover".into())
            .spawn(move || MoverLoop::new(mover_shared, rx).run())?;

        Ok(Arc::new(Self {
            shared,
            tx,
            mover: Mutex::new(Some(handle)),
        }))
    }

    pub fn mode(&self) -> ControlState {
        *self.shared.state.lock()
    }

    pub fn pid(&self) -> PidGains {
        self.shared.calibration.read().gains()
    }

    pub fn calibration(&self) -> Calibration {
        self.shared.calibration.read().clone()
    }

    /// Time since the last accepted `track_target` call.
    pub fn last_target_age(&self) -> Option<Duration> {
        self.shared.last_target.lock().map(|t| t.elapsed())
    }

    /// Takes the most recent motion error, if one happened since the last
    /// call. Consumed by the telemetry publisher.
    pub fn take_last_error(&self) -> Option<String> {
        self.shared.last_error.lock().take()
    }

    pub fn telemetry(&self) -> TrackerTelemetry {
        let axis_view = |ax: &StepperAxis| AxisTelemetry {
            position: ax.position(),
            status: ax.status(),
            triggered_limit: ax.triggered_limit(),
            enabled: ax.is_enabled(),
        };
        TrackerTelemetry {
            mode: self.mode(),
            x: axis_view(&self.shared.x),
            y: axis_view(&self.shared.y),
            last_target_age_ms: self.last_target_age().map(|age| age.as_millis() as u64),
            pid: self.pid(),
            pid_echo: *self.shared.pid_echo.lock(),
            calibration: self.calibration(),
        }
    }

    fn send(&self, request: MoverRequest) -> Result<(), ControlError> {
        self.tx
            .send_timeout(request, Duration::from_millis(250))
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => ControlError::QueueFull,
                SendTimeoutError::Disconnected(_) => ControlError::Shutdown,
            })
    }

    fn check_motion_allowed(&self) -> Result<(), ControlError> {
        match *self.shared.state.lock() {
            ControlState::Crosshair => Err(ControlError::ModeDisabled),
            ControlState::CameraDisabled => Err(ControlError::Disabled),
            _ => Ok(()),
        }
    }

    /// Relative move, clamped against the travel bounds at execution time.
    pub fn move_by(&self, dx: i64, dy: i64) -> Result<(), ControlError> {
        self.check_motion_allowed()?;
        // Refuse jogs straight into a latched limit.
        for (axis, delta) in [(Axis::X, dx), (Axis::Y, dy)] {
            if delta == 0 {
                continue;
            }
            let direction = if delta > 0 { Direction::Cw } else { Direction::Ccw };
            if self.shared.axis(axis).triggered_limit() == Some(direction) {
                return Err(MotionError::LimitBlocked(direction).into());
            }
        }
        self.send(MoverRequest::Relative { dx, dy })
    }

    /// Absolute move relative to home.
    pub fn move_to(&self, x_steps: i64, y_steps: i64) -> Result<(), ControlError> {
        self.check_motion_allowed()?;
        self.send(MoverRequest::Absolute {
            x: x_steps,
            y: y_steps,
        })
    }

    /// Recenter the view on a clicked pixel. Offsets inside the dead zone
    /// produce no motion on that axis.
    pub fn center_on_pixel(
        &self,
        px: f64,
        py: f64,
        frame_w: u32,
        frame_h: u32,
    ) -> Result<(), ControlError> {
        self.check_motion_allowed()?;
        let cal = self.shared.calibration.read().clone();
        let dead = cal.dead_zone_pixels as f64;
        let ex = px - frame_w as f64 / 2.0;
        let ey = py - frame_h as f64 / 2.0;
        let dx = if ex.abs() <= dead {
            0
        } else {
            (ex * cal.x_steps_per_pixel).round() as i64
        };
        let dy = if ey.abs() <= dead {
            0
        } else {
            (ey * cal.y_steps_per_pixel).round() as i64
        };
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        self.send(MoverRequest::Relative { dx, dy })
    }

    /// Feeds one detector centroid. The newest pending sample replaces any
    /// older one; the mover acts on whatever is newest when it goes idle.
    pub fn track_target(
        &self,
        cx: f64,
        cy: f64,
        frame_w: u32,
        frame_h: u32,
        ts: Instant,
    ) -> Result<(), ControlError> {
        self.check_motion_allowed()?;
        if frame_w == 0 || frame_h == 0 {
            return Err(ControlError::InvalidRequest("zero frame dimensions".into()));
        }
        *self.shared.last_target.lock() = Some(Instant::now());
        *self.shared.pending_track.lock() = Some(TrackSample {
            cx,
            cy,
            frame_w,
            frame_h,
            ts,
        });
        match self.tx.try_send(MoverRequest::Track) {
            // A full queue is fine: some queued marker or the next idle
            // tick will pick the sample up.
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::Shutdown),
        }
    }

    /// Homes both axes sequentially. Resolves when both are done.
    pub async fn home(&self) -> Result<(), ControlError> {
        self.check_motion_allowed()?;
        let (done, rx) = oneshot::channel();
        self.send(MoverRequest::Home { done })?;
        rx.await.map_err(|_| ControlError::Shutdown)?
    }

    /// Switches between crosshair and camera mode. Entering crosshair homes
    /// the axes first.
    pub async fn set_mode(&self, mode: TrackMode) -> Result<(), ControlError> {
        let (done, rx) = oneshot::channel();
        self.send(MoverRequest::SetMode { mode, done })?;
        rx.await.map_err(|_| ControlError::Shutdown)?
    }

    /// Resolves once every request enqueued before it has been processed.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(MoverRequest::Flush { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn set_home_here(&self) {
        self.shared.x.set_home_here();
        self.shared.y.set_home_here();
    }

    /// Re-asserts the driver enable lines and leaves `CameraDisabled`.
    pub fn enable(&self) -> Result<(), ControlError> {
        self.shared.cancel.clear();
        self.shared.x.enable()?;
        self.shared.y.enable()?;
        let mut state = self.shared.state.lock();
        if *state == ControlState::CameraDisabled {
            *state = ControlState::CameraIdle;
        }
        info!("motors enabled");
        Ok(())
    }

    /// Releases both drivers. In-flight motion stops at the next pulse
    /// boundary; queued motion is dropped by the mover while disabled.
    pub fn disable(&self) -> Result<(), ControlError> {
        self.shared.cancel.cancel();
        self.shared.x.release()?;
        self.shared.y.release()?;
        *self.shared.state.lock() = ControlState::CameraDisabled;
        info!("motors released");
        Ok(())
    }

    /// Re-derives an axis scale from a measured move. Persists the result.
    pub fn calibrate_axis(
        &self,
        axis: Axis,
        pixels_moved: f64,
        steps_executed: i64,
    ) -> Result<f64, ControlError> {
        if !pixels_moved.is_finite() || pixels_moved == 0.0 {
            return Err(ControlError::InvalidRequest(
                "pixels_moved must be finite and non-zero".into(),
            ));
        }
        let steps_per_pixel = (steps_executed as f64 / pixels_moved).abs();
        if !(steps_per_pixel > 0.0) {
            return Err(ControlError::InvalidRequest(
                "calibration would zero the axis scale".into(),
            ));
        }
        {
            let mut cal = self.shared.calibration.write();
            match axis {
                Axis::X => cal.x_steps_per_pixel = steps_per_pixel,
                Axis::Y => cal.y_steps_per_pixel = steps_per_pixel,
            }
        }
        info!(?axis, steps_per_pixel, "axis calibrated");
        self.persist()?;
        Ok(steps_per_pixel)
    }

    pub fn set_pid(&self, gains: PidGains) -> Result<(), ControlError> {
        gains.validate()?;
        {
            let mut cal = self.shared.calibration.write();
            cal.kp = gains.kp;
            cal.ki = gains.ki;
            cal.kd = gains.kd;
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), ControlError> {
        if let Some(store) = &self.shared.store {
            let cal = self.shared.calibration.read().clone();
            store.save(&cal)?;
        }
        Ok(())
    }

    /// Stops the mover thread and releases both drivers. Idempotent; part
    /// of process teardown.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        let _ = self.tx.try_send(MoverRequest::Shutdown);
        if let Some(handle) = self.mover.lock().take() {
            if handle.join().is_err() {
                warn!("mover thread panicked");
            }
        }
        if let Err(err) = self.shared.x.release() {
            warn!(error = %err, "releasing x axis at shutdown failed");
        }
        if let Err(err) = self.shared.y.release() {
            warn!(error = %err, "releasing y axis at shutdown failed");
        }
        info!("tracking controller shut down");
    }
}

/// The single thread with the right to emit motor pulses.
struct MoverLoop {
    shared: Arc<TrackerShared>,
    rx: Receiver<MoverRequest>,
    x_pid: AxisPid<f64>,
    y_pid: AxisPid<f64>,
    last_sample_ts: Option<Instant>,
    loss_handled: bool,
}

impl MoverLoop {
    fn new(shared: Arc<TrackerShared>, rx: Receiver<MoverRequest>) -> Self {
        Self {
            shared,
            rx,
            x_pid: AxisPid::new(),
            y_pid: AxisPid::new(),
            last_sample_ts: None,
            loss_handled: false,
        }
    }

    fn run(mut self) {
        info!("mover thread running");
        loop {
            if self.shared.shutting_down.load(Ordering::Acquire) {
                break;
            }
            match self.rx.recv_timeout(MOVER_TICK) {
                Ok(MoverRequest::Shutdown) => break,
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => self.idle_tick(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("mover thread exiting");
    }

    fn handle(&mut self, request: MoverRequest) {
        match request {
            MoverRequest::Relative { dx, dy } => {
                if self.motion_allowed() {
                    self.note_activity();
                    self.execute_relative(dx, dy);
                }
            }
            MoverRequest::Absolute { x, y } => {
                if self.motion_allowed() {
                    self.note_activity();
                    self.execute_absolute(x, y);
                }
            }
            MoverRequest::Track => {
                let sample = self.shared.pending_track.lock().take();
                if let Some(sample) = sample {
                    self.process_track(sample);
                }
            }
            MoverRequest::Home { done } => {
                let _ = done.send(self.do_home());
            }
            MoverRequest::SetMode { mode, done } => {
                let _ = done.send(self.do_set_mode(mode));
            }
            MoverRequest::Flush { done } => {
                let _ = done.send(());
            }
            MoverRequest::Shutdown => {}
        }
    }

    fn motion_allowed(&self) -> bool {
        !matches!(
            *self.shared.state.lock(),
            ControlState::Crosshair | ControlState::CameraDisabled
        )
    }

    fn note_activity(&self) {
        let mut state = self.shared.state.lock();
        if *state == ControlState::CameraIdle {
            *state = ControlState::CameraTracking;
        }
    }

    fn reset_pids(&mut self) {
        self.x_pid.reset();
        self.y_pid.reset();
        self.last_sample_ts = None;
        *self.shared.pid_echo.lock() = PidEcho::default();
    }

    fn execute_relative(&mut self, dx: i64, dy: i64) {
        let cal = self.shared.calibration.read().clone();
        self.move_axis(Axis::X, dx, cal.x_max_steps_from_home);
        self.move_axis(Axis::Y, dy, cal.y_max_steps_from_home);
    }

    fn execute_absolute(&mut self, x: i64, y: i64) {
        let cal = self.shared.calibration.read().clone();
        let dx = x.clamp(-cal.x_max_steps_from_home, cal.x_max_steps_from_home)
            - self.shared.x.position();
        let dy = y.clamp(-cal.y_max_steps_from_home, cal.y_max_steps_from_home)
            - self.shared.y.position();
        self.move_axis(Axis::X, dx, cal.x_max_steps_from_home);
        self.move_axis(Axis::Y, dy, cal.y_max_steps_from_home);
    }

    /// Steps one axis by `delta`, clamping the resulting position into the
    /// travel bounds.
    fn move_axis(&mut self, axis: Axis, delta: i64, max_from_home: i64) {
        if delta == 0 {
            return;
        }
        let ax = self.shared.axis(axis);
        let position = ax.position();
        let target = (position + delta).clamp(-max_from_home, max_from_home);
        let clamped = target - position;
        if clamped == 0 {
            return;
        }
        let (direction, count) = if clamped > 0 {
            (Direction::Cw, clamped)
        } else {
            (Direction::Ccw, -clamped)
        };
        match ax.step(direction, count, self.shared.cfg.step_delay_s, &self.shared.cancel) {
            Ok(outcome) => {
                if outcome.termination == Termination::LimitHit {
                    debug!(axis = ax.name(), emitted = outcome.steps_emitted, "move stopped by limit");
                }
            }
            // Raced a disable; the request is simply dropped.
            Err(MotionError::Disabled) => {}
            Err(err) => self.shared.record_error(format!("axis {}: {err}", ax.name())),
        }
    }

    fn process_track(&mut self, sample: TrackSample) {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ControlState::Crosshair
                | ControlState::CameraDisabled
                | ControlState::CameraHoming => return,
                ControlState::CameraIdle => *state = ControlState::CameraTracking,
                ControlState::CameraTracking => {}
            }
        }
        self.loss_handled = false;

        let cal = self.shared.calibration.read().clone();
        let (dt, with_derivative) = match self.last_sample_ts {
            None => (MAX_DT, false),
            Some(previous) => {
                let raw = sample.ts.saturating_duration_since(previous);
                // A gap clipping the top of the window would make the
                // derivative meaningless.
                (raw.clamp(MIN_DT, MAX_DT), raw < MAX_DT)
            }
        };
        self.last_sample_ts = Some(sample.ts);
        let dt_s = dt.as_secs_f64();

        let ex = sample.cx - sample.frame_w as f64 / 2.0;
        let ey = sample.cy - sample.frame_h as f64 / 2.0;
        let (dx, ux) = self.axis_output(Axis::X, ex, dt_s, with_derivative, &cal);
        let (dy, uy) = self.axis_output(Axis::Y, ey, dt_s, with_derivative, &cal);
        *self.shared.pid_echo.lock() = PidEcho {
            x_integral: self.x_pid.integral(),
            y_integral: self.y_pid.integral(),
            x_output: ux,
            y_output: uy,
        };

        self.move_axis(Axis::X, dx, cal.x_max_steps_from_home);
        self.move_axis(Axis::Y, dy, cal.y_max_steps_from_home);
    }

    /// Runs one PID update for an axis, returning the step delta and the
    /// raw controller output in pixels. Errors inside the dead zone zero
    /// the axis and reset its integrator.
    fn axis_output(
        &mut self,
        axis: Axis,
        error_px: f64,
        dt_s: f64,
        with_derivative: bool,
        cal: &Calibration,
    ) -> (i64, f64) {
        let gains = cal.gains();
        let (pid, steps_per_pixel, max_from_home) = match axis {
            Axis::X => (&mut self.x_pid, cal.x_steps_per_pixel, cal.x_max_steps_from_home),
            Axis::Y => (&mut self.y_pid, cal.y_steps_per_pixel, cal.y_max_steps_from_home),
        };
        if error_px.abs() <= cal.dead_zone_pixels as f64 {
            pid.reset();
            return (0, 0.0);
        }
        if gains.ki > 0.0 && gains.kp > 0.0 {
            pid.set_integral_limit(Some(max_from_home as f64 / gains.kp));
        } else {
            pid.set_integral_limit(None);
        }
        let output_px = pid.update(gains.kp, gains.ki, gains.kd, error_px, dt_s, with_derivative);
        ((output_px * steps_per_pixel).round() as i64, output_px)
    }

    fn do_home(&mut self) -> Result<(), ControlError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ControlState::Crosshair => return Err(ControlError::ModeDisabled),
                ControlState::CameraDisabled => return Err(ControlError::Disabled),
                _ => *state = ControlState::CameraHoming,
            }
        }
        self.reset_pids();
        self.shared.pending_track.lock().take();

        let result = self
            .shared
            .x
            .home(&self.shared.cancel)
            .and_then(|_| self.shared.y.home(&self.shared.cancel))
            .map_err(ControlError::from);
        *self.shared.state.lock() = ControlState::CameraIdle;
        if let Err(err) = &result {
            self.shared.record_error(format!("homing failed: {err}"));
        }
        result
    }

    fn do_set_mode(&mut self, mode: TrackMode) -> Result<(), ControlError> {
        let current = *self.shared.state.lock();
        match mode {
            TrackMode::Camera => {
                if current == ControlState::Crosshair {
                    *self.shared.state.lock() = ControlState::CameraIdle;
                    self.reset_pids();
                    info!("camera mode");
                }
                Ok(())
            }
            TrackMode::Crosshair => {
                if current == ControlState::Crosshair {
                    return Ok(());
                }
                // Park at home before handing the reticle to the operator;
                // a homing failure is recorded but still lands in crosshair.
                if current != ControlState::CameraDisabled {
                    let _ = self.do_home();
                }
                *self.shared.state.lock() = ControlState::Crosshair;
                self.reset_pids();
                info!("crosshair mode, motion disabled");
                Ok(())
            }
        }
    }

    fn idle_tick(&mut self) {
        // A sample whose wake-up marker was dropped on a full queue.
        let pending = self.shared.pending_track.lock().take();
        if let Some(sample) = pending {
            self.process_track(sample);
            return;
        }

        if *self.shared.state.lock() != ControlState::CameraTracking {
            return;
        }
        let Some(last) = *self.shared.last_target.lock() else {
            return;
        };
        if last.elapsed() < self.shared.cfg.loss_timeout {
            return;
        }

        if !self.loss_handled {
            debug!("target lost");
            self.reset_pids();
            self.loss_handled = true;
        }
        let cal = self.shared.calibration.read().clone();
        if !cal.recenter_on_loss {
            return;
        }
        let rate = self.shared.cfg.home_recenter_rate as i64;
        if rate == 0 {
            return;
        }
        let px = self.shared.x.position();
        let py = self.shared.y.position();
        if px == 0 && py == 0 {
            *self.shared.state.lock() = ControlState::CameraIdle;
            debug!("recentered after target loss");
            return;
        }
        self.move_axis(Axis::X, -px.clamp(-rate, rate), cal.x_max_steps_from_home);
        self.move_axis(Axis::Y, -py.clamp(-rate, rate), cal.y_max_steps_from_home);
    }
}
