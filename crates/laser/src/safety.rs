//! Arm/disarm state machine and fire sequencing.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{LaserError, LaserOutput};

/// Timing limits for fire sequencing.
#[derive(Debug, Clone)]
pub struct LaserLimits {
    /// Minimum interval after a fire before the next one is admitted.
    pub cooldown: Duration,
    /// Pulse length used when a fire request carries no duration.
    pub default_pulse: Duration,
    /// Hard cap applied to every on-cycle regardless of the request.
    pub max_pulse: Duration,
}

impl Default for LaserLimits {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            default_pulse: Duration::from_millis(500),
            max_pulse: Duration::from_secs(5),
        }
    }
}

/// Snapshot of the laser for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct LaserState {
    pub armed: bool,
    pub power_pct: u8,
    pub is_on: bool,
    pub fire_count: u64,
    pub cooldown_remaining_ms: u64,
}

struct Inner {
    armed: bool,
    power_pct: u8,
    fire_count: u64,
    cooldown_until: Option<Instant>,
    firing: bool,
}

/// Safety gate in front of [`LaserOutput`].
///
/// All fire paths are admitted through one check (armed, not busy, out of
/// cooldown) and leave through one guard that forces the duty cycle to zero
/// and starts the cooldown. Disarming cancels a burst between pulses; the
/// pulse in progress completes first.
pub struct LaserSafetyController {
    output: LaserOutput,
    limits: LaserLimits,
    inner: Mutex<Inner>,
}

impl LaserSafetyController {
    pub fn new(output: LaserOutput, limits: LaserLimits) -> Self {
        Self {
            output,
            limits,
            inner: Mutex::new(Inner {
                armed: false,
                power_pct: 0,
                fire_count: 0,
                cooldown_until: None,
                firing: false,
            }),
        }
    }

    pub fn armed(&self) -> bool {
        self.inner.lock().armed
    }

    pub fn default_pulse(&self) -> Duration {
        self.limits.default_pulse
    }

    /// Arms or disarms the master enable. Disarming forces power to zero and
    /// cancels any burst at its next between-pulse check.
    pub fn arm(&self, on: bool) -> Result<(), LaserError> {
        let firing = {
            let mut st = self.inner.lock();
            st.armed = on;
            if !on {
                st.power_pct = 0;
            }
            st.firing
        };
        if !on && !firing {
            self.output.off()?;
        }
        info!(armed = on, "laser arm state changed");
        Ok(())
    }

    /// Stores the requested power, clamped to the output ceiling. Returns
    /// the applied value.
    pub fn set_power(&self, power_pct: u8) -> u8 {
        let clamped = self.output.clamp_power(power_pct);
        self.inner.lock().power_pct = clamped;
        clamped
    }

    /// Atomically reserves the laser for one fire sequence. The reservation
    /// either fires through [`LaserSafetyController::fire_claimed`] /
    /// [`LaserSafetyController::burst_claimed`] or is released when the
    /// claim drops, so a caller can decide its reply before any pulse runs
    /// and a second claim in the meantime gets `Busy`.
    pub fn claim(self: &Arc<Self>) -> Result<FireClaim, LaserError> {
        self.admit()?;
        Ok(FireClaim {
            ctrl: self.clone(),
            consumed: false,
        })
    }

    /// One pulse at the stored power. Duration is capped at
    /// `limits.max_pulse`; the cooldown starts when the pulse ends.
    pub async fn fire(&self, duration: Duration) -> Result<(), LaserError> {
        self.admit()?;
        self.fire_sequence(duration).await
    }

    /// One pulse under a reservation taken with
    /// [`LaserSafetyController::claim`].
    pub async fn fire_claimed(
        &self,
        claim: FireClaim,
        duration: Duration,
    ) -> Result<(), LaserError> {
        claim.consume();
        self.fire_sequence(duration).await
    }

    /// `count` pulses separated by `gap`. Returns how many on-cycles
    /// completed; disarming stops the sequence between pulses.
    pub async fn burst(
        &self,
        count: u32,
        on: Duration,
        gap: Duration,
    ) -> Result<u32, LaserError> {
        if count == 0 {
            return Err(LaserError::InvalidRequest("burst of zero pulses".into()));
        }
        self.admit()?;
        self.burst_sequence(count, on, gap).await
    }

    /// A burst under a reservation taken with
    /// [`LaserSafetyController::claim`].
    pub async fn burst_claimed(
        &self,
        claim: FireClaim,
        count: u32,
        on: Duration,
        gap: Duration,
    ) -> Result<u32, LaserError> {
        if count == 0 {
            // The unconsumed claim releases the reservation on drop.
            return Err(LaserError::InvalidRequest("burst of zero pulses".into()));
        }
        claim.consume();
        self.burst_sequence(count, on, gap).await
    }

    async fn fire_sequence(&self, duration: Duration) -> Result<(), LaserError> {
        let mut guard = SequenceGuard::new(self);
        self.pulse(duration).await?;
        guard.completed = 1;
        Ok(())
    }

    async fn burst_sequence(
        &self,
        count: u32,
        on: Duration,
        gap: Duration,
    ) -> Result<u32, LaserError> {
        let mut guard = SequenceGuard::new(self);
        for index in 0..count {
            if index > 0 {
                tokio::time::sleep(gap).await;
            }
            if !self.armed() {
                info!(completed = guard.completed, "burst cancelled by disarm");
                break;
            }
            self.pulse(on).await?;
            guard.completed += 1;
        }
        Ok(guard.completed as u32)
    }

    pub fn status(&self) -> LaserState {
        let st = self.inner.lock();
        let cooldown_remaining_ms = st
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0);
        LaserState {
            armed: st.armed,
            power_pct: st.power_pct,
            is_on: self.output.is_on(),
            fire_count: st.fire_count,
            cooldown_remaining_ms,
        }
    }

    fn check_admission(st: &Inner) -> Result<(), LaserError> {
        if !st.armed {
            return Err(LaserError::Disarmed);
        }
        if st.firing {
            return Err(LaserError::Busy);
        }
        if let Some(until) = st.cooldown_until {
            let now = Instant::now();
            if now < until {
                return Err(LaserError::Cooldown(until - now));
            }
        }
        Ok(())
    }

    fn admit(&self) -> Result<(), LaserError> {
        let mut st = self.inner.lock();
        Self::check_admission(&st)?;
        st.firing = true;
        Ok(())
    }

    async fn pulse(&self, duration: Duration) -> Result<(), LaserError> {
        let power = self.inner.lock().power_pct;
        let capped = duration.min(self.limits.max_pulse);
        self.output.on(power)?;
        tokio::time::sleep(capped).await;
        self.output.off()?;
        Ok(())
    }
}

/// Exclusive reservation of the laser for one fire sequence.
///
/// Produced by [`LaserSafetyController::claim`] and consumed by the
/// `*_claimed` fire paths. Dropping an unconsumed claim releases the
/// reservation without touching the output.
pub struct FireClaim {
    ctrl: Arc<LaserSafetyController>,
    consumed: bool,
}

impl std::fmt::Debug for FireClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FireClaim")
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl FireClaim {
    fn consume(mut self) {
        self.consumed = true;
    }
}

impl Drop for FireClaim {
    fn drop(&mut self) {
        if !self.consumed {
            self.ctrl.inner.lock().firing = false;
        }
    }
}

/// Closes out a fire sequence on every exit path: duty forced to zero, the
/// busy flag dropped, completed pulses counted, cooldown started.
struct SequenceGuard<'a> {
    ctrl: &'a LaserSafetyController,
    completed: u64,
}

impl<'a> SequenceGuard<'a> {
    fn new(ctrl: &'a LaserSafetyController) -> Self {
        Self { ctrl, completed: 0 }
    }
}

impl Drop for SequenceGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ctrl.output.off() {
            warn!(error = %err, "failed to force laser duty to zero");
        }
        let mut st = self.ctrl.inner.lock();
        st.firing = false;
        st.fire_count += self.completed;
        if self.completed > 0 {
            st.cooldown_until = Some(Instant::now() + self.ctrl.limits.cooldown);
        }
    }
}
