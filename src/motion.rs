//! Motion state machine.
//!
//! One controller per mechanism. Accepts absolute seeks, relative seeks,
//! continuous open-loop moves, timed moves, and abort; owns the current
//! position and travel limit; and publishes every state change as a property
//! update.
//!
//! # State Machine
//!
//! ```text
//! Idle --move/seek--> Moving --target reached / stop--> Idle
//!                      Moving --abort--> Aborting --confirmed--> Idle
//!                      Moving --link lost--> Idle (fault)
//! ```
//!
//! All transitions happen under a single async mutex: a button-driven stop
//! and a timer-driven completion check can never interleave destructively.
//! Hardware completion is detected by the external poll timer calling
//! [`MotionController::poll`]; the core spawns no tasks of its own.

use crate::capabilities::{Capability, CapabilitySet};
use crate::connection::ConnectionHandle;
use crate::error::{FocusResult, FocuserError};
use crate::hardware::{FocusDirection, FocuserDriver};
use crate::properties::{names, PropertyState, PropertyUpdate};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

/// Busy policy: what happens to a motion request while a move is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverridePolicy {
    /// Hardware supports motion override; the new target replaces the
    /// in-flight one.
    Replace,
    /// Request is rejected with a busy condition.
    #[default]
    Reject,
}

/// What kind of move is in flight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MotionMode {
    /// Closed-loop seek to an absolute target.
    Absolute { target: u32 },
    /// Relative seek, resolved to an absolute target at issue time.
    Relative { target: u32 },
    /// Open-loop continuous motion until an explicit stop.
    Continuous,
    /// Open-loop move that the poll timer stops at the deadline.
    Timed { deadline: Instant },
}

/// Motion phase of the mechanism.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MotionState {
    Idle,
    Moving {
        direction: FocusDirection,
        mode: MotionMode,
    },
    Aborting,
}

impl MotionState {
    pub fn is_moving(&self) -> bool {
        matches!(self, MotionState::Moving { .. })
    }
}

struct MotionInner {
    io: Option<ConnectionHandle>,
    state: MotionState,
    position: u32,
    max_position: u32,
    speed: u32,
    direction: FocusDirection,
    reversed: bool,
    backlash_enabled: bool,
    backlash_steps: u32,
    faulted: bool,
}

/// Capability-specific motion controller.
pub struct MotionController {
    driver: Arc<dyn FocuserDriver>,
    caps: CapabilitySet,
    policy: OverridePolicy,
    updates: broadcast::Sender<PropertyUpdate>,
    inner: Mutex<MotionInner>,
}

/// Map a driver error to the core taxonomy. A dead link is a hardware
/// fault; anything else left the request unapplied.
fn classify_driver_error(e: anyhow::Error) -> FocuserError {
    match e.downcast::<FocuserError>() {
        Ok(fe) if fe.is_fault() => FocuserError::HardwareFault(fe.to_string()),
        Ok(fe) => fe,
        Err(e) => FocuserError::Validation(format!("driver rejected command: {}", e)),
    }
}

impl MotionController {
    pub fn new(
        driver: Arc<dyn FocuserDriver>,
        policy: OverridePolicy,
        default_max: u32,
        updates: broadcast::Sender<PropertyUpdate>,
    ) -> Self {
        let caps = driver.capabilities();
        Self {
            driver,
            caps,
            policy,
            updates,
            inner: Mutex::new(MotionInner {
                io: None,
                state: MotionState::Idle,
                position: 0,
                max_position: default_max,
                speed: 1,
                direction: FocusDirection::Inward,
                reversed: false,
                backlash_enabled: false,
                backlash_steps: 0,
                faulted: false,
            }),
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    pub async fn state(&self) -> MotionState {
        self.inner.lock().await.state
    }

    pub async fn position(&self) -> u32 {
        self.inner.lock().await.position
    }

    pub async fn max_position(&self) -> u32 {
        self.inner.lock().await.max_position
    }

    pub async fn speed(&self) -> u32 {
        self.inner.lock().await.speed
    }

    pub async fn direction(&self) -> FocusDirection {
        self.inner.lock().await.direction
    }

    pub async fn is_reversed(&self) -> bool {
        self.inner.lock().await.reversed
    }

    pub async fn backlash(&self) -> (bool, u32) {
        let inner = self.inner.lock().await;
        (inner.backlash_enabled, inner.backlash_steps)
    }

    /// True after a hardware fault until the next attach.
    pub async fn faulted(&self) -> bool {
        self.inner.lock().await.faulted
    }

    /// Bind the controller to a freshly connected link and read the initial
    /// position on closed-loop hardware. Returns the starting position.
    pub async fn attach(&self, io: ConnectionHandle) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.faulted = false;
        inner.state = MotionState::Idle;

        if self.caps.has(Capability::AbsolutePosition) {
            match self.driver.read_position(&io).await {
                Ok(pos) => inner.position = pos,
                Err(e) => warn!("could not read initial position: {}", e),
            }
        }
        inner.io = Some(io);
        debug!("motion controller attached at position {}", inner.position);
        inner.position
    }

    /// Drop the link reference after an orderly disconnect. Not a fault.
    pub async fn detach(&self) {
        let mut inner = self.inner.lock().await;
        inner.io = None;
        inner.state = MotionState::Idle;
    }

    /// Update the travel limit. Presets must be re-synchronized by the
    /// owner; the controller only validates and forwards to the hardware.
    pub async fn set_max_position(&self, ticks: u32) -> FocusResult<()> {
        if ticks == 0 {
            return Err(FocuserError::Validation(
                "maximum travel must be positive".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        if inner.state.is_moving() {
            return Err(FocuserError::Busy(
                "cannot change travel limit while moving".to_string(),
            ));
        }
        if let Some(io) = inner.io.clone() {
            self.driver
                .set_max_position(&io, ticks)
                .await
                .map_err(classify_driver_error)?;
        }
        inner.max_position = ticks;
        inner.position = inner.position.min(ticks);
        info!("maximum travel set to {} ticks", ticks);
        Ok(())
    }

    fn emit(&self, update: PropertyUpdate) {
        let _ = self.updates.send(update);
    }

    fn emit_position(&self, state: PropertyState, position: u32) {
        self.emit(PropertyUpdate::number(
            names::ABS_FOCUS_POSITION,
            state,
            vec![(names::FOCUS_ABSOLUTE_POSITION.to_string(), position as f64)],
        ));
    }

    /// Fault transition: any state to idle, link reference dropped, no
    /// further hardware commands until an explicit reconnect.
    async fn fault(&self, inner: &mut MotionInner, reason: &FocuserError) {
        error!("hardware fault: {}", reason);
        inner.state = MotionState::Idle;
        inner.io = None;
        inner.faulted = true;
        if self.caps.has(Capability::AbsolutePosition) {
            self.emit_position(PropertyState::Alert, inner.position);
        }
        self.emit(PropertyUpdate::message(format!(
            "Hardware fault: {}",
            reason
        )));
    }

    async fn run_driver<T>(
        &self,
        inner: &mut MotionInner,
        result: anyhow::Result<T>,
    ) -> FocusResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let fe = classify_driver_error(e);
                if fe.is_fault() {
                    self.fault(inner, &fe).await;
                }
                Err(fe)
            }
        }
    }

    /// Check the busy policy for a new seek while one is in flight.
    fn check_busy(&self, inner: &MotionInner) -> FocusResult<()> {
        match inner.state {
            MotionState::Idle => Ok(()),
            MotionState::Aborting => Err(FocuserError::Busy("abort in progress".to_string())),
            MotionState::Moving { .. } => match self.policy {
                OverridePolicy::Replace => Ok(()),
                OverridePolicy::Reject => {
                    Err(FocuserError::Busy("focuser already moving".to_string()))
                }
            },
        }
    }

    /// Absolute seek. Closed-loop hardware only.
    pub async fn move_abs(&self, target: u32) -> FocusResult<()> {
        if !self.caps.has(Capability::AbsolutePosition) {
            return Err(FocuserError::Unsupported(
                "absolute seek requires position feedback".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;
        if target > inner.max_position {
            return Err(FocuserError::Validation(format!(
                "target {} above maximum {}",
                target, inner.max_position
            )));
        }
        self.check_busy(&inner)?;

        let result = self.driver.move_abs(&io, target).await;
        self.run_driver(&mut inner, result).await?;

        let direction = if target >= inner.position {
            FocusDirection::Outward
        } else {
            FocusDirection::Inward
        };
        inner.state = MotionState::Moving {
            direction,
            mode: MotionMode::Absolute { target },
        };
        info!("seeking to {} ({})", target, direction.label());
        self.emit_position(PropertyState::Busy, inner.position);
        Ok(())
    }

    /// Relative seek. The delta is clamped so the resolved target stays
    /// within travel; a clamped request is not an error.
    pub async fn move_rel(&self, delta: i64) -> FocusResult<()> {
        if !self.caps.has(Capability::AbsolutePosition)
            && !self.caps.has(Capability::RelativeMotion)
        {
            return Err(FocuserError::Unsupported(
                "relative seek not supported by this hardware".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;
        self.check_busy(&inner)?;

        let max = inner.max_position as i64;
        let target = (inner.position as i64 + delta).clamp(0, max) as u32;
        let direction = if delta >= 0 {
            FocusDirection::Outward
        } else {
            FocusDirection::Inward
        };

        let result = if self.caps.has(Capability::AbsolutePosition) {
            self.driver.move_abs(&io, target).await
        } else {
            let steps = target.abs_diff(inner.position);
            self.driver.move_rel(&io, steps, direction).await
        };
        self.run_driver(&mut inner, result).await?;

        inner.state = MotionState::Moving {
            direction,
            mode: MotionMode::Relative { target },
        };
        info!("relative seek {:+} -> {}", delta, target);
        self.emit(PropertyUpdate::number(
            names::REL_FOCUS_POSITION,
            PropertyState::Busy,
            vec![(
                names::FOCUS_RELATIVE_POSITION.to_string(),
                delta.unsigned_abs() as f64,
            )],
        ));
        if self.caps.has(Capability::AbsolutePosition) {
            self.emit_position(PropertyState::Busy, inner.position);
        }
        Ok(())
    }

    /// Start continuous motion (button press, open-loop control).
    pub async fn start_continuous(&self, direction: FocusDirection) -> FocusResult<()> {
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;
        self.check_busy(&inner)?;

        let speed = inner.speed;
        let result = self.driver.start_motion(&io, direction, speed).await;
        self.run_driver(&mut inner, result).await?;

        inner.direction = direction;
        inner.state = MotionState::Moving {
            direction,
            mode: MotionMode::Continuous,
        };
        debug!("continuous move {} started", direction.label());
        self.emit(PropertyUpdate::switch(
            names::FOCUS_MOTION,
            PropertyState::Busy,
            vec![
                (
                    names::FOCUS_INWARD.to_string(),
                    direction == FocusDirection::Inward,
                ),
                (
                    names::FOCUS_OUTWARD.to_string(),
                    direction == FocusDirection::Outward,
                ),
            ],
        ));
        Ok(())
    }

    /// Stop a continuous or timed move (button release). A normal stop: a
    /// no-op while idle or during a closed-loop seek.
    pub async fn stop(&self) -> FocusResult<()> {
        let mut inner = self.inner.lock().await;
        let mode = match inner.state {
            MotionState::Moving { mode, .. } => mode,
            _ => return Ok(()),
        };
        if !matches!(mode, MotionMode::Continuous | MotionMode::Timed { .. }) {
            return Ok(());
        }
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;

        let result = self.driver.stop_motion(&io).await;
        self.run_driver(&mut inner, result).await?;

        inner.state = MotionState::Idle;
        debug!("continuous move stopped");
        self.emit(PropertyUpdate::switch(
            names::FOCUS_MOTION,
            PropertyState::Ok,
            vec![
                (names::FOCUS_INWARD.to_string(), false),
                (names::FOCUS_OUTWARD.to_string(), false),
            ],
        ));
        Ok(())
    }

    /// Timed open-loop move in the currently selected direction. The poll
    /// timer issues the stop when the deadline passes.
    pub async fn move_timed(&self, duration: Duration) -> FocusResult<()> {
        if !self.caps.has(Capability::TimedMove) {
            return Err(FocuserError::Unsupported(
                "timed moves not supported by this hardware".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;
        self.check_busy(&inner)?;

        let direction = inner.direction;
        let speed = inner.speed;
        let result = self.driver.start_motion(&io, direction, speed).await;
        self.run_driver(&mut inner, result).await?;

        inner.state = MotionState::Moving {
            direction,
            mode: MotionMode::Timed {
                deadline: Instant::now() + duration,
            },
        };
        info!(
            "timed move {} for {} ms",
            direction.label(),
            duration.as_millis()
        );
        self.emit(PropertyUpdate::number(
            names::FOCUS_TIMER,
            PropertyState::Busy,
            vec![(
                names::FOCUS_TIMER_VALUE.to_string(),
                duration.as_millis() as f64,
            )],
        ));
        Ok(())
    }

    /// Abort any motion immediately. The hardware stop is issued
    /// synchronously; the state machine reaches idle before this returns.
    pub async fn abort(&self) -> FocusResult<()> {
        if !self.caps.has(Capability::Abort) {
            return Err(FocuserError::Unsupported(
                "abort not supported by this hardware".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;

        let prior = inner.state;
        inner.state = MotionState::Aborting;
        if let Err(e) = self.driver.abort(&io).await {
            let fe = classify_driver_error(e);
            if fe.is_fault() {
                self.fault(&mut inner, &fe).await;
            } else {
                inner.state = prior;
            }
            return Err(fe);
        }

        // The position at the moment of abort becomes the current position
        // on closed-loop hardware; open-loop simply reports stopped.
        if self.caps.has(Capability::AbsolutePosition) {
            match self.driver.read_position(&io).await {
                Ok(pos) => inner.position = pos,
                Err(e) => {
                    let fe = classify_driver_error(e);
                    if fe.is_fault() {
                        self.fault(&mut inner, &fe).await;
                        return Err(fe);
                    }
                    // The stop itself went through; keep the last known
                    // position rather than failing the abort.
                    warn!("position readback after abort failed: {}", fe);
                }
            }
        }
        inner.state = MotionState::Idle;
        info!("motion aborted at position {}", inner.position);
        self.emit(PropertyUpdate::switch(
            names::FOCUS_ABORT_MOTION,
            PropertyState::Ok,
            vec![(names::ABORT.to_string(), false)],
        ));
        if self.caps.has(Capability::AbsolutePosition) {
            self.emit_position(PropertyState::Ok, inner.position);
        }
        Ok(())
    }

    /// Select the direction used by subsequent timed moves.
    pub async fn set_direction(&self, direction: FocusDirection) -> FocusResult<()> {
        let mut inner = self.inner.lock().await;
        inner.direction = direction;
        self.emit(PropertyUpdate::switch(
            names::FOCUS_MOTION,
            PropertyState::Ok,
            vec![
                (
                    names::FOCUS_INWARD.to_string(),
                    direction == FocusDirection::Inward,
                ),
                (
                    names::FOCUS_OUTWARD.to_string(),
                    direction == FocusDirection::Outward,
                ),
            ],
        ));
        Ok(())
    }

    /// Select a speed preset.
    pub async fn set_speed(&self, speed: u32) -> FocusResult<()> {
        if !self.caps.has(Capability::VariableSpeed) {
            return Err(FocuserError::Unsupported(
                "this hardware has a fixed speed".to_string(),
            ));
        }
        if speed == 0 {
            return Err(FocuserError::Validation(
                "speed preset must be at least 1".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        if let Some(io) = inner.io.clone() {
            let result = self.driver.set_speed(&io, speed).await;
            self.run_driver(&mut inner, result).await?;
        }
        inner.speed = speed;
        self.emit(PropertyUpdate::number(
            names::FOCUS_SPEED,
            PropertyState::Ok,
            vec![(names::FOCUS_SPEED_VALUE.to_string(), speed as f64)],
        ));
        Ok(())
    }

    /// Swap the in/out sense of motion.
    pub async fn set_reverse(&self, reversed: bool) -> FocusResult<()> {
        if !self.caps.has(Capability::ReverseMotion) {
            return Err(FocuserError::Unsupported(
                "this hardware cannot reverse motion".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;
        let result = self.driver.set_reverse(&io, reversed).await;
        self.run_driver(&mut inner, result).await?;
        inner.reversed = reversed;
        self.emit(PropertyUpdate::switch(
            names::FOCUS_REVERSE_MOTION,
            PropertyState::Ok,
            vec![
                (names::ENABLED.to_string(), reversed),
                (names::DISABLED.to_string(), !reversed),
            ],
        ));
        Ok(())
    }

    /// Enable or disable backlash compensation.
    pub async fn set_backlash_enabled(&self, enabled: bool) -> FocusResult<()> {
        if !self.caps.has(Capability::Backlash) {
            return Err(FocuserError::Unsupported(
                "no backlash compensation on this hardware".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let steps = if enabled { inner.backlash_steps } else { 0 };
        if let Some(io) = inner.io.clone() {
            let result = self.driver.set_backlash(&io, steps).await;
            self.run_driver(&mut inner, result).await?;
        }
        inner.backlash_enabled = enabled;
        Ok(())
    }

    /// Set the backlash compensation step count.
    pub async fn set_backlash_steps(&self, steps: u32) -> FocusResult<()> {
        if !self.caps.has(Capability::Backlash) {
            return Err(FocuserError::Unsupported(
                "no backlash compensation on this hardware".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        if inner.backlash_enabled {
            if let Some(io) = inner.io.clone() {
                let result = self.driver.set_backlash(&io, steps).await;
                self.run_driver(&mut inner, result).await?;
            }
        }
        inner.backlash_steps = steps;
        Ok(())
    }

    /// Redefine the current position without moving (closed-loop only).
    pub async fn sync(&self, ticks: u32) -> FocusResult<()> {
        if !self.caps.has(Capability::Sync) {
            return Err(FocuserError::Unsupported(
                "this hardware cannot sync its position".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let io = inner.io.clone().ok_or(FocuserError::NotConnected)?;
        if ticks > inner.max_position {
            return Err(FocuserError::Validation(format!(
                "sync target {} above maximum {}",
                ticks, inner.max_position
            )));
        }
        if inner.state.is_moving() {
            return Err(FocuserError::Busy("cannot sync while moving".to_string()));
        }
        let result = self.driver.sync(&io, ticks).await;
        self.run_driver(&mut inner, result).await?;
        inner.position = ticks;
        self.emit_position(PropertyState::Ok, ticks);
        Ok(())
    }

    /// Periodic status check, driven by an external timer. Detects seek
    /// completion, stops expired timed moves, and turns a dead link into a
    /// fault transition.
    pub async fn poll(&self) -> FocusResult<()> {
        let mut inner = self.inner.lock().await;
        let (direction, mode) = match inner.state {
            MotionState::Moving { direction, mode } => (direction, mode),
            _ => return Ok(()),
        };
        let io = match inner.io.clone() {
            Some(io) => io,
            None => return Ok(()),
        };

        match mode {
            MotionMode::Timed { deadline } => {
                if Instant::now() >= deadline {
                    let result = self.driver.stop_motion(&io).await;
                    self.run_driver(&mut inner, result).await?;
                    inner.state = MotionState::Idle;
                    debug!("timed move {} finished", direction.label());
                    self.emit(PropertyUpdate::number(
                        names::FOCUS_TIMER,
                        PropertyState::Ok,
                        vec![(names::FOCUS_TIMER_VALUE.to_string(), 0.0)],
                    ));
                }
                Ok(())
            }
            MotionMode::Continuous => {
                if self.caps.has(Capability::AbsolutePosition) {
                    let result = self.driver.read_position(&io).await;
                    let pos = self.run_driver(&mut inner, result).await?;
                    inner.position = pos;
                    self.emit_position(PropertyState::Busy, pos);
                }
                Ok(())
            }
            MotionMode::Absolute { target } | MotionMode::Relative { target } => {
                if !self.caps.has(Capability::AbsolutePosition) {
                    // Relative move on open-loop hardware is fire-and-forget:
                    // there is no feedback to watch, so the issue completes it.
                    inner.state = MotionState::Idle;
                    self.emit(PropertyUpdate::number(
                        names::REL_FOCUS_POSITION,
                        PropertyState::Ok,
                        vec![(names::FOCUS_RELATIVE_POSITION.to_string(), 0.0)],
                    ));
                    return Ok(());
                }
                let result = self.driver.read_position(&io).await;
                let pos = self.run_driver(&mut inner, result).await?;
                inner.position = pos;

                let result = self.driver.is_moving(&io).await;
                let still_moving = self.run_driver(&mut inner, result).await?;

                if still_moving {
                    self.emit_position(PropertyState::Busy, pos);
                } else {
                    inner.state = MotionState::Idle;
                    info!("seek complete at {} (target {})", pos, target);
                    self.emit_position(PropertyState::Ok, pos);
                    if matches!(mode, MotionMode::Relative { .. }) {
                        self.emit(PropertyUpdate::number(
                            names::REL_FOCUS_POSITION,
                            PropertyState::Ok,
                            vec![(names::FOCUS_RELATIVE_POSITION.to_string(), 0.0)],
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionMode, ConnectionModeSet, ConnectionSelector, MockTransport};
    use crate::hardware::SimFocuser;

    const MAX: u32 = 50_000;

    async fn controller(
        policy: OverridePolicy,
        rate: f64,
    ) -> (
        Arc<MotionController>,
        broadcast::Receiver<PropertyUpdate>,
        crate::connection::mock::MockProbe,
    ) {
        let driver = Arc::new(SimFocuser::closed_loop(MAX).with_rate(rate));
        let (tx, rx) = broadcast::channel(256);
        let motion = Arc::new(MotionController::new(driver.clone(), policy, MAX, tx));

        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let (transport, probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        let handle = selector.connect(driver.as_ref()).await.unwrap();
        motion.attach(handle).await;
        (motion, rx, probe)
    }

    #[tokio::test]
    async fn test_absolute_seek_ends_idle_at_target() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, f64::INFINITY).await;

        motion.move_abs(12_345).await.unwrap();
        assert!(motion.state().await.is_moving());

        motion.poll().await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
        assert_eq!(motion.position().await, 12_345);
    }

    #[tokio::test]
    async fn test_target_above_max_is_rejected_unchanged() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, f64::INFINITY).await;
        let before = motion.position().await;

        let err = motion.move_abs(MAX + 1).await.unwrap_err();
        assert!(matches!(err, FocuserError::Validation(_)));
        assert_eq!(motion.position().await, before);
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_relative_seek_clamps_at_travel_end() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, f64::INFINITY).await;

        // Park near the end of travel, then ask for more than remains.
        motion.move_abs(49_950).await.unwrap();
        motion.poll().await.unwrap();

        motion.move_rel(100).await.unwrap();
        motion.poll().await.unwrap();
        assert_eq!(motion.position().await, MAX);
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_busy_policy_reject() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, 100.0).await;

        motion.move_abs(30_000).await.unwrap();
        let err = motion.move_abs(10_000).await.unwrap_err();
        assert!(matches!(err, FocuserError::Busy(_)));
    }

    #[tokio::test]
    async fn test_busy_policy_replace() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Replace, f64::INFINITY).await;

        motion.move_abs(30_000).await.unwrap();
        motion.move_abs(10_000).await.unwrap();
        motion.poll().await.unwrap();
        assert_eq!(motion.position().await, 10_000);
    }

    #[tokio::test]
    async fn test_abort_reaches_idle_and_reports_position() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, 1_000.0).await;

        motion.move_abs(40_000).await.unwrap();
        motion.abort().await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
        // Aborted mid-travel: far from the target.
        assert!(motion.position().await < 40_000);
    }

    #[tokio::test]
    async fn test_lost_link_faults_to_idle() {
        let (motion, mut rx, probe) = controller(OverridePolicy::Reject, 100.0).await;

        motion.move_abs(40_000).await.unwrap();
        probe.drop_link(true);

        let err = motion.poll().await.unwrap_err();
        assert!(matches!(err, FocuserError::HardwareFault(_)));
        assert_eq!(motion.state().await, MotionState::Idle);
        assert!(motion.faulted().await);

        // Fault surfaced on the update channel.
        let mut saw_fault_message = false;
        while let Ok(update) = rx.try_recv() {
            if let PropertyUpdate::Message { text, .. } = update {
                if text.contains("Hardware fault") {
                    saw_fault_message = true;
                }
            }
        }
        assert!(saw_fault_message);

        // No further hardware commands go out until reconnect.
        let writes = probe.write_count();
        assert!(matches!(
            motion.move_abs(1_000).await.unwrap_err(),
            FocuserError::NotConnected
        ));
        assert_eq!(probe.write_count(), writes);
    }

    #[tokio::test]
    async fn test_continuous_start_and_stop() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, 10_000.0).await;

        motion
            .start_continuous(FocusDirection::Outward)
            .await
            .unwrap();
        assert!(motion.state().await.is_moving());

        motion.stop().await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_timed_move_stops_at_deadline() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, 10_000.0).await;

        motion.move_timed(Duration::from_millis(10)).await.unwrap();
        assert!(motion.state().await.is_moving());

        tokio::time::sleep(Duration::from_millis(20)).await;
        motion.poll().await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_open_loop_rejects_absolute_seek() {
        let driver = Arc::new(SimFocuser::open_loop());
        let (tx, _rx) = broadcast::channel(64);
        let motion = MotionController::new(driver.clone(), OverridePolicy::Reject, MAX, tx);

        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let (transport, _probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        let handle = selector.connect(driver.as_ref()).await.unwrap();
        motion.attach(handle).await;

        let err = motion.move_abs(1_000).await.unwrap_err();
        assert!(matches!(err, FocuserError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_sync_rejected_while_moving() {
        let (motion, _rx, _probe) = controller(OverridePolicy::Reject, 100.0).await;

        motion.move_abs(30_000).await.unwrap();
        let err = motion.sync(1_000).await.unwrap_err();
        assert!(matches!(err, FocuserError::Busy(_)));
    }
}
