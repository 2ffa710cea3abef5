//! Simulated focuser hardware.
//!
//! Provides a driver with realistic motion timing for tests and the
//! `focuser_sim` binary, without physical hardware. Position advances at a
//! configurable rate between polls, so moves take time and can be aborted
//! mid-travel exactly like a real mechanism.
//!
//! Every operation still writes a short command over the connection handle;
//! a dead link therefore fails simulated commands the same way it would fail
//! real ones.

use super::{FocusDirection, FocuserDriver};
use crate::capabilities::{Capability, CapabilitySet};
use crate::connection::ConnectionHandle;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

const DEFAULT_RATE_TICKS_PER_SEC: f64 = 10_000.0;

struct SimState {
    position: f64,
    target: f64,
    seeking: bool,
    continuous: Option<FocusDirection>,
    rate: f64,
    speed: u32,
    reversed: bool,
    backlash: u32,
    max: u32,
    last_advance: Instant,
}

impl SimState {
    /// Advance the simulated mechanism to "now". A non-finite rate means
    /// every move completes instantly, regardless of elapsed time.
    fn advance(&mut self) {
        let dt = self.last_advance.elapsed().as_secs_f64();
        self.last_advance = Instant::now();
        let step = if self.rate.is_finite() {
            self.rate * dt
        } else {
            f64::MAX
        };

        if self.seeking {
            let delta = self.target - self.position;
            if delta.abs() <= step {
                self.position = self.target;
                self.seeking = false;
            } else {
                self.position += step * delta.signum();
            }
        } else if let Some(dir) = self.continuous {
            let sign = match (dir, self.reversed) {
                (FocusDirection::Outward, false) | (FocusDirection::Inward, true) => 1.0,
                (FocusDirection::Inward, false) | (FocusDirection::Outward, true) => -1.0,
            };
            self.position = (self.position + sign * step).clamp(0.0, self.max as f64);
        }
    }
}

/// Simulated focuser with configurable capability set.
pub struct SimFocuser {
    caps: CapabilitySet,
    state: Mutex<SimState>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimFocuser {
    /// Create a simulator with the given capabilities and travel limit,
    /// starting at the middle of travel.
    pub fn new(caps: CapabilitySet, max: u32) -> Self {
        Self {
            caps,
            state: Mutex::new(SimState {
                position: (max / 2) as f64,
                target: (max / 2) as f64,
                seeking: false,
                continuous: None,
                rate: DEFAULT_RATE_TICKS_PER_SEC,
                speed: 1,
                reversed: false,
                backlash: 0,
                max,
                last_advance: Instant::now(),
            }),
        }
    }

    /// Closed-loop simulator with the full feature set.
    pub fn closed_loop(max: u32) -> Self {
        let caps = CapabilitySet::closed_loop()
            .with(Capability::VariableSpeed)
            .with(Capability::Backlash)
            .with(Capability::TimedMove);
        Self::new(caps, max)
    }

    /// Open-loop simulator: direction/speed/duration only, no feedback.
    pub fn open_loop() -> Self {
        Self::new(CapabilitySet::open_loop(), u32::MAX)
    }

    /// Override the simulated travel rate in ticks per second. Tests pass
    /// `f64::INFINITY` so seeks complete within one poll.
    pub fn with_rate(self, ticks_per_sec: f64) -> Self {
        lock(&self.state).rate = ticks_per_sec;
        self
    }

    /// Current simulated position, for test assertions.
    pub fn sim_position(&self) -> u32 {
        let mut state = lock(&self.state);
        state.advance();
        state.position.round() as u32
    }

    async fn command(&self, io: &ConnectionHandle, cmd: &str) -> Result<()> {
        io.write(cmd.as_bytes()).await?;
        // Drain the acknowledgement; content is irrelevant to the simulator.
        let mut buf = [0u8; 32];
        let _ = io.read(&mut buf).await?;
        Ok(())
    }
}

#[async_trait]
impl FocuserDriver for SimFocuser {
    fn name(&self) -> &str {
        "Focuser Sim"
    }

    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    fn max_position_hint(&self) -> Option<u32> {
        let max = lock(&self.state).max;
        (max != u32::MAX).then_some(max)
    }

    async fn handshake(&self, io: &ConnectionHandle) -> Result<()> {
        io.write(b"#PROBE\n").await?;
        let mut buf = [0u8; 32];
        let n = io.read(&mut buf).await?;
        if n == 0 {
            bail!("no response to identification probe");
        }
        Ok(())
    }

    async fn move_abs(&self, io: &ConnectionHandle, ticks: u32) -> Result<()> {
        self.command(io, &format!(":MA{:06}#", ticks)).await?;
        let mut state = lock(&self.state);
        state.advance();
        if ticks > state.max {
            bail!("target {} beyond simulated travel {}", ticks, state.max);
        }
        state.target = ticks as f64;
        state.seeking = true;
        state.continuous = None;
        Ok(())
    }

    async fn move_rel(&self, io: &ConnectionHandle, ticks: u32, dir: FocusDirection) -> Result<()> {
        let target = {
            let mut state = lock(&self.state);
            state.advance();
            let sign = match dir {
                FocusDirection::Outward => 1.0,
                FocusDirection::Inward => -1.0,
            };
            (state.position + sign * ticks as f64).clamp(0.0, state.max as f64) as u32
        };
        self.move_abs(io, target).await
    }

    async fn start_motion(
        &self,
        io: &ConnectionHandle,
        dir: FocusDirection,
        speed: u32,
    ) -> Result<()> {
        self.command(io, &format!(":MV{}{}#", dir.label(), speed))
            .await?;
        let mut state = lock(&self.state);
        state.advance();
        state.seeking = false;
        state.continuous = Some(dir);
        state.speed = speed.max(1);
        Ok(())
    }

    async fn stop_motion(&self, io: &ConnectionHandle) -> Result<()> {
        self.command(io, ":ST#").await?;
        let mut state = lock(&self.state);
        state.advance();
        state.seeking = false;
        state.continuous = None;
        state.target = state.position;
        Ok(())
    }

    async fn abort(&self, io: &ConnectionHandle) -> Result<()> {
        self.command(io, ":AB#").await?;
        let mut state = lock(&self.state);
        state.advance();
        state.seeking = false;
        state.continuous = None;
        state.target = state.position;
        Ok(())
    }

    async fn read_position(&self, io: &ConnectionHandle) -> Result<u32> {
        if !self.caps.has(Capability::AbsolutePosition) {
            return Err(anyhow!("open-loop simulator has no position feedback"));
        }
        self.command(io, ":GP#").await?;
        let mut state = lock(&self.state);
        state.advance();
        Ok(state.position.round() as u32)
    }

    async fn is_moving(&self, io: &ConnectionHandle) -> Result<bool> {
        if !self.caps.has(Capability::AbsolutePosition) {
            return Err(anyhow!("open-loop simulator has no position feedback"));
        }
        self.command(io, ":GS#").await?;
        let mut state = lock(&self.state);
        state.advance();
        Ok(state.seeking || state.continuous.is_some())
    }

    async fn set_speed(&self, io: &ConnectionHandle, speed: u32) -> Result<()> {
        self.command(io, &format!(":SP{}#", speed)).await?;
        lock(&self.state).speed = speed.max(1);
        Ok(())
    }

    async fn set_reverse(&self, io: &ConnectionHandle, reversed: bool) -> Result<()> {
        self.command(io, &format!(":RV{}#", u8::from(reversed))).await?;
        lock(&self.state).reversed = reversed;
        Ok(())
    }

    async fn set_backlash(&self, io: &ConnectionHandle, steps: u32) -> Result<()> {
        self.command(io, &format!(":BL{}#", steps)).await?;
        lock(&self.state).backlash = steps;
        Ok(())
    }

    async fn sync(&self, io: &ConnectionHandle, ticks: u32) -> Result<()> {
        self.command(io, &format!(":SY{:06}#", ticks)).await?;
        let mut state = lock(&self.state);
        state.advance();
        if state.seeking || state.continuous.is_some() {
            bail!("cannot sync while moving");
        }
        state.position = ticks as f64;
        state.target = ticks as f64;
        Ok(())
    }

    async fn set_max_position(&self, io: &ConnectionHandle, ticks: u32) -> Result<()> {
        self.command(io, &format!(":SM{:06}#", ticks)).await?;
        let mut state = lock(&self.state);
        state.max = ticks;
        state.position = state.position.min(ticks as f64);
        state.target = state.target.min(ticks as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionMode, ConnectionModeSet, ConnectionSelector, MockTransport};

    async fn connected_sim(rate: f64) -> (SimFocuser, ConnectionHandle, ConnectionSelector) {
        let driver = SimFocuser::closed_loop(50_000).with_rate(rate);
        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let (transport, _probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        let handle = selector.connect(&driver).await.unwrap();
        (driver, handle, selector)
    }

    #[tokio::test]
    async fn test_absolute_seek_reaches_target() {
        let (driver, io, _selector) = connected_sim(f64::INFINITY).await;

        driver.move_abs(&io, 12_000).await.unwrap();
        assert_eq!(driver.read_position(&io).await.unwrap(), 12_000);
        assert!(!driver.is_moving(&io).await.unwrap());
    }

    #[tokio::test]
    async fn test_seek_takes_time_at_finite_rate() {
        let (driver, io, _selector) = connected_sim(1_000.0).await;

        // 25_000 -> 26_000 at 1000 ticks/sec takes about a second.
        driver.move_abs(&io, 26_000).await.unwrap();
        assert!(driver.is_moving(&io).await.unwrap());
        let mid = driver.read_position(&io).await.unwrap();
        assert!(mid < 26_000);
    }

    #[tokio::test]
    async fn test_abort_freezes_position() {
        let (driver, io, _selector) = connected_sim(1_000.0).await;

        driver.move_abs(&io, 30_000).await.unwrap();
        driver.abort(&io).await.unwrap();
        let frozen = driver.read_position(&io).await.unwrap();
        assert!(!driver.is_moving(&io).await.unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(driver.read_position(&io).await.unwrap(), frozen);
    }

    #[tokio::test]
    async fn test_continuous_motion_respects_travel_limits() {
        let (driver, io, _selector) = connected_sim(f64::INFINITY).await;

        driver
            .start_motion(&io, FocusDirection::Outward, 3)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(driver.read_position(&io).await.unwrap(), 50_000);

        driver.stop_motion(&io).await.unwrap();
        assert!(!driver.is_moving(&io).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_redefines_position_without_motion() {
        let (driver, io, _selector) = connected_sim(f64::INFINITY).await;

        driver.sync(&io, 4_242).await.unwrap();
        assert_eq!(driver.read_position(&io).await.unwrap(), 4_242);
    }

    #[tokio::test]
    async fn test_open_loop_has_no_feedback() {
        let driver = SimFocuser::open_loop();
        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let (transport, _probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        let io = selector.connect(&driver).await.unwrap();

        assert!(driver.read_position(&io).await.is_err());
        assert!(driver.is_moving(&io).await.is_err());
        driver
            .start_motion(&io, FocusDirection::Inward, 2)
            .await
            .unwrap();
        driver.stop_motion(&io).await.unwrap();
    }
}
