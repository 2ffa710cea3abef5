//! Vendor driver contract.
//!
//! The core never emits device-specific command bytes itself. Everything a
//! concrete focuser knows — its probe sequence, its move commands, its
//! position readout — lives behind [`FocuserDriver`]. The core hands the
//! driver the active [`ConnectionHandle`] on every call; drivers hold no
//! link state of their own, so a revoked handle immediately cuts them off.
//!
//! Drivers declare their feature set once via [`CapabilitySet`]; the core
//! only calls operations the declared capabilities cover.

pub mod sim;

use crate::capabilities::CapabilitySet;
use crate::connection::ConnectionHandle;
use anyhow::{anyhow, Result};
use async_trait::async_trait;

pub use sim::SimFocuser;

/// Direction of focuser travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusDirection {
    /// Towards the telescope (decreasing position).
    Inward,
    /// Away from the telescope (increasing position).
    Outward,
}

impl FocusDirection {
    pub fn label(&self) -> &'static str {
        match self {
            FocusDirection::Inward => "inward",
            FocusDirection::Outward => "outward",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            FocusDirection::Inward => FocusDirection::Outward,
            FocusDirection::Outward => FocusDirection::Inward,
        }
    }
}

/// Contract a concrete focuser driver implements.
///
/// Operations not covered by the driver's declared capabilities are never
/// invoked by the core; their default implementations reject the call so a
/// mismatch shows up loudly in driver development.
#[async_trait]
pub trait FocuserDriver: Send + Sync {
    /// Human-readable driver name for logs and messages.
    fn name(&self) -> &str;

    /// Fixed feature set of this hardware.
    fn capabilities(&self) -> CapabilitySet;

    /// Maximum travel in ticks, when the hardware reports one at connect
    /// time. `None` keeps the configured value.
    fn max_position_hint(&self) -> Option<u32> {
        None
    }

    /// Probe the freshly opened link and confirm the expected device
    /// answers. Runs at most once per connect attempt; the caller bounds it
    /// with a timeout and closes the link on failure.
    async fn handshake(&self, io: &ConnectionHandle) -> Result<()>;

    /// Command an absolute seek to `ticks` (closed-loop hardware).
    async fn move_abs(&self, io: &ConnectionHandle, ticks: u32) -> Result<()> {
        let _ = (io, ticks);
        Err(anyhow!("{} does not support absolute moves", self.name()))
    }

    /// Command a relative move of `ticks` in `dir`.
    async fn move_rel(&self, io: &ConnectionHandle, ticks: u32, dir: FocusDirection) -> Result<()> {
        let _ = (io, ticks, dir);
        Err(anyhow!("{} does not support relative moves", self.name()))
    }

    /// Start continuous motion in `dir` at the given speed preset
    /// (open-loop hardware; also drives the hand-controller buttons).
    async fn start_motion(
        &self,
        io: &ConnectionHandle,
        dir: FocusDirection,
        speed: u32,
    ) -> Result<()> {
        let _ = (io, dir, speed);
        Err(anyhow!("{} does not support continuous motion", self.name()))
    }

    /// Stop a continuous or timed move. A normal stop, not an abort.
    async fn stop_motion(&self, io: &ConnectionHandle) -> Result<()> {
        let _ = io;
        Err(anyhow!("{} does not support continuous motion", self.name()))
    }

    /// Halt all motion immediately.
    async fn abort(&self, io: &ConnectionHandle) -> Result<()>;

    /// Current absolute position in ticks (closed-loop hardware).
    async fn read_position(&self, io: &ConnectionHandle) -> Result<u32> {
        let _ = io;
        Err(anyhow!("{} has no position feedback", self.name()))
    }

    /// Whether the mechanism is still travelling (closed-loop hardware).
    async fn is_moving(&self, io: &ConnectionHandle) -> Result<bool> {
        let _ = io;
        Err(anyhow!("{} has no position feedback", self.name()))
    }

    /// Select a speed preset.
    async fn set_speed(&self, io: &ConnectionHandle, speed: u32) -> Result<()> {
        let _ = (io, speed);
        Err(anyhow!("{} has a fixed speed", self.name()))
    }

    /// Swap the in/out sense of motion.
    async fn set_reverse(&self, io: &ConnectionHandle, reversed: bool) -> Result<()> {
        let _ = (io, reversed);
        Err(anyhow!("{} cannot reverse motion", self.name()))
    }

    /// Configure backlash compensation steps.
    async fn set_backlash(&self, io: &ConnectionHandle, steps: u32) -> Result<()> {
        let _ = (io, steps);
        Err(anyhow!("{} has no backlash compensation", self.name()))
    }

    /// Redefine the current position to `ticks` without moving.
    async fn sync(&self, io: &ConnectionHandle, ticks: u32) -> Result<()> {
        let _ = (io, ticks);
        Err(anyhow!("{} cannot sync its position", self.name()))
    }

    /// Push a new maximum-travel limit to the hardware. Drivers whose limit
    /// lives only in the core accept the default no-op.
    async fn set_max_position(&self, io: &ConnectionHandle, ticks: u32) -> Result<()> {
        let _ = (io, ticks);
        Ok(())
    }
}
