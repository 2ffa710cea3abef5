//! Hardware capability declarations.
//!
//! A concrete driver declares once, at construction time, which motion
//! features its hardware actually has. The rest of the core queries the
//! resulting [`CapabilitySet`] to decide which property groups to expose and
//! which requests are valid — closed-loop controllers accept absolute seeks,
//! open-loop motors only accept direction/speed/duration commands.
//!
//! Capabilities are represented as a set of enum values rather than raw
//! bitmask arithmetic; the set is immutable after device construction.

use std::fmt;

/// A single motion feature a focuser may support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Hardware reports absolute position and can be commanded to a target.
    AbsolutePosition,
    /// Hardware accepts relative (delta) moves.
    RelativeMotion,
    /// Motor speed is adjustable.
    VariableSpeed,
    /// Motion can be aborted mid-move.
    Abort,
    /// The in/out sense of motion can be reversed.
    ReverseMotion,
    /// Current position can be redefined without moving (closed-loop only).
    Sync,
    /// Backlash compensation is available.
    Backlash,
    /// Timed (duration-based) moves are supported.
    TimedMove,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::AbsolutePosition => "absolute position",
            Capability::RelativeMotion => "relative motion",
            Capability::VariableSpeed => "variable speed",
            Capability::Abort => "abort",
            Capability::ReverseMotion => "reverse motion",
            Capability::Sync => "sync",
            Capability::Backlash => "backlash",
            Capability::TimedMove => "timed move",
        };
        write!(f, "{}", name)
    }
}

/// The fixed feature set a concrete driver declares for its hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    absolute_position: bool,
    relative_motion: bool,
    variable_speed: bool,
    abort: bool,
    reverse_motion: bool,
    sync: bool,
    backlash: bool,
    timed_move: bool,
}

impl CapabilitySet {
    /// An empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style addition of one capability.
    pub fn with(mut self, cap: Capability) -> Self {
        match cap {
            Capability::AbsolutePosition => self.absolute_position = true,
            Capability::RelativeMotion => self.relative_motion = true,
            Capability::VariableSpeed => self.variable_speed = true,
            Capability::Abort => self.abort = true,
            Capability::ReverseMotion => self.reverse_motion = true,
            Capability::Sync => self.sync = true,
            Capability::Backlash => self.backlash = true,
            Capability::TimedMove => self.timed_move = true,
        }
        self
    }

    /// Query whether a capability is present.
    pub fn has(&self, cap: Capability) -> bool {
        match cap {
            Capability::AbsolutePosition => self.absolute_position,
            Capability::RelativeMotion => self.relative_motion,
            Capability::VariableSpeed => self.variable_speed,
            Capability::Abort => self.abort,
            Capability::ReverseMotion => self.reverse_motion,
            Capability::Sync => self.sync,
            Capability::Backlash => self.backlash,
            Capability::TimedMove => self.timed_move,
        }
    }

    /// A typical closed-loop focuser: absolute and relative seeks, abort,
    /// sync, reverse.
    pub fn closed_loop() -> Self {
        Self::new()
            .with(Capability::AbsolutePosition)
            .with(Capability::RelativeMotion)
            .with(Capability::Abort)
            .with(Capability::Sync)
            .with(Capability::ReverseMotion)
    }

    /// A typical open-loop focuser: direction/speed/duration moves only, no
    /// position feedback.
    pub fn open_loop() -> Self {
        Self::new()
            .with(Capability::VariableSpeed)
            .with(Capability::TimedMove)
            .with(Capability::Abort)
    }
}
