//! Named preset positions.
//!
//! A fixed table of exactly three (label, target) pairs plus a one-of-three
//! goto trigger. Targets always lie within the current travel limit: setting
//! an out-of-range value is rejected, and a shrinking limit clamps stored
//! values down via [`PresetManager::sync_range`].

use crate::capabilities::Capability;
use crate::error::{FocusResult, FocuserError};
use crate::motion::MotionController;
use crate::properties::{names, PropertyState, PropertyUpdate};
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Number of preset slots; fixed at construction, never resized.
pub const PRESET_COUNT: usize = 3;

/// One stored preset: a label and a target position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresetSlot {
    pub label: String,
    pub target: u32,
}

/// Fixed-size table of preset positions with a goto trigger.
pub struct PresetManager {
    slots: Mutex<[PresetSlot; PRESET_COUNT]>,
    motion: Arc<MotionController>,
    updates: broadcast::Sender<PropertyUpdate>,
}

fn lock(
    slots: &Mutex<[PresetSlot; PRESET_COUNT]>,
) -> MutexGuard<'_, [PresetSlot; PRESET_COUNT]> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PresetManager {
    pub fn new(motion: Arc<MotionController>, updates: broadcast::Sender<PropertyUpdate>) -> Self {
        let slots = [
            PresetSlot {
                label: names::PRESET_1.to_string(),
                target: 0,
            },
            PresetSlot {
                label: names::PRESET_2.to_string(),
                target: 0,
            },
            PresetSlot {
                label: names::PRESET_3.to_string(),
                target: 0,
            },
        ];
        Self {
            slots: Mutex::new(slots),
            motion,
            updates,
        }
    }

    /// Current targets, in slot order.
    pub fn values(&self) -> [u32; PRESET_COUNT] {
        let slots = lock(&self.slots);
        [slots[0].target, slots[1].target, slots[2].target]
    }

    fn emit_values(&self, state: PropertyState) {
        let slots = lock(&self.slots);
        let items = slots
            .iter()
            .map(|slot| (slot.label.clone(), slot.target as f64))
            .collect();
        let _ = self.updates.send(PropertyUpdate::number(
            names::PRESETS,
            state,
            items,
        ));
    }

    /// Store a preset target. Rejected when the value exceeds the current
    /// travel limit; the stored value is unchanged on rejection.
    pub async fn set_preset(&self, slot: usize, value: u32) -> FocusResult<()> {
        if slot >= PRESET_COUNT {
            return Err(FocuserError::Validation(format!(
                "preset slot {} out of range",
                slot
            )));
        }
        let max = self.motion.max_position().await;
        if value > max {
            return Err(FocuserError::Validation(format!(
                "preset {} above maximum travel {}",
                value, max
            )));
        }
        lock(&self.slots)[slot].target = value;
        debug!("preset {} set to {}", slot + 1, value);
        self.emit_values(PropertyState::Ok);
        Ok(())
    }

    /// Restore persisted preset values at startup, clamped into the current
    /// travel range.
    pub async fn restore(&self, values: [u32; PRESET_COUNT]) {
        let max = self.motion.max_position().await;
        {
            let mut slots = lock(&self.slots);
            for (slot, value) in slots.iter_mut().zip(values) {
                slot.target = value.min(max);
            }
        }
        self.emit_values(PropertyState::Ok);
    }

    /// Seek to the stored target of one slot. Fails with an unsupported
    /// condition (and issues no hardware command) on hardware without
    /// position feedback.
    pub async fn goto_preset(&self, slot: usize) -> FocusResult<()> {
        if slot >= PRESET_COUNT {
            return Err(FocuserError::Validation(format!(
                "preset slot {} out of range",
                slot
            )));
        }
        if !self
            .motion
            .capabilities()
            .has(Capability::AbsolutePosition)
        {
            return Err(FocuserError::Unsupported(
                "preset goto requires absolute positioning".to_string(),
            ));
        }
        let target = lock(&self.slots)[slot].target;
        info!("goto preset {} (target {})", slot + 1, target);

        // One-of-three selector: selecting a slot deselects the others.
        let goto_items: Vec<(String, bool)> = [names::GOTO_1, names::GOTO_2, names::GOTO_3]
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i == slot))
            .collect();
        let _ = self.updates.send(PropertyUpdate::switch(
            names::PRESET_GOTO,
            PropertyState::Busy,
            goto_items.clone(),
        ));

        match self.motion.move_abs(target).await {
            Ok(()) => {
                let _ = self.updates.send(PropertyUpdate::switch(
                    names::PRESET_GOTO,
                    PropertyState::Ok,
                    goto_items,
                ));
                Ok(())
            }
            Err(e) => {
                let _ = self.updates.send(PropertyUpdate::switch(
                    names::PRESET_GOTO,
                    PropertyState::Alert,
                    goto_items,
                ));
                Err(e)
            }
        }
    }

    /// Re-synchronize the table against a new travel limit: out-of-range
    /// targets are clamped down to `new_max`, in-range targets are left
    /// untouched, and the editable bound is republished. Idempotent.
    pub fn sync_range(&self, new_max: u32) {
        let mut changed = false;
        {
            let mut slots = lock(&self.slots);
            for slot in slots.iter_mut() {
                if slot.target > new_max {
                    slot.target = new_max;
                    changed = true;
                }
            }
        }
        let _ = self.updates.send(PropertyUpdate::DefineNumber {
            property: names::PRESETS.to_string(),
            items: {
                let slots = lock(&self.slots);
                slots
                    .iter()
                    .map(|slot| (slot.label.clone(), slot.target as f64))
                    .collect()
            },
            min: 0.0,
            max: new_max as f64,
            timestamp: chrono::Utc::now(),
        });
        if changed {
            self.emit_values(PropertyState::Ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilitySet;
    use crate::connection::{ConnectionMode, ConnectionModeSet, ConnectionSelector, MockTransport};
    use crate::hardware::SimFocuser;
    use crate::motion::{MotionState, OverridePolicy};

    const MAX: u32 = 50_000;

    async fn presets_with_motion(
        connect: bool,
        caps: Option<CapabilitySet>,
    ) -> (PresetManager, Arc<MotionController>) {
        let driver = match caps {
            Some(caps) => Arc::new(SimFocuser::new(caps, MAX).with_rate(f64::INFINITY)),
            None => Arc::new(SimFocuser::closed_loop(MAX).with_rate(f64::INFINITY)),
        };
        let (tx, _rx) = broadcast::channel(256);
        let motion = Arc::new(MotionController::new(
            driver.clone(),
            OverridePolicy::Reject,
            MAX,
            tx.clone(),
        ));
        if connect {
            let mut selector =
                ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
            let (transport, _probe) = MockTransport::new();
            selector
                .register(ConnectionMode::Serial, Box::new(transport))
                .unwrap();
            let handle = selector.connect(driver.as_ref()).await.unwrap();
            motion.attach(handle).await;
        }
        (PresetManager::new(motion.clone(), tx), motion)
    }

    #[tokio::test]
    async fn test_set_preset_within_range() {
        let (presets, _motion) = presets_with_motion(false, None).await;

        presets.set_preset(0, 1_000).await.unwrap();
        presets.set_preset(2, MAX).await.unwrap();
        assert_eq!(presets.values(), [1_000, 0, MAX]);
    }

    #[tokio::test]
    async fn test_set_preset_above_max_rejected() {
        let (presets, _motion) = presets_with_motion(false, None).await;

        presets.set_preset(1, 2_000).await.unwrap();
        let err = presets.set_preset(1, MAX + 1).await.unwrap_err();
        assert!(matches!(err, FocuserError::Validation(_)));
        assert_eq!(presets.values()[1], 2_000);
    }

    #[tokio::test]
    async fn test_invalid_slot_rejected() {
        let (presets, _motion) = presets_with_motion(false, None).await;
        assert!(matches!(
            presets.set_preset(3, 100).await.unwrap_err(),
            FocuserError::Validation(_)
        ));
        assert!(matches!(
            presets.goto_preset(7).await.unwrap_err(),
            FocuserError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_sync_range_clamps_only_out_of_range() {
        let (presets, _motion) = presets_with_motion(false, None).await;

        presets.set_preset(0, 10_000).await.unwrap();
        presets.set_preset(1, 40_000).await.unwrap();

        presets.sync_range(30_000);
        assert_eq!(presets.values(), [10_000, 30_000, 0]);

        // Idempotent under repetition.
        presets.sync_range(30_000);
        assert_eq!(presets.values(), [10_000, 30_000, 0]);
    }

    #[tokio::test]
    async fn test_goto_preset_moves_to_target() {
        let (presets, motion) = presets_with_motion(true, None).await;

        presets.set_preset(1, 12_000).await.unwrap();
        presets.goto_preset(1).await.unwrap();
        motion.poll().await.unwrap();

        assert_eq!(motion.state().await, MotionState::Idle);
        assert_eq!(motion.position().await, 12_000);
    }

    #[tokio::test]
    async fn test_goto_preset_unsupported_without_position_feedback() {
        let (presets, motion) =
            presets_with_motion(true, Some(CapabilitySet::open_loop())).await;

        let err = presets.goto_preset(0).await.unwrap_err();
        assert!(matches!(err, FocuserError::Unsupported(_)));
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_shrink_then_goto_scenario() {
        // MaxPosition=50000, preset 1 = 40000; shrink travel to 30000 and
        // the preset follows; goto then ends idle at 30000.
        let (presets, motion) = presets_with_motion(true, None).await;

        presets.set_preset(1, 40_000).await.unwrap();
        motion.set_max_position(30_000).await.unwrap();
        presets.sync_range(30_000);
        assert_eq!(presets.values()[1], 30_000);

        presets.goto_preset(1).await.unwrap();
        motion.poll().await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
        assert_eq!(motion.position().await, 30_000);
    }
}
