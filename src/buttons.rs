//! Hand-controller button dispatch.
//!
//! Maps named physical or virtual button events onto motion actions: press
//! starts a continuous move in the bound direction, release stops it. The
//! binding table is built at initialization and consulted on every event;
//! it is not persisted.
//!
//! Button events arrive on a channel shared with unrelated input devices,
//! so unknown names are ignored without error.

use crate::error::FocusResult;
use crate::hardware::FocusDirection;
use crate::motion::MotionController;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Arc;

/// Action bound to one button name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonAction {
    /// Continuous move in a direction while held.
    Move(FocusDirection),
    /// Abort all motion on press.
    Abort,
}

/// Routes button events to the motion controller.
pub struct ButtonDispatcher {
    bindings: HashMap<String, ButtonAction>,
    motion: Arc<MotionController>,
}

impl ButtonDispatcher {
    /// Dispatcher with the standard hand-controller bindings.
    pub fn new(motion: Arc<MotionController>) -> Self {
        let mut bindings = HashMap::new();
        bindings.insert(
            "Focus In".to_string(),
            ButtonAction::Move(FocusDirection::Inward),
        );
        bindings.insert(
            "Focus Out".to_string(),
            ButtonAction::Move(FocusDirection::Outward),
        );
        bindings.insert("Abort Focus".to_string(), ButtonAction::Abort);
        Self { bindings, motion }
    }

    /// Add or replace a binding.
    pub fn bind(&mut self, name: impl Into<String>, action: ButtonAction) {
        self.bindings.insert(name.into(), action);
    }

    /// Handle one button event. `pressed` is true on press, false on
    /// release. Unknown button names are ignored silently; they may belong
    /// to another device on the same event channel.
    pub async fn on_button_event(&self, name: &str, pressed: bool) -> FocusResult<()> {
        let action = match self.bindings.get(name) {
            Some(action) => *action,
            None => {
                trace!("ignoring unbound button '{}'", name);
                return Ok(());
            }
        };
        debug!(
            "button '{}' {}",
            name,
            if pressed { "pressed" } else { "released" }
        );
        match (action, pressed) {
            (ButtonAction::Move(dir), true) => self.motion.start_continuous(dir).await,
            (ButtonAction::Move(_), false) => self.motion.stop().await,
            (ButtonAction::Abort, true) => self.motion.abort().await,
            (ButtonAction::Abort, false) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionMode, ConnectionModeSet, ConnectionSelector, MockTransport};
    use crate::hardware::SimFocuser;
    use crate::motion::{MotionState, OverridePolicy};
    use tokio::sync::broadcast;

    async fn dispatcher() -> (ButtonDispatcher, Arc<MotionController>) {
        let driver = Arc::new(SimFocuser::closed_loop(50_000).with_rate(10_000.0));
        let (tx, _rx) = broadcast::channel(256);
        let motion = Arc::new(MotionController::new(
            driver.clone(),
            OverridePolicy::Reject,
            50_000,
            tx,
        ));
        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let (transport, _probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        let handle = selector.connect(driver.as_ref()).await.unwrap();
        motion.attach(handle).await;
        (ButtonDispatcher::new(motion.clone()), motion)
    }

    #[tokio::test]
    async fn test_press_starts_release_stops() {
        let (buttons, motion) = dispatcher().await;

        buttons.on_button_event("Focus Out", true).await.unwrap();
        assert!(motion.state().await.is_moving());

        buttons.on_button_event("Focus Out", false).await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_abort_button_fires_on_press_only() {
        let (buttons, motion) = dispatcher().await;

        buttons.on_button_event("Focus In", true).await.unwrap();
        buttons.on_button_event("Abort Focus", true).await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);

        // Release is a no-op.
        buttons.on_button_event("Abort Focus", false).await.unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_button_ignored() {
        let (buttons, motion) = dispatcher().await;

        buttons
            .on_button_event("Telescope Slew N", true)
            .await
            .unwrap();
        assert_eq!(motion.state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_custom_binding() {
        let (mut buttons, motion) = dispatcher().await;
        buttons.bind("Fine Focus", ButtonAction::Move(FocusDirection::Inward));

        buttons.on_button_event("Fine Focus", true).await.unwrap();
        assert!(motion.state().await.is_moving());
        buttons.on_button_event("Fine Focus", false).await.unwrap();
    }
}
