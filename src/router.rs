//! Inbound command dispatch.
//!
//! The protocol layer delivers three request kinds — numeric, switch, text —
//! addressed by device and property name. The router validates property
//! identity and value constraints, forwards each accepted request to the
//! owning component, and answers with the component's confirmation update.
//! Rejected requests leave prior state unchanged: the failure is published
//! as an alert on the update channel and returned to the caller.
//!
//! Property names the router does not own pass through as
//! [`Routed::NotMine`] so the protocol layer can try other registered
//! handlers.

use crate::connection::{ConnectionMode, ConnectionSelector};
use crate::error::{FocusResult, FocuserError};
use crate::hardware::FocusDirection;
use crate::motion::MotionController;
use crate::presets::PresetManager;
use crate::properties::{
    names, NumberRequest, PropertyState, PropertyUpdate, SwitchRequest, TextRequest,
};
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Outcome of a dispatch attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routed {
    /// The property belongs to this device and the request was applied.
    Handled,
    /// Unknown property; another handler may own it.
    NotMine,
}

/// Routes property update requests to the owning component.
pub struct CommandRouter {
    device_name: String,
    selector: Arc<Mutex<ConnectionSelector>>,
    motion: Arc<MotionController>,
    presets: Arc<PresetManager>,
    updates: broadcast::Sender<PropertyUpdate>,
}

/// Convert a protocol-layer number into whole ticks.
fn to_ticks(property: &str, value: f64) -> FocusResult<u32> {
    if !value.is_finite() || value < 0.0 || value > u32::MAX as f64 {
        return Err(FocuserError::Validation(format!(
            "{}: value {} out of range",
            property, value
        )));
    }
    Ok(value.round() as u32)
}

impl CommandRouter {
    pub fn new(
        device_name: impl Into<String>,
        selector: Arc<Mutex<ConnectionSelector>>,
        motion: Arc<MotionController>,
        presets: Arc<PresetManager>,
        updates: broadcast::Sender<PropertyUpdate>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            selector,
            motion,
            presets,
            updates,
        }
    }

    /// Publish the rejection and hand the error back to the caller. The
    /// owning component has already left its state untouched.
    fn reject(&self, property: &str, err: FocuserError) -> FocuserError {
        warn!("{} rejected: {}", property, err);
        let _ = self.updates.send(PropertyUpdate::Number {
            property: property.to_string(),
            state: PropertyState::Alert,
            items: Vec::new(),
            timestamp: chrono::Utc::now(),
        });
        let _ = self
            .updates
            .send(PropertyUpdate::message(format!("{}: {}", property, err)));
        err
    }

    fn required(&self, req: &NumberRequest, element: &str) -> FocusResult<f64> {
        req.value_of(element).ok_or_else(|| {
            FocuserError::Validation(format!(
                "{}: missing element '{}'",
                req.property, element
            ))
        })
    }

    /// Dispatch an inbound numeric request.
    pub async fn handle_number(&self, req: &NumberRequest) -> FocusResult<Routed> {
        if req.device != self.device_name {
            return Ok(Routed::NotMine);
        }
        match self.dispatch_number(req).await {
            Ok(routed) => Ok(routed),
            Err(e) => Err(self.reject(&req.property, e)),
        }
    }

    async fn dispatch_number(&self, req: &NumberRequest) -> FocusResult<Routed> {
        let property = req.property.as_str();
        let result = match property {
            names::ABS_FOCUS_POSITION => {
                let value = self.required(req, names::FOCUS_ABSOLUTE_POSITION)?;
                let target = to_ticks(property, value)?;
                self.motion.move_abs(target).await
            }
            names::REL_FOCUS_POSITION => {
                let value = self.required(req, names::FOCUS_RELATIVE_POSITION)?;
                let steps = to_ticks(property, value)? as i64;
                // The relative magnitude travels in the currently selected
                // direction.
                let delta = match self.motion.direction().await {
                    FocusDirection::Inward => -steps,
                    FocusDirection::Outward => steps,
                };
                self.motion.move_rel(delta).await
            }
            names::FOCUS_SPEED => {
                let value = self.required(req, names::FOCUS_SPEED_VALUE)?;
                self.motion.set_speed(to_ticks(property, value)?).await
            }
            names::FOCUS_TIMER => {
                let value = self.required(req, names::FOCUS_TIMER_VALUE)?;
                let ms = to_ticks(property, value)?;
                self.motion.move_timed(Duration::from_millis(ms as u64)).await
            }
            names::FOCUS_MAX => {
                let value = self.required(req, names::FOCUS_MAX_VALUE)?;
                let max = to_ticks(property, value)?;
                match self.motion.set_max_position(max).await {
                    Ok(()) => {
                        // Travel shrank or grew: the preset range follows.
                        self.presets.sync_range(max);
                        let _ = self.updates.send(PropertyUpdate::number(
                            names::FOCUS_MAX,
                            PropertyState::Ok,
                            vec![(names::FOCUS_MAX_VALUE.to_string(), max as f64)],
                        ));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            names::FOCUS_SYNC => {
                let value = self.required(req, names::FOCUS_SYNC_VALUE)?;
                self.motion.sync(to_ticks(property, value)?).await
            }
            names::FOCUS_BACKLASH_STEPS => {
                let value = self.required(req, names::FOCUS_BACKLASH_VALUE)?;
                self.motion
                    .set_backlash_steps(to_ticks(property, value)?)
                    .await
            }
            names::PRESETS => {
                let mut result = Ok(());
                for (slot, name) in [names::PRESET_1, names::PRESET_2, names::PRESET_3]
                    .iter()
                    .enumerate()
                {
                    if let Some(value) = req.value_of(name) {
                        let ticks = to_ticks(property, value)?;
                        if let Err(e) = self.presets.set_preset(slot, ticks).await {
                            result = Err(e);
                            break;
                        }
                    }
                }
                result
            }
            _ => return Ok(Routed::NotMine),
        };
        result.map(|()| Routed::Handled)
    }

    /// Dispatch an inbound switch request.
    pub async fn handle_switch(&self, req: &SwitchRequest) -> FocusResult<Routed> {
        if req.device != self.device_name {
            return Ok(Routed::NotMine);
        }
        match self.dispatch_switch(req).await {
            Ok(routed) => Ok(routed),
            Err(e) => Err(self.reject(&req.property, e)),
        }
    }

    async fn dispatch_switch(&self, req: &SwitchRequest) -> FocusResult<Routed> {
        let property = req.property.as_str();
        let result = match property {
            names::CONNECTION_MODE => match req.first_on() {
                Some(names::CONNECTION_SERIAL) => {
                    self.select_mode(ConnectionMode::Serial).await
                }
                Some(names::CONNECTION_TCP) => self.select_mode(ConnectionMode::Tcp).await,
                _ => Err(FocuserError::Validation(
                    "no connection mode selected".to_string(),
                )),
            },
            names::FOCUS_MOTION => match req.first_on() {
                Some(names::FOCUS_INWARD) => {
                    self.motion.set_direction(FocusDirection::Inward).await
                }
                Some(names::FOCUS_OUTWARD) => {
                    self.motion.set_direction(FocusDirection::Outward).await
                }
                _ => Err(FocuserError::Validation(
                    "no focus direction selected".to_string(),
                )),
            },
            names::FOCUS_ABORT_MOTION => {
                if req.items.iter().any(|i| i.name == names::ABORT && i.on) {
                    self.motion.abort().await
                } else {
                    Ok(())
                }
            }
            names::PRESET_GOTO => match req.first_on() {
                Some(names::GOTO_1) => self.presets.goto_preset(0).await,
                Some(names::GOTO_2) => self.presets.goto_preset(1).await,
                Some(names::GOTO_3) => self.presets.goto_preset(2).await,
                Some(other) => Err(FocuserError::Validation(format!(
                    "unknown preset selector '{}'",
                    other
                ))),
                None => Err(FocuserError::Validation(
                    "no preset selected".to_string(),
                )),
            },
            names::FOCUS_REVERSE_MOTION => {
                let reversed = req
                    .items
                    .iter()
                    .any(|i| i.name == names::ENABLED && i.on);
                self.motion.set_reverse(reversed).await
            }
            names::FOCUS_BACKLASH_TOGGLE => {
                let enabled = req
                    .items
                    .iter()
                    .any(|i| i.name == names::ENABLED && i.on);
                self.motion.set_backlash_enabled(enabled).await
            }
            _ => return Ok(Routed::NotMine),
        };
        result.map(|()| Routed::Handled)
    }

    /// Dispatch an inbound text request. The core defines no text vectors;
    /// everything passes through for other handlers.
    pub async fn handle_text(&self, req: &TextRequest) -> FocusResult<Routed> {
        let _ = req;
        Ok(Routed::NotMine)
    }

    async fn select_mode(&self, mode: ConnectionMode) -> FocusResult<()> {
        let mut selector = self.selector.lock().await;
        selector.select(mode)?;
        let _ = self.updates.send(PropertyUpdate::switch(
            names::CONNECTION_MODE,
            PropertyState::Ok,
            vec![
                (
                    names::CONNECTION_SERIAL.to_string(),
                    mode == ConnectionMode::Serial,
                ),
                (
                    names::CONNECTION_TCP.to_string(),
                    mode == ConnectionMode::Tcp,
                ),
            ],
        ));
        Ok(())
    }
}
