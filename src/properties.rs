//! Property-protocol primitives.
//!
//! The core talks to a generic instrument-control protocol layer in terms of
//! named properties: it defines property vectors during initialization,
//! receives inbound update requests for them, and publishes value changes.
//! Wire encoding, client subscription, and transport belong to that protocol
//! layer — this module only models the exchanged data.
//!
//! # Data Flow
//!
//! ```text
//! protocol layer --[NumberRequest/SwitchRequest/TextRequest]--> CommandRouter
//! core components --[PropertyUpdate]--> broadcast::channel --> protocol layer
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known focuser property and element names.
pub mod names {
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    pub const CONNECTION_MODE: &str = "CONNECTION_MODE";
    pub const CONNECTION_SERIAL: &str = "CONNECTION_SERIAL";
    pub const CONNECTION_TCP: &str = "CONNECTION_TCP";

    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const FOCUS_ABSOLUTE_POSITION: &str = "FOCUS_ABSOLUTE_POSITION";

    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_RELATIVE_POSITION: &str = "FOCUS_RELATIVE_POSITION";

    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";
    pub const FOCUS_INWARD: &str = "FOCUS_INWARD";
    pub const FOCUS_OUTWARD: &str = "FOCUS_OUTWARD";

    pub const FOCUS_SPEED: &str = "FOCUS_SPEED";
    pub const FOCUS_SPEED_VALUE: &str = "FOCUS_SPEED_VALUE";

    pub const FOCUS_TIMER: &str = "FOCUS_TIMER";
    pub const FOCUS_TIMER_VALUE: &str = "FOCUS_TIMER_VALUE";

    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
    pub const ABORT: &str = "ABORT";

    pub const FOCUS_MAX: &str = "FOCUS_MAX";
    pub const FOCUS_MAX_VALUE: &str = "FOCUS_MAX_VALUE";

    pub const FOCUS_REVERSE_MOTION: &str = "FOCUS_REVERSE_MOTION";
    pub const ENABLED: &str = "INDI_ENABLED";
    pub const DISABLED: &str = "INDI_DISABLED";

    pub const FOCUS_SYNC: &str = "FOCUS_SYNC";
    pub const FOCUS_SYNC_VALUE: &str = "FOCUS_SYNC_VALUE";

    pub const FOCUS_BACKLASH_TOGGLE: &str = "FOCUS_BACKLASH_TOGGLE";
    pub const FOCUS_BACKLASH_STEPS: &str = "FOCUS_BACKLASH_STEPS";
    pub const FOCUS_BACKLASH_VALUE: &str = "FOCUS_BACKLASH_VALUE";

    pub const PRESETS: &str = "Presets";
    pub const PRESET_1: &str = "PRESET_1";
    pub const PRESET_2: &str = "PRESET_2";
    pub const PRESET_3: &str = "PRESET_3";

    pub const PRESET_GOTO: &str = "Goto";
    pub const GOTO_1: &str = "Preset 1";
    pub const GOTO_2: &str = "Preset 2";
    pub const GOTO_3: &str = "Preset 3";
}

/// Display state attached to every published property vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyState {
    /// No value set yet, or property inactive.
    Idle,
    /// Last request applied successfully.
    Ok,
    /// An operation on this property is in flight.
    Busy,
    /// Last request was rejected or the hardware faulted.
    Alert,
}

/// One named number element inside an inbound numeric request.
#[derive(Clone, Debug, PartialEq)]
pub struct NumberItem {
    pub name: String,
    pub value: f64,
}

impl NumberItem {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One named switch element inside an inbound switch request.
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchItem {
    pub name: String,
    pub on: bool,
}

impl SwitchItem {
    pub fn new(name: impl Into<String>, on: bool) -> Self {
        Self {
            name: name.into(),
            on,
        }
    }
}

/// Inbound numeric property update request.
#[derive(Clone, Debug)]
pub struct NumberRequest {
    /// Target device name.
    pub device: String,
    /// Property vector name.
    pub property: String,
    /// Elements, in the order the client sent them.
    pub items: Vec<NumberItem>,
}

impl NumberRequest {
    pub fn new(device: impl Into<String>, property: impl Into<String>, items: Vec<NumberItem>) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
            items,
        }
    }

    /// Value of the element with the given name, if present.
    pub fn value_of(&self, name: &str) -> Option<f64> {
        self.items.iter().find(|i| i.name == name).map(|i| i.value)
    }
}

/// Inbound switch property update request.
#[derive(Clone, Debug)]
pub struct SwitchRequest {
    pub device: String,
    pub property: String,
    pub items: Vec<SwitchItem>,
}

impl SwitchRequest {
    pub fn new(device: impl Into<String>, property: impl Into<String>, items: Vec<SwitchItem>) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
            items,
        }
    }

    /// Name of the first element switched on, if any. Selector-style vectors
    /// (one-of-many) carry exactly one.
    pub fn first_on(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.on)
            .map(|i| i.name.as_str())
    }
}

/// Inbound text property update request. The core defines no text vectors of
/// its own; these exist so driver-specific metadata can share the channel.
#[derive(Clone, Debug)]
pub struct TextRequest {
    pub device: String,
    pub property: String,
    pub items: Vec<(String, String)>,
}

/// Outbound event published by the core towards the protocol layer.
#[derive(Clone, Debug)]
pub enum PropertyUpdate {
    /// Declare a numeric property vector (during init or on connect).
    DefineNumber {
        property: String,
        items: Vec<(String, f64)>,
        min: f64,
        max: f64,
        timestamp: DateTime<Utc>,
    },
    /// Declare a switch property vector.
    DefineSwitch {
        property: String,
        items: Vec<(String, bool)>,
        timestamp: DateTime<Utc>,
    },
    /// Remove a previously defined property vector (on disconnect).
    Delete {
        property: String,
        timestamp: DateTime<Utc>,
    },
    /// Numeric value change notification.
    Number {
        property: String,
        state: PropertyState,
        items: Vec<(String, f64)>,
        timestamp: DateTime<Utc>,
    },
    /// Switch value change notification.
    Switch {
        property: String,
        state: PropertyState,
        items: Vec<(String, bool)>,
        timestamp: DateTime<Utc>,
    },
    /// Free-form status message (errors, faults, progress).
    Message {
        text: String,
        timestamp: DateTime<Utc>,
    },
}

impl PropertyUpdate {
    /// Property name this update refers to, if it is vector-scoped.
    pub fn property(&self) -> Option<&str> {
        match self {
            PropertyUpdate::DefineNumber { property, .. }
            | PropertyUpdate::DefineSwitch { property, .. }
            | PropertyUpdate::Delete { property, .. }
            | PropertyUpdate::Number { property, .. }
            | PropertyUpdate::Switch { property, .. } => Some(property),
            PropertyUpdate::Message { .. } => None,
        }
    }

    pub fn number(property: &str, state: PropertyState, items: Vec<(String, f64)>) -> Self {
        PropertyUpdate::Number {
            property: property.to_string(),
            state,
            items,
            timestamp: Utc::now(),
        }
    }

    pub fn switch(property: &str, state: PropertyState, items: Vec<(String, bool)>) -> Self {
        PropertyUpdate::Switch {
            property: property.to_string(),
            state,
            items,
            timestamp: Utc::now(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        PropertyUpdate::Message {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_request_lookup() {
        let req = NumberRequest::new(
            "Focuser Sim",
            names::ABS_FOCUS_POSITION,
            vec![NumberItem::new(names::FOCUS_ABSOLUTE_POSITION, 1234.0)],
        );
        assert_eq!(req.value_of(names::FOCUS_ABSOLUTE_POSITION), Some(1234.0));
        assert_eq!(req.value_of("NO_SUCH_ELEMENT"), None);
    }

    #[test]
    fn test_switch_request_first_on() {
        let req = SwitchRequest::new(
            "Focuser Sim",
            names::PRESET_GOTO,
            vec![
                SwitchItem::new(names::GOTO_1, false),
                SwitchItem::new(names::GOTO_2, true),
                SwitchItem::new(names::GOTO_3, false),
            ],
        );
        assert_eq!(req.first_on(), Some(names::GOTO_2));
    }

    #[test]
    fn test_update_property_name() {
        let update = PropertyUpdate::number(
            names::ABS_FOCUS_POSITION,
            PropertyState::Ok,
            vec![(names::FOCUS_ABSOLUTE_POSITION.to_string(), 10.0)],
        );
        assert_eq!(update.property(), Some(names::ABS_FOCUS_POSITION));
        assert_eq!(PropertyUpdate::message("hello").property(), None);
    }
}
