//! Device composition root.
//!
//! `FocuserDevice` wires one driver to the full control stack: connection
//! selection and handshake, the motion state machine, the preset table, the
//! button dispatcher, and inbound routing. It owns the outbound update
//! channel the protocol layer subscribes to, and it is the single entry
//! point the protocol layer calls into.
//!
//! The device carries two orthogonal capability sets — the connection modes
//! it supports and the motion features of its hardware — each queryable on
//! its own; there is no inheritance between them.

use crate::buttons::{ButtonAction, ButtonDispatcher};
use crate::capabilities::{Capability, CapabilitySet};
use crate::config::Settings;
use crate::connection::{ConnectionMode, ConnectionModeSet, ConnectionSelector, Transport};
use crate::error::{FocusResult, FocuserError};
use crate::hardware::FocuserDriver;
use crate::motion::{MotionController, OverridePolicy};
use crate::presets::PresetManager;
use crate::properties::{
    names, NumberRequest, PropertyState, PropertyUpdate, SwitchRequest, TextRequest,
};
use crate::router::{CommandRouter, Routed};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const UPDATE_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MAX_POSITION: u32 = 100_000;

/// Builder for [`FocuserDevice`].
///
/// The connection mode set must be fixed here, before the device registers
/// its connection interfaces; it cannot change afterwards.
pub struct FocuserDeviceBuilder {
    name: Option<String>,
    driver: Arc<dyn FocuserDriver>,
    modes: ConnectionModeSet,
    policy: OverridePolicy,
    default_max: u32,
    settings: Settings,
    transports: Vec<(ConnectionMode, Box<dyn Transport>)>,
}

impl FocuserDeviceBuilder {
    pub fn new(driver: Arc<dyn FocuserDriver>) -> Self {
        Self {
            name: None,
            driver,
            modes: ConnectionModeSet::new().with(ConnectionMode::Serial),
            policy: OverridePolicy::default(),
            default_max: DEFAULT_MAX_POSITION,
            settings: Settings::default(),
            transports: Vec::new(),
        }
    }

    /// Device name used for property addressing. Defaults to the driver
    /// name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declare the supported connection modes. Must be called before
    /// `build`; the set is immutable once the device exists.
    pub fn connection_modes(mut self, modes: ConnectionModeSet) -> Self {
        self.modes = modes;
        self
    }

    /// Supply the transport backing one supported mode.
    pub fn transport(mut self, mode: ConnectionMode, transport: Box<dyn Transport>) -> Self {
        self.transports.push((mode, transport));
        self
    }

    /// Busy policy for motion requests while a move is in flight.
    pub fn override_policy(mut self, policy: OverridePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Travel limit used until the hardware reports its own.
    pub fn max_position(mut self, ticks: u32) -> Self {
        self.default_max = ticks;
        self
    }

    /// Persisted options restored before connect.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> FocusResult<FocuserDevice> {
        let name = match self.name {
            Some(name) => name,
            None => self.driver.name().to_string(),
        };

        let mut selector = ConnectionSelector::new(self.modes);
        selector.set_handshake_timeout(Duration::from_millis(
            self.settings.connection.handshake_timeout_ms,
        ));
        for (mode, transport) in self.transports {
            selector.register(mode, transport)?;
        }
        match self.settings.connection_mode() {
            Ok(mode) if self.modes.has(mode) => selector.select(mode)?,
            Ok(mode) => warn!(
                "configured connection mode '{}' not supported; keeping '{}'",
                mode.label(),
                selector.selected().label()
            ),
            Err(e) => warn!("ignoring invalid configured connection mode: {}", e),
        }

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let motion = Arc::new(MotionController::new(
            self.driver.clone(),
            self.policy,
            self.default_max,
            updates.clone(),
        ));
        let presets = Arc::new(PresetManager::new(motion.clone(), updates.clone()));
        let buttons = ButtonDispatcher::new(motion.clone());
        let selector = Arc::new(Mutex::new(selector));
        let router = CommandRouter::new(
            name.clone(),
            selector.clone(),
            motion.clone(),
            presets.clone(),
            updates.clone(),
        );

        Ok(FocuserDevice {
            name,
            driver: self.driver,
            selector,
            motion,
            presets,
            buttons,
            router,
            updates,
            settings: std::sync::Mutex::new(self.settings),
        })
    }
}

/// One focuser instance: a driver plus the uniform control surface around
/// it.
pub struct FocuserDevice {
    name: String,
    driver: Arc<dyn FocuserDriver>,
    selector: Arc<Mutex<ConnectionSelector>>,
    motion: Arc<MotionController>,
    presets: Arc<PresetManager>,
    buttons: ButtonDispatcher,
    router: CommandRouter,
    updates: broadcast::Sender<PropertyUpdate>,
    settings: std::sync::Mutex<Settings>,
}

impl FocuserDevice {
    pub fn builder(driver: Arc<dyn FocuserDriver>) -> FocuserDeviceBuilder {
        FocuserDeviceBuilder::new(driver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.motion.capabilities()
    }

    pub fn motion(&self) -> &Arc<MotionController> {
        &self.motion
    }

    pub fn presets(&self) -> &Arc<PresetManager> {
        &self.presets
    }

    pub fn buttons_mut(&mut self) -> &mut ButtonDispatcher {
        &mut self.buttons
    }

    /// Subscribe to outbound property updates.
    pub fn subscribe(&self) -> broadcast::Receiver<PropertyUpdate> {
        self.updates.subscribe()
    }

    fn emit(&self, update: PropertyUpdate) {
        let _ = self.updates.send(update);
    }

    /// Declare the properties that exist regardless of connection state:
    /// the connection switches and the preset table. Restores persisted
    /// preset values.
    pub async fn init_properties(&self) {
        let now = chrono::Utc::now();
        self.emit(PropertyUpdate::DefineSwitch {
            property: names::CONNECTION.to_string(),
            items: vec![
                (names::CONNECT.to_string(), false),
                (names::DISCONNECT.to_string(), true),
            ],
            timestamp: now,
        });

        let selector = self.selector.lock().await;
        let supported = selector.supported();
        if supported.has(ConnectionMode::Serial) && supported.has(ConnectionMode::Tcp) {
            let selected = selector.selected();
            self.emit(PropertyUpdate::DefineSwitch {
                property: names::CONNECTION_MODE.to_string(),
                items: vec![
                    (
                        names::CONNECTION_SERIAL.to_string(),
                        selected == ConnectionMode::Serial,
                    ),
                    (
                        names::CONNECTION_TCP.to_string(),
                        selected == ConnectionMode::Tcp,
                    ),
                ],
                timestamp: now,
            });
        }
        drop(selector);

        let preset_values = {
            let settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.preset_values()
        };
        self.presets.restore(preset_values).await;
        self.presets.sync_range(self.motion.max_position().await);
        self.emit(PropertyUpdate::DefineSwitch {
            property: names::PRESET_GOTO.to_string(),
            items: vec![
                (names::GOTO_1.to_string(), false),
                (names::GOTO_2.to_string(), false),
                (names::GOTO_3.to_string(), false),
            ],
            timestamp: now,
        });
    }

    /// Declare or remove the motion properties that only exist while the
    /// link is live, according to the declared capability set.
    async fn update_properties(&self, connected: bool) {
        let caps = self.capabilities();
        let now = chrono::Utc::now();
        let max = self.motion.max_position().await as f64;

        let mut defined: Vec<(&str, PropertyUpdate)> = Vec::new();
        if caps.has(Capability::AbsolutePosition) {
            defined.push((
                names::ABS_FOCUS_POSITION,
                PropertyUpdate::DefineNumber {
                    property: names::ABS_FOCUS_POSITION.to_string(),
                    items: vec![(
                        names::FOCUS_ABSOLUTE_POSITION.to_string(),
                        self.motion.position().await as f64,
                    )],
                    min: 0.0,
                    max,
                    timestamp: now,
                },
            ));
            defined.push((
                names::FOCUS_MAX,
                PropertyUpdate::DefineNumber {
                    property: names::FOCUS_MAX.to_string(),
                    items: vec![(names::FOCUS_MAX_VALUE.to_string(), max)],
                    min: 1.0,
                    max: u32::MAX as f64,
                    timestamp: now,
                },
            ));
        }
        if caps.has(Capability::AbsolutePosition) || caps.has(Capability::RelativeMotion) {
            defined.push((
                names::REL_FOCUS_POSITION,
                PropertyUpdate::DefineNumber {
                    property: names::REL_FOCUS_POSITION.to_string(),
                    items: vec![(names::FOCUS_RELATIVE_POSITION.to_string(), 0.0)],
                    min: 0.0,
                    max,
                    timestamp: now,
                },
            ));
        }
        defined.push((
            names::FOCUS_MOTION,
            PropertyUpdate::DefineSwitch {
                property: names::FOCUS_MOTION.to_string(),
                items: vec![
                    (names::FOCUS_INWARD.to_string(), false),
                    (names::FOCUS_OUTWARD.to_string(), false),
                ],
                timestamp: now,
            },
        ));
        if caps.has(Capability::VariableSpeed) {
            defined.push((
                names::FOCUS_SPEED,
                PropertyUpdate::DefineNumber {
                    property: names::FOCUS_SPEED.to_string(),
                    items: vec![(
                        names::FOCUS_SPEED_VALUE.to_string(),
                        self.motion.speed().await as f64,
                    )],
                    min: 1.0,
                    max: 255.0,
                    timestamp: now,
                },
            ));
        }
        if caps.has(Capability::TimedMove) {
            defined.push((
                names::FOCUS_TIMER,
                PropertyUpdate::DefineNumber {
                    property: names::FOCUS_TIMER.to_string(),
                    items: vec![(names::FOCUS_TIMER_VALUE.to_string(), 0.0)],
                    min: 0.0,
                    max: 60_000.0,
                    timestamp: now,
                },
            ));
        }
        if caps.has(Capability::Abort) {
            defined.push((
                names::FOCUS_ABORT_MOTION,
                PropertyUpdate::DefineSwitch {
                    property: names::FOCUS_ABORT_MOTION.to_string(),
                    items: vec![(names::ABORT.to_string(), false)],
                    timestamp: now,
                },
            ));
        }
        if caps.has(Capability::ReverseMotion) {
            defined.push((
                names::FOCUS_REVERSE_MOTION,
                PropertyUpdate::DefineSwitch {
                    property: names::FOCUS_REVERSE_MOTION.to_string(),
                    items: vec![
                        (names::ENABLED.to_string(), false),
                        (names::DISABLED.to_string(), true),
                    ],
                    timestamp: now,
                },
            ));
        }
        if caps.has(Capability::Sync) {
            defined.push((
                names::FOCUS_SYNC,
                PropertyUpdate::DefineNumber {
                    property: names::FOCUS_SYNC.to_string(),
                    items: vec![(names::FOCUS_SYNC_VALUE.to_string(), 0.0)],
                    min: 0.0,
                    max,
                    timestamp: now,
                },
            ));
        }
        if caps.has(Capability::Backlash) {
            defined.push((
                names::FOCUS_BACKLASH_TOGGLE,
                PropertyUpdate::DefineSwitch {
                    property: names::FOCUS_BACKLASH_TOGGLE.to_string(),
                    items: vec![
                        (names::ENABLED.to_string(), false),
                        (names::DISABLED.to_string(), true),
                    ],
                    timestamp: now,
                },
            ));
            defined.push((
                names::FOCUS_BACKLASH_STEPS,
                PropertyUpdate::DefineNumber {
                    property: names::FOCUS_BACKLASH_STEPS.to_string(),
                    items: vec![(names::FOCUS_BACKLASH_VALUE.to_string(), 0.0)],
                    min: 0.0,
                    max: 1_000.0,
                    timestamp: now,
                },
            ));
        }

        for (property, update) in defined {
            if connected {
                self.emit(update);
            } else {
                self.emit(PropertyUpdate::Delete {
                    property: property.to_string(),
                    timestamp: now,
                });
            }
        }
    }

    /// Open the selected connection mode, run the handshake, and bring the
    /// motion stack online. A failed attempt leaves the device cleanly
    /// disconnected; it is never retried internally.
    pub async fn connect(&self) -> FocusResult<()> {
        let result = {
            let mut selector = self.selector.lock().await;
            selector.connect(self.driver.as_ref()).await
        };
        match result {
            Ok(handle) => {
                let position = self.motion.attach(handle).await;
                if let Some(max) = self.driver.max_position_hint() {
                    if let Err(e) = self.motion.set_max_position(max).await {
                        warn!("could not apply reported travel limit: {}", e);
                    } else {
                        self.presets.sync_range(max);
                    }
                }
                self.update_properties(true).await;
                self.emit(PropertyUpdate::switch(
                    names::CONNECTION,
                    PropertyState::Ok,
                    vec![
                        (names::CONNECT.to_string(), true),
                        (names::DISCONNECT.to_string(), false),
                    ],
                ));
                self.emit(PropertyUpdate::message(format!(
                    "{} connected at position {}",
                    self.name, position
                )));
                info!("{} connected", self.name);
                Ok(())
            }
            Err(e) => {
                self.emit(PropertyUpdate::switch(
                    names::CONNECTION,
                    PropertyState::Alert,
                    vec![
                        (names::CONNECT.to_string(), false),
                        (names::DISCONNECT.to_string(), true),
                    ],
                ));
                self.emit(PropertyUpdate::message(format!(
                    "{} connection failed: {}",
                    self.name, e
                )));
                Err(e)
            }
        }
    }

    /// Orderly disconnect: stop any motion, close the link, retract the
    /// motion properties. Idempotent.
    pub async fn disconnect(&self) -> FocusResult<()> {
        if self.motion.state().await.is_moving() {
            if let Err(e) = self.motion.abort().await {
                warn!("abort before disconnect failed: {}", e);
            }
        }
        self.motion.detach().await;
        {
            let mut selector = self.selector.lock().await;
            selector.disconnect().await?;
        }
        self.update_properties(false).await;
        self.emit(PropertyUpdate::switch(
            names::CONNECTION,
            PropertyState::Ok,
            vec![
                (names::CONNECT.to_string(), false),
                (names::DISCONNECT.to_string(), true),
            ],
        ));
        info!("{} disconnected", self.name);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.selector.lock().await.is_connected()
    }

    /// Periodic status tick, called from the owner's timer. Completion
    /// checks and fault detection happen here; a detected fault closes the
    /// link so no further hardware commands can go out.
    pub async fn poll(&self) -> FocusResult<()> {
        match self.motion.poll().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fault() {
                    let mut selector = self.selector.lock().await;
                    let _ = selector.disconnect().await;
                    drop(selector);
                    self.update_properties(false).await;
                    self.emit(PropertyUpdate::switch(
                        names::CONNECTION,
                        PropertyState::Alert,
                        vec![
                            (names::CONNECT.to_string(), false),
                            (names::DISCONNECT.to_string(), true),
                        ],
                    ));
                }
                Err(e)
            }
        }
    }

    /// Inbound numeric request. The connection switches are handled here;
    /// everything else goes through the router.
    pub async fn handle_number(&self, req: &NumberRequest) -> FocusResult<Routed> {
        self.router.handle_number(req).await
    }

    /// Inbound switch request.
    pub async fn handle_switch(&self, req: &SwitchRequest) -> FocusResult<Routed> {
        if req.device == self.name && req.property == names::CONNECTION {
            let want_connect = req
                .items
                .iter()
                .any(|i| i.name == names::CONNECT && i.on);
            let result = if want_connect {
                self.connect().await
            } else {
                self.disconnect().await
            };
            return match result {
                Ok(()) => Ok(Routed::Handled),
                Err(e) => Err(e),
            };
        }
        self.router.handle_switch(req).await
    }

    /// Inbound text request. Reserved; always passed through.
    pub async fn handle_text(&self, req: &TextRequest) -> FocusResult<Routed> {
        self.router.handle_text(req).await
    }

    /// Inbound button event from the external input source.
    pub async fn on_button_event(&self, name: &str, pressed: bool) -> FocusResult<()> {
        self.buttons.on_button_event(name, pressed).await
    }

    /// Add or replace a button binding.
    pub fn bind_button(&mut self, name: impl Into<String>, action: ButtonAction) {
        self.buttons.bind(name, action);
    }

    /// Persist the current connection mode and preset values.
    pub async fn save_config(&self, path: &Path) -> FocusResult<()> {
        let mode = self.selector.lock().await.selected();
        let presets = self.presets.values();
        let snapshot = {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.set_connection_mode(mode);
            settings.set_preset_values(presets);
            settings.clone()
        };
        snapshot.save(path)?;
        info!("{} configuration saved to {}", self.name, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockTransport;
    use crate::hardware::SimFocuser;
    use crate::motion::MotionState;
    use crate::properties::SwitchItem;

    const MAX: u32 = 50_000;

    fn device() -> (FocuserDevice, crate::connection::mock::MockProbe) {
        let driver = Arc::new(SimFocuser::closed_loop(MAX).with_rate(f64::INFINITY));
        let (transport, probe) = MockTransport::new();
        let device = FocuserDevice::builder(driver)
            .name("Focuser Sim")
            .connection_modes(ConnectionModeSet::new().with(ConnectionMode::Serial))
            .transport(ConnectionMode::Serial, Box::new(transport))
            .max_position(MAX)
            .build()
            .unwrap();
        (device, probe)
    }

    #[tokio::test]
    async fn test_connect_defines_motion_properties() {
        let (device, _probe) = device();
        let mut rx = device.subscribe();

        device.init_properties().await;
        device.connect().await.unwrap();
        assert!(device.is_connected().await);

        let mut defined = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let PropertyUpdate::DefineNumber { property, .. } = &update {
                defined.push(property.clone());
            }
        }
        assert!(defined.contains(&names::ABS_FOCUS_POSITION.to_string()));
        assert!(defined.contains(&names::FOCUS_MAX.to_string()));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_clean_state() {
        let (device, probe) = device();
        probe.fail_handshake(true);

        let err = device.connect().await.unwrap_err();
        assert!(matches!(err, FocuserError::Connection(_)));
        assert!(!device.is_connected().await);

        // Explicit reconnect works once the device answers again.
        probe.fail_handshake(false);
        device.connect().await.unwrap();
        assert!(device.is_connected().await);
    }

    #[tokio::test]
    async fn test_connection_switch_roundtrip() {
        let (device, _probe) = device();

        let req = SwitchRequest::new(
            "Focuser Sim",
            names::CONNECTION,
            vec![
                SwitchItem::new(names::CONNECT, true),
                SwitchItem::new(names::DISCONNECT, false),
            ],
        );
        assert_eq!(device.handle_switch(&req).await.unwrap(), Routed::Handled);
        assert!(device.is_connected().await);

        let req = SwitchRequest::new(
            "Focuser Sim",
            names::CONNECTION,
            vec![
                SwitchItem::new(names::CONNECT, false),
                SwitchItem::new(names::DISCONNECT, true),
            ],
        );
        assert_eq!(device.handle_switch(&req).await.unwrap(), Routed::Handled);
        assert!(!device.is_connected().await);
    }

    #[tokio::test]
    async fn test_fault_during_motion_closes_link() {
        let (device, probe) = device();
        device.connect().await.unwrap();

        device.motion().move_abs(MAX).await.unwrap();
        probe.drop_link(true);

        let err = device.poll().await.unwrap_err();
        assert!(matches!(err, FocuserError::HardwareFault(_)));
        assert!(!device.is_connected().await);
        assert_eq!(device.motion().state().await, MotionState::Idle);

        // Commands stay rejected until an explicit reconnect.
        assert!(matches!(
            device.motion().move_abs(100).await.unwrap_err(),
            FocuserError::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_save_config_round_trip() {
        let (device, _probe) = device();
        device.connect().await.unwrap();
        device.presets().set_preset(0, 11_000).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focuser.toml");
        device.save_config(&path).await.unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.preset_values()[0], 11_000);
        assert_eq!(loaded.connection_mode().unwrap(), ConnectionMode::Serial);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_motion_first() {
        let (device, _probe) = device();
        device.connect().await.unwrap();

        device.motion().move_abs(MAX).await.unwrap();
        device.disconnect().await.unwrap();
        assert_eq!(device.motion().state().await, MotionState::Idle);
        assert!(!device.is_connected().await);
    }
}
