//! Connection mode selection and link lifecycle.
//!
//! A focuser may be reachable over a serial line, a network socket, or may
//! need no transport at all (simulators). The concrete driver declares the
//! supported modes once, before the connection interfaces are registered;
//! [`ConnectionSelector`] then owns the choice of active mode, the open/close
//! lifecycle, and the handshake that verifies a freshly opened link actually
//! talks to a focuser.
//!
//! The physical byte-level I/O lives behind the [`Transport`] trait — the
//! selector never implements framing or wire formats itself.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod tcp;

use crate::error::{FocusResult, FocuserError};
use crate::hardware::FocuserDriver;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Transport mode of a focuser link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    /// No transport plugin (simulators, devices with their own stack).
    None,
    /// Serial and bluetooth-serial connections.
    Serial,
    /// Wired and WiFi TCP connections.
    Tcp,
}

impl ConnectionMode {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionMode::None => "none",
            ConnectionMode::Serial => "serial",
            ConnectionMode::Tcp => "tcp",
        }
    }
}

/// The set of connection modes a concrete driver supports.
///
/// Declared once at construction, immutable afterwards. A set rather than a
/// bitmask: membership is queried by value, never by integer arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionModeSet {
    none: bool,
    serial: bool,
    tcp: bool,
}

impl ConnectionModeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mode: ConnectionMode) -> Self {
        match mode {
            ConnectionMode::None => self.none = true,
            ConnectionMode::Serial => self.serial = true,
            ConnectionMode::Tcp => self.tcp = true,
        }
        self
    }

    pub fn has(&self, mode: ConnectionMode) -> bool {
        match mode {
            ConnectionMode::None => self.none,
            ConnectionMode::Serial => self.serial,
            ConnectionMode::Tcp => self.tcp,
        }
    }

    /// The default active mode: serial when available, then TCP, then none.
    pub fn preferred(&self) -> Option<ConnectionMode> {
        if self.serial {
            Some(ConnectionMode::Serial)
        } else if self.tcp {
            Some(ConnectionMode::Tcp)
        } else if self.none {
            Some(ConnectionMode::None)
        } else {
            None
        }
    }
}

/// Byte-level link contract the core calls against.
///
/// Concrete implementations wrap a serial port, a TCP socket, or a test
/// double. All methods are cancel-safe from the core's perspective; `read`
/// returns `Ok(0)` when no data arrived within the transport's own timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs ("serial", "tcp", ...).
    fn name(&self) -> &str;

    /// Transport settings as loosely-typed JSON, for diagnostics.
    fn default_config(&self) -> serde_json::Value;

    async fn open(&mut self) -> FocusResult<()>;

    async fn close(&mut self) -> FocusResult<()>;

    async fn write(&mut self, data: &[u8]) -> FocusResult<()>;

    async fn read(&mut self, buf: &mut [u8]) -> FocusResult<usize>;

    fn is_open(&self) -> bool;
}

/// No-op transport backing `ConnectionMode::None` devices.
struct NullTransport {
    open: bool,
}

#[async_trait]
impl Transport for NullTransport {
    fn name(&self) -> &str {
        "none"
    }

    fn default_config(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn open(&mut self) -> FocusResult<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> FocusResult<()> {
        self.open = false;
        Ok(())
    }

    async fn write(&mut self, _data: &[u8]) -> FocusResult<()> {
        Ok(())
    }

    async fn read(&mut self, _buf: &mut [u8]) -> FocusResult<usize> {
        Ok(0)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Opaque descriptor of the active link.
///
/// Created by a successful [`ConnectionSelector::connect`], revoked by
/// disconnect or handshake failure. Clones share the same underlying
/// transport; once the selector closes the link, every clone reports
/// [`FocuserError::NotConnected`] on I/O.
#[derive(Clone)]
pub struct ConnectionHandle {
    mode: ConnectionMode,
    io: Arc<Mutex<Box<dyn Transport>>>,
}

impl ConnectionHandle {
    fn new(mode: ConnectionMode, io: Arc<Mutex<Box<dyn Transport>>>) -> Self {
        Self { mode, io }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub async fn is_open(&self) -> bool {
        self.io.lock().await.is_open()
    }

    pub async fn write(&self, data: &[u8]) -> FocusResult<()> {
        let mut io = self.io.lock().await;
        if !io.is_open() {
            return Err(FocuserError::NotConnected);
        }
        io.write(data).await
    }

    pub async fn read(&self, buf: &mut [u8]) -> FocusResult<usize> {
        let mut io = self.io.lock().await;
        if !io.is_open() {
            return Err(FocuserError::NotConnected);
        }
        io.read(buf).await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("mode", &self.mode)
            .finish()
    }
}

/// Owns the transport mode choice and the resulting link.
///
/// Invariant: at most one handle is open at a time. A failed connect or
/// handshake leaves no handle held.
pub struct ConnectionSelector {
    supported: ConnectionModeSet,
    selected: ConnectionMode,
    transports: HashMap<ConnectionMode, Arc<Mutex<Box<dyn Transport>>>>,
    handle: Option<ConnectionHandle>,
    handshake_timeout: Duration,
}

impl ConnectionSelector {
    /// Create a selector for the declared mode set. The active mode starts
    /// at the set's preferred member.
    pub fn new(supported: ConnectionModeSet) -> Self {
        let selected = supported.preferred().unwrap_or(ConnectionMode::None);
        let mut transports: HashMap<ConnectionMode, Arc<Mutex<Box<dyn Transport>>>> =
            HashMap::new();
        if supported.has(ConnectionMode::None) {
            transports.insert(
                ConnectionMode::None,
                Arc::new(Mutex::new(Box::new(NullTransport { open: false }) as Box<dyn Transport>)),
            );
        }
        Self {
            supported,
            selected,
            transports,
            handle: None,
            handshake_timeout: Duration::from_millis(2000),
        }
    }

    /// Bound on how long a handshake may take before the link is closed and
    /// the attempt reported as "device not responding".
    pub fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.handshake_timeout = timeout;
    }

    /// Register the transport implementation backing one of the supported
    /// modes. Must happen during initialization, before any connect.
    pub fn register(&mut self, mode: ConnectionMode, transport: Box<dyn Transport>) -> FocusResult<()> {
        if !self.supported.has(mode) {
            return Err(FocuserError::Unsupported(format!(
                "connection mode '{}' is not in this device's declared set",
                mode.label()
            )));
        }
        if self.handle.is_some() {
            return Err(FocuserError::Validation(
                "cannot register transports while connected".to_string(),
            ));
        }
        self.transports.insert(mode, Arc::new(Mutex::new(transport)));
        Ok(())
    }

    pub fn supported(&self) -> ConnectionModeSet {
        self.supported
    }

    pub fn selected(&self) -> ConnectionMode {
        self.selected
    }

    /// Switch the active mode. Only valid while disconnected.
    pub fn select(&mut self, mode: ConnectionMode) -> FocusResult<()> {
        if self.handle.is_some() {
            return Err(FocuserError::Validation(
                "cannot change connection mode while connected".to_string(),
            ));
        }
        if !self.supported.has(mode) {
            return Err(FocuserError::Unsupported(format!(
                "connection mode '{}' is not supported by this device",
                mode.label()
            )));
        }
        self.selected = mode;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Current handle, if a link is live.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle.clone()
    }

    /// Open the selected mode and verify the device with the driver's
    /// handshake. The handshake runs at most once per attempt; it is not
    /// retried here — a failed attempt must be followed by an explicit
    /// reconnect command.
    pub async fn connect(&mut self, driver: &dyn FocuserDriver) -> FocusResult<ConnectionHandle> {
        if let Some(handle) = &self.handle {
            debug!("connect requested while already connected; keeping link");
            return Ok(handle.clone());
        }

        let io = self
            .transports
            .get(&self.selected)
            .cloned()
            .ok_or_else(|| {
                FocuserError::Unsupported(format!(
                    "no transport registered for mode '{}'",
                    self.selected.label()
                ))
            })?;

        {
            let mut transport = io.lock().await;
            transport.open().await.map_err(|e| {
                FocuserError::Connection(format!(
                    "failed to open {} link: {}",
                    transport.name(),
                    e
                ))
            })?;
            info!("{} link open", transport.name());
        }

        let handle = ConnectionHandle::new(self.selected, io.clone());

        let probe = tokio::time::timeout(self.handshake_timeout, driver.handshake(&handle)).await;
        match probe {
            Ok(Ok(())) => {
                info!("handshake ok on {} link", self.selected.label());
                self.handle = Some(handle.clone());
                Ok(handle)
            }
            Ok(Err(e)) => {
                warn!("handshake failed: {}", e);
                let mut transport = io.lock().await;
                let _ = transport.close().await;
                Err(FocuserError::Connection(format!(
                    "device not responding: {}",
                    e
                )))
            }
            Err(_) => {
                warn!(
                    "handshake timed out after {:?} on {} link",
                    self.handshake_timeout,
                    self.selected.label()
                );
                let mut transport = io.lock().await;
                let _ = transport.close().await;
                Err(FocuserError::Connection(
                    "device not responding: handshake timeout".to_string(),
                ))
            }
        }
    }

    /// Release the link. Idempotent; safe to call when not connected.
    pub async fn disconnect(&mut self) -> FocusResult<()> {
        if let Some(handle) = self.handle.take() {
            let mut transport = handle.io.lock().await;
            transport.close().await?;
            info!("{} link closed", transport.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilitySet;
    use crate::hardware::sim::SimFocuser;

    fn selector_with_mock() -> (ConnectionSelector, mock::MockProbe) {
        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let (transport, probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        (selector, probe)
    }

    #[tokio::test]
    async fn test_connect_stores_single_handle() {
        let (mut selector, _probe) = selector_with_mock();
        let driver = SimFocuser::new(CapabilitySet::closed_loop(), 50_000);

        assert!(!selector.is_connected());
        selector.connect(&driver).await.unwrap();
        assert!(selector.is_connected());

        // A second connect is a no-op on a live link.
        selector.connect(&driver).await.unwrap();
        assert!(selector.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_no_handle() {
        let (mut selector, probe) = selector_with_mock();
        probe.fail_handshake(true);
        let driver = SimFocuser::new(CapabilitySet::closed_loop(), 50_000);

        let err = selector.connect(&driver).await.unwrap_err();
        assert!(matches!(err, FocuserError::Connection(_)));
        assert!(!selector.is_connected());

        // Next attempt is fresh and may succeed.
        probe.fail_handshake(false);
        selector.connect(&driver).await.unwrap();
        assert!(selector.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut selector, _probe) = selector_with_mock();
        let driver = SimFocuser::new(CapabilitySet::closed_loop(), 50_000);

        selector.disconnect().await.unwrap();
        selector.connect(&driver).await.unwrap();
        selector.disconnect().await.unwrap();
        selector.disconnect().await.unwrap();
        assert!(!selector.is_connected());
    }

    #[tokio::test]
    async fn test_mode_change_rejected_while_connected() {
        let mut selector = ConnectionSelector::new(
            ConnectionModeSet::new()
                .with(ConnectionMode::Serial)
                .with(ConnectionMode::Tcp),
        );
        let (transport, _probe) = MockTransport::new();
        selector
            .register(ConnectionMode::Serial, Box::new(transport))
            .unwrap();
        let driver = SimFocuser::new(CapabilitySet::closed_loop(), 50_000);

        selector.connect(&driver).await.unwrap();
        let err = selector.select(ConnectionMode::Tcp).unwrap_err();
        assert!(matches!(err, FocuserError::Validation(_)));

        selector.disconnect().await.unwrap();
        selector.select(ConnectionMode::Tcp).unwrap();
        assert_eq!(selector.selected(), ConnectionMode::Tcp);
    }

    #[tokio::test]
    async fn test_unsupported_mode_rejected() {
        let mut selector =
            ConnectionSelector::new(ConnectionModeSet::new().with(ConnectionMode::Serial));
        let err = selector.select(ConnectionMode::Tcp).unwrap_err();
        assert!(matches!(err, FocuserError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_revoked_handle_rejects_io() {
        let (mut selector, _probe) = selector_with_mock();
        let driver = SimFocuser::new(CapabilitySet::closed_loop(), 50_000);

        let handle = selector.connect(&driver).await.unwrap();
        selector.disconnect().await.unwrap();

        let err = handle.write(b"ping").await.unwrap_err();
        assert!(matches!(err, FocuserError::NotConnected));
    }
}
