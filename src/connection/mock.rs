//! Scriptable in-memory transport for tests and the simulator.
//!
//! `MockTransport` records every write and answers reads from a reply queue.
//! The paired [`MockProbe`] stays with the caller after the transport has
//! been handed to the connection selector, so tests can inject failures
//! (refused open, silent device, dropped link) and inspect traffic.

use super::Transport;
use crate::error::{FocusResult, FocuserError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    mute: bool,
    link_dropped: bool,
    replies: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test double implementing the byte-level link contract.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Control handle for a [`MockTransport`] that has been moved into the core.
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a transport/probe pair. By default the mock acknowledges every
    /// write with `SIM_OK\n`, which satisfies the simulated handshake.
    pub fn new() -> (Self, MockProbe) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockProbe { state },
        )
    }
}

impl MockProbe {
    /// Make the next `open()` fail.
    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    /// Silence the device: writes succeed but no reply is ever produced.
    pub fn fail_handshake(&self, mute: bool) {
        lock(&self.state).mute = mute;
    }

    /// Simulate a lost link: every subsequent read or write errors.
    pub fn drop_link(&self, dropped: bool) {
        lock(&self.state).link_dropped = dropped;
    }

    /// Queue an explicit reply for the next write, ahead of the automatic
    /// acknowledgement.
    pub fn queue_reply(&self, reply: &[u8]) {
        lock(&self.state).replies.push_back(reply.to_vec());
    }

    /// Everything written to the transport so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    /// Number of writes seen so far.
    pub fn write_count(&self) -> usize {
        lock(&self.state).written.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_config(&self) -> serde_json::Value {
        json!({ "transport": "mock" })
    }

    async fn open(&mut self) -> FocusResult<()> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(FocuserError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock open refused",
            )));
        }
        state.open = true;
        state.link_dropped = false;
        state.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> FocusResult<()> {
        let mut state = lock(&self.state);
        state.open = false;
        state.pending.clear();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> FocusResult<()> {
        let mut state = lock(&self.state);
        if state.link_dropped {
            return Err(FocuserError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock link dropped",
            )));
        }
        state.written.push(data.to_vec());
        if let Some(reply) = state.replies.pop_front() {
            state.pending.extend(reply);
        } else if !state.mute {
            state.pending.extend(b"SIM_OK\n");
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> FocusResult<usize> {
        let mut state = lock(&self.state);
        if state.link_dropped {
            return Err(FocuserError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock link dropped",
            )));
        }
        let mut n = 0;
        while n < buf.len() {
            match state.pending.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_auto_reply() {
        let (mut transport, probe) = MockTransport::new();
        transport.open().await.unwrap();

        transport.write(b"#PROBE\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SIM_OK\n");
        assert_eq!(probe.written(), vec![b"#PROBE\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_muted_device_returns_no_bytes() {
        let (mut transport, probe) = MockTransport::new();
        probe.fail_handshake(true);
        transport.open().await.unwrap();

        transport.write(b"#PROBE\n").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_link_errors_on_io() {
        let (mut transport, probe) = MockTransport::new();
        transport.open().await.unwrap();
        probe.drop_link(true);

        assert!(transport.write(b"x").await.is_err());
        let mut buf = [0u8; 4];
        assert!(transport.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_queued_reply_takes_precedence() {
        let (mut transport, probe) = MockTransport::new();
        transport.open().await.unwrap();
        probe.queue_reply(b"P=1200\n");

        transport.write(b"GP\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"P=1200\n");
    }
}
