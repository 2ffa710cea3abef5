//! TCP transport for network-attached focusers (WiFi bridges, device
//! servers exposing a raw socket).

use super::Transport;
use crate::error::{FocusResult, FocuserError};
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Network link to a focuser.
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(500),
            stream: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn default_config(&self) -> serde_json::Value {
        json!({
            "host": self.host,
            "port": self.port,
            "timeout_ms": self.read_timeout.as_millis(),
        })
    }

    async fn open(&mut self) -> FocusResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                FocuserError::Connection(format!(
                    "timed out connecting to {} after {:?}",
                    addr, self.connect_timeout
                ))
            })?
            .map_err(|e| FocuserError::Connection(format!("failed to connect to {}: {}", addr, e)))?;

        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        debug!("tcp link to {} open", addr);
        Ok(())
    }

    async fn close(&mut self) -> FocusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("tcp link to {}:{} closed", self.host, self.port);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> FocusResult<()> {
        let stream = self.stream.as_mut().ok_or(FocuserError::NotConnected)?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> FocusResult<usize> {
        let stream = self.stream.as_mut().ok_or(FocuserError::NotConnected)?;
        match tokio::time::timeout(self.read_timeout, stream.read(buf)).await {
            // Peer closed the socket: the link is gone, not merely quiet.
            Ok(Ok(0)) => Err(FocuserError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(FocuserError::Io(e)),
            Err(_) => Ok(0),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_transport_config() {
        let transport = TcpTransport::new("focuser.local", 9999);
        assert_eq!(transport.name(), "tcp");
        let config = transport.default_config();
        assert_eq!(config["host"], "focuser.local");
        assert_eq!(config["port"], 9999);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_roundtrip_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port());
        transport.open().await.unwrap();
        assert!(transport.is_open());

        transport.write(b"#PROBE\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"#PROBE\n");

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_reports_connection_error() {
        // Port 1 is almost certainly closed.
        let mut transport = TcpTransport::new("127.0.0.1", 1);
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, FocuserError::Connection(_)));
        assert!(!transport.is_open());
    }
}
