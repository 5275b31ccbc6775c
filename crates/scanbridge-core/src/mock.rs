//! In-memory stand-ins for serial channels and host transports.
//!
//! [`MockConnector`] records every AT command written per path and lets a
//! test inject advertisement lines, fail opens or writes, and yank a channel
//! away. [`MockTransport`] records outbound envelopes and injects host
//! requests.
//!
//! ```rust
//! use scanbridge_core::channel::Connector;
//! use scanbridge_core::mock::MockConnector;
//!
//! # tokio_test_block_on(async {
//! let connector = MockConnector::new();
//! let mut handle = connector.open("/dev/ttyUSB0", 115_200).await.unwrap();
//! handle.writer.write("AT+RESTART\r\n").await.unwrap();
//! assert_eq!(connector.writes("/dev/ttyUSB0"), vec!["AT+RESTART\r\n"]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelHandle, Connector, LineWriter, LINE_BUFFER};
use crate::error::{BridgeError, Result};
use crate::transport::{Inbound, Responder, Transport};

// =============================================================================
// CHANNELS
// =============================================================================

#[derive(Default)]
struct MockPort {
    fail_open: bool,
    fail_writes: bool,
    opens: usize,
    writes: Vec<String>,
    lines: Option<mpsc::Sender<String>>,
    open_generation: u64,
}

type Ports = Arc<Mutex<HashMap<String, MockPort>>>;

/// A [`Connector`] backed by in-memory ports.
#[derive(Clone, Default)]
pub struct MockConnector {
    ports: Ports,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("ports", &self.ports.lock().len())
            .finish()
    }
}

impl MockConnector {
    /// Creates a connector where every path opens successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent opens of `path` fail (or succeed again).
    pub fn fail_open(&self, path: &str, fail: bool) {
        self.ports.lock().entry(path.to_string()).or_default().fail_open = fail;
    }

    /// Makes writes to `path` fail (or succeed again), including on an
    /// already open channel.
    pub fn fail_writes(&self, path: &str, fail: bool) {
        self.ports.lock().entry(path.to_string()).or_default().fail_writes = fail;
    }

    /// Every payload written to `path` so far, across all opens.
    #[must_use]
    pub fn writes(&self, path: &str) -> Vec<String> {
        self.ports
            .lock()
            .get(path)
            .map(|port| port.writes.clone())
            .unwrap_or_default()
    }

    /// Forgets the recorded writes for `path`.
    pub fn clear_writes(&self, path: &str) {
        if let Some(port) = self.ports.lock().get_mut(path) {
            port.writes.clear();
        }
    }

    /// Number of open attempts made for `path`, successful or not.
    #[must_use]
    pub fn open_count(&self, path: &str) -> usize {
        self.ports.lock().get(path).map_or(0, |port| port.opens)
    }

    /// Delivers `line` to the reader of the open channel on `path`.
    /// Returns `false` when no channel is open.
    pub fn inject_line(&self, path: &str, line: &str) -> bool {
        self.ports
            .lock()
            .get(path)
            .and_then(|port| port.lines.as_ref())
            .is_some_and(|tx| tx.try_send(line.to_string()).is_ok())
    }

    /// Closes the channel on `path` from the far side, as if unplugged.
    pub fn close_port(&self, path: &str) {
        if let Some(port) = self.ports.lock().get_mut(path) {
            port.lines = None;
        }
    }

    /// Whether a channel on `path` is currently open.
    #[must_use]
    pub fn is_open(&self, path: &str) -> bool {
        self.ports
            .lock()
            .get(path)
            .is_some_and(|port| port.lines.as_ref().is_some_and(|tx| !tx.is_closed()))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, path: &str, _baud_rate: u32) -> Result<ChannelHandle> {
        let mut ports = self.ports.lock();
        let port = ports.entry(path.to_string()).or_default();
        port.opens += 1;
        if port.fail_open {
            return Err(BridgeError::ChannelOpen {
                path: path.to_string(),
                message: "mock open failure".to_string(),
            });
        }

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        port.lines = Some(tx);
        port.open_generation += 1;
        Ok(ChannelHandle {
            writer: Box::new(MockWriter {
                path: path.to_string(),
                generation: port.open_generation,
                ports: Arc::clone(&self.ports),
                closed: false,
            }),
            lines,
        })
    }
}

struct MockWriter {
    path: String,
    generation: u64,
    ports: Ports,
    closed: bool,
}

#[async_trait]
impl LineWriter for MockWriter {
    async fn write(&mut self, data: &str) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        let mut ports = self.ports.lock();
        let port = ports.entry(self.path.clone()).or_default();
        if port.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        port.writes.push(data.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        let mut ports = self.ports.lock();
        if let Some(port) = ports.get_mut(&self.path) {
            // A newer open owns the port now; leave it alone.
            if port.open_generation == self.generation {
                port.lines = None;
            }
        }
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Default)]
struct MockTransportState {
    inbound: Option<mpsc::Sender<Inbound>>,
    sent: Vec<String>,
    starts: usize,
    stops: usize,
    fail_start: bool,
}

/// A [`Transport`] that records what the bridge sends and lets tests play
/// the host.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Creates a transport that starts successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `start` fail.
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Envelopes broadcast so far.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Envelopes broadcast so far, parsed as JSON.
    #[must_use]
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect()
    }

    /// Forgets recorded envelopes.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Number of `start` and `stop` calls.
    #[must_use]
    pub fn lifecycle_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.starts, state.stops)
    }

    /// Sends a host payload into the bridge; the receiver yields the reply.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the transport is not started.
    pub async fn request(&self, payload: &str) -> Result<oneshot::Receiver<String>> {
        let (respond, reply) = Responder::channel();
        self.push(Inbound::Data {
            payload: payload.to_string(),
            respond,
        })
        .await?;
        Ok(reply)
    }

    /// Reports a transport-level decode failure into the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the transport is not started.
    pub async fn report_error(&self, message: &str) -> Result<oneshot::Receiver<String>> {
        let (respond, reply) = Responder::channel();
        self.push(Inbound::Error {
            message: message.to_string(),
            respond,
        })
        .await?;
        Ok(reply)
    }

    async fn push(&self, message: Inbound) -> Result<()> {
        let inbound = self
            .state
            .lock()
            .inbound
            .clone()
            .ok_or_else(|| BridgeError::Transport("mock transport not started".to_string()))?;
        inbound
            .send(message)
            .await
            .map_err(|_| BridgeError::Transport("inbound queue closed".to_string()))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()> {
        let mut state = self.state.lock();
        state.starts += 1;
        if state.fail_start {
            return Err(BridgeError::Transport("mock start failure".to_string()));
        }
        state.inbound = Some(inbound);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.stops += 1;
        state.inbound = None;
        Ok(())
    }

    fn send(&self, payload: &str) {
        self.state.lock().sent.push(payload.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_writes_per_path() {
        let connector = MockConnector::new();
        let mut a = connector.open("/dev/a", 9600).await.unwrap();
        let mut b = connector.open("/dev/b", 9600).await.unwrap();
        a.writer.write("one").await.unwrap();
        b.writer.write("two").await.unwrap();

        assert_eq!(connector.writes("/dev/a"), vec!["one"]);
        assert_eq!(connector.writes("/dev/b"), vec!["two"]);
        assert_eq!(connector.open_count("/dev/a"), 1);
    }

    #[tokio::test]
    async fn test_fail_open_counts_attempts() {
        let connector = MockConnector::new();
        connector.fail_open("/dev/a", true);
        assert!(connector.open("/dev/a", 9600).await.is_err());
        assert!(connector.open("/dev/a", 9600).await.is_err());
        assert_eq!(connector.open_count("/dev/a"), 2);
    }

    #[tokio::test]
    async fn test_injected_lines_reach_reader() {
        let connector = MockConnector::new();
        let mut handle = connector.open("/dev/a", 9600).await.unwrap();
        assert!(connector.inject_line("/dev/a", "+OBSERVER:x"));
        assert_eq!(handle.lines.recv().await.as_deref(), Some("+OBSERVER:x"));
    }

    #[tokio::test]
    async fn test_close_port_ends_line_stream() {
        let connector = MockConnector::new();
        let mut handle = connector.open("/dev/a", 9600).await.unwrap();
        connector.close_port("/dev/a");
        assert!(handle.lines.recv().await.is_none());
        assert!(!connector.inject_line("/dev/a", "late"));
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let connector = MockConnector::new();
        let mut handle = connector.open("/dev/a", 9600).await.unwrap();
        connector.fail_writes("/dev/a", true);
        assert!(handle.writer.write("AT").await.is_err());
        assert!(connector.writes("/dev/a").is_empty());
    }

    #[tokio::test]
    async fn test_transport_round_trip() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();

        let reply = transport.request("{\"c\":1}").await.unwrap();
        match rx.recv().await.unwrap() {
            Inbound::Data { payload, respond } => {
                assert_eq!(payload, "{\"c\":1}");
                respond.respond("ok".to_string());
            }
            Inbound::Error { .. } => panic!("expected data"),
        }
        assert_eq!(reply.await.unwrap(), "ok");

        transport.send("{\"t\":4}");
        assert_eq!(transport.sent(), vec!["{\"t\":4}"]);
    }

    #[tokio::test]
    async fn test_request_before_start_fails() {
        let transport = MockTransport::new();
        assert!(transport.request("{}").await.is_err());
    }
}
