//! Line-delimited JSON over a serial link to the host.
//!
//! Each inbound line is one request envelope. Replies and events are written
//! back as single lines terminated by `\r\n`. A lost link is reopened at a
//! fixed interval until the attempt budget runs out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scanbridge_core::at::LINE_TERMINATOR;
use scanbridge_core::{
    BridgeError, ChannelHandle, Connector, Inbound, RequestEnvelope, Responder, Result,
    SerialTransportConfig, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Serial host transport.
pub struct SerialTransport {
    link: Link,
    running: Mutex<Option<Running>>,
}

struct Running {
    outbound: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

#[derive(Clone)]
struct Link {
    config: SerialTransportConfig,
    connector: Arc<dyn Connector>,
    connected: Arc<AtomicBool>,
}

enum LinkEnd {
    Stopped,
    Lost,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("serial_path", &self.link.config.serial_path)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Creates a stopped transport that opens its link through `connector`.
    #[must_use]
    pub fn new(config: SerialTransportConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            link: Link {
                config,
                connector,
                connected: Arc::new(AtomicBool::new(false)),
            },
            running: Mutex::new(None),
        }
    }

    /// Whether the link to the host is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()> {
        if self.running.lock().is_some() {
            return Err(BridgeError::Transport("serial transport already started".to_string()));
        }

        let handle = self.link.open().await.map_err(|e| {
            BridgeError::Transport(format!(
                "failed to open {}: {e}",
                self.link.config.serial_path
            ))
        })?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        self.link.connected.store(true, Ordering::SeqCst);
        let supervisor = tokio::spawn(self.link.clone().supervise(
            handle,
            outbound.clone(),
            outbound_rx,
            inbound,
            stop_rx,
        ));

        *self.running.lock() = Some(Running {
            outbound,
            stop,
            supervisor,
        });
        info!(path = %self.link.config.serial_path, "Serial transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(Running {
            stop,
            mut supervisor,
            ..
        }) = running
        {
            stop.send_replace(true);
            if tokio::time::timeout(STOP_GRACE, &mut supervisor).await.is_err() {
                warn!("Serial supervisor did not stop in time; aborting");
                supervisor.abort();
            }
            info!("Serial transport stopped");
        }
        self.link.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, payload: &str) {
        if !self.is_connected() {
            debug!("Serial link down; dropping outbound message");
            return;
        }
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.outbound.send(terminate(payload));
        }
    }
}

impl Link {
    async fn open(&self) -> Result<ChannelHandle> {
        self.connector
            .open(&self.config.serial_path, self.config.baud_rate)
            .await
    }

    async fn supervise(
        self,
        mut handle: ChannelHandle,
        replies: mpsc::UnboundedSender<String>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::Sender<Inbound>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            self.connected.store(true, Ordering::SeqCst);
            let end = serve(&mut handle, &mut outbound, &inbound, &replies, &mut stop).await;
            self.connected.store(false, Ordering::SeqCst);
            handle.writer.close().await;

            if matches!(end, LinkEnd::Stopped) {
                return;
            }
            warn!(path = %self.config.serial_path, "Serial link lost");

            // Replies queued for the dead link are not delivered.
            while outbound.try_recv().is_ok() {}

            match self.reconnect(&mut stop).await {
                Some(reopened) => handle = reopened,
                None => return,
            }
        }
    }

    async fn reconnect(&self, stop: &mut watch::Receiver<bool>) -> Option<ChannelHandle> {
        let interval = Duration::from_millis(self.config.reconnect_interval_ms);
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::select! {
                _ = stop.changed() => return None,
                () = tokio::time::sleep(interval) => {}
            }
            match self.open().await {
                Ok(handle) => {
                    info!(path = %self.config.serial_path, attempt, "Serial link restored");
                    return Some(handle);
                }
                Err(e) => {
                    warn!(
                        path = %self.config.serial_path,
                        attempt,
                        max_attempts = self.config.max_reconnect_attempts,
                        error = %e,
                        "Serial reconnect failed"
                    );
                }
            }
        }
        error!(
            path = %self.config.serial_path,
            attempts = self.config.max_reconnect_attempts,
            "Giving up on serial link"
        );
        None
    }
}

async fn serve(
    handle: &mut ChannelHandle,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    inbound: &mpsc::Sender<Inbound>,
    replies: &mpsc::UnboundedSender<String>,
    stop: &mut watch::Receiver<bool>,
) -> LinkEnd {
    loop {
        tokio::select! {
            _ = stop.changed() => return LinkEnd::Stopped,
            line = handle.lines.recv() => {
                let Some(line) = line else {
                    return LinkEnd::Lost;
                };
                if inbound.send(decode_line(line, replies)).await.is_err() {
                    debug!("Inbound queue closed");
                    return LinkEnd::Stopped;
                }
            }
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    return LinkEnd::Stopped;
                };
                if let Err(e) = handle.writer.write(&payload).await {
                    warn!(error = %e, "Serial write failed");
                    return LinkEnd::Lost;
                }
            }
        }
    }
}

fn decode_line(line: String, replies: &mpsc::UnboundedSender<String>) -> Inbound {
    let replies = replies.clone();
    let respond = Responder::new(move |reply| {
        let _ = replies.send(terminate(&reply));
    });
    match serde_json::from_str::<RequestEnvelope>(&line) {
        Ok(_) => Inbound::Data {
            payload: line,
            respond,
        },
        Err(e) => Inbound::Error {
            message: format!("Invalid JSON: {e}"),
            respond,
        },
    }
}

fn terminate(payload: &str) -> String {
    format!("{payload}{LINE_TERMINATOR}")
}

#[cfg(test)]
mod tests {
    use scanbridge_core::mock::MockConnector;

    use super::*;

    const PATH: &str = "/dev/ttyS1";

    fn transport(connector: &MockConnector) -> SerialTransport {
        SerialTransport::new(
            SerialTransportConfig {
                serial_path: PATH.to_string(),
                reconnect_interval_ms: 1_000,
                max_reconnect_attempts: 2,
                ..SerialTransportConfig::default()
            },
            Arc::new(connector.clone()),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_transport_error() {
        let connector = MockConnector::new();
        connector.fail_open(PATH, true);

        let (tx, _rx) = mpsc::channel(1);
        let err = transport(&connector).start(tx).await.unwrap_err();

        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_line_is_forwarded_and_answered() {
        let connector = MockConnector::new();
        let transport = transport(&connector);
        let (tx, mut rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();

        assert!(connector.inject_line(PATH, r#"{"c":3}"#));
        let Some(Inbound::Data { payload, respond }) = rx.recv().await else {
            panic!("expected a data message");
        };
        assert_eq!(payload, r#"{"c":3}"#);
        respond.respond(r#"{"t":4,"d":{"run":true}}"#.to_string());
        settle().await;

        assert_eq!(connector.writes(PATH), vec!["{\"t\":4,\"d\":{\"run\":true}}\r\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_line_is_reported_as_error() {
        let connector = MockConnector::new();
        let transport = transport(&connector);
        let (tx, mut rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();

        connector.inject_line(PATH, "hello?");

        assert!(matches!(rx.recv().await, Some(Inbound::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_terminated_lines() {
        let connector = MockConnector::new();
        let transport = transport(&connector);
        let (tx, _rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();

        transport.send(r#"{"t":3,"d":{"mf":"Google"}}"#);
        settle().await;

        assert_eq!(connector.writes(PATH), vec!["{\"t\":3,\"d\":{\"mf\":\"Google\"}}\r\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let connector = MockConnector::new();
        let transport = transport(&connector);
        let (tx, _rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();

        connector.close_port(PATH);
        settle().await;
        assert!(!transport.is_connected());
        transport.send("dropped");

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(transport.is_connected());
        assert_eq!(connector.open_count(PATH), 2);

        transport.send("delivered");
        settle().await;
        assert_eq!(connector.writes(PATH), vec!["delivered\r\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempt_budget() {
        let connector = MockConnector::new();
        let transport = transport(&connector);
        let (tx, _rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();

        connector.fail_open(PATH, true);
        connector.close_port(PATH);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connector.open_count(PATH), 3);
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_link() {
        let connector = MockConnector::new();
        let transport = transport(&connector);
        let (tx, _rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();
        assert!(connector.is_open(PATH));

        transport.stop().await.unwrap();

        assert!(!connector.is_open(PATH));
        assert!(!transport.is_connected());
        assert!(transport.stop().await.is_ok());
    }
}
