//! HTTP+SSE host transport.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scanbridge_core::{BridgeError, HttpTransportConfig, Inbound, Result, Transport};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::create_router;
use crate::state::HttpState;

/// How long `stop` waits for open connections to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Serves `POST /command`, `GET /events`, `/health` and `/openapi.json`.
pub struct HttpTransport {
    config: HttpTransportConfig,
    state: HttpState,
    server: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .field("local_addr", &*self.local_addr.lock())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a stopped transport.
    #[must_use]
    pub fn new(config: HttpTransportConfig) -> Self {
        Self {
            config,
            state: HttpState::new(),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound address while running. Useful when the port is `0`.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Shared handler state.
    #[must_use]
    pub const fn state(&self) -> &HttpState {
        &self.state
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()> {
        if self.server.lock().is_some() {
            return Err(BridgeError::Transport("HTTP transport already started".to_string()));
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                BridgeError::Transport(format!(
                    "failed to bind {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        self.state.attach(inbound).await;
        let app = create_router(self.state.clone());
        let shutdown = self.state.shutdown_signal();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "HTTP server failed");
            }
        });

        *self.local_addr.lock() = Some(addr);
        *self.server.lock() = Some(server);
        info!(addr = %addr, "HTTP transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.detach().await;
        let server = self.server.lock().take();
        if let Some(mut server) = server {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                warn!("HTTP server did not drain in time; aborting");
                server.abort();
            }
            info!("HTTP transport stopped");
        }
        *self.local_addr.lock() = None;
        Ok(())
    }

    fn send(&self, payload: &str) {
        self.state.publish(payload);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_commands_until_stopped() {
        let transport = transport();
        let (tx, mut rx) = mpsc::channel(4);
        transport.start(tx).await.unwrap();
        let addr = transport.local_addr().unwrap();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Inbound::Data { respond, .. } = message {
                    respond.respond(r#"{"t":1,"d":{"msg":"Scan started"}}"#.to_string());
                }
            }
        });

        let body = r#"{"c":1}"#;
        let response = raw_request(
            addr,
            &format!(
                "POST /command HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("Scan started"));

        transport.stop().await.unwrap();
        assert!(transport.local_addr().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_send_reaches_event_subscribers() {
        let transport = transport();
        let (mut events, _) = transport.state().subscribe();

        transport.send(r#"{"t":4,"d":{"run":true}}"#);

        assert_eq!(events.recv().await.unwrap(), r#"{"t":4,"d":{"run":true}}"#);
    }

    #[tokio::test]
    async fn test_bind_failure_is_transport_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = HttpTransport::new(HttpTransportConfig {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
        });

        let (tx, _rx) = mpsc::channel(1);
        let err = transport.start(tx).await.unwrap_err();

        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        assert!(transport().stop().await.is_ok());
    }
}
