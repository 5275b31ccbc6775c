//! State shared between the HTTP handlers and the HTTP transport.

use std::sync::Arc;

use scanbridge_core::Inbound;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

/// Buffered events per SSE client before it starts lagging.
pub const SSE_BUFFER: usize = 256;

/// Shared HTTP state.
#[derive(Clone)]
pub struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    inbound: RwLock<Option<mpsc::Sender<Inbound>>>,
    events: broadcast::Sender<String>,
    shutdown: watch::Sender<bool>,
}

impl Default for HttpState {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpState {
    /// Creates detached state: commands are refused until [`HttpState::attach`].
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SSE_BUFFER);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HttpStateInner {
                inbound: RwLock::new(None),
                events,
                shutdown,
            }),
        }
    }

    /// Connects the handlers to the bridge's inbound queue.
    pub async fn attach(&self, inbound: mpsc::Sender<Inbound>) {
        *self.inner.inbound.write().await = Some(inbound);
        self.inner.shutdown.send_replace(false);
    }

    /// Disconnects the inbound queue and ends every open event stream.
    pub async fn detach(&self) {
        *self.inner.inbound.write().await = None;
        self.inner.shutdown.send_replace(true);
    }

    /// The inbound queue, when attached.
    pub async fn inbound(&self) -> Option<mpsc::Sender<Inbound>> {
        self.inner.inbound.read().await.clone()
    }

    /// Pushes one envelope to every open event stream.
    pub fn publish(&self, payload: &str) {
        let _ = self.inner.events.send(payload.to_string());
    }

    /// Receivers for a new event stream: the envelopes and the shutdown flag.
    #[must_use]
    pub fn subscribe(&self) -> (broadcast::Receiver<String>, watch::Receiver<bool>) {
        (self.inner.events.subscribe(), self.inner.shutdown.subscribe())
    }

    /// Open event streams.
    #[must_use]
    pub fn sse_clients(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// A future that resolves once [`HttpState::detach`] has run.
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut shutdown = self.inner.shutdown.subscribe();
        async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        }
    }
}
