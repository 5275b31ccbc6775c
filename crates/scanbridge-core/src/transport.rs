//! The outward message transport capability.
//!
//! A transport carries JSON envelopes between the bridge and its host. It
//! pushes every inbound message into an [`Inbound`] channel together with a
//! one-shot [`Responder`], and broadcasts outbound events through
//! [`Transport::send`]. Implementations live in the server crate (HTTP+SSE
//! and serial); `MockTransport` (behind the `mock` feature) is for tests.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// Capacity of the inbound message queue between a transport and the router.
pub const INBOUND_BUFFER: usize = 64;

/// One-shot reply path for an inbound message.
pub struct Responder(Box<dyn FnOnce(String) + Send>);

impl Responder {
    /// Wraps a reply callback.
    pub fn new(f: impl FnOnce(String) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// A responder that forwards its reply into a oneshot channel.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self::new(move |payload| {
            let _ = tx.send(payload);
        });
        (responder, rx)
    }

    /// Delivers the reply. Consumes the responder so it fires at most once.
    pub fn respond(self, payload: String) {
        (self.0)(payload);
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Responder")
    }
}

/// A message received from the host.
#[derive(Debug)]
pub enum Inbound {
    /// A raw payload to decode and execute.
    Data {
        /// Raw JSON text.
        payload: String,
        /// Reply path.
        respond: Responder,
    },
    /// The transport could not make sense of what it received.
    Error {
        /// Description of the problem.
        message: String,
        /// Reply path.
        respond: Responder,
    },
}

/// Start/stop/send capability shared by all host transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Starts accepting host messages, forwarding them into `inbound`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`](crate::error::BridgeError::Transport)
    /// when the transport cannot bind or open its link.
    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()>;

    /// Stops the transport. Safe to call when not started.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails.
    async fn stop(&self) -> Result<()>;

    /// Broadcasts one envelope to the host. Best effort: a disconnected
    /// host simply misses the event.
    fn send(&self, payload: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_responder_delivers_once() {
        let (responder, rx) = Responder::channel();
        responder.respond("{\"t\":1}".to_string());
        assert_eq!(rx.await.unwrap(), "{\"t\":1}");
    }

    #[tokio::test]
    async fn test_dropped_responder_closes_channel() {
        let (responder, rx) = Responder::channel();
        drop(responder);
        assert!(rx.await.is_err());
    }
}
