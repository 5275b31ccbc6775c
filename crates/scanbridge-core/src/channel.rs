//! Line-oriented byte channels to scanning modules.
//!
//! A [`Connector`] opens a channel by path and hands back a [`ChannelHandle`]:
//! a writer for AT commands plus a receiver of complete inbound lines. The
//! receiver ending means the channel closed underneath the device.
//!
//! The production connector is [`SerialConnector`]; tests use
//! `MockConnector` (behind the `mock` feature).

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialConnector;

/// Capacity of the inbound line buffer per channel.
pub const LINE_BUFFER: usize = 256;

/// Write half of an open channel.
#[async_trait]
pub trait LineWriter: Send {
    /// Writes `data` verbatim and flushes it.
    async fn write(&mut self, data: &str) -> io::Result<()>;

    /// Releases the channel. Further writes fail.
    async fn close(&mut self);
}

/// An open channel: a writer and the stream of lines read from it.
pub struct ChannelHandle {
    /// Write half.
    pub writer: Box<dyn LineWriter>,
    /// Complete, non-empty inbound lines without terminators.
    pub lines: mpsc::Receiver<String>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle").finish_non_exhaustive()
    }
}

/// Opens channels by path.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens `path` at `baud_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ChannelOpen`](crate::error::BridgeError::ChannelOpen)
    /// when the path cannot be opened.
    async fn open(&self, path: &str, baud_rate: u32) -> Result<ChannelHandle>;
}
