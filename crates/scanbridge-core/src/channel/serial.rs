use std::borrow::Cow;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace, warn};

use super::{ChannelHandle, Connector, LineWriter, LINE_BUFFER};
use crate::config::Parity;
use crate::error::{BridgeError, Result};

/// Longest line kept whole; anything longer is cut into pieces.
const MAX_LINE: u64 = 4096;

/// Opens serial ports as line channels. Defaults to 8N1, the framing the
/// observer modules use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConnector {
    data_bits: tokio_serial::DataBits,
    stop_bits: tokio_serial::StopBits,
    parity: tokio_serial::Parity,
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialConnector {
    /// 8 data bits, 1 stop bit, no parity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
        }
    }

    /// Custom framing. Out-of-range values fall back to 8N1 settings.
    #[must_use]
    pub const fn with_framing(data_bits: u8, stop_bits: u8, parity: Parity) -> Self {
        Self {
            data_bits: match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            },
            stop_bits: match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            },
            parity: match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            },
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<ChannelHandle> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| BridgeError::ChannelOpen {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        let (reader, writer) = tokio::io::split(port);
        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(read_lines(path.to_string(), reader, tx));

        debug!(path = %path, baud_rate, "Serial channel opened");
        Ok(ChannelHandle {
            writer: Box::new(SerialWriter {
                inner: Some(writer),
            }),
            lines,
        })
    }
}

/// Forwards newline-terminated lines from `reader` until end of stream or a
/// read error. Bytes that are not UTF-8 are replaced rather than treated as
/// a failure, since line noise on an idle port is normal.
async fn read_lines<R: AsyncRead + Unpin>(path: String, reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => read,
            () = tx.closed() => break,
        };
        match read {
            Ok(0) => {
                debug!(path = %path, "Serial channel reached end of stream");
                break;
            }
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                if matches!(decoded, Cow::Owned(_)) {
                    trace!(path = %path, bytes = buf.len(), "Replaced invalid UTF-8 in serial line");
                }
                let line = decoded.trim();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Serial channel read failed");
                break;
            }
        }
    }
}

struct SerialWriter {
    inner: Option<WriteHalf<SerialStream>>,
}

#[async_trait]
impl LineWriter for SerialWriter {
    async fn write(&mut self, data: &str) -> io::Result<()> {
        let port = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel closed"))?;
        port.write_all(data.as_bytes()).await?;
        port.flush().await
    }

    async fn close(&mut self) {
        if let Some(mut port) = self.inner.take() {
            let _ = port.shutdown().await;
        }
    }
}
