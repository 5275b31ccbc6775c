//! Host transport implementations.
//!
//! - [`HttpTransport`] - `POST /command` plus an SSE event stream
//! - [`SerialTransport`] - line-delimited JSON over a second serial link

use std::sync::Arc;

use scanbridge_core::{SerialConnector, Transport, TransportConfig};

pub mod http;
pub mod serial;

pub use http::HttpTransport;
pub use serial::SerialTransport;

/// Builds the transport selected by the configuration.
#[must_use]
pub fn create_transport(config: &TransportConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Http(http) => Arc::new(HttpTransport::new(http.clone())),
        TransportConfig::Serial(serial) => {
            let connector =
                SerialConnector::with_framing(serial.data_bits, serial.stop_bits, serial.parity);
            Arc::new(SerialTransport::new(serial.clone(), Arc::new(connector)))
        }
    }
}
