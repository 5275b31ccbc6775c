//! Host command dispatch.
//!
//! The router turns inbound payloads into fleet operations and always
//! answers with exactly one envelope, even when the operation panics.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{BridgeError, Result};
use crate::fleet::{Fleet, FleetEvent};
use crate::transport::Inbound;
use crate::wire::{Command, ResponseEnvelope};

/// RSSI selection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    /// Threshold used when the host sends none.
    pub default_rssi: String,
    /// When set, `default_rssi` overrides whatever the host sends.
    pub use_config_rssi: bool,
}

impl RouterSettings {
    /// Takes the RSSI settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_rssi: config.rssi.clone(),
            use_config_rssi: config.use_config_rssi,
        }
    }

    /// Resolves the threshold for a start command.
    #[must_use]
    pub fn effective_rssi<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(rssi) if !self.use_config_rssi => rssi,
            _ => &self.default_rssi,
        }
    }
}

/// Decodes host commands and runs them against the fleet.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    fleet: Fleet,
    settings: RouterSettings,
}

impl CommandRouter {
    /// Creates a router.
    #[must_use]
    pub const fn new(fleet: Fleet, settings: RouterSettings) -> Self {
        Self { fleet, settings }
    }

    /// Handles one raw payload and returns the serialized reply.
    pub async fn handle(&self, payload: &str) -> String {
        let response = match AssertUnwindSafe(self.execute(payload)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if e.is_protocol_error() {
                    warn!(error = %e, code = e.error_code(), "Command rejected");
                } else if e.is_device_error() {
                    warn!(error = %e, code = e.error_code(), "Command failed on device");
                } else {
                    error!(error = %e, code = e.error_code(), "Command failed");
                }
                ResponseEnvelope::error(&e)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "command handler panicked".to_string());
                error!(message = %message, "Command handler panicked");
                ResponseEnvelope::error(&BridgeError::Internal(message))
            }
        };
        response.to_json()
    }

    /// Handles an inbound transport message and replies through its responder.
    pub async fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Data { payload, respond } => {
                let reply = self.handle(&payload).await;
                respond.respond(reply);
            }
            Inbound::Error { message, respond } => {
                warn!(message = %message, "Transport reported an undecodable message");
                respond.respond(Self::error_response(&message));
            }
        }
    }

    /// Error envelope for a transport-level decode failure.
    #[must_use]
    pub fn error_response(message: &str) -> String {
        ResponseEnvelope::error(&BridgeError::InvalidRequest(message.to_string())).to_json()
    }

    /// Host envelope for a fleet event, if the host cares about it.
    #[must_use]
    pub fn format_event(event: &FleetEvent) -> Option<String> {
        match event {
            FleetEvent::Detected(detection) => Some(ResponseEnvelope::device(detection).to_json()),
            _ => None,
        }
    }

    async fn execute(&self, payload: &str) -> Result<ResponseEnvelope> {
        let command = Command::decode(payload)?;
        debug!(?command, "Executing command");

        match command {
            Command::Start { rssi, device_id } => {
                let rssi = self.settings.effective_rssi(rssi.as_deref());
                let target = device_id.as_deref();
                self.fleet.start_scan(rssi, target).await?;
                self.fleet.start_report(None, target).await?;
                info!(rssi = %rssi, device_id = ?target, "Scan started");
                Ok(ResponseEnvelope::status("Scan started"))
            }
            Command::Stop { device_id } => {
                let target = device_id.as_deref();
                self.fleet.stop_report(target).await?;
                self.fleet.stop_scan(target).await?;
                info!(device_id = ?target, "Scan stopped");
                Ok(ResponseEnvelope::status("Scan stopped"))
            }
            Command::Heartbeat => Ok(ResponseEnvelope::status_probe(
                &self.fleet.connection_stats(),
            )),
        }
    }
}
