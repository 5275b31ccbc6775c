//! Application lifecycle: wiring, startup and ordered shutdown.
//!
//! Startup order is fleet construction, event forwarding, transport,
//! inbound dispatch, device bring-up, heartbeat. Shutdown runs heartbeat,
//! fleet, transport.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::Connector;
use crate::config::AppConfig;
use crate::error::{BridgeError, Result};
use crate::fleet::{ConnectionStats, Fleet};
use crate::heartbeat::Heartbeat;
use crate::router::{CommandRouter, RouterSettings};
use crate::transport::{Inbound, Transport, INBOUND_BUFFER};

/// A running bridge.
pub struct Bridge {
    fleet: Fleet,
    router: CommandRouter,
    heartbeat: Heartbeat,
    transport: Arc<dyn Transport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("transport", &self.transport.name())
            .field("fleet", &self.fleet)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Validates `config`, starts the transport and brings the fleet up.
    ///
    /// # Errors
    ///
    /// Configuration errors (including [`BridgeError::NoEnabledDevices`]),
    /// transport start failures, and [`BridgeError::NoDevicesAvailable`]
    /// when no device connected and none is retrying.
    pub async fn start(
        config: &AppConfig,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let fleet = Fleet::from_config(config, connector);
        let router = CommandRouter::new(fleet.clone(), RouterSettings::from_config(config));
        let heartbeat = Heartbeat::new(fleet.clone(), Arc::clone(&transport));

        let mut tasks = vec![tokio::spawn(forward_events(
            fleet.subscribe(),
            Arc::clone(&transport),
        ))];

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        if let Err(e) = transport.start(inbound_tx).await {
            error!(transport = transport.name(), error = %e, "Transport failed to start");
            abort_all(&mut tasks);
            fleet.shutdown().await;
            return Err(e);
        }
        info!(transport = transport.name(), "Transport started");
        tasks.push(tokio::spawn(dispatch_inbound(inbound_rx, router.clone())));

        fleet.initialize_all().await;
        let stats = fleet.connection_stats();
        if stats.connected == 0 && stats.reconnecting == 0 {
            error!(total = stats.total, "No devices connected and none retrying");
            abort_all(&mut tasks);
            fleet.shutdown().await;
            if let Err(e) = transport.stop().await {
                warn!(error = %e, "Transport stop failed");
            }
            return Err(BridgeError::NoDevicesAvailable);
        }

        heartbeat.start();
        info!(
            connected = stats.connected,
            reconnecting = stats.reconnecting,
            total = stats.total,
            "Bridge running"
        );

        Ok(Self {
            fleet,
            router,
            heartbeat,
            transport,
            tasks: Mutex::new(tasks),
        })
    }

    /// The fleet.
    #[must_use]
    pub const fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// The command router.
    #[must_use]
    pub const fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Current connection counts.
    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        self.fleet.connection_stats()
    }

    /// Stops heartbeat, fleet and transport, in that order.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.heartbeat.stop();
        self.fleet.shutdown().await;
        if let Err(e) = self.transport.stop().await {
            warn!(transport = self.transport.name(), error = %e, "Transport stop failed");
        }
        abort_all(&mut self.tasks.lock());
        info!("Bridge stopped");
    }
}

fn abort_all(tasks: &mut Vec<JoinHandle<()>>) {
    for task in tasks.drain(..) {
        task.abort();
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<crate::fleet::FleetEvent>,
    transport: Arc<dyn Transport>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(payload) = CommandRouter::format_event(&event) {
                    transport.send(&payload);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event forwarder lagged; detections dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn dispatch_inbound(mut inbound: mpsc::Receiver<Inbound>, router: CommandRouter) {
    while let Some(message) = inbound.recv().await {
        let router = router.clone();
        tokio::spawn(async move { router.dispatch(message).await });
    }
    debug!("Inbound queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::mock::{MockConnector, MockTransport};

    fn config(paths: &[&str]) -> AppConfig {
        AppConfig {
            devices: paths.iter().map(|p| DeviceConfig::new(*p)).collect(),
            ..AppConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_config_without_enabled_devices() {
        let mut cfg = config(&["/dev/a"]);
        cfg.devices[0].enabled = false;
        let transport = MockTransport::new();

        let err = Bridge::start(&cfg, Arc::new(transport.clone()), Arc::new(MockConnector::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::NoEnabledDevices));
        assert_eq!(transport.lifecycle_counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_aborts_startup() {
        let transport = MockTransport::new();
        transport.fail_start(true);

        let err = Bridge::start(
            &config(&["/dev/a"]),
            Arc::new(transport.clone()),
            Arc::new(MockConnector::new()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_order_stops_transport_last() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        let bridge = Bridge::start(
            &config(&["/dev/a"]),
            Arc::new(transport.clone()),
            Arc::new(connector.clone()),
        )
        .await
        .unwrap();

        bridge.shutdown().await;

        assert!(!connector.is_open("/dev/a"));
        assert_eq!(transport.lifecycle_counts(), (1, 1));
        transport.clear_sent();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        assert!(transport.sent().is_empty());
    }
}
