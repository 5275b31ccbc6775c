//! Periodic liveness events towards the host.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::fleet::Fleet;
use crate::transport::Transport;
use crate::wire::ResponseEnvelope;

/// Heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2_000);

/// Sends `{"t":4,"d":{"run":<any device connected>}}` every period.
pub struct Heartbeat {
    fleet: Fleet,
    transport: Arc<dyn Transport>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Heartbeat {
    /// Creates a stopped emitter with the default period.
    #[must_use]
    pub fn new(fleet: Fleet, transport: Arc<dyn Transport>) -> Self {
        Self::with_interval(fleet, transport, HEARTBEAT_INTERVAL)
    }

    /// Creates a stopped emitter with a custom period.
    #[must_use]
    pub fn with_interval(fleet: Fleet, transport: Arc<dyn Transport>, interval: Duration) -> Self {
        Self {
            fleet,
            transport,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Whether the emitter is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Starts emitting. A second call while running only logs a warning.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("Heartbeat already running");
            return;
        }

        let fleet = self.fleet.clone();
        let transport = Arc::clone(&self.transport);
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = fleet.connection_stats();
                transport.send(&ResponseEnvelope::heartbeat(stats.connected > 0).to_json());
            }
        }));
        debug!(interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX), "Heartbeat started");
    }

    /// Stops emitting. Safe when not running.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Heartbeat stopped");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use crate::config::DeviceConfig;
    use crate::fleet::FleetSettings;
    use crate::mock::{MockConnector, MockTransport};

    fn fleet(connector: &MockConnector) -> Fleet {
        let mut settings = FleetSettings::from_config(&crate::config::AppConfig::default());
        settings.devices = vec![DeviceSpec::from(&DeviceConfig::new("/dev/ttyUSB0"))];
        Fleet::new(settings, Arc::new(connector.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_every_period() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector);
        fleet.initialize_all().await;
        let transport = MockTransport::new();
        let heartbeat = Heartbeat::new(fleet, Arc::new(transport.clone()));

        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(4_100)).await;

        assert_eq!(
            transport.sent(),
            vec![r#"{"t":4,"d":{"run":true}}"#, r#"{"t":4,"d":{"run":true}}"#]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_not_running_without_devices() {
        let connector = MockConnector::new();
        connector.fail_open("/dev/ttyUSB0", true);
        let fleet = fleet(&connector);
        fleet.initialize_all().await;
        let transport = MockTransport::new();
        let heartbeat = Heartbeat::new(fleet, Arc::new(transport.clone()));

        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert_eq!(transport.sent(), vec![r#"{"t":4,"d":{"run":false}}"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_task() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        let heartbeat = Heartbeat::new(fleet(&connector), Arc::new(transport.clone()));

        heartbeat.start();
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_safe_and_final() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        let heartbeat = Heartbeat::new(fleet(&connector), Arc::new(transport.clone()));

        heartbeat.stop();
        heartbeat.start();
        assert!(heartbeat.is_running());
        heartbeat.stop();
        heartbeat.stop();
        tokio::time::sleep(Duration::from_millis(5_000)).await;

        assert!(!heartbeat.is_running());
        assert!(transport.sent().is_empty());
    }
}
