//! Supervision of every configured scanning module.
//!
//! The [`Fleet`] connects devices concurrently, reconnects dropped ones with
//! exponential backoff, fans host commands out to one or all devices and
//! republishes device events on a broadcast channel.
//!
//! # Reconnect schedule
//!
//! A device that disconnects, or fails its first connection, gets one timer
//! of `base_delay * 2^attempts`. A failed attempt bumps the counter and
//! schedules the next timer; a successful one resets it. Once the counter
//! reaches `max_attempts` the device is given up until an operator calls
//! [`Fleet::reconnect_failed`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::channel::Connector;
use crate::config::AppConfig;
use crate::device::{Detection, DeviceEvent, DeviceSpec, DeviceStatus, DeviceTimings, ScanDevice};
use crate::error::{BridgeError, Result};

/// Capacity of the fleet event broadcast channel.
pub const EVENT_BUFFER: usize = 256;

// =============================================================================
// SETTINGS
// =============================================================================

/// Backoff policy for device reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Failed attempts after which a device is given up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// `base_delay * 2^attempts`, saturating.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .map_or(Duration::MAX, |factor| self.base_delay.saturating_mul(factor))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10_000),
        }
    }
}

/// Everything the fleet takes from configuration.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Enabled devices only.
    pub devices: Vec<DeviceSpec>,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Per-device timings.
    pub timings: DeviceTimings,
}

impl FleetSettings {
    /// Builds settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            devices: config.enabled_devices().map(DeviceSpec::from).collect(),
            reconnect: ReconnectPolicy {
                max_attempts: config.reconnect.max_attempts,
                base_delay: config.reconnect.base_delay(),
            },
            timings: DeviceTimings::with_clear_interval(config.report_interval()),
        }
    }
}

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Fleet-wide connection counts. `total = connected + reconnecting + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ConnectionStats {
    /// Enabled devices.
    pub total: usize,
    /// Live devices.
    pub connected: usize,
    /// Devices given up on, or not attempted.
    pub failed: usize,
    /// Devices with a pending or running reconnect.
    pub reconnecting: usize,
}

/// What the fleet republishes to subscribers.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A device surfaced a sighting.
    Detected(Detection),
    /// A device reported a channel failure.
    DeviceError {
        /// Device id.
        device_id: String,
        /// Failure description.
        message: String,
    },
    /// A device came up.
    Connected {
        /// Device id.
        device_id: String,
    },
    /// A live device lost its channel.
    Disconnected {
        /// Device id.
        device_id: String,
    },
    /// A device exhausted its reconnect attempts.
    ReconnectAbandoned {
        /// Device id.
        device_id: String,
        /// Failed attempts.
        attempts: u32,
    },
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Desired {
    scan_rssi: Option<String>,
    report: bool,
}

#[derive(Default)]
struct FleetState {
    devices: HashMap<String, Arc<ScanDevice>>,
    attempts: HashMap<String, u32>,
    timers: HashMap<String, JoinHandle<()>>,
    connecting: HashSet<String>,
    desired: Desired,
    shutting_down: bool,
    pump: Option<JoinHandle<()>>,
}

impl FleetState {
    fn is_pending(&self, device_id: &str) -> bool {
        !self.devices.contains_key(device_id)
            && (self.timers.contains_key(device_id) || self.connecting.contains(device_id))
    }
}

struct FleetInner {
    settings: FleetSettings,
    connector: Arc<dyn Connector>,
    state: Mutex<FleetState>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    events: broadcast::Sender<FleetEvent>,
    generation: AtomicU64,
}

// =============================================================================
// FLEET
// =============================================================================

/// Supervisor of all enabled scanning modules. Cheap to clone.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("devices", &self.inner.settings.devices.len())
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Creates a fleet. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(settings: FleetSettings, connector: Arc<dyn Connector>) -> Self {
        let (device_events, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let inner = Arc::new(FleetInner {
            settings,
            connector,
            state: Mutex::new(FleetState::default()),
            device_events,
            events,
            generation: AtomicU64::new(0),
        });
        let pump = tokio::spawn(pump_events(Arc::downgrade(&inner), rx));
        inner.state.lock().pump = Some(pump);
        Self { inner }
    }

    /// Creates a fleet from the application configuration.
    #[must_use]
    pub fn from_config(config: &AppConfig, connector: Arc<dyn Connector>) -> Self {
        Self::new(FleetSettings::from_config(config), connector)
    }

    /// Subscribes to fleet events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    /// Connects and brings up every enabled device concurrently. Failures
    /// are logged and handed to the reconnect schedule; this never fails.
    pub async fn initialize_all(&self) {
        let inner = &self.inner;
        info!(devices = inner.settings.devices.len(), "Initializing fleet");
        let results = join_all(
            inner
                .settings
                .devices
                .iter()
                .map(|spec| async move { (spec, inner.initialize_device(spec).await) }),
        )
        .await;

        for (spec, result) in results {
            match result {
                Ok(()) => {}
                Err(BridgeError::ShuttingDown) => {}
                Err(e) => {
                    error!(device_id = %spec.device_id, serial_path = %spec.serial_path, error = %e, "Device failed to initialize");
                    inner.schedule_reconnect(&spec.device_id);
                }
            }
        }

        let stats = self.connection_stats();
        info!(
            connected = stats.connected,
            reconnecting = stats.reconnecting,
            failed = stats.failed,
            "Fleet initialized"
        );
    }

    /// Connects one configured device.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DeviceNotFound`] for an id that is not configured,
    /// [`BridgeError::DeviceBusy`] while another attempt for it runs, or the
    /// device's own open/bring-up failure.
    pub async fn initialize_device(&self, device_id: &str) -> Result<()> {
        let spec = self
            .inner
            .spec(device_id)
            .cloned()
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;
        self.inner.initialize_device(&spec).await
    }

    /// Current connection counts.
    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        let state = self.inner.state.lock();
        let total = self.inner.settings.devices.len();
        let connected = state.devices.len();
        let reconnecting = self
            .inner
            .settings
            .devices
            .iter()
            .filter(|spec| state.is_pending(&spec.device_id))
            .count();
        ConnectionStats {
            total,
            connected,
            failed: total.saturating_sub(connected + reconnecting),
            reconnecting,
        }
    }

    /// Snapshot of every live device, sorted by id.
    #[must_use]
    pub fn devices_info(&self) -> Vec<DeviceStatus> {
        let mut info: Vec<DeviceStatus> = self
            .inner
            .state
            .lock()
            .devices
            .values()
            .map(|device| device.status())
            .collect();
        info.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        info
    }

    /// Ids of live devices.
    #[must_use]
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a reconnect timer is pending for `device_id`.
    #[must_use]
    pub fn has_pending_reconnect(&self, device_id: &str) -> bool {
        self.inner.state.lock().timers.contains_key(device_id)
    }

    /// Starts scanning on one device, or on all of them.
    ///
    /// # Errors
    ///
    /// Only when targeted: [`BridgeError::DeviceNotFound`] or the device's
    /// own failure. The fleet-wide form never fails.
    pub async fn start_scan(&self, rssi: &str, device_id: Option<&str>) -> Result<()> {
        if let Some(id) = device_id {
            return self.inner.device(id)?.start_scan(rssi).await;
        }
        self.inner.state.lock().desired.scan_rssi = Some(rssi.to_string());
        self.fan_out("start_scan", |device| async move { device.start_scan(rssi).await })
            .await;
        Ok(())
    }

    /// Stops scanning on one device, or on all of them.
    ///
    /// # Errors
    ///
    /// Only when targeted, as for [`Fleet::start_scan`].
    pub async fn stop_scan(&self, device_id: Option<&str>) -> Result<()> {
        if let Some(id) = device_id {
            return self.inner.device(id)?.stop_scan().await;
        }
        self.inner.state.lock().desired.scan_rssi = None;
        self.fan_out("stop_scan", |device| async move { device.stop_scan().await })
            .await;
        Ok(())
    }

    /// Enables reporting on one device, or on all of them.
    ///
    /// # Errors
    ///
    /// Only when targeted, as for [`Fleet::start_scan`].
    pub async fn start_report(&self, rssi: Option<&str>, device_id: Option<&str>) -> Result<()> {
        if let Some(id) = device_id {
            return self.inner.device(id)?.start_report(rssi).await;
        }
        {
            let mut state = self.inner.state.lock();
            state.desired.report = true;
            if let Some(rssi) = rssi {
                state.desired.scan_rssi = Some(rssi.to_string());
            }
        }
        self.fan_out("start_report", |device| async move { device.start_report(rssi).await })
            .await;
        Ok(())
    }

    /// Disables reporting on one device, or on all of them.
    ///
    /// # Errors
    ///
    /// Only when targeted: [`BridgeError::DeviceNotFound`].
    pub async fn stop_report(&self, device_id: Option<&str>) -> Result<()> {
        if let Some(id) = device_id {
            self.inner.device(id)?.stop_report();
            return Ok(());
        }
        self.inner.state.lock().desired.report = false;
        self.fan_out("stop_report", |device| async move {
            device.stop_report();
            Ok(())
        })
        .await;
        Ok(())
    }

    /// Retries every device that is neither live nor pending, resetting its
    /// attempt counter. Returns how many devices were retried.
    pub async fn reconnect_failed(&self) -> usize {
        let inner = &self.inner;
        let targets: Vec<DeviceSpec> = {
            let mut state = inner.state.lock();
            if state.shutting_down {
                return 0;
            }
            let targets: Vec<DeviceSpec> = inner
                .settings
                .devices
                .iter()
                .filter(|spec| {
                    !state.devices.contains_key(&spec.device_id)
                        && !state.timers.contains_key(&spec.device_id)
                        && !state.connecting.contains(&spec.device_id)
                })
                .cloned()
                .collect();
            for spec in &targets {
                state.attempts.remove(&spec.device_id);
            }
            targets
        };

        info!(devices = targets.len(), "Retrying failed devices");
        let results = join_all(
            targets
                .iter()
                .map(|spec| async move { (spec, inner.initialize_device(spec).await) }),
        )
        .await;
        for (spec, result) in results {
            if let Err(e) = result {
                warn!(device_id = %spec.device_id, error = %e, "Manual reconnect failed");
                inner.schedule_reconnect(&spec.device_id);
            }
        }
        targets.len()
    }

    /// Cancels pending reconnects, disconnects every device concurrently and
    /// refuses further work.
    pub async fn shutdown(&self) {
        let (timers, devices, pump) = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.attempts.clear();
            state.connecting.clear();
            let timers: Vec<JoinHandle<()>> = state.timers.drain().map(|(_, t)| t).collect();
            let devices: Vec<Arc<ScanDevice>> =
                state.devices.drain().map(|(_, d)| d).collect();
            (timers, devices, state.pump.take())
        };

        info!(
            timers = timers.len(),
            devices = devices.len(),
            "Shutting down fleet"
        );
        for timer in timers {
            timer.abort();
        }
        join_all(devices.iter().map(|device| device.disconnect())).await;
        if let Some(pump) = pump {
            pump.abort();
        }
    }

    async fn fan_out<F, Fut>(&self, operation: &'static str, f: F)
    where
        F: Fn(Arc<ScanDevice>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let devices: Vec<Arc<ScanDevice>> =
            self.inner.state.lock().devices.values().cloned().collect();
        debug!(operation, devices = devices.len(), "Fleet-wide command");

        let results = join_all(devices.into_iter().map(|device| {
            let device_id = device.device_id().to_string();
            let fut = f(device);
            async move { (device_id, fut.await) }
        }))
        .await;

        for (device_id, result) in results {
            if let Err(e) = result {
                warn!(device_id = %device_id, operation, error = %e, "Command failed on device");
            }
        }
    }
}

impl FleetInner {
    fn spec(&self, device_id: &str) -> Option<&DeviceSpec> {
        self.settings
            .devices
            .iter()
            .find(|spec| spec.device_id == device_id)
    }

    fn device(&self, device_id: &str) -> Result<Arc<ScanDevice>> {
        self.state
            .lock()
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))
    }

    fn publish(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn connect(&self, spec: &DeviceSpec) -> Result<Arc<ScanDevice>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let device = Arc::new(
            ScanDevice::open(
                spec,
                self.connector.as_ref(),
                self.settings.timings,
                generation,
                self.device_events.clone(),
            )
            .await?,
        );
        if let Err(e) = device.initialize().await {
            device.disconnect().await;
            return Err(e);
        }
        Ok(device)
    }

    async fn initialize_device(&self, spec: &DeviceSpec) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(BridgeError::ShuttingDown);
            }
            if state.devices.contains_key(&spec.device_id) {
                return Ok(());
            }
            if !state.connecting.insert(spec.device_id.clone()) {
                return Err(BridgeError::DeviceBusy(spec.device_id.clone()));
            }
        }

        let result = self.connect(spec).await;

        let (device, admitted) = {
            let mut state = self.state.lock();
            state.connecting.remove(&spec.device_id);
            let device = result?;
            let admitted = if state.shutting_down {
                Err(BridgeError::ShuttingDown)
            } else if !device.is_connected() {
                // Lost during bring-up; its disconnect event found nothing to remove.
                Err(BridgeError::ChannelOpen {
                    path: spec.serial_path.clone(),
                    message: "channel closed during bring-up".to_string(),
                })
            } else {
                state
                    .devices
                    .insert(spec.device_id.clone(), Arc::clone(&device));
                state.attempts.remove(&spec.device_id);
                Ok(state.desired.clone())
            };
            (device, admitted)
        };
        let desired = match admitted {
            Ok(desired) => desired,
            Err(e) => {
                device.disconnect().await;
                return Err(e);
            }
        };

        info!(device_id = %spec.device_id, serial_path = %spec.serial_path, "Device connected");
        self.publish(FleetEvent::Connected {
            device_id: spec.device_id.clone(),
        });
        resume(&device, &desired).await;
        Ok(())
    }

    fn schedule_reconnect(self: &Arc<Self>, device_id: &str) {
        let Some(spec) = self.spec(device_id).cloned() else {
            return;
        };

        let mut state = self.state.lock();
        if state.shutting_down
            || state.devices.contains_key(device_id)
            || state.timers.contains_key(device_id)
            || state.connecting.contains(device_id)
        {
            return;
        }

        let attempts = state.attempts.get(device_id).copied().unwrap_or(0);
        if attempts >= self.settings.reconnect.max_attempts {
            state.attempts.remove(device_id);
            drop(state);
            error!(device_id = %device_id, attempts, "Giving up on device after repeated reconnect failures");
            self.publish(FleetEvent::ReconnectAbandoned {
                device_id: device_id.to_string(),
                attempts,
            });
            return;
        }

        let delay = self.settings.reconnect.delay_for(attempts);
        info!(
            device_id = %device_id,
            attempt = attempts + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );
        let timer = tokio::spawn(reconnect_after(Arc::downgrade(self), spec, delay));
        state.timers.insert(device_id.to_string(), timer);
    }

    fn on_device_event(self: &Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::Detected(detection) => self.publish(FleetEvent::Detected(detection)),
            DeviceEvent::Error {
                device_id, message, ..
            } => self.publish(FleetEvent::DeviceError { device_id, message }),
            DeviceEvent::Disconnected {
                device_id,
                serial_path,
                generation,
            } => {
                let removed = {
                    let mut state = self.state.lock();
                    let current = state
                        .devices
                        .get(&device_id)
                        .is_some_and(|device| device.generation() == generation);
                    if current {
                        state.devices.remove(&device_id);
                    }
                    current && !state.shutting_down
                };
                if !removed {
                    return;
                }
                warn!(device_id = %device_id, serial_path = %serial_path, "Device lost");
                self.publish(FleetEvent::Disconnected {
                    device_id: device_id.clone(),
                });
                self.schedule_reconnect(&device_id);
            }
        }
    }
}

async fn resume(device: &ScanDevice, desired: &Desired) {
    if let Some(rssi) = &desired.scan_rssi {
        if let Err(e) = device.start_scan(rssi).await {
            warn!(device_id = %device.device_id(), error = %e, "Could not resume scanning");
            return;
        }
    }
    if desired.report {
        if let Err(e) = device.start_report(None).await {
            warn!(device_id = %device.device_id(), error = %e, "Could not resume reporting");
        }
    }
}

async fn reconnect_after(fleet: Weak<FleetInner>, spec: DeviceSpec, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = fleet.upgrade() else {
        return;
    };

    // From here on `connecting` guards the attempt. The timer entry has to
    // go first so a disconnect during resume can schedule the next one.
    inner.state.lock().timers.remove(&spec.device_id);

    match inner.initialize_device(&spec).await {
        Ok(()) => info!(device_id = %spec.device_id, "Reconnected"),
        Err(BridgeError::ShuttingDown) => {}
        Err(e) => {
            let attempts = {
                let mut state = inner.state.lock();
                let attempts = state.attempts.entry(spec.device_id.clone()).or_insert(0);
                *attempts += 1;
                *attempts
            };
            if !e.is_recoverable() {
                inner.state.lock().attempts.remove(&spec.device_id);
                error!(device_id = %spec.device_id, attempts, error = %e, "Reconnect attempt failed permanently");
                inner.publish(FleetEvent::ReconnectAbandoned {
                    device_id: spec.device_id.clone(),
                    attempts,
                });
                return;
            }
            warn!(device_id = %spec.device_id, attempts, error = %e, "Reconnect attempt failed");
            inner.schedule_reconnect(&spec.device_id);
        }
    }
}

async fn pump_events(fleet: Weak<FleetInner>, mut rx: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = fleet.upgrade() else {
            break;
        };
        inner.on_device_event(event);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use crate::channel::{ChannelHandle, LineWriter};
    use crate::config::DeviceConfig;
    use crate::mock::MockConnector;

    const A: &str = "/dev/ttyUSB0";
    const B: &str = "/dev/ttyUSB1";
    const A_ID: &str = "_dev_ttyUSB0";
    const B_ID: &str = "_dev_ttyUSB1";

    fn settings(paths: &[&str]) -> FleetSettings {
        FleetSettings {
            devices: paths
                .iter()
                .map(|p| DeviceSpec::from(&DeviceConfig::new(*p)))
                .collect(),
            reconnect: ReconnectPolicy::default(),
            timings: DeviceTimings::default(),
        }
    }

    fn fleet(connector: &MockConnector, paths: &[&str]) -> Fleet {
        Fleet::new(settings(paths), Arc::new(connector.clone()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn assert_balanced(stats: ConnectionStats) {
        assert_eq!(stats.total, stats.connected + stats.reconnecting + stats.failed);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(160));
        assert_eq!(policy.delay_for(64), Duration::MAX);
    }

    #[test]
    fn test_settings_skip_disabled_devices() {
        let mut config = AppConfig::default();
        let mut disabled = DeviceConfig::new(B);
        disabled.enabled = false;
        config.devices = vec![DeviceConfig::new(A), disabled];

        let settings = FleetSettings::from_config(&config);
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.devices[0].device_id, A_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_all_connects_every_device() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A, B]);

        fleet.initialize_all().await;

        assert_eq!(
            fleet.connection_stats(),
            ConnectionStats {
                total: 2,
                connected: 2,
                failed: 0,
                reconnecting: 0
            }
        );
        assert_eq!(fleet.connected_ids(), vec![A_ID, B_ID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_block_others() {
        let connector = MockConnector::new();
        connector.fail_open(B, true);
        let fleet = fleet(&connector, &[A, B]);

        fleet.initialize_all().await;

        let stats = fleet.connection_stats();
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.reconnecting, 1);
        assert_balanced(stats);
        assert!(fleet.has_pending_reconnect(B_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_schedules_single_timer() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A]);
        fleet.initialize_all().await;

        connector.close_port(A);
        settle().await;
        assert!(fleet.has_pending_reconnect(A_ID));

        // A second notification for the same device must not add a timer.
        fleet.inner.schedule_reconnect(A_ID);
        assert_eq!(fleet.inner.state.lock().timers.len(), 1);

        let stats = fleet.connection_stats();
        assert_eq!(stats.connected, 0);
        assert_eq!(stats.reconnecting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_backoff_resets_attempts() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A]);
        let mut events = fleet.subscribe();
        fleet.initialize_all().await;

        connector.close_port(A);
        settle().await;
        tokio::time::sleep(Duration::from_secs(10) + DeviceTimings::default().bring_up_duration())
            .await;
        settle().await;

        assert_eq!(fleet.connection_stats().connected, 1);
        assert!(!fleet.has_pending_reconnect(A_ID));
        assert!(fleet.inner.state.lock().attempts.is_empty());
        assert_eq!(connector.open_count(A), 2);

        let mut connected = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FleetEvent::Connected { .. }) {
                connected += 1;
            }
        }
        assert_eq!(connected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = MockConnector::new();
        connector.fail_open(A, true);
        let fleet = fleet(&connector, &[A]);
        let mut events = fleet.subscribe();

        fleet.initialize_all().await;
        // 10 + 20 + 40 + 80 + 160 seconds of backoff.
        tokio::time::sleep(Duration::from_secs(310)).await;
        settle().await;

        assert_eq!(connector.open_count(A), 6);
        assert!(!fleet.has_pending_reconnect(A_ID));
        let stats = fleet.connection_stats();
        assert_eq!(stats.failed, 1);
        assert_balanced(stats);

        let mut abandoned = false;
        while let Ok(event) = events.try_recv() {
            abandoned |= matches!(event, FleetEvent::ReconnectAbandoned { attempts: 5, .. });
        }
        assert!(abandoned);

        // Nothing else fires later.
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(connector.open_count(A), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failed_retries_given_up_devices() {
        let connector = MockConnector::new();
        connector.fail_open(A, true);
        let fleet = fleet(&connector, &[A]);
        fleet.initialize_all().await;
        tokio::time::sleep(Duration::from_secs(310)).await;
        settle().await;
        assert_eq!(fleet.connection_stats().failed, 1);

        connector.fail_open(A, false);
        assert_eq!(fleet.reconnect_failed().await, 1);

        assert_eq!(fleet.connection_stats().connected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_command_on_unknown_device() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A]);
        fleet.initialize_all().await;

        let err = fleet.start_scan("-60", Some("nope")).await.unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotFound(_)));
        assert!(fleet.stop_report(Some("nope")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_wide_command_never_fails() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A, B]);
        fleet.initialize_all().await;
        connector.fail_writes(A, true);
        connector.fail_writes(B, true);

        assert!(fleet.start_scan("-60", None).await.is_ok());
        assert!(fleet.stop_scan(None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_wide_start_reaches_every_device() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A, B]);
        fleet.initialize_all().await;

        fleet.start_scan("-60", None).await.unwrap();

        for path in [A, B] {
            assert_eq!(
                connector.writes(path).last().unwrap(),
                "AT+OBSERVER=1,4,,,-60\r\n"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_start_reaches_one_device() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A, B]);
        fleet.initialize_all().await;

        fleet.start_scan("-55", Some(B_ID)).await.unwrap();

        assert!(!connector.writes(A).iter().any(|w| w.starts_with("AT+OBSERVER")));
        assert_eq!(connector.writes(B).last().unwrap(), "AT+OBSERVER=1,4,,,-55\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnected_device_resumes_scanning() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A]);
        fleet.initialize_all().await;
        fleet.start_scan("-60", None).await.unwrap();
        fleet.start_report(None, None).await.unwrap();

        connector.close_port(A);
        settle().await;
        connector.clear_writes(A);
        tokio::time::sleep(Duration::from_secs(10) + DeviceTimings::default().bring_up_duration())
            .await;
        settle().await;

        let info = fleet.devices_info();
        assert_eq!(info.len(), 1);
        assert!(info[0].scanning);
        assert!(info[0].report_enabled);
        assert_eq!(connector.writes(A).last().unwrap(), "AT+OBSERVER=1,4,,,-60\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_detections_are_republished() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A]);
        let mut events = fleet.subscribe();
        fleet.initialize_all().await;
        fleet.start_scan("-60", None).await.unwrap();
        fleet.start_report(None, None).await.unwrap();

        connector.inject_line(A, "+OBSERVER:AABB,-40,ADV:02FF4C00");
        settle().await;

        let mut found = None;
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::Detected(d) = event {
                found = Some(d);
            }
        }
        let detection = found.unwrap();
        assert_eq!(detection.manufacturer, "Apple, Inc.");
        assert_eq!(detection.device_id, A_ID);
        assert_eq!(detection.serial_path, A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers_and_disconnects() {
        let connector = MockConnector::new();
        connector.fail_open(B, true);
        let fleet = fleet(&connector, &[A, B]);
        fleet.initialize_all().await;
        assert!(fleet.has_pending_reconnect(B_ID));

        fleet.shutdown().await;

        assert!(!fleet.has_pending_reconnect(B_ID));
        assert!(!connector.is_open(A));
        assert_eq!(fleet.connection_stats().connected, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_count(B), 1);
        assert!(matches!(
            fleet.initialize_device(A_ID).await,
            Err(BridgeError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_stay_balanced_through_failures() {
        let connector = MockConnector::new();
        connector.fail_open(B, true);
        let fleet = fleet(&connector, &[A, B]);
        assert_balanced(fleet.connection_stats());

        fleet.initialize_all().await;
        assert_balanced(fleet.connection_stats());

        connector.close_port(A);
        settle().await;
        assert_balanced(fleet.connection_stats());

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_balanced(fleet.connection_stats());
    }

    /// Unplugs the port right after the next observer start is written, once
    /// armed, and lets the reader and event pump see it before returning.
    #[derive(Clone)]
    struct UnplugOnObserve {
        inner: MockConnector,
        armed: Arc<AtomicBool>,
    }

    struct UnplugWriter {
        inner: Box<dyn LineWriter>,
        path: String,
        connector: MockConnector,
        armed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for UnplugOnObserve {
        async fn open(&self, path: &str, baud_rate: u32) -> Result<ChannelHandle> {
            let handle = self.inner.open(path, baud_rate).await?;
            Ok(ChannelHandle {
                writer: Box::new(UnplugWriter {
                    inner: handle.writer,
                    path: path.to_string(),
                    connector: self.inner.clone(),
                    armed: Arc::clone(&self.armed),
                }),
                lines: handle.lines,
            })
        }
    }

    #[async_trait]
    impl LineWriter for UnplugWriter {
        async fn write(&mut self, data: &str) -> std::io::Result<()> {
            self.inner.write(data).await?;
            if data.starts_with("AT+OBSERVER=1") && self.armed.swap(false, Ordering::SeqCst) {
                self.connector.close_port(&self.path);
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.inner.close().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplug_during_resume_schedules_another_reconnect() {
        let mock = MockConnector::new();
        let armed = Arc::new(AtomicBool::new(false));
        let connector = UnplugOnObserve {
            inner: mock.clone(),
            armed: Arc::clone(&armed),
        };
        let fleet = Fleet::new(settings(&[A]), Arc::new(connector));
        fleet.initialize_all().await;
        fleet.start_scan("-60", None).await.unwrap();

        armed.store(true, Ordering::SeqCst);
        mock.close_port(A);
        settle().await;

        // Reconnect at 10s, bring-up for 7s, then resume writes the observer
        // start and the port drops underneath it.
        tokio::time::sleep(Duration::from_secs(18)).await;
        settle().await;
        assert!(!armed.load(Ordering::SeqCst));
        assert_eq!(mock.open_count(A), 2);
        assert!(fleet.has_pending_reconnect(A_ID));
        let stats = fleet.connection_stats();
        assert_eq!(stats.connected, 0);
        assert_eq!(stats.reconnecting, 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(mock.open_count(A), 3);
        assert_eq!(fleet.connection_stats().connected, 1);
        assert!(fleet.devices_info()[0].scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplug_during_final_settle_is_not_kept() {
        let connector = MockConnector::new();
        let fleet = fleet(&connector, &[A]);
        fleet.initialize_all().await;

        connector.close_port(A);
        settle().await;
        // The last bring-up write lands 6s into the attempt that starts at 10s.
        tokio::time::sleep(Duration::from_millis(16_500)).await;
        assert_eq!(connector.open_count(A), 2);
        connector.close_port(A);

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fleet.connection_stats().connected, 0);
        assert!(fleet.has_pending_reconnect(A_ID));
        assert_eq!(fleet.inner.state.lock().attempts.get(A_ID), Some(&1));

        // Second attempt after 20s of backoff plus bring-up.
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(connector.open_count(A), 3);
        assert_eq!(fleet.connection_stats().connected, 1);
        assert!(fleet.inner.state.lock().attempts.is_empty());
    }
}
