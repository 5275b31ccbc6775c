//! One serial-attached BLE observer module.
//!
//! A [`ScanDevice`] owns its channel for the lifetime of one connection. It
//! runs the AT bring-up sequence, parses advertisement lines, suppresses
//! repeat sightings within a dedup window and buffers recent sightings so a
//! late `start_report` can catch the host up.
//!
//! Devices never reconnect themselves. When the channel closes the device
//! emits [`DeviceEvent::Disconnected`] exactly once and the fleet decides
//! what happens next, always with a fresh instance.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, trace, warn};
use utoipa::ToSchema;

use crate::advert;
use crate::at;
use crate::channel::{Connector, LineWriter};
use crate::config::DeviceConfig;
use crate::error::{BridgeError, Result};

/// How long sightings stay in the catch-up buffer.
pub const RETENTION_WINDOW: Duration = Duration::from_millis(1_000);

// =============================================================================
// TYPES
// =============================================================================

/// What the fleet needs to open a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Stable identifier.
    pub device_id: String,
    /// Serial device path.
    pub serial_path: String,
    /// Baud rate.
    pub baud_rate: u32,
}

impl From<&DeviceConfig> for DeviceSpec {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.resolved_id(),
            serial_path: config.serial_path.clone(),
            baud_rate: config.baud_rate,
        }
    }
}

/// Bring-up progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    /// Bring-up has not run, or failed.
    Uninitialized,
    /// The AT sequence is running.
    Initializing,
    /// The module is in observer-capable command mode.
    Initialized,
}

/// Settle delays and windows used by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimings {
    /// After the first `AT+RESTART`.
    pub restart_settle: Duration,
    /// After the first `+++`.
    pub command_mode_settle: Duration,
    /// After `AT+ROLE=1`.
    pub role_settle: Duration,
    /// After the second `AT+RESTART`.
    pub second_restart_settle: Duration,
    /// After the final `+++`.
    pub final_command_mode_settle: Duration,
    /// Period of the dedup clear tick while scanning.
    pub clear_interval: Duration,
}

impl Default for DeviceTimings {
    fn default() -> Self {
        Self {
            restart_settle: Duration::from_millis(3_000),
            command_mode_settle: Duration::from_millis(500),
            role_settle: Duration::from_millis(500),
            second_restart_settle: Duration::from_millis(2_000),
            final_command_mode_settle: Duration::from_millis(1_000),
            clear_interval: Duration::from_millis(5_000),
        }
    }
}

impl DeviceTimings {
    /// Default settle delays with the given dedup clear period.
    #[must_use]
    pub fn with_clear_interval(clear_interval: Duration) -> Self {
        Self {
            // A zero period would make the ticker spin.
            clear_interval: clear_interval.max(Duration::from_millis(1)),
            ..Self::default()
        }
    }

    /// Total time spent settling during bring-up.
    #[must_use]
    pub fn bring_up_duration(&self) -> Duration {
        self.bring_up_sequence().iter().map(|(_, settle)| *settle).sum()
    }

    fn bring_up_sequence(&self) -> [(String, Duration); 5] {
        [
            (at::restart(), self.restart_settle),
            (at::enter_command_mode(), self.command_mode_settle),
            (at::set_role(), self.role_settle),
            (at::restart(), self.second_restart_settle),
            (at::enter_command_mode(), self.final_command_mode_settle),
        ]
    }
}

/// A manufacturer sighting surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Device that saw it.
    pub device_id: String,
    /// Serial path of that device.
    pub serial_path: String,
    /// Manufacturer name, or comma-joined names for a catch-up event.
    pub manufacturer: String,
    /// Wall-clock time of the event.
    pub observed_at: DateTime<Utc>,
}

/// Events a device pushes to its owner.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A sighting passed the dedup and report gates.
    Detected(Detection),
    /// A channel write failed.
    Error {
        /// Device id.
        device_id: String,
        /// Serial path.
        serial_path: String,
        /// Failure description.
        message: String,
    },
    /// The channel closed. Sent once per device instance.
    Disconnected {
        /// Device id.
        device_id: String,
        /// Serial path.
        serial_path: String,
        /// Instance generation, so stale notifications can be told apart.
        generation: u64,
    },
}

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DeviceStatus {
    /// Device id.
    pub device_id: String,
    /// Serial path.
    pub serial_path: String,
    /// Whether the channel is still open.
    pub connected: bool,
    /// Bring-up progress.
    pub init_state: InitState,
    /// Whether the observer is running.
    pub scanning: bool,
    /// Whether sightings are surfaced.
    pub report_enabled: bool,
}

// =============================================================================
// STATE
// =============================================================================

struct Sighting {
    code: String,
    name: &'static str,
    at: Instant,
}

struct State {
    init: InitState,
    scanning: bool,
    report_enabled: bool,
    seen: HashSet<String>,
    recent: VecDeque<Sighting>,
    clear_task: Option<JoinHandle<()>>,
}

impl State {
    fn new() -> Self {
        Self {
            init: InitState::Uninitialized,
            scanning: false,
            report_enabled: false,
            seen: HashSet::new(),
            recent: VecDeque::new(),
            clear_task: None,
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.duration_since(front.at) > RETENTION_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn stop_clear_timer(&mut self) {
        if let Some(task) = self.clear_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    device_id: String,
    serial_path: String,
    generation: u64,
    timings: DeviceTimings,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    disconnected: AtomicBool,
}

impl Shared {
    fn handle_line(&self, line: &str) {
        let Some(sighting) = advert::parse(line) else {
            return;
        };
        let now = Instant::now();

        let mut state = self.state.lock();
        state.purge(now);
        state.recent.push_back(Sighting {
            code: sighting.code.clone(),
            name: sighting.name,
            at: now,
        });
        if state.seen.contains(&sighting.code) || !state.report_enabled {
            return;
        }
        state.seen.insert(sighting.code);
        drop(state);

        debug!(device_id = %self.device_id, manufacturer = sighting.name, "Manufacturer detected");
        self.emit_detection(sighting.name.to_string());
    }

    fn emit_detection(&self, manufacturer: String) {
        let _ = self.events.send(DeviceEvent::Detected(Detection {
            device_id: self.device_id.clone(),
            serial_path: self.serial_path.clone(),
            manufacturer,
            observed_at: Utc::now(),
        }));
    }

    fn emit_error(&self, err: &BridgeError) {
        let _ = self.events.send(DeviceEvent::Error {
            device_id: self.device_id.clone(),
            serial_path: self.serial_path.clone(),
            message: err.to_string(),
        });
    }

    fn notify_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().stop_clear_timer();
        info!(device_id = %self.device_id, serial_path = %self.serial_path, "Device disconnected");
        let _ = self.events.send(DeviceEvent::Disconnected {
            device_id: self.device_id.clone(),
            serial_path: self.serial_path.clone(),
            generation: self.generation,
        });
    }
}

fn spawn_clear_timer(shared: &Arc<Shared>) -> JoinHandle<()> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let period = shared.timings.clear_interval;
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let mut state = shared.state.lock();
            if !state.scanning {
                break;
            }
            state.seen.clear();
            trace!(device_id = %shared.device_id, "Dedup window cleared");
        }
    })
}

async fn read_lines(shared: Arc<Shared>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        trace!(device_id = %shared.device_id, line = %line, "Line received");
        shared.handle_line(&line);
    }
    shared.notify_disconnected();
}

// =============================================================================
// DEVICE
// =============================================================================

/// A connected observer module.
pub struct ScanDevice {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Box<dyn LineWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanDevice")
            .field("device_id", &self.shared.device_id)
            .field("serial_path", &self.shared.serial_path)
            .field("generation", &self.shared.generation)
            .finish_non_exhaustive()
    }
}

impl ScanDevice {
    /// Opens the channel for `spec` and starts reading lines from it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ChannelOpen`] if the connector cannot open the path.
    pub async fn open(
        spec: &DeviceSpec,
        connector: &dyn Connector,
        timings: DeviceTimings,
        generation: u64,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Self> {
        let handle = connector.open(&spec.serial_path, spec.baud_rate).await?;
        let shared = Arc::new(Shared {
            device_id: spec.device_id.clone(),
            serial_path: spec.serial_path.clone(),
            generation,
            timings,
            state: Mutex::new(State::new()),
            events,
            disconnected: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_lines(Arc::clone(&shared), handle.lines));

        debug!(device_id = %spec.device_id, serial_path = %spec.serial_path, generation, "Device opened");
        Ok(Self {
            shared,
            writer: tokio::sync::Mutex::new(handle.writer),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Serial path.
    #[must_use]
    pub fn serial_path(&self) -> &str {
        &self.shared.serial_path
    }

    /// Instance generation assigned by the fleet.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Whether the channel is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Whether the observer is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.shared.state.lock().scanning
    }

    /// Snapshot of this device.
    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        let state = self.shared.state.lock();
        DeviceStatus {
            device_id: self.shared.device_id.clone(),
            serial_path: self.shared.serial_path.clone(),
            connected: self.is_connected(),
            init_state: state.init,
            scanning: state.scanning,
            report_enabled: state.report_enabled,
        }
    }

    async fn send(&self, command: &str) -> Result<()> {
        trace!(device_id = %self.shared.device_id, command = %command.trim_end(), "Writing AT command");
        self.writer
            .lock()
            .await
            .write(command)
            .await
            .map_err(|e| BridgeError::ChannelWrite {
                device_id: self.shared.device_id.clone(),
                message: e.to_string(),
            })
    }

    /// Runs the AT bring-up sequence.
    ///
    /// Returns immediately if already initialized.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DeviceBusy`] if bring-up is already running, or
    /// [`BridgeError::ChannelWrite`] if a step fails; the device is then back
    /// to [`InitState::Uninitialized`].
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match state.init {
                InitState::Initializing => {
                    return Err(BridgeError::DeviceBusy(self.shared.device_id.clone()))
                }
                InitState::Initialized => return Ok(()),
                InitState::Uninitialized => state.init = InitState::Initializing,
            }
        }

        info!(device_id = %self.shared.device_id, "Starting bring-up");
        for (command, settle) in self.shared.timings.bring_up_sequence() {
            if let Err(e) = self.send(&command).await {
                self.shared.state.lock().init = InitState::Uninitialized;
                warn!(device_id = %self.shared.device_id, error = %e, "Bring-up failed");
                self.shared.emit_error(&e);
                return Err(e);
            }
            sleep(settle).await;
        }

        self.shared.state.lock().init = InitState::Initialized;
        info!(device_id = %self.shared.device_id, "Device initialized");
        Ok(())
    }

    /// Starts the observer with `rssi_threshold`, bringing the module up
    /// first if needed. A no-op while already scanning.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DeviceBusy`] if a bring-up started elsewhere is still
    /// running, or [`BridgeError::ChannelWrite`] on write failure.
    pub async fn start_scan(&self, rssi_threshold: &str) -> Result<()> {
        let init = self.shared.state.lock().init;
        match init {
            InitState::Uninitialized => self.initialize().await?,
            InitState::Initializing => {
                return Err(BridgeError::DeviceBusy(self.shared.device_id.clone()))
            }
            InitState::Initialized => {}
        }

        {
            let mut state = self.shared.state.lock();
            if state.scanning {
                debug!(device_id = %self.shared.device_id, "Already scanning");
                return Ok(());
            }
            state.seen.clear();
            state.scanning = true;
            state.stop_clear_timer();
            state.clear_task = Some(spawn_clear_timer(&self.shared));
        }

        if let Err(e) = self.send(&at::start_observer(rssi_threshold)).await {
            {
                let mut state = self.shared.state.lock();
                state.scanning = false;
                state.stop_clear_timer();
            }
            self.shared.emit_error(&e);
            return Err(e);
        }

        info!(device_id = %self.shared.device_id, rssi = %rssi_threshold, "Scan started");
        Ok(())
    }

    /// Stops the observer. A no-op when not scanning.
    ///
    /// `scanning` is cleared even if the write fails.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ChannelWrite`] on write failure.
    pub async fn stop_scan(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.scanning {
                return Ok(());
            }
            state.scanning = false;
            state.stop_clear_timer();
        }

        if let Err(e) = self.send(&at::stop_observer()).await {
            self.shared.emit_error(&e);
            return Err(e);
        }

        info!(device_id = %self.shared.device_id, "Scan stopped");
        Ok(())
    }

    /// Enables reporting and emits one catch-up event for the sightings
    /// still in the retention window.
    ///
    /// When `rssi_threshold` is given and the device is not scanning yet,
    /// scanning starts first. Enabling an already enabled report does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Propagates [`ScanDevice::start_scan`] failures.
    pub async fn start_report(&self, rssi_threshold: Option<&str>) -> Result<()> {
        if let Some(rssi) = rssi_threshold {
            if !self.is_scanning() {
                self.start_scan(rssi).await?;
            }
        }

        let names = {
            let mut state = self.shared.state.lock();
            if state.report_enabled {
                return Ok(());
            }
            state.report_enabled = true;
            state.purge(Instant::now());

            let mut names: Vec<&'static str> = Vec::new();
            let mut codes = Vec::new();
            for sighting in &state.recent {
                if !names.contains(&sighting.name) {
                    names.push(sighting.name);
                    codes.push(sighting.code.clone());
                }
            }
            state.seen.extend(codes);
            names
        };

        debug!(device_id = %self.shared.device_id, buffered = names.len(), "Report enabled");
        if !names.is_empty() {
            self.shared.emit_detection(names.join(","));
        }
        Ok(())
    }

    /// Disables reporting. Sightings keep being buffered.
    pub fn stop_report(&self) {
        self.shared.state.lock().report_enabled = false;
        debug!(device_id = %self.shared.device_id, "Report disabled");
    }

    /// Stops scanning (best effort), closes the channel and emits
    /// [`DeviceEvent::Disconnected`] if it has not fired yet.
    pub async fn disconnect(&self) {
        if self.is_scanning() {
            if let Err(e) = self.stop_scan().await {
                debug!(device_id = %self.shared.device_id, error = %e, "Stop before disconnect failed");
            }
        }
        self.writer.lock().await.close().await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.notify_disconnected();
    }
}

impl Drop for ScanDevice {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        self.shared.state.lock().stop_clear_timer();
    }
}

// =============================================================================
// TESTS
// =============================================================================
