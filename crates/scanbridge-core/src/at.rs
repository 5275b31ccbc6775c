//! AT command builders for the serial BLE observer modules.
//!
//! Every command except the command-mode sentinel ends with
//! [`LINE_TERMINATOR`]. RSSI thresholds are passed through verbatim; the
//! module rejects values it does not understand.

/// Terminator appended to every AT command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Sentinel that switches the module from data mode to command mode.
/// Sent without a terminator.
pub const COMMAND_MODE_SENTINEL: &str = "+++";

const PREFIX: &str = "AT+";
const RESTART: &str = "RESTART";
const SET_ROLE: &str = "ROLE=1";
const START_OBSERVER: &str = "OBSERVER=1,4,,,";
const STOP_OBSERVER: &str = "OBSERVER=0";

fn command(body: &str) -> String {
    format!("{PREFIX}{body}{LINE_TERMINATOR}")
}

/// `+++`, no terminator.
#[must_use]
pub fn enter_command_mode() -> String {
    COMMAND_MODE_SENTINEL.to_string()
}

/// `AT+RESTART`.
#[must_use]
pub fn restart() -> String {
    command(RESTART)
}

/// `AT+ROLE=1`: single-master role, required before observing.
#[must_use]
pub fn set_role() -> String {
    command(SET_ROLE)
}

/// `AT+OBSERVER=1,4,,,<rssi>`.
#[must_use]
pub fn start_observer(rssi_threshold: &str) -> String {
    command(&format!("{START_OBSERVER}{rssi_threshold}"))
}

/// `AT+OBSERVER=0`.
#[must_use]
pub fn stop_observer() -> String {
    command(STOP_OBSERVER)
}
