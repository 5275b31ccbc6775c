//! JSON envelopes exchanged with the host.
//!
//! Requests are `{"c": <command code>, "d": {...}}`; responses and events are
//! `{"t": <type code>, "d": {...}}`. Both transports carry the same
//! envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use utoipa::ToSchema;

use crate::device::Detection;
use crate::error::{BridgeError, Result};
use crate::fleet::ConnectionStats;

/// Command codes accepted in `c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum CommandCode {
    /// Start scanning and reporting.
    Start = 1,
    /// Stop reporting and scanning.
    Stop = 2,
    /// Read-only status probe.
    Heartbeat = 3,
}

impl TryFrom<i64> for CommandCode {
    type Error = BridgeError;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            3 => Ok(Self::Heartbeat),
            other => Err(BridgeError::UnknownCommand(other)),
        }
    }
}

/// Type codes sent in `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Command acknowledgement.
    Status = 1,
    /// Failure.
    Error = 2,
    /// Manufacturer sighting.
    Device = 3,
    /// Liveness and fleet status.
    Heartbeat = 4,
}

/// Host request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"c": 1, "d": {"rssi": "-60"}}))]
pub struct RequestEnvelope {
    /// Command code: 1 start, 2 stop, 3 heartbeat.
    pub c: i64,
    /// Command data. `rssi` and `did` are recognised; other keys are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub d: Option<Value>,
}

/// Response or event sent to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"t": 3, "d": {"mf": "Apple, Inc."}}))]
pub struct ResponseEnvelope {
    /// Type code: 1 status, 2 error, 3 device, 4 heartbeat.
    pub t: u8,
    /// Payload.
    #[schema(value_type = Object)]
    pub d: Value,
}

impl ResponseEnvelope {
    fn new(kind: EventType, d: Value) -> Self {
        Self { t: kind as u8, d }
    }

    /// `{"t":1,"d":{"msg":...}}`.
    #[must_use]
    pub fn status(msg: &str) -> Self {
        Self::new(EventType::Status, json!({ "msg": msg }))
    }

    /// `{"t":2,"d":{"msg","code","suggestion"?}}`.
    #[must_use]
    pub fn error(err: &BridgeError) -> Self {
        let mut d = Map::new();
        d.insert("msg".into(), Value::String(err.to_string()));
        d.insert("code".into(), Value::String(err.error_code().to_string()));
        if let Some(suggestion) = err.suggestion() {
            d.insert("suggestion".into(), Value::String(suggestion.to_string()));
        }
        Self::new(EventType::Error, Value::Object(d))
    }

    /// `{"t":3,"d":{"mf","did","sp","timestamp"}}`.
    #[must_use]
    pub fn device(detection: &Detection) -> Self {
        Self::new(
            EventType::Device,
            json!({
                "mf": detection.manufacturer,
                "did": detection.device_id,
                "sp": detection.serial_path,
                "timestamp": detection.observed_at.timestamp_millis(),
            }),
        )
    }

    /// Periodic `{"t":4,"d":{"run":...}}`.
    #[must_use]
    pub fn heartbeat(run: bool) -> Self {
        Self::new(EventType::Heartbeat, json!({ "run": run }))
    }

    /// Status probe reply: heartbeat plus the connection counts.
    #[must_use]
    pub fn status_probe(stats: &ConnectionStats) -> Self {
        Self::new(
            EventType::Heartbeat,
            json!({
                "run": stats.connected > 0,
                "total": stats.total,
                "connected": stats.connected,
                "failed": stats.failed,
                "reconnecting": stats.reconnecting,
            }),
        )
    }

    /// Serialized envelope.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"t\":{},\"d\":{{\"msg\":\"serialization failed\"}}}}", EventType::Error as u8)
        })
    }
}

/// A decoded host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start scanning and reporting.
    Start {
        /// Host-provided RSSI threshold.
        rssi: Option<String>,
        /// Target device, or all.
        device_id: Option<String>,
    },
    /// Stop reporting and scanning.
    Stop {
        /// Target device, or all.
        device_id: Option<String>,
    },
    /// Read-only status probe.
    Heartbeat,
}

impl Command {
    /// Decodes a raw JSON request.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidRequest`] for malformed JSON or data fields,
    /// [`BridgeError::UnknownCommand`] for unsupported codes.
    pub fn decode(payload: &str) -> Result<Self> {
        let envelope: RequestEnvelope = serde_json::from_str(payload)
            .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
        Self::from_envelope(&envelope)
    }

    /// Decodes an already parsed request.
    ///
    /// # Errors
    ///
    /// As for [`Command::decode`].
    pub fn from_envelope(envelope: &RequestEnvelope) -> Result<Self> {
        let code = CommandCode::try_from(envelope.c)?;
        let empty = Map::new();
        let data = match &envelope.d {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(BridgeError::InvalidRequest(
                    "\"d\" must be an object".to_string(),
                ))
            }
        };

        Ok(match code {
            CommandCode::Start => Self::Start {
                rssi: rssi_field(data)?,
                device_id: string_field(data, "did")?,
            },
            CommandCode::Stop => Self::Stop {
                device_id: string_field(data, "did")?,
            },
            CommandCode::Heartbeat => Self::Heartbeat,
        })
    }
}

fn string_field(data: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(BridgeError::InvalidRequest(format!(
            "\"{key}\" must be a string"
        ))),
    }
}

// Hosts send the threshold both as "-60" and as -60.
fn rssi_field(data: &Map<String, Value>) -> Result<Option<String>> {
    match data.get("rssi") {
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        _ => string_field(data, "rssi"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_decode_start() {
        assert_eq!(
            Command::decode(r#"{"c":1,"d":{"rssi":"-60"}}"#).unwrap(),
            Command::Start {
                rssi: Some("-60".into()),
                device_id: None
            }
        );
    }

    #[test]
    fn test_decode_start_with_numeric_rssi_and_target() {
        assert_eq!(
            Command::decode(r#"{"c":1,"d":{"rssi":-72,"did":"left","extra":true}}"#).unwrap(),
            Command::Start {
                rssi: Some("-72".into()),
                device_id: Some("left".into())
            }
        );
    }

    #[test]
    fn test_decode_without_data() {
        assert_eq!(
            Command::decode(r#"{"c":2}"#).unwrap(),
            Command::Stop { device_id: None }
        );
        assert_eq!(Command::decode(r#"{"c":3,"d":null}"#).unwrap(), Command::Heartbeat);
    }

    #[test]
    fn test_unknown_command() {
        let err = Command::decode(r#"{"c":99}"#).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownCommand(99)));
    }

    #[test]
    fn test_malformed_requests() {
        for payload in ["", "not json", "{}", r#"{"c":"1"}"#, r#"{"c":1,"d":[1]}"#, r#"{"c":1,"d":{"did":5}}"#] {
            assert!(
                matches!(Command::decode(payload), Err(BridgeError::InvalidRequest(_))),
                "{payload}"
            );
        }
    }

    #[test]
    fn test_error_envelope() {
        let value: Value =
            serde_json::from_str(&ResponseEnvelope::error(&BridgeError::UnknownCommand(99)).to_json())
                .unwrap();
        assert_eq!(value["t"], 2);
        assert_eq!(value["d"]["code"], "UNKNOWN_COMMAND");
        assert!(value["d"]["msg"].as_str().unwrap().contains("Unknown command"));
        assert!(value["d"]["suggestion"].is_string());

        let bare = ResponseEnvelope::error(&BridgeError::ShuttingDown);
        assert!(bare.d.get("suggestion").is_none());
    }

    #[test]
    fn test_device_envelope() {
        let detection = Detection {
            device_id: "left".into(),
            serial_path: "/dev/ttyUSB0".into(),
            manufacturer: "Apple, Inc.".into(),
            observed_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        };
        let envelope = ResponseEnvelope::device(&detection);
        assert_eq!(envelope.t, 3);
        assert_eq!(
            envelope.d,
            json!({"mf": "Apple, Inc.", "did": "left", "sp": "/dev/ttyUSB0", "timestamp": 1_700_000_000_123_i64})
        );
    }

    #[test]
    fn test_heartbeat_envelopes() {
        assert_eq!(ResponseEnvelope::heartbeat(true).to_json(), r#"{"t":4,"d":{"run":true}}"#);

        let stats = ConnectionStats {
            total: 2,
            connected: 0,
            failed: 1,
            reconnecting: 1,
        };
        let probe = ResponseEnvelope::status_probe(&stats);
        assert_eq!(probe.d["run"], false);
        assert_eq!(probe.d["failed"], 1);
    }
}
