//! Device record types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Durable state of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_name: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_configuration: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_health: Option<Snapshot>,
    /// Fields written by other tools; carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    /// Minimal record for a device first seen outside registration
    #[must_use]
    pub fn seen(identity: &str, now: &str) -> Self {
        Self {
            sensor_id: identity.to_string(),
            online: true,
            last_seen: Some(now.to_string()),
            ..Self::default()
        }
    }

    /// Whether `identity` addresses this device by sensor id or device id
    #[must_use]
    pub fn matches(&self, identity: &str) -> bool {
        self.sensor_id == identity || self.device_id.as_deref() == Some(identity)
    }

    /// Refresh presence as online
    pub fn touch(&mut self, now: &str) {
        self.online = true;
        self.last_seen = Some(now.to_string());
    }
}

/// Latest configuration or health report from a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub command_id: Option<String>,
    pub status: String,
    pub received_at: String,
    pub device_time: Option<String>,
    pub config: Option<Value>,
    pub error: Option<String>,
}

/// Fields of a reported snapshot before it is stamped
#[derive(Debug, Clone, Default)]
pub struct SnapshotUpdate {
    pub command_id: Option<String>,
    pub status: String,
    pub body: Option<Value>,
    pub device_time: Option<String>,
    /// Defaults to the time of the write
    pub received_at: Option<String>,
    pub error: Option<String>,
}

impl SnapshotUpdate {
    pub(crate) fn into_snapshot(self, now: &str) -> Snapshot {
        Snapshot {
            command_id: self.command_id,
            status: self.status,
            received_at: self.received_at.unwrap_or_else(|| now.to_string()),
            device_time: self.device_time,
            config: self.body,
            error: self.error,
        }
    }
}

/// Identity and naming fields carried by a `register` handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFields {
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub sensor_name: Option<String>,
}

impl RegisterFields {
    /// Fields for a device identified only by `sensor_id`
    #[must_use]
    pub fn sensor(sensor_id: &str) -> Self {
        Self {
            sensor_id: Some(sensor_id.to_string()),
            ..Self::default()
        }
    }
}

/// Admin pre-registration of a device that has not connected yet
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionFields {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub sensor_name: Option<String>,
}

/// The value if present and not blank
pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn matches_either_identity() {
        let device = Device {
            sensor_id: "sensor-1".into(),
            device_id: Some("dev-9".into()),
            ..Device::default()
        };
        assert!(device.matches("sensor-1"));
        assert!(device.matches("dev-9"));
        assert!(!device.matches("other"));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({"sensor_id": "S1", "online": false, "model": "x200"});
        let device: Device = serde_json::from_value(raw).unwrap();
        assert_eq!(device.extra.get("model"), Some(&json!("x200")));

        let back = serde_json::to_value(&device).unwrap();
        assert_eq!(back["model"], json!("x200"));
    }

    #[test]
    fn non_empty_filters_blank() {
        assert_eq!(non_empty(Some("  ")), None);
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some("Acme")), Some("Acme".to_string()));
    }
}
