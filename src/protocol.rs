//! WebSocket wire protocol
//!
//! Frames are JSON text messages. Inbound frames are discriminated by their
//! `type` field; outbound frames are either typed events, status replies or
//! error replies.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::devices::{Device, RegisterFields};
use crate::ota::AckRecord;
use crate::{Error, Result};

/// Frame sent from the gateway to a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Typed event (`{"type": ...}`)
    Event(Event),
    /// Status reply to the sender of a frame
    Reply {
        status: ReplyStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        sensor_id: Option<String>,
    },
    /// Error reply to the sender of a frame
    Error { error: String },
}

impl Outbound {
    /// Bare status reply
    #[must_use]
    pub const fn reply(status: ReplyStatus) -> Self {
        Self::Reply {
            status,
            sensor_id: None,
        }
    }

    /// Registration confirmation
    #[must_use]
    pub fn registered(sensor_id: impl Into<String>) -> Self {
        Self::Reply {
            status: ReplyStatus::Registered,
            sensor_id: Some(sensor_id.into()),
        }
    }

    /// Error reply
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Reply for a frame whose `type` is not recognised
    #[must_use]
    pub fn unknown_type() -> Self {
        Self::error("unknown_message_type")
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Event> for Outbound {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Status carried by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Registered,
    AckReceived,
    ConfigReceived,
    HealthReceived,
}

/// Typed events pushed to sessions
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A device came online or went offline
    DeviceStatus {
        sensor_id: String,
        online: bool,
        device: Option<Device>,
        timestamp: String,
    },
    /// An acknowledgement was received
    Ack(AckRecord),
    /// A configuration report was received
    Config(TelemetryEvent),
    /// A health report was received
    Health(TelemetryEvent),
    /// Command pushed to a single target
    OtaCommand(OtaCommandFrame),
    Pong,
}

/// Echo of a configuration or health report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub sensor_id: String,
    pub command_id: Option<String>,
    pub timestamp: String,
    pub payload: Value,
}

/// Command frame delivered to one device
///
/// Carries every field of the original request alongside the command id and
/// the receiving device's identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaCommandFrame {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub command_id: String,
    pub sensor_id: String,
}

impl OtaCommandFrame {
    /// Frame for `sensor_id`; request keys that collide with frame keys are dropped
    #[must_use]
    pub fn new(mut fields: Map<String, Value>, command_id: &str, sensor_id: &str) -> Self {
        for key in ["type", "command_id", "sensor_id"] {
            fields.remove(key);
        }
        Self {
            fields,
            command_id: command_id.to_string(),
            sensor_id: sensor_id.to_string(),
        }
    }
}

/// Frame received from a session
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Register(RegisterFields),
    Ack(ReportFrame),
    Config(ReportFrame),
    Health(ReportFrame),
    Ping,
    /// Any other `type`, including a missing one
    Unknown(Option<String>),
}

impl Inbound {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a JSON object, or a `register` frame
    /// carries fields of the wrong type
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(data) = value else {
            return Err(Error::validation("message must be a JSON object"));
        };

        let kind = data.get("type").and_then(Value::as_str).map(ToString::to_string);
        let frame = match kind.as_deref() {
            Some("register") => Self::Register(serde_json::from_value(Value::Object(data))?),
            Some("ack") => Self::Ack(ReportFrame::new(data)),
            Some("config") => Self::Config(ReportFrame::new(data)),
            Some("health") => Self::Health(ReportFrame::new(data)),
            Some("ping") => Self::Ping,
            _ => Self::Unknown(kind),
        };
        Ok(frame)
    }
}

/// An `ack`, `config` or `health` frame
///
/// Identity, command id and status may sit at the top level or inside
/// `payload`; the accessors resolve them.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportFrame {
    data: Map<String, Value>,
    payload: Value,
}

impl ReportFrame {
    fn new(mut data: Map<String, Value>) -> Self {
        let payload = match data.remove("payload") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(other) => other,
        };
        Self { data, payload }
    }

    /// Raw `payload` (an empty object when absent)
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Reporting identity: top level, then payload, then `session`
    #[must_use]
    pub fn sensor_id(&self, session: Option<&str>) -> Option<String> {
        self.top("sensor_id")
            .or_else(|| self.inner("sensor_id"))
            .or_else(|| session.filter(|s| !s.is_empty()).map(ToString::to_string))
    }

    /// Command id: top level, then payload
    #[must_use]
    pub fn command_id(&self) -> Option<String> {
        self.top("command_id").or_else(|| self.inner("command_id"))
    }

    /// Status: payload, then top level, else `unknown`
    #[must_use]
    pub fn status(&self) -> String {
        self.inner("status")
            .or_else(|| self.top("status"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Device-reported time: payload `time`, then `timestamp`
    #[must_use]
    pub fn device_time(&self) -> Option<String> {
        self.inner("time").or_else(|| self.inner("timestamp"))
    }

    /// Reported error text
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner("error")
    }

    /// Reported configuration body
    #[must_use]
    pub fn config(&self) -> Option<Value> {
        self.payload
            .get("config")
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn top(&self, key: &str) -> Option<String> {
        self.data.get(key).and_then(scalar)
    }

    fn inner(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(scalar)
    }
}

/// Non-empty string, or a number rendered as text
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
