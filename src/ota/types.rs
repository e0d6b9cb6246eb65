//! OTA command record types

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Overall status of a command across all of its targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Pending,
    Sent,
    Partial,
    Acked,
    Failed,
}

impl CommandStatus {
    /// Derive the overall status from per-target statuses
    ///
    /// - any target still pending: `pending`
    /// - every target acked: `acked`
    /// - every target failed: `failed`
    /// - no failures: `sent`
    /// - failures mixed with successes: `partial`
    #[must_use]
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TargetStatus>,
    {
        let (mut total, mut pending, mut acked, mut failed) = (0usize, 0usize, 0usize, 0usize);
        for status in statuses {
            total += 1;
            match status {
                TargetStatus::Pending => pending += 1,
                TargetStatus::Acked => acked += 1,
                TargetStatus::Failed => failed += 1,
                TargetStatus::Sent => {}
            }
        }

        if total == 0 || pending > 0 {
            Self::Pending
        } else if acked == total {
            Self::Acked
        } else if failed == total {
            Self::Failed
        } else if failed == 0 {
            Self::Sent
        } else {
            Self::Partial
        }
    }

    /// Whether at least one target may still acknowledge
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Sent | Self::Partial)
    }
}

/// Delivery/acknowledgement status of one target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    Pending,
    Sent,
    Acked,
    Failed,
}

/// Why delivery to a target failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No live session, or presence reports the device offline
    DeviceOffline,
    /// The session refused the frame
    SendFailed,
}

/// Why a whole command failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFailure {
    AllTargetsFailed,
}

/// Per-target state of a command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub status: TargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckRecord>,
}

impl TargetState {
    /// Frame accepted by the target's session
    #[must_use]
    pub fn sent(now: &str) -> Self {
        Self {
            status: TargetStatus::Sent,
            last_update: Some(now.to_string()),
            ..Self::default()
        }
    }

    /// Delivery not possible or refused
    #[must_use]
    pub fn failed(reason: FailureReason, now: &str) -> Self {
        Self {
            status: TargetStatus::Failed,
            reason: Some(reason),
            last_update: Some(now.to_string()),
            ack: None,
        }
    }
}

/// An acknowledgement received from a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckRecord {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub payload: Value,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

/// Resolved target list of a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default)]
    pub device_ids: Vec<String>,
}

/// A dispatched command and its delivery state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub targets: Targets,
    #[serde(default)]
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CommandFailure>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_update: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub per_device: IndexMap<String, TargetState>,
    #[serde(default)]
    pub acks: Vec<AckRecord>,
    /// Most recent acknowledgement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckRecord>,
}

impl Command {
    /// New pending command for `targets`
    #[must_use]
    pub fn pending(command_id: String, request: &CommandRequest, targets: Vec<String>, now: &str) -> Self {
        let per_device = targets
            .iter()
            .map(|sid| (sid.clone(), TargetState::default()))
            .collect();
        Self {
            command_id,
            command: request.verb(),
            targets: Targets {
                device_ids: targets,
            },
            status: CommandStatus::Pending,
            reason: None,
            created_at: now.to_string(),
            last_update: now.to_string(),
            payload: request.payload(),
            per_device,
            acks: Vec::new(),
            ack: None,
        }
    }

    /// Whether `identity` is one of the resolved targets
    #[must_use]
    pub fn targets(&self, identity: &str) -> bool {
        self.targets.device_ids.iter().any(|sid| sid == identity)
    }

    /// Timestamp used to order commands by recency
    #[must_use]
    pub fn touched_at(&self) -> &str {
        if self.last_update.is_empty() {
            &self.created_at
        } else {
            &self.last_update
        }
    }

    /// Recompute the overall status from the resolved targets
    pub fn refresh_status(&mut self) {
        let statuses = self.targets.device_ids.iter().map(|sid| {
            self.per_device
                .get(sid)
                .map_or(TargetStatus::Pending, |state| state.status)
        });
        self.status = CommandStatus::aggregate(statuses);
        self.reason = (self.status == CommandStatus::Failed).then_some(CommandFailure::AllTargetsFailed);
    }

    /// Record fan-out outcomes
    ///
    /// Targets that already moved past `pending` (an ack that raced the
    /// fan-out) keep their state.
    pub fn settle(&mut self, outcomes: Vec<(String, TargetState)>, now: &str) {
        for (sid, outcome) in outcomes {
            let state = self.per_device.entry(sid).or_default();
            if state.status == TargetStatus::Pending {
                *state = outcome;
            }
        }
        self.refresh_status();
        self.last_update = now.to_string();
    }

    /// Attach an acknowledgement
    ///
    /// The acknowledging target becomes `acked`; the ack is appended to the
    /// history either way. Overall status becomes `acked` once every target
    /// has acked and is otherwise left as it was.
    pub fn apply_ack(&mut self, ack: AckRecord, now: &str) {
        if self.targets(&ack.sensor_id) {
            let state = self.per_device.entry(ack.sensor_id.clone()).or_default();
            state.status = TargetStatus::Acked;
            state.reason = None;
            state.ack = Some(ack.clone());
            state.last_update = Some(now.to_string());
        }
        self.acks.push(ack.clone());
        self.ack = Some(ack);

        let all_acked = self.targets.device_ids.iter().all(|sid| {
            self.per_device
                .get(sid)
                .is_some_and(|state| state.status == TargetStatus::Acked)
        });
        if all_acked {
            self.status = CommandStatus::Acked;
            self.reason = None;
        }
        self.last_update = now.to_string();
    }
}

/// A dispatch request as received from the admin surface
///
/// Arbitrary fields are forwarded to devices verbatim. Recognised fields:
/// `command_id`, `command`/`action`, `targets.device_ids` and the legacy
/// single-target `sensor_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandRequest(pub Map<String, Value>);

impl From<Map<String, Value>> for CommandRequest {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl CommandRequest {
    /// Request from a JSON value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `value` is not an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            _ => Err(Error::validation("command must be a JSON object")),
        }
    }

    /// Caller-supplied command id, if any
    #[must_use]
    pub fn command_id(&self) -> Option<String> {
        self.0
            .get("command_id")
            .and_then(identity_of)
    }

    /// Command verb from `command` or `action`
    #[must_use]
    pub fn verb(&self) -> Option<String> {
        ["command", "action"]
            .iter()
            .filter_map(|key| self.0.get(*key))
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(ToString::to_string))
    }

    /// Resolve the ordered, de-duplicated target list
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if neither `targets.device_ids` nor
    /// `sensor_id` yields an identity
    pub fn resolve_targets(&self) -> Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        let listed = self
            .0
            .get("targets")
            .and_then(|t| t.get("device_ids"))
            .and_then(Value::as_array);
        for sid in listed.into_iter().flatten().filter_map(identity_of) {
            if !resolved.contains(&sid) {
                resolved.push(sid);
            }
        }

        if resolved.is_empty() {
            if let Some(sid) = self.0.get("sensor_id").and_then(identity_of) {
                resolved.push(sid);
            }
        }

        if resolved.is_empty() {
            return Err(Error::validation(
                "targets.device_ids (or sensor_id) is required to send OTA command",
            ));
        }
        Ok(resolved)
    }

    /// Fields persisted with the command (everything but the legacy `sensor_id`)
    #[must_use]
    pub fn payload(&self) -> Map<String, Value> {
        let mut fields = self.0.clone();
        fields.remove("sensor_id");
        fields
    }

    /// Fields forwarded to each device, without keys the frame sets itself
    #[must_use]
    pub fn frame_fields(&self) -> Map<String, Value> {
        let mut fields = self.0.clone();
        for key in ["type", "command_id", "sensor_id"] {
            fields.remove(key);
        }
        fields
    }
}

/// Identity from a string or number value; blank strings are rejected
fn identity_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
