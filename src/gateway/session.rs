//! Per-connection message handling

use uuid::Uuid;

use super::Gateway;
use crate::connections::{SessionHandle, except};
use crate::devices::{RegisterFields, SnapshotUpdate};
use crate::ota::AckRecord;
use crate::protocol::{Event, Inbound, Outbound, ReplyStatus, ReportFrame, TelemetryEvent};
use crate::{Error, Result, timestamp};

/// Kind of telemetry report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Telemetry {
    Config,
    Health,
}

impl Telemetry {
    const fn name(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Health => "health",
        }
    }
}

/// One device connection
///
/// Created unregistered; a `register` frame binds it to an identity. Cleanup
/// (registry release, offline marking, offline broadcast) runs exactly once:
/// through [`DeviceSession::close`] or, if the session is dropped without
/// closing, from a task spawned by `Drop`.
#[derive(Debug)]
pub struct DeviceSession {
    gateway: Gateway,
    handle: SessionHandle,
    identity: Option<String>,
}

impl DeviceSession {
    /// Session writing replies to `handle`
    #[must_use]
    pub const fn new(gateway: Gateway, handle: SessionHandle) -> Self {
        Self {
            gateway,
            handle,
            identity: None,
        }
    }

    /// Id of the underlying session handle
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.handle.id()
    }

    /// Identity bound by the last successful `register`
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Handle one inbound text frame
    ///
    /// Malformed frames, unknown kinds and rejected registrations are answered
    /// on this session and leave it open.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable or this session's socket has
    /// gone away; the caller should then close the session
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(session = %self.id(), error = %e, "rejected frame");
                return self.reply(Outbound::error(format!("invalid message: {e}"))).await;
            }
        };

        match self.dispatch(inbound).await {
            Err(Error::Validation(message)) => self.reply(Outbound::error(message)).await,
            other => other,
        }
    }

    async fn dispatch(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Register(fields) => self.on_register(fields).await,
            Inbound::Ack(frame) => self.on_ack(&frame).await,
            Inbound::Config(frame) => self.on_telemetry(Telemetry::Config, &frame).await,
            Inbound::Health(frame) => self.on_telemetry(Telemetry::Health, &frame).await,
            Inbound::Ping => {
                if let Some(identity) = &self.identity {
                    self.gateway.presence().mark_online(identity).await?;
                }
                self.reply(Event::Pong.into()).await
            }
            Inbound::Unknown(kind) => {
                tracing::debug!(session = %self.id(), kind = ?kind, "unknown message type");
                self.reply(Outbound::unknown_type()).await
            }
        }
    }

    async fn on_register(&mut self, fields: RegisterFields) -> Result<()> {
        let device = self.gateway.presence().register(fields).await?;
        let sensor_id = device.sensor_id.clone();

        // Re-registering under another identity releases the old one
        if let Some(previous) = self.identity.take() {
            if previous != sensor_id {
                release(&self.gateway, &previous, self.id()).await?;
            }
        }

        if let Some(replaced) = self
            .gateway
            .connections()
            .connect(&sensor_id, self.handle.clone())
            .await
        {
            if replaced.id() != self.id() {
                tracing::info!(sensor_id = %sensor_id, previous = %replaced.id(), "session superseded");
            }
        }
        self.identity = Some(sensor_id.clone());
        tracing::info!(sensor_id = %sensor_id, session = %self.id(), "device registered");

        let status = Event::DeviceStatus {
            sensor_id: sensor_id.clone(),
            online: true,
            device: Some(device),
            timestamp: timestamp(),
        };
        self.gateway
            .connections()
            .broadcast(&status.into(), &except(&sensor_id))
            .await;

        self.reply(Outbound::registered(sensor_id)).await
    }

    async fn on_ack(&self, frame: &ReportFrame) -> Result<()> {
        let Some(sensor_id) = frame.sensor_id(self.identity()) else {
            return self.reply(Outbound::error("sensor_id missing in ack")).await;
        };

        let mut ack = AckRecord {
            command_id: frame.command_id(),
            sensor_id: sensor_id.clone(),
            status: frame.status(),
            timestamp: timestamp(),
            payload: frame.payload().clone(),
        };
        self.gateway.acks().append(&ack).await?;

        let dispatcher = self.gateway.dispatcher();
        match ack.command_id.clone() {
            Some(command_id) => {
                dispatcher.mark_acked(&command_id, ack.clone()).await?;
            }
            None => {
                ack.command_id = dispatcher.mark_latest_acked(&sensor_id, ack.clone()).await?;
            }
        }
        self.gateway.presence().mark_online(&sensor_id).await?;
        tracing::info!(
            sensor_id = %sensor_id,
            command_id = ack.command_id.as_deref().unwrap_or("-"),
            status = %ack.status,
            "ack received"
        );

        self.gateway
            .connections()
            .broadcast(&Event::Ack(ack).into(), &except(&sensor_id))
            .await;
        self.reply(Outbound::reply(ReplyStatus::AckReceived)).await
    }

    async fn on_telemetry(&self, kind: Telemetry, frame: &ReportFrame) -> Result<()> {
        let Some(sensor_id) = frame.sensor_id(self.identity()) else {
            return self
                .reply(Outbound::error(format!("sensor_id missing in {}", kind.name())))
                .await;
        };

        let presence = self.gateway.presence();
        let reply = match kind {
            Telemetry::Config => {
                presence
                    .set_latest_configuration(&sensor_id, snapshot(frame, frame.config()))
                    .await?;
                ReplyStatus::ConfigReceived
            }
            Telemetry::Health => {
                presence
                    .set_latest_health(&sensor_id, snapshot(frame, Some(frame.payload().clone())))
                    .await?;
                ReplyStatus::HealthReceived
            }
        };
        tracing::debug!(sensor_id = %sensor_id, kind = kind.name(), "telemetry received");

        let report = TelemetryEvent {
            sensor_id: sensor_id.clone(),
            command_id: frame.command_id(),
            timestamp: timestamp(),
            payload: frame.payload().clone(),
        };
        let echo = match kind {
            Telemetry::Config => Event::Config(report),
            Telemetry::Health => Event::Health(report),
        };
        self.gateway
            .connections()
            .broadcast(&echo.into(), &except(&sensor_id))
            .await;
        self.reply(Outbound::reply(reply)).await
    }

    async fn reply(&self, message: Outbound) -> Result<()> {
        self.handle.push(message).await
    }

    /// Run disconnect cleanup and wait for it
    ///
    /// Cleanup runs on its own task, so it completes even if the caller is
    /// cancelled while waiting.
    pub async fn close(mut self) {
        let Some(identity) = self.identity.take() else {
            return;
        };
        let task = tokio::spawn(cleanup(self.gateway.clone(), identity, self.id()));
        if let Err(e) = task.await {
            tracing::warn!(session = %self.id(), error = %e, "disconnect cleanup task failed");
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Some(identity) = self.identity.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(sensor_id = %identity, "no runtime for disconnect cleanup");
            return;
        };
        runtime.spawn(cleanup(self.gateway.clone(), identity, self.id()));
    }
}

async fn cleanup(gateway: Gateway, identity: String, session_id: Uuid) {
    if let Err(e) = release(&gateway, &identity, session_id).await {
        tracing::warn!(sensor_id = %identity, error = %e, "disconnect cleanup failed");
    }
}

fn snapshot(frame: &ReportFrame, body: Option<serde_json::Value>) -> SnapshotUpdate {
    SnapshotUpdate {
        command_id: frame.command_id(),
        status: frame.status(),
        body,
        device_time: frame.device_time(),
        received_at: None,
        error: frame.error(),
    }
}

/// Drop `identity`'s mapping if it still belongs to `session_id`, then mark
/// the device offline and tell everyone else
///
/// A superseded session leaves presence to its replacement.
async fn release(gateway: &Gateway, identity: &str, session_id: Uuid) -> Result<()> {
    if !gateway.connections().release(identity, session_id).await {
        tracing::debug!(sensor_id = %identity, session = %session_id, "session already superseded");
        return Ok(());
    }

    let device = gateway.presence().mark_offline(identity).await?;
    let status = Event::DeviceStatus {
        sensor_id: identity.to_string(),
        online: false,
        device,
        timestamp: timestamp(),
    };
    gateway
        .connections()
        .broadcast(&status.into(), &except(identity))
        .await;
    tracing::info!(sensor_id = %identity, session = %session_id, "device disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    async fn registered(gateway: &Gateway, sensor_id: &str) -> (DeviceSession, mpsc::Receiver<Outbound>) {
        let (mut session, mut rx) = gateway.open_session();
        session
            .handle_text(&json!({"type": "register", "sensor_id": sensor_id}).to_string())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::registered(sensor_id)));
        (session, rx)
    }

    #[tokio::test]
    async fn register_binds_identity() {
        let gateway = Gateway::in_memory();
        let (session, _rx) = registered(&gateway, "S1").await;

        assert_eq!(session.identity(), Some("S1"));
        assert!(gateway.connections().is_connected("S1").await);
        assert!(gateway.presence().is_online("S1").await.unwrap());
    }

    #[tokio::test]
    async fn register_without_sensor_id_is_answered_and_session_continues() {
        let gateway = Gateway::in_memory();
        let (mut session, mut rx) = gateway.open_session();

        session.handle_text(r#"{"type":"register"}"#).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Outbound::Error { .. })));
        assert!(session.identity().is_none());

        session.handle_text(r#"{"type":"ping"}"#).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::Pong.into()));
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let gateway = Gateway::in_memory();
        let (mut session, mut rx) = gateway.open_session();

        session.handle_text("{not json").await.unwrap();
        let Some(Outbound::Error { error }) = rx.recv().await else {
            panic!("expected error reply");
        };
        assert!(error.starts_with("invalid message"));
    }

    #[tokio::test]
    async fn ack_without_identity_is_rejected() {
        let gateway = Gateway::in_memory();
        let (mut session, mut rx) = gateway.open_session();

        session.handle_text(r#"{"type":"ack","payload":{}}"#).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::error("sensor_id missing in ack")));
        assert!(gateway.acks().list().await.unwrap().is_empty());

        session.handle_text(r#"{"type":"health"}"#).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::error("sensor_id missing in health")));
    }

    #[tokio::test]
    async fn reregister_under_new_identity_releases_old_one() {
        let gateway = Gateway::in_memory();
        let (mut session, mut rx) = registered(&gateway, "old").await;

        session
            .handle_text(r#"{"type":"register","sensor_id":"new"}"#)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::registered("new")));

        assert!(!gateway.connections().is_connected("old").await);
        assert!(!gateway.presence().is_online("old").await.unwrap());
        assert!(gateway.connections().is_connected("new").await);
    }

    #[tokio::test]
    async fn close_marks_offline_once() {
        let gateway = Gateway::in_memory();
        let (session, _rx) = registered(&gateway, "S1").await;

        session.close().await;
        assert!(!gateway.connections().is_connected("S1").await);
        assert!(!gateway.presence().is_online("S1").await.unwrap());
    }

    #[tokio::test]
    async fn drop_runs_cleanup() {
        let gateway = Gateway::in_memory();
        let (session, _rx) = registered(&gateway, "S1").await;

        drop(session);
        for _ in 0..50 {
            if !gateway.connections().is_connected("S1").await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!gateway.connections().is_connected("S1").await);
    }

    #[tokio::test]
    async fn cancelled_close_still_marks_offline() {
        let gateway = Gateway::in_memory();
        let (session, _rx) = registered(&gateway, "S1").await;
        let (_watcher, mut watcher_rx) = registered(&gateway, "W").await;

        let closing = tokio::spawn(session.close());
        tokio::task::yield_now().await;
        closing.abort();

        let mut announced = false;
        for _ in 0..100 {
            while let Ok(frame) = watcher_rx.try_recv() {
                announced |= matches!(
                    frame,
                    Outbound::Event(Event::DeviceStatus { ref sensor_id, online: false, .. })
                        if sensor_id == "S1"
                );
            }
            if announced {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(announced);
        assert!(!gateway.presence().is_online("S1").await.unwrap());
        assert!(!gateway.connections().is_connected("S1").await);
    }

    #[tokio::test]
    async fn superseded_session_close_keeps_device_online() {
        let gateway = Gateway::in_memory();
        let (first, _rx1) = registered(&gateway, "S1").await;
        let (_second, _rx2) = registered(&gateway, "S1").await;

        first.close().await;
        assert!(gateway.connections().is_connected("S1").await);
        assert!(gateway.presence().is_online("S1").await.unwrap());
    }
}
