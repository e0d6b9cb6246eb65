//! Command fan-out and acknowledgement correlation

use serde_json::{Map, Value};
use uuid::Uuid;

use super::types::{AckRecord, Command, CommandRequest, FailureReason, TargetState};
use crate::connections::ConnectionRegistry;
use crate::devices::PresenceRegistry;
use crate::protocol::{Event, OtaCommandFrame, Outbound};
use crate::store::Documents;
use crate::{Error, Result, timestamp};

/// Document key holding the command history
pub const COMMANDS_KEY: &str = "ota_logs.json";

/// Dispatches commands to connected devices and tracks their acknowledgements
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    docs: Documents,
    connections: ConnectionRegistry,
    presence: PresenceRegistry,
}

impl CommandDispatcher {
    /// Dispatcher persisting to `docs` and routing through `connections`
    #[must_use]
    pub const fn new(
        docs: Documents,
        connections: ConnectionRegistry,
        presence: PresenceRegistry,
    ) -> Self {
        Self {
            docs,
            connections,
            presence,
        }
    }

    /// Fan a command out to every resolved target
    ///
    /// The `pending` record is persisted before any frame is pushed. Each
    /// target is then attempted once, in order; a target that cannot be
    /// reached is recorded as failed and the rest are still attempted. The
    /// call never waits for acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no target resolves or the supplied
    /// `command_id` already exists, or a storage error
    pub async fn send_command(&self, request: CommandRequest) -> Result<Command> {
        let targets = request.resolve_targets()?;
        let command_id = request
            .command_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let pending = Command::pending(command_id.clone(), &request, targets.clone(), &timestamp());

        let inserted = self
            .docs
            .try_update_list(COMMANDS_KEY, |commands: &mut Vec<Command>| {
                if commands.iter().any(|c| c.command_id == command_id) {
                    return None;
                }
                commands.push(pending.clone());
                Some(())
            })
            .await?;
        if inserted.is_none() {
            return Err(Error::validation(format!(
                "command_id {command_id} already exists"
            )));
        }

        tracing::info!(
            command_id = %command_id,
            command = pending.command.as_deref().unwrap_or("-"),
            targets = targets.len(),
            "dispatching command"
        );

        let fields = request.frame_fields();
        let mut outcomes = Vec::with_capacity(targets.len());
        for sensor_id in &targets {
            let outcome = self.deliver(sensor_id, &command_id, &fields).await;
            outcomes.push((sensor_id.clone(), outcome));
        }

        let now = timestamp();
        let command = self
            .docs
            .update_list(COMMANDS_KEY, |commands: &mut Vec<Command>| {
                let found = commands.iter().position(|c| c.command_id == command_id);
                let idx = match found {
                    Some(idx) => idx,
                    None => {
                        commands.push(pending);
                        commands.len() - 1
                    }
                };
                commands[idx].settle(outcomes, &now);
                commands[idx].clone()
            })
            .await?;

        tracing::info!(command_id = %command_id, status = ?command.status, "command dispatched");
        Ok(command)
    }

    async fn deliver(
        &self,
        sensor_id: &str,
        command_id: &str,
        fields: &Map<String, Value>,
    ) -> TargetState {
        if !self.connections.is_connected(sensor_id).await {
            tracing::debug!(sensor_id = %sensor_id, command_id = %command_id, "target not connected");
            return TargetState::failed(FailureReason::DeviceOffline, &timestamp());
        }
        match self.presence.is_online(sensor_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(sensor_id = %sensor_id, command_id = %command_id, "target offline");
                return TargetState::failed(FailureReason::DeviceOffline, &timestamp());
            }
            Err(e) => {
                tracing::warn!(
                    sensor_id = %sensor_id,
                    command_id = %command_id,
                    error = %e,
                    "presence lookup failed, skipping target"
                );
                return TargetState::failed(FailureReason::SendFailed, &timestamp());
            }
        }

        let frame = OtaCommandFrame::new(fields.clone(), command_id, sensor_id);
        if self
            .connections
            .send(sensor_id, Outbound::from(Event::OtaCommand(frame)))
            .await
        {
            tracing::debug!(sensor_id = %sensor_id, command_id = %command_id, "command sent");
            TargetState::sent(&timestamp())
        } else {
            TargetState::failed(FailureReason::SendFailed, &timestamp())
        }
    }

    /// Attach `ack` to the command `command_id`
    ///
    /// Returns `None` without touching the store if the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn mark_acked(&self, command_id: &str, ack: AckRecord) -> Result<Option<Command>> {
        let now = timestamp();
        let updated = self
            .docs
            .try_update_list(COMMANDS_KEY, |commands: &mut Vec<Command>| {
                let command = commands.iter_mut().find(|c| c.command_id == command_id)?;
                command.apply_ack(ack, &now);
                Some(command.clone())
            })
            .await?;

        if updated.is_none() {
            tracing::debug!(command_id = %command_id, "ack for unknown command");
        }
        Ok(updated)
    }

    /// Attach `ack` to the most recent outstanding command targeting `identity`
    ///
    /// Candidates are commands in `pending`, `sent` or `partial` that list
    /// `identity` as a target. The most recently updated wins, ties going to
    /// the greatest command id. Returns the matched command id.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn mark_latest_acked(&self, identity: &str, ack: AckRecord) -> Result<Option<String>> {
        if identity.is_empty() {
            return Ok(None);
        }

        let now = timestamp();
        let matched = self
            .docs
            .try_update_list(COMMANDS_KEY, |commands: &mut Vec<Command>| {
                let command = commands
                    .iter_mut()
                    .filter(|c| c.targets(identity) && c.status.is_outstanding())
                    .max_by(|a, b| {
                        a.touched_at()
                            .cmp(b.touched_at())
                            .then_with(|| a.command_id.cmp(&b.command_id))
                    })?;

                let mut ack = ack;
                ack.command_id = Some(command.command_id.clone());
                command.apply_ack(ack, &now);
                Some(command.command_id.clone())
            })
            .await?;

        match &matched {
            Some(command_id) => {
                tracing::debug!(sensor_id = %identity, command_id = %command_id, "correlated ack");
            }
            None => tracing::debug!(sensor_id = %identity, "no outstanding command for ack"),
        }
        Ok(matched)
    }

    /// Full command history
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn list(&self) -> Result<Vec<Command>> {
        self.docs.load_list(COMMANDS_KEY).await
    }

    /// Look up a command by id
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no command has this id
    pub async fn get(&self, command_id: &str) -> Result<Command> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.command_id == command_id)
            .ok_or_else(|| Error::not_found(format!("command {command_id}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::connections::SessionHandle;
    use crate::devices::{DEVICES_KEY, RegisterFields};
    use crate::ota::{CommandStatus, TargetStatus};
    use crate::store::{DocumentStore, MemoryStore};

    /// In-memory backend that can be told to fail upcoming device reads
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing_device_reads: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            if key == DEVICES_KEY
                && self
                    .failing_device_reads
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(Error::Storage("device store unavailable".into()));
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &Value) -> Result<()> {
            self.inner.put(key, value).await
        }
    }

    struct Fixture {
        docs: Documents,
        connections: ConnectionRegistry,
        presence: PresenceRegistry,
        dispatcher: CommandDispatcher,
    }

    impl Fixture {
        fn new() -> Self {
            Self::over(Documents::in_memory())
        }

        fn over(docs: Documents) -> Self {
            let connections = ConnectionRegistry::with_send_timeout(Duration::from_millis(50));
            let presence = PresenceRegistry::new(docs.clone());
            let dispatcher =
                CommandDispatcher::new(docs.clone(), connections.clone(), presence.clone());
            Self {
                docs,
                connections,
                presence,
                dispatcher,
            }
        }

        async fn online(&self, sensor_id: &str) -> mpsc::Receiver<Outbound> {
            let (session, rx) = SessionHandle::channel(8);
            self.presence
                .register(RegisterFields::sensor(sensor_id))
                .await
                .unwrap();
            self.connections.connect(sensor_id, session).await;
            rx
        }

        /// Connected device whose queue is full and never drained
        async fn stalled(&self, sensor_id: &str) -> mpsc::Receiver<Outbound> {
            let (session, rx) = SessionHandle::channel(1);
            self.presence
                .register(RegisterFields::sensor(sensor_id))
                .await
                .unwrap();
            session.try_push(Event::Pong.into()).unwrap();
            self.connections.connect(sensor_id, session).await;
            rx
        }

        async fn send(&self, request: Value) -> Result<Command> {
            self.dispatcher
                .send_command(CommandRequest::from_value(request).unwrap())
                .await
        }
    }

    fn ack(sensor_id: &str) -> AckRecord {
        AckRecord {
            command_id: None,
            sensor_id: sensor_id.to_string(),
            status: "success".into(),
            timestamp: timestamp(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn fan_out_status_by_online_count() {
        let fx = Fixture::new();
        let targets = json!({"command": "update", "targets": {"device_ids": ["A", "B", "C"]}});

        let none = fx.send(targets.clone()).await.unwrap();
        assert_eq!(none.status, CommandStatus::Failed);
        assert!(none.reason.is_some());

        let _a = fx.online("A").await;
        let one = fx.send(targets.clone()).await.unwrap();
        assert_eq!(one.status, CommandStatus::Partial);
        assert_eq!(one.per_device["A"].status, TargetStatus::Sent);
        assert_eq!(one.per_device["B"].reason, Some(FailureReason::DeviceOffline));

        let _b = fx.online("B").await;
        let two = fx.send(targets.clone()).await.unwrap();
        assert_eq!(two.status, CommandStatus::Partial);
        assert_eq!(two.per_device["B"].status, TargetStatus::Sent);
        assert_eq!(two.per_device["C"].reason, Some(FailureReason::DeviceOffline));

        let _c = fx.online("C").await;
        let all = fx.send(targets).await.unwrap();
        assert_eq!(all.status, CommandStatus::Sent);
        assert_eq!(all.reason, None);
    }

    #[tokio::test]
    async fn per_device_keys_follow_target_order() {
        let fx = Fixture::new();
        let command = fx
            .send(json!({"targets": {"device_ids": ["C", "A", "B", "A"]}}))
            .await
            .unwrap();

        let keys: Vec<&str> = command.per_device.keys().map(String::as_str).collect();
        assert_eq!(keys, ["C", "A", "B"]);
        assert_eq!(command.targets.device_ids, ["C", "A", "B"]);
    }

    #[tokio::test]
    async fn frame_carries_command_id_and_target() {
        let fx = Fixture::new();
        let mut rx = fx.online("A").await;

        let command = fx
            .send(json!({"command": "update", "url": "fw.bin", "sensor_id": "A"}))
            .await
            .unwrap();

        let Some(Outbound::Event(Event::OtaCommand(frame))) = rx.recv().await else {
            panic!("expected ota_command frame");
        };
        assert_eq!(frame.command_id, command.command_id);
        assert_eq!(frame.sensor_id, "A");
        assert_eq!(frame.fields.get("url"), Some(&json!("fw.bin")));
        assert!(!command.payload.contains_key("sensor_id"));
    }

    #[tokio::test]
    async fn connected_but_presence_offline_is_device_offline() {
        let fx = Fixture::new();
        let _rx = fx.online("A").await;
        fx.presence.mark_offline("A").await.unwrap();

        let command = fx.send(json!({"sensor_id": "A"})).await.unwrap();
        assert_eq!(command.per_device["A"].reason, Some(FailureReason::DeviceOffline));
    }

    #[tokio::test]
    async fn closed_session_is_send_failed() {
        let fx = Fixture::new();
        drop(fx.online("A").await);

        let command = fx.send(json!({"sensor_id": "A"})).await.unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert_eq!(command.per_device["A"].reason, Some(FailureReason::SendFailed));
    }

    #[tokio::test]
    async fn stalled_target_does_not_block_fan_out() {
        let fx = Fixture::new();
        let _stuck = fx.stalled("A").await;
        let mut rx_b = fx.online("B").await;

        let command = tokio::time::timeout(
            Duration::from_secs(2),
            fx.send(json!({"targets": {"device_ids": ["A", "B"]}})),
        )
        .await
        .expect("fan-out should not wait on a stalled device")
        .unwrap();

        assert_eq!(command.status, CommandStatus::Partial);
        assert_eq!(command.per_device["A"].reason, Some(FailureReason::SendFailed));
        assert_eq!(command.per_device["B"].status, TargetStatus::Sent);
        assert!(matches!(
            rx_b.try_recv(),
            Ok(Outbound::Event(Event::OtaCommand(_)))
        ));

        let stored = fx.dispatcher.get(&command.command_id).await.unwrap();
        assert_eq!(stored.status, CommandStatus::Partial);
    }

    #[tokio::test]
    async fn presence_read_failure_only_fails_that_target() {
        let store = Arc::new(FlakyStore::default());
        let fx = Fixture::over(Documents::new(store.clone()));
        let _a = fx.online("A").await;
        let mut rx_b = fx.online("B").await;

        store.failing_device_reads.store(1, Ordering::SeqCst);
        let command = fx
            .send(json!({"targets": {"device_ids": ["A", "B"]}}))
            .await
            .unwrap();

        assert_eq!(command.per_device["A"].status, TargetStatus::Failed);
        assert_eq!(command.per_device["A"].reason, Some(FailureReason::SendFailed));
        assert_eq!(command.per_device["B"].status, TargetStatus::Sent);
        assert!(rx_b.try_recv().is_ok());

        let stored = fx.dispatcher.get(&command.command_id).await.unwrap();
        assert_eq!(stored.status, CommandStatus::Partial);
    }

    #[tokio::test]
    async fn foreign_command_records_survive_dispatch() {
        let fx = Fixture::new();
        let foreign = json!({"command_id": 99, "note": "written elsewhere"});
        fx.docs.put(COMMANDS_KEY, &json!([foreign.clone()])).await.unwrap();

        let command = fx.send(json!({"sensor_id": "A"})).await.unwrap();

        let raw = fx.docs.get_or(COMMANDS_KEY, Value::Null).await.unwrap();
        assert_eq!(raw[0], foreign);
        assert_eq!(raw[1]["command_id"], json!(command.command_id));
        assert_eq!(fx.dispatcher.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_errors_leave_store_untouched() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.send(json!({"command": "update"})).await,
            Err(Error::Validation(_))
        ));
        assert!(fx.dispatcher.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_command_id_is_rejected() {
        let fx = Fixture::new();
        fx.send(json!({"command_id": "c1", "sensor_id": "A"})).await.unwrap();

        assert!(matches!(
            fx.send(json!({"command_id": "c1", "sensor_id": "B"})).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(fx.dispatcher.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acked_only_once_every_target_acks() {
        let fx = Fixture::new();
        let _a = fx.online("A").await;
        let _b = fx.online("B").await;
        let command = fx
            .send(json!({"targets": {"device_ids": ["A", "B"]}}))
            .await
            .unwrap();

        let after_a = fx
            .dispatcher
            .mark_acked(&command.command_id, ack("A"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_a.status, CommandStatus::Sent);
        assert_eq!(after_a.per_device["A"].status, TargetStatus::Acked);

        let after_b = fx
            .dispatcher
            .mark_acked(&command.command_id, ack("B"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_b.status, CommandStatus::Acked);
        assert_eq!(after_b.acks.len(), 2);
        assert_eq!(after_b.ack.as_ref().map(|a| a.sensor_id.as_str()), Some("B"));
    }

    #[tokio::test]
    async fn repeated_ack_is_idempotent_for_status() {
        let fx = Fixture::new();
        let _a = fx.online("A").await;
        let command = fx.send(json!({"sensor_id": "A"})).await.unwrap();

        for _ in 0..2 {
            let updated = fx
                .dispatcher
                .mark_acked(&command.command_id, ack("A"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.status, CommandStatus::Acked);
            assert_eq!(updated.per_device["A"].status, TargetStatus::Acked);
        }
    }

    #[tokio::test]
    async fn partial_stays_partial_after_online_target_acks() {
        let fx = Fixture::new();
        let _a = fx.online("A").await;
        let command = fx
            .send(json!({"targets": {"device_ids": ["A", "B"]}}))
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Partial);

        let updated = fx
            .dispatcher
            .mark_acked(&command.command_id, ack("A"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, CommandStatus::Partial);
    }

    #[tokio::test]
    async fn unknown_command_id_is_noop() {
        let fx = Fixture::new();
        assert!(fx.dispatcher.mark_acked("missing", ack("A")).await.unwrap().is_none());
        assert!(fx.docs.get_or(COMMANDS_KEY, Value::Null).await.unwrap().is_null());
    }

    #[tokio::test]
    async fn latest_outstanding_command_gets_implicit_ack() {
        let fx = Fixture::new();
        let _a = fx.online("A").await;
        let first = fx.send(json!({"command_id": "c1", "sensor_id": "A"})).await.unwrap();
        let second = fx.send(json!({"command_id": "c2", "sensor_id": "A"})).await.unwrap();

        let matched = fx.dispatcher.mark_latest_acked("A", ack("A")).await.unwrap();
        assert_eq!(matched.as_deref(), Some(second.command_id.as_str()));

        let stored = fx.dispatcher.get(&second.command_id).await.unwrap();
        assert_eq!(stored.status, CommandStatus::Acked);
        assert_eq!(
            stored.ack.and_then(|a| a.command_id).as_deref(),
            Some(second.command_id.as_str())
        );

        // Next implicit ack falls through to the older, still outstanding command
        let matched = fx.dispatcher.mark_latest_acked("A", ack("A")).await.unwrap();
        assert_eq!(matched.as_deref(), Some(first.command_id.as_str()));
        assert!(fx.dispatcher.mark_latest_acked("A", ack("A")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn implicit_ack_tie_goes_to_greatest_command_id() {
        let fx = Fixture::new();
        let stamp = "2024-01-01T00:00:00.000000Z";
        let request = CommandRequest::from_value(json!({"sensor_id": "A"})).unwrap();
        let mut older = Command::pending("cmd-a".into(), &request, vec!["A".into()], stamp);
        let mut newer = Command::pending("cmd-b".into(), &request, vec!["A".into()], stamp);
        older.status = CommandStatus::Sent;
        newer.status = CommandStatus::Sent;
        fx.docs
            .put(COMMANDS_KEY, &serde_json::to_value([newer, older]).unwrap())
            .await
            .unwrap();

        let matched = fx.dispatcher.mark_latest_acked("A", ack("A")).await.unwrap();
        assert_eq!(matched.as_deref(), Some("cmd-b"));
    }

    #[tokio::test]
    async fn implicit_ack_ignores_failed_and_foreign_commands() {
        let fx = Fixture::new();
        fx.send(json!({"sensor_id": "A"})).await.unwrap();
        let _b = fx.online("B").await;
        fx.send(json!({"sensor_id": "B"})).await.unwrap();

        assert!(fx.dispatcher.mark_latest_acked("A", ack("A")).await.unwrap().is_none());
        assert!(fx.dispatcher.mark_latest_acked("", ack("")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.dispatcher.get("nope").await,
            Err(Error::NotFound(_))
        ));
    }
}
