//! Presence registry backed by the `devices.json` document

use super::types::{Device, ProvisionFields, RegisterFields, Snapshot, SnapshotUpdate, non_empty};
use crate::store::Documents;
use crate::{Error, Result, timestamp};

/// Document key holding the device list
pub const DEVICES_KEY: &str = "devices.json";

/// Durable device presence and telemetry state
///
/// Every mutation is a read-modify-write of the whole device list under the
/// document's exclusive lock.
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    docs: Documents,
}

impl PresenceRegistry {
    /// Create a registry over `docs`
    #[must_use]
    pub const fn new(docs: Documents) -> Self {
        Self { docs }
    }

    /// Register or refresh a device from a handshake
    ///
    /// Existing names are kept unless the handshake carries a non-blank
    /// replacement. Missing display names fall back to each other and then to
    /// the sensor id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `sensor_id` is missing or blank
    pub async fn register(&self, fields: RegisterFields) -> Result<Device> {
        let sensor_id = non_empty(fields.sensor_id.as_deref())
            .ok_or_else(|| Error::validation("sensor_id is required for registration"))?;
        let device_id = non_empty(fields.device_id.as_deref());
        let now = timestamp();

        let device = self
            .docs
            .update_list(DEVICES_KEY, |devices: &mut Vec<Device>| {
                let existing = devices.iter().position(|d| {
                    d.sensor_id == sensor_id
                        || (device_id.is_some() && d.device_id == device_id)
                });

                let mut device = existing
                    .map(|idx| devices[idx].clone())
                    .unwrap_or_default();
                device.sensor_id.clone_from(&sensor_id);
                if device_id.is_some() {
                    device.device_id.clone_from(&device_id);
                }
                merge_name(&mut device.client_name, fields.client_name.as_deref());
                merge_name(&mut device.device_name, fields.device_name.as_deref());
                merge_name(&mut device.sensor_name, fields.sensor_name.as_deref());

                if non_empty(device.device_name.as_deref()).is_none() {
                    device.device_name = Some(
                        non_empty(device.sensor_name.as_deref()).unwrap_or_else(|| sensor_id.clone()),
                    );
                }
                if non_empty(device.sensor_name.as_deref()).is_none() {
                    device.sensor_name = Some(
                        non_empty(device.device_name.as_deref()).unwrap_or_else(|| sensor_id.clone()),
                    );
                }
                device.touch(&now);

                match existing {
                    Some(idx) => devices[idx] = device.clone(),
                    None => devices.push(device.clone()),
                }
                device
            })
            .await?;

        tracing::info!(sensor_id = %device.sensor_id, "device registered");
        Ok(device)
    }

    /// Pre-register a device from the admin surface
    ///
    /// The record is stored offline until the device connects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `device_id` is missing or blank
    pub async fn provision(&self, fields: ProvisionFields) -> Result<Device> {
        let device_id = non_empty(fields.device_id.as_deref())
            .ok_or_else(|| Error::validation("device_id is required"))?;
        let sensor_id = non_empty(fields.sensor_name.as_deref()).unwrap_or_else(|| device_id.clone());

        let registered = self
            .register(RegisterFields {
                sensor_id: Some(sensor_id.clone()),
                device_id: Some(device_id),
                client_name: fields.client_name,
                device_name: fields.sensor_name.clone(),
                sensor_name: fields.sensor_name,
            })
            .await?;

        Ok(self.mark_offline(&sensor_id).await?.unwrap_or(registered))
    }

    /// Mark a device online, creating a minimal record if it is unknown
    ///
    /// # Errors
    ///
    /// Returns error if `identity` is blank or the store is unavailable
    pub async fn mark_online(&self, identity: &str) -> Result<Device> {
        require_identity(identity)?;
        let now = timestamp();
        self.docs
            .update_list(DEVICES_KEY, |devices: &mut Vec<Device>| {
                if let Some(device) = devices.iter_mut().find(|d| d.matches(identity)) {
                    device.touch(&now);
                    device.clone()
                } else {
                    let device = Device::seen(identity, &now);
                    devices.push(device.clone());
                    device
                }
            })
            .await
    }

    /// Mark a known device offline
    ///
    /// Unknown identities are left alone and yield `None`.
    ///
    /// # Errors
    ///
    /// Returns error if `identity` is blank or the store is unavailable
    pub async fn mark_offline(&self, identity: &str) -> Result<Option<Device>> {
        require_identity(identity)?;
        let now = timestamp();
        self.docs
            .try_update_list(DEVICES_KEY, |devices: &mut Vec<Device>| {
                let device = devices.iter_mut().find(|d| d.matches(identity))?;
                device.online = false;
                device.last_seen = Some(now);
                Some(device.clone())
            })
            .await
    }

    /// Store the latest configuration report for a device
    ///
    /// # Errors
    ///
    /// Returns error if `identity` is blank or the store is unavailable
    pub async fn set_latest_configuration(
        &self,
        identity: &str,
        update: SnapshotUpdate,
    ) -> Result<Device> {
        self.set_snapshot(identity, update, |device| &mut device.latest_configuration)
            .await
    }

    /// Store the latest health report for a device
    ///
    /// # Errors
    ///
    /// Returns error if `identity` is blank or the store is unavailable
    pub async fn set_latest_health(&self, identity: &str, update: SnapshotUpdate) -> Result<Device> {
        self.set_snapshot(identity, update, |device| &mut device.latest_health)
            .await
    }

    async fn set_snapshot<F>(&self, identity: &str, update: SnapshotUpdate, slot: F) -> Result<Device>
    where
        F: FnOnce(&mut Device) -> &mut Option<Snapshot> + Send,
    {
        require_identity(identity)?;
        let now = timestamp();
        let snapshot = update.into_snapshot(&now);
        self.docs
            .update_list(DEVICES_KEY, |devices: &mut Vec<Device>| {
                let found = devices.iter().position(|d| d.matches(identity));
                let idx = match found {
                    Some(idx) => idx,
                    None => {
                        devices.push(Device::seen(identity, &now));
                        devices.len() - 1
                    }
                };
                let device = &mut devices[idx];
                *slot(device) = Some(snapshot);
                device.touch(&now);
                device.clone()
            })
            .await
    }

    /// All stored devices
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn list(&self) -> Result<Vec<Device>> {
        self.docs.load_list(DEVICES_KEY).await
    }

    /// Look up a device by sensor id or device id
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn get(&self, identity: &str) -> Result<Option<Device>> {
        Ok(self.list().await?.into_iter().find(|d| d.matches(identity)))
    }

    /// Whether the stored record for `identity` is online
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn is_online(&self, identity: &str) -> Result<bool> {
        Ok(self.get(identity).await?.is_some_and(|d| d.online))
    }
}

/// Overwrite `slot` only with a non-blank incoming value
fn merge_name(slot: &mut Option<String>, incoming: Option<&str>) {
    if let Some(value) = non_empty(incoming) {
        *slot = Some(value);
    }
}

fn require_identity(identity: &str) -> Result<()> {
    if identity.trim().is_empty() {
        return Err(Error::validation("sensor_id is required"));
    }
    Ok(())
}
