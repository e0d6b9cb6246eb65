//! Flat log of every acknowledgement received

use super::types::AckRecord;
use crate::Result;
use crate::store::Documents;

/// Document key holding the acknowledgement log
pub const ACKS_KEY: &str = "ota_results.json";

/// Append-only acknowledgement log
#[derive(Debug, Clone)]
pub struct AckLog {
    docs: Documents,
}

impl AckLog {
    /// Log stored in `docs`
    #[must_use]
    pub const fn new(docs: Documents) -> Self {
        Self { docs }
    }

    /// Append `ack` to the log
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn append(&self, ack: &AckRecord) -> Result<()> {
        self.docs
            .update_list(ACKS_KEY, |acks: &mut Vec<AckRecord>| acks.push(ack.clone()))
            .await
    }

    /// Every logged acknowledgement, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn list(&self) -> Result<Vec<AckRecord>> {
        self.docs.load_list(ACKS_KEY).await
    }
}
