//! Persistence of posted signals and their delivery status.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorRecord, StorageError};
use crate::signal::{Signal, SignalId, SignalStatus};

/// A stored signal with its current status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    /// The signal as posted.
    pub signal: Signal,
    /// Current delivery status.
    pub status: SignalStatus,
    /// The failure, when `status` is `Error` or `Rejected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// Storage contract for the signal log.
///
/// Each signal has at most one record. Saving an id that already exists
/// updates its status in place.
pub trait SignalStore: Send + Sync {
    /// Insert or update the record for `signal`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn save_with_status(
        &self,
        signal: &Signal,
        status: SignalStatus,
        error: Option<&ErrorRecord>,
    ) -> Result<(), StorageError>;

    /// The record for `id`, if stored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn record(&self, id: &SignalId) -> Result<Option<SignalRecord>, StorageError>;

    /// Every signal currently in `SCHEDULED` status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn scheduled(&self) -> Result<Vec<Signal>, StorageError>;

    /// Atomically move `id` from `SCHEDULED` to `RECEIVED`.
    ///
    /// # Returns
    ///
    /// `true` if this call made the transition; `false` if the signal was
    /// not scheduled (already claimed, delivered, or unknown).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn claim_scheduled(&self, id: &SignalId) -> Result<bool, StorageError>;
}

/// In-memory signal store.
#[derive(Debug, Default)]
pub struct InMemorySignalStore {
    records: Mutex<HashMap<SignalId, SignalRecord>>,
}

impl InMemorySignalStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn len(&self) -> usize {
        self.records.lock().expect("signal store lock poisoned").len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored record with the given status.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn with_status(&self, status: SignalStatus) -> Vec<SignalRecord> {
        let records = self.records.lock().expect("signal store lock poisoned");
        records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }
}

impl SignalStore for InMemorySignalStore {
    fn save_with_status(
        &self,
        signal: &Signal,
        status: SignalStatus,
        error: Option<&ErrorRecord>,
    ) -> Result<(), StorageError> {
        let mut records = self.records.lock().expect("signal store lock poisoned");
        records.insert(
            signal.id,
            SignalRecord {
                signal: signal.clone(),
                status,
                error: error.cloned(),
            },
        );
        Ok(())
    }

    fn record(&self, id: &SignalId) -> Result<Option<SignalRecord>, StorageError> {
        let records = self.records.lock().expect("signal store lock poisoned");
        Ok(records.get(id).cloned())
    }

    fn scheduled(&self) -> Result<Vec<Signal>, StorageError> {
        let records = self.records.lock().expect("signal store lock poisoned");
        let mut scheduled: Vec<Signal> = records
            .values()
            .filter(|r| r.status == SignalStatus::Scheduled)
            .map(|r| r.signal.clone())
            .collect();
        scheduled.sort_by_key(|s| (s.context.deliver_at(), s.context.timestamp));
        Ok(scheduled)
    }

    fn claim_scheduled(&self, id: &SignalId) -> Result<bool, StorageError> {
        let mut records = self.records.lock().expect("signal store lock poisoned");
        match records.get_mut(id) {
            Some(record) if record.status == SignalStatus::Scheduled => {
                record.status = SignalStatus::Received;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
