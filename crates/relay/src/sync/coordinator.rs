use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::{anyhow, Context};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    blob::StateBlobStore,
    records::{DocumentRecordStore, StorageKeyWrite},
    sync::observer::ObserverChain,
};

pub fn storage_key_for(document_id: &str) -> String {
    format!("state/{document_id}")
}

/// Full document state captured at a point in a session's history.
/// `version` grows monotonically across every session in the process, so
/// a later capture always carries a larger version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub version: u64,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded { storage_key: String, bytes: usize },
    NoPriorState,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { storage_key: String, bytes: usize, version: u64 },
    /// A newer (or equal) snapshot was already written, or was handed to
    /// the store already in flight.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to resolve storage key for document {document_id}")]
    StorageKey {
        document_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to write state blob {storage_key}")]
    Write {
        storage_key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PersistenceError {
    /// Error message including the full source chain.
    pub fn detail(&self) -> String {
        match self {
            Self::StorageKey { source, .. } | Self::Write { source, .. } => {
                format!("{self}: {source:#}")
            }
        }
    }
}

#[derive(Default)]
struct StoreSlot {
    in_flight: Mutex<()>,
    queue: StdMutex<SlotQueue>,
}

#[derive(Default)]
struct SlotQueue {
    pending: Option<StateSnapshot>,
}

/// Reads and writes document state through the record and blob stores.
///
/// Stores for one document never overlap. A store issued while another is
/// in flight waits; if several queue up only the newest snapshot is
/// written. A snapshot older than one already written is never written.
pub struct PersistenceCoordinator {
    records: Arc<dyn DocumentRecordStore>,
    blobs: Arc<dyn StateBlobStore>,
    observers: ObserverChain,
    slots: StdMutex<HashMap<String, Arc<StoreSlot>>>,
    /// Highest version written per document. Outlives the slots, which are
    /// dropped whenever a document's store queue runs dry.
    persisted: StdMutex<HashMap<String, u64>>,
}

impl PersistenceCoordinator {
    pub fn new(
        records: Arc<dyn DocumentRecordStore>,
        blobs: Arc<dyn StateBlobStore>,
        observers: ObserverChain,
    ) -> Self {
        Self {
            records,
            blobs,
            observers,
            slots: StdMutex::new(HashMap::new()),
            persisted: StdMutex::new(HashMap::new()),
        }
    }

    /// Loads the last persisted state. Lookup or read failures are logged
    /// and reported as "no prior state" so a session can still start.
    pub async fn fetch(&self, document_id: &str) -> Option<Vec<u8>> {
        let (outcome, state) = self
            .try_fetch(document_id)
            .instrument(info_span!("relay.persistence.fetch", document_id = %document_id))
            .await;

        self.observers.on_fetch(document_id, &outcome);
        state
    }

    async fn try_fetch(&self, document_id: &str) -> (FetchOutcome, Option<Vec<u8>>) {
        let record = match self.records.find_by_id(document_id).await {
            Ok(record) => record,
            Err(source) => {
                return (FetchOutcome::Failed { reason: format!("{source:#}") }, None);
            }
        };

        let Some(storage_key) = record.and_then(|record| record.storage_key) else {
            return (FetchOutcome::NoPriorState, None);
        };

        match self.blobs.get(&storage_key).await {
            Ok(Some(state)) => {
                let bytes = state.len();
                (FetchOutcome::Loaded { storage_key, bytes }, Some(state))
            }
            Ok(None) => {
                warn!(storage_key = %storage_key, "storage key recorded but no state blob found");
                (FetchOutcome::NoPriorState, None)
            }
            Err(source) => (
                FetchOutcome::Failed { reason: format!("{storage_key}: {source:#}") },
                None,
            ),
        }
    }

    /// Persists a snapshot, allocating the document's storage key on first
    /// use.
    pub async fn store(
        &self,
        document_id: &str,
        snapshot: StateSnapshot,
    ) -> Result<StoreOutcome, PersistenceError> {
        let slot = self.slot_for(document_id);
        let version = snapshot.version;
        let bytes = snapshot.state.len();

        {
            let mut queue = lock_queue(&slot);
            let newer = queue.pending.as_ref().map_or(true, |pending| pending.version < version);
            if newer {
                queue.pending = Some(snapshot);
            }
        }

        let result = self
            .write_pending(document_id, &slot)
            .instrument(info_span!(
                "relay.persistence.store",
                document_id = %document_id,
                version,
                payload_bytes = bytes
            ))
            .await;

        self.release_slot(document_id, slot);

        match &result {
            Ok(StoreOutcome::Stored { storage_key, bytes, version }) => {
                info!(
                    document_id = %document_id,
                    storage_key = %storage_key,
                    bytes,
                    version,
                    "stored document state"
                );
            }
            Ok(StoreOutcome::Superseded) => {}
            Err(error) => {
                error!(
                    document_id = %document_id,
                    error = %error.detail(),
                    "failed to store document state"
                );
            }
        }
        self.observers.on_store(document_id, result.as_ref());
        result
    }

    async fn write_pending(
        &self,
        document_id: &str,
        slot: &StoreSlot,
    ) -> Result<StoreOutcome, PersistenceError> {
        let _in_flight = slot.in_flight.lock().await;

        let snapshot = {
            let mut queue = lock_queue(slot);
            let Some(snapshot) = queue.pending.take() else {
                return Ok(StoreOutcome::Superseded);
            };
            snapshot
        };
        let persisted = self.persisted_version(document_id);
        if persisted.is_some_and(|persisted| persisted >= snapshot.version) {
            return Ok(StoreOutcome::Superseded);
        }

        let storage_key = self.resolve_storage_key(document_id).await.map_err(|source| {
            PersistenceError::StorageKey { document_id: document_id.to_owned(), source }
        })?;

        self.blobs
            .put(&storage_key, &snapshot.state)
            .instrument(info_span!(
                "relay.blob.put",
                key = %storage_key,
                payload_bytes = snapshot.state.len()
            ))
            .await
            .map_err(|source| PersistenceError::Write {
                storage_key: storage_key.clone(),
                source,
            })?;

        self.record_persisted(document_id, snapshot.version);

        Ok(StoreOutcome::Stored {
            storage_key,
            bytes: snapshot.state.len(),
            version: snapshot.version,
        })
    }

    /// Returns the document's storage key, recording a fresh one if none is
    /// set. Concurrent first stores agree on whichever key was recorded
    /// first.
    async fn resolve_storage_key(&self, document_id: &str) -> anyhow::Result<String> {
        let record = self
            .records
            .find_by_id(document_id)
            .await
            .context("failed to load document record")?
            .ok_or_else(|| anyhow!("document {document_id} has no record"))?;

        if let Some(existing) = record.storage_key {
            return Ok(existing);
        }

        let storage_key = storage_key_for(document_id);
        match self
            .records
            .set_storage_key(document_id, &storage_key)
            .await
            .context("failed to record storage key")?
        {
            StorageKeyWrite::Recorded => {
                info!(
                    document_id = %document_id,
                    storage_key = %storage_key,
                    "allocated storage key"
                );
                Ok(storage_key)
            }
            StorageKeyWrite::AlreadySet { existing } => Ok(existing),
        }
    }

    fn persisted_version(&self, document_id: &str) -> Option<u64> {
        let persisted = self.persisted.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        persisted.get(document_id).copied()
    }

    fn record_persisted(&self, document_id: &str, version: u64) {
        let mut persisted = self.persisted.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = persisted.entry(document_id.to_owned()).or_insert(version);
        *entry = (*entry).max(version);
    }

    fn slot_for(&self, document_id: &str) -> Arc<StoreSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(document_id.to_owned()).or_default())
    }

    /// Drops the slot once nobody else holds it and nothing is queued.
    fn release_slot(&self, document_id: &str, slot: Arc<StoreSlot>) {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = Arc::strong_count(&slot) == 2 && lock_queue(&slot).pending.is_none();
        if idle {
            slots.remove(document_id);
        }
    }
}

fn lock_queue(slot: &StoreSlot) -> std::sync::MutexGuard<'_, SlotQueue> {
    slot.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
