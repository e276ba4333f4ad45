//! Checkpoints of both synchronized sides.
//!
//! Storage layout (the persistence collaborator only offers `save`/`load`):
//!
//! ```text
//! checkpoint/index   {"ids": [<oldest>, ..., <newest>]}
//! checkpoint/<id>    Checkpoint JSON
//! ```
//!
//! Ids that fall off the end of the retained range are dropped from the
//! index; their blobs stay behind since the collaborator has no delete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::Snapshot;
use crate::error::SyncError;
use crate::services::{Persistence, StoreSnapshot};

pub const INDEX_KEY: &str = "checkpoint/index";

fn blob_key(id: Uuid) -> String {
    format!("checkpoint/{id}")
}

fn digest<T: Serialize>(what: &'static str, value: &T) -> Result<String, SyncError> {
    let bytes = serde_json::to_vec(value).map_err(|source| SyncError::Serialization { what, source })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPayload {
    pub store: StoreSnapshot,
    pub coordinator: Snapshot,
}

/// Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub store_digest: String,
    pub coordinator_digest: String,
    pub payload: CheckpointPayload,
}

impl Checkpoint {
    pub fn capture(
        store: StoreSnapshot,
        coordinator: Snapshot,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            id: Uuid::new_v4(),
            timestamp,
            store_digest: digest("store snapshot", &store)?,
            coordinator_digest: digest("coordinator snapshot", &coordinator)?,
            payload: CheckpointPayload { store, coordinator },
        })
    }

    /// Both digests match the payload.
    pub fn verify(&self) -> bool {
        let store = digest("store snapshot", &self.payload.store);
        let coordinator = digest("coordinator snapshot", &self.payload.coordinator);
        matches!((store, coordinator), (Ok(s), Ok(c)) if s == self.store_digest && c == self.coordinator_digest)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|source| SyncError::Serialization {
            what: "checkpoint",
            source,
        })
    }

    /// Decode and verify.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let checkpoint: Checkpoint =
            serde_json::from_slice(bytes).map_err(|source| SyncError::Serialization {
                what: "checkpoint",
                source,
            })?;
        if !checkpoint.verify() {
            return Err(SyncError::CorruptCheckpoint { id: checkpoint.id });
        }
        Ok(checkpoint)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CheckpointIndex {
    ids: Vec<Uuid>,
}

/// Checkpoint persistence over the blob collaborator.
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn Persistence>,
    retained: usize,
}

impl CheckpointStore {
    pub fn new(storage: Arc<dyn Persistence>, retained: usize) -> Self {
        Self {
            storage,
            retained: retained.max(1),
        }
    }

    /// Ids currently retained, oldest first.
    pub async fn index(&self) -> Result<Vec<Uuid>, SyncError> {
        let Some(bytes) = self.storage.load(INDEX_KEY).await.map_err(SyncError::Storage)? else {
            return Ok(Vec::new());
        };
        let index: CheckpointIndex =
            serde_json::from_slice(&bytes).map_err(|source| SyncError::Serialization {
                what: "checkpoint index",
                source,
            })?;
        Ok(index.ids)
    }

    /// Write the blob first, then the index, so a crash between the two
    /// leaves the previous index intact.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let bytes = checkpoint.encode()?;
        self.storage
            .save(&blob_key(checkpoint.id), bytes)
            .await
            .map_err(SyncError::Storage)?;

        let mut ids = self.index().await.unwrap_or_else(|error| {
            warn!(%error, "checkpoint index unreadable, starting a new one");
            Vec::new()
        });
        ids.push(checkpoint.id);
        if ids.len() > self.retained {
            let evicted = ids.len() - self.retained;
            ids.drain(..evicted);
        }

        let index = serde_json::to_vec(&CheckpointIndex { ids }).map_err(|source| {
            SyncError::Serialization {
                what: "checkpoint index",
                source,
            }
        })?;
        self.storage.save(INDEX_KEY, index).await.map_err(SyncError::Storage)?;
        info!(id = %checkpoint.id, timestamp = %checkpoint.timestamp, "checkpoint saved");
        Ok(())
    }

    pub async fn load(&self, id: Uuid) -> Result<Checkpoint, SyncError> {
        let bytes = self
            .storage
            .load(&blob_key(id))
            .await
            .map_err(SyncError::Storage)?
            .ok_or(SyncError::CheckpointNotFound { id })?;
        let checkpoint = Checkpoint::decode(&bytes)?;
        if checkpoint.id != id {
            return Err(SyncError::CorruptCheckpoint { id });
        }
        Ok(checkpoint)
    }

    /// The newest checkpoint that loads and verifies, plus how many newer
    /// ones were skipped.
    pub async fn latest_valid(&self) -> Result<(Option<Checkpoint>, usize), SyncError> {
        let ids = self.index().await?;
        let loaded = join_all(ids.iter().map(|id| self.load(*id))).await;

        let mut skipped = 0;
        for (id, result) in ids.iter().zip(loaded).rev() {
            match result {
                Ok(checkpoint) => {
                    debug!(%id, skipped, "latest valid checkpoint found");
                    return Ok((Some(checkpoint), skipped));
                }
                Err(error) => {
                    warn!(%id, %error, "skipping unusable checkpoint");
                    skipped += 1;
                }
            }
        }
        Ok((None, skipped))
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("retained", &self.retained)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::core::{Command, Parameter, PbrCommand};
    use crate::memory::InMemoryPersistence;
    use crate::services::ReactiveStore;
    use crate::testing::Rig;

    async fn capture(rig: &Rig) -> Checkpoint {
        let mut coordinator = rig.coordinator();
        coordinator.dispatch(Command::Pbr(PbrCommand::Enable));
        coordinator.settle().await;
        let store = rig.store();
        store.write(Parameter::Metalness, 0.75);
        Checkpoint::capture(store.state(), coordinator.snapshot(), rig.clock.now()).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_returns_identical_checkpoint() {
        let rig = Rig::new();
        let checkpoint = capture(&rig).await;
        let store = CheckpointStore::new(rig.storage.clone(), 5);

        store.save(&checkpoint).await.unwrap();
        let loaded = store.load(checkpoint.id).await.unwrap();

        assert_eq!(loaded, checkpoint);
        assert!(loaded.verify());
    }

    #[tokio::test]
    async fn index_keeps_newest_ids() {
        let rig = Rig::new();
        let store = CheckpointStore::new(rig.storage.clone(), 2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let checkpoint = capture(&rig).await;
            ids.push(checkpoint.id);
            store.save(&checkpoint).await.unwrap();
        }

        assert_eq!(store.index().await.unwrap(), ids[1..].to_vec());
    }

    #[tokio::test]
    async fn tampered_checkpoint_is_skipped() {
        let rig = Rig::new();
        let store = CheckpointStore::new(rig.storage.clone(), 5);
        let older = capture(&rig).await;
        store.save(&older).await.unwrap();
        let newer = capture(&rig).await;
        store.save(&newer).await.unwrap();

        let mut tampered = newer.clone();
        tampered.payload.store.values.insert(Parameter::Metalness, 0.1);
        rig.storage
            .save(&format!("checkpoint/{}", newer.id), serde_json::to_vec(&tampered).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            store.load(newer.id).await,
            Err(SyncError::CorruptCheckpoint { .. })
        ));
        let (latest, skipped) = store.latest_valid().await.unwrap();
        assert_eq!(latest.map(|c| c.id), Some(older.id));
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_reported() {
        let store = CheckpointStore::new(Arc::new(InMemoryPersistence::new()), 5);
        let id = Uuid::new_v4();
        assert!(matches!(
            store.load(id).await,
            Err(SyncError::CheckpointNotFound { id: missing }) if missing == id
        ));
        assert_eq!(store.latest_valid().await.unwrap(), (None, 0));
    }
}
