//! Render-sync: keeps the reactive store and the coordinator in agreement.
//!
//! ```text
//!   ReactiveStore ──changes──┐                 ┌──ParametersApplied── Coordinator
//!                            ▼                 ▼
//!                     ┌────────────────────────────┐
//!                     │    ReconciliationWindow    │  both sides, same field,
//!                     │ (per-field, time-bounded)  │  one window → CONFLICT
//!                     └─────────────┬──────────────┘
//!                                   │ window closes
//!                                   ▼
//!               latest confirmed write wins, mirrored to the other side
//! ```
//!
//! Checkpoints of both sides are persisted on a timer and on demand. On
//! start, the newest checkpoint that verifies is diffed against the live
//! state and divergent fields go through the window like any other change.

pub mod checkpoint;
pub mod service;
pub mod window;

pub use checkpoint::{Checkpoint, CheckpointPayload, CheckpointStore};
pub use service::{RenderSync, SyncEvent};
pub use window::{Conflict, ReconciliationWindow, Resolution};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::Parameter;

/// Which side of the synchronization reported a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Store,
    Coordinator,
}

/// Notifications published on the bus under [`Topic::Sync`](crate::core::Topic::Sync).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncNotice {
    ConflictDetected {
        parameter: Parameter,
        store_value: f32,
        coordinator_value: f32,
    },
    ConflictResolved {
        parameter: Parameter,
        value: f32,
        winner: Side,
    },
    CheckpointSaved {
        id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Recovered {
        checkpoint_id: Option<Uuid>,
        divergences: Vec<FieldDivergence>,
    },
    /// The store won but the owning region was not taking updates. The
    /// value is mirrored once the region is active again.
    MirrorDeferred {
        parameter: Parameter,
        value: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub phase: SyncPhase,
    pub last_checkpoint_id: Option<Uuid>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    /// Fields with an open reconciliation window.
    pub open_fields: usize,
    /// Store values waiting for their region to accept updates.
    pub deferred_fields: usize,
}

/// A field whose live values disagree with each other or with the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDivergence {
    pub parameter: Parameter,
    /// Store value recorded in the checkpoint, if one was loaded.
    pub checkpoint_store: Option<f32>,
    pub checkpoint_coordinator: Option<f32>,
    pub store: f32,
    pub coordinator: f32,
}

impl FieldDivergence {
    /// Store and coordinator disagree right now.
    pub fn is_split(&self) -> bool {
        self.store != self.coordinator
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub checkpoint_id: Option<Uuid>,
    pub checkpoint_at: Option<DateTime<Utc>>,
    /// Checkpoints listed in the index that failed to load or verify.
    pub skipped: usize,
    pub divergences: Vec<FieldDivergence>,
}
