//! # Scene Sync
//!
//! Coordination and synchronization for a 3D scene whose visual subsystems
//! evolve independently: bloom post-processing, PBR materials and lighting,
//! HDR environment lighting, and a security alert layer.
//!
//! ## Architecture
//!
//! ```text
//!  UI / automation / legacy layer
//!      │ Command
//!      ▼
//!  Coordinator ──────────────────────────────────────────────┐
//!      │ step                                                │
//!      ├─► BloomRegion        ─┐                             │
//!      ├─► PbrRegion           ├─ Effects ─► scene ops       │
//!      ├─► EnvironmentRegion  ─┘           ─► service calls ─┤ (tokio tasks)
//!      │                                   ─► RegionEvents   │
//!      ▼                                                     │
//!  EventBus (priority, bridges) ─► SecurityCoordinator       │
//!      │                              ├─ ThreatDetector      │
//!      │                              ├─ AlertVisuals        │
//!      │                              └─ AuditLogger         │
//!      ▼                                                     │
//!  RenderSync ◄── ReactiveStore                              │
//!      └─ ReconciliationWindow, CheckpointStore ─► Persistence
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Regions are pure** - a step mutates only the region's own slice and
//!    records effects; the coordinator performs all IO
//! 2. **Commands outside a region's phase are no-ops** - not errors
//! 3. **A failure stays local** - only the failing region moves to `Error`
//!    (or `Halted` for a lost rendering context)
//! 4. **Disposal is final** - late completions are dropped, later commands ignored
//! 5. **One security transition at a time** - overlapping requests are rejected
//! 6. **Conflicts are surfaced before they are resolved**
//!
//! ## Example
//!
//! ```ignore
//! use scene_sync::{Command, Coordinator, Services, SyncConfig};
//! use scene_sync::core::BloomCommand;
//!
//! let mut coordinator = Coordinator::new(services, SyncConfig::default());
//! let _subscription = coordinator.subscribe(|snapshot| {
//!     println!("bloom is {}", snapshot.value.bloom);
//! });
//!
//! coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
//! coordinator.settle().await;
//! ```

pub mod breaker;
pub mod bridges;
pub mod bus;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod memory;
pub mod region;
pub mod security;
pub mod services;
pub mod sync;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Scenario tests (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export the command and signal vocabulary
pub use crate::core::{
    Command, EventEnvelope, ObjectGroup, ObjectHandle, Parameter, Priority, RegionId, Signal,
    SystemEvent, Topic,
};

// Re-export coordinator types
pub use coordinator::{Coordinator, CoordinatorBuilder, Snapshot, SnapshotSubscription, StateValue, Status};

// Re-export error types
pub use error::{Categorizable, ErrorCategory, ServiceFailure, SyncError};

// Re-export configuration
pub use config::SyncConfig;

// Re-export collaborator interfaces
pub use services::{HdrLoader, Persistence, ReactiveStore, SceneGraph, Services};

// Re-export bus types
pub use bus::{Bridge, EventBus, Subscription};

// Re-export render-sync types
pub use sync::{RenderSync, SyncEvent, SyncNotice};

// Re-export commonly used external types
pub use async_trait::async_trait;
