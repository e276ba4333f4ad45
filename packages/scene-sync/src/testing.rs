//! Test doubles for the coordinator's collaborators.
//!
//! # Feature Flag
//!
//! Compiled for this crate's own tests and, for downstream crates, behind
//! the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! scene-sync = { path = "../scene-sync", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! let rig = Rig::new();
//! let mut coordinator = rig.coordinator();
//!
//! rig.hdr.gate();
//! coordinator.dispatch(Command::Environment(EnvironmentCommand::LoadHdr {
//!     path: "studio.hdr".into(),
//! }));
//! rig.hdr.release(1);
//! coordinator.settle().await;
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::coordinator::Coordinator;
use crate::core::{ObjectGroup, ObjectHandle};
use crate::error::RenderContextLost;
use crate::memory::{InMemoryPersistence, InMemoryReactiveStore};
use crate::services::{
    HdrAsset, HdrLoader, HdrMetadata, MaterialProperty, SceneGraph, Services, TextureId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Manual Clock
// =============================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Starts at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        let start = DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_else(Utc::now);
        Self::starting_at(start)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// =============================================================================
// Recording Scene
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SceneCall {
    Register(ObjectGroup, Vec<ObjectHandle>),
    Unregister(ObjectGroup, Vec<ObjectHandle>),
    Apply(ObjectHandle, MaterialProperty, f32),
}

/// Scene graph that records every call.
#[derive(Debug, Default)]
pub struct RecordingScene {
    calls: Mutex<Vec<SceneCall>>,
    detection: Mutex<Vec<(ObjectGroup, ObjectHandle)>>,
    context_lost: AtomicBool,
    fail_detection: AtomicBool,
}

impl RecordingScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SceneCall> {
        lock(&self.calls).clone()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    /// Objects returned by the next detection passes.
    pub fn set_detection(&self, objects: Vec<(ObjectGroup, ObjectHandle)>) {
        *lock(&self.detection) = objects;
    }

    /// Make every call fail with [`RenderContextLost`] until reset.
    pub fn lose_context(&self, lost: bool) {
        self.context_lost.store(lost, Ordering::SeqCst);
    }

    pub fn fail_detection(&self, fail: bool) {
        self.fail_detection.store(fail, Ordering::SeqCst);
    }

    /// Property writes recorded for one handle, oldest first.
    pub fn applied_to(&self, handle: ObjectHandle) -> Vec<(MaterialProperty, f32)> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                SceneCall::Apply(h, property, value) if *h == handle => Some((*property, *value)),
                _ => None,
            })
            .collect()
    }

    fn check_context(&self) -> anyhow::Result<()> {
        if self.context_lost.load(Ordering::SeqCst) {
            return Err(RenderContextLost {
                reason: "test context lost".into(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl SceneGraph for RecordingScene {
    fn register_objects(&self, group: ObjectGroup, handles: &[ObjectHandle]) -> anyhow::Result<()> {
        self.check_context()?;
        lock(&self.calls).push(SceneCall::Register(group, handles.to_vec()));
        Ok(())
    }

    fn unregister_objects(&self, group: ObjectGroup, handles: &[ObjectHandle]) -> anyhow::Result<()> {
        self.check_context()?;
        lock(&self.calls).push(SceneCall::Unregister(group, handles.to_vec()));
        Ok(())
    }

    fn apply_material_property(
        &self,
        handle: ObjectHandle,
        property: MaterialProperty,
        value: f32,
    ) -> anyhow::Result<()> {
        self.check_context()?;
        lock(&self.calls).push(SceneCall::Apply(handle, property, value));
        Ok(())
    }

    async fn detect_objects(&self) -> anyhow::Result<Vec<(ObjectGroup, ObjectHandle)>> {
        self.check_context()?;
        if self.fail_detection.load(Ordering::SeqCst) {
            return Err(anyhow!("detection pass crashed"));
        }
        Ok(lock(&self.detection).clone())
    }
}

// =============================================================================
// Scripted HDR Loader
// =============================================================================

/// HDR loader whose completions can be held back and released one by one.
#[derive(Debug)]
pub struct ScriptedHdrLoader {
    gate: Semaphore,
    gated: AtomicBool,
    failing: Mutex<HashSet<String>>,
    loads: AtomicUsize,
    next_texture: AtomicU64,
}

impl ScriptedHdrLoader {
    /// Loads complete immediately.
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            gated: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            loads: AtomicUsize::new(0),
            next_texture: AtomicU64::new(1),
        }
    }

    /// Hold every subsequent load until [`release`](Self::release).
    pub fn gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, loads: usize) {
        self.gate.add_permits(loads);
    }

    pub fn fail_path(&self, path: &str) {
        lock(&self.failing).insert(path.to_string());
    }

    /// Loads started so far, including ones still held.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedHdrLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HdrLoader for ScriptedHdrLoader {
    async fn load(&self, path: &str) -> anyhow::Result<HdrAsset> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await?.forget();
        }
        if lock(&self.failing).contains(path) {
            return Err(anyhow!("failed to decode {path}"));
        }
        Ok(HdrAsset {
            path: path.to_string(),
            texture: TextureId(self.next_texture.fetch_add(1, Ordering::SeqCst)),
            metadata: HdrMetadata {
                width: Some(2048),
                height: Some(1024),
                byte_len: 4096,
            },
        })
    }
}

// =============================================================================
// Rig
// =============================================================================

/// The full collaborator set, with handles kept for assertions.
pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub scene: Arc<RecordingScene>,
    pub hdr: Arc<ScriptedHdrLoader>,
    pub storage: Arc<InMemoryPersistence>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new()),
            scene: Arc::new(RecordingScene::new()),
            hdr: Arc::new(ScriptedHdrLoader::new()),
            storage: Arc::new(InMemoryPersistence::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(self.scene.clone(), self.hdr.clone(), self.storage.clone())
    }

    pub fn coordinator(&self) -> Coordinator {
        self.coordinator_with(SyncConfig::default())
    }

    pub fn coordinator_with(&self, config: SyncConfig) -> Coordinator {
        Coordinator::builder(self.services())
            .config(config)
            .clock(self.clock.clone())
            .build()
    }

    pub fn store(&self) -> Arc<InMemoryReactiveStore> {
        Arc::new(InMemoryReactiveStore::new(self.clock.clone()))
    }
}

impl Default for Rig {
    fn default() -> Self {
        Self::new()
    }
}
