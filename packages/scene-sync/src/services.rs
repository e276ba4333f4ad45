//! Collaborator interfaces.
//!
//! The core never touches a renderer, decoder or storage engine directly. It
//! talks to these traits, which the host implements. All of them use
//! `anyhow::Result`; errors are sanitized into
//! [`ServiceFailure`](crate::error::ServiceFailure) before they reach state.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ObjectGroup, ObjectHandle, Parameter};

/// Material properties the core is allowed to set on scene objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaterialProperty {
    Metalness,
    Roughness,
    EnvMapIntensity,
    EmissiveIntensity,
    /// 1.0 puts the object on the bloom layer, 0.0 takes it off.
    BloomLayer,
}

impl MaterialProperty {
    pub fn as_str(self) -> &'static str {
        match self {
            MaterialProperty::Metalness => "metalness",
            MaterialProperty::Roughness => "roughness",
            MaterialProperty::EnvMapIntensity => "envMapIntensity",
            MaterialProperty::EmissiveIntensity => "emissiveIntensity",
            MaterialProperty::BloomLayer => "bloomLayer",
        }
    }

    /// The per-object property a region parameter maps to, if any.
    pub fn for_parameter(parameter: Parameter) -> Option<Self> {
        match parameter {
            Parameter::Metalness => Some(MaterialProperty::Metalness),
            Parameter::Roughness => Some(MaterialProperty::Roughness),
            Parameter::EnvMapIntensity => Some(MaterialProperty::EnvMapIntensity),
            _ => None,
        }
    }
}

impl fmt::Display for MaterialProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scene-graph access.
///
/// Registration and property writes are synchronous; object detection walks
/// the scene and may take a while, so it is async.
#[async_trait]
pub trait SceneGraph: Send + Sync + 'static {
    fn register_objects(&self, group: ObjectGroup, handles: &[ObjectHandle]) -> anyhow::Result<()>;

    fn unregister_objects(&self, group: ObjectGroup, handles: &[ObjectHandle])
        -> anyhow::Result<()>;

    fn apply_material_property(
        &self,
        handle: ObjectHandle,
        property: MaterialProperty,
        value: f32,
    ) -> anyhow::Result<()>;

    /// Find objects eligible for PBR treatment, grouped.
    async fn detect_objects(&self) -> anyhow::Result<Vec<(ObjectGroup, ObjectHandle)>>;
}

/// Handle of a GPU texture owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextureId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HdrMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub byte_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdrAsset {
    pub path: String,
    pub texture: TextureId,
    pub metadata: HdrMetadata,
}

#[async_trait]
pub trait HdrLoader: Send + Sync + 'static {
    async fn load(&self, path: &str) -> anyhow::Result<HdrAsset>;
}

/// Key-value blob storage for checkpoints and audit exports.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn save(&self, key: &str, blob: Vec<u8>) -> anyhow::Result<()>;

    /// `Ok(None)` when the key was never written.
    async fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

// =============================================================================
// Reactive Store
// =============================================================================

/// One confirmed write to the reactive store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChange {
    pub parameter: Parameter,
    pub value: f32,
    /// When the store accepted the write.
    pub confirmed_at: DateTime<Utc>,
    pub revision: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub revision: u64,
    pub values: std::collections::BTreeMap<Parameter, f32>,
}

pub type StoreListener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// Returned by [`ReactiveStore::subscribe`]; call `unsubscribe` to detach.
pub struct StoreSubscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl StoreSubscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// The UI-facing state container mirrored by render-sync.
///
/// Listeners are called synchronously after each confirmed write. Writing a
/// value equal to the current one must not notify.
pub trait ReactiveStore: Send + Sync + 'static {
    fn subscribe(&self, listener: StoreListener) -> StoreSubscription;

    fn state(&self) -> StoreSnapshot;

    fn write(&self, parameter: Parameter, value: f32);
}

/// The collaborator set handed to a coordinator.
#[derive(Clone)]
pub struct Services {
    pub scene: Arc<dyn SceneGraph>,
    pub hdr: Arc<dyn HdrLoader>,
    pub storage: Arc<dyn Persistence>,
}

impl Services {
    pub fn new(
        scene: Arc<dyn SceneGraph>,
        hdr: Arc<dyn HdrLoader>,
        storage: Arc<dyn Persistence>,
    ) -> Self {
        Self { scene, hdr, storage }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
