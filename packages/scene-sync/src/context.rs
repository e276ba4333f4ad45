//! Shared context: the per-region state slices, the objects registry and the
//! latest performance snapshot.
//!
//! Each slice has exactly one writer. Regions receive `&mut` access to their
//! own slice through a [`RegionScope`](crate::region::RegionScope); everything
//! else sees the context only as part of an immutable [`Snapshot`](crate::Snapshot).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ObjectGroup, ObjectHandle, Parameter, RegionId};
use crate::error::ServiceFailure;
use crate::security::SecurityState;
use crate::services::{HdrMetadata, TextureId};

/// Lifecycle phase of a visual region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Disabled,
    Activating,
    Active,
    /// Transient: an update is being flushed to the scene.
    Updating,
    /// A service failed; `RETRY` or `DISABLE` leaves this phase.
    Error,
    /// Rendering context lost; only `CONTEXT_RESTORED` leaves this phase.
    Halted,
}

impl Phase {
    pub fn accepts_updates(self) -> bool {
        matches!(self, Phase::Active | Phase::Updating)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Disabled => "disabled",
            Phase::Activating => "activating",
            Phase::Active => "active",
            Phase::Updating => "updating",
            Phase::Error => "error",
            Phase::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Latest frame statistics reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub fps: f64,
    pub frame_time_ms: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceSnapshot {
    /// A nominal 60 fps frame with no reported load.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            fps: 60.0,
            frame_time_ms: 1000.0 / 60.0,
            memory_mb: 0.0,
            cpu_percent: 0.0,
            timestamp,
        }
    }
}

// =============================================================================
// Objects Registry
// =============================================================================

/// Which scene objects belong to which group.
///
/// A handle appears at most once per group. Ordered maps keep snapshots and
/// checkpoint digests deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectsRegistry {
    groups: BTreeMap<ObjectGroup, BTreeSet<ObjectHandle>>,
}

impl ObjectsRegistry {
    /// Add handles; returns only those that were not already present.
    pub fn insert(&mut self, group: ObjectGroup, handles: &[ObjectHandle]) -> Vec<ObjectHandle> {
        let members = self.groups.entry(group).or_default();
        handles
            .iter()
            .copied()
            .filter(|handle| members.insert(*handle))
            .collect()
    }

    /// Remove handles; returns only those that were present.
    pub fn remove(&mut self, group: ObjectGroup, handles: &[ObjectHandle]) -> Vec<ObjectHandle> {
        let Some(members) = self.groups.get_mut(&group) else {
            return Vec::new();
        };
        let removed = handles
            .iter()
            .copied()
            .filter(|handle| members.remove(handle))
            .collect();
        if members.is_empty() {
            self.groups.remove(&group);
        }
        removed
    }

    pub fn handles(&self, group: ObjectGroup) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.groups.get(&group).into_iter().flatten().copied()
    }

    pub fn all(&self) -> impl Iterator<Item = (ObjectGroup, ObjectHandle)> + '_ {
        self.groups
            .iter()
            .flat_map(|(group, handles)| handles.iter().map(move |handle| (*group, *handle)))
    }

    pub fn contains(&self, group: ObjectGroup, handle: ObjectHandle) -> bool {
        self.groups
            .get(&group)
            .is_some_and(|members| members.contains(&handle))
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Empty the registry, returning what it held per group.
    pub fn drain(&mut self) -> Vec<(ObjectGroup, Vec<ObjectHandle>)> {
        std::mem::take(&mut self.groups)
            .into_iter()
            .map(|(group, handles)| (group, handles.into_iter().collect()))
            .collect()
    }
}

// =============================================================================
// Region State Slices
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomState {
    pub phase: Phase,
    pub threshold: f32,
    pub strength: f32,
    pub radius: f32,
    /// Per-group intensity overrides.
    pub groups: BTreeMap<ObjectGroup, f32>,
    pub preset: Option<String>,
    pub last_error: Option<ServiceFailure>,
}

impl Default for BloomState {
    fn default() -> Self {
        Self {
            phase: Phase::Disabled,
            threshold: 0.8,
            strength: 1.5,
            radius: 0.4,
            groups: BTreeMap::new(),
            preset: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbrState {
    pub phase: Phase,
    pub metalness: f32,
    pub roughness: f32,
    pub env_map_intensity: f32,
    pub ambient_light: f32,
    pub directional_light: f32,
    pub preset: Option<String>,
    /// Objects found by the last detection pass.
    pub detected_objects: usize,
    pub last_error: Option<ServiceFailure>,
}

impl Default for PbrState {
    fn default() -> Self {
        Self {
            phase: Phase::Disabled,
            metalness: 0.5,
            roughness: 0.5,
            env_map_intensity: 1.0,
            ambient_light: 0.6,
            directional_light: 1.0,
            preset: None,
            detected_objects: 0,
            last_error: None,
        }
    }
}

/// An environment map that finished loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedHdr {
    pub path: String,
    pub texture: TextureId,
    pub metadata: HdrMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub phase: Phase,
    /// Path of the most recent `LOAD_HDR`; `RETRY` reloads it.
    pub requested_path: Option<String>,
    pub hdr: Option<LoadedHdr>,
    pub background_blur: f32,
    pub background_intensity: f32,
    pub ambient_contribution: f32,
    pub last_error: Option<ServiceFailure>,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            phase: Phase::Disabled,
            requested_path: None,
            hdr: None,
            background_blur: 0.0,
            background_intensity: 1.0,
            ambient_contribution: 0.5,
            last_error: None,
        }
    }
}

// =============================================================================
// Shared Context
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedContext {
    pub bloom: BloomState,
    pub pbr: PbrState,
    pub environment: EnvironmentState,
    pub security: SecurityState,
    pub objects: ObjectsRegistry,
    pub performance: PerformanceSnapshot,
}

impl SharedContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            bloom: BloomState::default(),
            pbr: PbrState::default(),
            environment: EnvironmentState::default(),
            security: SecurityState::default(),
            objects: ObjectsRegistry::default(),
            performance: PerformanceSnapshot::new(now),
        }
    }

    /// Current value of a parameter, whatever the owning region's phase.
    pub fn parameter(&self, parameter: Parameter) -> f32 {
        match parameter {
            Parameter::BloomThreshold => self.bloom.threshold,
            Parameter::BloomStrength => self.bloom.strength,
            Parameter::BloomRadius => self.bloom.radius,
            Parameter::Metalness => self.pbr.metalness,
            Parameter::Roughness => self.pbr.roughness,
            Parameter::EnvMapIntensity => self.pbr.env_map_intensity,
            Parameter::AmbientLight => self.pbr.ambient_light,
            Parameter::DirectionalLight => self.pbr.directional_light,
            Parameter::BackgroundBlur => self.environment.background_blur,
            Parameter::BackgroundIntensity => self.environment.background_intensity,
            Parameter::AmbientContribution => self.environment.ambient_contribution,
        }
    }

    /// Phase of a visual region; security has levels instead of phases.
    pub fn phase(&self, region: RegionId) -> Option<Phase> {
        match region {
            RegionId::Bloom => Some(self.bloom.phase),
            RegionId::Pbr => Some(self.pbr.phase),
            RegionId::Environment => Some(self.environment.phase),
            RegionId::Security => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_deduplicates_per_group() {
        let mut registry = ObjectsRegistry::default();
        let added = registry.insert(ObjectGroup::Iris, &[ObjectHandle(1), ObjectHandle(1), ObjectHandle(2)]);
        assert_eq!(added, vec![ObjectHandle(1), ObjectHandle(2)]);

        let added = registry.insert(ObjectGroup::Iris, &[ObjectHandle(2), ObjectHandle(3)]);
        assert_eq!(added, vec![ObjectHandle(3)]);

        // Same handle may live in another group.
        registry.insert(ObjectGroup::Arms, &[ObjectHandle(1)]);
        assert_eq!(registry.len(), 4);
        assert!(registry.contains(ObjectGroup::Arms, ObjectHandle(1)));
    }

    #[test]
    fn registry_remove_drops_empty_groups() {
        let mut registry = ObjectsRegistry::default();
        registry.insert(ObjectGroup::EyeRings, &[ObjectHandle(7)]);

        let removed = registry.remove(ObjectGroup::EyeRings, &[ObjectHandle(7), ObjectHandle(8)]);
        assert_eq!(removed, vec![ObjectHandle(7)]);
        assert!(registry.is_empty());
        assert!(registry.remove(ObjectGroup::Iris, &[ObjectHandle(1)]).is_empty());
    }

    #[test]
    fn registry_drain_empties() {
        let mut registry = ObjectsRegistry::default();
        registry.insert(ObjectGroup::Iris, &[ObjectHandle(1)]);
        registry.insert(ObjectGroup::MagicRings, &[ObjectHandle(4), ObjectHandle(5)]);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.all().count(), 0);
    }

    #[test]
    fn parameter_lookup_reads_owning_slice() {
        let mut context = SharedContext::new(Utc::now());
        context.pbr.ambient_light = 1.25;
        context.environment.background_blur = 0.3;

        assert_eq!(context.parameter(Parameter::AmbientLight), 1.25);
        assert_eq!(context.parameter(Parameter::BackgroundBlur), 0.3);
        assert_eq!(context.phase(RegionId::Security), None);
    }
}
