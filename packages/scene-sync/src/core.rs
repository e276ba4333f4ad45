//! Core vocabulary shared by every region: identifiers, the command surface,
//! and the signals that travel on the [`EventBus`](crate::bus::EventBus).
//!
//! Commands are a closed set per region. Anything arriving from outside the
//! crate as JSON goes through [`Command::from_json`], which ignores unknown
//! command types instead of failing.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::context::PerformanceSnapshot;
use crate::region::{OperationClass, RegionEvent};
use crate::security::{SecurityEvent, SecurityLevel};
use crate::sync::SyncNotice;

// =============================================================================
// Identifiers
// =============================================================================

/// One of the independently-owned state regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegionId {
    Bloom,
    Pbr,
    Environment,
    Security,
}

impl RegionId {
    pub fn as_str(self) -> &'static str {
        match self {
            RegionId::Bloom => "bloom",
            RegionId::Pbr => "pbr",
            RegionId::Environment => "environment",
            RegionId::Security => "security",
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named group of scene objects that regions address collectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectGroup {
    Iris,
    EyeRings,
    RevealRings,
    MagicRings,
    Arms,
}

impl ObjectGroup {
    pub const ALL: [ObjectGroup; 5] = [
        ObjectGroup::Iris,
        ObjectGroup::EyeRings,
        ObjectGroup::RevealRings,
        ObjectGroup::MagicRings,
        ObjectGroup::Arms,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectGroup::Iris => "iris",
            ObjectGroup::EyeRings => "eyeRings",
            ObjectGroup::RevealRings => "revealRings",
            ObjectGroup::MagicRings => "magicRings",
            ObjectGroup::Arms => "arms",
        }
    }
}

impl fmt::Display for ObjectGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to an object owned by the scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Identifier of a single bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery priority on the bus. Higher priorities are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    /// Parameter updates and bridged commands.
    Routine,
    /// Phase changes, service failures, sync notices.
    Lifecycle,
    /// Security transitions and threat detections.
    Security,
}

// =============================================================================
// Parameters
// =============================================================================

/// A tunable scalar owned by one region.
///
/// Every parameter carries its valid range; out-of-range writes are clamped
/// and reported, never rejected. The serialized names double as the field
/// keys mirrored into the reactive store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parameter {
    #[serde(rename = "bloom.threshold")]
    BloomThreshold,
    #[serde(rename = "bloom.strength")]
    BloomStrength,
    #[serde(rename = "bloom.radius")]
    BloomRadius,
    #[serde(rename = "pbr.metalness")]
    Metalness,
    #[serde(rename = "pbr.roughness")]
    Roughness,
    #[serde(rename = "pbr.envMapIntensity")]
    EnvMapIntensity,
    #[serde(rename = "lighting.ambient")]
    AmbientLight,
    #[serde(rename = "lighting.directional")]
    DirectionalLight,
    #[serde(rename = "background.blur")]
    BackgroundBlur,
    #[serde(rename = "background.intensity")]
    BackgroundIntensity,
    #[serde(rename = "environment.ambientContribution")]
    AmbientContribution,
}

/// Valid range for per-group bloom intensity.
pub const GROUP_INTENSITY_RANGE: (f32, f32) = (0.0, 3.0);

impl Parameter {
    pub const ALL: [Parameter; 11] = [
        Parameter::BloomThreshold,
        Parameter::BloomStrength,
        Parameter::BloomRadius,
        Parameter::Metalness,
        Parameter::Roughness,
        Parameter::EnvMapIntensity,
        Parameter::AmbientLight,
        Parameter::DirectionalLight,
        Parameter::BackgroundBlur,
        Parameter::BackgroundIntensity,
        Parameter::AmbientContribution,
    ];

    /// Inclusive `(min, max)` range.
    pub fn bounds(self) -> (f32, f32) {
        match self {
            Parameter::BloomThreshold => (0.0, 1.0),
            Parameter::BloomStrength => (0.0, 3.0),
            Parameter::BloomRadius => (0.0, 1.0),
            Parameter::Metalness => (0.0, 1.0),
            Parameter::Roughness => (0.0, 1.0),
            Parameter::EnvMapIntensity => (0.0, 3.0),
            Parameter::AmbientLight => (0.0, 2.0),
            Parameter::DirectionalLight => (0.0, 5.0),
            Parameter::BackgroundBlur => (0.0, 1.0),
            Parameter::BackgroundIntensity => (0.0, 2.0),
            Parameter::AmbientContribution => (0.0, 1.0),
        }
    }

    /// Clamp a requested value into range. NaN maps to the lower bound.
    pub fn clamp(self, requested: f32) -> f32 {
        let (min, max) = self.bounds();
        clamp_to(requested, min, max)
    }

    pub fn region(self) -> RegionId {
        match self {
            Parameter::BloomThreshold | Parameter::BloomStrength | Parameter::BloomRadius => {
                RegionId::Bloom
            }
            Parameter::Metalness
            | Parameter::Roughness
            | Parameter::EnvMapIntensity
            | Parameter::AmbientLight
            | Parameter::DirectionalLight => RegionId::Pbr,
            Parameter::BackgroundBlur
            | Parameter::BackgroundIntensity
            | Parameter::AmbientContribution => RegionId::Environment,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Parameter::BloomThreshold => "bloom.threshold",
            Parameter::BloomStrength => "bloom.strength",
            Parameter::BloomRadius => "bloom.radius",
            Parameter::Metalness => "pbr.metalness",
            Parameter::Roughness => "pbr.roughness",
            Parameter::EnvMapIntensity => "pbr.envMapIntensity",
            Parameter::AmbientLight => "lighting.ambient",
            Parameter::DirectionalLight => "lighting.directional",
            Parameter::BackgroundBlur => "background.blur",
            Parameter::BackgroundIntensity => "background.intensity",
            Parameter::AmbientContribution => "environment.ambientContribution",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn clamp_to(requested: f32, min: f32, max: f32) -> f32 {
    if requested.is_nan() {
        return min;
    }
    requested.clamp(min, max)
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BloomCommand {
    Enable,
    Disable,
    Retry,
    UpdateGlobal {
        threshold: Option<f32>,
        strength: Option<f32>,
        radius: Option<f32>,
    },
    UpdateGroup {
        group: ObjectGroup,
        intensity: f32,
    },
    ApplyPreset {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PbrCommand {
    Enable,
    Disable,
    Retry,
    UpdateMaterial {
        metalness: Option<f32>,
        roughness: Option<f32>,
        #[serde(rename = "envMapIntensity")]
        env_map_intensity: Option<f32>,
    },
    UpdateLighting {
        ambient: Option<f32>,
        directional: Option<f32>,
    },
    ApplyPreset {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentCommand {
    LoadHdr { path: String },
    Disable,
    Retry,
    UpdateBackground { blur: Option<f32>, intensity: Option<f32> },
    UpdateAmbient { contribution: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityCommand {
    /// Operator override. Always allowed unless a transition is in flight.
    SetSecurity { level: SecurityLevel },
    /// Preset application, guarded by its own circuit breaker.
    SetPreset { level: SecurityLevel },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemCommand {
    UpdatePerformance {
        fps: f64,
        #[serde(rename = "frameTime")]
        frame_time_ms: f64,
        #[serde(rename = "memoryMb")]
        memory_mb: Option<f64>,
        #[serde(rename = "cpuPercent")]
        cpu_percent: Option<f64>,
    },
    RegisterObjects {
        group: ObjectGroup,
        handles: Vec<ObjectHandle>,
    },
    UnregisterObjects {
        group: ObjectGroup,
        handles: Vec<ObjectHandle>,
    },
    ContextLost,
    ContextRestored,
    Tick,
    Dispose,
}

/// Everything the coordinator accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Bloom(BloomCommand),
    Pbr(PbrCommand),
    Environment(EnvironmentCommand),
    Security(SecurityCommand),
    System(SystemCommand),
}

impl Command {
    /// Parse a `{"type": "BLOOM.UPDATE_GLOBAL", ...}` object.
    ///
    /// Unknown command types and malformed payloads yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Command> {
        let type_name = value.get("type")?.as_str()?;
        let Some((prefix, action)) = type_name.split_once('.') else {
            debug!(command = type_name, "ignoring command without a region prefix");
            return None;
        };

        let mut payload = value.clone();
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("type".into(), serde_json::Value::String(action.to_string()));
        }

        let parsed = match prefix {
            "BLOOM" => serde_json::from_value(payload).map(Command::Bloom),
            "PBR" => serde_json::from_value(payload).map(Command::Pbr),
            "ENV" => serde_json::from_value(payload).map(Command::Environment),
            "SECURITY" => serde_json::from_value(payload).map(Command::Security),
            "SYSTEM" => serde_json::from_value(payload).map(Command::System),
            _ => {
                debug!(command = type_name, "ignoring unknown command type");
                return None;
            }
        };

        match parsed {
            Ok(command) => Some(command),
            Err(error) => {
                warn!(command = type_name, %error, "ignoring unparseable command");
                None
            }
        }
    }

    /// Wire name, e.g. `"ENV.LOAD_HDR"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Bloom(c) => match c {
                BloomCommand::Enable => "BLOOM.ENABLE",
                BloomCommand::Disable => "BLOOM.DISABLE",
                BloomCommand::Retry => "BLOOM.RETRY",
                BloomCommand::UpdateGlobal { .. } => "BLOOM.UPDATE_GLOBAL",
                BloomCommand::UpdateGroup { .. } => "BLOOM.UPDATE_GROUP",
                BloomCommand::ApplyPreset { .. } => "BLOOM.APPLY_PRESET",
            },
            Command::Pbr(c) => match c {
                PbrCommand::Enable => "PBR.ENABLE",
                PbrCommand::Disable => "PBR.DISABLE",
                PbrCommand::Retry => "PBR.RETRY",
                PbrCommand::UpdateMaterial { .. } => "PBR.UPDATE_MATERIAL",
                PbrCommand::UpdateLighting { .. } => "PBR.UPDATE_LIGHTING",
                PbrCommand::ApplyPreset { .. } => "PBR.APPLY_PRESET",
            },
            Command::Environment(c) => match c {
                EnvironmentCommand::LoadHdr { .. } => "ENV.LOAD_HDR",
                EnvironmentCommand::Disable => "ENV.DISABLE",
                EnvironmentCommand::Retry => "ENV.RETRY",
                EnvironmentCommand::UpdateBackground { .. } => "ENV.UPDATE_BACKGROUND",
                EnvironmentCommand::UpdateAmbient { .. } => "ENV.UPDATE_AMBIENT",
            },
            Command::Security(c) => match c {
                SecurityCommand::SetSecurity { .. } => "SECURITY.SET_SECURITY",
                SecurityCommand::SetPreset { .. } => "SECURITY.SET_PRESET",
            },
            Command::System(c) => match c {
                SystemCommand::UpdatePerformance { .. } => "SYSTEM.UPDATE_PERFORMANCE",
                SystemCommand::RegisterObjects { .. } => "SYSTEM.REGISTER_OBJECTS",
                SystemCommand::UnregisterObjects { .. } => "SYSTEM.UNREGISTER_OBJECTS",
                SystemCommand::ContextLost => "SYSTEM.CONTEXT_LOST",
                SystemCommand::ContextRestored => "SYSTEM.CONTEXT_RESTORED",
                SystemCommand::Tick => "SYSTEM.TICK",
                SystemCommand::Dispose => "SYSTEM.DISPOSE",
            },
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Coordinator-level facts that belong to no single region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemEvent {
    PerformanceUpdated(PerformanceSnapshot),
    ObjectsRegistered { group: ObjectGroup, count: usize },
    ObjectsReleased { group: ObjectGroup, count: usize },
    CircuitStateChanged {
        operation: OperationClass,
        state: BreakerState,
    },
    Disposed,
}

/// Payload carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Region(RegionEvent),
    Security(SecurityEvent),
    System(SystemEvent),
    Sync(SyncNotice),
    /// A command addressed to the coordinator, usually produced by a bridge.
    Command(Command),
}

/// Subscription key. Each signal belongs to exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Region(RegionId),
    Security,
    System,
    Sync,
    Command,
}

impl Signal {
    pub fn topic(&self) -> Topic {
        match self {
            Signal::Region(event) => Topic::Region(event.region()),
            Signal::Security(_) => Topic::Security,
            Signal::System(_) => Topic::System,
            Signal::Sync(_) => Topic::Sync,
            Signal::Command(_) => Topic::Command,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Signal::Security(_) => Priority::Security,
            Signal::Region(RegionEvent::PhaseChanged { .. })
            | Signal::Region(RegionEvent::ServiceFailed { .. })
            | Signal::System(_)
            | Signal::Sync(_) => Priority::Lifecycle,
            Signal::Region(_) | Signal::Command(_) => Priority::Routine,
        }
    }
}

/// A signal plus routing metadata.
///
/// `root` is shared by every event derived from the same original publish,
/// which is what lets bridges detect that they already fired for a cascade.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: EventId,
    pub root: EventId,
    pub priority: Priority,
    pub signal: Signal,
    /// Bridges this event passed through, oldest first.
    pub hops: SmallVec<[&'static str; 2]>,
}

impl EventEnvelope {
    pub fn new(signal: Signal) -> Self {
        let id = EventId::new();
        Self {
            id,
            root: id,
            priority: signal.priority(),
            signal,
            hops: SmallVec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// A follow-up event caused by handling this one, same cascade.
    pub(crate) fn derived(&self, signal: Signal) -> Self {
        Self {
            id: EventId::new(),
            root: self.root,
            priority: signal.priority(),
            signal,
            hops: self.hops.clone(),
        }
    }

    pub(crate) fn bridged(&self, bridge: &'static str, signal: Signal) -> Self {
        let mut hops = self.hops.clone();
        hops.push(bridge);
        Self {
            id: EventId::new(),
            root: self.root,
            priority: signal.priority(),
            signal,
            hops,
        }
    }
}
