//! Visual regions: pure state machines over their own context slice.
//!
//! A region never performs IO. It reacts to a [`Command`] or to the outcome
//! of a service call it requested earlier, mutates only the slice it owns,
//! and records side effects (bus events, service requests, scene operations)
//! in an [`Effects`] outbox that the coordinator executes afterwards.
//!
//! ```text
//!            ENABLE / LOAD_HDR               service ok
//! Disabled ───────────────────► Activating ─────────────► Active ◄──┐
//!    ▲                             │                       │       │ flushed
//!    │ DISABLE                     │ service failed        ▼       │
//!    └──────────── Error ◄─────────┘                    Updating ──┘
//!                  │  ▲
//!            RETRY │  │ failed again
//!                  ▼  │
//!               Activating
//!
//! CONTEXT_LOST: any phase → Halted      CONTEXT_RESTORED: Halted → Disabled
//! ```
//!
//! Commands that are invalid for the current phase are dropped. Regions do
//! not buffer commands across phases.

pub mod bloom;
pub mod environment;
pub mod pbr;

pub use bloom::BloomRegion;
pub use environment::EnvironmentRegion;
pub use pbr::PbrRegion;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::context::{ObjectsRegistry, Phase};
use crate::core::{Command, ObjectGroup, ObjectHandle, Parameter, RegionId, SystemCommand};
use crate::error::ServiceFailure;
use crate::services::{HdrAsset, MaterialProperty, TextureId};

// =============================================================================
// Service Requests
// =============================================================================

/// Each class of collaborator call has its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationClass {
    BloomSetup,
    ObjectDetection,
    HdrLoad,
    ObjectRegistration,
    SecurityPreset,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::BloomSetup => "bloom-setup",
            OperationClass::ObjectDetection => "object-detection",
            OperationClass::HdrLoad => "hdr-load",
            OperationClass::ObjectRegistration => "object-registration",
            OperationClass::SecurityPreset => "security-preset",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Async work a region asks the coordinator to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    /// Put the given objects on the bloom layer.
    PrepareBloom { handles: Vec<ObjectHandle> },
    DetectObjects,
    LoadHdr { path: String },
}

impl ServiceRequest {
    pub fn class(&self) -> OperationClass {
        match self {
            ServiceRequest::PrepareBloom { .. } => OperationClass::BloomSetup,
            ServiceRequest::DetectObjects => OperationClass::ObjectDetection,
            ServiceRequest::LoadHdr { .. } => OperationClass::HdrLoad,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResult {
    BloomPrepared { count: usize },
    ObjectsDetected(Vec<(ObjectGroup, ObjectHandle)>),
    HdrLoaded(HdrAsset),
}

pub type ServiceOutcome = Result<ServiceResult, ServiceFailure>;

/// Synchronous scene mutation, applied by the coordinator after the region
/// returns.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneOp {
    Register {
        group: ObjectGroup,
        handles: Vec<ObjectHandle>,
    },
    Unregister {
        group: ObjectGroup,
        handles: Vec<ObjectHandle>,
    },
    SetProperty {
        handle: ObjectHandle,
        property: MaterialProperty,
        value: f32,
    },
}

// =============================================================================
// Region Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionEvent {
    PhaseChanged {
        region: RegionId,
        from: Phase,
        to: Phase,
    },
    ParametersApplied {
        region: RegionId,
        values: Vec<(Parameter, f32)>,
    },
    /// A requested value was outside its range and was clamped.
    ParameterCorrected {
        parameter: Parameter,
        requested: f32,
        applied: f32,
    },
    GroupIntensityChanged {
        group: ObjectGroup,
        intensity: f32,
    },
    PresetApplied {
        region: RegionId,
        name: String,
    },
    ServiceFailed {
        region: RegionId,
        failure: ServiceFailure,
    },
    HdrLoaded {
        path: String,
        texture: TextureId,
    },
    ObjectsDetected {
        count: usize,
    },
}

impl RegionEvent {
    pub fn region(&self) -> RegionId {
        match self {
            RegionEvent::PhaseChanged { region, .. }
            | RegionEvent::ParametersApplied { region, .. }
            | RegionEvent::PresetApplied { region, .. }
            | RegionEvent::ServiceFailed { region, .. } => *region,
            RegionEvent::ParameterCorrected { parameter, .. } => parameter.region(),
            RegionEvent::GroupIntensityChanged { .. } => RegionId::Bloom,
            RegionEvent::HdrLoaded { .. } => RegionId::Environment,
            RegionEvent::ObjectsDetected { .. } => RegionId::Pbr,
        }
    }

    /// Events that count as a reconfiguration of the scene.
    pub fn is_context_change(&self) -> bool {
        matches!(
            self,
            RegionEvent::ParametersApplied { .. }
                | RegionEvent::GroupIntensityChanged { .. }
                | RegionEvent::PresetApplied { .. }
                | RegionEvent::HdrLoaded { .. }
        )
    }
}

// =============================================================================
// Region Trait
// =============================================================================

/// Side effects recorded by a region during one step.
#[derive(Debug, Default)]
pub struct Effects {
    pub events: Vec<RegionEvent>,
    pub requests: Vec<ServiceRequest>,
    pub scene: Vec<SceneOp>,
}

/// A region's state slice, as seen by the generic helpers below.
pub trait RegionRecord: Send + 'static {
    const REGION: RegionId;

    fn phase(&self) -> Phase;

    fn set_phase(&mut self, phase: Phase);

    fn set_failure(&mut self, failure: Option<ServiceFailure>);

    /// Storage for a parameter this region owns.
    fn parameter_mut(&mut self, parameter: Parameter) -> Option<&mut f32>;
}

/// Exclusive access to one region's slice for the duration of a step.
pub struct RegionScope<'a, S> {
    state: &'a mut S,
    objects: &'a mut ObjectsRegistry,
    effects: &'a mut Effects,
}

impl<'a, S: RegionRecord> RegionScope<'a, S> {
    pub fn new(state: &'a mut S, objects: &'a mut ObjectsRegistry, effects: &'a mut Effects) -> Self {
        Self {
            state,
            objects,
            effects,
        }
    }

    pub fn state(&self) -> &S {
        &*self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut *self.state
    }

    pub fn objects(&self) -> &ObjectsRegistry {
        &*self.objects
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Move to `to`, publishing a phase change unless it is the transient
    /// Active/Updating hop.
    pub fn transition(&mut self, to: Phase) {
        let from = self.state.phase();
        if from == to {
            return;
        }
        self.state.set_phase(to);

        if matches!((from, to), (Phase::Active, Phase::Updating) | (Phase::Updating, Phase::Active)) {
            trace!(region = %S::REGION, %from, %to, "region phase");
            return;
        }
        debug!(region = %S::REGION, %from, %to, "region phase changed");
        self.effects.events.push(RegionEvent::PhaseChanged {
            region: S::REGION,
            from,
            to,
        });
    }

    /// Clamp a requested value into the parameter's range, reporting any
    /// correction.
    pub fn clamp(&mut self, parameter: Parameter, requested: f32) -> f32 {
        let applied = parameter.clamp(requested);
        if applied != requested {
            debug!(%parameter, requested, applied, "parameter clamped");
            self.effects.events.push(RegionEvent::ParameterCorrected {
                parameter,
                requested,
                applied,
            });
        }
        applied
    }

    pub fn emit(&mut self, event: RegionEvent) {
        self.effects.events.push(event);
    }

    pub fn request(&mut self, request: ServiceRequest) {
        self.effects.requests.push(request);
    }

    pub fn scene(&mut self, op: SceneOp) {
        self.effects.scene.push(op);
    }

    /// Add objects to the registry and mirror the newly added ones to the scene.
    pub fn register(&mut self, group: ObjectGroup, handles: &[ObjectHandle]) -> usize {
        let added = self.objects.insert(group, handles);
        let count = added.len();
        if !added.is_empty() {
            self.effects.scene.push(SceneOp::Register {
                group,
                handles: added,
            });
        }
        count
    }

    /// Set a material property on every registered object.
    pub fn apply_to_all(&mut self, property: MaterialProperty, value: f32) {
        let ops: Vec<SceneOp> = self
            .objects
            .all()
            .map(|(_, handle)| SceneOp::SetProperty {
                handle,
                property,
                value,
            })
            .collect();
        self.effects.scene.extend(ops);
    }

    /// Set a material property on every object of one group.
    pub fn apply_to_group(&mut self, group: ObjectGroup, property: MaterialProperty, value: f32) {
        let ops: Vec<SceneOp> = self
            .objects
            .handles(group)
            .map(|handle| SceneOp::SetProperty {
                handle,
                property,
                value,
            })
            .collect();
        self.effects.scene.extend(ops);
    }
}

/// A visual region's transition logic.
pub trait Region: Send + 'static {
    type State: RegionRecord;

    fn on_command(&mut self, command: &Command, scope: &mut RegionScope<'_, Self::State>);

    /// Outcome of a request this region made while `Activating`.
    fn on_outcome(&mut self, outcome: ServiceOutcome, scope: &mut RegionScope<'_, Self::State>);
}

/// Input for one region step.
#[derive(Debug, Clone)]
pub enum RegionInput {
    Command(Command),
    Outcome(ServiceOutcome),
}

/// Run one step of a region and return what it recorded.
pub fn step<R: Region>(
    region: &mut R,
    state: &mut R::State,
    objects: &mut ObjectsRegistry,
    input: RegionInput,
) -> Effects {
    let mut effects = Effects::default();
    let mut scope = RegionScope::new(state, objects, &mut effects);
    match input {
        RegionInput::Command(command) => {
            if !handle_context_signal(&command, &mut scope) && scope.phase() != Phase::Halted {
                region.on_command(&command, &mut scope);
            }
        }
        RegionInput::Outcome(outcome) => {
            if scope.phase() == Phase::Activating {
                region.on_outcome(outcome, &mut scope);
            } else {
                let region = <R::State as RegionRecord>::REGION;
                debug!(
                    %region,
                    phase = %scope.phase(),
                    "dropping service outcome outside activation"
                );
            }
        }
    }
    effects
}

/// Finish a transient update once its scene operations have been flushed.
pub fn settle<S: RegionRecord>(state: &mut S) {
    if state.phase() == Phase::Updating {
        state.set_phase(Phase::Active);
    }
}

/// Context loss and restoration apply to every visual region alike.
fn handle_context_signal<S: RegionRecord>(command: &Command, scope: &mut RegionScope<'_, S>) -> bool {
    match command {
        Command::System(SystemCommand::ContextLost) => {
            scope.transition(Phase::Halted);
            true
        }
        Command::System(SystemCommand::ContextRestored) => {
            if scope.phase() == Phase::Halted {
                scope.state_mut().set_failure(None);
                scope.transition(Phase::Disabled);
            }
            true
        }
        _ => false,
    }
}

/// Record a failed service call. Fatal failures halt the region.
pub(crate) fn fail<S: RegionRecord>(scope: &mut RegionScope<'_, S>, failure: ServiceFailure) {
    warn!(region = %S::REGION, %failure, "region service failed");
    let to = if failure.is_fatal() {
        Phase::Halted
    } else {
        Phase::Error
    };
    scope.state_mut().set_failure(Some(failure.clone()));
    scope.transition(to);
    scope.emit(RegionEvent::ServiceFailed {
        region: S::REGION,
        failure,
    });
}

/// Clamp and store every provided value, emitting one `ParametersApplied`.
pub(crate) fn apply_parameters<S: RegionRecord>(
    scope: &mut RegionScope<'_, S>,
    requested: &[(Parameter, Option<f32>)],
) -> Vec<(Parameter, f32)> {
    let mut applied = Vec::new();
    for &(parameter, value) in requested {
        let Some(value) = value else { continue };
        let value = scope.clamp(parameter, value);
        match scope.state_mut().parameter_mut(parameter) {
            Some(slot) => {
                *slot = value;
                applied.push((parameter, value));
            }
            None => warn!(region = %S::REGION, %parameter, "parameter not owned by region"),
        }
    }

    if !applied.is_empty() {
        scope.transition(Phase::Updating);
        scope.emit(RegionEvent::ParametersApplied {
            region: S::REGION,
            values: applied.clone(),
        });
    }
    applied
}

pub(crate) fn ignored<S: RegionRecord>(scope: &RegionScope<'_, S>, command: &Command) {
    trace!(
        region = %S::REGION,
        phase = %scope.phase(),
        command = command.kind(),
        "command not applicable in current phase"
    );
}
