//! Bloom post-processing region.

use tracing::{debug, warn};

use super::{
    apply_parameters, fail, ignored, Region, RegionEvent, RegionRecord, RegionScope,
    ServiceOutcome, ServiceRequest, ServiceResult,
};
use crate::context::{BloomState, Phase};
use crate::core::{clamp_to, BloomCommand, Command, Parameter, RegionId, GROUP_INTENSITY_RANGE};
use crate::error::ServiceFailure;
use crate::services::MaterialProperty;

/// `(name, threshold, strength, radius)`
const PRESETS: &[(&str, f32, f32, f32)] = &[
    ("subtle", 0.9, 0.8, 0.2),
    ("balanced", 0.8, 1.5, 0.4),
    ("dramatic", 0.6, 2.5, 0.8),
];

impl RegionRecord for BloomState {
    const REGION: RegionId = RegionId::Bloom;

    fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn set_failure(&mut self, failure: Option<ServiceFailure>) {
        self.last_error = failure;
    }

    fn parameter_mut(&mut self, parameter: Parameter) -> Option<&mut f32> {
        match parameter {
            Parameter::BloomThreshold => Some(&mut self.threshold),
            Parameter::BloomStrength => Some(&mut self.strength),
            Parameter::BloomRadius => Some(&mut self.radius),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct BloomRegion;

impl BloomRegion {
    fn activate(&self, scope: &mut RegionScope<'_, BloomState>) {
        scope.state_mut().last_error = None;
        scope.transition(Phase::Activating);
        let handles = scope.objects().all().map(|(_, handle)| handle).collect();
        scope.request(ServiceRequest::PrepareBloom { handles });
    }

    fn disable(&self, scope: &mut RegionScope<'_, BloomState>) {
        scope.apply_to_all(MaterialProperty::BloomLayer, 0.0);
        scope.state_mut().last_error = None;
        scope.transition(Phase::Disabled);
    }

    fn update_group(&self, scope: &mut RegionScope<'_, BloomState>, group: crate::core::ObjectGroup, requested: f32) {
        let (min, max) = GROUP_INTENSITY_RANGE;
        let intensity = clamp_to(requested, min, max);
        if intensity != requested {
            debug!(%group, requested, intensity, "group intensity clamped");
        }

        let previous = scope.state_mut().groups.insert(group, intensity);
        if previous == Some(intensity) {
            return;
        }
        scope.transition(Phase::Updating);
        scope.apply_to_group(group, MaterialProperty::EmissiveIntensity, intensity);
        scope.emit(RegionEvent::GroupIntensityChanged { group, intensity });
    }

    fn apply_preset(&self, scope: &mut RegionScope<'_, BloomState>, name: &str) {
        let Some(&(_, threshold, strength, radius)) =
            PRESETS.iter().find(|(preset, ..)| *preset == name)
        else {
            warn!(preset = name, "unknown bloom preset ignored");
            return;
        };

        apply_parameters(
            scope,
            &[
                (Parameter::BloomThreshold, Some(threshold)),
                (Parameter::BloomStrength, Some(strength)),
                (Parameter::BloomRadius, Some(radius)),
            ],
        );
        scope.state_mut().preset = Some(name.to_string());
        scope.emit(RegionEvent::PresetApplied {
            region: RegionId::Bloom,
            name: name.to_string(),
        });
    }
}

impl Region for BloomRegion {
    type State = BloomState;

    fn on_command(&mut self, command: &Command, scope: &mut RegionScope<'_, BloomState>) {
        let Command::Bloom(bloom) = command else {
            return;
        };

        match (scope.phase(), bloom) {
            (Phase::Disabled, BloomCommand::Enable) | (Phase::Error, BloomCommand::Retry) => {
                self.activate(scope)
            }
            (Phase::Active | Phase::Updating | Phase::Error, BloomCommand::Disable) => {
                self.disable(scope)
            }
            (
                phase,
                BloomCommand::UpdateGlobal {
                    threshold,
                    strength,
                    radius,
                },
            ) if phase.accepts_updates() => {
                let applied = apply_parameters(
                    scope,
                    &[
                        (Parameter::BloomThreshold, *threshold),
                        (Parameter::BloomStrength, *strength),
                        (Parameter::BloomRadius, *radius),
                    ],
                );
                if !applied.is_empty() {
                    scope.state_mut().preset = None;
                }
            }
            (phase, BloomCommand::UpdateGroup { group, intensity }) if phase.accepts_updates() => {
                self.update_group(scope, *group, *intensity)
            }
            (phase, BloomCommand::ApplyPreset { name }) if phase.accepts_updates() => {
                self.apply_preset(scope, name)
            }
            _ => ignored(scope, command),
        }
    }

    fn on_outcome(&mut self, outcome: ServiceOutcome, scope: &mut RegionScope<'_, BloomState>) {
        match outcome {
            Ok(ServiceResult::BloomPrepared { count }) => {
                debug!(objects = count, "bloom layer prepared");
                scope.transition(Phase::Active);
            }
            Ok(other) => warn!(outcome = ?other, "unexpected outcome for bloom"),
            Err(failure) => fail(scope, failure),
        }
    }
}
