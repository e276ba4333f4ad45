//! Physically-based materials and scene lighting.
//!
//! Activation runs an object-detection pass; detected objects are added to
//! the shared registry and receive the current material immediately.

use std::collections::BTreeMap;

use tracing::{info, warn};

use super::{
    apply_parameters, fail, ignored, Region, RegionEvent, RegionRecord, RegionScope,
    ServiceOutcome, ServiceRequest, ServiceResult,
};
use crate::context::{PbrState, Phase};
use crate::core::{Command, ObjectGroup, ObjectHandle, Parameter, PbrCommand, RegionId};
use crate::error::ServiceFailure;
use crate::services::MaterialProperty;

/// `(name, metalness, roughness, envMapIntensity)`
const PRESETS: &[(&str, f32, f32, f32)] = &[
    ("matte", 0.0, 0.9, 0.5),
    ("satin", 0.3, 0.45, 1.0),
    ("chrome", 1.0, 0.05, 2.0),
];

impl RegionRecord for PbrState {
    const REGION: RegionId = RegionId::Pbr;

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
            Parameter::Metalness => Some(&mut self.metalness),
            Parameter::Roughness => Some(&mut self.roughness),
            Parameter::EnvMapIntensity => Some(&mut self.env_map_intensity),
            Parameter::AmbientLight => Some(&mut self.ambient_light),
            Parameter::DirectionalLight => Some(&mut self.directional_light),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PbrRegion;

impl PbrRegion {
    fn activate(&self, scope: &mut RegionScope<'_, PbrState>) {
        scope.state_mut().last_error = None;
        scope.transition(Phase::Activating);
        scope.request(ServiceRequest::DetectObjects);
    }

    fn update_material(
        &self,
        scope: &mut RegionScope<'_, PbrState>,
        requested: &[(Parameter, Option<f32>)],
    ) {
        let applied = apply_parameters(scope, requested);
        for (parameter, value) in &applied {
            if let Some(property) = MaterialProperty::for_parameter(*parameter) {
                scope.apply_to_all(property, *value);
            }
        }
    }

    fn apply_preset(&self, scope: &mut RegionScope<'_, PbrState>, name: &str) {
        let Some(&(_, metalness, roughness, env_map)) =
            PRESETS.iter().find(|(preset, ..)| *preset == name)
        else {
            warn!(preset = name, "unknown material preset ignored");
            return;
        };

        self.update_material(
            scope,
            &[
                (Parameter::Metalness, Some(metalness)),
                (Parameter::Roughness, Some(roughness)),
                (Parameter::EnvMapIntensity, Some(env_map)),
            ],
        );
        scope.state_mut().preset = Some(name.to_string());
        scope.emit(RegionEvent::PresetApplied {
            region: RegionId::Pbr,
            name: name.to_string(),
        });
    }

    fn adopt(&self, scope: &mut RegionScope<'_, PbrState>, detected: Vec<(ObjectGroup, ObjectHandle)>) {
        let mut grouped: BTreeMap<ObjectGroup, Vec<ObjectHandle>> = BTreeMap::new();
        for (group, handle) in &detected {
            grouped.entry(*group).or_default().push(*handle);
        }

        let mut added = 0;
        for (group, handles) in grouped {
            added += scope.register(group, &handles);
        }
        info!(detected = detected.len(), added, "pbr objects detected");

        scope.state_mut().detected_objects = detected.len();
        scope.emit(RegionEvent::ObjectsDetected {
            count: detected.len(),
        });

        let state = scope.state();
        let material = [
            (MaterialProperty::Metalness, state.metalness),
            (MaterialProperty::Roughness, state.roughness),
            (MaterialProperty::EnvMapIntensity, state.env_map_intensity),
        ];
        for (property, value) in material {
            scope.apply_to_all(property, value);
        }
        scope.transition(Phase::Active);
    }
}

impl Region for PbrRegion {
    type State = PbrState;

    fn on_command(&mut self, command: &Command, scope: &mut RegionScope<'_, PbrState>) {
        let Command::Pbr(pbr) = command else {
            return;
        };

        match (scope.phase(), pbr) {
            (Phase::Disabled, PbrCommand::Enable) | (Phase::Error, PbrCommand::Retry) => {
                self.activate(scope)
            }
            (Phase::Active | Phase::Updating | Phase::Error, PbrCommand::Disable) => {
                scope.state_mut().last_error = None;
                scope.transition(Phase::Disabled);
            }
            (
                phase,
                PbrCommand::UpdateMaterial {
                    metalness,
                    roughness,
                    env_map_intensity,
                },
            ) if phase.accepts_updates() => {
                self.update_material(
                    scope,
                    &[
                        (Parameter::Metalness, *metalness),
                        (Parameter::Roughness, *roughness),
                        (Parameter::EnvMapIntensity, *env_map_intensity),
                    ],
                );
                scope.state_mut().preset = None;
            }
            (phase, PbrCommand::UpdateLighting { ambient, directional })
                if phase.accepts_updates() =>
            {
                apply_parameters(
                    scope,
                    &[
                        (Parameter::AmbientLight, *ambient),
                        (Parameter::DirectionalLight, *directional),
                    ],
                );
            }
            (phase, PbrCommand::ApplyPreset { name }) if phase.accepts_updates() => {
                self.apply_preset(scope, name)
            }
            _ => ignored(scope, command),
        }
    }

    fn on_outcome(&mut self, outcome: ServiceOutcome, scope: &mut RegionScope<'_, PbrState>) {
        match outcome {
            Ok(ServiceResult::ObjectsDetected(detected)) => self.adopt(scope, detected),
            Ok(other) => warn!(outcome = ?other, "unexpected outcome for pbr"),
            Err(failure) => fail(scope, failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ObjectsRegistry;
    use crate::region::{step, RegionInput, SceneOp};

    fn command(c: PbrCommand) -> RegionInput {
        RegionInput::Command(Command::Pbr(c))
    }

    #[test]
    fn detection_registers_objects_and_applies_material() {
        let mut state = PbrState {
            phase: Phase::Activating,
            ..PbrState::default()
        };
        let mut objects = ObjectsRegistry::default();
        objects.insert(ObjectGroup::Iris, &[ObjectHandle(1)]);

        let effects = step(
            &mut PbrRegion,
            &mut state,
            &mut objects,
            RegionInput::Outcome(Ok(ServiceResult::ObjectsDetected(vec![
                (ObjectGroup::Iris, ObjectHandle(1)),
                (ObjectGroup::Arms, ObjectHandle(20)),
                (ObjectGroup::Arms, ObjectHandle(21)),
            ]))),
        );

        assert_eq!(state.phase, Phase::Active);
        assert_eq!(state.detected_objects, 3);
        assert_eq!(objects.len(), 3);
        // Only the newly added handles go to the scene.
        assert!(effects.scene.contains(&SceneOp::Register {
            group: ObjectGroup::Arms,
            handles: vec![ObjectHandle(20), ObjectHandle(21)],
        }));
        assert!(!effects
            .scene
            .iter()
            .any(|op| matches!(op, SceneOp::Register { group: ObjectGroup::Iris, .. })));
        let metalness_writes = effects
            .scene
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    SceneOp::SetProperty {
                        property: MaterialProperty::Metalness,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(metalness_writes, 3);
    }

    #[test]
    fn material_update_clamps_each_field() {
        let mut state = PbrState {
            phase: Phase::Active,
            ..PbrState::default()
        };
        let mut objects = ObjectsRegistry::default();

        let effects = step(
            &mut PbrRegion,
            &mut state,
            &mut objects,
            command(PbrCommand::UpdateMaterial {
                metalness: Some(-0.5),
                roughness: Some(0.25),
                env_map_intensity: Some(9.0),
            }),
        );

        assert_eq!(state.metalness, 0.0);
        assert_eq!(state.roughness, 0.25);
        assert_eq!(state.env_map_intensity, 3.0);
        let corrections = effects
            .events
            .iter()
            .filter(|e| matches!(e, RegionEvent::ParameterCorrected { .. }))
            .count();
        assert_eq!(corrections, 2);
    }

    #[test]
    fn lighting_update_is_ignored_while_activating() {
        let mut state = PbrState {
            phase: Phase::Activating,
            ..PbrState::default()
        };
        let before = state.clone();
        let mut objects = ObjectsRegistry::default();

        step(
            &mut PbrRegion,
            &mut state,
            &mut objects,
            command(PbrCommand::UpdateLighting {
                ambient: Some(1.5),
                directional: None,
            }),
        );

        assert_eq!(state, before);
    }

    #[test]
    fn chrome_preset() {
        let mut state = PbrState {
            phase: Phase::Active,
            ..PbrState::default()
        };
        let mut objects = ObjectsRegistry::default();

        step(
            &mut PbrRegion,
            &mut state,
            &mut objects,
            command(PbrCommand::ApplyPreset {
                name: "chrome".into(),
            }),
        );

        assert_eq!(state.metalness, 1.0);
        assert_eq!(state.roughness, 0.05);
        assert_eq!(state.preset.as_deref(), Some("chrome"));
    }
}
