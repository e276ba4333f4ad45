//! HDR environment map, background and ambient contribution.

use tracing::{debug, warn};

use super::{
    apply_parameters, fail, ignored, Region, RegionEvent, RegionRecord, RegionScope,
    ServiceOutcome, ServiceRequest, ServiceResult,
};
use crate::context::{EnvironmentState, LoadedHdr, Phase};
use crate::core::{Command, EnvironmentCommand, Parameter, RegionId};
use crate::error::ServiceFailure;

impl RegionRecord for EnvironmentState {
    const REGION: RegionId = RegionId::Environment;

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
            Parameter::BackgroundBlur => Some(&mut self.background_blur),
            Parameter::BackgroundIntensity => Some(&mut self.background_intensity),
            Parameter::AmbientContribution => Some(&mut self.ambient_contribution),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct EnvironmentRegion;

impl EnvironmentRegion {
    fn load(&self, scope: &mut RegionScope<'_, EnvironmentState>, path: String) {
        debug!(%path, "loading environment map");
        let state = scope.state_mut();
        state.requested_path = Some(path.clone());
        state.last_error = None;
        scope.transition(Phase::Activating);
        scope.request(ServiceRequest::LoadHdr { path });
    }
}

impl Region for EnvironmentRegion {
    type State = EnvironmentState;

    fn on_command(&mut self, command: &Command, scope: &mut RegionScope<'_, EnvironmentState>) {
        let Command::Environment(env) = command else {
            return;
        };

        match (scope.phase(), env) {
            // A new map may replace the current one; loads never queue.
            (Phase::Disabled | Phase::Active | Phase::Updating | Phase::Error, EnvironmentCommand::LoadHdr { path }) => {
                self.load(scope, path.clone())
            }
            (Phase::Error, EnvironmentCommand::Retry) => match scope.state().requested_path.clone() {
                Some(path) => self.load(scope, path),
                None => warn!("environment retry without a previous path ignored"),
            },
            (Phase::Active | Phase::Updating | Phase::Error, EnvironmentCommand::Disable) => {
                let state = scope.state_mut();
                state.hdr = None;
                state.last_error = None;
                scope.transition(Phase::Disabled);
            }
            (phase, EnvironmentCommand::UpdateBackground { blur, intensity }) if phase.accepts_updates() => {
                apply_parameters(
                    scope,
                    &[
                        (Parameter::BackgroundBlur, *blur),
                        (Parameter::BackgroundIntensity, *intensity),
                    ],
                );
            }
            (phase, EnvironmentCommand::UpdateAmbient { contribution }) if phase.accepts_updates() => {
                apply_parameters(scope, &[(Parameter::AmbientContribution, Some(*contribution))]);
            }
            _ => ignored(scope, command),
        }
    }

    fn on_outcome(&mut self, outcome: ServiceOutcome, scope: &mut RegionScope<'_, EnvironmentState>) {
        match outcome {
            Ok(ServiceResult::HdrLoaded(asset)) => {
                let loaded = LoadedHdr {
                    path: asset.path.clone(),
                    texture: asset.texture,
                    metadata: asset.metadata,
                };
                scope.state_mut().hdr = Some(loaded);
                scope.emit(RegionEvent::HdrLoaded {
                    path: asset.path,
                    texture: asset.texture,
                });
                scope.transition(Phase::Active);
            }
            Ok(other) => warn!(outcome = ?other, "unexpected outcome for environment"),
            Err(failure) => fail(scope, failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ObjectsRegistry;
    use crate::error::ErrorCategory;
    use crate::region::{step, RegionInput};
    use crate::services::{HdrAsset, HdrMetadata, TextureId};

    fn command(c: EnvironmentCommand) -> RegionInput {
        RegionInput::Command(Command::Environment(c))
    }

    fn asset(path: &str) -> HdrAsset {
        HdrAsset {
            path: path.into(),
            texture: TextureId(11),
            metadata: HdrMetadata {
                width: Some(2048),
                height: Some(1024),
                byte_len: 4096,
            },
        }
    }

    #[test]
    fn load_then_complete() {
        let mut state = EnvironmentState::default();
        let mut objects = ObjectsRegistry::default();

        let effects = step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            command(EnvironmentCommand::LoadHdr {
                path: "studio.hdr".into(),
            }),
        );
        assert_eq!(state.phase, Phase::Activating);
        assert_eq!(
            effects.requests,
            vec![ServiceRequest::LoadHdr {
                path: "studio.hdr".into()
            }]
        );

        step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            RegionInput::Outcome(Ok(ServiceResult::HdrLoaded(asset("studio.hdr")))),
        );
        assert_eq!(state.phase, Phase::Active);
        assert_eq!(state.hdr.as_ref().map(|h| h.texture), Some(TextureId(11)));
    }

    #[test]
    fn second_load_while_activating_is_dropped() {
        let mut state = EnvironmentState::default();
        let mut objects = ObjectsRegistry::default();
        step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            command(EnvironmentCommand::LoadHdr { path: "a.hdr".into() }),
        );

        let effects = step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            command(EnvironmentCommand::LoadHdr { path: "b.hdr".into() }),
        );

        assert!(effects.requests.is_empty());
        assert_eq!(state.requested_path.as_deref(), Some("a.hdr"));
    }

    #[test]
    fn retry_reloads_last_path() {
        let mut state = EnvironmentState {
            phase: Phase::Error,
            requested_path: Some("night.hdr".into()),
            last_error: Some(ServiceFailure::new(ErrorCategory::ServiceFailure, "External service failed")),
            ..EnvironmentState::default()
        };
        let mut objects = ObjectsRegistry::default();

        let effects = step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            command(EnvironmentCommand::Retry),
        );

        assert_eq!(state.phase, Phase::Activating);
        assert!(state.last_error.is_none());
        assert_eq!(
            effects.requests,
            vec![ServiceRequest::LoadHdr {
                path: "night.hdr".into()
            }]
        );
    }

    #[test]
    fn background_and_ambient_are_clamped() {
        let mut state = EnvironmentState {
            phase: Phase::Active,
            ..EnvironmentState::default()
        };
        let mut objects = ObjectsRegistry::default();

        step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            command(EnvironmentCommand::UpdateBackground {
                blur: Some(2.0),
                intensity: Some(1.5),
            }),
        );
        step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            command(EnvironmentCommand::UpdateAmbient { contribution: -1.0 }),
        );

        assert_eq!(state.background_blur, 1.0);
        assert_eq!(state.background_intensity, 1.5);
        assert_eq!(state.ambient_contribution, 0.0);
    }

    #[test]
    fn fatal_failure_halts() {
        let mut state = EnvironmentState {
            phase: Phase::Activating,
            ..EnvironmentState::default()
        };
        let mut objects = ObjectsRegistry::default();

        step(
            &mut EnvironmentRegion,
            &mut state,
            &mut objects,
            RegionInput::Outcome(Err(ServiceFailure::new(ErrorCategory::Fatal, "Rendering context lost"))),
        );

        assert_eq!(state.phase, Phase::Halted);
    }
}
