//! Default cross-region bridges.

use std::sync::Arc;

use crate::bus::Bridge;
use crate::core::{
    BloomCommand, Command, EnvironmentCommand, ObjectGroup, Parameter, RegionId, Signal, Topic,
};
use crate::region::RegionEvent;
use crate::security::{SecurityEvent, SecurityLevel};

/// PBR ambient light drives the environment's ambient contribution.
///
/// Ambient light spans [0, 2]; contribution spans [0, 1].
#[derive(Debug, Default, Clone, Copy)]
pub struct LightingToAmbient;

impl Bridge for LightingToAmbient {
    fn name(&self) -> &'static str {
        "pbr-lighting->environment-ambient"
    }

    fn source(&self) -> Topic {
        Topic::Region(RegionId::Pbr)
    }

    fn translate(&self, signal: &Signal) -> Option<Signal> {
        let Signal::Region(RegionEvent::ParametersApplied { values, .. }) = signal else {
            return None;
        };
        let ambient = values
            .iter()
            .rev()
            .find_map(|(parameter, value)| (*parameter == Parameter::AmbientLight).then_some(*value))?;

        Some(Signal::Command(Command::Environment(
            EnvironmentCommand::UpdateAmbient {
                contribution: ambient / 2.0,
            },
        )))
    }
}

/// Security level changes set the iris bloom intensity.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlertToBloom;

impl AlertToBloom {
    pub fn intensity_for(level: SecurityLevel) -> f32 {
        match level {
            SecurityLevel::Danger => 2.5,
            SecurityLevel::Warning => 1.8,
            _ => 1.0,
        }
    }
}

impl Bridge for AlertToBloom {
    fn name(&self) -> &'static str {
        "security-alert->bloom-group"
    }

    fn source(&self) -> Topic {
        Topic::Security
    }

    fn translate(&self, signal: &Signal) -> Option<Signal> {
        let Signal::Security(SecurityEvent::LevelChanged { to, .. }) = signal else {
            return None;
        };
        Some(Signal::Command(Command::Bloom(BloomCommand::UpdateGroup {
            group: ObjectGroup::Iris,
            intensity: Self::intensity_for(*to),
        })))
    }
}

pub fn default_bridges() -> Vec<Arc<dyn Bridge>> {
    vec![Arc::new(LightingToAmbient), Arc::new(AlertToBloom)]
}
