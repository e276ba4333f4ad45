//! Alert visuals actor: a fixed pattern library keyed by security level.

use chrono::{DateTime, Utc};

use super::actor::Actor;
use super::{AlertParams, AlertPattern, AlertSelection, SecurityLevel};

#[derive(Debug, Clone)]
pub enum VisualsMessage {
    LevelChanged(SecurityLevel),
    /// Boost the current pattern in proportion to detection confidence.
    Threat { confidence: f64 },
}

pub struct AlertVisuals {
    level: SecurityLevel,
}

impl AlertVisuals {
    pub fn new(level: SecurityLevel) -> Self {
        Self { level }
    }

    pub fn select(level: SecurityLevel) -> AlertSelection {
        let (pattern, color, frequency_hz, intensity) = match level {
            SecurityLevel::Safe => (AlertPattern::Steady, "#2ecc71", 0.0, 0.2),
            SecurityLevel::Normal => (AlertPattern::CalmPulse, "#3498db", 0.5, 0.35),
            SecurityLevel::Warning => (AlertPattern::AmberSweep, "#f39c12", 1.5, 0.6),
            SecurityLevel::Danger => (AlertPattern::RedStrobe, "#e74c3c", 4.0, 1.0),
            SecurityLevel::Scanning => (AlertPattern::ScanSweep, "#9b59b6", 2.0, 0.5),
        };
        AlertSelection {
            pattern,
            params: AlertParams {
                color: color.to_string(),
                frequency_hz,
                intensity,
            },
        }
    }
}

impl Actor for AlertVisuals {
    type Message = VisualsMessage;
    type Output = AlertSelection;

    fn name(&self) -> &'static str {
        "alert-visuals"
    }

    fn handle(&mut self, message: VisualsMessage, _now: DateTime<Utc>) -> Vec<AlertSelection> {
        match message {
            VisualsMessage::LevelChanged(level) => {
                self.level = level;
                vec![Self::select(level)]
            }
            VisualsMessage::Threat { confidence } => {
                let mut selection = Self::select(self.level);
                let boosted = (selection.params.intensity * (1.0 + confidence as f32)).min(1.0);
                if boosted <= selection.params.intensity {
                    return Vec::new();
                }
                selection.params.intensity = boosted;
                vec![selection]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_level_has_a_distinct_pattern() {
        let levels = [
            SecurityLevel::Safe,
            SecurityLevel::Normal,
            SecurityLevel::Warning,
            SecurityLevel::Danger,
            SecurityLevel::Scanning,
        ];
        let mut patterns: Vec<_> = levels.iter().map(|l| AlertVisuals::select(*l).pattern).collect();
        patterns.dedup();
        assert_eq!(patterns.len(), levels.len());
    }

    #[test]
    fn threat_boosts_current_level() {
        let mut visuals = AlertVisuals::new(SecurityLevel::Warning);
        let out = visuals.handle(VisualsMessage::Threat { confidence: 0.5 }, Utc::now());

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pattern, AlertPattern::AmberSweep);
        assert!((out[0].params.intensity - 0.9).abs() < 1e-6);
    }

    #[test]
    fn danger_is_already_at_full_intensity() {
        let mut visuals = AlertVisuals::new(SecurityLevel::Normal);
        visuals.handle(VisualsMessage::LevelChanged(SecurityLevel::Danger), Utc::now());

        let out = visuals.handle(VisualsMessage::Threat { confidence: 0.9 }, Utc::now());
        assert!(out.is_empty());
    }
}
