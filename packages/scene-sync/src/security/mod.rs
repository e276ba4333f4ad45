//! Security region.
//!
//! Unlike the visual regions, security is a small actor system. Three actors
//! each own private state and receive messages through their own mailbox:
//!
//! - [`ThreatDetector`] turns performance samples and context changes into
//!   [`ThreatMetrics`] and threat detections
//! - [`AlertVisuals`] picks an alert pattern for the current level
//! - [`AuditLogger`] keeps a bounded, queryable audit trail
//!
//! The [`SecurityCoordinator`] owns the level state machine and is the only
//! component that talks to all three.

pub mod actor;
pub mod audit;
pub mod coordinator;
pub mod detector;
pub mod visuals;

pub use actor::{Actor, ActorCell, Address};
pub use audit::{AuditEntry, AuditEventType, AuditExport, AuditFilter, AuditLogger, AuditMessage, AuditQuery};
pub use coordinator::SecurityCoordinator;
pub use detector::{DetectorMessage, DetectorOutput, ThreatDetector, ThreatPattern};
pub use visuals::{AlertVisuals, VisualsMessage};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    Safe,
    Normal,
    Warning,
    Danger,
    Scanning,
}

impl SecurityLevel {
    /// Severity used by audit filters. Scanning ranks with Normal.
    pub fn rank(self) -> u8 {
        match self {
            SecurityLevel::Safe => 0,
            SecurityLevel::Normal | SecurityLevel::Scanning => 1,
            SecurityLevel::Warning => 2,
            SecurityLevel::Danger => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Safe => "SAFE",
            SecurityLevel::Normal => "NORMAL",
            SecurityLevel::Warning => "WARNING",
            SecurityLevel::Danger => "DANGER",
            SecurityLevel::Scanning => "SCANNING",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionOrigin {
    Escalation,
    Override,
    Preset,
}

impl fmt::Display for TransitionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionOrigin::Escalation => "escalation",
            TransitionOrigin::Override => "override",
            TransitionOrigin::Preset => "preset",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransition {
    pub from: SecurityLevel,
    pub to: SecurityLevel,
    pub origin: TransitionOrigin,
    pub started_at: DateTime<Utc>,
    pub completes_at: DateTime<Utc>,
}

/// Rolling summary produced by the threat detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatMetrics {
    /// Combined confidence of the patterns matched by the latest sample.
    pub detection_confidence: f64,
    pub pattern_match_count: u32,
    pub dominant_pattern: Option<ThreatPattern>,
    /// The latest sample violated a performance ceiling.
    pub degraded: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertPattern {
    Steady,
    CalmPulse,
    AmberSweep,
    RedStrobe,
    ScanSweep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertParams {
    pub color: String,
    pub frequency_hz: f32,
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSelection {
    pub pattern: AlertPattern,
    pub params: AlertParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityState {
    pub level: SecurityLevel,
    pub alert: Option<AlertSelection>,
    pub is_transitioning: bool,
    pub transition: Option<PendingTransition>,
    pub metrics: ThreatMetrics,
}

impl Default for SecurityState {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Normal,
            alert: None,
            is_transitioning: false,
            transition: None,
            metrics: ThreatMetrics::default(),
        }
    }
}

/// Facts published by the security coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecurityEvent {
    TransitionStarted {
        from: SecurityLevel,
        to: SecurityLevel,
        origin: TransitionOrigin,
    },
    LevelChanged {
        from: SecurityLevel,
        to: SecurityLevel,
        origin: TransitionOrigin,
    },
    TransitionRejected {
        requested: SecurityLevel,
        in_progress: SecurityLevel,
    },
    ThreatDetected {
        confidence: f64,
        pattern: ThreatPattern,
    },
    VisualEffectRequested {
        pattern: AlertPattern,
        params: AlertParams,
    },
    PresetRejected {
        level: SecurityLevel,
        retry_at: DateTime<Utc>,
    },
}
