//! Security level state machine.
//!
//! ```text
//!   SAFE/NORMAL ──sustained threats──► WARNING ──threat + degraded──► DANGER
//!        ▲                                                              │
//!        └──────────── SET_SECURITY / SET_PRESET (any level) ───────────┘
//! ```
//!
//! Every change runs as a timed transition: `is_transitioning` holds for
//! the configured duration and the level flips when it finalizes. Requests
//! that arrive mid-transition are rejected, never queued.

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use super::actor::{ActorCell, Address};
use super::audit::{AuditEventType, AuditLogger, AuditMessage};
use super::detector::{DetectorMessage, DetectorOutput, ThreatDetector};
use super::visuals::{AlertVisuals, VisualsMessage};
use super::{PendingTransition, SecurityEvent, SecurityLevel, SecurityState, TransitionOrigin};
use crate::breaker::CircuitBreaker;
use crate::clock::SharedClock;
use crate::config::{SecurityConfig, SyncConfig};
use crate::core::SecurityCommand;
use crate::error::SyncError;
use crate::region::OperationClass;

pub struct SecurityCoordinator {
    config: SecurityConfig,
    clock: SharedClock,
    state: SecurityState,
    detector: ActorCell<ThreatDetector>,
    visuals: ActorCell<AlertVisuals>,
    audit: ActorCell<AuditLogger>,
    preset_breaker: CircuitBreaker,
    /// Consecutive detections above threshold since the last level change.
    sustained: u32,
    events: Vec<SecurityEvent>,
}

impl SecurityCoordinator {
    pub fn new(config: &SyncConfig, clock: SharedClock) -> Self {
        let state = SecurityState::default();
        let visuals = ActorCell::new(AlertVisuals::new(state.level));
        visuals.address().tell(VisualsMessage::LevelChanged(state.level));

        Self {
            config: config.security.clone(),
            detector: ActorCell::new(ThreatDetector::new(&config.security, &config.breaker)),
            visuals,
            audit: ActorCell::new(AuditLogger::new(config.audit.capacity, state.level)),
            preset_breaker: CircuitBreaker::new(
                OperationClass::SecurityPreset.as_str(),
                config.breaker.clone(),
                clock.clone(),
            ),
            clock,
            state,
            sustained: 0,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &SecurityState {
        &self.state
    }

    pub fn detector(&self) -> Address<DetectorMessage> {
        self.detector.address()
    }

    pub fn auditor(&self) -> Address<AuditMessage> {
        self.audit.address()
    }

    /// Entries recorded so far. Messages still queued show up after `poll`.
    pub fn audit_log(&self) -> &AuditLogger {
        self.audit.actor()
    }

    pub fn preset_breaker(&self) -> &CircuitBreaker {
        &self.preset_breaker
    }

    pub fn handle(&mut self, command: &SecurityCommand) -> Result<(), SyncError> {
        match command {
            SecurityCommand::SetSecurity { level } => self.request_override(*level),
            SecurityCommand::SetPreset { level } => self.apply_preset(*level),
        }
    }

    /// Operator override. Bypasses detector logic but not the transition gate.
    pub fn request_override(&mut self, level: SecurityLevel) -> Result<(), SyncError> {
        match self.begin_transition(level, TransitionOrigin::Override) {
            Ok(()) => {
                self.audit(AuditEventType::Override, None, format!("override to {level}"));
                Ok(())
            }
            Err(error) => {
                self.audit(AuditEventType::Rejection, None, format!("override to {level} rejected: {error}"));
                Err(error)
            }
        }
    }

    /// Preset application, guarded by its own circuit breaker.
    pub fn apply_preset(&mut self, level: SecurityLevel) -> Result<(), SyncError> {
        if let Err(open) = self.preset_breaker.try_acquire() {
            warn!(%level, retry_at = %open.retry_at, "security preset rejected by open circuit");
            self.audit(AuditEventType::Rejection, None, format!("preset {level} rejected: circuit open"));
            self.events.push(SecurityEvent::PresetRejected {
                level,
                retry_at: open.retry_at,
            });
            return Err(open.into());
        }

        match self.begin_transition(level, TransitionOrigin::Preset) {
            Ok(()) => {
                self.preset_breaker.record_success();
                self.visuals.address().tell(VisualsMessage::LevelChanged(level));
                self.audit(AuditEventType::Preset, None, format!("preset {level} applied"));
                Ok(())
            }
            Err(error) => {
                self.preset_breaker.record_failure();
                self.audit(AuditEventType::Rejection, None, format!("preset {level} rejected: {error}"));
                Err(error)
            }
        }
    }

    /// Finalize the running transition once its deadline has passed.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        let due = self
            .state
            .transition
            .as_ref()
            .is_some_and(|pending| now >= pending.completes_at);
        if due {
            self.finalize_transition();
        }
    }

    /// Finalize due transitions and drain every actor mailbox until all three
    /// are quiet. Returns the events produced since the last poll.
    pub fn poll(&mut self) -> Vec<SecurityEvent> {
        loop {
            self.tick();
            let now = self.clock.now();

            let (detected, outputs) = self.detector.run_pending(now);
            for output in outputs {
                self.on_detector_output(output);
            }

            let (selected, selections) = self.visuals.run_pending(now);
            for selection in selections {
                self.events.push(SecurityEvent::VisualEffectRequested {
                    pattern: selection.pattern,
                    params: selection.params.clone(),
                });
                self.state.alert = Some(selection);
            }

            let (audited, seqs) = self.audit.run_pending(now);
            if let Some(last) = seqs.last() {
                trace!(appended = audited, last_seq = last, "audit entries appended");
            }

            if detected + selected + audited == 0 {
                break;
            }
        }
        std::mem::take(&mut self.events)
    }

    fn on_detector_output(&mut self, output: DetectorOutput) {
        match output {
            DetectorOutput::Metrics(metrics) => {
                if metrics.detection_confidence < self.config.threat_threshold {
                    self.sustained = 0;
                }
                self.state.metrics = metrics;
            }
            DetectorOutput::Threat {
                confidence,
                pattern,
                degraded,
            } => {
                self.sustained += 1;
                self.events.push(SecurityEvent::ThreatDetected { confidence, pattern });
                self.audit(
                    AuditEventType::ThreatDetection,
                    None,
                    format!("{pattern:?} at confidence {confidence:.2}"),
                );
                self.visuals.address().tell(VisualsMessage::Threat { confidence });
                self.escalate(degraded);
            }
        }
    }

    fn escalate(&mut self, degraded: bool) {
        if self.state.is_transitioning {
            debug!(level = %self.state.level, "escalation deferred: transition running");
            return;
        }

        let target = match self.state.level {
            SecurityLevel::Safe | SecurityLevel::Normal
                if self.sustained >= self.config.sustained_detections =>
            {
                SecurityLevel::Warning
            }
            SecurityLevel::Warning if degraded => SecurityLevel::Danger,
            _ => return,
        };

        // Gate checked above, so this cannot be rejected.
        if self.begin_transition(target, TransitionOrigin::Escalation).is_ok() {
            info!(from = %self.state.level, to = %target, "security escalation started");
        }
    }

    fn begin_transition(&mut self, to: SecurityLevel, origin: TransitionOrigin) -> Result<(), SyncError> {
        if let Some(pending) = &self.state.transition {
            let in_progress = pending.to;
            debug!(requested = %to, %in_progress, "security transition busy");
            self.events.push(SecurityEvent::TransitionRejected {
                requested: to,
                in_progress,
            });
            return Err(SyncError::TransitionBusy {
                requested: to,
                in_progress,
            });
        }

        let now = self.clock.now();
        let from = self.state.level;
        self.state.transition = Some(PendingTransition {
            from,
            to,
            origin,
            started_at: now,
            completes_at: now + self.config.transition_duration(),
        });
        self.state.is_transitioning = true;
        self.events.push(SecurityEvent::TransitionStarted { from, to, origin });
        debug!(%from, %to, %origin, "security transition started");
        Ok(())
    }

    fn finalize_transition(&mut self) {
        let Some(pending) = self.state.transition.take() else {
            return;
        };
        let from = self.state.level;
        let to = pending.to;

        self.state.level = to;
        self.state.is_transitioning = false;
        self.sustained = 0;

        info!(%from, %to, origin = %pending.origin, "security level changed");
        self.events.push(SecurityEvent::LevelChanged {
            from,
            to,
            origin: pending.origin,
        });
        self.visuals.address().tell(VisualsMessage::LevelChanged(to));
        self.audit(
            AuditEventType::LevelChange,
            Some(to),
            format!("{from} -> {to} ({})", pending.origin),
        );
    }

    fn audit(&self, event_type: AuditEventType, level: Option<SecurityLevel>, detail: String) {
        self.audit.address().tell(AuditMessage::record(event_type, level, detail));
    }

    /// Deadline of the running transition, if any.
    pub fn transition_deadline(&self) -> Option<DateTime<Utc>> {
        self.state.transition.as_ref().map(|pending| pending.completes_at)
    }
}
