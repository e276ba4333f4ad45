//! The render-sync service.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start()──► Running ──stop()──► Stopped ──start()──► Running
//! ```
//!
//! `start` recovers from the newest valid checkpoint, then attaches to the
//! store and to the coordinator's bus. While running, [`RenderSync::poll`]
//! moves observed changes through the reconciliation window and writes each
//! resolved value to whichever side lost. Writes the service makes itself
//! are remembered as echoes and are not observed again.
//!
//! A store value that wins while its region cannot take updates (disabled,
//! halted, still activating) is parked and mirrored on the first poll after
//! the region becomes active. A later coordinator win for the same field
//! drops the parked value.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::window::{same_value, ReconciliationWindow, Resolution};
use super::{FieldDivergence, RecoveryReport, Side, SyncNotice, SyncPhase, SyncState};
use crate::bus::Subscription;
use crate::clock::SharedClock;
use crate::config::RenderSyncConfig;
use crate::context::Phase;
use crate::coordinator::Coordinator;
use crate::core::{
    BloomCommand, Command, EnvironmentCommand, Parameter, PbrCommand, RegionId, Signal, Topic,
};
use crate::error::SyncError;
use crate::region::RegionEvent;
use crate::services::{ReactiveStore, StoreChange, StoreSubscription};

/// Inputs accepted by [`RenderSync::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Forward a command to the coordinator.
    Command(Command),
    /// Write to the store as any other store client would.
    StoreWrite { parameter: Parameter, value: f32 },
    /// Persist a checkpoint now.
    Checkpoint,
    /// Close every open window now.
    Reconcile,
}

/// A parameter value confirmed by the coordinator.
#[derive(Debug, Clone, Copy)]
struct Applied {
    parameter: Parameter,
    value: f32,
    confirmed_at: DateTime<Utc>,
}

/// The coordinator command that sets one parameter.
pub fn mirror_command(parameter: Parameter, value: f32) -> Command {
    match parameter {
        Parameter::BloomThreshold => Command::Bloom(BloomCommand::UpdateGlobal {
            threshold: Some(value),
            strength: None,
            radius: None,
        }),
        Parameter::BloomStrength => Command::Bloom(BloomCommand::UpdateGlobal {
            threshold: None,
            strength: Some(value),
            radius: None,
        }),
        Parameter::BloomRadius => Command::Bloom(BloomCommand::UpdateGlobal {
            threshold: None,
            strength: None,
            radius: Some(value),
        }),
        Parameter::Metalness => Command::Pbr(PbrCommand::UpdateMaterial {
            metalness: Some(value),
            roughness: None,
            env_map_intensity: None,
        }),
        Parameter::Roughness => Command::Pbr(PbrCommand::UpdateMaterial {
            metalness: None,
            roughness: Some(value),
            env_map_intensity: None,
        }),
        Parameter::EnvMapIntensity => Command::Pbr(PbrCommand::UpdateMaterial {
            metalness: None,
            roughness: None,
            env_map_intensity: Some(value),
        }),
        Parameter::AmbientLight => Command::Pbr(PbrCommand::UpdateLighting {
            ambient: Some(value),
            directional: None,
        }),
        Parameter::DirectionalLight => Command::Pbr(PbrCommand::UpdateLighting {
            ambient: None,
            directional: Some(value),
        }),
        Parameter::BackgroundBlur => Command::Environment(EnvironmentCommand::UpdateBackground {
            blur: Some(value),
            intensity: None,
        }),
        Parameter::BackgroundIntensity => {
            Command::Environment(EnvironmentCommand::UpdateBackground {
                blur: None,
                intensity: Some(value),
            })
        }
        Parameter::AmbientContribution => {
            Command::Environment(EnvironmentCommand::UpdateAmbient { contribution: value })
        }
    }
}

pub struct RenderSync {
    coordinator: Coordinator,
    store: Arc<dyn ReactiveStore>,
    config: RenderSyncConfig,
    clock: SharedClock,
    checkpoints: CheckpointStore,
    window: ReconciliationWindow,
    phase: SyncPhase,

    store_tx: mpsc::UnboundedSender<StoreChange>,
    store_rx: mpsc::UnboundedReceiver<StoreChange>,
    applied_tx: mpsc::UnboundedSender<Applied>,
    applied_rx: mpsc::UnboundedReceiver<Applied>,
    store_subscription: Option<StoreSubscription>,
    bus_subscriptions: Vec<Subscription>,

    /// Values this service wrote, per side, not yet seen coming back.
    store_echo: HashMap<Parameter, f32>,
    coordinator_echo: HashMap<Parameter, f32>,
    /// Store wins the coordinator could not take yet.
    deferred: BTreeMap<Parameter, f32>,

    outbox: Vec<SyncNotice>,
    last_checkpoint: Option<(Uuid, DateTime<Utc>)>,
    next_checkpoint_at: Option<DateTime<Utc>>,
    conflicts_detected: u64,
    conflicts_resolved: u64,
}

impl RenderSync {
    pub fn new(coordinator: Coordinator, store: Arc<dyn ReactiveStore>, config: RenderSyncConfig) -> Self {
        let clock = coordinator.clock().clone();
        let checkpoints = CheckpointStore::new(
            coordinator.services().storage.clone(),
            config.retained_checkpoints,
        );
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();

        Self {
            window: ReconciliationWindow::new(config.reconciliation_window()),
            coordinator,
            store,
            config,
            clock,
            checkpoints,
            phase: SyncPhase::Idle,
            store_tx,
            store_rx,
            applied_tx,
            applied_rx,
            store_subscription: None,
            bus_subscriptions: Vec::new(),
            store_echo: HashMap::new(),
            coordinator_echo: HashMap::new(),
            deferred: BTreeMap::new(),
            outbox: Vec::new(),
            last_checkpoint: None,
            next_checkpoint_at: None,
            conflicts_detected: 0,
            conflicts_resolved: 0,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn state(&self) -> SyncState {
        SyncState {
            phase: self.phase,
            last_checkpoint_id: self.last_checkpoint.map(|(id, _)| id),
            last_checkpoint_at: self.last_checkpoint.map(|(_, at)| at),
            conflicts_detected: self.conflicts_detected,
            conflicts_resolved: self.conflicts_resolved,
            open_fields: self.window.open_fields(),
            deferred_fields: self.deferred.len(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recover, then attach to both sides.
    ///
    /// Recovery compares the live values against the newest checkpoint that
    /// verifies. Fields where store and coordinator disagree are fed into the
    /// window; the side that changed since the checkpoint counts as the more
    /// recent write.
    pub async fn start(&mut self) -> Result<RecoveryReport, SyncError> {
        if self.phase == SyncPhase::Running {
            debug!("render sync already running");
            return Ok(RecoveryReport {
                checkpoint_id: None,
                checkpoint_at: None,
                skipped: 0,
                divergences: Vec::new(),
            });
        }

        let (checkpoint, skipped) = if self.config.recover_on_start {
            self.checkpoints.latest_valid().await?
        } else {
            (None, 0)
        };
        let report = self.recover(checkpoint.as_ref(), skipped);

        let tx = self.store_tx.clone();
        self.store_subscription = Some(self.store.subscribe(Arc::new(move |change: &StoreChange| {
            let _ = tx.send(change.clone());
        })));

        for region in [RegionId::Bloom, RegionId::Pbr, RegionId::Environment] {
            let tx = self.applied_tx.clone();
            let clock = self.clock.clone();
            let subscription = self.coordinator.bus().subscribe(Topic::Region(region), move |envelope| {
                if let Signal::Region(RegionEvent::ParametersApplied { values, .. }) = &envelope.signal {
                    let confirmed_at = clock.now();
                    for (parameter, value) in values {
                        let _ = tx.send(Applied {
                            parameter: *parameter,
                            value: *value,
                            confirmed_at,
                        });
                    }
                }
            });
            self.bus_subscriptions.push(subscription);
        }

        let now = self.clock.now();
        self.next_checkpoint_at = Some(now + self.config.checkpoint_interval());
        self.phase = SyncPhase::Running;
        info!(
            checkpoint = ?report.checkpoint_id,
            divergences = report.divergences.len(),
            skipped = report.skipped,
            "render sync started"
        );

        self.outbox.push(SyncNotice::Recovered {
            checkpoint_id: report.checkpoint_id,
            divergences: report.divergences.clone(),
        });
        self.seed(&report, checkpoint.as_ref(), now);
        self.publish_outbox();
        Ok(report)
    }

    /// Resolve open windows, then detach from both sides.
    pub fn stop(&mut self) {
        if self.phase != SyncPhase::Running {
            return;
        }
        self.reconcile();
        if let Some(subscription) = self.store_subscription.take() {
            subscription.unsubscribe();
        }
        for subscription in self.bus_subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.store_echo.clear();
        self.coordinator_echo.clear();
        if !self.deferred.is_empty() {
            warn!(fields = self.deferred.len(), "stopping with deferred mirrors; recovery will surface them");
            self.deferred.clear();
        }
        self.phase = SyncPhase::Stopped;
        info!(open_fields = self.window.open_fields(), "render sync stopped");
    }

    /// Poll on an interval until `shutdown` resolves, then checkpoint and stop.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), SyncError> {
        if self.phase != SyncPhase::Running {
            self.start().await?;
        }

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("render sync shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(error) = self.poll().await {
                        warn!(%error, "render sync poll failed");
                    }
                }
            }
        }

        self.reconcile();
        let result = self.checkpoint().await.map(|_| ());
        self.stop();
        result
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn send(&mut self, event: SyncEvent) -> Result<(), SyncError> {
        if self.phase != SyncPhase::Running {
            return Err(SyncError::NotRunning);
        }
        match event {
            SyncEvent::Command(command) => {
                self.coordinator.dispatch(command);
                self.ingest();
                self.retry_deferred();
            }
            SyncEvent::StoreWrite { parameter, value } => {
                self.store.write(parameter, value);
                self.ingest();
            }
            SyncEvent::Checkpoint => {
                self.checkpoint().await?;
            }
            SyncEvent::Reconcile => {
                self.reconcile();
            }
        }
        self.publish_outbox();
        Ok(())
    }

    /// One service turn: apply finished service calls, observe both sides,
    /// close due windows and checkpoint when the timer is up.
    ///
    /// Returns the notices produced since the previous poll.
    pub async fn poll(&mut self) -> Result<Vec<SyncNotice>, SyncError> {
        if self.phase != SyncPhase::Running {
            return Err(SyncError::NotRunning);
        }
        self.coordinator.pump();
        self.ingest();
        self.retry_deferred();

        let now = self.clock.now();
        for resolution in self.window.expire(now) {
            self.apply(resolution);
        }

        let due = self.next_checkpoint_at.is_some_and(|at| now >= at);
        let checkpoint = if due { self.checkpoint().await.map(|_| ()) } else { Ok(()) };

        let notices = self.publish_outbox();
        checkpoint.map(|()| notices)
    }

    /// Close every open window immediately.
    pub fn reconcile(&mut self) -> Vec<SyncNotice> {
        self.ingest();
        for resolution in self.window.flush() {
            self.apply(resolution);
        }
        self.publish_outbox()
    }

    /// Capture and persist both sides. The timer restarts either way.
    pub async fn checkpoint(&mut self) -> Result<Uuid, SyncError> {
        let now = self.clock.now();
        self.next_checkpoint_at = Some(now + self.config.checkpoint_interval());

        let checkpoint = Checkpoint::capture(self.store.state(), self.coordinator.snapshot(), now)?;
        self.checkpoints.save(&checkpoint).await?;
        self.last_checkpoint = Some((checkpoint.id, checkpoint.timestamp));
        self.outbox.push(SyncNotice::CheckpointSaved {
            id: checkpoint.id,
            timestamp: checkpoint.timestamp,
        });
        Ok(checkpoint.id)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn recover(&self, checkpoint: Option<&Checkpoint>, skipped: usize) -> RecoveryReport {
        let store = self.store.state();
        let context = self.coordinator.context();

        let divergences = Parameter::ALL
            .iter()
            .filter_map(|parameter| {
                let store_value = *store.values.get(parameter)?;
                let coordinator_value = context.parameter(*parameter);
                let checkpoint_store = checkpoint.and_then(|c| c.payload.store.values.get(parameter).copied());
                let checkpoint_coordinator =
                    checkpoint.map(|c| c.payload.coordinator.context.parameter(*parameter));

                let moved = |then: Option<f32>, now: f32| then.is_some_and(|then| !same_value(then, now));
                let diverged = !same_value(store_value, coordinator_value)
                    || moved(checkpoint_store, store_value)
                    || moved(checkpoint_coordinator, coordinator_value);
                diverged.then_some(FieldDivergence {
                    parameter: *parameter,
                    checkpoint_store,
                    checkpoint_coordinator,
                    store: store_value,
                    coordinator: coordinator_value,
                })
            })
            .collect();

        RecoveryReport {
            checkpoint_id: checkpoint.map(|c| c.id),
            checkpoint_at: checkpoint.map(|c| c.timestamp),
            skipped,
            divergences,
        }
    }

    fn seed(&mut self, report: &RecoveryReport, checkpoint: Option<&Checkpoint>, now: DateTime<Utc>) {
        let baseline = checkpoint.map_or(now, |c| c.timestamp);
        for divergence in report.divergences.iter().filter(|d| d.is_split()) {
            let confirmed = |then: Option<f32>, value: f32| match then {
                Some(then) if same_value(then, value) => baseline,
                _ => now,
            };
            let store_at = confirmed(divergence.checkpoint_store, divergence.store);
            let coordinator_at = confirmed(divergence.checkpoint_coordinator, divergence.coordinator);

            self.observe(Side::Store, divergence.parameter, divergence.store, store_at);
            self.observe(Side::Coordinator, divergence.parameter, divergence.coordinator, coordinator_at);
        }
    }

    /// Move everything both sides reported into the window.
    fn ingest(&mut self) {
        while let Ok(change) = self.store_rx.try_recv() {
            if let Some(echo) = self.store_echo.remove(&change.parameter) {
                if same_value(echo, change.value) {
                    continue;
                }
            }
            self.observe(Side::Store, change.parameter, change.value, change.confirmed_at);
        }

        while let Ok(applied) = self.applied_rx.try_recv() {
            if let Some(echo) = self.coordinator_echo.remove(&applied.parameter) {
                if same_value(echo, applied.value) {
                    continue;
                }
            }
            self.observe(Side::Coordinator, applied.parameter, applied.value, applied.confirmed_at);
        }
    }

    fn observe(&mut self, side: Side, parameter: Parameter, value: f32, at: DateTime<Utc>) {
        if let Some(conflict) = self.window.observe(side, parameter, value, at) {
            self.conflicts_detected += 1;
            warn!(
                %parameter,
                store_value = conflict.store_value,
                coordinator_value = conflict.coordinator_value,
                "conflict detected"
            );
            self.outbox.push(SyncNotice::ConflictDetected {
                parameter,
                store_value: conflict.store_value,
                coordinator_value: conflict.coordinator_value,
            });
        }
    }

    /// Write a resolved value to the losing side.
    fn apply(&mut self, resolution: Resolution) {
        let Resolution {
            parameter,
            value,
            winner,
            conflicted,
        } = resolution;

        match winner {
            Side::Store => {
                let target = parameter.clamp(value);
                self.mirror(parameter, target);
                if !same_value(target, value) {
                    // The store holds an out-of-range value; hand back the clamped one.
                    self.store_echo.insert(parameter, target);
                    self.store.write(parameter, target);
                }
            }
            Side::Coordinator => {
                if self.deferred.remove(&parameter).is_some() {
                    debug!(%parameter, "deferred mirror superseded by coordinator");
                }
                let current = self.store.state().values.get(&parameter).copied();
                if current.map_or(true, |current| !same_value(current, value)) {
                    self.store_echo.insert(parameter, value);
                    self.store.write(parameter, value);
                }
            }
        }
        // Anything the mirrored write caused on the other side is fresh input.
        self.ingest();
        self.store_echo.clear();
        self.coordinator_echo.clear();

        if conflicted {
            self.conflicts_resolved += 1;
            info!(%parameter, value, ?winner, "conflict resolved");
            self.outbox.push(SyncNotice::ConflictResolved {
                parameter,
                value,
                winner,
            });
        } else {
            debug!(%parameter, value, ?winner, "field reconciled");
        }
    }

    /// Dispatch a store value to the coordinator, parking it when the
    /// owning region does not take it in its current phase.
    fn mirror(&mut self, parameter: Parameter, target: f32) {
        if !same_value(self.coordinator.context().parameter(parameter), target) {
            self.coordinator_echo.insert(parameter, target);
            self.coordinator.dispatch(mirror_command(parameter, target));
        }
        if same_value(self.coordinator.context().parameter(parameter), target) {
            self.deferred.remove(&parameter);
            return;
        }

        let phase = self.coordinator.context().phase(parameter.region());
        let previous = self.deferred.insert(parameter, target);
        if previous.is_some_and(|previous| same_value(previous, target)) {
            return;
        }
        warn!(%parameter, value = target, ?phase, "region not accepting updates, mirror deferred");
        self.outbox.push(SyncNotice::MirrorDeferred {
            parameter,
            value: target,
        });
    }

    /// Mirror parked values whose region accepts updates again. Fields with
    /// an open window are left for the window to settle.
    fn retry_deferred(&mut self) {
        let context = self.coordinator.context();
        let window = &self.window;
        let ready: Vec<(Parameter, f32)> = self
            .deferred
            .iter()
            .filter(|(parameter, _)| {
                !window.is_open(**parameter)
                    && context
                        .phase(parameter.region())
                        .is_some_and(Phase::accepts_updates)
            })
            .map(|(parameter, value)| (*parameter, *value))
            .collect();
        if ready.is_empty() {
            return;
        }

        for (parameter, value) in ready {
            debug!(%parameter, value, "mirroring deferred store value");
            self.deferred.remove(&parameter);
            self.mirror(parameter, value);
        }
        self.ingest();
        self.store_echo.clear();
        self.coordinator_echo.clear();
    }

    fn publish_outbox(&mut self) -> Vec<SyncNotice> {
        let notices = std::mem::take(&mut self.outbox);
        if notices.is_empty() {
            return notices;
        }
        let bus = self.coordinator.bus();
        for notice in &notices {
            bus.publish(Signal::Sync(notice.clone()));
        }
        bus.drain();
        notices
    }
}

impl std::fmt::Debug for RenderSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSync")
            .field("phase", &self.phase)
            .field("open_fields", &self.window.open_fields())
            .field("last_checkpoint", &self.last_checkpoint)
            .finish_non_exhaustive()
    }
}
