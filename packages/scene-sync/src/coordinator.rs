//! The coordinator: four regions over one shared context.
//!
//! ```text
//!   dispatch(command)
//!        │
//!        ▼
//!   ┌──────────┐  Effects   ┌──────────────┐  spawn   ┌──────────────┐
//!   │  region  │──────────► │  coordinator │────────► │ collaborator │
//!   │  (pure)  │            │  (executes)  │ ◄─────── │    (async)   │
//!   └──────────┘            └──────┬───────┘ mpsc     └──────────────┘
//!        ▲                         │ publish
//!        │ bridged commands        ▼
//!        └──────────────────── EventBus ──────► security actors
//! ```
//!
//! Everything that mutates state runs on the caller's thread inside
//! [`Coordinator::dispatch`], [`Coordinator::pump`] or
//! [`Coordinator::next_completion`]. Service calls run as spawned tokio
//! tasks and only report back over a channel, so those three methods must
//! be called from within a tokio runtime.
//!
//! # Disposal
//!
//! `SYSTEM.DISPOSE` marks every in-flight call stale by bumping an epoch.
//! Late completions still settle their circuit breaker but never touch state.
//!
//! # Stale completions
//!
//! Each region also carries a generation, bumped whenever it halts, is
//! disabled or starts a new activation. A call remembers the generation it
//! was issued under; a completion arriving after the region moved on is
//! dropped the same way a post-disposal one is.
//!
//! # Cascades
//!
//! Bridged commands are processed with the envelope that carried them as
//! the cause, so every event they produce keeps the original root. The bus
//! turn stays open until the coordinator settles, which lets a bridge see
//! that it already fired for a cascade that went through a region.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{anyhow, Context as _};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerSnapshot, BreakerState, CallError, CircuitBreaker};
use crate::bridges::default_bridges;
use crate::bus::{Bridge, EventBus, Subscription};
use crate::clock::{system_clock, SharedClock};
use crate::config::{BreakerConfig, SyncConfig};
use crate::context::{PerformanceSnapshot, Phase, SharedContext};
use crate::core::{
    Command, EventEnvelope, ObjectGroup, ObjectHandle, RegionId, SecurityCommand, Signal, SystemCommand,
    SystemEvent, Topic,
};
use crate::error::{panic_message, ServiceFailure, SyncError};
use crate::region::{
    self, BloomRegion, EnvironmentRegion, Effects, OperationClass, PbrRegion, RegionEvent, RegionInput,
    RegionRecord, SceneOp, ServiceRequest, ServiceResult,
};
use crate::security::{
    AuditEventType, AuditLogger, AuditMessage, DetectorMessage, SecurityCoordinator, SecurityLevel,
};
use crate::services::{MaterialProperty, Services};

/// Persistence key for [`Coordinator::persist_audit`].
pub const AUDIT_KEY: &str = "audit/latest";

/// Bus/security/inbox rounds per turn before giving up on quiescence.
const MAX_SETTLE_ROUNDS: usize = 16;

/// Collaborator calls guarded by the coordinator's own breakers.
const GUARDED: [OperationClass; 4] = [
    OperationClass::BloomSetup,
    OperationClass::ObjectDetection,
    OperationClass::HdrLoad,
    OperationClass::ObjectRegistration,
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Running,
    Disposed,
}

/// The parallel state value: one entry per region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateValue {
    pub status: Status,
    pub bloom: Phase,
    pub pbr: Phase,
    pub environment: Phase,
    pub security: SecurityLevel,
    pub security_transitioning: bool,
}

/// Immutable view handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub value: StateValue,
    pub context: SharedContext,
}

pub type SnapshotListener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

type Listeners = Mutex<Vec<(u64, SnapshotListener)>>;

/// Returned by [`Coordinator::subscribe`].
pub struct SnapshotSubscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl SnapshotSubscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for SnapshotSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSubscription").field("id", &self.id).finish()
    }
}

// =============================================================================
// Service Calls
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct PendingCall {
    region: RegionId,
    class: OperationClass,
    epoch: u64,
    generation: u64,
}

struct Completion {
    ticket: Ticket,
    outcome: anyhow::Result<ServiceResult>,
}

/// One breaker per guarded operation class.
struct Breakers {
    config: BreakerConfig,
    clock: SharedClock,
    by_class: BTreeMap<OperationClass, CircuitBreaker>,
}

impl Breakers {
    fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        let mut breakers = Self {
            config,
            clock,
            by_class: BTreeMap::new(),
        };
        for class in GUARDED {
            breakers.get_mut(class);
        }
        breakers
    }

    fn get_mut(&mut self, class: OperationClass) -> &mut CircuitBreaker {
        let (config, clock) = (&self.config, &self.clock);
        self.by_class
            .entry(class)
            .or_insert_with(|| CircuitBreaker::new(class.as_str(), config.clone(), clock.clone()))
    }
}

async fn perform(services: Services, request: ServiceRequest) -> anyhow::Result<ServiceResult> {
    match request {
        ServiceRequest::PrepareBloom { handles } => {
            for handle in &handles {
                services
                    .scene
                    .apply_material_property(*handle, MaterialProperty::BloomLayer, 1.0)
                    .with_context(|| format!("moving {handle} onto the bloom layer"))?;
            }
            Ok(ServiceResult::BloomPrepared { count: handles.len() })
        }
        ServiceRequest::DetectObjects => {
            let objects = services.scene.detect_objects().await.context("object detection")?;
            Ok(ServiceResult::ObjectsDetected(objects))
        }
        ServiceRequest::LoadHdr { path } => {
            let asset = services
                .hdr
                .load(&path)
                .await
                .with_context(|| format!("loading environment map {path}"))?;
            Ok(ServiceResult::HdrLoaded(asset))
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct CoordinatorBuilder {
    services: Services,
    config: SyncConfig,
    clock: SharedClock,
    bus: EventBus,
    bridges: Vec<Arc<dyn Bridge>>,
    default_bridges: bool,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bridge(mut self, bridge: Arc<dyn Bridge>) -> Self {
        self.bridges.push(bridge);
        self
    }

    /// Skip the lighting→ambient and alert→bloom bridges.
    pub fn without_default_bridges(mut self) -> Self {
        self.default_bridges = false;
        self
    }

    pub fn build(self) -> Coordinator {
        let bus = self.bus;
        if self.default_bridges {
            for bridge in default_bridges() {
                bus.register_bridge(bridge);
            }
        }
        for bridge in self.bridges {
            bus.register_bridge(bridge);
        }

        let security = SecurityCoordinator::new(&self.config, self.clock.clone());
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let mut subscriptions = Vec::new();

        subscriptions.push(bus.subscribe(Topic::Command, move |envelope| {
            if matches!(envelope.signal, Signal::Command(_)) {
                let _ = inbox_tx.send(envelope.clone());
            }
        }));

        for region in [RegionId::Bloom, RegionId::Pbr, RegionId::Environment] {
            let detector = security.detector();
            let auditor = security.auditor();
            subscriptions.push(bus.subscribe(Topic::Region(region), move |envelope| {
                let Signal::Region(event) = &envelope.signal else {
                    return;
                };
                if event.is_context_change() {
                    detector.tell(DetectorMessage::ContextChanged { region });
                }
                if let RegionEvent::ServiceFailed { region, failure } = event {
                    auditor.tell(AuditMessage::record(
                        AuditEventType::Error,
                        None,
                        format!("{region}: {failure}"),
                    ));
                }
            }));
        }

        let detector = security.detector();
        subscriptions.push(bus.subscribe(Topic::System, move |envelope| {
            if let Signal::System(SystemEvent::PerformanceUpdated(snapshot)) = &envelope.signal {
                detector.tell(DetectorMessage::Sample(snapshot.clone()));
            }
        }));

        let mut context = SharedContext::new(self.clock.now());
        context.security = security.state().clone();

        info!(default_bridges = self.default_bridges, "coordinator started");
        Coordinator {
            breakers: Breakers::new(self.config.breaker.clone(), self.clock.clone()),
            services: self.services,
            config: self.config,
            clock: self.clock,
            bus,
            context,
            status: Status::Running,
            bloom: BloomRegion,
            pbr: PbrRegion,
            environment: EnvironmentRegion,
            security,
            pending: HashMap::new(),
            next_ticket: 0,
            epoch: 0,
            generations: HashMap::new(),
            cause: None,
            completions_tx,
            completions,
            inbox,
            subscriptions,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: 0,
            last_notified: None,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    services: Services,
    config: SyncConfig,
    clock: SharedClock,
    bus: EventBus,
    context: SharedContext,
    status: Status,
    bloom: BloomRegion,
    pbr: PbrRegion,
    environment: EnvironmentRegion,
    security: SecurityCoordinator,
    breakers: Breakers,
    pending: HashMap<Ticket, PendingCall>,
    next_ticket: u64,
    epoch: u64,
    /// Per-region activation generation; see the module docs.
    generations: HashMap<RegionId, u64>,
    /// Envelope of the bridged command being processed, if any.
    cause: Option<EventEnvelope>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    /// Command envelopes published on the bus, mostly by bridges.
    inbox: mpsc::UnboundedReceiver<EventEnvelope>,
    subscriptions: Vec<Subscription>,
    listeners: Arc<Listeners>,
    next_listener: u64,
    last_notified: Option<Snapshot>,
}

impl Coordinator {
    pub fn builder(services: Services) -> CoordinatorBuilder {
        CoordinatorBuilder {
            services,
            config: SyncConfig::default(),
            clock: system_clock(),
            bus: EventBus::new(),
            bridges: Vec::new(),
            default_bridges: true,
        }
    }

    pub fn new(services: Services, config: SyncConfig) -> Self {
        Self::builder(services).config(config).build()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn audit_log(&self) -> &AuditLogger {
        self.security.audit_log()
    }

    /// Service calls whose outcome would still reach their region.
    pub fn pending_calls(&self) -> usize {
        self.pending.values().filter(|call| !self.is_stale(call)).count()
    }

    pub fn breakers(&self) -> Vec<(OperationClass, BreakerSnapshot)> {
        let mut snapshots: Vec<_> = self
            .breakers
            .by_class
            .iter()
            .map(|(class, breaker)| (*class, breaker.snapshot()))
            .collect();
        snapshots.push((
            OperationClass::SecurityPreset,
            self.security.preset_breaker().snapshot(),
        ));
        snapshots
    }

    pub fn snapshot(&self) -> Snapshot {
        let security = self.security.state();
        Snapshot {
            value: StateValue {
                status: self.status,
                bloom: self.context.bloom.phase,
                pbr: self.context.pbr.phase,
                environment: self.context.environment.phase,
                security: security.level,
                security_transitioning: security.is_transitioning,
            },
            context: self.context.clone(),
        }
    }

    /// Call `listener` after every turn that changed the snapshot.
    pub fn subscribe<F>(&mut self, listener: F) -> SnapshotSubscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        lock(&self.listeners).push((id, Arc::new(listener)));
        SnapshotSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Process one command to quiescence: region step, bus delivery,
    /// security actors and any bridged commands.
    ///
    /// Commands after disposal are ignored.
    pub fn dispatch(&mut self, command: Command) {
        if self.status == Status::Disposed {
            debug!(command = command.kind(), "coordinator disposed, command ignored");
            return;
        }
        debug!(command = command.kind(), "dispatching command");
        self.process(command);
        self.finish_turn();
    }

    /// Apply every completion that has already arrived. Never waits.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions.try_recv() {
            if self.apply_completion(completion) {
                applied += 1;
            }
        }
        self.finish_turn();
        applied
    }

    /// Wait for the next service completion and apply it.
    ///
    /// Returns false when nothing is in flight.
    pub async fn next_completion(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.completions.recv().await {
            Some(completion) => {
                self.apply_completion(completion);
                self.finish_turn();
                true
            }
            None => false,
        }
    }

    /// Wait until every in-flight call, stale ones included, has completed.
    pub async fn settle(&mut self) {
        while self.next_completion().await {}
    }

    /// Finalize timed transitions that are due.
    pub fn tick(&mut self) {
        self.dispatch(Command::System(SystemCommand::Tick));
    }

    /// Like dispatching a security command, but reports rejections.
    pub fn security_command(&mut self, command: SecurityCommand) -> Result<(), SyncError> {
        if self.status == Status::Disposed {
            return Err(SyncError::Disposed);
        }
        let result = self.security.handle(&command);
        self.finish_turn();
        result
    }

    /// Export the audit trail through the persistence collaborator.
    pub async fn persist_audit(&self) -> Result<(), SyncError> {
        let bytes = self.security.audit_log().export()?;
        let storage = self.services.storage.clone();
        storage.save(AUDIT_KEY, bytes).await.map_err(SyncError::Storage)?;
        debug!(entries = self.security.audit_log().len(), "audit trail persisted");
        Ok(())
    }

    /// Publish a signal, tied to the current cascade when a bridged command
    /// is being processed.
    fn publish(&self, signal: Signal) {
        match &self.cause {
            Some(cause) => self.bus.publish_envelope(cause.derived(signal)),
            None => self.bus.publish(signal),
        };
    }

    fn generation(&self, region: RegionId) -> u64 {
        self.generations.get(&region).copied().unwrap_or(0)
    }

    fn bump_generation(&mut self, region: RegionId) {
        *self.generations.entry(region).or_insert(0) += 1;
    }

    fn is_stale(&self, call: &PendingCall) -> bool {
        call.epoch != self.epoch || call.generation != self.generation(call.region)
    }

    // -------------------------------------------------------------------------
    // Command processing
    // -------------------------------------------------------------------------

    fn process(&mut self, command: Command) {
        match command {
            Command::Bloom(_) => self.run_region(RegionId::Bloom, RegionInput::Command(command)),
            Command::Pbr(_) => self.run_region(RegionId::Pbr, RegionInput::Command(command)),
            Command::Environment(_) => {
                self.run_region(RegionId::Environment, RegionInput::Command(command))
            }
            Command::Security(security) => {
                if let Err(error) = self.security.handle(&security) {
                    debug!(%error, "security command rejected");
                }
            }
            Command::System(system) => self.process_system(system),
        }
    }

    fn process_system(&mut self, command: SystemCommand) {
        match command {
            SystemCommand::UpdatePerformance {
                fps,
                frame_time_ms,
                memory_mb,
                cpu_percent,
            } => self.update_performance(fps, frame_time_ms, memory_mb, cpu_percent),
            SystemCommand::RegisterObjects { group, handles } => self.register_objects(group, &handles),
            SystemCommand::UnregisterObjects { group, handles } => {
                self.unregister_objects(group, &handles)
            }
            SystemCommand::ContextLost | SystemCommand::ContextRestored => {
                for region in [RegionId::Bloom, RegionId::Pbr, RegionId::Environment] {
                    let input = RegionInput::Command(Command::System(command.clone()));
                    self.run_region(region, input);
                }
            }
            SystemCommand::Tick => self.security.tick(),
            SystemCommand::Dispose => self.dispose(),
        }
    }

    fn update_performance(
        &mut self,
        fps: f64,
        frame_time_ms: f64,
        memory_mb: Option<f64>,
        cpu_percent: Option<f64>,
    ) {
        let previous = &self.context.performance;
        let sane = |value: f64, fallback: f64| {
            if value.is_finite() && value >= 0.0 {
                value
            } else {
                fallback
            }
        };
        let snapshot = PerformanceSnapshot {
            fps: sane(fps, previous.fps),
            frame_time_ms: sane(frame_time_ms, previous.frame_time_ms),
            memory_mb: memory_mb.map_or(previous.memory_mb, |mb| sane(mb, previous.memory_mb)),
            cpu_percent: cpu_percent.map_or(previous.cpu_percent, |cpu| sane(cpu, previous.cpu_percent)),
            timestamp: self.clock.now(),
        };

        self.context.performance = snapshot.clone();
        for class in GUARDED {
            let breaker = self.breakers.get_mut(class);
            let before = breaker.state();
            breaker.observe_performance(&snapshot);
            self.report_breaker(class, before);
        }
        self.publish(Signal::System(SystemEvent::PerformanceUpdated(snapshot)));
    }

    fn register_objects(&mut self, group: ObjectGroup, handles: &[ObjectHandle]) {
        let added = self.context.objects.insert(group, handles);
        if added.is_empty() {
            return;
        }
        match self.apply_scene_op(SceneOp::Register {
            group,
            handles: added.clone(),
        }) {
            Ok(()) => {
                debug!(%group, count = added.len(), "objects registered");
                self.publish(Signal::System(SystemEvent::ObjectsRegistered {
                    group,
                    count: added.len(),
                }));
            }
            Err(failure) => {
                self.context.objects.remove(group, &added);
                self.record_system_failure("object registration", failure);
            }
        }
    }

    fn unregister_objects(&mut self, group: ObjectGroup, handles: &[ObjectHandle]) {
        let removed = self.context.objects.remove(group, handles);
        if removed.is_empty() {
            return;
        }
        if let Err(failure) = self.apply_scene_op(SceneOp::Unregister {
            group,
            handles: removed.clone(),
        }) {
            self.record_system_failure("object release", failure);
        }
        self.publish(Signal::System(SystemEvent::ObjectsReleased {
            group,
            count: removed.len(),
        }));
    }

    fn record_system_failure(&self, what: &str, failure: ServiceFailure) {
        warn!(operation = what, %failure, "system operation failed");
        self.security.auditor().tell(AuditMessage::record(
            AuditEventType::Error,
            None,
            format!("{what}: {failure}"),
        ));
    }

    // -------------------------------------------------------------------------
    // Regions
    // -------------------------------------------------------------------------

    fn step_region(&mut self, region: RegionId, input: RegionInput) -> Option<Effects> {
        let context = &mut self.context;
        let effects = match region {
            RegionId::Bloom => region::step(&mut self.bloom, &mut context.bloom, &mut context.objects, input),
            RegionId::Pbr => region::step(&mut self.pbr, &mut context.pbr, &mut context.objects, input),
            RegionId::Environment => region::step(
                &mut self.environment,
                &mut context.environment,
                &mut context.objects,
                input,
            ),
            RegionId::Security => return None,
        };
        Some(effects)
    }

    /// Step a region, then execute what it recorded. Requests rejected up
    /// front (open circuit) are fed straight back as failed outcomes.
    fn run_region(&mut self, region: RegionId, input: RegionInput) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let Some(effects) = self.step_region(region, input) else {
                return;
            };
            inputs.extend(self.absorb(region, effects));
        }
    }

    fn absorb(&mut self, region: RegionId, effects: Effects) -> Vec<RegionInput> {
        let mut follow_up = Vec::new();

        for op in effects.scene {
            if let Err(failure) = self.apply_scene_op(op) {
                self.publish(Signal::Region(RegionEvent::ServiceFailed {
                    region,
                    failure: failure.clone(),
                }));
                if failure.is_fatal() {
                    follow_up.push(RegionInput::Command(Command::System(SystemCommand::ContextLost)));
                }
                break;
            }
        }

        for event in effects.events {
            if let RegionEvent::PhaseChanged {
                to: Phase::Activating | Phase::Halted | Phase::Disabled,
                ..
            } = event
            {
                self.bump_generation(region);
            }
            self.publish(Signal::Region(event));
        }

        for request in effects.requests {
            if let Err(failure) = self.spawn_request(region, request) {
                follow_up.push(RegionInput::Outcome(Err(failure)));
            }
        }

        match region {
            RegionId::Bloom => region::settle(&mut self.context.bloom),
            RegionId::Pbr => region::settle(&mut self.context.pbr),
            RegionId::Environment => region::settle(&mut self.context.environment),
            RegionId::Security => {}
        }
        follow_up
    }

    fn apply_scene_op(&mut self, op: SceneOp) -> Result<(), ServiceFailure> {
        let scene = self.services.scene.clone();
        let result = match op {
            SceneOp::SetProperty {
                handle,
                property,
                value,
            } => scene
                .apply_material_property(handle, property, value)
                .map_err(CallError::Failed),
            SceneOp::Register { group, handles } => {
                self.guarded(OperationClass::ObjectRegistration, || {
                    scene.register_objects(group, &handles)
                })
            }
            SceneOp::Unregister { group, handles } => {
                self.guarded(OperationClass::ObjectRegistration, || {
                    scene.unregister_objects(group, &handles)
                })
            }
        };

        result.map_err(|error| match error {
            CallError::Open(open) => ServiceFailure::circuit_open(&open),
            CallError::Failed(error) => {
                warn!(error = format!("{error:#}"), "scene operation failed");
                ServiceFailure::from_error(&error)
            }
        })
    }

    fn guarded<T>(
        &mut self,
        class: OperationClass,
        operation: impl FnOnce() -> anyhow::Result<T>,
    ) -> Result<T, CallError<anyhow::Error>> {
        let breaker = self.breakers.get_mut(class);
        let before = breaker.state();
        let result = breaker.call(operation);
        self.report_breaker(class, before);
        result
    }

    fn report_breaker(&mut self, class: OperationClass, before: BreakerState) {
        let state = self.breakers.get_mut(class).state();
        if state != before {
            info!(operation = class.as_str(), from = ?before, to = ?state, "circuit state changed");
            self.publish(Signal::System(SystemEvent::CircuitStateChanged {
                operation: class,
                state,
            }));
        }
    }

    // -------------------------------------------------------------------------
    // Service calls
    // -------------------------------------------------------------------------

    fn spawn_request(&mut self, region: RegionId, request: ServiceRequest) -> Result<(), ServiceFailure> {
        let class = request.class();
        let breaker = self.breakers.get_mut(class);
        let before = breaker.state();
        let acquired = breaker.try_acquire();
        self.report_breaker(class, before);
        if let Err(open) = acquired {
            warn!(%region, operation = class.as_str(), retry_at = %open.retry_at, "service call rejected");
            return Err(ServiceFailure::circuit_open(&open));
        }

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(
            ticket,
            PendingCall {
                region,
                class,
                epoch: self.epoch,
                generation: self.generation(region),
            },
        );

        debug!(%region, %ticket, operation = class.as_str(), "service call spawned");
        let services = self.services.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(perform(services, request)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!(%ticket, panic = %message, "service call panicked");
                    Err(anyhow!("service call panicked: {message}"))
                }
            };
            let _ = completions.send(Completion { ticket, outcome });
        });
        Ok(())
    }

    /// Returns true when the completion reached its region.
    fn apply_completion(&mut self, completion: Completion) -> bool {
        let Completion { ticket, outcome } = completion;
        let Some(call) = self.pending.remove(&ticket) else {
            warn!(%ticket, "completion for unknown call");
            return false;
        };

        let breaker = self.breakers.get_mut(call.class);
        let before = breaker.state();
        match &outcome {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        self.report_breaker(call.class, before);

        if self.is_stale(&call) || self.status == Status::Disposed {
            debug!(
                %ticket,
                region = %call.region,
                generation = call.generation,
                "dropping stale completion"
            );
            return false;
        }

        debug!(%ticket, region = %call.region, ok = outcome.is_ok(), "service call completed");
        let outcome = outcome.map_err(|error| {
            warn!(%ticket, region = %call.region, error = format!("{error:#}"), "service call failed");
            ServiceFailure::from_error(&error)
        });
        self.run_region(call.region, RegionInput::Outcome(outcome));
        true
    }

    // -------------------------------------------------------------------------
    // Turn completion
    // -------------------------------------------------------------------------

    /// Drive the bus, the security actors and bridged commands until nothing
    /// moves, then notify snapshot listeners.
    fn finish_turn(&mut self) {
        let _turn = self.bus.begin_turn();
        if self.status == Status::Running {
            let mut quiet = false;
            for _ in 0..MAX_SETTLE_ROUNDS {
                let delivered = self.bus.drain();

                let events = self.security.poll();
                self.context.security = self.security.state().clone();
                let published = events.len();
                for event in events {
                    self.publish(Signal::Security(event));
                }

                let mut bridged = 0;
                while let Ok(envelope) = self.inbox.try_recv() {
                    bridged += 1;
                    let Signal::Command(command) = envelope.signal.clone() else {
                        continue;
                    };
                    if self.status == Status::Running {
                        debug!(command = command.kind(), root = %envelope.root, "processing bridged command");
                        self.cause = Some(envelope);
                        self.process(command);
                        self.cause = None;
                    }
                }

                if delivered == 0 && published == 0 && bridged == 0 {
                    quiet = true;
                    break;
                }
            }
            if !quiet {
                warn!(rounds = MAX_SETTLE_ROUNDS, "turn did not settle; remaining work deferred");
            }
        }
        self.notify();
    }

    fn notify(&mut self) {
        let snapshot = self.snapshot();
        if self.last_notified.as_ref() == Some(&snapshot) {
            return;
        }
        let listeners: Vec<SnapshotListener> =
            lock(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&snapshot);
        }
        self.last_notified = Some(snapshot);
    }

    fn dispose(&mut self) {
        if self.status == Status::Disposed {
            return;
        }
        info!(pending = self.pending_calls(), "disposing coordinator");
        self.epoch += 1;
        for region in [RegionId::Bloom, RegionId::Pbr, RegionId::Environment] {
            self.bump_generation(region);
        }

        self.context.bloom.set_phase(Phase::Disabled);
        self.context.pbr.set_phase(Phase::Disabled);
        self.context.environment.set_phase(Phase::Disabled);

        let scene = self.services.scene.clone();
        for (group, handles) in self.context.objects.drain() {
            if let Err(error) = scene.unregister_objects(group, &handles) {
                warn!(%group, error = format!("{error:#}"), "failed to release objects on dispose");
            }
            self.publish(Signal::System(SystemEvent::ObjectsReleased {
                group,
                count: handles.len(),
            }));
        }

        self.status = Status::Disposed;
        self.publish(Signal::System(SystemEvent::Disposed));
        self.bus.drain();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.notify();
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BloomCommand, EnvironmentCommand, Parameter, PbrCommand};
    use crate::error::ErrorCategory;
    use crate::security::AuditFilter;
    use crate::testing::{Rig, SceneCall};

    fn handles(ids: &[u64]) -> Vec<ObjectHandle> {
        ids.iter().copied().map(ObjectHandle).collect()
    }

    fn load(path: &str) -> Command {
        Command::Environment(EnvironmentCommand::LoadHdr { path: path.into() })
    }

    #[tokio::test]
    async fn bloom_activation_prepares_registered_objects() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();

        coordinator.dispatch(Command::System(SystemCommand::RegisterObjects {
            group: ObjectGroup::Iris,
            handles: handles(&[1, 2]),
        }));
        coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
        assert_eq!(coordinator.snapshot().value.bloom, Phase::Activating);

        coordinator.settle().await;
        assert_eq!(coordinator.snapshot().value.bloom, Phase::Active);
        assert_eq!(
            rig.scene.applied_to(ObjectHandle(1)),
            vec![(MaterialProperty::BloomLayer, 1.0)]
        );
    }

    #[tokio::test]
    async fn pbr_detection_registers_objects_and_applies_material() {
        let rig = Rig::new();
        rig.scene
            .set_detection(vec![(ObjectGroup::Arms, ObjectHandle(7)), (ObjectGroup::Iris, ObjectHandle(8))]);
        let mut coordinator = rig.coordinator();

        coordinator.dispatch(Command::Pbr(PbrCommand::Enable));
        coordinator.settle().await;

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.value.pbr, Phase::Active);
        assert_eq!(snapshot.context.objects.len(), 2);
        assert!(rig
            .scene
            .calls()
            .contains(&SceneCall::Register(ObjectGroup::Arms, handles(&[7]))));
    }

    #[tokio::test]
    async fn hdr_failures_are_audited_and_open_the_circuit() {
        let rig = Rig::new();
        rig.hdr.fail_path("broken.hdr");
        let mut coordinator = rig.coordinator();

        for _ in 0..3 {
            coordinator.dispatch(load("broken.hdr"));
            coordinator.settle().await;
            assert_eq!(coordinator.snapshot().value.environment, Phase::Error);
        }

        let errors = coordinator
            .audit_log()
            .query(AuditFilter::default().event_type(AuditEventType::Error))
            .count();
        assert_eq!(errors, 3);

        coordinator.dispatch(load("studio.hdr"));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.value.environment, Phase::Error);
        assert_eq!(
            snapshot.context.environment.last_error.map(|f| f.category),
            Some(ErrorCategory::ResourceExhaustion)
        );
        assert_eq!(rig.hdr.loads(), 3, "open circuit must not call the loader");

        let hdr = coordinator
            .breakers()
            .into_iter()
            .find(|(class, _)| *class == OperationClass::HdrLoad)
            .map(|(_, snapshot)| snapshot.state);
        assert_eq!(hdr, Some(BreakerState::Open));
    }

    #[tokio::test]
    async fn load_from_error_recovers_with_another_map() {
        let rig = Rig::new();
        rig.hdr.fail_path("broken.hdr");
        let mut coordinator = rig.coordinator();

        coordinator.dispatch(load("broken.hdr"));
        coordinator.settle().await;
        assert_eq!(coordinator.snapshot().value.environment, Phase::Error);

        coordinator.dispatch(load("studio.hdr"));
        coordinator.settle().await;
        let environment = coordinator.snapshot().context.environment;
        assert_eq!(environment.phase, Phase::Active);
        assert_eq!(environment.last_error, None);
        assert_eq!(environment.hdr.map(|hdr| hdr.metadata.width), Some(Some(2048)));
    }

    #[tokio::test]
    async fn load_issued_before_context_loss_cannot_land_after_restore() {
        let rig = Rig::new();
        rig.hdr.gate();
        let mut coordinator = rig.coordinator();

        coordinator.dispatch(load("a.hdr"));
        coordinator.dispatch(Command::System(SystemCommand::ContextLost));
        coordinator.dispatch(Command::System(SystemCommand::ContextRestored));
        coordinator.dispatch(load("b.hdr"));
        assert_eq!(coordinator.pending_calls(), 1);

        rig.hdr.release(2);
        coordinator.settle().await;

        let environment = coordinator.snapshot().context.environment;
        assert_eq!(environment.phase, Phase::Active);
        assert_eq!(environment.requested_path.as_deref(), Some("b.hdr"));
        assert_eq!(environment.hdr.map(|hdr| hdr.path), Some("b.hdr".to_string()));
        assert_eq!(rig.hdr.loads(), 2);
    }

    #[tokio::test]
    async fn halted_region_ignores_load_that_was_in_flight() {
        let rig = Rig::new();
        rig.hdr.gate();
        let mut coordinator = rig.coordinator();

        coordinator.dispatch(load("a.hdr"));
        coordinator.dispatch(Command::System(SystemCommand::ContextLost));
        coordinator.dispatch(Command::System(SystemCommand::ContextRestored));
        rig.hdr.release(1);
        coordinator.settle().await;

        let environment = coordinator.snapshot().context.environment;
        assert_eq!(environment.phase, Phase::Disabled);
        assert_eq!(environment.hdr, None);
    }

    /// Feeds environment ambient back into PBR lighting, closing a loop with
    /// the default lighting bridge.
    struct AmbientToLighting;

    impl Bridge for AmbientToLighting {
        fn name(&self) -> &'static str {
            "environment-ambient->pbr-lighting"
        }

        fn source(&self) -> Topic {
            Topic::Region(RegionId::Environment)
        }

        fn translate(&self, signal: &Signal) -> Option<Signal> {
            let Signal::Region(RegionEvent::ParametersApplied { values, .. }) = signal else {
                return None;
            };
            let contribution = values
                .iter()
                .find_map(|(parameter, value)| (*parameter == Parameter::AmbientContribution).then_some(*value))?;
            Some(Signal::Command(Command::Pbr(PbrCommand::UpdateLighting {
                ambient: Some(contribution * 2.0),
                directional: None,
            })))
        }
    }

    #[tokio::test]
    async fn bridge_loop_through_regions_runs_once_per_cascade() {
        let rig = Rig::new();
        let mut coordinator = Coordinator::builder(rig.services())
            .clock(rig.clock.clone())
            .bridge(Arc::new(AmbientToLighting))
            .build();
        coordinator.dispatch(Command::Pbr(PbrCommand::Enable));
        coordinator.dispatch(load("studio.hdr"));
        coordinator.settle().await;

        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let _subscription = coordinator.bus().subscribe(Topic::Region(RegionId::Environment), move |envelope| {
            if let Signal::Region(RegionEvent::ParametersApplied { .. }) = &envelope.signal {
                sink.lock().unwrap().push(envelope.root);
            }
        });
        let lighting = Arc::new(Mutex::new(Vec::new()));
        let sink = lighting.clone();
        let _lighting = coordinator.bus().subscribe(Topic::Region(RegionId::Pbr), move |envelope| {
            if let Signal::Region(RegionEvent::ParametersApplied { .. }) = &envelope.signal {
                sink.lock().unwrap().push(envelope.root);
            }
        });

        coordinator.dispatch(Command::Pbr(PbrCommand::UpdateLighting {
            ambient: Some(1.2),
            directional: None,
        }));
        assert_eq!(applied.lock().unwrap().len(), 1);
        assert_eq!(coordinator.bus().pending(), 0);

        coordinator.tick();
        assert_eq!(applied.lock().unwrap().len(), 1);

        // The whole loop shares the root of the first lighting update.
        let lighting = lighting.lock().unwrap();
        assert_eq!(lighting.len(), 2);
        assert!(lighting.iter().all(|root| *root == lighting[0]));
        assert_eq!(applied.lock().unwrap()[0], lighting[0]);
        assert!((coordinator.context().environment.ambient_contribution - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn lighting_changes_bridge_into_environment_ambient() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();
        coordinator.dispatch(Command::Pbr(PbrCommand::Enable));
        coordinator.dispatch(load("studio.hdr"));
        coordinator.settle().await;

        coordinator.dispatch(Command::Pbr(PbrCommand::UpdateLighting {
            ambient: Some(1.2),
            directional: None,
        }));

        let context = coordinator.snapshot().context;
        assert_eq!(context.pbr.ambient_light, 1.2);
        assert!((context.environment.ambient_contribution - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn context_loss_halts_visual_regions_until_restored() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();
        coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
        coordinator.settle().await;

        coordinator.dispatch(Command::System(SystemCommand::ContextLost));
        let value = coordinator.snapshot().value;
        assert_eq!((value.bloom, value.pbr, value.environment), (Phase::Halted, Phase::Halted, Phase::Halted));

        coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
        assert_eq!(coordinator.snapshot().value.bloom, Phase::Halted);

        coordinator.dispatch(Command::System(SystemCommand::ContextRestored));
        assert_eq!(coordinator.snapshot().value.bloom, Phase::Disabled);
    }

    #[tokio::test]
    async fn lost_context_during_scene_write_halts_only_that_region() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();
        coordinator.dispatch(Command::System(SystemCommand::RegisterObjects {
            group: ObjectGroup::Iris,
            handles: handles(&[1]),
        }));
        coordinator.dispatch(Command::Pbr(PbrCommand::Enable));
        coordinator.settle().await;

        rig.scene.lose_context(true);
        coordinator.dispatch(Command::Pbr(PbrCommand::UpdateMaterial {
            metalness: Some(0.9),
            roughness: None,
            env_map_intensity: None,
        }));

        let value = coordinator.snapshot().value;
        assert_eq!(value.pbr, Phase::Halted);
        assert_eq!(value.bloom, Phase::Disabled);
    }

    #[tokio::test]
    async fn snapshot_listeners_see_changes_until_unsubscribed() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = coordinator.subscribe(move |snapshot| {
            sink.lock().unwrap().push(snapshot.value.bloom);
        });

        coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
        coordinator.settle().await;
        subscription.unsubscribe();
        coordinator.dispatch(Command::Bloom(BloomCommand::Disable));

        assert_eq!(*seen.lock().unwrap(), vec![Phase::Activating, Phase::Active]);
    }

    #[tokio::test]
    async fn security_override_is_rejected_while_transitioning() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();

        coordinator
            .security_command(SecurityCommand::SetSecurity {
                level: SecurityLevel::Warning,
            })
            .unwrap();
        let error = coordinator
            .security_command(SecurityCommand::SetSecurity {
                level: SecurityLevel::Safe,
            })
            .unwrap_err();
        assert!(matches!(error, SyncError::TransitionBusy { .. }));

        rig.clock.advance_ms(800);
        coordinator.tick();
        assert_eq!(coordinator.snapshot().value.security, SecurityLevel::Warning);
    }

    #[tokio::test]
    async fn persist_audit_writes_export() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();
        coordinator.dispatch(Command::Security(SecurityCommand::SetSecurity {
            level: SecurityLevel::Scanning,
        }));

        coordinator.persist_audit().await.unwrap();
        assert_eq!(rig.storage.keys(), vec![AUDIT_KEY.to_string()]);
    }

    #[tokio::test]
    async fn commands_after_dispose_are_ignored() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator();
        coordinator.dispatch(Command::System(SystemCommand::Dispose));
        coordinator.dispatch(Command::Bloom(BloomCommand::Enable));

        let value = coordinator.snapshot().value;
        assert_eq!(value.status, Status::Disposed);
        assert_eq!(value.bloom, Phase::Disabled);
        assert_eq!(coordinator.bus().subscriber_count(Topic::Command), 0);
    }
}
