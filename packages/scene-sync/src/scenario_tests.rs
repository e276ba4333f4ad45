//! End-to-end scenarios across the coordinator, security and render-sync.
//!
//! Each test drives the public surface with the in-memory collaborators and
//! a manual clock.

use std::sync::{Arc, Mutex};

use crate::breaker::BreakerState;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::context::Phase;
use crate::coordinator::{Coordinator, Status};
use crate::core::{
    BloomCommand, Command, EnvironmentCommand, ObjectGroup, ObjectHandle, Parameter, PbrCommand,
    SecurityCommand, Signal, SystemCommand, Topic,
};
use crate::error::SyncError;
use crate::memory::InMemoryReactiveStore;
use crate::region::OperationClass;
use crate::security::{AuditEventType, AuditFilter, SecurityLevel};
use crate::services::ReactiveStore;
use crate::sync::service::mirror_command;
use crate::sync::{CheckpointStore, RenderSync, Side, SyncEvent, SyncNotice};
use crate::testing::{Rig, SceneCall};

// =============================================================================
// Helpers
// =============================================================================

fn load(path: &str) -> Command {
    Command::Environment(EnvironmentCommand::LoadHdr { path: path.into() })
}

async fn all_active(rig: &Rig) -> Coordinator {
    let mut coordinator = rig.coordinator();
    coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
    coordinator.dispatch(Command::Pbr(PbrCommand::Enable));
    coordinator.dispatch(load("studio.hdr"));
    coordinator.settle().await;
    coordinator
}

fn hdr_breaker(coordinator: &Coordinator) -> crate::breaker::BreakerSnapshot {
    coordinator
        .breakers()
        .into_iter()
        .find(|(class, _)| *class == OperationClass::HdrLoad)
        .map(|(_, snapshot)| snapshot)
        .unwrap()
}

fn sync_notices(coordinator: &Coordinator) -> (Arc<Mutex<Vec<SyncNotice>>>, crate::bus::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = coordinator.bus().subscribe(Topic::Sync, move |envelope| {
        if let Signal::Sync(notice) = &envelope.signal {
            sink.lock().unwrap().push(notice.clone());
        }
    });
    (seen, subscription)
}

// =============================================================================
// Regions
// =============================================================================

#[tokio::test]
async fn commands_outside_accepting_phase_leave_state_unchanged() {
    let rig = Rig::new();
    let mut coordinator = rig.coordinator();
    // First turn publishes the initial alert selection.
    coordinator.dispatch(Command::System(SystemCommand::Tick));
    let before = coordinator.snapshot();

    let ignored = [
        Command::Bloom(BloomCommand::UpdateGlobal {
            threshold: Some(0.1),
            strength: Some(2.0),
            radius: None,
        }),
        Command::Bloom(BloomCommand::UpdateGroup {
            group: ObjectGroup::Iris,
            intensity: 2.0,
        }),
        Command::Bloom(BloomCommand::ApplyPreset {
            name: "dramatic".into(),
        }),
        Command::Bloom(BloomCommand::Retry),
        Command::Bloom(BloomCommand::Disable),
        Command::Pbr(PbrCommand::UpdateMaterial {
            metalness: Some(1.0),
            roughness: None,
            env_map_intensity: None,
        }),
        Command::Pbr(PbrCommand::UpdateLighting {
            ambient: Some(1.5),
            directional: None,
        }),
        Command::Pbr(PbrCommand::Retry),
        Command::Environment(EnvironmentCommand::UpdateBackground {
            blur: Some(0.5),
            intensity: None,
        }),
        Command::Environment(EnvironmentCommand::UpdateAmbient { contribution: 0.9 }),
        Command::Environment(EnvironmentCommand::Retry),
        Command::System(SystemCommand::ContextRestored),
    ];
    for command in ignored {
        coordinator.dispatch(command);
    }

    assert_eq!(coordinator.snapshot(), before);
    assert_eq!(coordinator.pending_calls(), 0);
}

#[tokio::test]
async fn every_parameter_update_is_clamped_into_range() {
    let rig = Rig::new();
    let mut coordinator = all_active(&rig).await;
    let mut rng = fastrand::Rng::with_seed(7);

    for parameter in Parameter::ALL {
        let (min, max) = parameter.bounds();
        let mut inputs = vec![min, max, min - 1.0, max + 1.0, (min + max) / 2.0, f32::NAN, f32::INFINITY];
        inputs.extend((0..16).map(|_| min - 2.0 + rng.f32() * (max - min + 4.0)));

        for requested in inputs {
            coordinator.dispatch(mirror_command(parameter, requested));
            // The ambient bridge writes a derived value; read the owning slice.
            let stored = coordinator.context().parameter(parameter);
            if parameter != Parameter::AmbientContribution {
                assert_eq!(stored, parameter.clamp(requested), "{parameter} <- {requested}");
            }
            assert!((min..=max).contains(&stored), "{parameter} = {stored}");
        }
    }
}

#[tokio::test]
async fn failure_in_one_region_leaves_siblings_running() {
    let rig = Rig::new();
    rig.hdr.fail_path("broken.hdr");
    let mut coordinator = rig.coordinator();

    coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
    coordinator.dispatch(load("broken.hdr"));
    coordinator.settle().await;

    let value = coordinator.snapshot().value;
    assert_eq!(value.environment, Phase::Error);
    assert_eq!(value.bloom, Phase::Active);

    coordinator.dispatch(Command::Environment(EnvironmentCommand::Disable));
    assert_eq!(coordinator.snapshot().value.environment, Phase::Disabled);
}

// =============================================================================
// Security
// =============================================================================

#[tokio::test]
async fn transition_requests_during_transition_are_rejected() {
    let rig = Rig::new();
    let mut coordinator = rig.coordinator();

    coordinator
        .security_command(SecurityCommand::SetSecurity {
            level: SecurityLevel::Warning,
        })
        .unwrap();
    rig.clock.advance_ms(400);
    let rejected = coordinator.security_command(SecurityCommand::SetPreset {
        level: SecurityLevel::Danger,
    });

    assert!(matches!(rejected, Err(SyncError::TransitionBusy { .. })));
    let security = coordinator.context().security.clone();
    assert_eq!(security.level, SecurityLevel::Normal);
    assert_eq!(security.transition.map(|t| t.to), Some(SecurityLevel::Warning));

    rig.clock.advance_ms(400);
    coordinator.tick();
    assert_eq!(coordinator.snapshot().value.security, SecurityLevel::Warning);
    assert!(!coordinator.snapshot().value.security_transitioning);
}

#[tokio::test]
async fn danger_alert_boosts_iris_bloom() {
    let rig = Rig::new();
    let mut coordinator = rig.coordinator();
    coordinator.dispatch(Command::System(SystemCommand::RegisterObjects {
        group: ObjectGroup::Iris,
        handles: vec![ObjectHandle(3)],
    }));
    coordinator.dispatch(Command::Bloom(BloomCommand::Enable));
    coordinator.settle().await;

    coordinator.dispatch(Command::Security(SecurityCommand::SetSecurity {
        level: SecurityLevel::Danger,
    }));
    rig.clock.advance_ms(800);
    coordinator.tick();

    let bloom = &coordinator.context().bloom;
    assert_eq!(bloom.groups.get(&ObjectGroup::Iris), Some(&2.5));
    assert_eq!(
        rig.scene.applied_to(ObjectHandle(3)).last(),
        Some(&(crate::services::MaterialProperty::EmissiveIntensity, 2.5))
    );
}

#[tokio::test]
async fn audit_trail_keeps_only_newest_entries() {
    let rig = Rig::new();
    let mut config = SyncConfig::default();
    config.audit.capacity = 4;
    let mut coordinator = rig.coordinator_with(config);

    for level in [SecurityLevel::Warning, SecurityLevel::Safe, SecurityLevel::Danger] {
        coordinator
            .security_command(SecurityCommand::SetSecurity { level })
            .unwrap();
        rig.clock.advance_ms(800);
        coordinator.tick();
    }

    let log = coordinator.audit_log();
    assert_eq!(log.len(), 4);
    assert!(!log
        .query(AuditFilter::default())
        .any(|entry| entry.detail == "override to WARNING"));
    assert_eq!(
        log.query(AuditFilter::default().event_type(AuditEventType::LevelChange)).count(),
        2
    );
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test]
async fn hdr_breaker_opens_waits_then_closes_on_trial_success() {
    let rig = Rig::new();
    rig.hdr.fail_path("broken.hdr");
    let mut coordinator = rig.coordinator();

    for _ in 0..3 {
        coordinator.dispatch(load("broken.hdr"));
        coordinator.settle().await;
    }
    assert_eq!(hdr_breaker(&coordinator).state, BreakerState::Open);

    rig.clock.advance_ms(4_999);
    coordinator.dispatch(load("studio.hdr"));
    coordinator.settle().await;
    assert_eq!(rig.hdr.loads(), 3);
    assert_eq!(coordinator.snapshot().value.environment, Phase::Error);

    rig.clock.advance_ms(1);
    assert_eq!(hdr_breaker(&coordinator).state, BreakerState::HalfOpen);
    coordinator.dispatch(load("studio.hdr"));
    coordinator.settle().await;

    let breaker = hdr_breaker(&coordinator);
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.failure_count, 0);
    assert_eq!(coordinator.snapshot().value.environment, Phase::Active);
}

// =============================================================================
// Disposal
// =============================================================================

#[tokio::test]
async fn dispose_during_pending_hdr_load_discards_completion() {
    let rig = Rig::new();
    let mut coordinator = rig.coordinator();
    coordinator.dispatch(Command::System(SystemCommand::RegisterObjects {
        group: ObjectGroup::EyeRings,
        handles: vec![ObjectHandle(1), ObjectHandle(2)],
    }));

    rig.hdr.gate();
    coordinator.dispatch(load("studio.hdr"));
    assert_eq!(coordinator.snapshot().value.environment, Phase::Activating);
    assert_eq!(coordinator.pending_calls(), 1);

    coordinator.dispatch(Command::System(SystemCommand::Dispose));
    let disposed = coordinator.snapshot();
    assert!(disposed.context.objects.is_empty());
    assert_eq!(disposed.value.status, Status::Disposed);
    assert!(rig
        .scene
        .calls()
        .contains(&SceneCall::Unregister(ObjectGroup::EyeRings, vec![ObjectHandle(1), ObjectHandle(2)])));

    rig.hdr.release(1);
    coordinator.settle().await;

    assert_eq!(coordinator.snapshot(), disposed);
    assert_eq!(coordinator.context().environment.hdr, None);
    assert_eq!(hdr_breaker(&coordinator).state, BreakerState::Closed);
}

// =============================================================================
// Render sync
// =============================================================================

async fn running_sync(rig: &Rig) -> (RenderSync, Arc<InMemoryReactiveStore>) {
    let coordinator = all_active(rig).await;
    let store = rig.store();
    let mut sync = RenderSync::new(coordinator, store.clone(), Default::default());
    sync.start().await.unwrap();
    (sync, store)
}

#[tokio::test]
async fn concurrent_writes_surface_one_conflict_then_latest_wins() {
    let rig = Rig::new();
    let (mut sync, store) = running_sync(&rig).await;
    let (notices, _subscription) = sync_notices(sync.coordinator());

    store.write(Parameter::BloomThreshold, 0.2);
    rig.clock.advance_ms(10);
    sync.send(SyncEvent::Command(Command::Bloom(BloomCommand::UpdateGlobal {
        threshold: Some(0.5),
        strength: None,
        radius: None,
    })))
    .await
    .unwrap();
    rig.clock.advance_ms(100);
    sync.poll().await.unwrap();

    let notices = notices.lock().unwrap().clone();
    let conflicts: Vec<_> = notices
        .iter()
        .filter(|n| matches!(n, SyncNotice::ConflictDetected { .. }))
        .collect();
    assert_eq!(
        conflicts,
        vec![&SyncNotice::ConflictDetected {
            parameter: Parameter::BloomThreshold,
            store_value: 0.2,
            coordinator_value: 0.5,
        }]
    );
    assert!(notices.contains(&SyncNotice::ConflictResolved {
        parameter: Parameter::BloomThreshold,
        value: 0.5,
        winner: Side::Coordinator,
    }));
    assert_eq!(store.get(Parameter::BloomThreshold), Some(0.5));
    assert_eq!(sync.coordinator().context().bloom.threshold, 0.5);

    let state = sync.state();
    assert_eq!((state.conflicts_detected, state.conflicts_resolved), (1, 1));
}

#[tokio::test]
async fn later_store_write_wins_conflict() {
    let rig = Rig::new();
    let (mut sync, store) = running_sync(&rig).await;

    sync.send(SyncEvent::Command(Command::Pbr(PbrCommand::UpdateMaterial {
        metalness: Some(0.9),
        roughness: None,
        env_map_intensity: None,
    })))
    .await
    .unwrap();
    rig.clock.advance_ms(30);
    sync.send(SyncEvent::StoreWrite {
        parameter: Parameter::Metalness,
        value: 0.1,
    })
    .await
    .unwrap();
    rig.clock.advance_ms(100);
    sync.poll().await.unwrap();

    assert_eq!(sync.coordinator().context().pbr.metalness, 0.1);
    assert_eq!(store.get(Parameter::Metalness), Some(0.1));
    assert_eq!(sync.state().conflicts_detected, 1);
}

#[tokio::test]
async fn checkpoint_round_trip_preserves_both_sides() {
    let rig = Rig::new();
    let (mut sync, store) = running_sync(&rig).await;
    sync.coordinator_mut().dispatch(Command::System(SystemCommand::RegisterObjects {
        group: ObjectGroup::MagicRings,
        handles: vec![ObjectHandle(9)],
    }));
    store.write(Parameter::BackgroundBlur, 0.4);
    rig.clock.advance_ms(100);
    sync.poll().await.unwrap();

    sync.send(SyncEvent::Checkpoint).await.unwrap();
    let id = sync.state().last_checkpoint_id.unwrap();
    let loaded = CheckpointStore::new(rig.storage.clone(), 5).load(id).await.unwrap();

    assert_eq!(loaded.payload.store, store.state());
    assert_eq!(loaded.payload.coordinator, sync.coordinator().snapshot());
    assert_eq!(loaded.payload.coordinator.context.environment.background_blur, 0.4);
}

#[tokio::test]
async fn restart_surfaces_write_that_missed_the_coordinator() {
    let rig = Rig::new();
    let (mut first, store) = running_sync(&rig).await;
    first.send(SyncEvent::Checkpoint).await.unwrap();
    let checkpoint_id = first.state().last_checkpoint_id;
    first.stop();

    // Crash window: the store accepted a write nobody mirrored.
    rig.clock.advance_ms(5);
    store.write(Parameter::BloomThreshold, 0.3);

    let coordinator = all_active(&rig).await;
    let mut second = RenderSync::new(coordinator, store.clone(), Default::default());
    let (notices, _subscription) = sync_notices(second.coordinator());
    let report = second.start().await.unwrap();

    assert_eq!(report.checkpoint_id, checkpoint_id);
    assert_eq!(report.divergences.len(), 1);
    assert_eq!(report.divergences[0].parameter, Parameter::BloomThreshold);
    assert_eq!(report.divergences[0].checkpoint_store, Some(0.8));
    assert_eq!(report.divergences[0].checkpoint_coordinator, Some(0.8));

    rig.clock.advance_ms(100);
    second.poll().await.unwrap();
    assert_eq!(second.coordinator().context().bloom.threshold, 0.3);

    let notices = notices.lock().unwrap().clone();
    assert!(matches!(notices.first(), Some(SyncNotice::Recovered { .. })));
    assert!(notices.iter().any(|n| matches!(
        n,
        SyncNotice::ConflictResolved { winner: Side::Store, .. }
    )));
}

#[tokio::test]
async fn manual_clock_drives_checkpoint_timestamps() {
    let rig = Rig::new();
    let (mut sync, _store) = running_sync(&rig).await;
    rig.clock.advance_ms(1_234);

    sync.send(SyncEvent::Checkpoint).await.unwrap();
    assert_eq!(sync.state().last_checkpoint_at, Some(rig.clock.now()));
}
