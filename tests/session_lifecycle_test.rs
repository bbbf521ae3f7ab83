//! Integration tests for the session lifecycle.
//!
//! Drives a `SessionEngine` through the full start / sensor feed / pause /
//! resume / end flow and checks the transition guards around it.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use stridelog::permissions::{AuthorizationStatus, Capability, StaticGate};
use stridelog::samples::{HeartRateSample, PositionFix, SessionKind};
use stridelog::session::{spawn_event_pump, SensorEvent, SessionEngine, SessionError, SessionState};
use stridelog::storage::{EngineConfig, MemoryHealthStore, PersistenceGateway};

/// Log capture for failing tests; `RUST_LOG` controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_engine(gate: StaticGate) -> Arc<SessionEngine<StaticGate, MemoryHealthStore>> {
    init_tracing();
    let store = Arc::new(MemoryHealthStore::new());
    let gateway = Arc::new(PersistenceGateway::with_defaults(store));
    Arc::new(SessionEngine::new(EngineConfig::default(), gate, gateway))
}

fn fix(latitude: f64, longitude: f64, offset_secs: i64) -> PositionFix {
    PositionFix {
        latitude,
        longitude,
        altitude_meters: 12.0,
        horizontal_accuracy_meters: 5.0,
        timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
    }
}

fn hr(bpm: u16, offset_secs: i64) -> HeartRateSample {
    HeartRateSample {
        bpm,
        timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
    }
}

#[tokio::test]
async fn test_full_session_flow() {
    let engine = make_engine(StaticGate::allow_all());

    assert_eq!(engine.state(), SessionState::Idle);
    let session_id = engine.start_session(SessionKind::Running, true).await.unwrap();
    assert_eq!(engine.state(), SessionState::Active);
    assert_eq!(engine.active_session_id(), Some(session_id));

    // A track along one degree of longitude: ~5.5 m per step at the equator
    for i in 0..10 {
        engine.ingest_position(fix(0.0, 0.00005 * i as f64, i));
        engine.ingest_heart_rate(hr(140 + i as u16, i));
    }

    let live = engine.live_metrics();
    assert_eq!(live.state, SessionState::Active);
    assert!(live.total_distance_meters > 40.0);
    assert!(live.total_distance_meters < 60.0);
    assert!(live.current_heart_rate.is_some());
    assert!(live.current_pace.is_some());

    engine.pause().unwrap();
    assert_eq!(engine.state(), SessionState::Paused);
    engine.resume().unwrap();
    assert_eq!(engine.state(), SessionState::Active);

    let summary = engine.end().await.unwrap();
    assert_eq!(summary.id, session_id);
    assert_eq!(summary.kind, SessionKind::Running);
    assert!(summary.total_distance_meters > 40.0);
    assert!(summary.estimated_energy_kcal >= 0.0);
    assert_eq!(summary.route.len(), 10);
    assert_eq!(summary.heart_rate_samples.len(), 10);
    assert_eq!(summary.max_heart_rate, Some(149));
    assert_eq!(
        summary.source_metadata.get("session_kind").map(String::as_str),
        Some("Running")
    );

    // Session is destroyed once the summary is handed off
    assert_eq!(engine.state(), SessionState::Idle);
    assert_eq!(engine.active_session_id(), None);
}

#[tokio::test]
async fn test_active_duration_excludes_paused_time() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.pause().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    engine.resume().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let summary = engine.end().await.unwrap();
    let active_ms = summary.active_duration.as_millis();
    assert!(active_ms >= 550, "active duration too short: {active_ms}ms");
    assert!(active_ms < 900, "paused time leaked into total: {active_ms}ms");
}

#[tokio::test]
async fn test_denied_health_write_aborts_start() {
    let engine = make_engine(StaticGate::undetermined(false));

    let err = engine.start_session(SessionKind::Running, true).await.unwrap_err();
    assert_eq!(err, SessionError::CapabilityDenied(Capability::HealthWrite));
    assert_eq!(engine.state(), SessionState::Aborted);
    assert!(engine.recent_sessions(10).is_empty());
    // The session never became active, so there is no partial to recover
    assert!(engine.last_aborted().is_none());

    // A terminal slot does not block the next start
    let gate_err = engine.start_session(SessionKind::Running, true).await.unwrap_err();
    assert_eq!(gate_err, SessionError::CapabilityDenied(Capability::HealthWrite));
}

#[tokio::test]
async fn test_denied_location_aborts_gps_start() {
    let gate = StaticGate::allow_all();
    gate.set(Capability::Location, AuthorizationStatus::Denied);
    let engine = make_engine(gate);

    let err = engine.start_session(SessionKind::Running, true).await.unwrap_err();
    assert_eq!(err, SessionError::CapabilityDenied(Capability::Location));
}

#[tokio::test]
async fn test_denied_location_ignored_without_gps() {
    let gate = StaticGate::allow_all();
    gate.set(Capability::Location, AuthorizationStatus::Denied);
    let engine = make_engine(gate);

    // Strength training never integrates GPS distance
    engine
        .start_session(SessionKind::StrengthTraining, true)
        .await
        .unwrap();
    assert_eq!(engine.state(), SessionState::Active);
}

#[tokio::test]
async fn test_second_start_is_a_conflict() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Cycling, false).await.unwrap();

    let err = engine.start_session(SessionKind::Running, false).await.unwrap_err();
    assert_eq!(err, SessionError::SessionConflict);
}

#[tokio::test]
async fn test_commands_outside_their_state_fail() {
    let engine = make_engine(StaticGate::allow_all());

    assert!(matches!(
        engine.pause().unwrap_err(),
        SessionError::InvalidTransition {
            from: SessionState::Idle,
            to: SessionState::Paused,
        }
    ));
    assert!(matches!(
        engine.resume().unwrap_err(),
        SessionError::InvalidTransition { .. }
    ));
    assert!(matches!(
        engine.end().await.unwrap_err(),
        SessionError::InvalidTransition { .. }
    ));

    engine.start_session(SessionKind::Running, false).await.unwrap();
    // Resume only applies to a paused session
    assert!(matches!(
        engine.resume().unwrap_err(),
        SessionError::InvalidTransition {
            from: SessionState::Active,
            to: SessionState::Active,
        }
    ));
}

#[tokio::test]
async fn test_gps_jump_does_not_move_distance() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();

    engine.ingest_position(fix(0.0, 0.0, 0));
    engine.ingest_position(fix(0.0, 0.00005, 1));
    let before = engine.live_metrics().total_distance_meters;

    // ~1.1 km in one second, far beyond any running pace
    engine.ingest_position(fix(0.0, 0.0101, 2));
    let after = engine.live_metrics().total_distance_meters;
    assert_eq!(before, after);

    // The jump still lands on the route for the map
    let summary = engine.end().await.unwrap();
    assert_eq!(summary.route.len(), 3);
}

#[tokio::test]
async fn test_paused_session_freezes_totals() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();

    engine.ingest_position(fix(0.0, 0.0, 0));
    engine.ingest_position(fix(0.0, 0.00005, 1));
    let frozen = engine.live_metrics().total_distance_meters;

    engine.pause().unwrap();
    engine.ingest_position(fix(0.0, 0.0001, 2));
    engine.ingest_heart_rate(hr(150, 2));

    let live = engine.live_metrics();
    assert_eq!(live.total_distance_meters, frozen);
    // The vitals readout stays fresh while paused
    assert_eq!(live.current_heart_rate, Some(150));

    engine.resume().unwrap();
    let summary = engine.end().await.unwrap();
    assert_eq!(summary.total_distance_meters, frozen);
    assert_eq!(summary.route.len(), 3);
}

#[tokio::test]
async fn test_end_requires_an_active_session() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, false).await.unwrap();
    engine.pause().unwrap();

    // A paused session resumes before it can end
    assert!(matches!(
        engine.end().await.unwrap_err(),
        SessionError::InvalidTransition {
            from: SessionState::Paused,
            to: SessionState::Ending,
        }
    ));
    assert_eq!(engine.state(), SessionState::Paused);

    engine.resume().unwrap();
    engine.end().await.unwrap();
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_late_callbacks_after_end_are_discarded() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();
    engine.ingest_position(fix(0.0, 0.0, 0));
    let summary = engine.end().await.unwrap();

    // Sensors often deliver a few callbacks after teardown
    engine.ingest_position(fix(0.0, 0.001, 3));
    engine.ingest_heart_rate(hr(160, 3));

    assert_eq!(engine.state(), SessionState::Idle);
    let stored = engine.recent_sessions(10);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].route.len(), summary.route.len());
}

#[tokio::test]
async fn test_abort_keeps_partial_summary_unpersisted() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();
    engine.ingest_position(fix(0.0, 0.0, 0));
    engine.ingest_position(fix(0.0, 0.00005, 1));

    engine.abort().unwrap();
    assert_eq!(engine.state(), SessionState::Aborted);

    let partial = engine.last_aborted().unwrap();
    assert_eq!(partial.route.len(), 2);
    assert_eq!(
        partial.source_metadata.get("aborted").map(String::as_str),
        Some("cancelled")
    );
    assert!(engine.recent_sessions(10).is_empty());

    // A second abort has nothing to cancel
    assert!(matches!(
        engine.abort().unwrap_err(),
        SessionError::InvalidTransition { .. }
    ));

    // And a new session can start over the aborted slot
    engine.start_session(SessionKind::Walking, false).await.unwrap();
    assert_eq!(engine.state(), SessionState::Active);
}

#[tokio::test]
async fn test_location_revocation_aborts_gps_session() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();
    engine.ingest_position(fix(0.0, 0.0, 0));

    engine.handle_authorization(Capability::Location, AuthorizationStatus::Denied);

    assert_eq!(engine.state(), SessionState::Aborted);
    let partial = engine.last_aborted().unwrap();
    assert_eq!(
        partial.source_metadata.get("aborted").map(String::as_str),
        Some("capability lost: location")
    );
}

#[tokio::test]
async fn test_location_revocation_degrades_indoor_session() {
    let engine = make_engine(StaticGate::allow_all());
    engine
        .start_session(SessionKind::StrengthTraining, true)
        .await
        .unwrap();

    engine.handle_authorization(Capability::Location, AuthorizationStatus::Denied);
    assert_eq!(engine.state(), SessionState::Active);

    let summary = engine.end().await.unwrap();
    assert_eq!(
        summary.source_metadata.get("degraded_mode").map(String::as_str),
        Some("location")
    );
}

#[tokio::test]
async fn test_health_write_revocation_always_aborts() {
    let engine = make_engine(StaticGate::allow_all());
    engine
        .start_session(SessionKind::StrengthTraining, false)
        .await
        .unwrap();

    engine.handle_authorization(Capability::HealthWrite, AuthorizationStatus::Restricted);

    assert_eq!(engine.state(), SessionState::Aborted);
    let partial = engine.last_aborted().unwrap();
    assert_eq!(
        partial.source_metadata.get("aborted").map(String::as_str),
        Some("capability lost: health write")
    );
}

#[tokio::test]
async fn test_grant_updates_are_inert() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();

    engine.handle_authorization(Capability::Location, AuthorizationStatus::Granted);
    assert_eq!(engine.state(), SessionState::Active);
}

#[tokio::test]
async fn test_event_pump_feeds_the_engine_in_order() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, true).await.unwrap();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let pump = spawn_event_pump(Arc::clone(&engine), rx);

    for i in 0..5 {
        tx.send(SensorEvent::Position(fix(0.0, 0.00005 * i as f64, i)))
            .unwrap();
    }
    tx.send(SensorEvent::HeartRate(hr(148, 5))).unwrap();
    drop(tx);
    pump.await.unwrap();

    let live = engine.live_metrics();
    assert!(live.total_distance_meters > 15.0);
    assert_eq!(live.current_heart_rate, Some(148));

    let summary = engine.end().await.unwrap();
    assert_eq!(summary.route.len(), 5);
}

#[tokio::test]
async fn test_concurrent_pause_and_end_have_one_winner() {
    let engine = make_engine(StaticGate::allow_all());
    engine.start_session(SessionKind::Running, false).await.unwrap();

    let pauser = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.pause() })
    };
    let ender = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.end().await })
    };

    let paused = pauser.await.unwrap();
    let ended = ender.await.unwrap();

    // Exactly one command wins; the loser sees a clean transition error
    match (&paused, &ended) {
        (Ok(()), Err(SessionError::InvalidTransition { .. })) => {
            assert_eq!(engine.state(), SessionState::Paused);
        }
        (Err(SessionError::InvalidTransition { .. }), Ok(_)) => {
            assert_eq!(engine.state(), SessionState::Idle);
        }
        other => panic!("expected one winner and one loser, got: {other:?}"),
    }
    assert_eq!(engine.recent_sessions(10).len(), ended.is_ok() as usize);
}
