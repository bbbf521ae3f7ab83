//! Session engine: the serialized state machine driving a workout session.
//!
//! The engine is the registry for the single in-flight session. Hosts
//! compose it with a capability gate and a persistence gateway; there is no
//! global instance. Every mutation of the active session, whether a UI
//! command or a sensor callback, goes through one mutex-guarded slot, so
//! concurrent commands are applied one at a time and a losing racer sees an
//! `InvalidTransition` instead of a torn state.

use crate::metrics::{MetricsAccumulator, PositionOutcome};
use crate::permissions::{AuthorizationStatus, Capability, CapabilityGate};
use crate::samples::{HeartRateSample, PositionFix, SessionKind};
use crate::session::types::{
    downsample, AbortReason, LiveMetrics, SessionError, SessionState, SessionSummary,
    WorkoutSession,
};
use crate::storage::{EngineConfig, HealthStore, PersistError, PersistenceGateway};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The in-flight session plus its runtime bookkeeping.
struct ActiveSlot {
    session: WorkoutSession,
    accumulator: MetricsAccumulator,
    /// Active time accumulated across completed Active segments
    accrued: Duration,
    /// Start of the current Active segment; `None` outside Active
    segment_started: Option<Instant>,
}

impl ActiveSlot {
    /// Active duration right now: accrued plus the running segment.
    fn active_duration(&self) -> Duration {
        match self.segment_started {
            Some(started) => self.accrued + started.elapsed(),
            None => self.accrued,
        }
    }

    /// Fold the running segment into `accrued`. Called on every transition
    /// out of Active so paused intervals never leak into the total.
    fn accrue(&mut self) {
        if let Some(started) = self.segment_started.take() {
            self.accrued += started.elapsed();
        }
        self.session.active_duration = self.accrued;
    }
}

/// Coordinates the session lifecycle, metrics, capabilities, and
/// persistence for one host application.
pub struct SessionEngine<G: CapabilityGate, S: HealthStore> {
    config: EngineConfig,
    gate: G,
    gateway: Arc<PersistenceGateway<S>>,
    active: Mutex<Option<ActiveSlot>>,
    /// Partial summary of the most recently aborted session, for the
    /// "recover last session" affordance
    last_aborted: Mutex<Option<SessionSummary>>,
}

impl<G: CapabilityGate, S: HealthStore> SessionEngine<G, S> {
    /// Create an engine over the given gate and gateway.
    pub fn new(config: EngineConfig, gate: G, gateway: Arc<PersistenceGateway<S>>) -> Self {
        Self {
            config,
            gate,
            gateway,
            active: Mutex::new(None),
            last_aborted: Mutex::new(None),
        }
    }

    /// Start a session of the given kind.
    ///
    /// Verifies capabilities first: health-store write access is always
    /// required (requested if undetermined); location is required only when
    /// `enable_location` is set and the kind integrates GPS distance. A
    /// denial aborts the session and reports the missing capability. Fails
    /// with `SessionConflict` while another session is in flight.
    pub async fn start_session(
        &self,
        kind: SessionKind,
        enable_location: bool,
    ) -> Result<Uuid, SessionError> {
        let uses_gps = self.config.metrics.kinds.get(kind).uses_gps_distance;
        let location_required = enable_location && uses_gps;

        let session_id = {
            let mut guard = lock(&self.active);
            // A terminal slot is only kept for observability; it does not
            // hold the singleton claim.
            if let Some(slot) = guard.as_ref() {
                if !slot.session.state.is_terminal() {
                    return Err(SessionError::SessionConflict);
                }
            }
            let session = WorkoutSession::new(kind, location_required);
            let id = session.id;
            *guard = Some(ActiveSlot {
                accumulator: MetricsAccumulator::new(kind, self.config.metrics.clone()),
                session,
                accrued: Duration::ZERO,
                segment_started: None,
            });
            id
        };
        tracing::info!(%session_id, %kind, "session starting");

        if let Err(err) = self.require(Capability::HealthWrite).await {
            self.mark_start_aborted(session_id, Capability::HealthWrite);
            return Err(err);
        }
        if location_required {
            if let Err(err) = self.require(Capability::Location).await {
                self.mark_start_aborted(session_id, Capability::Location);
                return Err(err);
            }
        }

        let mut guard = lock(&self.active);
        match guard.as_mut() {
            Some(slot)
                if slot.session.id == session_id
                    && slot.session.state == SessionState::Starting =>
            {
                slot.session.state = SessionState::Active;
                slot.session.started_at = Some(Utc::now());
                slot.segment_started = Some(Instant::now());
                tracing::info!(%session_id, "session active");
                Ok(session_id)
            }
            // Aborted (or replaced) while capability checks were in flight
            slot => Err(SessionError::InvalidTransition {
                from: slot
                    .as_ref()
                    .map(|s| s.session.state)
                    .unwrap_or(SessionState::Idle),
                to: SessionState::Active,
            }),
        }
    }

    /// Check a capability, prompting once if the user has not decided.
    async fn require(&self, capability: Capability) -> Result<(), SessionError> {
        let mut status = self.gate.check(capability);
        if status == AuthorizationStatus::NotDetermined {
            status = self.gate.request_if_needed(capability).await;
        }
        if status == AuthorizationStatus::Granted {
            Ok(())
        } else {
            tracing::warn!(%capability, %status, "required capability not granted");
            Err(SessionError::CapabilityDenied(capability))
        }
    }

    /// Mark a session that never left Starting as aborted, recording the
    /// capability whose denial caused it.
    fn mark_start_aborted(&self, session_id: Uuid, capability: Capability) {
        let mut guard = lock(&self.active);
        let still_starting = guard.as_ref().is_some_and(|slot| {
            slot.session.id == session_id && slot.session.state == SessionState::Starting
        });
        if still_starting {
            let _ = self.abort_locked(&mut guard, AbortReason::CapabilityDenied(capability));
        }
    }

    /// Pause the session, freezing duration, distance, and energy.
    pub fn pause(&self) -> Result<(), SessionError> {
        let mut guard = lock(&self.active);
        let slot = match guard.as_mut() {
            Some(slot) if slot.session.state == SessionState::Active => slot,
            other => {
                return Err(invalid_transition(other.map(|s| &*s), SessionState::Paused));
            }
        };
        slot.accrue();
        slot.session.state = SessionState::Paused;
        tracing::info!(session_id = %slot.session.id, "session paused");
        Ok(())
    }

    /// Resume an active segment. No gap is inserted into the active
    /// duration for the paused interval.
    pub fn resume(&self) -> Result<(), SessionError> {
        let mut guard = lock(&self.active);
        let slot = match guard.as_mut() {
            Some(slot) if slot.session.state == SessionState::Paused => slot,
            other => {
                return Err(invalid_transition(other.map(|s| &*s), SessionState::Active));
            }
        };
        slot.session.state = SessionState::Active;
        slot.segment_started = Some(Instant::now());
        tracing::info!(session_id = %slot.session.id, "session resumed");
        Ok(())
    }

    /// End the session: stop sensor intake, build the immutable summary,
    /// hand it to persistence, and complete.
    ///
    /// Only an Active session can end; a paused session resumes first. This
    /// keeps every pair of racing commands at exactly one winner.
    ///
    /// The session completes even when persistence fails; a transient store
    /// failure leaves the summary queued for background retry and is
    /// invisible here.
    pub async fn end(&self) -> Result<SessionSummary, SessionError> {
        let summary = {
            let mut guard = lock(&self.active);
            let slot = match guard.as_mut() {
                Some(slot) if slot.session.state == SessionState::Active => slot,
                other => {
                    return Err(invalid_transition(other.map(|s| &*s), SessionState::Ending));
                }
            };
            slot.accrue();
            slot.session.state = SessionState::Ending;
            tracing::info!(session_id = %slot.session.id, "session ending");
            self.finalize(slot, Utc::now())
        };

        match self.gateway.persist(summary.clone()).await {
            Ok(stored_id) => {
                tracing::info!(summary_id = %summary.id, %stored_id, "summary persisted");
            }
            Err(PersistError::Transient { attempts, .. }) => {
                tracing::warn!(
                    summary_id = %summary.id,
                    attempts,
                    "summary sync pending, queued for background retry"
                );
            }
            Err(PersistError::Fatal(message)) => {
                tracing::error!(summary_id = %summary.id, %message, "summary failed to persist");
            }
        }

        let mut guard = lock(&self.active);
        if let Some(slot) = guard.as_ref() {
            if slot.session.id == summary.id && slot.session.state == SessionState::Ending {
                *guard = None;
                tracing::info!(session_id = %summary.id, "session completed");
            }
        }
        Ok(summary)
    }

    /// Cancel the in-flight session. The partial summary is retained in
    /// memory (see `last_aborted`) but not persisted.
    pub fn abort(&self) -> Result<(), SessionError> {
        let mut guard = lock(&self.active);
        self.abort_locked(&mut guard, AbortReason::Cancelled)
    }

    fn abort_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<ActiveSlot>>,
        reason: AbortReason,
    ) -> Result<(), SessionError> {
        let slot = match guard.as_mut() {
            Some(slot)
                if matches!(
                    slot.session.state,
                    SessionState::Starting | SessionState::Active | SessionState::Paused
                ) =>
            {
                slot
            }
            other => {
                return Err(invalid_transition(other.map(|s| &*s), SessionState::Aborted));
            }
        };

        slot.accrue();
        slot.session.state = SessionState::Aborted;
        let session_id = slot.session.id;
        // Partial summary only makes sense once the session has been active
        let partial = slot.session.started_at.is_some().then(|| {
            let mut summary = self.finalize(slot, Utc::now());
            summary
                .source_metadata
                .insert("aborted".to_string(), reason.to_string());
            summary
        });
        if let Some(summary) = partial {
            *lock(&self.last_aborted) = Some(summary);
        }
        tracing::warn!(%session_id, %reason, "session aborted");
        Ok(())
    }

    /// Feed a position fix from the location service.
    ///
    /// A no-op outside Active/Paused: callbacks arriving after a terminal
    /// transition are discarded, never errors. Paused sessions keep
    /// appending to the route so the map stays live, but totals are frozen.
    pub fn ingest_position(&self, fix: PositionFix) {
        let mut guard = lock(&self.active);
        let Some(slot) = guard.as_mut() else {
            tracing::trace!("position fix with no session in flight, discarded");
            return;
        };
        match slot.session.state {
            SessionState::Active => {
                slot.session.route.push(fix.clone());
                if slot.session.location_enabled {
                    match slot.accumulator.ingest_position(&fix) {
                        PositionOutcome::Accepted { delta_meters } => {
                            slot.session.total_distance_meters =
                                slot.accumulator.total_distance_meters();
                            tracing::trace!(delta_meters, "fix accepted");
                        }
                        PositionOutcome::Rejected(reason) => {
                            tracing::debug!(?reason, "fix rejected for distance");
                        }
                    }
                }
            }
            SessionState::Paused => {
                slot.session.route.push(fix);
            }
            state => {
                tracing::trace!(%state, "position fix discarded");
            }
        }
    }

    /// Feed a heart-rate sample.
    ///
    /// Paused sessions keep the live vitals readout fresh without moving
    /// the metrics that feed the energy estimate.
    pub fn ingest_heart_rate(&self, sample: HeartRateSample) {
        let mut guard = lock(&self.active);
        let Some(slot) = guard.as_mut() else {
            tracing::trace!("heart-rate sample with no session in flight, discarded");
            return;
        };
        match slot.session.state {
            SessionState::Active => {
                slot.session.heart_rate_samples.push(sample);
                slot.accumulator.ingest_heart_rate(sample);
                let active = slot.active_duration();
                slot.session.estimated_energy_kcal =
                    slot.accumulator.estimated_energy_kcal(active);
            }
            SessionState::Paused => {
                slot.session.heart_rate_samples.push(sample);
                slot.accumulator.touch_heart_rate(sample);
            }
            state => {
                tracing::trace!(%state, "heart-rate sample discarded");
            }
        }
    }

    /// React to an authorization change from the platform.
    ///
    /// Revoking location mid-session aborts a session that relies on GPS
    /// distance; a session where location is optional continues in degraded
    /// mode with distance accrual stopped. Revoking health write always
    /// aborts, since every completed session must be written.
    pub fn handle_authorization(&self, capability: Capability, status: AuthorizationStatus) {
        if matches!(
            status,
            AuthorizationStatus::Granted | AuthorizationStatus::NotDetermined
        ) {
            tracing::debug!(%capability, %status, "authorization update");
            return;
        }

        let mut guard = lock(&self.active);
        let (state, location_enabled) = match guard.as_ref() {
            Some(slot) => (slot.session.state, slot.session.location_enabled),
            None => return,
        };
        if state.is_terminal() || state == SessionState::Ending {
            return;
        }

        match capability {
            Capability::HealthWrite => {
                let _ = self.abort_locked(
                    &mut guard,
                    AbortReason::CapabilityLost(Capability::HealthWrite),
                );
            }
            Capability::Location if location_enabled => {
                let _ = self.abort_locked(
                    &mut guard,
                    AbortReason::CapabilityLost(Capability::Location),
                );
            }
            Capability::Location => {
                if let Some(slot) = guard.as_mut() {
                    slot.session.degraded = true;
                    slot.session.location_enabled = false;
                    tracing::warn!(
                        session_id = %slot.session.id,
                        "location revoked, continuing in degraded mode"
                    );
                }
            }
        }
    }

    /// Consistent snapshot of the live metrics. `Idle` defaults when no
    /// session is in flight.
    pub fn live_metrics(&self) -> LiveMetrics {
        let mut guard = lock(&self.active);
        let Some(slot) = guard.as_mut() else {
            return LiveMetrics::default();
        };
        let active = slot.active_duration();
        slot.session.active_duration = active;
        slot.session.estimated_energy_kcal = slot.accumulator.estimated_energy_kcal(active);
        LiveMetrics {
            state: slot.session.state,
            active_duration: active,
            total_distance_meters: slot.accumulator.total_distance_meters(),
            current_pace: slot.accumulator.current_pace(),
            current_heart_rate: slot.accumulator.current_heart_rate(Utc::now()),
            estimated_energy_kcal: slot.session.estimated_energy_kcal,
        }
    }

    /// Current lifecycle state; `Idle` when no session is in flight.
    pub fn state(&self) -> SessionState {
        lock(&self.active)
            .as_ref()
            .map(|slot| slot.session.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Id of the in-flight session, if any.
    pub fn active_session_id(&self) -> Option<Uuid> {
        lock(&self.active).as_ref().map(|slot| slot.session.id)
    }

    /// Partial summary of the most recently aborted session.
    pub fn last_aborted(&self) -> Option<SessionSummary> {
        lock(&self.last_aborted).clone()
    }

    /// Recently completed sessions, most-recent-first.
    pub fn recent_sessions(&self, limit: usize) -> Vec<SessionSummary> {
        self.gateway.recent_sessions(limit)
    }

    /// The persistence gateway, for background retry composition.
    pub fn gateway(&self) -> &Arc<PersistenceGateway<S>> {
        &self.gateway
    }

    /// Build the immutable summary from the slot's final totals.
    fn finalize(&self, slot: &mut ActiveSlot, ended_at: DateTime<Utc>) -> SessionSummary {
        let active = slot.accrued;
        let energy = slot.accumulator.estimated_energy_kcal(active);
        slot.session.estimated_energy_kcal = energy;
        let distance = slot.accumulator.total_distance_meters();

        let avg_speed_mps = if distance > 0.0 && active > Duration::ZERO {
            Some(distance / active.as_secs_f64())
        } else {
            None
        };

        let mut source_metadata = BTreeMap::new();
        source_metadata.insert(
            "engine_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        source_metadata.insert("session_kind".to_string(), slot.session.kind.to_string());
        if slot.session.degraded {
            source_metadata.insert("degraded_mode".to_string(), "location".to_string());
        }

        SessionSummary {
            id: slot.session.id,
            kind: slot.session.kind,
            started_at: slot.session.started_at.unwrap_or(ended_at),
            ended_at,
            active_duration: active,
            total_distance_meters: distance,
            estimated_energy_kcal: energy,
            avg_heart_rate: slot.accumulator.average_heart_rate(),
            max_heart_rate: slot.accumulator.max_heart_rate(),
            avg_speed_mps,
            route: downsample(&slot.session.route, self.config.summary.route_points_cap),
            heart_rate_samples: downsample(
                &slot.session.heart_rate_samples,
                self.config.summary.heart_rate_points_cap,
            ),
            source_metadata,
        }
    }
}

/// The error a command sees when the session is not in a state that allows
/// it.
fn invalid_transition(slot: Option<&ActiveSlot>, to: SessionState) -> SessionError {
    SessionError::InvalidTransition {
        from: slot.map(|s| s.session.state).unwrap_or(SessionState::Idle),
        to,
    }
}

/// Poison-tolerant lock: a panicked holder must not wedge the engine.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
