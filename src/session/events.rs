//! Message-passing boundary between platform sensor callbacks and the
//! engine.
//!
//! Platform services deliver samples from arbitrary execution contexts.
//! Instead of calling into the engine from those contexts directly, hosts
//! push `SensorEvent`s onto a single-consumer channel; the pump task drains
//! it in arrival order, which is exactly the order the accumulator must see.

use crate::permissions::{AuthorizationStatus, Capability, CapabilityGate};
use crate::samples::{HeartRateSample, PositionFix};
use crate::session::engine::SessionEngine;
use crate::storage::HealthStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An event from one of the platform sensor streams.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// A position fix from the location service
    Position(PositionFix),
    /// A heart-rate sample
    HeartRate(HeartRateSample),
    /// An authorization change for a capability
    Authorization {
        /// Which capability changed
        capability: Capability,
        /// Its new status
        status: AuthorizationStatus,
    },
}

/// Spawn the pump task draining sensor events into the engine.
///
/// Runs until every sender is dropped. Events for a session that has
/// already finished are discarded by the engine, so a late-arriving fix is
/// harmless.
pub fn spawn_event_pump<G, S>(
    engine: Arc<SessionEngine<G, S>>,
    mut events: mpsc::UnboundedReceiver<SensorEvent>,
) -> JoinHandle<()>
where
    G: CapabilityGate + 'static,
    S: HealthStore,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SensorEvent::Position(fix) => engine.ingest_position(fix),
                SensorEvent::HeartRate(sample) => engine.ingest_heart_rate(sample),
                SensorEvent::Authorization { capability, status } => {
                    engine.handle_authorization(capability, status);
                }
            }
        }
        tracing::debug!("sensor event channel closed, pump stopping");
    })
}
