//! Session lifecycle: state machine, engine registry, sensor event pump.

pub mod engine;
pub mod events;
pub mod types;

pub use engine::SessionEngine;
pub use events::{spawn_event_pump, SensorEvent};
pub use types::{
    AbortReason, LiveMetrics, SessionError, SessionState, SessionSummary, WorkoutSession,
};
