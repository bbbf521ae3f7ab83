//! Stridelog - Workout Session Tracking Engine
//!
//! Coordinates the asynchronous sensor streams of a fitness tracker
//! (position fixes, heart-rate samples) against a pausable session
//! lifecycle, and hands each finished session to a persistence gateway as
//! an immutable, internally consistent summary. Hosts compose the engine
//! with a capability gate and a health store; there are no globals.

pub mod metrics;
pub mod permissions;
pub mod samples;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use metrics::MetricsAccumulator;
pub use permissions::{AuthorizationStatus, Capability, CapabilityGate};
pub use samples::{HeartRateSample, PositionFix, SessionKind};
pub use session::{
    spawn_event_pump, LiveMetrics, SensorEvent, SessionEngine, SessionError, SessionState,
    SessionSummary,
};
pub use storage::{
    EngineConfig, HealthStore, MemoryHealthStore, PersistenceGateway, SqliteHealthStore,
};
