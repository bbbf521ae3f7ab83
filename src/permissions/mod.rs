//! Capability checks gating session start and persistence.

pub mod gate;

pub use gate::{AuthorizationStatus, Capability, CapabilityGate, StaticGate};
