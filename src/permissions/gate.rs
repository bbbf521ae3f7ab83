//! Permission/capability gate.
//!
//! The engine needs two capabilities from the platform: location access and
//! health-store write access. The platform side is abstracted behind
//! `CapabilityGate`; the engine only asks "is this granted" and "request it
//! if the user has not decided yet". Requests may suspend for as long as the
//! user takes to answer the system prompt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;

/// A platform capability the engine depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Location service access (position fixes)
    Location,
    /// Write access to the external health store
    HealthWrite,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Location => write!(f, "location"),
            Capability::HealthWrite => write!(f, "health write"),
        }
    }
}

/// Authorization state of a capability, mirroring platform permission APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    /// The user has not been asked yet
    #[default]
    NotDetermined,
    /// Granted
    Granted,
    /// Explicitly denied by the user
    Denied,
    /// Unavailable due to platform policy (parental controls etc.)
    Restricted,
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationStatus::NotDetermined => write!(f, "not determined"),
            AuthorizationStatus::Granted => write!(f, "granted"),
            AuthorizationStatus::Denied => write!(f, "denied"),
            AuthorizationStatus::Restricted => write!(f, "restricted"),
        }
    }
}

/// Seam to the platform permission system.
pub trait CapabilityGate: Send + Sync {
    /// Current status of a capability. Never prompts.
    fn check(&self, capability: Capability) -> AuthorizationStatus;

    /// Request the capability if its status is `NotDetermined`.
    ///
    /// May suspend until the user responds. Returns the resulting status;
    /// already-decided capabilities are returned as-is without prompting.
    fn request_if_needed(
        &self,
        capability: Capability,
    ) -> impl Future<Output = AuthorizationStatus> + Send;
}

/// Gate with fixed responses, for tests and headless composition.
///
/// `NotDetermined` capabilities resolve to `Granted` or `Denied` on request
/// depending on `grant_on_request`.
pub struct StaticGate {
    statuses: Mutex<BTreeMap<Capability, AuthorizationStatus>>,
    grant_on_request: bool,
}

impl StaticGate {
    /// Gate that reports everything granted.
    pub fn allow_all() -> Self {
        let mut statuses = BTreeMap::new();
        statuses.insert(Capability::Location, AuthorizationStatus::Granted);
        statuses.insert(Capability::HealthWrite, AuthorizationStatus::Granted);
        Self {
            statuses: Mutex::new(statuses),
            grant_on_request: true,
        }
    }

    /// Gate where every capability starts undetermined and requests resolve
    /// to `Granted` or `Denied` per `grant_on_request`.
    pub fn undetermined(grant_on_request: bool) -> Self {
        Self {
            statuses: Mutex::new(BTreeMap::new()),
            grant_on_request,
        }
    }

    /// Override the status of one capability.
    pub fn set(&self, capability: Capability, status: AuthorizationStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(capability, status);
        }
    }
}

impl CapabilityGate for StaticGate {
    fn check(&self, capability: Capability) -> AuthorizationStatus {
        self.statuses
            .lock()
            .map(|statuses| statuses.get(&capability).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn request_if_needed(
        &self,
        capability: Capability,
    ) -> impl Future<Output = AuthorizationStatus> + Send {
        let current = self.check(capability);
        let resolved = match current {
            AuthorizationStatus::NotDetermined => {
                let status = if self.grant_on_request {
                    AuthorizationStatus::Granted
                } else {
                    AuthorizationStatus::Denied
                };
                self.set(capability, status);
                status
            }
            decided => decided,
        };
        async move { resolved }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_resolves_undetermined() {
        let gate = StaticGate::undetermined(true);
        assert_eq!(
            gate.check(Capability::HealthWrite),
            AuthorizationStatus::NotDetermined
        );
        let status = gate.request_if_needed(Capability::HealthWrite).await;
        assert_eq!(status, AuthorizationStatus::Granted);
        assert_eq!(
            gate.check(Capability::HealthWrite),
            AuthorizationStatus::Granted
        );
    }

    #[tokio::test]
    async fn test_request_never_overrides_denied() {
        let gate = StaticGate::undetermined(true);
        gate.set(Capability::Location, AuthorizationStatus::Denied);
        let status = gate.request_if_needed(Capability::Location).await;
        assert_eq!(status, AuthorizationStatus::Denied);
    }
}
