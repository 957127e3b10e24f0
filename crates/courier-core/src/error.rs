use crate::ids::{DeviceId, UserId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Devices the server knows about that the envelope did not cover, keyed by owner.
pub type MissingDevices = BTreeMap<UserId, BTreeSet<DeviceId>>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("no active session")]
    NoActiveSession,
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("roster changed for {} users", .missing_devices.len())]
    RosterChanged { missing_devices: MissingDevices },
    #[error("{0}")]
    Other(String),
}

impl DispatchFailure {
    pub fn other(cause: impl Into<String>) -> Self {
        DispatchFailure::Other(cause.into())
    }

    /// Transient failures leave the message pending for a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchFailure::NetworkUnavailable)
    }
}
