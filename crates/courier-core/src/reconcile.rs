use crate::directory::ContactDirectory;
use crate::error::{DispatchFailure, MissingDevices};
use crate::ids::UserId;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Brings the local device cache back in line with the server after a roster change.
///
/// Only additions are reconciled. Devices that disappeared and membership changes
/// implied by the new roster are left to other subsystems.
#[derive(Clone)]
pub struct StaleRosterReconciler {
    directory: Arc<dyn ContactDirectory>,
}

impl StaleRosterReconciler {
    pub fn new(directory: Arc<dyn ContactDirectory>) -> Self {
        Self { directory }
    }

    pub async fn reconcile(&self, missing_devices: &MissingDevices) -> Result<(), DispatchFailure> {
        if missing_devices.is_empty() {
            return Ok(());
        }
        let users: BTreeSet<UserId> = missing_devices.keys().cloned().collect();
        self.directory.fetch_contacts(&users).await?;
        for (user, devices) in missing_devices.iter() {
            if let Err(err) = self.directory.register_devices(user, devices).await {
                log::warn!(
                    "registering {} devices for {} failed: {}",
                    devices.len(),
                    user.short(),
                    err
                );
            }
        }
        log::info!(
            "reconciled rosters of {} users ({} devices)",
            users.len(),
            missing_devices.values().map(|d| d.len()).sum::<usize>()
        );
        Ok(())
    }
}
