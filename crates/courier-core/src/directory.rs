use crate::error::DispatchFailure;
use crate::ids::{DeviceId, UserId};
use crate::time::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub registered_at_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContact {
    pub display_name: Option<String>,
    pub fetched_at_ms: u64,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

/// Contact/device directory as seen by the dispatch engine.
///
/// Implementations write into a cache that the engine mutates from its single dispatch worker.
/// Any other writer of the same cache must synchronize on its own.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn fetch_contacts(&self, users: &BTreeSet<UserId>) -> Result<(), DispatchFailure>;
    async fn register_devices(
        &self,
        user: &UserId,
        devices: &BTreeSet<DeviceId>,
    ) -> Result<(), DispatchFailure>;
}

/// Server-side contact lookup.
#[async_trait]
pub trait ContactSource: Send + Sync {
    async fn contacts_by_id(&self, users: &BTreeSet<UserId>)
        -> Result<Vec<Contact>, DispatchFailure>;
}

/// Local view of "who has which devices".
#[derive(Clone, Default)]
pub struct DeviceCache {
    entries: Arc<Mutex<HashMap<UserId, CachedContact>>>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user: &UserId) -> Option<CachedContact> {
        self.entries.lock().await.get(user).cloned()
    }

    pub async fn devices_of(&self, user: &UserId) -> Vec<DeviceId> {
        self.entries
            .lock()
            .await
            .get(user)
            .map(|c| c.devices.iter().map(|d| d.device_id).collect())
            .unwrap_or_default()
    }

    pub async fn save_contacts(&self, contacts: Vec<Contact>) {
        let now = now_ms();
        let mut guard = self.entries.lock().await;
        for contact in contacts {
            let entry = guard.entry(contact.user_id).or_default();
            if contact.display_name.is_some() {
                entry.display_name = contact.display_name;
            }
            entry.fetched_at_ms = now;
        }
    }

    /// Adds devices not yet known for `user`, in order. Returns how many were new.
    pub async fn add_devices<'a, I>(&self, user: &UserId, devices: I) -> usize
    where
        I: IntoIterator<Item = &'a DeviceId>,
    {
        let now = now_ms();
        let mut guard = self.entries.lock().await;
        let entry = guard.entry(user.clone()).or_default();
        let mut added = 0;
        for device_id in devices {
            if entry.devices.iter().any(|d| d.device_id == *device_id) {
                continue;
            }
            entry.devices.push(DeviceInfo {
                device_id: *device_id,
                registered_at_ms: now,
            });
            added += 1;
        }
        added
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Fetches contact metadata from a [`ContactSource`] and records devices in a [`DeviceCache`].
#[derive(Clone)]
pub struct CachedContactDirectory {
    source: Arc<dyn ContactSource>,
    cache: DeviceCache,
}

impl CachedContactDirectory {
    pub fn new(source: Arc<dyn ContactSource>, cache: DeviceCache) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }
}

#[async_trait]
impl ContactDirectory for CachedContactDirectory {
    async fn fetch_contacts(&self, users: &BTreeSet<UserId>) -> Result<(), DispatchFailure> {
        let contacts = self.source.contacts_by_id(users).await?;
        self.cache.save_contacts(contacts).await;
        Ok(())
    }

    async fn register_devices(
        &self,
        user: &UserId,
        devices: &BTreeSet<DeviceId>,
    ) -> Result<(), DispatchFailure> {
        let added = self.cache.add_devices(user, devices.iter()).await;
        log::debug!("registered {} new devices for {}", added, user.short());
        Ok(())
    }
}
