use crate::crypto::{CryptoSessions, PreKey};
use crate::directory::DeviceCache;
use crate::envelope::RecipientDevices;
use crate::error::DispatchFailure;
use crate::ids::{ConversationId, DeviceId, UserId};
use crate::session::SessionDirectory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve_recipient_devices(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<RecipientDevices>, DispatchFailure>;
}

#[async_trait]
pub trait ConversationMembers: Send + Sync {
    async fn conversation_members(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<UserId>, DispatchFailure>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePreKey {
    pub device_id: DeviceId,
    pub pre_key: PreKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreKeys {
    pub user_id: UserId,
    pub devices: Vec<DevicePreKey>,
}

#[async_trait]
pub trait PreKeyDirectory: Send + Sync {
    async fn pre_keys_for(
        &self,
        devices: &BTreeMap<UserId, Vec<DeviceId>>,
    ) -> Result<Vec<UserPreKeys>, DispatchFailure>;
}

/// Builds the recipient snapshot from conversation membership and the local device cache,
/// establishing crypto sessions for devices that do not have one yet.
#[derive(Clone)]
pub struct DirectoryRecipientResolver {
    members: Arc<dyn ConversationMembers>,
    cache: DeviceCache,
    sessions: Arc<dyn SessionDirectory>,
    crypto: Arc<dyn CryptoSessions>,
    pre_keys: Arc<dyn PreKeyDirectory>,
}

impl DirectoryRecipientResolver {
    pub fn new(
        members: Arc<dyn ConversationMembers>,
        cache: DeviceCache,
        sessions: Arc<dyn SessionDirectory>,
        crypto: Arc<dyn CryptoSessions>,
        pre_keys: Arc<dyn PreKeyDirectory>,
    ) -> Self {
        Self {
            members,
            cache,
            sessions,
            crypto,
            pre_keys,
        }
    }

    async fn snapshot(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<RecipientDevices>, DispatchFailure> {
        let own_device = self.sessions.active_session(sender).await.map(|s| s.device_id);
        let mut snapshot = Vec::new();
        for member in self.members.conversation_members(conversation).await? {
            let devices: Vec<DeviceId> = self
                .cache
                .devices_of(&member)
                .await
                .into_iter()
                .filter(|d| !(member == *sender && Some(*d) == own_device))
                .collect();
            if devices.is_empty() {
                continue;
            }
            snapshot.push(RecipientDevices::new(member, devices));
        }
        Ok(snapshot)
    }

    async fn ensure_sessions(
        &self,
        sender: &UserId,
        snapshot: &[RecipientDevices],
    ) -> Result<(), DispatchFailure> {
        let mut without_session: BTreeMap<UserId, Vec<DeviceId>> = BTreeMap::new();
        for recipient in snapshot {
            for device in recipient.devices.iter() {
                if !self
                    .crypto
                    .has_session(sender, &recipient.user_id, device)
                    .await?
                {
                    without_session
                        .entry(recipient.user_id.clone())
                        .or_default()
                        .push(*device);
                }
            }
        }
        if without_session.is_empty() {
            return Ok(());
        }
        let fetched = self.pre_keys.pre_keys_for(&without_session).await?;
        let mut established = 0usize;
        for user_keys in fetched.iter() {
            for device_key in user_keys.devices.iter() {
                self.crypto
                    .establish_session(
                        sender,
                        &user_keys.user_id,
                        &device_key.device_id,
                        &device_key.pre_key,
                    )
                    .await?;
                established += 1;
            }
        }
        log::debug!("established {} crypto sessions", established);
        Ok(())
    }
}

#[async_trait]
impl RecipientResolver for DirectoryRecipientResolver {
    async fn resolve_recipient_devices(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<RecipientDevices>, DispatchFailure> {
        let snapshot = self.snapshot(sender, conversation).await?;
        self.ensure_sessions(sender, &snapshot).await?;
        Ok(snapshot)
    }
}
