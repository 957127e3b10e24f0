use crate::crypto::PreKey;
use crate::directory::{Contact, ContactSource};
use crate::envelope::{decode_envelope, encode_envelope, Envelope};
use crate::error::{DispatchFailure, MissingDevices};
use crate::ids::{ConversationId, DeviceId, UserId};
use crate::recipients::{ConversationMembers, DevicePreKey, PreKeyDirectory, UserPreKeys};
use crate::transport::Transport;
use async_trait::async_trait;
use blake3::Hasher;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct BackendState {
    online: bool,
    failing_transmits: usize,
    transmit_attempts: usize,
    next_pre_key_id: u32,
    profiles: HashMap<UserId, Option<String>>,
    rosters: HashMap<UserId, Vec<DeviceId>>,
    conversations: HashMap<ConversationId, Vec<UserId>>,
    delivered: HashMap<ConversationId, Vec<Vec<u8>>>,
}

/// Simulated messaging server holding the authoritative device rosters.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                online: true,
                ..BackendState::default()
            })),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_user(&self, user: &UserId, display_name: Option<String>) {
        let mut guard = self.state.lock().await;
        guard.profiles.insert(user.clone(), display_name);
        guard.rosters.entry(user.clone()).or_default();
    }

    pub async fn add_device(&self, user: &UserId, device: DeviceId) {
        let mut guard = self.state.lock().await;
        guard.profiles.entry(user.clone()).or_insert(None);
        let roster = guard.rosters.entry(user.clone()).or_default();
        if !roster.contains(&device) {
            roster.push(device);
        }
    }

    pub async fn roster(&self, user: &UserId) -> Vec<DeviceId> {
        let guard = self.state.lock().await;
        guard.rosters.get(user).cloned().unwrap_or_default()
    }

    pub async fn create_conversation(&self, conversation: &ConversationId, members: Vec<UserId>) {
        let mut guard = self.state.lock().await;
        guard.conversations.insert(conversation.clone(), members);
    }

    pub async fn set_online(&self, online: bool) {
        self.state.lock().await.online = online;
    }

    /// The next `count` transmits fail with `NetworkUnavailable`.
    pub async fn fail_next_transmits(&self, count: usize) {
        self.state.lock().await.failing_transmits = count;
    }

    pub async fn transmit_attempts(&self) -> usize {
        self.state.lock().await.transmit_attempts
    }

    pub async fn delivered(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<Envelope>, DispatchFailure> {
        let guard = self.state.lock().await;
        guard
            .delivered
            .get(conversation)
            .map(|items| items.iter().map(|bytes| decode_envelope(bytes)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn missing_devices(
        state: &BackendState,
        members: &[UserId],
        envelope: &Envelope,
    ) -> MissingDevices {
        let covered = envelope.covered();
        let mut missing = MissingDevices::new();
        for member in members {
            for device in state.rosters.get(member).into_iter().flatten() {
                if *device == envelope.sender_device_id {
                    continue;
                }
                if !covered.contains(&(member.clone(), *device)) {
                    missing.entry(member.clone()).or_default().insert(*device);
                }
            }
        }
        missing
    }
}

#[async_trait]
impl Transport for InMemoryBackend {
    async fn transmit(
        &self,
        conversation: &ConversationId,
        envelope: &Envelope,
    ) -> Result<(), DispatchFailure> {
        let mut guard = self.state.lock().await;
        guard.transmit_attempts += 1;
        if !guard.online {
            return Err(DispatchFailure::NetworkUnavailable);
        }
        if guard.failing_transmits > 0 {
            guard.failing_transmits -= 1;
            return Err(DispatchFailure::NetworkUnavailable);
        }
        let members = guard
            .conversations
            .get(conversation)
            .cloned()
            .ok_or_else(|| DispatchFailure::other(format!("unknown conversation {}", conversation)))?;
        let missing_devices = Self::missing_devices(&guard, &members, envelope);
        if !missing_devices.is_empty() {
            return Err(DispatchFailure::RosterChanged { missing_devices });
        }
        let bytes = encode_envelope(envelope)?;
        guard
            .delivered
            .entry(conversation.clone())
            .or_default()
            .push(bytes);
        Ok(())
    }
}

#[async_trait]
impl ContactSource for InMemoryBackend {
    async fn contacts_by_id(
        &self,
        users: &std::collections::BTreeSet<UserId>,
    ) -> Result<Vec<Contact>, DispatchFailure> {
        let guard = self.state.lock().await;
        if !guard.online {
            return Err(DispatchFailure::NetworkUnavailable);
        }
        Ok(users
            .iter()
            .filter_map(|user| {
                guard.profiles.get(user).map(|name| Contact {
                    user_id: user.clone(),
                    display_name: name.clone(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl PreKeyDirectory for InMemoryBackend {
    async fn pre_keys_for(
        &self,
        devices: &BTreeMap<UserId, Vec<DeviceId>>,
    ) -> Result<Vec<UserPreKeys>, DispatchFailure> {
        let mut guard = self.state.lock().await;
        if !guard.online {
            return Err(DispatchFailure::NetworkUnavailable);
        }
        let mut out = Vec::new();
        for (user, wanted) in devices.iter() {
            let known = guard.rosters.get(user).cloned().unwrap_or_default();
            let mut keys = Vec::new();
            for device in wanted.iter().filter(|d| known.contains(d)) {
                guard.next_pre_key_id = guard.next_pre_key_id.wrapping_add(1);
                keys.push(DevicePreKey {
                    device_id: *device,
                    pre_key: PreKey {
                        id: guard.next_pre_key_id,
                        data: pre_key_material(user, device),
                    },
                });
            }
            if !keys.is_empty() {
                out.push(UserPreKeys {
                    user_id: user.clone(),
                    devices: keys,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ConversationMembers for InMemoryBackend {
    async fn conversation_members(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<UserId>, DispatchFailure> {
        let guard = self.state.lock().await;
        guard
            .conversations
            .get(conversation)
            .cloned()
            .ok_or_else(|| DispatchFailure::other(format!("unknown conversation {}", conversation)))
    }
}

fn pre_key_material(user: &UserId, device: &DeviceId) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(b"courier:prekey:v1");
    hasher.update(user.as_bytes());
    hasher.update(device.as_uuid().as_bytes());
    hasher.finalize().as_bytes().to_vec()
}
