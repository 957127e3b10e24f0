use crate::error::DispatchFailure;
use crate::ids::{DeviceId, MessageId, UserId};
use async_trait::async_trait;
use blake3::Hasher;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-device encryption. Implementations may mutate session state on every call,
/// so callers must not run two encryptions for the same sender concurrently.
#[async_trait]
pub trait DeviceEncryptor: Send + Sync {
    async fn encrypt(
        &self,
        sender: &UserId,
        recipient: &UserId,
        device: &DeviceId,
        message_id: &MessageId,
        content: &[u8],
    ) -> Result<Vec<u8>, DispatchFailure>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub data: Vec<u8>,
}

/// Session bookkeeping used while preparing recipients.
#[async_trait]
pub trait CryptoSessions: Send + Sync {
    async fn has_session(
        &self,
        local: &UserId,
        peer: &UserId,
        device: &DeviceId,
    ) -> Result<bool, DispatchFailure>;
    async fn establish_session(
        &self,
        local: &UserId,
        peer: &UserId,
        device: &DeviceId,
        pre_key: &PreKey,
    ) -> Result<(), DispatchFailure>;
}

#[derive(Clone, Debug)]
struct SessionState {
    seed: [u8; 32],
    counter: u64,
}

impl SessionState {
    fn next_key(&mut self) -> (u64, [u8; 32]) {
        self.counter = self.counter.saturating_add(1);
        (self.counter, key_at(&self.seed, self.counter))
    }
}

type SessionKey = (UserId, UserId, DeviceId);

/// Stand-in encryptor: one counter-keyed session per (sender, recipient, device).
///
/// With `require_sessions` set, encrypting towards a device without an established
/// session fails; otherwise a session is derived on first use.
#[derive(Clone, Default)]
pub struct InMemoryEncryptor {
    sessions: Arc<Mutex<HashMap<SessionKey, SessionState>>>,
    require_sessions: bool,
}

impl InMemoryEncryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requiring_sessions() -> Self {
        Self {
            require_sessions: true,
            ..Self::default()
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Decrypts a payload produced by [`DeviceEncryptor::encrypt`] for the same session.
    pub async fn open(
        &self,
        sender: &UserId,
        recipient: &UserId,
        device: &DeviceId,
        message_id: &MessageId,
        payload: &[u8],
    ) -> Result<Vec<u8>, DispatchFailure> {
        if payload.len() < 8 {
            return Err(DispatchFailure::other("ciphertext truncated"));
        }
        let (counter_bytes, ciphertext) = payload.split_at(8);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(counter_bytes);
        let counter = u64::from_be_bytes(counter);
        let seed = {
            let guard = self.sessions.lock().await;
            guard
                .get(&(sender.clone(), recipient.clone(), *device))
                .map(|s| s.seed)
                .ok_or_else(|| DispatchFailure::other("no crypto session"))?
        };
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_at(&seed, counter)));
        let aad = associated_data(sender, device, message_id);
        cipher
            .decrypt(
                Nonce::from_slice(&nonce_for(message_id)),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| DispatchFailure::other("decrypt"))
    }
}

#[async_trait]
impl DeviceEncryptor for InMemoryEncryptor {
    async fn encrypt(
        &self,
        sender: &UserId,
        recipient: &UserId,
        device: &DeviceId,
        message_id: &MessageId,
        content: &[u8],
    ) -> Result<Vec<u8>, DispatchFailure> {
        let (counter, key) = {
            let mut guard = self.sessions.lock().await;
            let slot = (sender.clone(), recipient.clone(), *device);
            if !guard.contains_key(&slot) {
                if self.require_sessions {
                    return Err(DispatchFailure::other(format!(
                        "no crypto session with {} device {}",
                        recipient.short(),
                        device
                    )));
                }
                guard.insert(
                    slot.clone(),
                    SessionState {
                        seed: derive_seed(sender, recipient, device, &[]),
                        counter: 0,
                    },
                );
            }
            match guard.get_mut(&slot) {
                Some(state) => state.next_key(),
                None => return Err(DispatchFailure::other("session vanished")),
            }
        };
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let aad = associated_data(sender, device, message_id);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_for(message_id)),
                Payload {
                    msg: content,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| DispatchFailure::other("encrypt"))?;
        let mut out = Vec::with_capacity(8 + sealed.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

#[async_trait]
impl CryptoSessions for InMemoryEncryptor {
    async fn has_session(
        &self,
        local: &UserId,
        peer: &UserId,
        device: &DeviceId,
    ) -> Result<bool, DispatchFailure> {
        let guard = self.sessions.lock().await;
        Ok(guard.contains_key(&(local.clone(), peer.clone(), *device)))
    }

    async fn establish_session(
        &self,
        local: &UserId,
        peer: &UserId,
        device: &DeviceId,
        pre_key: &PreKey,
    ) -> Result<(), DispatchFailure> {
        if pre_key.data.is_empty() {
            return Err(DispatchFailure::other("empty pre-key"));
        }
        let mut guard = self.sessions.lock().await;
        guard
            .entry((local.clone(), peer.clone(), *device))
            .or_insert_with(|| SessionState {
                seed: derive_seed(local, peer, device, &pre_key.data),
                counter: 0,
            });
        Ok(())
    }
}

fn derive_seed(local: &UserId, peer: &UserId, device: &DeviceId, pre_key: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(b"courier:session:v1");
    hasher.update(local.as_bytes());
    hasher.update(peer.as_bytes());
    hasher.update(device.as_uuid().as_bytes());
    hasher.update(pre_key);
    hasher.finalize().into()
}

fn key_at(seed: &[u8; 32], counter: u64) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(seed);
    hasher.update(&counter.to_be_bytes());
    hasher.finalize().into()
}

fn nonce_for(message_id: &MessageId) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&message_id.value.as_bytes()[..12]);
    nonce
}

fn associated_data(sender: &UserId, device: &DeviceId, message_id: &MessageId) -> String {
    format!("{}:{}:{}", message_id, sender.to_hex(), device)
}
