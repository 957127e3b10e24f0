use crate::crypto::DeviceEncryptor;
use crate::error::DispatchFailure;
use crate::ids::{DeviceId, UserId};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientDevices {
    pub user_id: UserId,
    pub devices: Vec<DeviceId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicePayload {
    pub device_id: DeviceId,
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipientEntry {
    pub user_id: UserId,
    pub payloads: Vec<DevicePayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub sender_device_id: DeviceId,
    pub recipients: Vec<RecipientEntry>,
}

impl RecipientDevices {
    pub fn new(user_id: UserId, devices: Vec<DeviceId>) -> Self {
        Self { user_id, devices }
    }
}

impl Envelope {
    pub fn payload_count(&self) -> usize {
        self.recipients.iter().map(|r| r.payloads.len()).sum()
    }

    pub fn entry_for(&self, user: &UserId) -> Option<&RecipientEntry> {
        self.recipients.iter().find(|r| &r.user_id == user)
    }

    /// Every (user, device) pair the envelope carries a payload for.
    pub fn covered(&self) -> HashSet<(UserId, DeviceId)> {
        self.recipients
            .iter()
            .flat_map(|r| r.payloads.iter().map(move |p| (r.user_id.clone(), p.device_id)))
            .collect()
    }
}

/// Encrypts one payload per recipient device and assembles the envelope.
#[derive(Clone)]
pub struct EnvelopeBuilder {
    encryptor: Arc<dyn DeviceEncryptor>,
}

impl EnvelopeBuilder {
    pub fn new(encryptor: Arc<dyn DeviceEncryptor>) -> Self {
        Self { encryptor }
    }

    /// Fails on the first encryption error; no partial envelope is ever returned.
    /// Entries follow the order of `recipients`; a repeated (user, device) pair is encrypted once.
    pub async fn build(
        &self,
        recipients: &[RecipientDevices],
        sender_device_id: &DeviceId,
        sender: &UserId,
        message: &Message,
    ) -> Result<Envelope, DispatchFailure> {
        let mut entries: Vec<RecipientEntry> = Vec::with_capacity(recipients.len());
        let mut slots: HashMap<UserId, usize> = HashMap::new();
        let mut seen: HashSet<(UserId, DeviceId)> = HashSet::new();
        for recipient in recipients {
            let slot = *slots.entry(recipient.user_id.clone()).or_insert_with(|| {
                entries.push(RecipientEntry {
                    user_id: recipient.user_id.clone(),
                    payloads: Vec::with_capacity(recipient.devices.len()),
                });
                entries.len() - 1
            });
            for device_id in recipient.devices.iter() {
                if !seen.insert((recipient.user_id.clone(), *device_id)) {
                    continue;
                }
                let ciphertext = self
                    .encryptor
                    .encrypt(
                        sender,
                        &recipient.user_id,
                        device_id,
                        &message.id,
                        &message.content,
                    )
                    .await?;
                entries[slot].payloads.push(DevicePayload {
                    device_id: *device_id,
                    ciphertext,
                });
            }
        }
        log::debug!(
            "built envelope for {} with {} payloads across {} recipients",
            message.id,
            seen.len(),
            entries.len()
        );
        Ok(Envelope {
            sender_device_id: *sender_device_id,
            recipients: entries,
        })
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, DispatchFailure> {
    serde_json::to_vec(envelope).map_err(|e| DispatchFailure::other(format!("encode: {}", e)))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DispatchFailure> {
    serde_json::from_slice(bytes).map_err(|e| DispatchFailure::other(format!("decode: {}", e)))
}
