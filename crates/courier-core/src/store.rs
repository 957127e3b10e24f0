use crate::error::DispatchFailure;
use crate::ids::MessageId;
use crate::message::{Message, MessageState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Local message repository. The engine only writes state transitions through it.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store_outgoing(&self, message: &Message) -> Result<(), DispatchFailure>;
    async fn load_by_id(&self, id: &MessageId) -> Result<Message, DispatchFailure>;
    async fn mark_sent(&self, id: &MessageId) -> Result<(), DispatchFailure>;
    async fn mark_failed(&self, id: &MessageId) -> Result<(), DispatchFailure>;
}

#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    messages: Arc<Mutex<HashMap<MessageId, Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state_of(&self, id: &MessageId) -> Option<MessageState> {
        self.messages.lock().await.get(id).map(|m| m.state)
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    async fn transition(&self, id: &MessageId, state: MessageState) -> Result<(), DispatchFailure> {
        let mut guard = self.messages.lock().await;
        let message = guard
            .get_mut(id)
            .ok_or_else(|| DispatchFailure::other(format!("message {} not found", id)))?;
        if message.state != MessageState::Sent {
            message.state = state;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store_outgoing(&self, message: &Message) -> Result<(), DispatchFailure> {
        let mut guard = self.messages.lock().await;
        if guard.get(&message.id).map_or(false, Message::is_sent) {
            log::debug!("message {} already sent, keeping stored copy", message.id);
            return Ok(());
        }
        guard.insert(message.id, message.clone());
        Ok(())
    }

    async fn load_by_id(&self, id: &MessageId) -> Result<Message, DispatchFailure> {
        let guard = self.messages.lock().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchFailure::other(format!("message {} not found", id)))
    }

    async fn mark_sent(&self, id: &MessageId) -> Result<(), DispatchFailure> {
        self.transition(id, MessageState::Sent).await
    }

    async fn mark_failed(&self, id: &MessageId) -> Result<(), DispatchFailure> {
        self.transition(id, MessageState::Failed).await
    }
}
