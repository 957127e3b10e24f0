use crate::ids::{ConversationId, MessageId, UserId};
use crate::time::now_ms;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    Pending,
    Sent,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub content: Vec<u8>,
    pub state: MessageState,
    pub created_at_ms: u64,
}

impl Message {
    pub fn compose(conversation_id: ConversationId, sender: UserId, content: Vec<u8>) -> Self {
        Self {
            id: MessageId::random(),
            conversation_id,
            sender,
            content,
            state: MessageState::Pending,
            created_at_ms: now_ms(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.state == MessageState::Sent
    }
}
