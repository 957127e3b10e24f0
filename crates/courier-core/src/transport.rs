use crate::envelope::Envelope;
use crate::error::DispatchFailure;
use crate::ids::ConversationId;
use async_trait::async_trait;

/// Delivers one envelope to the backend.
///
/// Implementations report `RosterChanged` when the backend knows devices the envelope
/// did not cover, and `NetworkUnavailable` when the backend cannot be reached.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transmit(
        &self,
        conversation: &ConversationId,
        envelope: &Envelope,
    ) -> Result<(), DispatchFailure>;
}
