use crate::dispatch::DispatchCoordinator;
use crate::error::DispatchFailure;
use crate::message::{Message, MessageState};
use crate::scheduler::DeferredScheduler;
use crate::store::MessageStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn MessageStore>,
    coordinator: DispatchCoordinator,
    scheduler: Arc<dyn DeferredScheduler>,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        coordinator: DispatchCoordinator,
        scheduler: Arc<dyn DeferredScheduler>,
    ) -> Self {
        Self {
            store,
            coordinator,
            scheduler,
        }
    }

    /// Persists `message` as pending and tries to send it right away.
    ///
    /// An unreachable backend is not an error here: the message is handed to the
    /// deferred scheduler and stays `Pending`. A sender without a session ends `Failed`.
    pub async fn submit(&self, mut message: Message) -> Result<(), DispatchFailure> {
        message.state = MessageState::Pending;
        self.store.store_outgoing(&message).await?;
        match self.coordinator.dispatch(&message.sender, &message.id).await {
            Err(DispatchFailure::NetworkUnavailable) => {
                log::warn!("backend unreachable, deferring {}", message.id);
                self.scheduler.schedule_retry(&message.sender, &message.id);
                Ok(())
            }
            Err(DispatchFailure::NoActiveSession) => {
                log::warn!("{} has no active session, failing {}", message.sender, message.id);
                if let Err(err) = self.store.mark_failed(&message.id).await {
                    log::warn!("could not mark {} failed: {}", message.id, err);
                }
                Err(DispatchFailure::NoActiveSession)
            }
            other => other,
        }
    }
}
