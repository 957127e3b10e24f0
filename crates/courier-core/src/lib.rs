pub mod backend;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod message;
pub mod recipients;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod submit;
pub mod time;
pub mod transport;

use config::{ConfigError, EngineConfig};
use crypto::DeviceEncryptor;
use directory::ContactDirectory;
use dispatch::{DispatchCoordinator, DispatchParts};
use error::DispatchFailure;
use ids::{MessageId, UserId};
use message::Message;
use recipients::RecipientResolver;
use scheduler::{DeferredScheduler, RetryQueue};
use session::SessionDirectory;
use std::sync::Arc;
use store::MessageStore;
use submit::SubmissionService;
use transport::Transport;

pub use envelope::{Envelope, RecipientDevices};
pub use message::MessageState;

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub sessions: Arc<dyn SessionDirectory>,
    pub resolver: Arc<dyn RecipientResolver>,
    pub encryptor: Arc<dyn DeviceEncryptor>,
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<dyn ContactDirectory>,
}

#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    coordinator: DispatchCoordinator,
    submission: SubmissionService,
    retry_queue: Option<RetryQueue>,
}

impl Engine {
    /// Starts the dispatch worker and the built-in retry queue.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = collaborators.store.clone();
        let coordinator = spawn_coordinator(&config, collaborators);
        let retry_queue = RetryQueue::start(&config, coordinator.clone(), store.clone());
        let submission =
            SubmissionService::new(store, coordinator.clone(), Arc::new(retry_queue.clone()));
        Ok(Self::assemble(config, coordinator, submission, Some(retry_queue)))
    }

    /// Like [`Engine::start`], but deferred messages go to `scheduler`.
    pub fn with_scheduler(
        config: EngineConfig,
        collaborators: Collaborators,
        scheduler: Arc<dyn DeferredScheduler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = collaborators.store.clone();
        let coordinator = spawn_coordinator(&config, collaborators);
        let submission = SubmissionService::new(store, coordinator.clone(), scheduler);
        Ok(Self::assemble(config, coordinator, submission, None))
    }

    fn assemble(
        config: EngineConfig,
        coordinator: DispatchCoordinator,
        submission: SubmissionService,
        retry_queue: Option<RetryQueue>,
    ) -> Self {
        log::info!(
            "engine started (queue depth {}, {} reconciliations per dispatch, {} retry queue)",
            config.worker_queue_depth,
            config.max_roster_reconciliations,
            if retry_queue.is_some() { "built-in" } else { "external" }
        );
        Self {
            config,
            coordinator,
            submission,
            retry_queue,
        }
    }

    pub async fn submit(&self, message: Message) -> Result<(), DispatchFailure> {
        self.submission.submit(message).await
    }

    pub async fn dispatch(
        &self,
        sender: &UserId,
        message_id: &MessageId,
    ) -> Result<(), DispatchFailure> {
        self.coordinator.dispatch(sender, message_id).await
    }

    pub fn retry_queue(&self) -> Option<&RetryQueue> {
        self.retry_queue.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn spawn_coordinator(config: &EngineConfig, collaborators: Collaborators) -> DispatchCoordinator {
    DispatchCoordinator::spawn(
        config,
        collaborators.sessions,
        DispatchParts {
            store: collaborators.store,
            resolver: collaborators.resolver,
            encryptor: collaborators.encryptor,
            transport: collaborators.transport,
            directory: collaborators.directory,
        },
    )
}

#[cfg(test)]
mod tests;
