use crate::config::EngineConfig;
use crate::crypto::DeviceEncryptor;
use crate::directory::ContactDirectory;
use crate::envelope::{Envelope, EnvelopeBuilder};
use crate::error::DispatchFailure;
use crate::ids::{ConversationId, DeviceId, MessageId, UserId};
use crate::message::Message;
use crate::reconcile::StaleRosterReconciler;
use crate::recipients::RecipientResolver;
use crate::session::SessionDirectory;
use crate::store::MessageStore;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Collaborators used inside the dispatch worker.
#[derive(Clone)]
pub struct DispatchParts {
    pub store: Arc<dyn MessageStore>,
    pub resolver: Arc<dyn RecipientResolver>,
    pub encryptor: Arc<dyn DeviceEncryptor>,
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<dyn ContactDirectory>,
}

struct DispatchJob {
    sender: UserId,
    sender_device: DeviceId,
    message_id: MessageId,
    reply: oneshot::Sender<Result<(), DispatchFailure>>,
}

/// Front door of the dispatch worker.
///
/// Session resolution happens on the caller's task; everything after it runs on one
/// worker task, so encryption and transmission of different messages never interleave.
#[derive(Clone)]
pub struct DispatchCoordinator {
    sessions: Arc<dyn SessionDirectory>,
    jobs: mpsc::Sender<DispatchJob>,
}

impl DispatchCoordinator {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(
        config: &EngineConfig,
        sessions: Arc<dyn SessionDirectory>,
        parts: DispatchParts,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(config.worker_queue_depth.max(1));
        let pipeline = DispatchPipeline {
            store: parts.store,
            resolver: parts.resolver,
            builder: EnvelopeBuilder::new(parts.encryptor),
            transport: parts.transport,
            reconciler: StaleRosterReconciler::new(parts.directory),
            max_reconciliations: config.max_roster_reconciliations,
            transmit_timeout: config.transmit_timeout(),
        };
        tokio::spawn(run_worker(pipeline, rx));
        Self { sessions, jobs }
    }

    pub async fn dispatch(
        &self,
        sender: &UserId,
        message_id: &MessageId,
    ) -> Result<(), DispatchFailure> {
        let session = self
            .sessions
            .active_session(sender)
            .await
            .ok_or(DispatchFailure::NoActiveSession)?;
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(DispatchJob {
                sender: sender.clone(),
                sender_device: session.device_id,
                message_id: *message_id,
                reply,
            })
            .await
            .map_err(|_| DispatchFailure::other("dispatch worker stopped"))?;
        outcome
            .await
            .map_err(|_| DispatchFailure::other("dispatch worker dropped the job"))?
    }
}

async fn run_worker(pipeline: DispatchPipeline, mut jobs: mpsc::Receiver<DispatchJob>) {
    while let Some(job) = jobs.recv().await {
        let outcome = pipeline
            .run(&job.sender, &job.sender_device, &job.message_id)
            .await;
        if job.reply.send(outcome).is_err() {
            log::debug!("caller of dispatch {} went away", job.message_id);
        }
    }
    log::debug!("dispatch worker stopped");
}

struct DispatchPipeline {
    store: Arc<dyn MessageStore>,
    resolver: Arc<dyn RecipientResolver>,
    builder: EnvelopeBuilder,
    transport: Arc<dyn Transport>,
    reconciler: StaleRosterReconciler,
    max_reconciliations: u32,
    transmit_timeout: Duration,
}

impl DispatchPipeline {
    async fn run(
        &self,
        sender: &UserId,
        sender_device: &DeviceId,
        message_id: &MessageId,
    ) -> Result<(), DispatchFailure> {
        let message = self.store.load_by_id(message_id).await?;
        if message.is_sent() {
            log::debug!("message {} already sent, nothing to do", message.id);
            return Ok(());
        }
        match self.deliver(sender, sender_device, &message).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_sent(&message.id).await {
                    log::warn!("message {} delivered but not marked sent: {}", message.id, err);
                    return Err(err);
                }
                log::info!("message {} sent", message.id);
                Ok(())
            }
            Err(err) if err.is_transient() => {
                log::info!("message {} left pending: {}", message.id, err);
                Err(err)
            }
            Err(err) => {
                log::warn!("message {} failed: {}", message.id, err);
                if let Err(mark_err) = self.store.mark_failed(&message.id).await {
                    log::warn!("could not mark {} failed: {}", message.id, mark_err);
                }
                Err(err)
            }
        }
    }

    /// Resolve, encrypt and transmit until the transport acknowledges an envelope.
    /// Every roster change is reconciled; at most `max_reconciliations` of them are
    /// followed by a full rebuild of the envelope.
    async fn deliver(
        &self,
        sender: &UserId,
        sender_device: &DeviceId,
        message: &Message,
    ) -> Result<(), DispatchFailure> {
        let mut reconciliations = 0u32;
        loop {
            log::debug!(
                "attempt {} for message {}",
                reconciliations + 1,
                message.id
            );
            let recipients = self
                .resolver
                .resolve_recipient_devices(sender, &message.conversation_id)
                .await?;
            let envelope = self
                .builder
                .build(&recipients, sender_device, sender, message)
                .await?;
            match self.transmit(&message.conversation_id, &envelope).await {
                Ok(()) => return Ok(()),
                Err(DispatchFailure::NetworkUnavailable) => {
                    return Err(DispatchFailure::NetworkUnavailable)
                }
                Err(DispatchFailure::RosterChanged { missing_devices }) => {
                    log::info!(
                        "roster changed for {} users while sending {}",
                        missing_devices.len(),
                        message.id
                    );
                    self.reconciler.reconcile(&missing_devices).await?;
                    reconciliations += 1;
                    if reconciliations > self.max_reconciliations {
                        return Err(DispatchFailure::other(format!(
                            "roster still changing after {} reconciliations",
                            reconciliations
                        )));
                    }
                }
                Err(DispatchFailure::NoActiveSession) => {
                    return Err(DispatchFailure::other("transport rejected the sender session"))
                }
                Err(DispatchFailure::Other(cause)) => return Err(DispatchFailure::Other(cause)),
            }
        }
    }

    async fn transmit(
        &self,
        conversation: &ConversationId,
        envelope: &Envelope,
    ) -> Result<(), DispatchFailure> {
        match tokio::time::timeout(
            self.transmit_timeout,
            self.transport.transmit(conversation, envelope),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "transmit to {} timed out after {:?}",
                    conversation,
                    self.transmit_timeout
                );
                Err(DispatchFailure::NetworkUnavailable)
            }
        }
    }
}
