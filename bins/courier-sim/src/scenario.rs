use crate::config::SimConfig;
use crate::SimError;
use courier_core::backend::InMemoryBackend;
use courier_core::crypto::InMemoryEncryptor;
use courier_core::directory::{CachedContactDirectory, DeviceCache};
use courier_core::ids::{ConversationId, DeviceId, MessageId, UserId};
use courier_core::message::Message;
use courier_core::recipients::DirectoryRecipientResolver;
use courier_core::session::InMemorySessionDirectory;
use courier_core::store::InMemoryMessageStore;
use courier_core::{Collaborators, Engine, MessageState};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

#[derive(Clone, Debug)]
pub struct Outcome {
    pub label: &'static str,
    pub message_id: MessageId,
    pub state: Option<MessageState>,
}

#[derive(Clone, Debug)]
pub struct Report {
    pub outcomes: Vec<Outcome>,
    pub delivered: usize,
    pub transmit_attempts: usize,
}

struct World {
    backend: InMemoryBackend,
    store: InMemoryMessageStore,
    sender: UserId,
    recipients: Vec<UserId>,
    conversation: ConversationId,
    collaborators: Collaborators,
}

async fn build_world(cfg: &SimConfig) -> World {
    let backend = InMemoryBackend::new();
    let cache = DeviceCache::new();
    let sessions = InMemorySessionDirectory::new();
    let store = InMemoryMessageStore::new();
    let encryptor = InMemoryEncryptor::requiring_sessions();

    let sender = UserId::from_handle(&cfg.scenario.sender);
    let sender_device = DeviceId::random();
    backend
        .register_user(&sender, Some(cfg.scenario.sender.clone()))
        .await;
    backend.add_device(&sender, sender_device).await;
    cache.add_devices(&sender, [sender_device].iter()).await;
    sessions.sign_in(sender.clone(), sender_device).await;

    let mut recipients = Vec::new();
    for handle in cfg.scenario.recipients.iter() {
        let user = UserId::from_handle(handle);
        backend.register_user(&user, Some(handle.clone())).await;
        for _ in 0..cfg.scenario.devices_per_recipient {
            let device = DeviceId::random();
            backend.add_device(&user, device).await;
            cache.add_devices(&user, [device].iter()).await;
        }
        recipients.push(user);
    }

    let conversation = ConversationId::new(format!("sim-{}", sender.short()));
    let mut members = vec![sender.clone()];
    members.extend(recipients.iter().cloned());
    backend.create_conversation(&conversation, members).await;

    let collaborators = Collaborators {
        store: Arc::new(store.clone()),
        sessions: Arc::new(sessions.clone()),
        resolver: Arc::new(DirectoryRecipientResolver::new(
            Arc::new(backend.clone()),
            cache.clone(),
            Arc::new(sessions),
            Arc::new(encryptor.clone()),
            Arc::new(backend.clone()),
        )),
        encryptor: Arc::new(encryptor),
        transport: Arc::new(backend.clone()),
        directory: Arc::new(CachedContactDirectory::new(
            Arc::new(backend.clone()),
            cache,
        )),
    };
    World {
        backend,
        store,
        sender,
        recipients,
        conversation,
        collaborators,
    }
}

pub async fn run(cfg: &SimConfig) -> Result<Report, SimError> {
    let world = build_world(cfg).await;
    let engine = Engine::start(cfg.engine.clone(), world.collaborators.clone())?;
    let mut sent = Vec::new();

    let normal = compose(&world, "hello everyone");
    engine.submit(normal.clone()).await?;
    sent.push(("normal", normal.id));

    if let Some(first) = world.recipients.first() {
        let device = DeviceId::random();
        world.backend.add_device(first, device).await;
        log::info!("{} registered device {} on the server", first.short(), device);
    }
    let after_new_device = compose(&world, "did your new device get this?");
    engine.submit(after_new_device.clone()).await?;
    sent.push(("new-device", after_new_device.id));

    world.backend.set_online(false).await;
    log::info!("backend offline for {}ms", cfg.scenario.offline_ms);
    let offline = compose(&world, "sent while offline");
    engine.submit(offline.clone()).await?;
    sent.push(("offline", offline.id));
    sleep(Duration::from_millis(cfg.scenario.offline_ms)).await;
    world.backend.set_online(true).await;
    log::info!("backend back online");

    if let Some(queue) = engine.retry_queue() {
        let tick = cfg.engine.retry_tick();
        let settled = timeout(Duration::from_millis(cfg.scenario.settle_ms), async {
            while queue.pending() > 0 {
                sleep(tick).await;
            }
        })
        .await;
        if settled.is_err() {
            log::warn!("{} retries still pending", queue.pending());
        }
    }

    let mut outcomes = Vec::with_capacity(sent.len());
    for (label, message_id) in sent {
        let state = world.store.state_of(&message_id).await;
        log::info!("{:<10} {} {:?}", label, message_id, state);
        outcomes.push(Outcome {
            label,
            message_id,
            state,
        });
    }
    let delivered = world.backend.delivered(&world.conversation).await?.len();
    let transmit_attempts = world.backend.transmit_attempts().await;
    log::info!(
        "{} envelopes delivered in {} transmit attempts",
        delivered,
        transmit_attempts
    );
    Ok(Report {
        outcomes,
        delivered,
        transmit_attempts,
    })
}

fn compose(world: &World, text: &str) -> Message {
    Message::compose(
        world.conversation.clone(),
        world.sender.clone(),
        text.as_bytes().to_vec(),
    )
}
