
use crate::config::EngineConfig;
use crate::crypto::DeviceEncryptor;
use crate::directory::{ContactDirectory, DeviceCache};
use crate::dispatch::{DispatchCoordinator, DispatchParts};
use crate::envelope::{Envelope, RecipientDevices};
use crate::error::DispatchFailure;
use crate::ids::{ConversationId, DeviceId, MessageId, UserId};
use crate::message::Message;
use crate::recipients::RecipientResolver;
use crate::scheduler::DeferredScheduler;
use crate::session::InMemorySessionDirectory;
use crate::store::{InMemoryMessageStore, MessageStore};
use crate::transport::Transport;
use crate::Collaborators;
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Resolve,
    Encrypt(MessageId, UserId, DeviceId),
    Transmit(usize),
    FetchContacts(BTreeSet<UserId>),
    Register(UserId, BTreeSet<DeviceId>),
    Schedule(MessageId),
}

#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// Encrypts to `user:device:content` and can be told to fail for one device.
#[derive(Clone)]
pub struct RecordingEncryptor {
    log: CallLog,
    fail_for: Arc<Mutex<Option<DeviceId>>>,
}

impl RecordingEncryptor {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_for: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_for(&self, device: DeviceId) {
        *self.fail_for.lock().unwrap() = Some(device);
    }
}

#[async_trait]
impl DeviceEncryptor for RecordingEncryptor {
    async fn encrypt(
        &self,
        _sender: &UserId,
        recipient: &UserId,
        device: &DeviceId,
        message_id: &MessageId,
        content: &[u8],
    ) -> Result<Vec<u8>, DispatchFailure> {
        self.log
            .push(Call::Encrypt(*message_id, recipient.clone(), *device));
        if *self.fail_for.lock().unwrap() == Some(*device) {
            return Err(DispatchFailure::other("encrypt refused"));
        }
        let mut out = format!("{}:{}:", recipient.short(), device).into_bytes();
        out.extend_from_slice(content);
        Ok(out)
    }
}

pub enum Step {
    Ack,
    Fail(DispatchFailure),
    Stall(Duration),
}

/// Plays scripted outcomes in order, then acknowledges everything.
#[derive(Clone)]
pub struct ScriptedTransport {
    log: CallLog,
    script: Arc<Mutex<VecDeque<Step>>>,
    envelopes: Arc<Mutex<Vec<Envelope>>>,
}

impl ScriptedTransport {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            script: Arc::new(Mutex::new(VecDeque::new())),
            envelopes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn then(&self, step: Step) -> &Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn transmit(
        &self,
        _conversation: &ConversationId,
        envelope: &Envelope,
    ) -> Result<(), DispatchFailure> {
        self.log.push(Call::Transmit(envelope.payload_count()));
        self.envelopes.lock().unwrap().push(envelope.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None | Some(Step::Ack) => Ok(()),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Snapshot of the conversation straight from a [`DeviceCache`].
#[derive(Clone)]
pub struct CacheResolver {
    log: CallLog,
    members: Vec<UserId>,
    cache: DeviceCache,
}

#[async_trait]
impl RecipientResolver for CacheResolver {
    async fn resolve_recipient_devices(
        &self,
        _sender: &UserId,
        _conversation: &ConversationId,
    ) -> Result<Vec<RecipientDevices>, DispatchFailure> {
        self.log.push(Call::Resolve);
        let mut out = Vec::new();
        for member in self.members.iter() {
            let devices = self.cache.devices_of(member).await;
            if !devices.is_empty() {
                out.push(RecipientDevices::new(member.clone(), devices));
            }
        }
        Ok(out)
    }
}

/// Records directory calls and writes registrations into the cache.
#[derive(Clone)]
pub struct RecordingDirectory {
    log: CallLog,
    cache: DeviceCache,
    fail_fetch: Arc<Mutex<bool>>,
}

impl RecordingDirectory {
    pub fn fail_fetch(&self) {
        *self.fail_fetch.lock().unwrap() = true;
    }
}

#[async_trait]
impl ContactDirectory for RecordingDirectory {
    async fn fetch_contacts(&self, users: &BTreeSet<UserId>) -> Result<(), DispatchFailure> {
        self.log.push(Call::FetchContacts(users.clone()));
        if *self.fail_fetch.lock().unwrap() {
            return Err(DispatchFailure::NetworkUnavailable);
        }
        Ok(())
    }

    async fn register_devices(
        &self,
        user: &UserId,
        devices: &BTreeSet<DeviceId>,
    ) -> Result<(), DispatchFailure> {
        self.log.push(Call::Register(user.clone(), devices.clone()));
        self.cache.add_devices(user, devices.iter()).await;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RecordingScheduler {
    log: CallLog,
}

impl DeferredScheduler for RecordingScheduler {
    fn schedule_retry(&self, _sender: &UserId, message_id: &MessageId) {
        self.log.push(Call::Schedule(*message_id));
    }
}

/// Alice (signed in on `alice_device`) talking to Bob (one known device) in `conversation`.
pub struct Harness {
    pub log: CallLog,
    pub store: InMemoryMessageStore,
    pub sessions: InMemorySessionDirectory,
    pub cache: DeviceCache,
    pub encryptor: RecordingEncryptor,
    pub transport: ScriptedTransport,
    pub directory: RecordingDirectory,
    pub scheduler: RecordingScheduler,
    pub alice: UserId,
    pub alice_device: DeviceId,
    pub bob: UserId,
    pub bob_device: DeviceId,
    pub conversation: ConversationId,
}

impl Harness {
    pub async fn new() -> Self {
        let log = CallLog::default();
        let cache = DeviceCache::new();
        let alice = UserId::from_handle("alice");
        let bob = UserId::from_handle("bob");
        let alice_device = DeviceId::random();
        let bob_device = DeviceId::random();
        let sessions = InMemorySessionDirectory::new();
        sessions.sign_in(alice.clone(), alice_device).await;
        cache.add_devices(&bob, [bob_device].iter()).await;
        Self {
            store: InMemoryMessageStore::new(),
            sessions,
            encryptor: RecordingEncryptor::new(log.clone()),
            transport: ScriptedTransport::new(log.clone()),
            directory: RecordingDirectory {
                log: log.clone(),
                cache: cache.clone(),
                fail_fetch: Arc::new(Mutex::new(false)),
            },
            scheduler: RecordingScheduler { log: log.clone() },
            cache,
            log,
            alice,
            alice_device,
            bob,
            bob_device,
            conversation: ConversationId::new("alice-bob"),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: Arc::new(self.store.clone()),
            sessions: Arc::new(self.sessions.clone()),
            resolver: Arc::new(CacheResolver {
                log: self.log.clone(),
                members: vec![self.alice.clone(), self.bob.clone()],
                cache: self.cache.clone(),
            }),
            encryptor: Arc::new(self.encryptor.clone()),
            transport: Arc::new(self.transport.clone()),
            directory: Arc::new(self.directory.clone()),
        }
    }

    pub fn coordinator(&self, config: &EngineConfig) -> DispatchCoordinator {
        let parts = self.collaborators();
        DispatchCoordinator::spawn(
            config,
            parts.sessions,
            DispatchParts {
                store: parts.store,
                resolver: parts.resolver,
                encryptor: parts.encryptor,
                transport: parts.transport,
                directory: parts.directory,
            },
        )
    }

    pub fn compose(&self, text: &str) -> Message {
        Message::compose(
            self.conversation.clone(),
            self.alice.clone(),
            text.as_bytes().to_vec(),
        )
    }

    pub async fn stored(&self, text: &str) -> Message {
        let message = self.compose(text);
        self.store.store_outgoing(&message).await.unwrap();
        message
    }
}

pub fn is_encrypt(call: &Call) -> bool {
    matches!(call, Call::Encrypt(..))
}

pub fn is_transmit(call: &Call) -> bool {
    matches!(call, Call::Transmit(..))
}
