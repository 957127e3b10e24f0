use crate::config::EngineConfig;
use crate::dispatch::DispatchCoordinator;
use crate::error::DispatchFailure;
use crate::ids::{MessageId, UserId};
use crate::store::MessageStore;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Accepts messages whose dispatch hit a transient failure. Fire-and-forget.
pub trait DeferredScheduler: Send + Sync {
    fn schedule_retry(&self, sender: &UserId, message_id: &MessageId);
}

#[derive(Clone, Debug)]
struct RetryItem {
    sender: UserId,
    message_id: MessageId,
    created_at: Instant,
    next_retry: Instant,
    tries: u32,
}

type RetryEntries = Mutex<HashMap<MessageId, RetryItem>>;

/// Background re-dispatch of messages left pending by `NetworkUnavailable`.
///
/// The worker stops on the first tick after every handle is dropped.
#[derive(Clone)]
pub struct RetryQueue {
    entries: Arc<RetryEntries>,
    initial_delay: Duration,
}

impl RetryQueue {
    /// Spawns the worker. Messages it gives up on are marked failed in `store`.
    pub fn start(
        config: &EngineConfig,
        coordinator: DispatchCoordinator,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let entries: Arc<RetryEntries> = Arc::new(Mutex::new(HashMap::new()));
        let worker = RetryWorker {
            entries: Arc::downgrade(&entries),
            coordinator,
            store,
            config: config.clone(),
        };
        tokio::spawn(worker.run());
        Self {
            entries,
            initial_delay: Duration::from_millis(config.retry_backoff_initial_ms),
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        lock(&self.entries).contains_key(message_id)
    }
}

impl DeferredScheduler for RetryQueue {
    fn schedule_retry(&self, sender: &UserId, message_id: &MessageId) {
        let mut entries = lock(&self.entries);
        if entries.contains_key(message_id) {
            log::debug!("retry for {} already queued", message_id);
            return;
        }
        let now = Instant::now();
        entries.insert(
            *message_id,
            RetryItem {
                sender: sender.clone(),
                message_id: *message_id,
                created_at: now,
                next_retry: now + self.initial_delay,
                tries: 0,
            },
        );
        log::info!("queued {} for retry ({} pending)", message_id, entries.len());
    }
}

fn lock(entries: &RetryEntries) -> MutexGuard<'_, HashMap<MessageId, RetryItem>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RetryWorker {
    entries: Weak<RetryEntries>,
    coordinator: DispatchCoordinator,
    store: Arc<dyn MessageStore>,
    config: EngineConfig,
}

impl RetryWorker {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.retry_tick());
        let window = Duration::from_secs(self.config.retry_window_secs);
        loop {
            ticker.tick().await;
            let Some(entries) = self.entries.upgrade() else {
                break;
            };
            let now = Instant::now();
            for item in due_items(&entries, now, self.config.retry_batch) {
                if now.saturating_duration_since(item.created_at) > window {
                    log::warn!(
                        "dropping retry for {} after {} tries, outside the retry window",
                        item.message_id,
                        item.tries
                    );
                    lock(&entries).remove(&item.message_id);
                    self.fail(&item.message_id).await;
                    continue;
                }
                match self
                    .coordinator
                    .dispatch(&item.sender, &item.message_id)
                    .await
                {
                    Ok(()) => {
                        log::info!("retry delivered {}", item.message_id);
                        lock(&entries).remove(&item.message_id);
                    }
                    Err(DispatchFailure::NetworkUnavailable) => {
                        self.bump(&entries, &item.message_id);
                    }
                    Err(err) => {
                        log::warn!("giving up on {}: {}", item.message_id, err);
                        lock(&entries).remove(&item.message_id);
                        self.fail(&item.message_id).await;
                    }
                }
            }
        }
        log::debug!("retry worker stopped");
    }

    async fn fail(&self, message_id: &MessageId) {
        if let Err(err) = self.store.mark_failed(message_id).await {
            log::warn!("could not mark {} failed: {}", message_id, err);
        }
    }

    fn bump(&self, entries: &RetryEntries, message_id: &MessageId) {
        let mut guard = lock(entries);
        let Some(item) = guard.get_mut(message_id) else {
            return;
        };
        item.tries = item.tries.saturating_add(1);
        let capped = self.config.backoff_for(item.tries);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2 + 1);
        item.next_retry = Instant::now() + Duration::from_millis(capped + jitter);
        log::debug!(
            "{} still unreachable, try {} rescheduled in {}ms",
            message_id,
            item.tries,
            capped + jitter
        );
    }
}

fn due_items(entries: &RetryEntries, now: Instant, limit: usize) -> Vec<RetryItem> {
    let guard = lock(entries);
    let mut due: Vec<RetryItem> = guard
        .values()
        .filter(|item| item.next_retry <= now)
        .cloned()
        .collect();
    due.sort_by_key(|item| item.next_retry);
    due.truncate(limit);
    due
}
