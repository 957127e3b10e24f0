use crate::ids::{DeviceId, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveSession {
    pub device_id: DeviceId,
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn active_session(&self, user: &UserId) -> Option<ActiveSession>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionDirectory {
    sessions: Arc<Mutex<HashMap<UserId, ActiveSession>>>,
}

impl InMemorySessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sign_in(&self, user: UserId, device_id: DeviceId) {
        self.sessions
            .lock()
            .await
            .insert(user, ActiveSession { device_id });
    }

    pub async fn sign_out(&self, user: &UserId) {
        self.sessions.lock().await.remove(user);
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessionDirectory {
    async fn active_session(&self, user: &UserId) -> Option<ActiveSession> {
        self.sessions.lock().await.get(user).copied()
    }
}
