//! Persistence boundary for bot status, instance identity, audit events and
//! encrypted secrets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::RepositoryError;
use crate::state_machine::BotStatus;

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Audit event names.
pub const EVENT_STATUS_CHANGED: &str = "status_changed";
pub const EVENT_JOB_FAILED: &str = "job_failed";
pub const EVENT_HEALTH_CHECK_FAILED: &str = "health_check_failed";

/// Provider-side identity of a bot's running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInstanceRecord {
    pub provider: String,
    pub provider_instance_id: String,
    pub provider_volume_id: Option<String>,
    pub region: String,
    pub size: String,
    pub ip_address: Option<String>,
}

/// One stored secret; `value_encrypted` is in the secrets codec format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSecret {
    pub key: String,
    pub value_encrypted: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotEvent {
    pub bot_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// `None` when the bot does not exist.
    async fn bot_status(&self, bot_id: &str) -> Result<Option<BotStatus>>;

    async fn update_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()>;

    async fn bot_instance(&self, bot_id: &str) -> Result<Option<BotInstanceRecord>>;

    /// Insert or replace the bot's instance record.
    async fn save_bot_instance(&self, bot_id: &str, instance: &BotInstanceRecord) -> Result<()>;

    async fn delete_bot_instance(&self, bot_id: &str) -> Result<()>;

    async fn add_bot_event(
        &self,
        bot_id: &str,
        event_type: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()>;

    async fn bot_secrets(&self, bot_id: &str) -> Result<Vec<BotSecret>>;
}

#[derive(Debug, Default)]
struct BotRow {
    status: BotStatus,
    instance: Option<BotInstanceRecord>,
    secrets: Vec<BotSecret>,
}

#[derive(Debug, Default)]
struct RepoState {
    bots: HashMap<String, BotRow>,
    events: Vec<BotEvent>,
    unavailable: bool,
}

/// Process-local [`Repository`] used by the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<RepoState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset the status of) a bot.
    pub async fn insert_bot(&self, bot_id: &str, status: BotStatus) {
        let mut state = self.state.lock().await;
        state.bots.entry(bot_id.to_string()).or_default().status = status;
    }

    /// Store an already-encrypted secret, replacing any value under the same key.
    pub async fn insert_secret(&self, bot_id: &str, key: &str, value_encrypted: &str) {
        let mut state = self.state.lock().await;
        let row = state.bots.entry(bot_id.to_string()).or_default();
        row.secrets.retain(|s| s.key != key);
        row.secrets.push(BotSecret {
            key: key.to_string(),
            value_encrypted: value_encrypted.to_string(),
        });
    }

    pub async fn events(&self, bot_id: &str) -> Vec<BotEvent> {
        let state = self.state.lock().await;
        state
            .events
            .iter()
            .filter(|e| e.bot_id == bot_id)
            .cloned()
            .collect()
    }

    pub async fn all_events(&self) -> Vec<BotEvent> {
        self.state.lock().await.events.clone()
    }

    /// Make every operation fail with a storage error until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }
}

fn check_available(state: &RepoState) -> Result<()> {
    if state.unavailable {
        return Err(RepositoryError::Storage("repository unavailable".into()));
    }
    Ok(())
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn bot_status(&self, bot_id: &str) -> Result<Option<BotStatus>> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state.bots.get(bot_id).map(|b| b.status))
    }

    async fn update_bot_status(&self, bot_id: &str, status: BotStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        let row = state
            .bots
            .get_mut(bot_id)
            .ok_or_else(|| RepositoryError::BotNotFound(bot_id.to_string()))?;
        row.status = status;
        Ok(())
    }

    async fn bot_instance(&self, bot_id: &str) -> Result<Option<BotInstanceRecord>> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state.bots.get(bot_id).and_then(|b| b.instance.clone()))
    }

    async fn save_bot_instance(&self, bot_id: &str, instance: &BotInstanceRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        let row = state
            .bots
            .get_mut(bot_id)
            .ok_or_else(|| RepositoryError::BotNotFound(bot_id.to_string()))?;
        row.instance = Some(instance.clone());
        Ok(())
    }

    async fn delete_bot_instance(&self, bot_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        if let Some(row) = state.bots.get_mut(bot_id) {
            row.instance = None;
        }
        Ok(())
    }

    async fn add_bot_event(
        &self,
        bot_id: &str,
        event_type: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        state.events.push(BotEvent {
            bot_id: bot_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn bot_secrets(&self, bot_id: &str) -> Result<Vec<BotSecret>> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state
            .bots
            .get(bot_id)
            .map(|b| b.secrets.clone())
            .unwrap_or_default())
    }
}
