//! Compute provider abstraction.
//!
//! A [`ComputeProvider`] owns instances, their data volumes, firewalls, and
//! status polling for one cloud backend. Creation is keyed by bot id so a
//! redelivered provision job gets back the resources it already created.

pub mod digitalocean;
mod error;
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use digitalocean::DigitalOceanProvider;
pub use error::ProviderError;
pub use fake::FakeProvider;

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Size of the data volume created alongside a new instance.
pub const DEFAULT_VOLUME_SIZE_GB: u32 = 25;

/// Port the bot gateway listens on; the only inbound port the firewall opens.
pub const GATEWAY_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct CreateInstanceParams {
    pub bot_id: String,
    pub region: String,
    pub size: String,
    /// Rendered boot loader, passed through as opaque user-data.
    pub user_data: String,
    pub tags: Vec<String>,
    /// Existing data volume to attach instead of creating a new one.
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachVolumeParams {
    pub instance_id: String,
    pub volume_id: String,
    pub bot_id: String,
    pub region: String,
    pub size_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallParams {
    pub bot_id: String,
    pub instance_id: String,
    /// Sources allowed to reach the gateway port. Empty means deny-all.
    pub allowed_inbound_ips: Vec<String>,
}

/// Identity of the resources backing a bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResources {
    pub instance_id: String,
    pub volume_id: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Active,
    Off,
    Archive,
    NotFound,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Active => "active",
            InstanceStatus::Off => "off",
            InstanceStatus::Archive => "archive",
            InstanceStatus::NotFound => "not_found",
            InstanceStatus::Error => "error",
        }
    }

    /// `Creating` is a benign transient state, not a health failure.
    pub fn is_healthy(&self) -> bool {
        matches!(self, InstanceStatus::Active | InstanceStatus::Creating)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Short identifier persisted with the bot instance record.
    fn name(&self) -> &'static str;

    /// Device path the bot's data volume shows up under inside the instance.
    fn volume_device_path(&self, bot_id: &str) -> String;

    /// Create (or return the existing) instance and data volume for a bot.
    async fn create_instance(&self, params: &CreateInstanceParams) -> Result<ProviderResources>;

    async fn attach_volume(&self, params: &AttachVolumeParams) -> Result<String>;

    async fn configure_firewall(&self, params: &FirewallParams) -> Result<()>;

    async fn destroy_instance(&self, instance_id: &str) -> Result<()>;

    async fn destroy_volume(&self, volume_id: &str) -> Result<()>;

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus>;
}

/// Tags attached to every resource created for a bot.
pub fn resource_tags(bot_id: &str, user_id: &str) -> Vec<String> {
    vec![format!("bot:{bot_id}"), format!("user:{user_id}")]
}
