//! In-memory compute provider for tests and local runs.
//!
//! Behaves like a cloud that never loses a request: creation is idempotent
//! per bot id, destroys of missing resources succeed, and every call that
//! matters to the processor is recorded so tests can inspect it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AttachVolumeParams, ComputeProvider, CreateInstanceParams, DEFAULT_VOLUME_SIZE_GB,
    FirewallParams, InstanceStatus, ProviderError, ProviderResources, Result,
};

#[derive(Debug, Clone)]
struct FakeInstance {
    bot_id: String,
    status: InstanceStatus,
    #[allow(dead_code)]
    volume_id: Option<String>,
    #[allow(dead_code)]
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    #[allow(dead_code)]
    bot_id: String,
    #[allow(dead_code)]
    region: String,
    #[allow(dead_code)]
    size_gb: u32,
    attached_to: Option<String>,
}

/// Where an injected `create_instance` failure strikes.
#[derive(Debug)]
enum InjectedFailure {
    /// Before anything is created.
    Immediate(ProviderError),
    /// After the volume exists, while creating the instance.
    AfterVolume(ProviderError),
}

#[derive(Debug, Default)]
struct FakeState {
    instances: HashMap<String, FakeInstance>,
    volumes: HashMap<String, FakeVolume>,
    by_bot: HashMap<String, ProviderResources>,
    user_data: HashMap<String, String>,
    firewall_calls: Vec<FirewallParams>,
    create_failures: VecDeque<InjectedFailure>,
    firewall_failures: VecDeque<ProviderError>,
}

/// Mock provider keeping all state in memory behind a mutex.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    pub async fn volume_count(&self) -> usize {
        self.state.lock().await.volumes.len()
    }

    /// User-data passed on the most recent `create_instance` for a bot.
    pub async fn captured_user_data(&self, bot_id: &str) -> Option<String> {
        self.state.lock().await.user_data.get(bot_id).cloned()
    }

    pub async fn firewall_calls(&self) -> Vec<FirewallParams> {
        self.state.lock().await.firewall_calls.clone()
    }

    /// Volume an instance is currently attached to, if any.
    pub async fn attached_volume(&self, instance_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .volumes
            .iter()
            .find(|(_, v)| v.attached_to.as_deref() == Some(instance_id))
            .map(|(id, _)| id.clone())
    }

    /// Force an instance into a given status. Returns false if it doesn't exist.
    pub async fn set_instance_status(&self, instance_id: &str, status: InstanceStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.status = status;
                true
            }
            None => false,
        }
    }

    /// Make the next `create_instance` call fail before creating anything.
    pub async fn fail_next_create(&self, err: ProviderError) {
        let mut state = self.state.lock().await;
        state.create_failures.push_back(InjectedFailure::Immediate(err));
    }

    /// Make the next `create_instance` call fail after its volume was created.
    pub async fn fail_next_create_after_volume(&self, err: ProviderError) {
        let mut state = self.state.lock().await;
        state
            .create_failures
            .push_back(InjectedFailure::AfterVolume(err));
    }

    /// Make the next `configure_firewall` call fail without recording it.
    pub async fn fail_next_firewall(&self, err: ProviderError) {
        self.state.lock().await.firewall_failures.push_back(err);
    }

    pub async fn reset(&self) {
        *self.state.lock().await = FakeState::default();
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn volume_device_path(&self, bot_id: &str) -> String {
        format!("/dev/disk/by-id/scsi-0FAKE_Volume_bot-{bot_id}-data")
    }

    async fn create_instance(&self, params: &CreateInstanceParams) -> Result<ProviderResources> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.by_bot.get(&params.bot_id) {
            debug!(bot_id = %params.bot_id, instance_id = %existing.instance_id, "Returning existing instance");
            return Ok(existing.clone());
        }

        let late_failure = match state.create_failures.pop_front() {
            Some(InjectedFailure::Immediate(err)) => return Err(err),
            Some(InjectedFailure::AfterVolume(err)) => Some(err),
            None => None,
        };

        let (volume_id, created_volume) = match &params.volume_id {
            Some(id) => {
                if !state.volumes.contains_key(id) {
                    return Err(ProviderError::fatal(format!("volume {id} not found")));
                }
                (id.clone(), false)
            }
            None => {
                let id = format!("fake-volume-{}", Uuid::new_v4());
                state.volumes.insert(
                    id.clone(),
                    FakeVolume {
                        bot_id: params.bot_id.clone(),
                        region: params.region.clone(),
                        size_gb: DEFAULT_VOLUME_SIZE_GB,
                        attached_to: None,
                    },
                );
                (id, true)
            }
        };

        if let Some(err) = late_failure {
            if created_volume {
                warn!(volume_id = %volume_id, "Instance creation failed, cleaning up volume");
                state.volumes.remove(&volume_id);
            }
            return Err(err);
        }

        let instance_id = format!("fake-instance-{}", Uuid::new_v4());
        let ip_address = format!("10.0.0.{}", rand::thread_rng().gen_range(1..=254));

        state.instances.insert(
            instance_id.clone(),
            FakeInstance {
                bot_id: params.bot_id.clone(),
                status: InstanceStatus::Active,
                volume_id: Some(volume_id.clone()),
                tags: params.tags.clone(),
            },
        );
        if let Some(volume) = state.volumes.get_mut(&volume_id) {
            volume.attached_to = Some(instance_id.clone());
        }
        state
            .user_data
            .insert(params.bot_id.clone(), params.user_data.clone());

        let resources = ProviderResources {
            instance_id,
            volume_id: Some(volume_id),
            ip_address: Some(ip_address),
        };
        state.by_bot.insert(params.bot_id.clone(), resources.clone());

        info!(bot_id = %params.bot_id, instance_id = %resources.instance_id, "Created fake instance");
        Ok(resources)
    }

    async fn attach_volume(&self, params: &AttachVolumeParams) -> Result<String> {
        let mut state = self.state.lock().await;
        let volume = state
            .volumes
            .entry(params.volume_id.clone())
            .or_insert_with(|| FakeVolume {
                bot_id: params.bot_id.clone(),
                region: params.region.clone(),
                size_gb: params.size_gb,
                attached_to: None,
            });
        volume.attached_to = Some(params.instance_id.clone());
        Ok(params.volume_id.clone())
    }

    async fn configure_firewall(&self, params: &FirewallParams) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.firewall_failures.pop_front() {
            return Err(err);
        }
        state.firewall_calls.push(params.clone());
        Ok(())
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.remove(instance_id) {
            state.by_bot.remove(&instance.bot_id);
            for volume in state.volumes.values_mut() {
                if volume.attached_to.as_deref() == Some(instance_id) {
                    volume.attached_to = None;
                }
            }
        }
        Ok(())
    }

    async fn destroy_volume(&self, volume_id: &str) -> Result<()> {
        self.state.lock().await.volumes.remove(volume_id);
        Ok(())
    }

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance_id)
            .map(|i| i.status)
            .unwrap_or(InstanceStatus::NotFound))
    }
}
