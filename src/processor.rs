//! Job processor: runs one lifecycle job against the provider and reconciles
//! persisted state.
//!
//! Every job goes through the same steps: look up the bot, gate the job on
//! the [`StateMachine`], run the operation, then persist the target status
//! with a `status_changed` event. Retryable failures (transient provider
//! errors, repository or queue outages) propagate out of
//! [`JobProcessor::process`] so the delivery substrate can redeliver. Every
//! other failure is recorded against the bot (`error` status plus a
//! `job_failed` event) and the job completes.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{self, BootstrapParams};
use crate::config::EngineConfig;
use crate::error::{JobFailure, ProcessError};
use crate::provider::{
    ComputeProvider, CreateInstanceParams, FirewallParams, InstanceStatus, ProviderResources,
    resource_tags,
};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::repository::{
    BotInstanceRecord, EVENT_HEALTH_CHECK_FAILED, EVENT_JOB_FAILED, EVENT_STATUS_CHANGED,
    Repository,
};
use crate::secrets::SecretsCodec;
use crate::state_machine::{BotStatus, Job, JobPayload, Placement, StateMachine, Teardown};

type JobResult<T = ()> = Result<T, JobFailure>;

/// Secret keys understood by the renderer.
pub const SECRET_MODEL_PROVIDER_KEY: &str = "model_provider_key";
/// Older name for [`SECRET_MODEL_PROVIDER_KEY`].
pub const SECRET_API_KEY: &str = "api_key";
pub const SECRET_MODEL_PROVIDER: &str = "model_provider";
pub const SECRET_SYSTEM_INSTRUCTIONS: &str = "system_instructions";
pub const SECRET_GATEWAY_TOKEN: &str = "gateway_token";

pub struct JobProcessor {
    provider: Arc<dyn ComputeProvider>,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn JobQueue>,
    config: Arc<EngineConfig>,
}

impl JobProcessor {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        repo: Arc<dyn Repository>,
        queue: Arc<dyn JobQueue>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            provider,
            repo,
            queue,
            config,
        }
    }

    /// Process one delivery of `job`.
    ///
    /// Returns `Ok` when the job is finished, including when it was skipped
    /// or failed permanently. An `Err` means "deliver this job again later".
    #[instrument(skip_all, fields(bot_id = %job.bot_id, job_type = %job.job_type()))]
    pub async fn process(&self, job: &Job) -> Result<(), ProcessError> {
        let job_type = job.job_type();
        info!("Processing job");

        let Some(current) = self.repo.bot_status(&job.bot_id).await? else {
            warn!("Bot not found, skipping job");
            return Ok(());
        };

        if !StateMachine::can_transition(current, job_type) {
            info!(status = %current, "Job not allowed from current status, skipping");
            return Ok(());
        }

        match self.execute(job, current).await {
            Ok(()) => {
                if let Some(target) = StateMachine::target_status(job_type) {
                    self.repo.update_bot_status(&job.bot_id, target).await?;
                    self.repo
                        .add_bot_event(
                            &job.bot_id,
                            EVENT_STATUS_CHANGED,
                            Some(json!({ "from": current, "to": target, "jobType": job_type })),
                        )
                        .await?;
                    info!(from = %current, to = %target, "Job completed");
                } else {
                    info!("Job completed");
                }
                Ok(())
            }
            Err(failure) => {
                let failure = failure.into_retryable().inspect_err(|err| {
                    warn!(error = %err, "Retryable failure, job will be redelivered");
                })?;
                self.record_failure(job, &failure).await
            }
        }
    }

    async fn record_failure(&self, job: &Job, failure: &JobFailure) -> Result<(), ProcessError> {
        let job_type = job.job_type();
        let message = failure.to_string();
        error!(error = %message, "Job failed");

        // Health polls never move the bot's status.
        if let Some(transition) = StateMachine::transition(job_type) {
            self.repo
                .update_bot_status(&job.bot_id, transition.on_error)
                .await?;
        }
        self.repo
            .add_bot_event(
                &job.bot_id,
                EVENT_JOB_FAILED,
                Some(json!({ "jobType": job_type, "error": message })),
            )
            .await?;
        Ok(())
    }

    async fn execute(&self, job: &Job, current: BotStatus) -> JobResult {
        match &job.payload {
            JobPayload::ProvisionBot { region, size } => {
                self.launch(job, region, size, None).await?;
                Ok(())
            }
            JobPayload::StopBot { instance_id } | JobPayload::SuspendBot { instance_id } => {
                self.provider.destroy_instance(instance_id).await?;
                Ok(())
            }
            JobPayload::RestartBot(placement) | JobPayload::ResumeBot(placement) => {
                self.relaunch(job, placement).await
            }
            JobPayload::DestroyBot(teardown) | JobPayload::DestroyBotSubscriptionEnded(teardown) => {
                self.destroy(job, teardown).await
            }
            JobPayload::HealthPoll(placement) => self.health_poll(job, current, placement).await,
        }
    }

    /// Create (or pick up) the bot's instance, persist it, start its health
    /// poll loop and lock down its firewall.
    async fn launch(
        &self,
        job: &Job,
        region: &str,
        size: &str,
        volume_id: Option<String>,
    ) -> JobResult<ProviderResources> {
        let params = self.bootstrap_params(&job.bot_id).await?;
        let user_data = bootstrap::render_boot_loader(&params)?;

        let resources = self
            .provider
            .create_instance(&CreateInstanceParams {
                bot_id: job.bot_id.clone(),
                region: region.to_string(),
                size: size.to_string(),
                user_data,
                tags: resource_tags(&job.bot_id, &job.user_id),
                volume_id,
            })
            .await?;
        info!(
            instance_id = %resources.instance_id,
            volume_id = resources.volume_id.as_deref().unwrap_or(""),
            "Instance ready"
        );

        self.repo
            .save_bot_instance(
                &job.bot_id,
                &BotInstanceRecord {
                    provider: self.provider.name().to_string(),
                    provider_instance_id: resources.instance_id.clone(),
                    provider_volume_id: resources.volume_id.clone(),
                    region: region.to_string(),
                    size: size.to_string(),
                    ip_address: resources.ip_address.clone(),
                },
            )
            .await?;

        // Scheduled before the firewall so a failure there still leaves the
        // new instance monitored.
        self.schedule_health_poll(
            job,
            Placement {
                instance_id: resources.instance_id.clone(),
                volume_id: resources.volume_id.clone(),
                region: region.to_string(),
                size: size.to_string(),
            },
        )
        .await?;

        let allowed_inbound_ips = self.config.allowed_inbound_ips();
        if allowed_inbound_ips.is_empty() {
            debug!("No platform proxy IPs configured, firewall denies all inbound traffic");
        }
        self.provider
            .configure_firewall(&FirewallParams {
                bot_id: job.bot_id.clone(),
                instance_id: resources.instance_id.clone(),
                allowed_inbound_ips,
            })
            .await?;

        Ok(resources)
    }

    /// Enqueue the next poll for `placement`. Polls are keyed by instance,
    /// so redelivered launches never start a second loop.
    async fn schedule_health_poll(&self, job: &Job, placement: Placement) -> JobResult {
        let key = format!("health-poll:{}:{}", job.bot_id, placement.instance_id);
        self.queue
            .enqueue(
                Job::new(
                    job.bot_id.clone(),
                    job.user_id.clone(),
                    JobPayload::HealthPoll(placement),
                ),
                EnqueueOptions::delayed(self.config.health_poll_interval()).with_key(key),
            )
            .await?;
        Ok(())
    }

    async fn relaunch(&self, job: &Job, placement: &Placement) -> JobResult {
        // An instance that still exists in any form would be handed back by
        // the idempotent create, so it has to go first.
        let status = self.provider.instance_status(&placement.instance_id).await?;
        if status != InstanceStatus::NotFound {
            info!(instance_id = %placement.instance_id, %status, "Destroying previous instance");
            self.provider
                .destroy_instance(&placement.instance_id)
                .await?;
        }

        self.launch(
            job,
            &placement.region,
            &placement.size,
            placement.volume_id.clone(),
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, job: &Job, teardown: &Teardown) -> JobResult {
        self.provider.destroy_instance(&teardown.instance_id).await?;
        if let Some(volume_id) = &teardown.volume_id {
            self.provider.destroy_volume(volume_id).await?;
        }
        self.repo.delete_bot_instance(&job.bot_id).await?;
        Ok(())
    }

    async fn health_poll(&self, job: &Job, current: BotStatus, placement: &Placement) -> JobResult {
        if current == BotStatus::Destroyed {
            info!("Bot destroyed, ending health poll loop");
            return Ok(());
        }

        // A restart starts a fresh loop for the new instance; polls for the
        // old one stop here.
        if let Some(record) = self.repo.bot_instance(&job.bot_id).await?
            && record.provider_instance_id != placement.instance_id
        {
            debug!(
                instance_id = %placement.instance_id,
                current_instance_id = %record.provider_instance_id,
                "Instance superseded, ending health poll loop"
            );
            return Ok(());
        }

        // Scheduled before checking so a failed check does not end the loop.
        self.schedule_health_poll(job, placement.clone()).await?;

        if !matches!(current, BotStatus::Running | BotStatus::Error) {
            debug!(status = %current, "Bot is not expected to be up, skipping instance check");
            return Ok(());
        }

        let status = self.provider.instance_status(&placement.instance_id).await?;
        if status.is_healthy() {
            debug!(instance_id = %placement.instance_id, %status, "Instance healthy");
            return Ok(());
        }

        warn!(instance_id = %placement.instance_id, %status, "Instance unhealthy, scheduling restart");
        self.repo
            .add_bot_event(
                &job.bot_id,
                EVENT_HEALTH_CHECK_FAILED,
                Some(json!({ "instanceStatus": status })),
            )
            .await?;
        self.queue
            .enqueue(
                Job::new(
                    job.bot_id.clone(),
                    job.user_id.clone(),
                    JobPayload::RestartBot(placement.clone()),
                ),
                EnqueueOptions::immediate(),
            )
            .await?;
        Ok(())
    }

    /// Decrypt the bot's stored secrets into render parameters.
    async fn bootstrap_params(&self, bot_id: &str) -> JobResult<BootstrapParams> {
        let secrets = self.repo.bot_secrets(bot_id).await?;

        let mut model_provider_key = None;
        let mut api_key = None;
        let mut model_provider = None;
        let mut system_instructions = None;
        let mut gateway_token = None;

        if !secrets.is_empty() {
            let codec = SecretsCodec::new(self.config.master_key())?;
            for secret in &secrets {
                let slot = match secret.key.as_str() {
                    SECRET_MODEL_PROVIDER_KEY => &mut model_provider_key,
                    SECRET_API_KEY => &mut api_key,
                    SECRET_MODEL_PROVIDER => &mut model_provider,
                    SECRET_SYSTEM_INSTRUCTIONS => &mut system_instructions,
                    SECRET_GATEWAY_TOKEN => &mut gateway_token,
                    other => {
                        debug!(key = other, "Ignoring unknown secret");
                        continue;
                    }
                };
                *slot = Some(codec.decrypt(&secret.value_encrypted)?);
            }
        }

        let exposed = |s: Option<SecretString>| s.map(|s| s.expose_secret().to_string());

        Ok(BootstrapParams {
            bot_id: bot_id.to_string(),
            gateway_token: gateway_token
                .unwrap_or_else(|| SecretString::from(uuid::Uuid::new_v4().to_string())),
            version: self.config.bot_version.clone(),
            model_provider_key: model_provider_key.or(api_key),
            model_provider: exposed(model_provider),
            system_instructions: exposed(system_instructions),
            volume_device: self.provider.volume_device_path(bot_id),
            mount_path: self.config.mount_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, QueueError};
    use crate::provider::FakeProvider;
    use crate::queue::MemoryQueue;
    use crate::repository::InMemoryRepository;
    use crate::secrets;
    use crate::state_machine::JobType;
    use std::time::Duration;

    const MASTER_KEY: &str = "test-master-key-at-least-32-chars-long!!";

    struct Harness {
        provider: FakeProvider,
        repo: InMemoryRepository,
        queue: MemoryQueue,
        processor: JobProcessor,
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let provider = FakeProvider::new();
        let repo = InMemoryRepository::new();
        let queue = MemoryQueue::new();
        let processor = JobProcessor::new(
            Arc::new(provider.clone()),
            Arc::new(repo.clone()),
            Arc::new(queue.clone()),
            Arc::new(config),
        );
        Harness {
            provider,
            repo,
            queue,
            processor,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig {
            master_key: MASTER_KEY.into(),
            ..EngineConfig::default()
        })
    }

    fn provision(bot: &str) -> Job {
        Job::provision(bot, "user-1", "nyc3", "s-1vcpu-1gb")
    }

    fn placement(resources: &ProviderResources, region: &str, size: &str) -> Placement {
        Placement {
            instance_id: resources.instance_id.clone(),
            volume_id: resources.volume_id.clone(),
            region: region.into(),
            size: size.into(),
        }
    }

    async fn create_direct(h: &Harness, bot: &str, region: &str, size: &str) -> ProviderResources {
        h.provider
            .create_instance(&CreateInstanceParams {
                bot_id: bot.into(),
                region: region.into(),
                size: size.into(),
                user_data: String::new(),
                tags: vec![],
                volume_id: None,
            })
            .await
            .unwrap()
    }

    async fn jobs_of(h: &Harness, job_type: JobType) -> Vec<Job> {
        h.queue
            .scheduled()
            .await
            .into_iter()
            .filter(|s| s.job.job_type() == job_type)
            .map(|s| s.job)
            .collect()
    }

    async fn status(h: &Harness, bot: &str) -> Option<BotStatus> {
        h.repo.bot_status(bot).await.unwrap()
    }

    #[tokio::test]
    async fn provision_transitions_to_running_and_saves_instance() {
        let h = harness();
        h.repo.insert_bot("bot-1", BotStatus::Provisioning).await;

        h.processor.process(&provision("bot-1")).await.unwrap();

        assert_eq!(status(&h, "bot-1").await, Some(BotStatus::Running));
        let instance = h.repo.bot_instance("bot-1").await.unwrap().unwrap();
        assert_eq!(instance.provider, "fake");
        assert_eq!(instance.region, "nyc3");
        assert_eq!(instance.size, "s-1vcpu-1gb");
        assert!(instance.provider_instance_id.starts_with("fake-instance-"));
        assert!(
            instance
                .provider_volume_id
                .as_deref()
                .unwrap()
                .starts_with("fake-volume-")
        );
        assert!(instance.ip_address.is_some());

        let events = h.repo.events("bot-1").await;
        let changed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EVENT_STATUS_CHANGED)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(
            changed[0].payload,
            Some(json!({"from": "provisioning", "to": "running", "jobType": "PROVISION_BOT"}))
        );
    }

    #[tokio::test]
    async fn provision_schedules_health_poll() {
        let h = harness();
        h.repo.insert_bot("bot-hp-1", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-hp-1")).await.unwrap();

        let scheduled = h.queue.scheduled().await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].delay, Duration::from_millis(300_000));
        let JobPayload::HealthPoll(p) = &scheduled[0].job.payload else {
            panic!("expected HEALTH_POLL, got {:?}", scheduled[0].job);
        };
        assert_eq!(scheduled[0].job.bot_id, "bot-hp-1");
        assert!(p.instance_id.starts_with("fake-instance-"));
        assert!(p.volume_id.as_deref().unwrap().starts_with("fake-volume-"));
        assert_eq!(p.region, "nyc3");
        assert_eq!(p.size, "s-1vcpu-1gb");
    }

    #[tokio::test]
    async fn provision_configures_firewall_with_trimmed_ips() {
        let h = harness_with(EngineConfig {
            platform_proxy_ips: "  192.168.1.1 , 172.16.0.1,  10.0.0.5  ".into(),
            ..EngineConfig::default()
        });
        h.repo.insert_bot("bot-fw", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-fw")).await.unwrap();

        let calls = h.provider.firewall_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bot_id, "bot-fw");
        assert!(calls[0].instance_id.starts_with("fake-instance-"));
        assert_eq!(
            calls[0].allowed_inbound_ips,
            vec!["192.168.1.1", "172.16.0.1", "10.0.0.5"]
        );
    }

    #[tokio::test]
    async fn provision_without_proxy_ips_denies_all() {
        let h = harness();
        h.repo.insert_bot("bot-fw-2", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-fw-2")).await.unwrap();

        let calls = h.provider.firewall_calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].allowed_inbound_ips.is_empty());
        assert_eq!(status(&h, "bot-fw-2").await, Some(BotStatus::Running));
    }

    #[tokio::test]
    async fn provision_renders_decrypted_secrets() {
        let h = harness();
        h.repo.insert_bot("bot-s", BotStatus::Provisioning).await;
        for (key, value) in [
            (SECRET_MODEL_PROVIDER_KEY, "sk-test-key-12345"),
            (SECRET_MODEL_PROVIDER, "openai"),
            (SECRET_SYSTEM_INSTRUCTIONS, "You are a helpful bot."),
            (SECRET_GATEWAY_TOKEN, "gw-fixed"),
            ("unrelated", "ignored"),
        ] {
            h.repo
                .insert_secret("bot-s", key, &secrets::encrypt(value, MASTER_KEY).unwrap())
                .await;
        }

        h.processor.process(&provision("bot-s")).await.unwrap();

        let user_data = h.provider.captured_user_data("bot-s").await.unwrap();
        assert!(!user_data.contains("{{"));
        for value in ["sk-test-key-12345", "openai", "You are a helpful bot.", "gw-fixed"] {
            assert!(user_data.contains(value), "missing {value}");
        }
        assert!(!user_data.contains("ignored"));
    }

    #[tokio::test]
    async fn legacy_api_key_is_used_as_model_provider_key() {
        let h = harness();
        h.repo.insert_bot("bot-legacy", BotStatus::Provisioning).await;
        h.repo
            .insert_secret(
                "bot-legacy",
                SECRET_API_KEY,
                &secrets::encrypt("sk-legacy", MASTER_KEY).unwrap(),
            )
            .await;

        h.processor.process(&provision("bot-legacy")).await.unwrap();
        let user_data = h.provider.captured_user_data("bot-legacy").await.unwrap();
        assert!(user_data.contains("MODEL_PROVIDER_KEY: \"sk-legacy\""));
    }

    #[tokio::test]
    async fn provision_uses_provider_volume_device_path() {
        let h = harness();
        h.repo.insert_bot("bot-vol", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-vol")).await.unwrap();

        let user_data = h.provider.captured_user_data("bot-vol").await.unwrap();
        assert!(user_data.contains("/dev/disk/by-id/scsi-0FAKE_Volume_bot-bot-vol-data"));
        assert!(!user_data.contains("/dev/sda1"));
    }

    #[tokio::test]
    async fn retryable_provider_error_propagates_without_state_change() {
        let h = harness();
        h.repo.insert_bot("bot-2", BotStatus::Provisioning).await;
        h.provider
            .fail_next_create(ProviderError::retryable("Temporary failure"))
            .await;

        let err = h.processor.process(&provision("bot-2")).await.unwrap_err();
        assert!(err.is_retryable_provider());
        assert_eq!(status(&h, "bot-2").await, Some(BotStatus::Provisioning));
        assert!(h.repo.events("bot-2").await.is_empty());
    }

    #[tokio::test]
    async fn fatal_provider_error_sets_error_status() {
        let h = harness();
        h.repo.insert_bot("bot-3", BotStatus::Provisioning).await;
        h.provider
            .fail_next_create(ProviderError::fatal("Region unavailable"))
            .await;

        h.processor.process(&provision("bot-3")).await.unwrap();

        assert_eq!(status(&h, "bot-3").await, Some(BotStatus::Error));
        let events = h.repo.events("bot-3").await;
        let failed = events
            .iter()
            .find(|e| e.event_type == EVENT_JOB_FAILED)
            .unwrap();
        assert_eq!(
            failed.payload,
            Some(json!({"jobType": "PROVISION_BOT", "error": "Region unavailable"}))
        );
    }

    #[tokio::test]
    async fn undecryptable_secret_is_fatal() {
        let h = harness();
        h.repo.insert_bot("bot-bad", BotStatus::Provisioning).await;
        h.repo
            .insert_secret("bot-bad", SECRET_MODEL_PROVIDER_KEY, "not:a:valid:secret")
            .await;

        h.processor.process(&provision("bot-bad")).await.unwrap();
        assert_eq!(status(&h, "bot-bad").await, Some(BotStatus::Error));
        assert_eq!(h.provider.instance_count().await, 0);
    }

    #[tokio::test]
    async fn missing_master_key_fails_closed_when_secrets_exist() {
        let h = harness_with(EngineConfig::default());
        h.repo.insert_bot("bot-nokey", BotStatus::Provisioning).await;
        h.repo
            .insert_secret(
                "bot-nokey",
                SECRET_MODEL_PROVIDER,
                &secrets::encrypt("openai", MASTER_KEY).unwrap(),
            )
            .await;

        h.processor.process(&provision("bot-nokey")).await.unwrap();
        assert_eq!(status(&h, "bot-nokey").await, Some(BotStatus::Error));
    }

    #[tokio::test]
    async fn repository_outage_is_retryable() {
        let h = harness();
        h.repo.insert_bot("bot-db", BotStatus::Provisioning).await;
        h.repo.set_unavailable(true).await;

        let err = h.processor.process(&provision("bot-db")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Repository(_)));
    }

    #[tokio::test]
    async fn closed_queue_is_retryable() {
        let h = harness();
        h.repo.insert_bot("bot-q", BotStatus::Provisioning).await;
        h.queue.close().await;

        let err = h.processor.process(&provision("bot-q")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Queue(QueueError::Closed)));
        assert_eq!(status(&h, "bot-q").await, Some(BotStatus::Provisioning));
    }

    #[tokio::test]
    async fn stop_destroys_instance() {
        let h = harness();
        h.repo.insert_bot("bot-4", BotStatus::Running).await;
        let res = create_direct(&h, "bot-4", "nyc3", "s-1vcpu-1gb").await;

        let job = Job::new(
            "bot-4",
            "user-1",
            JobPayload::StopBot {
                instance_id: res.instance_id,
            },
        );
        h.processor.process(&job).await.unwrap();

        assert_eq!(status(&h, "bot-4").await, Some(BotStatus::Stopped));
        assert_eq!(h.provider.instance_count().await, 0);
        assert_eq!(h.provider.volume_count().await, 1);
    }

    #[tokio::test]
    async fn suspend_only_from_running() {
        let h = harness();
        h.repo.insert_bot("bot-sus", BotStatus::Error).await;
        let res = create_direct(&h, "bot-sus", "nyc3", "s-1vcpu-1gb").await;

        let job = Job::new(
            "bot-sus",
            "user-1",
            JobPayload::SuspendBot {
                instance_id: res.instance_id,
            },
        );
        h.processor.process(&job).await.unwrap();

        assert_eq!(status(&h, "bot-sus").await, Some(BotStatus::Error));
        assert_eq!(h.provider.instance_count().await, 1);
        assert!(h.repo.events("bot-sus").await.is_empty());
    }

    #[tokio::test]
    async fn restart_reuses_volume_and_renders_secrets() {
        let h = harness();
        h.repo.insert_bot("bot-r", BotStatus::Stopped).await;
        h.repo
            .insert_secret(
                "bot-r",
                SECRET_MODEL_PROVIDER_KEY,
                &secrets::encrypt("sk-restart-key", MASTER_KEY).unwrap(),
            )
            .await;
        let res = create_direct(&h, "bot-r", "sfo3", "s-2vcpu-2gb").await;
        h.provider.destroy_instance(&res.instance_id).await.unwrap();

        let job = Job::new(
            "bot-r",
            "user-1",
            JobPayload::RestartBot(placement(&res, "sfo3", "s-2vcpu-2gb")),
        );
        h.processor.process(&job).await.unwrap();

        assert_eq!(status(&h, "bot-r").await, Some(BotStatus::Running));
        let instance = h.repo.bot_instance("bot-r").await.unwrap().unwrap();
        assert_eq!(instance.provider_volume_id, res.volume_id);
        assert_ne!(instance.provider_instance_id, res.instance_id);
        assert_eq!(instance.region, "sfo3");
        assert_eq!(instance.size, "s-2vcpu-2gb");
        assert_eq!(h.provider.volume_count().await, 1);

        let user_data = h.provider.captured_user_data("bot-r").await.unwrap();
        assert!(user_data.contains("sk-restart-key"));
        assert!(!user_data.contains("{{"));
    }

    #[tokio::test]
    async fn restart_replaces_lingering_instance() {
        let h = harness();
        h.repo.insert_bot("bot-off", BotStatus::Running).await;
        let res = create_direct(&h, "bot-off", "lon1", "s-4vcpu-8gb").await;
        h.provider
            .set_instance_status(&res.instance_id, InstanceStatus::Off)
            .await;

        let job = Job::new(
            "bot-off",
            "user-1",
            JobPayload::RestartBot(placement(&res, "lon1", "s-4vcpu-8gb")),
        );
        h.processor.process(&job).await.unwrap();

        let instance = h.repo.bot_instance("bot-off").await.unwrap().unwrap();
        assert_ne!(instance.provider_instance_id, res.instance_id);
        assert_eq!(instance.region, "lon1");
        assert_eq!(instance.size, "s-4vcpu-8gb");
        assert_eq!(h.provider.instance_count().await, 1);
        assert_eq!(
            h.provider
                .instance_status(&instance.provider_instance_id)
                .await
                .unwrap(),
            InstanceStatus::Active
        );
        assert_eq!(jobs_of(&h, JobType::HealthPoll).await.len(), 1);
        assert_eq!(h.provider.firewall_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn resume_reuses_volume() {
        let h = harness();
        h.repo.insert_bot("bot-res", BotStatus::Stopped).await;
        let res = create_direct(&h, "bot-res", "nyc3", "s-1vcpu-1gb").await;
        h.provider.destroy_instance(&res.instance_id).await.unwrap();

        let job = Job::new(
            "bot-res",
            "user-1",
            JobPayload::ResumeBot(placement(&res, "nyc3", "s-1vcpu-1gb")),
        );
        h.processor.process(&job).await.unwrap();

        assert_eq!(status(&h, "bot-res").await, Some(BotStatus::Running));
        let instance = h.repo.bot_instance("bot-res").await.unwrap().unwrap();
        assert_eq!(instance.provider_volume_id, res.volume_id);
    }

    #[tokio::test]
    async fn destroy_cleans_up_everything() {
        let h = harness();
        h.repo.insert_bot("bot-5", BotStatus::Stopped).await;
        let res = create_direct(&h, "bot-5", "nyc3", "s-1vcpu-1gb").await;
        h.repo
            .save_bot_instance(
                "bot-5",
                &BotInstanceRecord {
                    provider: "fake".into(),
                    provider_instance_id: res.instance_id.clone(),
                    provider_volume_id: res.volume_id.clone(),
                    region: "nyc3".into(),
                    size: "s-1vcpu-1gb".into(),
                    ip_address: res.ip_address.clone(),
                },
            )
            .await
            .unwrap();

        let job = Job::new(
            "bot-5",
            "user-1",
            JobPayload::DestroyBot(Teardown {
                instance_id: res.instance_id,
                volume_id: res.volume_id,
            }),
        );
        h.processor.process(&job).await.unwrap();
        // Redelivery after success is a no-op from a terminal status.
        h.processor.process(&job).await.unwrap();

        assert_eq!(status(&h, "bot-5").await, Some(BotStatus::Destroyed));
        assert_eq!(h.repo.bot_instance("bot-5").await.unwrap(), None);
        assert_eq!(h.provider.instance_count().await, 0);
        assert_eq!(h.provider.volume_count().await, 0);
    }

    #[tokio::test]
    async fn subscription_end_destroy_is_gated() {
        let h = harness();
        h.repo.insert_bot("bot-sub", BotStatus::Running).await;
        let res = create_direct(&h, "bot-sub", "nyc3", "s-1vcpu-1gb").await;

        let job = Job::new(
            "bot-sub",
            "user-1",
            JobPayload::DestroyBotSubscriptionEnded(Teardown {
                instance_id: res.instance_id,
                volume_id: res.volume_id,
            }),
        );
        h.processor.process(&job).await.unwrap();
        assert_eq!(status(&h, "bot-sub").await, Some(BotStatus::Running));
        assert_eq!(h.provider.instance_count().await, 1);
    }

    #[tokio::test]
    async fn health_poll_is_ungated_and_keeps_status() {
        let h = harness();
        h.repo.insert_bot("bot-hp", BotStatus::Running).await;
        let res = create_direct(&h, "bot-hp", "nyc3", "s-1vcpu-1gb").await;

        let job = Job::new(
            "bot-hp",
            "user-1",
            JobPayload::HealthPoll(placement(&res, "nyc3", "s-1vcpu-1gb")),
        );
        h.processor.process(&job).await.unwrap();

        assert_eq!(status(&h, "bot-hp").await, Some(BotStatus::Running));
        let polls = h.queue.scheduled().await;
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].job, job);
        assert_eq!(polls[0].delay, Duration::from_millis(300_000));
        assert!(jobs_of(&h, JobType::RestartBot).await.is_empty());
        assert!(h.repo.events("bot-hp").await.is_empty());
    }

    #[tokio::test]
    async fn unhealthy_instance_triggers_one_restart() {
        let h = harness();
        h.repo.insert_bot("bot-rec", BotStatus::Running).await;
        let res = create_direct(&h, "bot-rec", "sfo3", "s-2vcpu-2gb").await;
        h.provider
            .set_instance_status(&res.instance_id, InstanceStatus::Off)
            .await;

        let job = Job::new(
            "bot-rec",
            "user-1",
            JobPayload::HealthPoll(placement(&res, "sfo3", "s-2vcpu-2gb")),
        );
        h.processor.process(&job).await.unwrap();

        let events = h.repo.events("bot-rec").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_HEALTH_CHECK_FAILED);
        assert_eq!(events[0].payload, Some(json!({"instanceStatus": "off"})));

        let restarts = jobs_of(&h, JobType::RestartBot).await;
        assert_eq!(restarts.len(), 1);
        let JobPayload::RestartBot(p) = &restarts[0].payload else {
            unreachable!()
        };
        assert_eq!(p.volume_id, res.volume_id);
        assert_eq!(p.region, "sfo3");
        assert_eq!(p.size, "s-2vcpu-2gb");

        assert_eq!(jobs_of(&h, JobType::HealthPoll).await.len(), 1);
        assert_eq!(status(&h, "bot-rec").await, Some(BotStatus::Running));
    }

    #[tokio::test]
    async fn creating_instance_is_not_a_failure() {
        let h = harness();
        h.repo.insert_bot("bot-c", BotStatus::Running).await;
        let res = create_direct(&h, "bot-c", "nyc3", "s-1vcpu-1gb").await;
        h.provider
            .set_instance_status(&res.instance_id, InstanceStatus::Creating)
            .await;

        let job = Job::new(
            "bot-c",
            "user-1",
            JobPayload::HealthPoll(placement(&res, "nyc3", "s-1vcpu-1gb")),
        );
        h.processor.process(&job).await.unwrap();
        assert!(jobs_of(&h, JobType::RestartBot).await.is_empty());
    }

    #[tokio::test]
    async fn health_poll_loop_ends_for_destroyed_bot() {
        let h = harness();
        h.repo.insert_bot("bot-gone", BotStatus::Destroyed).await;
        let job = Job::new(
            "bot-gone",
            "user-1",
            JobPayload::HealthPoll(Placement {
                instance_id: "fake-instance-x".into(),
                volume_id: None,
                region: "nyc3".into(),
                size: "s-1vcpu-1gb".into(),
            }),
        );
        h.processor.process(&job).await.unwrap();
        assert!(h.queue.scheduled().await.is_empty());
    }

    #[tokio::test]
    async fn stopped_bot_keeps_polling_without_recovery() {
        let h = harness();
        h.repo.insert_bot("bot-stopped", BotStatus::Stopped).await;
        let job = Job::new(
            "bot-stopped",
            "user-1",
            JobPayload::HealthPoll(Placement {
                instance_id: "fake-instance-old".into(),
                volume_id: None,
                region: "nyc3".into(),
                size: "s-1vcpu-1gb".into(),
            }),
        );
        h.processor.process(&job).await.unwrap();
        assert_eq!(jobs_of(&h, JobType::HealthPoll).await.len(), 1);
        assert!(jobs_of(&h, JobType::RestartBot).await.is_empty());
        assert!(h.repo.events("bot-stopped").await.is_empty());
    }

    #[tokio::test]
    async fn superseded_instance_poll_ends() {
        let h = harness();
        h.repo.insert_bot("bot-new", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-new")).await.unwrap();
        h.queue.clear().await;

        let job = Job::new(
            "bot-new",
            "user-1",
            JobPayload::HealthPoll(Placement {
                instance_id: "fake-instance-previous".into(),
                volume_id: None,
                region: "nyc3".into(),
                size: "s-1vcpu-1gb".into(),
            }),
        );
        h.processor.process(&job).await.unwrap();
        assert!(h.queue.scheduled().await.is_empty());
    }

    #[tokio::test]
    async fn retryable_status_error_keeps_loop_alive() {
        struct FlakyStatus(FakeProvider);

        #[async_trait::async_trait]
        impl ComputeProvider for FlakyStatus {
            fn name(&self) -> &'static str {
                "fake"
            }
            fn volume_device_path(&self, bot_id: &str) -> String {
                self.0.volume_device_path(bot_id)
            }
            async fn create_instance(
                &self,
                params: &CreateInstanceParams,
            ) -> crate::provider::Result<ProviderResources> {
                self.0.create_instance(params).await
            }
            async fn attach_volume(
                &self,
                params: &crate::provider::AttachVolumeParams,
            ) -> crate::provider::Result<String> {
                self.0.attach_volume(params).await
            }
            async fn configure_firewall(&self, params: &FirewallParams) -> crate::provider::Result<()> {
                self.0.configure_firewall(params).await
            }
            async fn destroy_instance(&self, id: &str) -> crate::provider::Result<()> {
                self.0.destroy_instance(id).await
            }
            async fn destroy_volume(&self, id: &str) -> crate::provider::Result<()> {
                self.0.destroy_volume(id).await
            }
            async fn instance_status(&self, _id: &str) -> crate::provider::Result<InstanceStatus> {
                Err(ProviderError::retryable("status endpoint timed out"))
            }
        }

        let repo = InMemoryRepository::new();
        let queue = MemoryQueue::new();
        let processor = JobProcessor::new(
            Arc::new(FlakyStatus(FakeProvider::new())),
            Arc::new(repo.clone()),
            Arc::new(queue.clone()),
            Arc::new(EngineConfig::default()),
        );
        repo.insert_bot("bot-flaky", BotStatus::Running).await;

        let job = Job::new(
            "bot-flaky",
            "user-1",
            JobPayload::HealthPoll(Placement {
                instance_id: "fake-instance-1".into(),
                volume_id: None,
                region: "nyc3".into(),
                size: "s-1vcpu-1gb".into(),
            }),
        );
        let err = processor.process(&job).await.unwrap_err();
        assert!(err.is_retryable_provider());
        assert_eq!(queue.scheduled().await.len(), 1);
    }

    #[tokio::test]
    async fn provision_is_idempotent_under_redelivery() {
        let h = harness();
        h.repo.insert_bot("bot-6", BotStatus::Provisioning).await;

        h.processor.process(&provision("bot-6")).await.unwrap();
        let first = h.repo.bot_instance("bot-6").await.unwrap().unwrap();

        h.repo.insert_bot("bot-6", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-6")).await.unwrap();
        let second = h.repo.bot_instance("bot-6").await.unwrap().unwrap();

        assert_eq!(first.provider_instance_id, second.provider_instance_id);
        assert_eq!(first.provider_volume_id, second.provider_volume_id);
        assert_eq!(h.provider.instance_count().await, 1);
        assert_eq!(h.provider.volume_count().await, 1);
        assert_eq!(jobs_of(&h, JobType::HealthPoll).await.len(), 1);
    }

    async fn current_placement(h: &Harness, bot: &str) -> Placement {
        let record = h.repo.bot_instance(bot).await.unwrap().unwrap();
        Placement {
            instance_id: record.provider_instance_id,
            volume_id: record.provider_volume_id,
            region: record.region,
            size: record.size,
        }
    }

    #[tokio::test]
    async fn redelivered_restart_keeps_a_single_poll_loop() {
        let h = harness();
        h.repo.insert_bot("bot-twice", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-twice")).await.unwrap();
        h.queue.clear().await;

        let restart = Job::new(
            "bot-twice",
            "user-1",
            JobPayload::RestartBot(current_placement(&h, "bot-twice").await),
        );
        h.processor.process(&restart).await.unwrap();
        h.processor.process(&restart).await.unwrap();

        let restarted = current_placement(&h, "bot-twice").await;
        let polls = jobs_of(&h, JobType::HealthPoll).await;
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].payload, JobPayload::HealthPoll(restarted));
        assert_eq!(h.provider.instance_count().await, 1);
        assert_eq!(status(&h, "bot-twice").await, Some(BotStatus::Running));
    }

    #[tokio::test]
    async fn restart_failing_at_firewall_keeps_new_instance_monitored() {
        let h = harness();
        h.repo.insert_bot("bot-fwfail", BotStatus::Provisioning).await;
        h.processor.process(&provision("bot-fwfail")).await.unwrap();
        h.queue.clear().await;

        let crashed = current_placement(&h, "bot-fwfail").await;
        h.provider
            .set_instance_status(&crashed.instance_id, InstanceStatus::Off)
            .await;
        let old_poll = Job::new(
            "bot-fwfail",
            "user-1",
            JobPayload::HealthPoll(crashed.clone()),
        );
        h.processor.process(&old_poll).await.unwrap();
        let restarts = jobs_of(&h, JobType::RestartBot).await;
        assert_eq!(restarts.len(), 1);
        h.queue.clear().await;

        h.provider
            .fail_next_firewall(ProviderError::fatal("firewall quota exceeded"))
            .await;
        h.processor.process(&restarts[0]).await.unwrap();
        assert_eq!(status(&h, "bot-fwfail").await, Some(BotStatus::Error));

        let replacement = current_placement(&h, "bot-fwfail").await;
        assert_ne!(replacement.instance_id, crashed.instance_id);

        // The old loop ends, the new instance's loop stays.
        h.processor.process(&old_poll).await.unwrap();
        let polls = jobs_of(&h, JobType::HealthPoll).await;
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].payload, JobPayload::HealthPoll(replacement.clone()));

        // That loop still watches the bot while it is in error.
        h.queue.clear().await;
        h.provider
            .set_instance_status(&replacement.instance_id, InstanceStatus::Off)
            .await;
        h.processor.process(&polls[0]).await.unwrap();
        assert_eq!(jobs_of(&h, JobType::RestartBot).await.len(), 1);
        assert_eq!(jobs_of(&h, JobType::HealthPoll).await.len(), 1);
    }

    fn sample_job(bot: &str, job_type: JobType) -> Job {
        let placement = Placement {
            instance_id: "fake-instance-sample".into(),
            volume_id: Some("fake-volume-sample".into()),
            region: "nyc3".into(),
            size: "s-1vcpu-1gb".into(),
        };
        let teardown = Teardown {
            instance_id: placement.instance_id.clone(),
            volume_id: placement.volume_id.clone(),
        };
        let payload = match job_type {
            JobType::ProvisionBot => JobPayload::ProvisionBot {
                region: placement.region,
                size: placement.size,
            },
            JobType::StopBot => JobPayload::StopBot {
                instance_id: placement.instance_id,
            },
            JobType::SuspendBot => JobPayload::SuspendBot {
                instance_id: placement.instance_id,
            },
            JobType::RestartBot => JobPayload::RestartBot(placement),
            JobType::ResumeBot => JobPayload::ResumeBot(placement),
            JobType::DestroyBot => JobPayload::DestroyBot(teardown),
            JobType::DestroyBotSubscriptionEnded => {
                JobPayload::DestroyBotSubscriptionEnded(teardown)
            }
            JobType::HealthPoll => JobPayload::HealthPoll(placement),
        };
        Job::new(bot, "user-1", payload)
    }

    #[tokio::test]
    async fn every_disallowed_pair_is_a_silent_no_op() {
        let h = harness();
        let mut checked = 0;
        for current in BotStatus::ALL {
            for job_type in JobType::ALL {
                if StateMachine::can_transition(current, job_type) {
                    continue;
                }
                let bot = format!("bot-{current}-{job_type}");
                h.repo.insert_bot(&bot, current).await;

                h.processor.process(&sample_job(&bot, job_type)).await.unwrap();

                assert_eq!(status(&h, &bot).await, Some(current), "{current} x {job_type}");
                assert!(h.repo.events(&bot).await.is_empty(), "{current} x {job_type}");
                assert!(h.queue.scheduled().await.is_empty(), "{current} x {job_type}");
                checked += 1;
            }
        }
        assert!(checked > 0);
        assert_eq!(h.provider.instance_count().await, 0);
        assert!(h.provider.firewall_calls().await.is_empty());
    }

    #[tokio::test]
    async fn missing_bot_is_skipped() {
        let h = harness();
        h.processor.process(&provision("nonexistent")).await.unwrap();
        assert_eq!(h.provider.instance_count().await, 0);
    }

    #[tokio::test]
    async fn disallowed_transition_is_silent() {
        let h = harness();
        h.repo.insert_bot("bot-7", BotStatus::Running).await;
        h.processor.process(&provision("bot-7")).await.unwrap();

        assert_eq!(status(&h, "bot-7").await, Some(BotStatus::Running));
        assert_eq!(h.provider.instance_count().await, 0);
        assert!(h.repo.events("bot-7").await.is_empty());
        assert!(h.queue.scheduled().await.is_empty());
    }
}
