mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::Style;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use botvisor::bootstrap::{self, BootstrapParams};
use botvisor::config::{EngineConfig, ProviderKind};
use botvisor::processor::{SECRET_MODEL_PROVIDER, SECRET_MODEL_PROVIDER_KEY};
use botvisor::provider::{ComputeProvider, DigitalOceanProvider, FakeProvider, InstanceStatus};
use botvisor::queue::{EnqueueOptions, JobQueue, MemoryQueue};
use botvisor::repository::{EVENT_HEALTH_CHECK_FAILED, InMemoryRepository, Repository};
use botvisor::secrets::SecretsCodec;
use botvisor::state_machine::{BotStatus, Job, JobPayload, JobType, Placement, Teardown};
use botvisor::worker::WorkerPool;
use botvisor::JobProcessor;
use cli::{Cli, Command};
use ui::LifecycleProgress;

/// Master key used by `demo` when none is configured.
const DEMO_MASTER_KEY: &str = "demo-master-key-not-for-production-use";

/// Upper bound on any single demo step.
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Worker {
            provider,
            concurrency,
        } => {
            let mut config = EngineConfig::load().context("failed to load configuration")?;
            if let Some(provider) = provider {
                config.provider = provider;
            }
            if let Some(concurrency) = concurrency {
                config.worker_concurrency = concurrency;
            }
            config.validate()?;
            run_worker(config).await
        }
        Command::Demo { bot_id } => {
            let config = EngineConfig::load().context("failed to load configuration")?;
            run_demo(config, &bot_id).await
        }
        Command::Render { bot_id } => {
            let config = EngineConfig::load().context("failed to load configuration")?;
            run_render(&config, &bot_id)
        }
        Command::Encrypt { plaintext } => {
            let codec = codec_from_config()?;
            println!("{}", codec.encrypt(&plaintext)?);
            Ok(())
        }
        Command::Decrypt { ciphertext } => {
            let codec = codec_from_config()?;
            println!("{}", codec.decrypt(&ciphertext)?.expose_secret());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "botvisor=debug" } else { "botvisor=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn codec_from_config() -> Result<SecretsCodec> {
    let config = EngineConfig::load().context("failed to load configuration")?;
    SecretsCodec::new(config.master_key()).context("SECRETS_MASTER_KEY is not usable")
}

fn build_provider(config: &EngineConfig) -> Result<Arc<dyn ComputeProvider>> {
    Ok(match config.provider {
        ProviderKind::Fake => Arc::new(FakeProvider::new()),
        ProviderKind::DigitalOcean => Arc::new(
            DigitalOceanProvider::new(config.digitalocean_token())
                .context("failed to build DigitalOcean client")?,
        ),
    })
}

async fn run_worker(config: EngineConfig) -> Result<()> {
    let provider = build_provider(&config)?;
    let repo = InMemoryRepository::new();
    let queue = MemoryQueue::new();
    let concurrency = config.worker_concurrency;
    info!(provider = %config.provider, concurrency, "Starting worker");
    warn!("Repository and queue are in-memory and start empty; no jobs arrive without an embedded producer");

    let processor = Arc::new(JobProcessor::new(
        provider,
        Arc::new(repo),
        Arc::new(queue.clone()),
        Arc::new(config),
    ));
    let pool = WorkerPool::start(queue, processor, concurrency);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    pool.shutdown().await;
    Ok(())
}

async fn run_demo(mut config: EngineConfig, bot_id: &str) -> Result<()> {
    if config.master_key.is_empty() {
        config.master_key = DEMO_MASTER_KEY.to_string();
    }
    config.provider = ProviderKind::Fake;
    config.health_poll_interval_ms = 200;

    let provider = FakeProvider::new();
    let repo = InMemoryRepository::new();
    let queue = MemoryQueue::new();
    let codec = SecretsCodec::new(config.master_key())?;

    repo.insert_bot(bot_id, BotStatus::Provisioning).await;
    repo.insert_secret(bot_id, SECRET_MODEL_PROVIDER, &codec.encrypt("openai")?)
        .await;
    repo.insert_secret(
        bot_id,
        SECRET_MODEL_PROVIDER_KEY,
        &codec.encrypt("sk-demo-0000")?,
    )
    .await;

    let concurrency = config.worker_concurrency;
    let processor = Arc::new(JobProcessor::new(
        Arc::new(provider.clone()),
        Arc::new(repo.clone()),
        Arc::new(queue.clone()),
        Arc::new(config),
    ));
    let pool = WorkerPool::start(queue.clone(), processor, concurrency);
    let progress = LifecycleProgress::start(&format!("Provisioning {bot_id}"));

    let outcome = demo_steps(&provider, &repo, &queue, &progress, bot_id).await;
    pool.shutdown().await;

    match &outcome {
        Ok(()) => progress.finish(true, "Lifecycle demo completed"),
        Err(e) => progress.finish(false, &format!("Lifecycle demo failed: {e:#}")),
    }
    progress.print_events(&repo.events(bot_id).await);
    outcome
}

async fn demo_steps(
    provider: &FakeProvider,
    repo: &InMemoryRepository,
    queue: &MemoryQueue,
    progress: &LifecycleProgress,
    bot_id: &str,
) -> Result<()> {
    let user_id = "demo-user";
    let submit = move |payload: JobPayload| {
        let job = Job::new(bot_id, user_id, payload);
        progress.job(job.job_type());
        async move { queue.enqueue(job, EnqueueOptions::immediate()).await }
    };

    submit(JobPayload::ProvisionBot {
        region: "nyc3".into(),
        size: "s-1vcpu-1gb".into(),
    })
    .await?;
    wait_for_status(repo, bot_id, BotStatus::Running).await?;
    progress.step_done(JobType::ProvisionBot, repo.bot_status(bot_id).await?);

    // Knock the instance over and let the health poll bring it back.
    let crashed = current_placement(repo, bot_id).await?;
    provider
        .set_instance_status(&crashed.instance_id, InstanceStatus::Off)
        .await;
    progress.warn(&format!("Instance {} powered off", crashed.instance_id));
    let crashed_id = crashed.instance_id.as_str();
    wait_until(move || async move {
        let recovered = repo
            .bot_instance(bot_id)
            .await
            .ok()
            .flatten()
            .is_some_and(|i| i.provider_instance_id != crashed_id);
        let flagged = repo
            .events(bot_id)
            .await
            .iter()
            .any(|e| e.event_type == EVENT_HEALTH_CHECK_FAILED);
        recovered && flagged
    })
    .await
    .context("health poll did not recover the instance")?;
    progress.step_done(JobType::HealthPoll, repo.bot_status(bot_id).await?);

    let placement = current_placement(repo, bot_id).await?;
    submit(JobPayload::StopBot {
        instance_id: placement.instance_id.clone(),
    })
    .await?;
    wait_for_status(repo, bot_id, BotStatus::Stopped).await?;
    progress.step_done(JobType::StopBot, repo.bot_status(bot_id).await?);

    submit(JobPayload::RestartBot(placement)).await?;
    wait_until(move || async move {
        repo.bot_status(bot_id).await.ok().flatten() == Some(BotStatus::Running)
            && provider.instance_count().await == 1
    })
    .await
    .context("restart did not bring the bot back")?;
    progress.step_done(JobType::RestartBot, repo.bot_status(bot_id).await?);

    let placement = current_placement(repo, bot_id).await?;
    submit(JobPayload::DestroyBot(Teardown {
        instance_id: placement.instance_id,
        volume_id: placement.volume_id,
    }))
    .await?;
    wait_for_status(repo, bot_id, BotStatus::Destroyed).await?;
    progress.step_done(JobType::DestroyBot, repo.bot_status(bot_id).await?);

    if provider.instance_count().await != 0 || provider.volume_count().await != 0 {
        bail!("resources left behind after destroy");
    }
    Ok(())
}

async fn current_placement(repo: &InMemoryRepository, bot_id: &str) -> Result<Placement> {
    let record = repo
        .bot_instance(bot_id)
        .await?
        .with_context(|| format!("bot {bot_id} has no instance"))?;
    Ok(Placement {
        instance_id: record.provider_instance_id,
        volume_id: record.provider_volume_id,
        region: record.region,
        size: record.size,
    })
}

async fn wait_for_status(repo: &InMemoryRepository, bot_id: &str, status: BotStatus) -> Result<()> {
    wait_until(move || async move { repo.bot_status(bot_id).await.ok().flatten() == Some(status) })
        .await
        .with_context(|| format!("bot {bot_id} never reached {status}"))
}

async fn wait_until<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(DEMO_STEP_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out")
}

fn run_render(config: &EngineConfig, bot_id: &str) -> Result<()> {
    let provider = FakeProvider::new();
    let params = BootstrapParams {
        bot_id: bot_id.to_string(),
        gateway_token: SecretString::from(uuid::Uuid::new_v4().to_string()),
        version: config.bot_version.clone(),
        model_provider_key: Some(SecretString::from("sk-sample-key".to_string())),
        model_provider: Some("openai".into()),
        system_instructions: Some("You are a helpful assistant.".into()),
        volume_device: provider.volume_device_path(bot_id),
        mount_path: config.mount_path.clone(),
    };

    let header = Style::new().cyan().bold();
    let documents = [
        ("cloud-init.yaml", bootstrap::render_boot_loader(&params)?),
        ("docker-compose.yml", bootstrap::render_compose_manifest(&params)?),
        ("health-check.sh", bootstrap::render_health_check_script()),
    ];
    for (name, body) in documents {
        println!("{}", header.apply_to(format!("─── {name} ───")));
        println!("{body}");
    }
    Ok(())
}
