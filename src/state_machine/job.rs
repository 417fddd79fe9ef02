use std::fmt;

use serde::{Deserialize, Serialize};

/// Discriminant of a [`Job`], used for gating, retry policy, and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    ProvisionBot,
    StopBot,
    RestartBot,
    ResumeBot,
    SuspendBot,
    DestroyBot,
    DestroyBotSubscriptionEnded,
    HealthPoll,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::ProvisionBot,
        JobType::StopBot,
        JobType::RestartBot,
        JobType::ResumeBot,
        JobType::SuspendBot,
        JobType::DestroyBot,
        JobType::DestroyBotSubscriptionEnded,
        JobType::HealthPoll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ProvisionBot => "PROVISION_BOT",
            JobType::StopBot => "STOP_BOT",
            JobType::RestartBot => "RESTART_BOT",
            JobType::ResumeBot => "RESUME_BOT",
            JobType::SuspendBot => "SUSPEND_BOT",
            JobType::DestroyBot => "DESTROY_BOT",
            JobType::DestroyBotSubscriptionEnded => "DESTROY_BOT_SUBSCRIPTION_ENDED",
            JobType::HealthPoll => "HEALTH_POLL",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a bot currently lives: enough to tear down its instance or bring
/// it back up on the same volume with the same sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub instance_id: String,
    #[serde(default)]
    pub volume_id: Option<String>,
    pub region: String,
    pub size: String,
}

/// Resources to release when a bot is destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teardown {
    pub instance_id: String,
    #[serde(default)]
    pub volume_id: Option<String>,
}

/// Per-type payload of a lifecycle job.
///
/// Serialized with a `type` tag so the wire shape matches what producers
/// enqueue: `{"type":"STOP_BOT","instanceId":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum JobPayload {
    ProvisionBot { region: String, size: String },
    StopBot { instance_id: String },
    RestartBot(Placement),
    ResumeBot(Placement),
    SuspendBot { instance_id: String },
    DestroyBot(Teardown),
    DestroyBotSubscriptionEnded(Teardown),
    HealthPoll(Placement),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::ProvisionBot { .. } => JobType::ProvisionBot,
            JobPayload::StopBot { .. } => JobType::StopBot,
            JobPayload::RestartBot(_) => JobType::RestartBot,
            JobPayload::ResumeBot(_) => JobType::ResumeBot,
            JobPayload::SuspendBot { .. } => JobType::SuspendBot,
            JobPayload::DestroyBot(_) => JobType::DestroyBot,
            JobPayload::DestroyBotSubscriptionEnded(_) => JobType::DestroyBotSubscriptionEnded,
            JobPayload::HealthPoll(_) => JobType::HealthPoll,
        }
    }
}

/// An immutable lifecycle intent for one bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub bot_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl Job {
    pub fn new(bot_id: impl Into<String>, user_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            bot_id: bot_id.into(),
            user_id: user_id.into(),
            payload,
        }
    }

    pub fn provision(
        bot_id: impl Into<String>,
        user_id: impl Into<String>,
        region: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        Self::new(
            bot_id,
            user_id,
            JobPayload::ProvisionBot {
                region: region.into(),
                size: size.into(),
            },
        )
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }
}

/// Redelivery policy the queue applies to a job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    /// Policy for a job type. Destroys get more attempts since leaked
    /// resources cost money; health polls are never retried because the
    /// next poll is already scheduled.
    pub fn for_job(job_type: JobType) -> Self {
        match job_type {
            JobType::ProvisionBot => Self::new(3, 5000),
            JobType::StopBot | JobType::RestartBot | JobType::SuspendBot => Self::new(3, 2000),
            JobType::ResumeBot => Self::new(3, 5000),
            JobType::DestroyBot | JobType::DestroyBotSubscriptionEnded => Self::new(5, 5000),
            JobType::HealthPoll => Self::new(1, 0),
        }
    }

    /// Delay before redelivering after the given failed attempt.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms.saturating_mul(factor)
    }

    /// Whether another delivery is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
