//! Error taxonomy for the lifecycle engine.
//!
//! Each boundary owns an enum: the provider ([`ProviderError`], re-exported
//! from [`crate::provider`]), the secrets codec, the bootstrap renderer, the
//! repository, and the queue. [`ProcessError`] is the only error that escapes
//! [`JobProcessor::process`](crate::processor::JobProcessor::process), and
//! every variant of it means "redeliver this job later".

use thiserror::Error;

pub use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown provider: {0} (expected `fake` or `digitalocean`)")]
    UnknownProvider(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("DIGITALOCEAN_API_TOKEN is required when PROVIDER=digitalocean")]
    MissingProviderToken,
}

/// Failures of the at-rest secrets codec. All of them fail closed.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("master key must be at least {min} characters")]
    InvalidMasterKey { min: usize },

    #[error("invalid ciphertext format: {0}")]
    Malformed(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: wrong key or tampered ciphertext")]
    DecryptionFailed,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid bootstrap parameter {field}: {reason}")]
    InvalidParam { field: &'static str, reason: String },

    #[error("template {template} references unknown placeholder {{{{{name}}}}}")]
    UnknownPlaceholder { template: &'static str, name: String },

    #[error("template {template} has an unterminated placeholder")]
    Unterminated { template: &'static str },
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("bot not found: {0}")]
    BotNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// Failures that bubble out of job processing for redelivery.
///
/// Fatal provider errors, secrets errors, and render errors never show up
/// here: the processor records them against the bot and finishes the job.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Provider(ProviderError),

    #[error("repository unavailable: {0}")]
    Repository(#[from] RepositoryError),

    #[error("failed to schedule follow-up job: {0}")]
    Queue(#[from] QueueError),
}

impl ProcessError {
    pub fn is_retryable_provider(&self) -> bool {
        matches!(self, ProcessError::Provider(e) if e.is_retryable())
    }
}

/// Internal outcome of a failed job operation, before the processor decides
/// whether to absorb it.
#[derive(Debug, Error)]
pub(crate) enum JobFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl JobFailure {
    /// Split into "redeliver" (Err) or "record against the bot" (Ok).
    pub(crate) fn into_retryable(self) -> Result<JobFailure, ProcessError> {
        match self {
            JobFailure::Provider(e) if e.is_retryable() => Err(ProcessError::Provider(e)),
            JobFailure::Repository(e) => Err(ProcessError::Repository(e)),
            JobFailure::Queue(e) => Err(ProcessError::Queue(e)),
            fatal => Ok(fatal),
        }
    }
}
