//! Lifecycle orchestration for per-tenant bot virtual machines.
//!
//! Jobs describing lifecycle intents (provision, stop, restart, resume,
//! suspend, destroy, health poll) are pulled off a [`queue`] by a
//! [`worker`] pool and handed to the [`processor`], which gates them on the
//! [`state_machine`], drives a [`provider`], renders the [`bootstrap`]
//! documents from decrypted [`secrets`] and records the outcome in the
//! [`repository`].

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod repository;
pub mod secrets;
pub mod state_machine;
pub mod worker;

pub use config::EngineConfig;
pub use error::ProcessError;
pub use processor::JobProcessor;
pub use state_machine::{BotStatus, Job, JobPayload, JobType};
