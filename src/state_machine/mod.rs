mod job;
mod status;

pub use job::{Job, JobPayload, JobType, Placement, RetryPolicy, Teardown};
pub use status::{BotStatus, StateMachine, Transition};
