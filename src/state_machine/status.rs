use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::job::JobType;

/// Lifecycle status of a bot as persisted by the repository.
///
/// A bot starts in `Provisioning`, spends most of its life between `Running`
/// and `Stopped`, and ends in `Destroyed`. `Error` is recoverable through a
/// restart or resume intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    #[default]
    Provisioning,
    Initializing,
    Running,
    Stopped,
    Error,
    Destroying,
    Destroyed,
}

impl BotStatus {
    pub const ALL: [BotStatus; 7] = [
        BotStatus::Provisioning,
        BotStatus::Initializing,
        BotStatus::Running,
        BotStatus::Stopped,
        BotStatus::Error,
        BotStatus::Destroying,
        BotStatus::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Provisioning => "provisioning",
            BotStatus::Initializing => "initializing",
            BotStatus::Running => "running",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
            BotStatus::Destroying => "destroying",
            BotStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BotStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown bot status: {s}"))
    }
}

/// One row of the lifecycle transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Statuses from which the job may run.
    pub from: &'static [BotStatus],
    /// Status persisted when the job succeeds.
    pub to: BotStatus,
    /// Status persisted when the job fails fatally.
    pub on_error: BotStatus,
}

use BotStatus::{Destroyed, Destroying, Error, Provisioning, Running, Stopped};

const PROVISION: Transition = Transition {
    from: &[Provisioning],
    to: Running,
    on_error: Error,
};

const STOP: Transition = Transition {
    from: &[Running, Error],
    to: Stopped,
    on_error: Error,
};

const RESTART: Transition = Transition {
    from: &[Stopped, Running, Error],
    to: Running,
    on_error: Error,
};

const SUSPEND: Transition = Transition {
    from: &[Running],
    to: Stopped,
    on_error: Error,
};

const RESUME: Transition = Transition {
    from: &[Stopped],
    to: Running,
    on_error: Error,
};

const DESTROY: Transition = Transition {
    from: &[Stopped, Running, Error, Destroying],
    to: Destroyed,
    on_error: Error,
};

const DESTROY_SUBSCRIPTION_ENDED: Transition = Transition {
    from: &[Stopped, Error],
    to: Destroyed,
    on_error: Error,
};

/// The single source of truth for which lifecycle transitions are legal.
///
/// Pure lookups only; the processor decides what to do with the answers.
pub struct StateMachine;

impl StateMachine {
    /// Return the table row for a job type.
    ///
    /// `HealthPoll` has no row: it runs regardless of status and never
    /// changes it.
    pub fn transition(job_type: JobType) -> Option<Transition> {
        match job_type {
            JobType::ProvisionBot => Some(PROVISION),
            JobType::StopBot => Some(STOP),
            JobType::RestartBot => Some(RESTART),
            JobType::SuspendBot => Some(SUSPEND),
            JobType::ResumeBot => Some(RESUME),
            JobType::DestroyBot => Some(DESTROY),
            JobType::DestroyBotSubscriptionEnded => Some(DESTROY_SUBSCRIPTION_ENDED),
            JobType::HealthPoll => None,
        }
    }

    /// Whether a job of `job_type` may run against a bot in `current`.
    ///
    /// Ungated job types (health polls) are always allowed.
    pub fn can_transition(current: BotStatus, job_type: JobType) -> bool {
        match Self::transition(job_type) {
            Some(t) => t.from.contains(&current),
            None => true,
        }
    }

    /// Status to persist after the job succeeds, if the job changes status at all.
    pub fn target_status(job_type: JobType) -> Option<BotStatus> {
        Self::transition(job_type).map(|t| t.to)
    }

    /// Status to persist after the job fails fatally.
    pub fn error_status(job_type: JobType) -> BotStatus {
        Self::transition(job_type)
            .map(|t| t.on_error)
            .unwrap_or(BotStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_only_from_provisioning() {
        for status in BotStatus::ALL {
            assert_eq!(
                StateMachine::can_transition(status, JobType::ProvisionBot),
                status == Provisioning,
                "provision from {status}"
            );
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        let cases: &[(JobType, &[BotStatus], BotStatus)] = &[
            (JobType::StopBot, &[Running, Error], Stopped),
            (JobType::RestartBot, &[Stopped, Running, Error], Running),
            (JobType::SuspendBot, &[Running], Stopped),
            (JobType::ResumeBot, &[Stopped], Running),
            (JobType::DestroyBot, &[Stopped, Running, Error, Destroying], Destroyed),
            (JobType::DestroyBotSubscriptionEnded, &[Stopped, Error], Destroyed),
        ];

        for (job_type, allowed, target) in cases {
            for status in BotStatus::ALL {
                assert_eq!(
                    StateMachine::can_transition(status, *job_type),
                    allowed.contains(&status),
                    "{job_type} from {status}"
                );
            }
            assert_eq!(StateMachine::target_status(*job_type), Some(*target));
            assert_eq!(StateMachine::error_status(*job_type), Error);
        }
    }

    #[test]
    fn health_poll_is_ungated_and_keeps_status() {
        for status in BotStatus::ALL {
            assert!(StateMachine::can_transition(status, JobType::HealthPoll));
        }
        assert_eq!(StateMachine::target_status(JobType::HealthPoll), None);
        assert_eq!(StateMachine::error_status(JobType::HealthPoll), Error);
    }

    #[test]
    fn destroyed_is_terminal() {
        for job_type in JobType::ALL {
            if job_type == JobType::HealthPoll {
                continue;
            }
            assert!(!StateMachine::can_transition(Destroyed, job_type));
        }
    }

    #[test]
    fn status_display_and_parse() {
        for status in BotStatus::ALL {
            assert_eq!(status.to_string().parse::<BotStatus>(), Ok(status));
        }
        assert_eq!(Provisioning.to_string(), "provisioning");
        assert!("paused".parse::<BotStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Destroying).unwrap();
        assert_eq!(json, r#""destroying""#);
    }
}
