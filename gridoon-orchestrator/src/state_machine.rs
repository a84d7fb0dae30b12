use gridoon_common::Instance;
use serde::Serialize;
use std::fmt;

use crate::logger::SessionLogger;

/// What the provider says about the target instance when a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    NoInstance,
    InstanceExistsNotReady,
    InstanceReady,
}

impl DeploymentState {
    pub fn derive(instance: Option<&Instance>) -> Self {
        match instance {
            None => DeploymentState::NoInstance,
            Some(i) if i.is_active() => DeploymentState::InstanceReady,
            Some(_) => DeploymentState::InstanceExistsNotReady,
        }
    }

    /// A fresh instance is bootstrapped, an existing one rebuilt.
    pub fn branch(&self) -> Branch {
        match self {
            DeploymentState::NoInstance => Branch::Bootstrap,
            _ => Branch::Rebuild,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::NoInstance => "no_instance",
            DeploymentState::InstanceExistsNotReady => "instance_exists_not_ready",
            DeploymentState::InstanceReady => "instance_ready",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Bootstrap,
    Rebuild,
}

/// Progress of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    KeysVerified,
    InstanceCreated,
    InstanceActive,
    Booted,
    ResizedUp,
    Deployed,
    ResizedDown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::KeysVerified => "keys_verified",
            Phase::InstanceCreated => "instance_created",
            Phase::InstanceActive => "instance_active",
            Phase::Booted => "booted",
            Phase::ResizedUp => "resized_up",
            Phase::Deployed => "deployed",
            Phase::ResizedDown => "resized_down",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record a phase transition in the session log.
pub fn log_state_transition(logger: &SessionLogger, from: Phase, to: Phase, reason: &str) {
    tracing::info!("🔄 [state_machine] {} -> {} ({})", from, to, reason);
    logger.log_quick(
        "STATE_TRANSITION",
        Some(&format!("{} -> {}: {}", from, to, reason)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridoon_common::{InstanceStatus, Networks};

    fn instance(status: InstanceStatus) -> Instance {
        Instance {
            id: 1,
            name: "gridoon".into(),
            status,
            size_slug: "s-1vcpu-1gb".into(),
            networks: Networks::default(),
            tags: vec![],
            created_at: None,
        }
    }

    #[test]
    fn state_follows_instance_status() {
        assert_eq!(DeploymentState::derive(None), DeploymentState::NoInstance);
        assert_eq!(
            DeploymentState::derive(Some(&instance(InstanceStatus::Active))),
            DeploymentState::InstanceReady
        );
        for status in [InstanceStatus::New, InstanceStatus::Off, InstanceStatus::Archive] {
            assert_eq!(
                DeploymentState::derive(Some(&instance(status))),
                DeploymentState::InstanceExistsNotReady
            );
        }
    }

    #[test]
    fn only_missing_instance_bootstraps() {
        assert_eq!(DeploymentState::NoInstance.branch(), Branch::Bootstrap);
        assert_eq!(DeploymentState::InstanceReady.branch(), Branch::Rebuild);
        assert_eq!(DeploymentState::InstanceExistsNotReady.branch(), Branch::Rebuild);
    }

    #[test]
    fn transitions_are_logged() {
        let logger = SessionLogger::new();
        log_state_transition(&logger, Phase::Started, Phase::KeysVerified, "both keys reconciled");
        let records = logger.records();
        assert_eq!(records[0].action_type, "STATE_TRANSITION");
    }
}
