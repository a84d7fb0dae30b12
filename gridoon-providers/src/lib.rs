use async_trait::async_trait;
use gridoon_common::{
    poll_until, Action, ActionStatus, Instance, InstanceSpec, Lookup, PollSettings, PollStep,
    PowerAction, SshKey,
};

pub mod envelope;
pub mod error;

pub use envelope::{ApiEnvelope, ApiErrorBody};
pub use error::{ProviderError, ProviderResult};

/// Compute and key-pair operations the deploy flow needs from a cloud provider.
///
/// Lookups return `Ok(None)` when the resource does not exist; every other
/// provider-side failure is a `ProviderError`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Label used in log lines, e.g. `DigitalOcean API`.
    fn label(&self) -> &'static str;

    /// Ask the provider to build a new instance. The returned record is the
    /// provider's view at creation time (usually status `new`, no networks).
    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<Instance>;
    async fn get_instance(&self, lookup: &Lookup) -> ProviderResult<Option<Instance>>;
    async fn list_instances(&self) -> ProviderResult<Vec<Instance>>;

    /// CPU/RAM resize. The instance must be powered off. Returns the action id.
    async fn resize(&self, instance_id: u64, size: &str) -> ProviderResult<u64>;
    async fn power(&self, instance_id: u64, action: PowerAction) -> ProviderResult<u64>;
    async fn get_action(&self, action_id: u64) -> ProviderResult<Action>;

    async fn create_key(&self, public_key: &str, name: &str) -> ProviderResult<SshKey>;
    async fn get_key(&self, lookup: &Lookup) -> ProviderResult<Option<SshKey>>;
    async fn list_keys(&self) -> ProviderResult<Vec<SshKey>>;
    async fn delete_key(&self, key_id: u64) -> ProviderResult<bool>;

    /// Poll an action until it completes.
    ///
    /// `false` when the action errors, the budget runs out, or the status
    /// request itself fails. Timeout is an expected outcome: the caller decides
    /// whether it is fatal.
    async fn wait_for_action(&self, action_id: u64, poll: PollSettings) -> bool {
        let label = self.label();
        let done = poll_until(poll, || async move {
            match self.get_action(action_id).await {
                Ok(action) => match action.status {
                    ActionStatus::Completed => {
                        tracing::info!("✅ [{}] Action {} ({}) completed", label, action_id, action.kind);
                        PollStep::Ready
                    }
                    ActionStatus::Errored => {
                        tracing::error!("❌ [{}] Action {} ({}) failed", label, action_id, action.kind);
                        PollStep::Abort
                    }
                    _ => PollStep::Pending,
                },
                Err(e) => {
                    tracing::warn!("⚠️ [{}] Error while monitoring action {}: {}", label, action_id, e);
                    PollStep::Abort
                }
            }
        })
        .await;
        if !done {
            tracing::warn!(
                "⚠️ [{}] Action {} not confirmed as completed within {}s",
                label,
                action_id,
                poll.timeout.as_secs()
            );
        }
        done
    }

    /// Poll an instance until its status is `active`. Same result contract as
    /// [`CloudProvider::wait_for_action`].
    async fn wait_for_instance_active(&self, instance_id: u64, poll: PollSettings) -> bool {
        let label = self.label();
        let lookup = Lookup::ById(instance_id);
        let lookup = &lookup;
        poll_until(poll, || async move {
            match self.get_instance(lookup).await {
                Ok(Some(instance)) if instance.is_active() => {
                    tracing::info!("✅ [{}] Instance {} is active", label, instance_id);
                    PollStep::Ready
                }
                Ok(Some(instance)) => {
                    tracing::debug!("[{}] Instance {} status={}", label, instance_id, instance.status);
                    PollStep::Pending
                }
                // Freshly created instances can briefly 404 on some regions.
                Ok(None) => PollStep::Pending,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [{}] Error while monitoring instance {} creation: {}",
                        label,
                        instance_id,
                        e
                    );
                    PollStep::Abort
                }
            }
        })
        .await
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "digitalocean")]
pub mod digitalocean;
