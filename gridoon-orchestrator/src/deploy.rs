// The deployment run: keys, instance, boot, resize, site, resize back.
//
// Every step is awaited in order. A failure aborts the run without
// rollback, except that a failed site deploy still resizes back down.
// Rerunning picks up the existing instance by name.

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use gridoon_common::{poll_until, InstanceSpec, InstanceStatus, Lookup, PollSettings, PollStep, PowerAction};
use gridoon_providers::CloudProvider;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::{DeployConfig, EnvFile, IP_ADDRESS_KEY};
use crate::keys::{KeyGenerator, KeyManager, KeyStore, Reconciliation, SshKeygen, VerifiedKey};
use crate::logger::{SessionLogger, StepRecord, StepStatus};
use crate::ssh::{ConnectRetry, ReadinessCheck, ReadinessOutcome, RemoteExecutor, SshConnector, SshTarget};
use crate::state_machine::{log_state_transition, Branch, DeploymentState, Phase};
use crate::templates::{BootstrapValues, CloudInitValues, TemplateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeOutcome {
    Resized,
    /// Already at the requested size; only powered on if it was off.
    AlreadySized,
}

/// Power-off, resize, power-on, each awaited. The instance stays off if the
/// resize itself fails.
pub async fn resize_with_power_cycle(
    provider: &dyn CloudProvider,
    instance_id: u64,
    size: &str,
    poll: PollSettings,
) -> anyhow::Result<ResizeOutcome> {
    let label = provider.label();
    let instance = provider
        .get_instance(&Lookup::ById(instance_id))
        .await
        .with_context(|| format!("cannot read instance {} before resize", instance_id))?
        .ok_or_else(|| anyhow!("instance {} disappeared before resize", instance_id))?;

    if instance.size_slug == size {
        tracing::info!("ℹ️ [{}] Instance {} is already {}", label, instance_id, size);
        if instance.status == InstanceStatus::Off {
            power_and_wait(provider, instance_id, PowerAction::PowerOn, poll).await?;
        }
        return Ok(ResizeOutcome::AlreadySized);
    }

    if instance.status != InstanceStatus::Off {
        if let Err(e) = power_and_wait(provider, instance_id, PowerAction::Shutdown, poll).await {
            tracing::warn!(
                "⚠️ [{}] Graceful shutdown of {} failed ({:#}), forcing power off",
                label,
                instance_id,
                e
            );
            power_and_wait(provider, instance_id, PowerAction::PowerOff, poll).await?;
        }
    } else {
        tracing::info!("ℹ️ [{}] Instance {} is already off", label, instance_id);
    }

    tracing::info!("📐 [{}] Resizing instance {} to {}", label, instance_id, size);
    let action_id = provider
        .resize(instance_id, size)
        .await
        .with_context(|| format!("resize of instance {} to {} was rejected", instance_id, size))?;
    if !provider.wait_for_action(action_id, poll).await {
        bail!(
            "resize of instance {} to {} did not complete (action {})",
            instance_id,
            size,
            action_id
        );
    }

    power_and_wait(provider, instance_id, PowerAction::PowerOn, poll).await?;
    Ok(ResizeOutcome::Resized)
}

async fn power_and_wait(
    provider: &dyn CloudProvider,
    instance_id: u64,
    action: PowerAction,
    poll: PollSettings,
) -> anyhow::Result<()> {
    let action_id = provider
        .power(instance_id, action)
        .await
        .with_context(|| format!("{} of instance {} was rejected", action, instance_id))?;
    if !provider.wait_for_action(action_id, poll).await {
        bail!("{} of instance {} did not complete (action {})", action, instance_id, action_id);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub name: String,
    pub id: u64,
    pub reconciliation: Reconciliation,
}

impl From<&VerifiedKey> for KeyReport {
    fn from(key: &VerifiedKey) -> Self {
        Self {
            name: key.local.name.clone(),
            id: key.id(),
            reconciliation: key.reconciliation,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    pub initial_state: DeploymentState,
    pub branch: Branch,
    pub phase: Phase,
    pub instance_id: u64,
    pub instance_name: String,
    pub ip_address: String,
    pub created: bool,
    pub keys: Vec<KeyReport>,
    pub readiness: Vec<ReadinessOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl DeploymentReport {
    pub fn all_ready(&self) -> bool {
        self.readiness.iter().all(|r| r.ready)
    }
}

pub struct Deployer {
    config: DeployConfig,
    provider: Arc<dyn CloudProvider>,
    executor: RemoteExecutor,
    keys: KeyStore,
    templates: TemplateSet,
    ip_cache: Option<EnvFile>,
    logger: SessionLogger,
}

impl Deployer {
    pub fn new(config: DeployConfig, provider: Arc<dyn CloudProvider>, connector: Arc<dyn SshConnector>) -> Self {
        let executor = RemoteExecutor::new(connector).with_retry(ConnectRetry {
            attempts: config.timeouts.connect_attempts,
            delay: config.timeouts.connect_delay,
        });
        let keys = KeyStore::new(config.key_dir.clone(), Box::new(SshKeygen));
        Self {
            config,
            provider,
            executor,
            keys,
            templates: TemplateSet::embedded(),
            ip_cache: None,
            logger: SessionLogger::new(),
        }
    }

    pub fn with_key_generator(mut self, generator: Box<dyn KeyGenerator>) -> Self {
        self.keys = KeyStore::new(self.config.key_dir.clone(), generator);
        self
    }

    pub fn with_templates(mut self, templates: TemplateSet) -> Self {
        self.templates = templates;
        self
    }

    /// Env file that receives the discovered `IP_ADDRESS`.
    pub fn with_ip_cache(mut self, env_file: EnvFile) -> Self {
        self.ip_cache = Some(env_file);
        self
    }

    pub fn logger(&self) -> &SessionLogger {
        &self.logger
    }

    async fn step<T, F>(&self, action_type: &str, metadata: Option<serde_json::Value>, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let log_id = self.logger.log_event(action_type, metadata);
        match fut.await {
            Ok(value) => {
                self.logger.log_event_complete(log_id, StepStatus::Success, None, None);
                Ok(value)
            }
            Err(e) => {
                self.logger
                    .log_event_complete(log_id, StepStatus::Failed, Some(&format!("{:#}", e)), None);
                Err(e)
            }
        }
    }

    fn advance(&self, phase: &mut Phase, to: Phase, reason: &str) {
        log_state_transition(&self.logger, *phase, to, reason);
        *phase = to;
    }

    pub async fn run(&self) -> anyhow::Result<DeploymentReport> {
        let started_at = Utc::now();
        let plan = &self.config.plan;
        let provider = self.provider.as_ref();
        let mut phase = Phase::Started;
        tracing::info!(
            "🚀 [deploy] Run {} for {} via {}",
            self.logger.run_id(),
            plan.instance_name,
            provider.label()
        );

        let existing = self
            .step("LOOKUP_INSTANCE", None, async {
                let lookup = Lookup::from_parts("instance", None, Some(plan.instance_name.as_str()))?;
                provider
                    .get_instance(&lookup)
                    .await
                    .with_context(|| format!("cannot look up instance {}", plan.instance_name))
            })
            .await?;
        let initial_state = DeploymentState::derive(existing.as_ref());
        let branch = initial_state.branch();
        tracing::info!("🔎 [deploy] Instance {} state: {}", plan.instance_name, initial_state);

        let (root_key, operator_key) = self
            .step("VERIFY_KEYS", None, async {
                let manager = KeyManager::new(&self.keys, provider);
                let root = manager
                    .verify_keys(&plan.root_key_name)
                    .await
                    .with_context(|| format!("SSH key verification failed for {}", plan.root_key_name))?;
                let operator = manager
                    .verify_keys(&plan.operator_key_name)
                    .await
                    .with_context(|| format!("SSH key verification failed for {}", plan.operator_key_name))?;
                Ok::<_, anyhow::Error>((root, operator))
            })
            .await?;
        self.advance(&mut phase, Phase::KeysVerified, "root and operator keys reconciled");

        let instance_id = match existing {
            None => {
                let id = self.create_instance(&root_key, &operator_key).await?;
                self.advance(&mut phase, Phase::InstanceCreated, "instance requested");
                self.wait_active(id).await?;
                self.advance(&mut phase, Phase::InstanceActive, "provider reports active");
                id
            }
            Some(instance) => match instance.status {
                InstanceStatus::Active => instance.id,
                InstanceStatus::New => {
                    tracing::info!("⏳ [deploy] Instance {} is still being created", instance.id);
                    self.wait_active(instance.id).await?;
                    self.advance(&mut phase, Phase::InstanceActive, "provider reports active");
                    instance.id
                }
                InstanceStatus::Off => {
                    tracing::warn!(
                        "⚠️ [deploy] Instance {} is off, the resize step will power it on",
                        instance.id
                    );
                    instance.id
                }
                other => bail!(
                    "instance {} (id={}) is {}, cannot deploy to it",
                    instance.name,
                    instance.id,
                    other
                ),
            },
        };

        let ip_address = self
            .step(
                "DISCOVER_IP",
                Some(serde_json::json!({ "instance_id": instance_id })),
                self.discover_ip(instance_id, branch),
            )
            .await?;
        self.cache_ip(&ip_address);

        if branch == Branch::Bootstrap {
            tracing::info!(
                "🌐 [deploy] Now would be a good time to update your DNS with the new instance IP: {}",
                ip_address
            );
            tracing::info!("⏳ [deploy] Connecting to the server to see when it finishes building");
            let root = SshTarget::new(ip_address.as_str(), "root", root_key.local.private_key_path.as_path());
            let boot_check = [ReadinessCheck::cloud_init(self.config.timeouts.boot)];
            self.step("WAIT_FOR_BOOT", None, async {
                let outcomes = self
                    .executor
                    .send_and_await(&root, "", &boot_check)
                    .await
                    .with_context(|| format!("cannot reach {} to follow cloud-init", ip_address))?;
                if !outcomes.iter().all(|o| o.ready) {
                    bail!(
                        "cloud-init on {} did not finish within {}s",
                        ip_address,
                        self.config.timeouts.boot.timeout.as_secs()
                    );
                }
                Ok::<_, anyhow::Error>(())
            })
            .await?;
            self.advance(&mut phase, Phase::Booted, "cloud-init done");
        } else {
            self.logger.log_skipped("WAIT_FOR_BOOT", "existing instance, cloud-init already ran");
        }

        tracing::info!("💪 [deploy] Making the instance stronger so the site can be built");
        let resize_up = self
            .step(
                "RESIZE_UP",
                Some(serde_json::json!({ "instance_id": instance_id, "size": plan.large_size })),
                resize_with_power_cycle(provider, instance_id, &plan.large_size, self.config.timeouts.action),
            )
            .await?;
        self.advance(&mut phase, Phase::ResizedUp, &format!("{:?}", resize_up));

        tracing::info!("🏗️ [deploy] Making website");
        let readiness = match self
            .step(
                "DEPLOY_SITE",
                Some(serde_json::json!({ "branch": branch })),
                self.deploy_site(branch, &ip_address, &operator_key),
            )
            .await
        {
            Ok(readiness) => readiness,
            Err(e) => {
                tracing::warn!("⚠️ [deploy] Site commands failed, resizing down before giving up");
                if let Err(down) = self.resize_down(instance_id).await {
                    tracing::error!("❌ [deploy] Instance {} stays on {}: {:#}", instance_id, plan.large_size, down);
                }
                return Err(e);
            }
        };
        for outcome in readiness.iter().filter(|o| !o.ready) {
            tracing::warn!(
                "⚠️ [deploy] Container {} did not reach {}, continuing",
                outcome.check,
                outcome.expected
            );
        }
        self.advance(&mut phase, Phase::Deployed, "site commands sent");

        tracing::info!("💸 [deploy] Making the instance smaller again to keep the bill down");
        let resize_down = self.resize_down(instance_id).await?;
        self.advance(&mut phase, Phase::ResizedDown, &format!("{:?}", resize_down));

        tracing::info!(
            "✅ [deploy] Website should come up shortly! Please give it at least 5 minutes before running again."
        );
        tracing::info!(
            "ℹ️ [deploy] If the website does not come up, make sure the DNS records for {} point to {}, then run again",
            self.config.domain,
            ip_address
        );

        Ok(DeploymentReport {
            run_id: self.logger.run_id(),
            initial_state,
            branch,
            phase,
            instance_id,
            instance_name: plan.instance_name.clone(),
            ip_address,
            created: branch == Branch::Bootstrap,
            keys: vec![KeyReport::from(&root_key), KeyReport::from(&operator_key)],
            readiness,
            started_at,
            finished_at: Utc::now(),
            steps: self.logger.records(),
        })
    }

    async fn create_instance(&self, root_key: &VerifiedKey, operator_key: &VerifiedKey) -> anyhow::Result<u64> {
        let plan = &self.config.plan;
        let credentials = &self.config.credentials;
        let metadata = serde_json::json!({
            "name": plan.instance_name,
            "region": plan.region,
            "size": plan.small_size,
            "image": plan.image,
        });
        self.step("CREATE_INSTANCE", Some(metadata), async {
            let user_data = self
                .templates
                .cloud_init(&CloudInitValues {
                    server_username: &credentials.server_username,
                    server_password: &credentials.server_password,
                    root_password: &credentials.root_password,
                    operator_public_key: &operator_key.local.public_key,
                })
                .context("cannot render cloud-init")?;
            let spec = InstanceSpec {
                name: plan.instance_name.clone(),
                region: plan.region.clone(),
                size: plan.small_size.clone(),
                image: plan.image.clone(),
                ssh_keys: vec![root_key.id()],
                user_data: Some(user_data),
                tags: plan.tags.clone(),
            };
            let instance = self
                .provider
                .create_instance(&spec)
                .await
                .with_context(|| format!("cannot create instance {}", plan.instance_name))?;
            tracing::info!("🆕 [deploy] Instance {} created (id={})", instance.name, instance.id);
            Ok::<_, anyhow::Error>(instance.id)
        })
        .await
    }

    async fn resize_down(&self, instance_id: u64) -> anyhow::Result<ResizeOutcome> {
        let plan = &self.config.plan;
        self.step(
            "RESIZE_DOWN",
            Some(serde_json::json!({ "instance_id": instance_id, "size": plan.small_size })),
            resize_with_power_cycle(
                self.provider.as_ref(),
                instance_id,
                &plan.small_size,
                self.config.timeouts.action,
            ),
        )
        .await
    }

    async fn wait_active(&self, instance_id: u64) -> anyhow::Result<()> {
        let poll = self.config.timeouts.instance_active;
        self.step(
            "WAIT_FOR_ACTIVE",
            Some(serde_json::json!({ "instance_id": instance_id })),
            async {
                if !self.provider.wait_for_instance_active(instance_id, poll).await {
                    bail!(
                        "instance {} did not become active within {}s",
                        instance_id,
                        poll.timeout.as_secs()
                    );
                }
                Ok::<_, anyhow::Error>(())
            },
        )
        .await
    }

    /// Public IPv4 from the provider. Only a rebuild may fall back to the
    /// cached `IP_ADDRESS`; a new instance never inherits an old address.
    async fn discover_ip(&self, instance_id: u64, branch: Branch) -> anyhow::Result<String> {
        let provider = self.provider.as_ref();
        let lookup = Lookup::ById(instance_id);
        let lookup = &lookup;
        let found = Mutex::new(None::<String>);
        let failure = Mutex::new(None::<String>);
        let (found_ref, failure_ref) = (&found, &failure);

        poll_until(self.config.timeouts.instance_active, || async move {
            match provider.get_instance(lookup).await {
                Ok(Some(instance)) => match instance.public_ipv4() {
                    Some(ip) => {
                        *found_ref.lock().unwrap_or_else(|p| p.into_inner()) = Some(ip.to_string());
                        PollStep::Ready
                    }
                    None => PollStep::Pending,
                },
                Ok(None) => PollStep::Pending,
                Err(e) => {
                    tracing::warn!("⚠️ [deploy] Cannot read instance {} networks: {}", instance_id, e);
                    *failure_ref.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                    PollStep::Abort
                }
            }
        })
        .await;

        if let Some(ip) = found.into_inner().unwrap_or_else(|p| p.into_inner()) {
            tracing::info!("🌐 [deploy] Found server IP {}", ip);
            return Ok(ip);
        }
        if let Some(reason) = failure.into_inner().unwrap_or_else(|p| p.into_inner()) {
            bail!("cannot read networks of instance {}: {}", instance_id, reason);
        }
        match (branch, self.config.cached_ip.as_ref()) {
            (Branch::Rebuild, Some(cached)) => {
                tracing::warn!(
                    "⚠️ [deploy] Provider reports no public IPv4 for {}, using cached {}",
                    instance_id,
                    cached
                );
                Ok(cached.clone())
            }
            _ => bail!("instance {} has no public IPv4 address", instance_id),
        }
    }

    fn cache_ip(&self, ip_address: &str) {
        let Some(env_file) = &self.ip_cache else {
            return;
        };
        match env_file.set(IP_ADDRESS_KEY, ip_address) {
            Ok(()) => tracing::debug!("[deploy] Cached {} in {}", ip_address, env_file.path().display()),
            Err(e) => tracing::warn!("⚠️ [deploy] Cannot cache server IP: {}", e),
        }
    }

    async fn deploy_site(
        &self,
        branch: Branch,
        ip_address: &str,
        operator_key: &VerifiedKey,
    ) -> anyhow::Result<Vec<ReadinessOutcome>> {
        let plan = &self.config.plan;
        let credentials = &self.config.credentials;
        let script = match branch {
            Branch::Bootstrap => self.templates.bootstrap(&BootstrapValues {
                github_username: &credentials.github_username,
                github_token: &credentials.github_token,
                email: &self.config.email,
                domain: &self.config.domain,
                repository: &plan.repository,
                compose_project: &plan.compose_project,
            }),
            Branch::Rebuild => {
                let names: Vec<&str> = plan.containers.iter().map(|c| c.name.as_str()).collect();
                self.templates.rebuild(&plan.compose_project, &names)
            }
        }
        .context("cannot render site commands")?;

        let checks: Vec<ReadinessCheck> = plan
            .containers
            .iter()
            .map(|c| ReadinessCheck::container(&c.name, &c.ready_status, self.config.timeouts.readiness))
            .collect();
        let operator = SshTarget::new(
            ip_address,
            self.config.credentials.server_username.as_str(),
            operator_key.local.private_key_path.as_path(),
        );
        self.executor
            .send_and_await(&operator, &script, &checks)
            .await
            .with_context(|| format!("cannot run site commands on {}", operator.destination()))
    }
}
