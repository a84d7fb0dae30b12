// Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use gridoon_common::{Action, Instance, InstanceSpec, Lookup, Networks, PowerAction, SshKey};
use gridoon_orchestrator::config::DeployConfig;
use gridoon_orchestrator::keys::{write_private_key, KeyError, KeyGenerator};
use gridoon_orchestrator::ssh::{CommandOutput, RemoteSession, SshConnector, SshError, SshTarget};
use gridoon_providers::mock::MockProvider;
use gridoon_providers::{CloudProvider, ProviderResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub fn test_config(key_dir: &Path) -> DeployConfig {
    let vars: HashMap<&str, String> = HashMap::from([
        ("DO_TOKEN", "dop_v1_test".to_string()),
        ("EMAIL", "ops@example.org".to_string()),
        ("DOMAIN", "example.org".to_string()),
        ("GITHUB_USERNAME", "octo".to_string()),
        ("GITHUB_TOKEN", "ghp_test".to_string()),
        ("SERVER_USERNAME", "deploy".to_string()),
        ("SERVER_PASSWORD", "deploy-pw".to_string()),
        ("ROOT_PASSWORD", "root-pw".to_string()),
        ("PROVIDER", "mock".to_string()),
        ("GRIDOON_KEY_DIR", key_dir.display().to_string()),
    ]);
    DeployConfig::from_source(|k| vars.get(k).cloned()).expect("test config")
}

/// Writes `ssh-rsa FAKE-<name>` pairs without calling ssh-keygen.
pub struct FakeKeygen;

#[async_trait]
impl KeyGenerator for FakeKeygen {
    async fn generate(&self, name: &str, private_key_path: &Path, public_key_path: &Path) -> Result<(), KeyError> {
        write_private_key(private_key_path, &format!("FAKE PRIVATE {}\n", name)).await?;
        std::fs::write(public_key_path, format!("ssh-rsa FAKE-{}\n", name)).map_err(|source| KeyError::Io {
            path: public_key_path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLog {
    pub destination: String,
    pub private_key: String,
    pub scripts: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
struct HostState {
    sessions: Vec<SessionLog>,
    /// `docker inspect` answer per container; unknown containers print nothing.
    containers: HashMap<String, String>,
    cloud_init: String,
    refuse_next: usize,
}

/// Scripted remote host: answers readiness probes and records every script.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn healthy() -> Self {
        let host = Self {
            state: Arc::new(Mutex::new(HostState {
                cloud_init: "done".into(),
                ..Default::default()
            })),
        };
        host.set_container("gridoon-nodejs", "exited");
        host.set_container("gridoon-nginx-certbot", "running");
        host
    }

    pub fn set_container(&self, name: &str, status: &str) {
        self.state.lock().unwrap().containers.insert(name.into(), status.into());
    }

    pub fn set_cloud_init(&self, status: &str) {
        self.state.lock().unwrap().cloud_init = status.into();
    }

    pub fn refuse_connections(&self, count: usize) {
        self.state.lock().unwrap().refuse_next = count;
    }

    pub fn sessions(&self) -> Vec<SessionLog> {
        self.state.lock().unwrap().sessions.clone()
    }

    fn answer(&self, script: &str) -> String {
        let state = self.state.lock().unwrap();
        if script.starts_with("cloud-init status") {
            return format!("{}\n", state.cloud_init);
        }
        if script.starts_with("docker inspect") {
            let name = script.rsplit(' ').next().unwrap_or_default();
            return state.containers.get(name).map(|s| format!("{}\n", s)).unwrap_or_default();
        }
        String::new()
    }
}

#[async_trait]
impl SshConnector for FakeHost {
    async fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(SshError::Connect {
                destination: target.destination(),
                detail: "Connection refused".into(),
            });
        }
        state.sessions.push(SessionLog {
            destination: target.destination(),
            private_key: target.private_key.display().to_string(),
            scripts: vec![],
            closed: false,
        });
        Ok(Box::new(FakeSession {
            host: self.clone(),
            index: state.sessions.len() - 1,
            destination: target.destination(),
        }))
    }
}

struct FakeSession {
    host: FakeHost,
    index: usize,
    destination: String,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn destination(&self) -> String {
        self.destination.clone()
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, SshError> {
        self.host.state.lock().unwrap().sessions[self.index]
            .scripts
            .push(script.to_string());
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: self.host.answer(script),
            stderr: String::new(),
        })
    }

    async fn close(&mut self) {
        self.host.state.lock().unwrap().sessions[self.index].closed = true;
    }
}

/// Mock provider whose instances never report an address.
pub struct NoNetworks(pub Arc<MockProvider>);

fn strip_networks(mut instance: Instance) -> Instance {
    instance.networks = Networks::default();
    instance
}

#[async_trait]
impl CloudProvider for NoNetworks {
    fn label(&self) -> &'static str {
        self.0.label()
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<Instance> {
        self.0.create_instance(spec).await.map(strip_networks)
    }

    async fn get_instance(&self, lookup: &Lookup) -> ProviderResult<Option<Instance>> {
        Ok(self.0.get_instance(lookup).await?.map(strip_networks))
    }

    async fn list_instances(&self) -> ProviderResult<Vec<Instance>> {
        Ok(self.0.list_instances().await?.into_iter().map(strip_networks).collect())
    }

    async fn resize(&self, instance_id: u64, size: &str) -> ProviderResult<u64> {
        self.0.resize(instance_id, size).await
    }

    async fn power(&self, instance_id: u64, action: PowerAction) -> ProviderResult<u64> {
        self.0.power(instance_id, action).await
    }

    async fn get_action(&self, action_id: u64) -> ProviderResult<Action> {
        self.0.get_action(action_id).await
    }

    async fn create_key(&self, public_key: &str, name: &str) -> ProviderResult<SshKey> {
        self.0.create_key(public_key, name).await
    }

    async fn get_key(&self, lookup: &Lookup) -> ProviderResult<Option<SshKey>> {
        self.0.get_key(lookup).await
    }

    async fn list_keys(&self) -> ProviderResult<Vec<SshKey>> {
        self.0.list_keys().await
    }

    async fn delete_key(&self, key_id: u64) -> ProviderResult<bool> {
        self.0.delete_key(key_id).await
    }
}
