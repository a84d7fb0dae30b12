// In-memory provider for dry runs and tests.
//
// Mirrors the provider rules the deploy flow depends on: resize needs a
// powered-off instance, a public key can only be registered once, and unknown
// ids answer with a `not_found` error.

use crate::error::{ProviderError, ProviderResult};
use crate::CloudProvider;
use async_trait::async_trait;
use gridoon_common::{
    Action, ActionStatus, AddressKind, Instance, InstanceSpec, InstanceStatus, Lookup,
    NetworkAddress, Networks, PowerAction, SshKey,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Mutating calls, in the order they reached the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateInstance {
        name: String,
        size: String,
        ssh_keys: Vec<u64>,
        user_data: Option<String>,
    },
    Resize {
        instance_id: u64,
        size: String,
    },
    Power {
        instance_id: u64,
        action: PowerAction,
    },
    CreateKey {
        name: String,
        public_key: String,
    },
    DeleteKey {
        key_id: u64,
    },
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    instances: Vec<Instance>,
    keys: Vec<SshKey>,
    actions: HashMap<u64, Action>,
    forced_outcomes: HashMap<String, ActionStatus>,
    calls: Vec<MockCall>,
}

impl MockState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn instance_mut(&mut self, instance_id: u64, operation: &'static str) -> ProviderResult<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| not_found(operation))
    }

    fn record_action(&mut self, kind: &str, instance_id: u64) -> Action {
        let id = self.allocate_id();
        let status = self
            .forced_outcomes
            .get(kind)
            .copied()
            .unwrap_or(ActionStatus::Completed);
        let action = Action {
            id,
            status,
            kind: kind.to_string(),
            resource_id: Some(instance_id),
            started_at: None,
            completed_at: None,
        };
        self.actions.insert(id, action.clone());
        action
    }
}

fn not_found(operation: &'static str) -> ProviderError {
    ProviderError::Api {
        operation,
        status: 404,
        code: "not_found".into(),
        message: "The resource you were accessing could not be found.".into(),
    }
}

fn unprocessable(operation: &'static str, message: &str) -> ProviderError {
    ProviderError::Api {
        operation,
        status: 422,
        code: "unprocessable_entity".into(),
        message: message.into(),
    }
}

fn networks_for(id: u64) -> Networks {
    let octet = (id % 250) + 1;
    Networks {
        v4: vec![
            NetworkAddress {
                ip_address: format!("10.110.0.{}", octet),
                kind: AddressKind::Private,
            },
            NetworkAddress {
                ip_address: format!("203.0.113.{}", octet),
                kind: AddressKind::Public,
            },
        ],
        v6: vec![],
    }
}

#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an existing instance, as if created by an earlier run.
    pub fn seed_instance(&self, name: &str, size: &str, status: InstanceStatus) -> Instance {
        let mut state = self.state();
        let id = state.allocate_id();
        let instance = Instance {
            id,
            name: name.to_string(),
            status,
            size_slug: size.to_string(),
            networks: networks_for(id),
            tags: vec![],
            created_at: None,
        };
        state.instances.push(instance.clone());
        instance
    }

    pub fn seed_key(&self, name: &str, public_key: &str) -> SshKey {
        let mut state = self.state();
        let id = state.allocate_id();
        let key = SshKey {
            id,
            name: name.to_string(),
            public_key: public_key.trim().to_string(),
            fingerprint: format!("mock:{}", id),
        };
        state.keys.push(key.clone());
        key
    }

    /// Make every future action of `kind` (`resize`, `shutdown`, ...) end in `status`.
    pub fn force_action_outcome(&self, kind: &str, status: ActionStatus) {
        self.state().forced_outcomes.insert(kind.to_string(), status);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state().instances.clone()
    }

    pub fn keys(&self) -> Vec<SshKey> {
        self.state().keys.clone()
    }

    /// Stored user-data of the instance named `name`, if it was created here.
    pub fn user_data_of(&self, name: &str) -> Option<String> {
        self.state().calls.iter().find_map(|c| match c {
            MockCall::CreateInstance { name: n, user_data, .. } if n == name => user_data.clone(),
            _ => None,
        })
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn label(&self) -> &'static str {
        "Mock API"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<Instance> {
        let mut state = self.state();
        for key_id in &spec.ssh_keys {
            if !state.keys.iter().any(|k| k.id == *key_id) {
                return Err(unprocessable("create droplet", "ssh_keys contains an unknown key"));
            }
        }
        let id = state.allocate_id();
        let instance = Instance {
            id,
            name: spec.name.clone(),
            status: InstanceStatus::Active,
            size_slug: spec.size.clone(),
            networks: networks_for(id),
            tags: spec.tags.clone(),
            created_at: None,
        };
        state.instances.push(instance.clone());
        state.calls.push(MockCall::CreateInstance {
            name: spec.name.clone(),
            size: spec.size.clone(),
            ssh_keys: spec.ssh_keys.clone(),
            user_data: spec.user_data.clone(),
        });
        tracing::info!("✅ [Mock API] Created instance {} (id={})", spec.name, id);
        // The real API reports a fresh droplet as `new` without networks.
        Ok(Instance {
            status: InstanceStatus::New,
            networks: Networks::default(),
            ..instance
        })
    }

    async fn get_instance(&self, lookup: &Lookup) -> ProviderResult<Option<Instance>> {
        let state = self.state();
        Ok(state
            .instances
            .iter()
            .find(|i| match lookup {
                Lookup::ById(id) => i.id == *id,
                Lookup::ByName(name) => &i.name == name,
            })
            .cloned())
    }

    async fn list_instances(&self) -> ProviderResult<Vec<Instance>> {
        Ok(self.state().instances.clone())
    }

    async fn resize(&self, instance_id: u64, size: &str) -> ProviderResult<u64> {
        let mut state = self.state();
        let status = state.instance_mut(instance_id, "resize droplet")?.status;
        if status != InstanceStatus::Off {
            return Err(unprocessable("resize droplet", "Droplet must be powered off before resizing"));
        }
        state.calls.push(MockCall::Resize {
            instance_id,
            size: size.to_string(),
        });
        let action = state.record_action("resize", instance_id);
        if action.status == ActionStatus::Completed {
            state.instance_mut(instance_id, "resize droplet")?.size_slug = size.to_string();
        }
        Ok(action.id)
    }

    async fn power(&self, instance_id: u64, action: PowerAction) -> ProviderResult<u64> {
        let mut state = self.state();
        state.instance_mut(instance_id, "power droplet")?;
        state.calls.push(MockCall::Power { instance_id, action });
        let recorded = state.record_action(action.as_str(), instance_id);
        if recorded.status == ActionStatus::Completed {
            let instance = state.instance_mut(instance_id, "power droplet")?;
            instance.status = match action {
                PowerAction::PowerOn => InstanceStatus::Active,
                PowerAction::Shutdown | PowerAction::PowerOff => InstanceStatus::Off,
            };
        }
        Ok(recorded.id)
    }

    async fn get_action(&self, action_id: u64) -> ProviderResult<Action> {
        self.state()
            .actions
            .get(&action_id)
            .cloned()
            .ok_or_else(|| not_found("get action"))
    }

    async fn create_key(&self, public_key: &str, name: &str) -> ProviderResult<SshKey> {
        let mut state = self.state();
        if state.keys.iter().any(|k| k.matches_public_key(public_key)) {
            return Err(unprocessable("create ssh key", "SSH Key is already in use on your account"));
        }
        let id = state.allocate_id();
        let key = SshKey {
            id,
            name: name.to_string(),
            public_key: public_key.trim().to_string(),
            fingerprint: format!("mock:{}", id),
        };
        state.keys.push(key.clone());
        state.calls.push(MockCall::CreateKey {
            name: name.to_string(),
            public_key: key.public_key.clone(),
        });
        Ok(key)
    }

    async fn get_key(&self, lookup: &Lookup) -> ProviderResult<Option<SshKey>> {
        let state = self.state();
        Ok(state
            .keys
            .iter()
            .find(|k| match lookup {
                Lookup::ById(id) => k.id == *id,
                Lookup::ByName(name) => &k.name == name,
            })
            .cloned())
    }

    async fn list_keys(&self) -> ProviderResult<Vec<SshKey>> {
        Ok(self.state().keys.clone())
    }

    async fn delete_key(&self, key_id: u64) -> ProviderResult<bool> {
        let mut state = self.state();
        let before = state.keys.len();
        state.keys.retain(|k| k.id != key_id);
        if state.keys.len() == before {
            return Err(not_found("delete ssh key"));
        }
        state.calls.push(MockCall::DeleteKey { key_id });
        Ok(true)
    }
}
