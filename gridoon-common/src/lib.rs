use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod poll;

pub use poll::{poll_until, PollSettings, PollStep};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    New,     // Provider accepted the create request, still building
    Active,  // Powered on and reachable
    Off,     // Powered off (shutdown or power_off action)
    Archive, // Snapshotted and destroyed on the provider side
    #[serde(other)]
    Other,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::New => "new",
            InstanceStatus::Active => "active",
            InstanceStatus::Off => "off",
            InstanceStatus::Archive => "archive",
            InstanceStatus::Other => "other",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Public,
    Private,
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    InProgress,
    Completed,
    Errored,
    #[serde(other)]
    Other,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Errored)
    }
}

/// Power transitions accepted by the provider's instance action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    PowerOn,
    /// Graceful ACPI shutdown.
    Shutdown,
    /// Hard power cut.
    PowerOff,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::PowerOn => "power_on",
            PowerAction::Shutdown => "shutdown",
            PowerAction::PowerOff => "power_off",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: AddressKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkAddress>,
    #[serde(default)]
    pub v6: Vec<NetworkAddress>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub size_slug: String,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// First public IPv4 address, if the provider has assigned one yet.
    pub fn public_ipv4(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == AddressKind::Public)
            .map(|n| n.ip_address.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

/// Body of an instance creation request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub ssh_keys: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub fingerprint: String,
}

impl SshKey {
    pub fn matches_public_key(&self, public_key: &str) -> bool {
        public_key_identity(&self.public_key) == public_key_identity(public_key)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Action {
    pub id: u64,
    pub status: ActionStatus,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub resource_id: Option<u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Canonical form of an OpenSSH public key line: `<type> <base64>`.
///
/// Comments and surrounding whitespace are not part of the key identity, so
/// `ssh-rsa AAAA... user@host` and `ssh-rsa AAAA...` compare equal.
pub fn public_key_identity(line: &str) -> String {
    line.split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

// --- Lookups ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    ById(u64),
    ByName(String),
}

impl Lookup {
    pub fn name(name: impl Into<String>) -> Self {
        Lookup::ByName(name.into())
    }

    /// Build a lookup from optional parts. An id wins over a name.
    pub fn from_parts(
        resource: &'static str,
        id: Option<u64>,
        name: Option<&str>,
    ) -> Result<Self, PreconditionError> {
        match (id, name.map(str::trim).filter(|n| !n.is_empty())) {
            (Some(id), _) => Ok(Lookup::ById(id)),
            (None, Some(name)) => Ok(Lookup::ByName(name.to_string())),
            (None, None) => Err(PreconditionError::MissingIdentifier { resource }),
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::ById(id) => write!(f, "id={}", id),
            Lookup::ByName(name) => write!(f, "name={}", name),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("{resource} lookup requires an id or a name")]
    MissingIdentifier { resource: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn droplet_json() -> serde_json::Value {
        serde_json::json!({
            "id": 3164444,
            "name": "gridoon",
            "status": "active",
            "size_slug": "s-1vcpu-1gb",
            "created_at": "2024-11-14T16:29:21Z",
            "networks": {
                "v4": [
                    {"ip_address": "10.128.192.124", "netmask": "255.255.0.0", "gateway": "nil", "type": "private"},
                    {"ip_address": "192.241.165.154", "netmask": "255.255.255.0", "gateway": "192.241.165.1", "type": "public"}
                ],
                "v6": [
                    {"ip_address": "2604:a880:0:1010::18a:a001", "netmask": 64, "gateway": "2604:a880:0:1010::1", "type": "public"}
                ]
            }
        })
    }

    #[test]
    fn instance_exposes_public_ipv4() {
        let instance: Instance = serde_json::from_value(droplet_json()).unwrap();
        assert_eq!(instance.id, 3164444);
        assert!(instance.is_active());
        assert_eq!(instance.public_ipv4(), Some("192.241.165.154"));
    }

    #[test]
    fn instance_without_networks_has_no_ip() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "gridoon",
            "status": "new"
        }))
        .unwrap();
        assert_eq!(instance.status, InstanceStatus::New);
        assert_eq!(instance.public_ipv4(), None);
    }

    #[test]
    fn unknown_statuses_are_preserved_as_other() {
        let status: InstanceStatus = serde_json::from_value(serde_json::json!("resizing")).unwrap();
        assert_eq!(status, InstanceStatus::Other);
        let status: ActionStatus = serde_json::from_value(serde_json::json!("in-progress")).unwrap();
        assert_eq!(status, ActionStatus::InProgress);
        assert!(!status.is_terminal());
    }

    #[test]
    fn public_key_identity_ignores_comment() {
        let key = SshKey {
            id: 1,
            name: "gridoon_root".into(),
            public_key: "ssh-rsa AAAAB3Nza root@laptop\n".into(),
            fingerprint: String::new(),
        };
        assert!(key.matches_public_key("ssh-rsa AAAAB3Nza"));
        assert!(!key.matches_public_key("ssh-rsa AAAAB3Nzb"));
    }

    #[test]
    fn lookup_requires_an_identifier() {
        assert_eq!(
            Lookup::from_parts("droplet", None, Some("gridoon")).unwrap(),
            Lookup::ByName("gridoon".into())
        );
        assert_eq!(
            Lookup::from_parts("droplet", Some(7), Some("gridoon")).unwrap(),
            Lookup::ById(7)
        );
        assert_eq!(
            Lookup::from_parts("ssh key", None, Some("  ")),
            Err(PreconditionError::MissingIdentifier { resource: "ssh key" })
        );
    }
}
