use gridoon_common::PollSettings;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const IP_ADDRESS_KEY: &str = "IP_ADDRESS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} is not valid: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("cannot update env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Secrets and identities read from the environment. `Debug` never prints secrets.
#[derive(Clone)]
pub struct Credentials {
    pub api_token: String,
    pub github_username: String,
    pub github_token: String,
    pub server_username: String,
    pub server_password: String,
    pub root_password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_token", &"<redacted>")
            .field("github_username", &self.github_username)
            .field("github_token", &"<redacted>")
            .field("server_username", &self.server_username)
            .field("server_password", &"<redacted>")
            .field("root_password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub name: String,
    pub ready_status: String,
}

impl ContainerTarget {
    pub fn new(name: &str, ready_status: &str) -> Self {
        Self {
            name: name.to_string(),
            ready_status: ready_status.to_string(),
        }
    }
}

/// Fixed resource names and sizes of the one application this tool deploys.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    pub instance_name: String,
    pub region: String,
    pub image: String,
    /// Size the site runs on.
    pub small_size: String,
    /// Size used while building images on the host.
    pub large_size: String,
    pub root_key_name: String,
    pub operator_key_name: String,
    pub repository: String,
    pub compose_project: String,
    pub tags: Vec<String>,
    pub containers: Vec<ContainerTarget>,
}

impl Default for ResourcePlan {
    fn default() -> Self {
        Self {
            instance_name: "gridoon".into(),
            region: "tor1".into(),
            image: "ubuntu-24-04-x64".into(),
            small_size: "s-1vcpu-1gb".into(),
            large_size: "s-2vcpu-2gb".into(),
            root_key_name: "gridoon_root".into(),
            operator_key_name: "gridoon_user".into(),
            repository: "https://github.com/hashtagbowl/Gridoon".into(),
            compose_project: "gridoon-website".into(),
            tags: vec!["gridoon".into()],
            containers: vec![
                // One-shot build container.
                ContainerTarget::new("gridoon-nodejs", "exited"),
                ContainerTarget::new("gridoon-nginx-certbot", "running"),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub action: PollSettings,
    pub instance_active: PollSettings,
    pub boot: PollSettings,
    pub readiness: PollSettings,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            action: PollSettings::from_secs(300, 5),
            instance_active: PollSettings::from_secs(300, 5),
            boot: PollSettings::from_secs(600, 5),
            readiness: PollSettings::from_secs(600, 5),
            connect_attempts: 10,
            connect_delay: Duration::from_secs(7),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub credentials: Credentials,
    pub email: String,
    pub domain: String,
    /// Address discovered by a previous run.
    pub cached_ip: Option<String>,
    pub provider: String,
    pub api_url: Option<String>,
    pub key_dir: PathBuf,
    pub template_dir: Option<PathBuf>,
    pub plan: ResourcePlan,
    pub timeouts: Timeouts,
}

impl DeployConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source (process env in `main`, a map in tests).
    pub fn from_source<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let opt = |name: &str| {
            get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| opt(name).ok_or(ConfigError::Missing(name));
        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let secret = |name: &'static str| -> Result<String, ConfigError> {
            let file_var = format!("{}_FILE", name);
            if let Some(path) = opt(&file_var) {
                let value = fs::read_to_string(&path).map_err(|e| ConfigError::Invalid {
                    var: name,
                    reason: format!("cannot read {}: {}", path, e),
                })?;
                let value = value.trim().to_string();
                if !value.is_empty() {
                    return Ok(value);
                }
            }
            required(name)
        };

        let credentials = Credentials {
            api_token: secret("DO_TOKEN")?,
            github_username: required("GITHUB_USERNAME")?,
            github_token: secret("GITHUB_TOKEN")?,
            server_username: required("SERVER_USERNAME")?,
            server_password: secret("SERVER_PASSWORD")?,
            root_password: secret("ROOT_PASSWORD")?,
        };
        if credentials.server_username == "root" {
            return Err(ConfigError::Invalid {
                var: "SERVER_USERNAME",
                reason: "the operator account must not be root".into(),
            });
        }
        if !is_valid_username(&credentials.server_username) {
            return Err(ConfigError::Invalid {
                var: "SERVER_USERNAME",
                reason: "expected a lowercase POSIX user name".into(),
            });
        }

        let mut plan = ResourcePlan::default();
        let overrides: [(&str, &mut String); 9] = [
            ("GRIDOON_INSTANCE_NAME", &mut plan.instance_name),
            ("GRIDOON_REGION", &mut plan.region),
            ("GRIDOON_IMAGE", &mut plan.image),
            ("GRIDOON_SMALL_SIZE", &mut plan.small_size),
            ("GRIDOON_LARGE_SIZE", &mut plan.large_size),
            ("GRIDOON_ROOT_KEY_NAME", &mut plan.root_key_name),
            ("GRIDOON_OPERATOR_KEY_NAME", &mut plan.operator_key_name),
            ("GRIDOON_REPOSITORY", &mut plan.repository),
            ("GRIDOON_COMPOSE_PROJECT", &mut plan.compose_project),
        ];
        for (var, slot) in overrides {
            if let Some(v) = opt(var) {
                *slot = v;
            }
        }
        if plan.root_key_name == plan.operator_key_name {
            return Err(ConfigError::Invalid {
                var: "GRIDOON_OPERATOR_KEY_NAME",
                reason: "root and operator keys must have different names".into(),
            });
        }

        Ok(Self {
            credentials,
            email: required("EMAIL")?,
            domain: required("DOMAIN")?,
            cached_ip: opt(IP_ADDRESS_KEY),
            provider: opt("PROVIDER").unwrap_or_else(|| "digitalocean".to_string()),
            api_url: opt("DIGITALOCEAN_API_URL"),
            key_dir: opt("GRIDOON_KEY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("keys")),
            template_dir: opt("GRIDOON_TEMPLATE_DIR").map(PathBuf::from),
            plan,
            timeouts: Timeouts::default(),
        })
    }
}

/// Load `.env` (or `GRIDOON_ENV_FILE`) into the process environment.
/// Returns the file that was loaded, which doubles as the IP cache.
pub fn load_env_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GRIDOON_ENV_FILE") {
        let path = PathBuf::from(path.trim());
        return match dotenv::from_path(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("⚠️ [config] Cannot load {}: {}", path.display(), e);
                None
            }
        };
    }
    dotenv::dotenv().ok()
}

/// Line-preserving editor for an environment-style `KEY=value` file.
#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.read_lines()?.iter().find_map(|line| {
            parse_assignment(line)
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| unquote(v).to_string())
        }))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut lines = self.lines_without(key)?;
        lines.push(format!("{}={}", key, value));
        self.write_lines(&lines)
    }

    pub fn unset(&self, key: &str) -> Result<(), ConfigError> {
        let lines = self.lines_without(key)?;
        self.write_lines(&lines)
    }

    fn lines_without(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter(|line| parse_assignment(line).map_or(true, |(k, _)| k != key))
            .collect())
    }

    fn read_lines(&self) -> Result<Vec<String>, ConfigError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), ConfigError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        for line in lines {
            writeln!(tmp, "{}", line).map_err(|e| self.io_error(e))?;
        }
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::EnvFile {
            path: self.path.clone(),
            source,
        }
    }
}

/// `[a-z_][a-z0-9_-]*`, at most 32 characters.
fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    first_ok
        && name.len() <= 32
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn unquote(value: &str) -> &str {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("DO_TOKEN", "dop_v1_token".to_string()),
            ("EMAIL", "ops@example.org".to_string()),
            ("DOMAIN", "example.org".to_string()),
            ("GITHUB_USERNAME", "octo".to_string()),
            ("GITHUB_TOKEN", "ghp_token".to_string()),
            ("SERVER_USERNAME", "deploy".to_string()),
            ("SERVER_PASSWORD", "hunter2".to_string()),
            ("ROOT_PASSWORD", "rootpw".to_string()),
        ])
    }

    #[test]
    fn reads_required_values_and_defaults() {
        let vars = base_vars();
        let config = DeployConfig::from_source(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.domain, "example.org");
        assert_eq!(config.provider, "digitalocean");
        assert_eq!(config.plan.instance_name, "gridoon");
        assert_eq!(config.plan.large_size, "s-2vcpu-2gb");
        assert_eq!(config.key_dir, PathBuf::from("keys"));
        assert!(config.cached_ip.is_none());
    }

    #[test]
    fn missing_value_is_named() {
        let mut vars = base_vars();
        vars.remove("DOMAIN");
        let err = DeployConfig::from_source(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DOMAIN")));
    }

    #[test]
    fn operator_name_must_be_a_plain_user() {
        for bad in ["root", "Deploy", "de ploy", "1deploy"] {
            let mut vars = base_vars();
            vars.insert("SERVER_USERNAME", bad.to_string());
            let err = DeployConfig::from_source(|k| vars.get(k).cloned()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { var: "SERVER_USERNAME", .. }), "{bad}");
        }
    }

    #[test]
    fn secret_file_wins_over_variable() {
        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token");
        fs::write(&token_file, "from-file\n").unwrap();

        let mut vars = base_vars();
        vars.insert("DO_TOKEN_FILE", token_file.display().to_string());
        let config = DeployConfig::from_source(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.credentials.api_token, "from-file");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let vars = base_vars();
        let config = DeployConfig::from_source(|k| vars.get(k).cloned()).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("dop_v1_token"));
    }

    #[test]
    fn env_file_replaces_ip_and_keeps_other_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "# deploy\nDOMAIN=example.org\nIP_ADDRESS=\"198.51.100.4\"\n").unwrap();

        let env = EnvFile::new(&path);
        assert_eq!(env.get(IP_ADDRESS_KEY).unwrap().as_deref(), Some("198.51.100.4"));

        env.unset(IP_ADDRESS_KEY).unwrap();
        assert_eq!(env.get(IP_ADDRESS_KEY).unwrap(), None);
        env.set(IP_ADDRESS_KEY, "203.0.113.7").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "# deploy\nDOMAIN=example.org\nIP_ADDRESS=203.0.113.7\n");
    }
}
