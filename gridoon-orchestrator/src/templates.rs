// Cloud-init and remote shell templates.
//
// Templates use `{{name}}` placeholders. Values are escaped for the target
// language (YAML scalar or single-quoted shell word) before substitution.
// Anything between braces that is not a plain identifier, such as docker's
// `{{.State.Status}}`, is left untouched.

use std::path::Path;

const CLOUD_INIT: &str = include_str!("../templates/cloud-init.yaml");
const BOOTSTRAP: &str = include_str!("../templates/bootstrap.sh");
const REBUILD: &str = include_str!("../templates/rebuild.sh");

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template {template} references unknown value {key}")]
    Unresolved { template: &'static str, key: String },
    #[error("cannot read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rendered cloud-init is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("rendered cloud-init is invalid: {0}")]
    CloudInit(String),
}

/// Single-quote `s` for bash.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Double-quoted YAML scalar. JSON string syntax is a subset of YAML's.
pub fn yaml_scalar(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn is_identifier(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Substitute `{{key}}` placeholders. Values must already be escaped.
pub fn render(template: &'static str, text: &str, vars: &[(&str, String)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = after[..end].trim();
        if is_identifier(key) {
            let value = vars
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| TemplateError::Unresolved {
                    template,
                    key: key.to_string(),
                })?;
            out.push_str(value);
        } else {
            out.push_str(&rest[start..start + 2 + end + 2]);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct CloudInitValues<'a> {
    pub server_username: &'a str,
    pub server_password: &'a str,
    pub root_password: &'a str,
    pub operator_public_key: &'a str,
}

#[derive(Debug, Clone)]
pub struct BootstrapValues<'a> {
    pub github_username: &'a str,
    pub github_token: &'a str,
    pub email: &'a str,
    pub domain: &'a str,
    pub repository: &'a str,
    pub compose_project: &'a str,
}

#[derive(Debug, Clone)]
pub struct TemplateSet {
    cloud_init: String,
    bootstrap: String,
    rebuild: String,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::embedded()
    }
}

impl TemplateSet {
    pub fn embedded() -> Self {
        Self {
            cloud_init: CLOUD_INIT.to_string(),
            bootstrap: BOOTSTRAP.to_string(),
            rebuild: REBUILD.to_string(),
        }
    }

    /// Embedded templates, each replaced by the same-named file in `dir` when present.
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let mut set = Self::embedded();
        for (file, slot) in [
            ("cloud-init.yaml", &mut set.cloud_init),
            ("bootstrap.sh", &mut set.bootstrap),
            ("rebuild.sh", &mut set.rebuild),
        ] {
            let path = dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    tracing::info!("📄 [templates] Using {}", path.display());
                    *slot = content;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(TemplateError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(set)
    }

    pub fn cloud_init(&self, values: &CloudInitValues<'_>) -> Result<String, TemplateError> {
        let rendered = render(
            "cloud-init",
            &self.cloud_init,
            &[
                // Validated as a POSIX user name, safe unquoted in YAML and shell.
                ("server_username", values.server_username.to_string()),
                ("server_password", yaml_scalar(values.server_password)),
                ("root_password", yaml_scalar(values.root_password)),
                ("operator_public_key", yaml_scalar(values.operator_public_key)),
            ],
        )?;
        validate_cloud_init(&rendered, values.server_username, values.operator_public_key)?;
        Ok(rendered)
    }

    pub fn bootstrap(&self, values: &BootstrapValues<'_>) -> Result<String, TemplateError> {
        render(
            "bootstrap",
            &self.bootstrap,
            &[
                ("github_username", sh_quote(values.github_username)),
                ("github_token", sh_quote(values.github_token)),
                ("email", sh_quote(values.email)),
                ("domain", sh_quote(values.domain)),
                ("repository", sh_quote(values.repository)),
                ("compose_project", sh_quote(values.compose_project)),
            ],
        )
    }

    pub fn rebuild(&self, compose_project: &str, containers: &[&str]) -> Result<String, TemplateError> {
        render(
            "rebuild",
            &self.rebuild,
            &[
                ("compose_project", sh_quote(compose_project)),
                ("containers", sh_quote(&containers.join(" "))),
            ],
        )
    }
}

/// Check that rendered user-data parses and provisions the operator with its key.
pub fn validate_cloud_init(text: &str, username: &str, public_key: &str) -> Result<(), TemplateError> {
    if !text.trim_start().starts_with("#cloud-config") {
        return Err(TemplateError::CloudInit("missing #cloud-config header".into()));
    }
    let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
    let users = doc
        .get("users")
        .and_then(|u| u.as_sequence())
        .ok_or_else(|| TemplateError::CloudInit("no users section".into()))?;
    let operator = users
        .iter()
        .find(|u| u.get("name").and_then(|n| n.as_str()) == Some(username))
        .ok_or_else(|| TemplateError::CloudInit(format!("user {} is not provisioned", username)))?;
    let has_key = operator
        .get("ssh_authorized_keys")
        .and_then(|k| k.as_sequence())
        .map_or(false, |keys| keys.iter().any(|k| k.as_str() == Some(public_key.trim())));
    if !has_key {
        return Err(TemplateError::CloudInit(format!(
            "user {} has no authorized key matching the operator key",
            username
        )));
    }
    Ok(())
}
