// Local key pairs and their registration at the provider.
//
// The local pair is the source of truth: a provider key with the same name
// but a different public half is deleted and replaced.

use async_trait::async_trait;
use gridoon_common::{public_key_identity, Lookup, SshKey};
use gridoon_providers::{CloudProvider, ProviderError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub const PRIVATE_KEY_EXT: &str = "pk";
pub const PUBLIC_KEY_EXT: &str = "pubk";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh-keygen failed for {name}: {detail}")]
    Generation { name: String, detail: String },
    #[error("public key file {0} does not hold an OpenSSH public key")]
    InvalidPublicKey(PathBuf),
    #[error("provider rejected key {name}: {source}")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },
}

/// Key pair on disk, named by role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalKeyPair {
    pub name: String,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// `<type> <base64>` without comment.
    pub public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    Unchanged,
    Uploaded,
    /// The provider held a different key under the same name.
    Rotated,
}

#[derive(Debug, Clone)]
pub struct VerifiedKey {
    pub provider_key: SshKey,
    pub local: LocalKeyPair,
    pub reconciliation: Reconciliation,
}

impl VerifiedKey {
    pub fn id(&self) -> u64 {
        self.provider_key.id
    }
}

/// Writes a fresh key pair to the given paths.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, name: &str, private_key_path: &Path, public_key_path: &Path) -> Result<(), KeyError>;
}

/// 4096-bit RSA pairs through the local `ssh-keygen` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeygen;

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, name: &str, private_key_path: &Path, public_key_path: &Path) -> Result<(), KeyError> {
        // ssh-keygen writes `<file>` and `<file>.pub`; work in a scratch dir and move.
        let scratch = tempfile::tempdir().map_err(|source| KeyError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        let scratch_key = scratch.path().join("id_rsa");

        let output = Command::new("ssh-keygen")
            .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-m", "PEM", "-C", name])
            .arg("-f")
            .arg(&scratch_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KeyError::Generation {
                name: name.to_string(),
                detail: format!("cannot spawn ssh-keygen: {}", e),
            })?;
        if !output.status.success() {
            return Err(KeyError::Generation {
                name: name.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let private = read_file(&scratch_key).await?;
        let public = read_file(&scratch_key.with_extension("pub")).await?;
        write_private_key(private_key_path, &private).await?;
        write_file(public_key_path, &format!("{}\n", public_key_identity(&public))).await?;
        Ok(())
    }
}

async fn read_file(path: &Path) -> Result<String, KeyError> {
    tokio::fs::read_to_string(path).await.map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn write_file(path: &Path, content: &str) -> Result<(), KeyError> {
    tokio::fs::write(path, content).await.map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Created owner-only; an existing file is truncated and tightened to 0600.
pub async fn write_private_key(path: &Path, content: &str) -> Result<(), KeyError> {
    use tokio::io::AsyncWriteExt;

    let io_err = |source: std::io::Error| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await.map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }
    file.write_all(content.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

async fn exists(path: &Path) -> Result<bool, KeyError> {
    tokio::fs::try_exists(path).await.map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Directory of `<name>.pk` / `<name>.pubk` files.
pub struct KeyStore {
    dir: PathBuf,
    generator: Box<dyn KeyGenerator>,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, generator: Box<dyn KeyGenerator>) -> Self {
        Self {
            dir: dir.into(),
            generator,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, name: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.{}", name, PRIVATE_KEY_EXT)),
            self.dir.join(format!("{}.{}", name, PUBLIC_KEY_EXT)),
        )
    }

    /// Read the named pair, generating it when missing. A lone half is
    /// discarded and both halves are regenerated.
    pub async fn load_or_generate(&self, name: &str) -> Result<LocalKeyPair, KeyError> {
        let (private_key_path, public_key_path) = self.paths(name);
        let has_private = exists(&private_key_path).await?;
        let has_public = exists(&public_key_path).await?;

        if has_private != has_public {
            let orphan = if has_private { &private_key_path } else { &public_key_path };
            tracing::warn!(
                "⚠️ [keys] Only one half of key {} found ({}), regenerating the pair",
                name,
                orphan.display()
            );
            tokio::fs::remove_file(orphan).await.map_err(|source| KeyError::Io {
                path: orphan.clone(),
                source,
            })?;
        }

        if !(has_private && has_public) {
            tokio::fs::create_dir_all(&self.dir).await.map_err(|source| KeyError::Io {
                path: self.dir.clone(),
                source,
            })?;
            tracing::info!("🔑 [keys] Generating key pair {} in {}", name, self.dir.display());
            self.generator
                .generate(name, &private_key_path, &public_key_path)
                .await?;
        }

        let public_key = public_key_identity(&read_file(&public_key_path).await?);
        if public_key.split_whitespace().count() != 2 {
            return Err(KeyError::InvalidPublicKey(public_key_path));
        }
        Ok(LocalKeyPair {
            name: name.to_string(),
            private_key_path,
            public_key_path,
            public_key,
        })
    }
}

pub struct KeyManager<'a> {
    store: &'a KeyStore,
    provider: &'a dyn CloudProvider,
}

impl<'a> KeyManager<'a> {
    pub fn new(store: &'a KeyStore, provider: &'a dyn CloudProvider) -> Self {
        Self { store, provider }
    }

    /// Make the provider hold exactly the local public key under `name`.
    pub async fn verify_keys(&self, name: &str) -> Result<VerifiedKey, KeyError> {
        let result = self.reconcile(name).await;
        if let Err(e) = &result {
            tracing::error!("❌ [keys] Key verification failed for {}: {}", name, error_chain(e));
        }
        result
    }

    async fn reconcile(&self, name: &str) -> Result<VerifiedKey, KeyError> {
        let provider_err = |source| KeyError::Provider {
            name: name.to_string(),
            source,
        };
        let lookup = Lookup::from_parts("ssh key", None, Some(name))
            .map_err(|e| provider_err(ProviderError::from(e)))?;
        let local = self.store.load_or_generate(name).await?;

        let remote = self
            .provider
            .get_key(&lookup)
            .await
            .map_err(provider_err)?;

        let reconciliation = match &remote {
            Some(key) if key.matches_public_key(&local.public_key) => {
                tracing::info!("✅ [keys] Key {} already registered (id={})", name, key.id);
                return Ok(VerifiedKey {
                    provider_key: key.clone(),
                    local,
                    reconciliation: Reconciliation::Unchanged,
                });
            }
            Some(key) => {
                tracing::warn!(
                    "🔄 [keys] Provider key {} (id={}) differs from the local key, replacing it",
                    name,
                    key.id
                );
                self.provider.delete_key(key.id).await.map_err(provider_err)?;
                Reconciliation::Rotated
            }
            None => Reconciliation::Uploaded,
        };

        let provider_key = self
            .provider
            .create_key(&local.public_key, name)
            .await
            .map_err(provider_err)?;
        tracing::info!("✅ [keys] Uploaded key {} (id={})", name, provider_key.id);
        Ok(VerifiedKey {
            provider_key,
            local,
            reconciliation,
        })
    }
}

/// Render the full source chain of an error on one line.
fn error_chain(e: &KeyError) -> String {
    let mut out = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridoon_providers::mock::{MockCall, MockProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Deterministic pairs: `ssh-rsa GEN<n>`.
    #[derive(Default)]
    struct CountingGenerator {
        generated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KeyGenerator for CountingGenerator {
        async fn generate(&self, name: &str, private_key_path: &Path, public_key_path: &Path) -> Result<(), KeyError> {
            let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
            write_private_key(private_key_path, &format!("PRIVATE {} {}\n", name, n)).await?;
            write_file(public_key_path, &format!("ssh-rsa GEN{}\n", n)).await
        }
    }

    fn store(dir: &Path) -> (KeyStore, Arc<AtomicUsize>) {
        let generator = CountingGenerator::default();
        let counter = generator.generated.clone();
        (KeyStore::new(dir, Box::new(generator)), counter)
    }

    #[tokio::test]
    async fn uploads_missing_key_then_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, generated) = store(dir.path());
        let provider = MockProvider::new();
        let manager = KeyManager::new(&store, &provider);

        let first = manager.verify_keys("gridoon_root").await.unwrap();
        assert_eq!(first.reconciliation, Reconciliation::Uploaded);
        assert_eq!(first.provider_key.public_key, first.local.public_key);
        assert_eq!(generated.load(Ordering::SeqCst), 1);

        provider.clear_calls();
        let second = manager.verify_keys("gridoon_root").await.unwrap();
        assert_eq!(second.reconciliation, Reconciliation::Unchanged);
        assert_eq!(second.id(), first.id());
        assert!(provider.calls().is_empty());
        assert_eq!(generated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn differing_remote_key_is_deleted_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let provider = MockProvider::new();
        let stale = provider.seed_key("gridoon_root", "ssh-rsa STALE old@laptop");

        let verified = KeyManager::new(&store, &provider)
            .verify_keys("gridoon_root")
            .await
            .unwrap();

        assert_eq!(verified.reconciliation, Reconciliation::Rotated);
        assert_eq!(
            provider.calls(),
            vec![
                MockCall::DeleteKey { key_id: stale.id },
                MockCall::CreateKey {
                    name: "gridoon_root".into(),
                    public_key: "ssh-rsa GEN1".into(),
                },
            ]
        );
        let keys = provider.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].matches_public_key(&verified.local.public_key));
    }

    #[tokio::test]
    async fn remote_comment_does_not_trigger_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let (private, public) = store.paths("gridoon_user");
        std::fs::write(&private, "PRIVATE").unwrap();
        std::fs::write(&public, "ssh-rsa AAAAB3 deploy@ci\n").unwrap();

        let provider = MockProvider::new();
        provider.seed_key("gridoon_user", "ssh-rsa AAAAB3 someone@else");

        let verified = KeyManager::new(&store, &provider)
            .verify_keys("gridoon_user")
            .await
            .unwrap();
        assert_eq!(verified.reconciliation, Reconciliation::Unchanged);
        assert_eq!(verified.local.public_key, "ssh-rsa AAAAB3");
    }

    #[tokio::test]
    async fn orphaned_half_regenerates_both() {
        let dir = tempfile::tempdir().unwrap();
        let (store, generated) = store(dir.path());
        let (private, public) = store.paths("gridoon_root");
        std::fs::write(&public, "ssh-rsa ORPHAN\n").unwrap();

        let pair = store.load_or_generate("gridoon_root").await.unwrap();
        assert_eq!(generated.load(Ordering::SeqCst), 1);
        assert_eq!(pair.public_key, "ssh-rsa GEN1");
        assert!(private.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&private).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn garbage_public_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let (private, public) = store.paths("gridoon_root");
        std::fs::write(&private, "PRIVATE").unwrap();
        std::fs::write(&public, "not-a-key").unwrap();

        let err = store.load_or_generate("gridoon_root").await.unwrap_err();
        assert!(matches!(err, KeyError::InvalidPublicKey(_)));
    }

    #[tokio::test]
    async fn blank_key_name_is_rejected_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let (store, generated) = store(dir.path());
        let provider = MockProvider::new();

        let err = KeyManager::new(&store, &provider).verify_keys("  ").await.unwrap_err();

        assert!(matches!(
            err,
            KeyError::Provider {
                source: ProviderError::Precondition(_),
                ..
            }
        ));
        assert_eq!(generated.load(Ordering::SeqCst), 0);
        assert!(provider.calls().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rewritten_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridoon_root.pk");
        std::fs::write(&path, "OLD PRIVATE KEY WITH A LONGER BODY").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_private_key(&path, "NEW").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "NEW");
    }
}
