use crate::envelope::ApiEnvelope;
use crate::error::{ProviderError, ProviderResult};
use crate::CloudProvider;
use async_trait::async_trait;
use gridoon_common::{Action, Instance, InstanceSpec, Lookup, PowerAction, SshKey};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com/v2";
const DEFAULT_PAGE_SIZE: usize = 200;
const LABEL: &str = "DigitalOcean API";

#[derive(Debug, Deserialize)]
struct DropletBody {
    droplet: Instance,
}

#[derive(Debug, Deserialize)]
struct ActionBody {
    action: Action,
}

#[derive(Debug, Deserialize)]
struct KeyBody {
    ssh_key: SshKey,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DropletsPage {
    droplets: Vec<Instance>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct KeysPage {
    ssh_keys: Vec<SshKey>,
    #[serde(default)]
    meta: Meta,
}

trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<usize>);
}

impl Page for DropletsPage {
    type Item = Instance;
    fn into_parts(self) -> (Vec<Instance>, Option<usize>) {
        (self.droplets, self.meta.total)
    }
}

impl Page for KeysPage {
    type Item = SshKey;
    fn into_parts(self) -> (Vec<SshKey>, Option<usize>) {
        (self.ssh_keys, self.meta.total)
    }
}

pub struct DigitalOceanProvider {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    page_size: usize,
}

impl DigitalOceanProvider {
    pub fn new(token: &str) -> ProviderResult<Self> {
        Self::with_base_url(token, DEFAULT_API_URL)
    }

    pub fn with_base_url(token: &str, base_url: &str) -> ProviderResult<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ProviderError::InvalidCredentials("empty API token".into()));
        }
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ProviderError::InvalidCredentials("token is not a valid header value".into()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Default reqwest client has no overall timeout. If the API stalls, the run hangs forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| ProviderError::Transport {
                operation: "build http client",
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send one request and decode its envelope. `Ok(None)` means an empty
    /// success body (e.g. `204 No Content` on delete).
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> ProviderResult<Option<T>> {
        let url = self.url(path);
        tracing::debug!("🔵 [{}] {} {} - {}", LABEL, method, url, operation);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .headers(self.headers.clone());
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|source| ProviderError::Transport { operation, source })?;
        let status = resp.status();
        let status_code = status.as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|source| ProviderError::Transport { operation, source })?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            if status.is_success() {
                tracing::debug!("✅ [{}] {} {} succeeded: status={}", LABEL, method, url, status_code);
                return Ok(None);
            }
            tracing::error!("❌ [{}] {} {} failed: status={} (empty body)", LABEL, method, url, status_code);
            return Err(ProviderError::Http {
                operation,
                status: status_code,
                body: String::new(),
            });
        }

        let decoded = match ApiEnvelope::<T>::decode(operation, &bytes) {
            Ok(envelope) => envelope.into_result(operation, status_code),
            Err(_) if !status.is_success() => Err(ProviderError::Http {
                operation,
                status: status_code,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            Err(e) => Err(e),
        };

        match &decoded {
            Ok(_) => tracing::debug!("✅ [{}] {} {} succeeded: status={}", LABEL, method, url, status_code),
            Err(e) => tracing::error!("❌ [{}] {} {} failed: {}", LABEL, method, url, e),
        }
        decoded.map(Some)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<T> {
        self.call(operation, method, path, &[], body)
            .await?
            .ok_or_else(|| ProviderError::MalformedResponse {
                operation,
                detail: "empty response body".into(),
            })
    }

    async fn list_all<P: Page>(&self, operation: &'static str, path: &str) -> ProviderResult<Vec<P::Item>> {
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let query = [("page", page.to_string()), ("per_page", self.page_size.to_string())];
            let body: P = self
                .call(operation, Method::GET, path, &query, None)
                .await?
                .ok_or_else(|| ProviderError::MalformedResponse {
                    operation,
                    detail: "empty list page".into(),
                })?;
            let (batch, total) = body.into_parts();
            let batch_len = batch.len();
            items.extend(batch);

            let more = match total {
                Some(total) => items.len() < total,
                None => false,
            };
            if !more || batch_len == 0 {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    async fn post_action(
        &self,
        operation: &'static str,
        instance_id: u64,
        body: serde_json::Value,
    ) -> ProviderResult<u64> {
        let path = format!("/droplets/{}/actions", instance_id);
        let resp: ActionBody = self
            .call_required(operation, Method::POST, &path, Some(body))
            .await?;
        tracing::info!(
            "✅ [{}] Action accepted: {} {} (action_id={}, status={:?})",
            LABEL,
            resp.action.kind,
            instance_id,
            resp.action.id,
            resp.action.status
        );
        Ok(resp.action.id)
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn label(&self) -> &'static str {
        LABEL
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<Instance> {
        // user_data carries passwords, never log the body.
        tracing::info!(
            "🔵 [{}] Creating droplet: name={}, region={}, size={}, image={}, has_user_data={}",
            LABEL,
            spec.name,
            spec.region,
            spec.size,
            spec.image,
            spec.user_data.is_some()
        );
        let body = serde_json::to_value(spec).map_err(|e| ProviderError::MalformedResponse {
            operation: "create droplet",
            detail: format!("cannot encode request: {}", e),
        })?;
        let resp: DropletBody = self
            .call_required("create droplet", Method::POST, "/droplets", Some(body))
            .await?;
        tracing::info!(
            "✅ [{}] Successfully created droplet {} (id={}, status={})",
            LABEL,
            resp.droplet.name,
            resp.droplet.id,
            resp.droplet.status
        );
        Ok(resp.droplet)
    }

    async fn get_instance(&self, lookup: &Lookup) -> ProviderResult<Option<Instance>> {
        match lookup {
            Lookup::ById(id) => {
                let path = format!("/droplets/{}", id);
                match self.call::<DropletBody>("get droplet", Method::GET, &path, &[], None).await {
                    Ok(Some(body)) => Ok(Some(body.droplet)),
                    Ok(None) => Err(ProviderError::MalformedResponse {
                        operation: "get droplet",
                        detail: "empty response body".into(),
                    }),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Lookup::ByName(name) => {
                let found = self
                    .list_instances()
                    .await?
                    .into_iter()
                    .find(|d| &d.name == name);
                match &found {
                    Some(d) => tracing::info!("✅ [{}] Droplet {} fetched (id={})", LABEL, d.name, d.id),
                    None => tracing::info!("ℹ️ [{}] Droplet {} could not be found", LABEL, name),
                }
                Ok(found)
            }
        }
    }

    async fn list_instances(&self) -> ProviderResult<Vec<Instance>> {
        let droplets = self.list_all::<DropletsPage>("list droplets", "/droplets").await?;
        tracing::debug!("[{}] {} droplets fetched", LABEL, droplets.len());
        Ok(droplets)
    }

    async fn resize(&self, instance_id: u64, size: &str) -> ProviderResult<u64> {
        // disk=false keeps the resize reversible (CPU/RAM only).
        self.post_action(
            "resize droplet",
            instance_id,
            json!({ "type": "resize", "size": size, "disk": false }),
        )
        .await
    }

    async fn power(&self, instance_id: u64, action: PowerAction) -> ProviderResult<u64> {
        self.post_action("power droplet", instance_id, json!({ "type": action.as_str() }))
            .await
    }

    async fn get_action(&self, action_id: u64) -> ProviderResult<Action> {
        let path = format!("/actions/{}", action_id);
        let resp: ActionBody = self.call_required("get action", Method::GET, &path, None).await?;
        Ok(resp.action)
    }

    async fn create_key(&self, public_key: &str, name: &str) -> ProviderResult<SshKey> {
        let body = json!({ "name": name, "public_key": public_key.trim() });
        let resp: KeyBody = self
            .call_required("create ssh key", Method::POST, "/account/keys", Some(body))
            .await?;
        tracing::info!("✅ [{}] SSH key {} uploaded (id={})", LABEL, resp.ssh_key.name, resp.ssh_key.id);
        Ok(resp.ssh_key)
    }

    async fn get_key(&self, lookup: &Lookup) -> ProviderResult<Option<SshKey>> {
        match lookup {
            Lookup::ById(id) => {
                let path = format!("/account/keys/{}", id);
                match self.call::<KeyBody>("get ssh key", Method::GET, &path, &[], None).await {
                    Ok(Some(body)) => Ok(Some(body.ssh_key)),
                    Ok(None) => Err(ProviderError::MalformedResponse {
                        operation: "get ssh key",
                        detail: "empty response body".into(),
                    }),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Lookup::ByName(name) => {
                let found = self.list_keys().await?.into_iter().find(|k| &k.name == name);
                if found.is_none() {
                    tracing::info!("ℹ️ [{}] SSH key {} could not be found", LABEL, name);
                }
                Ok(found)
            }
        }
    }

    async fn list_keys(&self) -> ProviderResult<Vec<SshKey>> {
        self.list_all::<KeysPage>("list ssh keys", "/account/keys").await
    }

    async fn delete_key(&self, key_id: u64) -> ProviderResult<bool> {
        let path = format!("/account/keys/{}", key_id);
        self.call::<serde_json::Value>("delete ssh key", Method::DELETE, &path, &[], None)
            .await?;
        tracing::info!("🗑️ [{}] SSH key {} deleted", LABEL, key_id);
        Ok(true)
    }
}
