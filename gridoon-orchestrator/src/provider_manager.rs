use crate::config::DeployConfig;
use anyhow::bail;
use gridoon_providers::CloudProvider;
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    pub fn get_provider(config: &DeployConfig) -> anyhow::Result<Arc<dyn CloudProvider>> {
        match config.provider.to_lowercase().as_str() {
            #[cfg(feature = "provider-digitalocean")]
            "digitalocean" => {
                use gridoon_providers::digitalocean::{DigitalOceanProvider, DEFAULT_API_URL};
                let base_url = config.api_url.as_deref().unwrap_or(DEFAULT_API_URL);
                let provider = DigitalOceanProvider::with_base_url(&config.credentials.api_token, base_url)?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                tracing::warn!("⚠️ [provider] Using the in-memory mock provider, nothing will be deployed");
                Ok(Arc::new(gridoon_providers::mock::MockProvider::new()))
            }
            // Add other providers here.
            other => bail!("provider {} is not available in this build", other),
        }
    }
}
