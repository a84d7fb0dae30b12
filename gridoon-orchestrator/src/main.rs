use gridoon_orchestrator::config::{self, DeployConfig, EnvFile};
use gridoon_orchestrator::deploy::Deployer;
use gridoon_orchestrator::provider_manager::ProviderManager;
use gridoon_orchestrator::ssh::OpenSshConnector;
use gridoon_orchestrator::templates::TemplateSet;
use std::process::ExitCode;
use std::sync::Arc;

async fn run() -> anyhow::Result<bool> {
    let env_path = config::load_env_file();
    let config = DeployConfig::from_env()?;
    tracing::info!("🔧 [config] Provider={} instance={} domain={}", config.provider, config.plan.instance_name, config.domain);

    let provider = ProviderManager::get_provider(&config)?;
    let templates = match &config.template_dir {
        Some(dir) => TemplateSet::load(dir)?,
        None => TemplateSet::embedded(),
    };

    let mut deployer = Deployer::new(config, provider, Arc::new(OpenSshConnector::default())).with_templates(templates);
    if let Some(path) = env_path {
        deployer = deployer.with_ip_cache(EnvFile::new(path));
    }

    match deployer.run().await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.all_ready())
        }
        Err(e) => {
            let steps = deployer.logger().records();
            eprintln!("{}", serde_json::to_string_pretty(&steps)?);
            Err(e)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            tracing::warn!("⚠️ [deploy] Finished, but some containers never reported ready");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("❌ [deploy] Deployment failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
