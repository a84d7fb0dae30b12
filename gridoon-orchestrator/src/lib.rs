// Library entry point for tests and the deploy binary.

pub mod config;
pub mod deploy;
pub mod keys;
pub mod logger;
pub mod provider_manager;
pub mod ssh;
pub mod state_machine;
pub mod templates;

pub use config::DeployConfig;
pub use deploy::{resize_with_power_cycle, Deployer, DeploymentReport};
