pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod models;
pub mod pagination;
pub mod query;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod templates;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the gateway using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
