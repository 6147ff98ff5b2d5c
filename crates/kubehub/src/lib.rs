//! Cartographer kubehub – kube-rs backed repository, discovery, watches, tokens and events

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{Client, Config};

pub mod cache;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod repository;
pub mod tokens;
pub mod watch;

pub use discovery::ApiResolver;
pub use events::KubeEventRecorder;
pub use repository::{KubeRepository, KubeRepositoryBuilder};
pub use tokens::{KubeTokenMinter, TokenCache, TokenMinter};
pub use watch::WatchHub;

/// Infer the controller's own client configuration (kubeconfig or in-cluster).
pub async fn infer_config() -> Result<Config> {
    Config::infer().await.context("inferring kube config")
}

pub fn client_for(config: Config) -> Result<Client> {
    Client::try_from(config).context("building kube client")
}
