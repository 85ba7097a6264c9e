use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::agent::ProviderRegistry;
use crate::Metrics;

pub mod addon;
pub mod progression;
pub mod registration;
pub mod templates;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Agent providers by add-on name. The template manager adds and removes
    /// entries for template-based add-ons at runtime.
    pub providers: Arc<RwLock<ProviderRegistry>>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            providers: Arc::new(RwLock::new(providers)),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Initialize all controllers and block until shutdown (given the crds are
/// installed): one deploy controller per registered provider, the descriptor
/// progression controller, the CSR controller and the template manager.
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");
    let metrics = Metrics::default()
        .register(&state.registry)
        .expect("metrics are registered once");

    let providers: Vec<_> = state.providers.read().await.values().cloned().collect();
    let deploy_controllers = futures::future::join_all(
        providers
            .into_iter()
            .map(|provider| addon::run(client.clone(), provider, metrics.clone(), state.clone())),
    );

    tokio::join!(
        deploy_controllers,
        progression::run(client.clone(), metrics.clone(), state.clone()),
        registration::run(client.clone(), metrics.clone(), state.clone()),
        templates::run(client.clone(), metrics.clone(), state.clone()),
    );
}
