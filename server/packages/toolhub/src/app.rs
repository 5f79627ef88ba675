//! The assembled process: one connection hub, one container registry shared
//! by the sandbox orchestrator and the callback proxy, and the tool gate over
//! all of them.

use std::sync::Arc;

use axum::Router;

use crate::config::ToolhubConfig;
use crate::db::{DatabaseConnector, DbError, HttpDatabaseConnector};
use crate::hub::ConnectionHub;
use crate::proxy::{build_router, ProxySettings, ProxyState};
use crate::sandbox::{ContainerEngine, ContainerRegistry, DockerCli, SandboxOrchestrator};
use crate::store::ChatStore;
use crate::tools::ToolGate;

pub struct AppState {
    hub: ConnectionHub,
    registry: ContainerRegistry,
    orchestrator: SandboxOrchestrator,
    gate: ToolGate,
    database: Arc<dyn DatabaseConnector>,
    proxy: ProxySettings,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("hub", &self.hub)
            .field("orchestrator", &self.orchestrator)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl AppState {
    /// Wires the configured container engine CLI and database endpoint.
    pub fn from_config(config: &ToolhubConfig, store: Arc<dyn ChatStore>) -> Result<Self, DbError> {
        let engine: Arc<dyn ContainerEngine> =
            Arc::new(DockerCli::new(config.sandbox.engine.clone()));
        let database: Arc<dyn DatabaseConnector> =
            Arc::new(HttpDatabaseConnector::new(&config.database)?);
        if config.database.base_url.is_none() {
            tracing::warn!("no database endpoint configured; database tools will fail");
        }
        Ok(Self::with_parts(config, store, engine, database))
    }

    pub fn with_parts(
        config: &ToolhubConfig,
        store: Arc<dyn ChatStore>,
        engine: Arc<dyn ContainerEngine>,
        database: Arc<dyn DatabaseConnector>,
    ) -> Self {
        let hub = ConnectionHub::from_settings(&config.hub);
        let registry = ContainerRegistry::new(engine.clone());
        let orchestrator =
            SandboxOrchestrator::new(engine, registry.clone(), config.sandbox.clone());
        let gate = ToolGate::new(hub.clone(), store, database.clone())
            .with_sandbox(orchestrator.clone());
        Self {
            hub,
            registry,
            orchestrator,
            gate,
            database,
            proxy: config.proxy.clone(),
        }
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &SandboxOrchestrator {
        &self.orchestrator
    }

    pub fn gate(&self) -> &ToolGate {
        &self.gate
    }

    pub fn proxy_settings(&self) -> &ProxySettings {
        &self.proxy
    }

    /// The callback proxy, answering for containers this process started.
    pub fn proxy_router(&self) -> Router {
        build_router(
            ProxyState::new(self.registry.clone(), self.database.clone()),
            &self.proxy,
        )
    }

    pub async fn shutdown(&self) {
        self.hub.destroy_all().await;
    }
}
