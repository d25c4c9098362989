//! Process wiring for the HTTP surface (C11): builds every other component
//! and hands the assembled `AppState` to `http::serve`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agenterm_core::{
    default_agents_path, default_playbooks_path, AgentCatalog, ConfigStore, EventBus,
    PlaybookCatalog, Storage,
};
use agenterm_orchestrator::{EventTrigger, Orchestrator, SessionManager, Toolset};
use agenterm_providers::ProviderRegistry;
use agenterm_runtime::{ProcessBackend, TerminalBackend};

mod http;

pub use http::serve;

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub config: Arc<ConfigStore>,
    pub providers: ProviderRegistry,
    pub session_manager: Arc<SessionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub event_bus: Arc<EventBus>,
    pub agents: AgentCatalog,
    pub bearer_token: Option<String>,
}

impl AppState {
    /// Opens storage, loads the configuration and catalogs, and wires the
    /// scheduler/session-manager/orchestrator/event-trigger stack on top.
    pub async fn bootstrap(data_dir: impl AsRef<Path>, bind_base_url: String) -> anyhow::Result<Self> {
        Self::bootstrap_with_paths(data_dir, bind_base_url, None, None).await
    }

    /// Like [`Self::bootstrap`] but lets the `serve` CLI override the db and
    /// config paths independently of `--data-dir`.
    pub async fn bootstrap_with_paths(
        data_dir: impl AsRef<Path>,
        bind_base_url: String,
        db_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let data_dir: PathBuf = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir).await?;

        let storage = Storage::open(db_path.unwrap_or_else(|| data_dir.join("agenterm.sqlite3"))).await?;
        let config = Arc::new(ConfigStore::new(config_path.unwrap_or_else(|| data_dir.join("config.json")), None).await?);
        let app_config = config.get().await;
        let providers = ProviderRegistry::new(app_config.into());

        let agents = AgentCatalog::load(default_agents_path(&data_dir)).await?;
        let playbooks = PlaybookCatalog::load(default_playbooks_path(&data_dir)).await?;

        let backend: Arc<dyn TerminalBackend> = Arc::new(ProcessBackend::default());
        let session_manager = Arc::new(SessionManager::new(storage.clone(), backend));

        let bearer_token = std::env::var("AGENTERM_BEARER_TOKEN").ok();
        let toolset = Arc::new(Toolset::new(bind_base_url, bearer_token.clone(), data_dir.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone(),
            providers.clone(),
            toolset,
            session_manager.clone(),
            agents.clone(),
            playbooks,
        ));

        let event_bus = Arc::new(EventBus::new());

        let trigger = Arc::new(EventTrigger::new(storage.clone(), orchestrator.clone()));
        trigger.spawn();

        Ok(Self {
            storage,
            config,
            providers,
            session_manager,
            orchestrator,
            event_bus,
            agents,
            bearer_token,
        })
    }
}
