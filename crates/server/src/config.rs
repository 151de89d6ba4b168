use anyhow::{Context, Result};
use logline_core::agent::{AgentInvoker, UnavailableAgentInvoker};
use logline_core::apps::IndexAppScopes;
use logline_core::budget::{BudgetConfig, BudgetTracker};
use logline_core::metrics::MetricsCollector;
use logline_core::policy::RulePolicyEngine;
use logline_core::retry::RetryConfig;
use logline_core::storage::{JsonlEventLog, RedbIndexStore};
use logline_core::tools::ToolRuntime;
use logline_core::workflow::Orchestrator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::parse(&content)?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub event_log: Arc<JsonlEventLog>,
    pub index_store: Arc<RedbIndexStore>,
    pub tool_runtime: Arc<ToolRuntime>,
    pub orchestrator: Orchestrator,
    pub metrics: Arc<MetricsCollector>,
}

impl AppState {
    /// Wire the engine with no agent runtime; agent steps fail until one is supplied
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Self::with_agent(config, Arc::new(UnavailableAgentInvoker))
    }

    pub fn with_agent(config: &ServerConfig, agent: Arc<dyn AgentInvoker>) -> Result<Self> {
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let index_store = Arc::new(
            RedbIndexStore::new(config.index_path()).context("Failed to create index store")?,
        );

        let policy_engine = Arc::new(RulePolicyEngine::new(index_store.clone(), event_log.clone()));
        let metrics = Arc::new(MetricsCollector::new());

        let tool_runtime = Arc::new(
            ToolRuntime::new(
                index_store.clone(),
                event_log.clone(),
                policy_engine.clone(),
                Arc::new(IndexAppScopes::new(index_store.clone())),
            )
            .with_retry_config(config.retry)
            .with_metrics(metrics.clone()),
        );
        let seeded = tool_runtime
            .seed_builtin_tools()
            .context("Failed to seed built-in tools")?;
        tracing::info!("Registered {} built-in tools", seeded);

        let budget = Arc::new(BudgetTracker::new(config.budget));

        let orchestrator = Orchestrator::new(
            index_store.clone(),
            event_log.clone(),
            policy_engine,
            tool_runtime.clone(),
            agent,
            budget,
        );

        Ok(Self {
            event_log,
            index_store,
            tool_runtime,
            orchestrator,
            metrics,
        })
    }
}
