//! Application state wiring all services together.
//!
//! `AppState` pins the generic core services to the concrete infra
//! implementations: SQLite persistence, the HTTP provider gateway, and the
//! lexical retriever.

use std::sync::Arc;

use secrecy::SecretString;

use stitchflow_core::engine::{ConditionEvaluator, PipelineEngine};
use stitchflow_core::node::NodeRegistry;
use stitchflow_core::reconcile::{Reconciler, RunResumer};
use stitchflow_infra::config::{load_global_config, resolve_callback_secret, resolve_data_dir};
use stitchflow_infra::provider::HttpProviderClient;
use stitchflow_infra::retrieval::LexicalRetriever;
use stitchflow_infra::sqlite::{DatabasePool, SqliteRunRepository};

/// Concrete type aliases for the service generics pinned to infra
/// implementations.
pub type ConcreteEngine = PipelineEngine<SqliteRunRepository>;
pub type ConcreteReconciler = Reconciler<SqliteRunRepository>;

/// Shared application state holding all services.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub reconciler: Arc<ConcreteReconciler>,
    pub repo: Arc<SqliteRunRepository>,
}

impl AppState {
    /// Initialize the application state: connect to the DB, wire services.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("stitchflow.db").display()
        );
        let pool = DatabasePool::new(&db_url).await?;
        let repo = Arc::new(SqliteRunRepository::new(pool));

        let provider = Arc::new(HttpProviderClient::new(
            config.provider_base_url.clone(),
            config.callback_base_url.clone(),
        ));
        let retriever = Arc::new(LexicalRetriever::new());
        let registry = Arc::new(NodeRegistry::with_builtins(
            provider,
            retriever,
            Arc::new(ConditionEvaluator::new()),
        ));

        let engine = Arc::new(PipelineEngine::new(Arc::clone(&repo), registry));

        let secret = resolve_callback_secret(&config).ok_or_else(|| {
            anyhow::anyhow!(
                "no callback signing secret configured; set STITCHFLOW_CALLBACK_SECRET \
                 or callback_secret in config.toml"
            )
        })?;
        let reconciler = Arc::new(
            Reconciler::new(Arc::clone(&repo), SecretString::from(secret))
                .with_freshness_secs(config.callback_freshness_secs)
                .with_resumer(Arc::clone(&engine) as Arc<dyn RunResumer>),
        );

        Ok(Self {
            engine,
            reconciler,
            repo,
        })
    }
}
