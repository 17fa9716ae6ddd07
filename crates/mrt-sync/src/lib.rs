//! Release tracking runs: configuration, classification, orchestration,
//! notification and scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mrt_adapters::FetcherRegistry;
use mrt_storage::{DedupStore, FileDedupStore, HttpClient, HttpClientConfig, PgDedupStore};
use tracing::info;

pub mod classifier;
pub mod config;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod scheduler;

pub use classifier::{Classification, ClassifierError, ReleaseClassifier, SemanticScorer};
pub use config::{
    load_tracker_config, ClassifierConfig, CompanyConfig, ConfigError, EmailConfig,
    NotificationConfig, PipelineConfig, RuntimeSettings, ScheduleConfig, SmtpTls, StoreBackend,
    TrackerConfig,
};
pub use notify::{
    DispatchError, DispatchReport, Dispatcher, EmailDispatcher, LogDispatcher, MultiDispatcher,
    WebhookDispatcher, WebhookKind,
};
pub use pipeline::{PairReport, PairStats, Pipeline, RunOutcome, SourceFilter};
pub use report::{report_markdown, write_run_reports};
pub use scheduler::{build_scheduler, schedule_groups, GroupRunner, ScheduleGroup};

pub const CRATE_NAME: &str = "mrt-sync";

/// Open the dedup store selected by the environment.
pub async fn open_store(settings: &RuntimeSettings) -> Result<Arc<dyn DedupStore>> {
    match (settings.store_backend, &settings.database_url) {
        (StoreBackend::Postgres, Some(url)) => {
            let store = PgDedupStore::connect(url)
                .await
                .context("connecting to postgres dedup store")?;
            store.migrate().await.context("running dedup store migrations")?;
            info!("using postgres dedup store");
            Ok(Arc::new(store))
        }
        _ => {
            let store = FileDedupStore::open(settings.state_path.clone())
                .await
                .with_context(|| format!("opening dedup log {}", settings.state_path.display()))?;
            info!(path = %settings.state_path.display(), "using file dedup store");
            Ok(Arc::new(store))
        }
    }
}

pub fn http_client(settings: &RuntimeSettings) -> Result<Arc<HttpClient>> {
    let client = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(settings.http_timeout_secs),
        user_agent: Some(settings.user_agent.clone()),
        ..Default::default()
    })
    .context("building http client")?;
    Ok(Arc::new(client))
}

/// Wire the production pipeline: HTTP fetchers, the configured store and
/// every configured notification channel.
pub async fn build_pipeline(settings: &RuntimeSettings, config: TrackerConfig) -> Result<Pipeline> {
    let store = open_store(settings).await?;
    let fetchers = FetcherRegistry::with_http_defaults(http_client(settings)?, settings.github_token.clone());
    let dispatcher =
        MultiDispatcher::from_config(&config.notifications).context("configuring notification channels")?;
    let pipeline = Pipeline::new(Arc::new(config), store, fetchers)
        .context("compiling classifier keywords")?
        .with_dispatcher(Arc::new(dispatcher));
    Ok(pipeline)
}

/// Load everything from the environment, run once over all sources and write reports.
pub async fn run_once_from_env() -> Result<RunOutcome> {
    let settings = RuntimeSettings::from_env();
    let config = load_tracker_config(&settings)?;
    let pipeline = build_pipeline(&settings, config).await?;
    let outcome = pipeline.run(&SourceFilter::all()).await;
    write_run_reports(&settings.reports_dir, &outcome).await?;
    Ok(outcome)
}
