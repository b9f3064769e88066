//! Shared process state threaded into every CRD controller and into the
//! HTTP server in `cmd/reverser`, generalizing the teacher's single-CRD
//! `Context`/`State` pair (`controller.rs`) across C5-C10's several
//! long-running components.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::events::Reporter;
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::RuntimeConfig;
use crate::correlation::CorrelationStore;
use crate::metrics::Metrics;
use crate::router::EventRouter;
use crate::rules::RuleStore;
use crate::watch::WatchManager;
use crate::worker::WorkerManager;

/// Per-controller-run context, mirroring the teacher's `Context` shape but
/// carrying the whole process's shared singletons instead of one CRD's.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Arc<Metrics>,
    pub rule_store: Arc<RuleStore>,
    pub correlation: Arc<CorrelationStore>,
    pub router: Arc<EventRouter>,
    pub worker_manager: Arc<WorkerManager>,
    pub watch_manager: Arc<WatchManager>,
    pub config: RuntimeConfig,
}

#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "gitops-reverser".into(),
        }
    }
}

fn from_ts<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(serde::Deserialize)]
    struct Wrapper(#[serde(with = "chrono::serde::ts_seconds")] DateTime<Utc>);
    let w = Wrapper::deserialize(deserializer)?;
    Ok(w.0)
}

/// State shared between every controller and the web server, analogous to
/// the teacher's `State`.
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Arc<Metrics>,
    pub rule_store: Arc<RuleStore>,
    pub correlation: Arc<CorrelationStore>,
    pub router: Arc<EventRouter>,
    pub worker_manager: Arc<WorkerManager>,
    pub watch_manager: Arc<WatchManager>,
    pub config: RuntimeConfig,
}

impl State {
    pub fn new(
        metrics: Arc<Metrics>,
        rule_store: Arc<RuleStore>,
        correlation: Arc<CorrelationStore>,
        router: Arc<EventRouter>,
        worker_manager: Arc<WorkerManager>,
        watch_manager: Arc<WatchManager>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics,
            rule_store,
            correlation,
            router,
            worker_manager,
            watch_manager,
            config,
        }
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.encode().unwrap_or_default()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            rule_store: self.rule_store.clone(),
            correlation: self.correlation.clone(),
            router: self.router.clone(),
            worker_manager: self.worker_manager.clone(),
            watch_manager: self.watch_manager.clone(),
            config: self.config.clone(),
        })
    }
}
