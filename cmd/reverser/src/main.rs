//! Process entry point: wires the process-wide singletons (Rule Store,
//! Correlation Store, Event Router, Watch Manager, Worker Manager) into the
//! CRD controllers (C6/C10) and the HTTP surface (admission webhook +
//! `/metrics` + `/health`), mirroring the teacher's single-`State`,
//! single-`run()` shape in `cmd/echo-operator` but fanning out across the
//! several long-running components this system needs.

use std::sync::Arc;

use std::time::Duration;

use actix_web::{
    middleware, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use kube::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gitops_reverser::audit::{handle_audit_ingest, AuditError};
use gitops_reverser::config::RuntimeConfig;
use gitops_reverser::context::State;
use gitops_reverser::correlation::CorrelationStore;
use gitops_reverser::metrics::Metrics;
use gitops_reverser::router::EventRouter;
use gitops_reverser::rules::RuleStore;
use gitops_reverser::watch::WatchManager;
use gitops_reverser::worker::WorkerManager;
use gitops_reverser::{admission, controller, telemetry};
use gitops_reverser_k8s_util::client::new_client_with_metrics;

const DEFAULT_ANNOTATION_DENYLIST: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

#[derive(Parser, Debug)]
#[command(
    name = "gitops-reverser",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port for the admission webhook and `/metrics`.
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Whether this replica holds the leader lease. Leader-election
    /// mechanics live outside this crate (see spec.md §1 out-of-scope); the
    /// flag is the boolean predicate the spec treats it as.
    #[arg(long, default_value_t = true, env = "GITOPS_REVERSER_LEADER")]
    leader: bool,

    /// Additional annotation keys to strip during sanitization, beyond the
    /// built-in denylist.
    #[arg(long = "deny-annotation", env = "GITOPS_REVERSER_DENY_ANNOTATIONS", value_delimiter = ',')]
    extra_annotation_denylist: Vec<String>,

    /// Cluster IDs permitted to post to `/audit-webhook/{clusterID}`. The
    /// endpoint is otherwise dark: an empty allowlist rejects every request.
    #[arg(long = "audit-allowed-cluster-id", env = "GITOPS_REVERSER_AUDIT_ALLOWED_CLUSTER_IDS", value_delimiter = ',')]
    audit_allowed_cluster_ids: Vec<String>,

    /// Correlation store entry TTL, in seconds (§3 default: 60).
    #[arg(long, default_value_t = 60, env)]
    correlation_ttl_secs: u64,

    /// Correlation store max FIFO depth per key (§3 default: 10).
    #[arg(long, default_value_t = 10, env)]
    correlation_max_depth: usize,

    /// Correlation store max distinct keys before LRU eviction (§3 default: 10000).
    #[arg(long, default_value_t = 10_000, env)]
    correlation_max_entries: usize,

    /// Watch Manager informer reconcile tick, in seconds (§4.5 default: 30).
    #[arg(long, default_value_t = 30, env)]
    watch_reconcile_interval_secs: u64,

    /// Branch worker batch cap by commit count (§4.9 default: 20).
    #[arg(long, default_value_t = 20, env)]
    worker_max_commits: usize,

    /// Branch worker batch cap by estimated byte size (§4.9 default: 1 MiB).
    #[arg(long, default_value_t = 1024 * 1024, env)]
    worker_max_batch_bytes: usize,

    /// Branch worker max wait before flushing a partial batch, in seconds
    /// (§4.9 default: 60).
    #[arg(long, default_value_t = 60, env)]
    worker_push_interval_secs: u64,

    /// Branch worker max push-conflict retries via rebase-by-reset (§4.9.1
    /// default: 3).
    #[arg(long, default_value_t = 3, env)]
    worker_max_retries: u32,

    /// Soft high-water mark for a branch worker's queue before `enqueue`
    /// starts awaiting a permit (default: 1000).
    #[arg(long, default_value_t = 1_000, env)]
    worker_queue_high_water_mark: usize,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format.
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. If not provided, tracing
    /// export is disabled (structured logging continues regardless).
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

struct AdmissionState {
    correlation: Arc<CorrelationStore>,
    annotation_denylist: Vec<String>,
}

struct AuditState {
    allowed_cluster_ids: Vec<String>,
    metrics: Arc<Metrics>,
}

/// `/audit-webhook/{clusterID}`: validates `clusterID` against the
/// allowlist and the body as a JSON audit event list (§6). Only its
/// interface is specified; downstream processing of accepted events is an
/// external collaborator's concern.
#[post("/audit-webhook/{cluster_id}")]
async fn audit_webhook(
    state: web::Data<AuditState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> impl Responder {
    let cluster_id = path.into_inner();
    match handle_audit_ingest(&cluster_id, &state.allowed_cluster_ids, &body) {
        Ok(count) => {
            state.metrics.audit_events_accepted.inc_by(count as u64);
            HttpResponse::Ok().json(serde_json::json!({ "accepted": count }))
        }
        Err(AuditError::InvalidClusterId) => {
            state.metrics.audit_requests_rejected.inc();
            warn!(cluster_id, "audit webhook rejected unknown or empty cluster ID");
            HttpResponse::BadRequest().json(serde_json::json!({ "error": "invalid cluster ID" }))
        }
        Err(AuditError::MalformedBody) => {
            state.metrics.audit_requests_rejected.inc();
            warn!(cluster_id, "audit webhook rejected malformed body");
            HttpResponse::BadRequest().json(serde_json::json!({ "error": "malformed audit event body" }))
        }
    }
}

/// `/process-validating-webhook`: always responds `allowed: true` (§6).
/// Failure policy `Ignore` is a matter for the admission webhook
/// configuration shipped alongside this binary, not this handler.
#[post("/process-validating-webhook")]
async fn process_validating_webhook(
    state: web::Data<AdmissionState>,
    body: web::Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    let review = admission::handle_admission_review(
        body.into_inner(),
        &state.annotation_denylist,
        &state.correlation,
    );
    HttpResponse::Ok().json(review)
}

#[actix_web::get("/metrics")]
async fn metrics(state: web::Data<State>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(state.metrics_text())
}

#[actix_web::get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = prometheus_client::registry::Registry::with_prefix("gitops_reverser");
    let kube_config = Config::infer().await?;
    let client = new_client_with_metrics(kube_config, &mut registry).await?;

    if !args.leader {
        // Non-leader replicas stay up for liveness/readiness probes only;
        // controllers, informers, workers, and the admission listener are
        // leader-exclusive (spec.md §5, "Leader election").
        warn!("not the leader replica, serving health/metrics only");
        return run_standby_server(args.port).await;
    }

    let runtime_config = RuntimeConfig {
        leader: true,
        correlation_ttl: Duration::from_secs(args.correlation_ttl_secs),
        correlation_max_depth: args.correlation_max_depth,
        correlation_max_entries: args.correlation_max_entries,
        watch_reconcile_interval: Duration::from_secs(args.watch_reconcile_interval_secs),
        worker_max_commits: args.worker_max_commits,
        worker_max_batch_bytes: args.worker_max_batch_bytes,
        worker_push_interval: Duration::from_secs(args.worker_push_interval_secs),
        worker_max_retries: args.worker_max_retries,
        worker_queue_high_water_mark: args.worker_queue_high_water_mark,
        ..RuntimeConfig::default()
    };

    let annotation_denylist: Vec<String> = DEFAULT_ANNOTATION_DENYLIST
        .iter()
        .map(|s| s.to_string())
        .chain(args.extra_annotation_denylist.iter().cloned())
        .collect();

    let metrics = Arc::new(Metrics::default());
    let rule_store = Arc::new(RuleStore::new());
    let correlation = Arc::new(CorrelationStore::new(
        runtime_config.correlation_max_depth,
        runtime_config.correlation_max_entries,
        runtime_config.correlation_ttl,
    ));
    let router = Arc::new(EventRouter::new(
        rule_store.clone(),
        correlation.clone(),
        metrics.clone(),
    ));
    let worker_manager = Arc::new(WorkerManager::new());
    let watch_manager = Arc::new(WatchManager::new(
        client.clone(),
        rule_store.clone(),
        router.clone(),
        metrics.clone(),
        runtime_config.clone(),
    ));

    let state = State::new(
        metrics,
        rule_store,
        correlation.clone(),
        router,
        worker_manager,
        watch_manager.clone(),
        runtime_config,
    );

    let shutdown = CancellationToken::new();
    let sweeper = CorrelationStore::spawn_sweeper(correlation.clone(), shutdown.child_token());
    let watch_task = tokio::spawn({
        let watch_manager = watch_manager;
        let shutdown = shutdown.child_token();
        async move { watch_manager.run(shutdown).await }
    });
    let controllers_task = tokio::spawn(controller::run(client, Arc::new(state.clone())));

    let admission_state = web::Data::new(AdmissionState {
        correlation,
        annotation_denylist,
    });
    let audit_state = web::Data::new(AuditState {
        allowed_cluster_ids: args.audit_allowed_cluster_ids.clone(),
        metrics: state.metrics.clone(),
    });
    let server_state = web::Data::new(state);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(admission_state.clone())
            .app_data(audit_state.clone())
            .app_data(server_state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
            .service(process_validating_webhook)
            .service(audit_webhook)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    info!(port = args.port, "gitops-reverser listening");

    let server_result = server.run().await;
    shutdown.cancel();
    let _ = tokio::join!(watch_task, controllers_task, sweeper);
    server_result?;
    Ok(())
}

async fn run_standby_server(port: u32) -> anyhow::Result<()> {
    HttpServer::new(|| {
        App::new()
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
    })
    .bind(format!("0.0.0.0:{}", port))?
    .shutdown_timeout(5)
    .run()
    .await?;
    Ok(())
}
