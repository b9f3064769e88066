//! Prometheus exposition for `/metrics` (§6). Extends the teacher's
//! `ReconcileMetrics`-plus-`Family` pattern with the families §6/§12.4
//! require: events received/forwarded by GVR, commit success/failure by
//! worker key, queue depth, correlation hits/misses, informer count, and
//! snapshot/seed duration.

use crate::error::Error;

use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
    histogram::Histogram,
};
use prometheus_client::registry::{Registry, Unit};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GvrLabel {
    pub group: String,
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerLabel {
    pub worker_key: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub reconcile: ReconcileMetrics,

    pub events_received: Family<GvrLabel, Counter>,
    pub events_forwarded: Family<GvrLabel, Counter>,
    pub events_dropped_poison: Counter,
    pub commits_succeeded: Family<WorkerLabel, Counter>,
    pub commits_failed: Family<WorkerLabel, Counter>,
    pub queue_depth: Family<WorkerLabel, Gauge>,
    pub correlation_hits: Counter,
    pub correlation_misses: Counter,
    pub active_informers: Gauge,
    pub snapshot_duration: Histogram,
    pub branch_resets_incoming_changes: Family<WorkerLabel, Counter>,
    pub audit_events_accepted: Counter,
    pub audit_requests_rejected: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("gitops_reverser");
        let reconcile = ReconcileMetrics::default().register(&mut registry);

        let events_received = Family::<GvrLabel, Counter>::default();
        let events_forwarded = Family::<GvrLabel, Counter>::default();
        let events_dropped_poison = Counter::default();
        let commits_succeeded = Family::<WorkerLabel, Counter>::default();
        let commits_failed = Family::<WorkerLabel, Counter>::default();
        let queue_depth = Family::<WorkerLabel, Gauge>::default();
        let correlation_hits = Counter::default();
        let correlation_misses = Counter::default();
        let active_informers = Gauge::default();
        let snapshot_duration =
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1., 5., 10., 30.].into_iter());
        let branch_resets_incoming_changes = Family::<WorkerLabel, Counter>::default();
        let audit_events_accepted = Counter::default();
        let audit_requests_rejected = Counter::default();

        registry.register(
            "events_received",
            "events observed by the watch manager, by GVR",
            events_received.clone(),
        );
        registry.register(
            "events_forwarded",
            "events forwarded past target-stream dedup, by GVR",
            events_forwarded.clone(),
        );
        registry.register(
            "events_dropped_poison",
            "events dropped due to unrecoverable sanitize/parse failure",
            events_dropped_poison.clone(),
        );
        registry.register(
            "commits_total",
            "branch worker commits by worker key and outcome",
            commits_succeeded.clone(),
        );
        registry.register(
            "commit_failures_total",
            "branch worker commit failures by worker key",
            commits_failed.clone(),
        );
        registry.register(
            "worker_queue_depth",
            "in-process queue depth per branch worker",
            queue_depth.clone(),
        );
        registry.register(
            "correlation_hits_total",
            "correlation store Take() hits",
            correlation_hits.clone(),
        );
        registry.register(
            "correlation_misses_total",
            "correlation store Take() misses",
            correlation_misses.clone(),
        );
        registry.register(
            "active_informers",
            "number of currently-running (GVR, namespace) informers",
            active_informers.clone(),
        );
        registry.register_with_unit(
            "snapshot_duration",
            "seed/snapshot listing duration",
            Unit::Seconds,
            snapshot_duration.clone(),
        );
        registry.register(
            "branch_resets_incoming_changes",
            "branch worker resets to the remote default branch after its target branch vanished upstream",
            branch_resets_incoming_changes.clone(),
        );
        registry.register(
            "audit_events_accepted",
            "audit events accepted by the audit ingest endpoint",
            audit_events_accepted.clone(),
        );
        registry.register(
            "audit_requests_rejected",
            "audit ingest requests rejected for an invalid cluster ID or malformed body",
            audit_requests_rejected.clone(),
        );

        Self {
            registry: Arc::new(registry),
            reconcile,
            events_received,
            events_forwarded,
            events_dropped_poison,
            commits_succeeded,
            commits_failed,
            queue_depth,
            correlation_hits,
            correlation_misses,
            active_informers,
            snapshot_duration,
            branch_resets_incoming_changes,
            audit_events_accepted,
            audit_requests_rejected,
        }
    }
}

impl Metrics {
    pub fn event_received(&self, group: &str, resource: &str) {
        self.events_received
            .get_or_create(&GvrLabel {
                group: group.to_string(),
                resource: resource.to_string(),
            })
            .inc();
    }

    pub fn event_forwarded(&self, group: &str, resource: &str) {
        self.events_forwarded
            .get_or_create(&GvrLabel {
                group: group.to_string(),
                resource: resource.to_string(),
            })
            .inc();
    }

    pub fn commit_succeeded(&self, worker_key: &str) {
        self.commits_succeeded
            .get_or_create(&WorkerLabel {
                worker_key: worker_key.to_string(),
            })
            .inc();
    }

    pub fn commit_failed(&self, worker_key: &str) {
        self.commits_failed
            .get_or_create(&WorkerLabel {
                worker_key: worker_key.to_string(),
            })
            .inc();
    }

    pub fn branch_reset_incoming_changes(&self, worker_key: &str) {
        self.branch_resets_incoming_changes
            .get_or_create(&WorkerLabel {
                worker_key: worker_key.to_string(),
            })
            .inc();
    }

    pub fn set_queue_depth(&self, worker_key: &str, depth: i64) {
        self.queue_depth
            .get_or_create(&WorkerLabel {
                worker_key: worker_key.to_string(),
            })
            .set(depth);
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<(), Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<(), Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciliation errors",
            self.failures.clone(),
        );
        r.register("reconciliations", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure<K: ResourceExt>(&self, obj: &Arc<K>, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.get_or_create(&()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Relies on `Drop` to calculate duration and register the observation.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
