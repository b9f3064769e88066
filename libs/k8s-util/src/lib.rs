//! Shared `kube::Client` plumbing: a metrics-instrumented HTTP layer and the
//! URL-path templating helper it uses to keep per-endpoint labels
//! low-cardinality.

pub mod client;
pub mod metrics;
pub mod url;
