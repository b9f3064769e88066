//! GitOps Reverser: mirrors live cluster state into a Git repository.
//!
//! Module map against the design's component numbering:
//! [`identifier`] (C1 key), [`sanitize`] (C1 reduction), [`correlation`]
//! (C2), [`rules`] (C3), [`admission`] (C4), [`watch`] (C5), [`controller`]
//! (C6), [`router`] (C7), [`target_stream`] (C8), [`worker`] (C9),
//! [`lifecycle`] (C10).

pub mod admission;
pub mod audit;
pub mod conditions;
pub mod config;
pub mod context;
pub mod controller;
pub mod correlation;
pub mod crd;
pub mod error;
pub mod event;
pub mod identifier;
pub mod lifecycle;
pub mod metrics;
pub mod router;
pub mod rules;
pub mod sanitize;
pub mod target_stream;
pub mod telemetry;
pub mod watch;
pub mod worker;

pub use error::{Error, Result};
