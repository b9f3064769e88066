//! C4 — Admission Handler: a pure function over `AdmissionReview`, wired to
//! the `/admission` endpoint in `cmd/reverser`. Always allows (this operator
//! never blocks a write, only mirrors it) and deposits a correlation entry
//! keyed on content hash so the watch-driven pipeline can attribute the
//! informer's eventual UPDATE/DELETE to the right user.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::correlation::CorrelationStore;
use crate::identifier::ResourceIdentifier;
use crate::sanitize;

/// Truncated xxhash of the sanitized object, 16 hex characters — cheap
/// content addressing for the short-lived correlation window, not a
/// security boundary (unlike the SHA-256 used for the durable event hash).
pub(crate) fn content_hash(sanitized: &str) -> String {
    format!("{:016x}", xxh64(sanitized.as_bytes(), 0))
}

fn identifier_from_request(req: &AdmissionRequest<DynamicObject>) -> ResourceIdentifier {
    let gvk = &req.kind;
    ResourceIdentifier::new(
        gvk.group.clone(),
        gvk.version.clone(),
        req.resource.resource.clone(),
        req.namespace.clone().unwrap_or_default(),
        req.name.clone(),
    )
}

/// Always responds `Allowed` — this is an observation point, not a policy
/// gate. On anything short of a fatal request-parsing error it stores a
/// `canonical-id ":" operation ":" hash` -> username entry so the matching
/// watch event can later `Take` it via the same key.
pub fn handle_admission_review(
    review: AdmissionReview<DynamicObject>,
    annotation_denylist: &[String],
    correlation: &CorrelationStore,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = ?err, "admission review could not be parsed into a request");
            return AdmissionResponse::invalid(format!("{err:?}")).into_review();
        }
    };

    let response = AdmissionResponse::from(&request);
    let username = request.user_info.username.clone().unwrap_or_default();
    let operation = format!("{:?}", request.operation).to_ascii_uppercase();
    let id = identifier_from_request(&request);

    let hash = if operation == "DELETE" {
        id.to_string()
    } else {
        match request.object.as_ref() {
            Some(object) => match sanitize::sanitize(object, annotation_denylist) {
                Ok(sanitized) => content_hash(&sanitized),
                Err(e) => {
                    warn!(%id, error = %e, "admission object could not be sanitized, skipping correlation");
                    return response.into_review();
                }
            },
            None => {
                warn!(%id, "admission request carried no object, skipping correlation");
                return response.into_review();
            }
        }
    };

    // The informer can't tell CREATE from UPDATE (watch.rs only ever
    // emits `Operation::Update` for `Event::Apply`), so CREATE and UPDATE
    // share one correlation bucket; only DELETE gets a distinct key.
    let correlation_op = if operation == "CREATE" { "UPDATE" } else { operation.as_str() };
    let key = format!("{id}:{correlation_op}:{hash}");
    debug!(%key, %username, "recording admission correlation entry");
    correlation.put(&key, username);

    response.into_review()
}
