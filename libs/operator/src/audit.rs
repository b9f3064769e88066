//! Audit ingest endpoint (§6, "optional, future"): a thin, pure-function
//! validation layer for `/audit-webhook/{clusterID}`. Only the interface is
//! specified — what happens to an accepted event list is an external
//! collaborator's concern, so this module's job ends at "well-formed and
//! from an allowed cluster".

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, PartialEq, Eq)]
pub enum AuditError {
    /// Empty path segment or a `clusterID` not present in the allowlist.
    InvalidClusterId,
    /// Body did not parse as a JSON array of audit events.
    MalformedBody,
}

/// One audit event; the envelope fields are all this crate inspects; the
/// payload itself passes through opaque.
#[derive(Debug, Deserialize)]
pub struct AuditEvent {
    #[serde(default)]
    pub event_id: String,
    #[serde(flatten)]
    pub payload: Value,
}

pub fn validate_cluster_id(cluster_id: &str, allowlist: &[String]) -> Result<(), AuditError> {
    if cluster_id.trim().is_empty() {
        return Err(AuditError::InvalidClusterId);
    }
    if !allowlist.iter().any(|id| id == cluster_id) {
        return Err(AuditError::InvalidClusterId);
    }
    Ok(())
}

/// Validates `clusterID` against `allowlist` and parses `body` as a JSON
/// array of [`AuditEvent`]. Returns the accepted count; this crate's
/// obligation stops at acknowledging a well-formed, allowlisted submission.
pub fn handle_audit_ingest(
    cluster_id: &str,
    allowlist: &[String],
    body: &[u8],
) -> Result<usize, AuditError> {
    validate_cluster_id(cluster_id, allowlist)?;
    let events: Vec<AuditEvent> =
        serde_json::from_slice(body).map_err(|_| AuditError::MalformedBody)?;
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_cluster_id_not_in_allowlist() {
        let allowlist = vec!["prod-east".to_string()];
        assert_eq!(
            validate_cluster_id("prod-west", &allowlist),
            Err(AuditError::InvalidClusterId)
        );
    }

    #[test]
    fn rejects_empty_cluster_id() {
        assert_eq!(
            validate_cluster_id("", &["prod-east".to_string()]),
            Err(AuditError::InvalidClusterId)
        );
    }

    #[test]
    fn accepts_allowlisted_cluster_with_valid_body() {
        let allowlist = vec!["prod-east".to_string()];
        let body = br#"[{"eventId": "1"}, {"eventId": "2"}]"#;
        assert_eq!(handle_audit_ingest("prod-east", &allowlist, body), Ok(2));
    }

    #[test]
    fn rejects_malformed_body() {
        let allowlist = vec!["prod-east".to_string()];
        let body = b"not json";
        assert_eq!(
            handle_audit_ingest("prod-east", &allowlist, body),
            Err(AuditError::MalformedBody)
        );
    }
}
