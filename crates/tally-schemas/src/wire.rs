//! Wire bodies for the cloud batch endpoint.
//!
//! String-keyed JSON appears only here, at the HTTP edge; everything inboard
//! of this module is typed. The request shape is what
//! `POST /v1/scans/batch` expects, the response shapes are what the service
//! returns on acceptance and on error.

use serde::{Deserialize, Serialize};

/// One uploaded scan event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchEvent {
    pub idempotency_key: String,
    pub badge_id: String,
    pub station_name: String,
    /// Canonical RFC3339 UTC with `Z` suffix (see [`crate::time`]).
    pub scanned_at: String,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub matched: bool,
    pub local_id: i64,
}

/// Request body: events ordered by `local_id` ascending.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<BatchEvent>,
}

/// 200 response body.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BatchAccepted {
    pub saved: i64,
    pub duplicates: i64,
}

/// Optional body carried by non-2xx responses.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_request_shape_matches_protocol() {
        let req = BatchRequest {
            events: vec![BatchEvent {
                idempotency_key: "Gate-1-A-1".to_string(),
                badge_id: "A".to_string(),
                station_name: "Gate-1".to_string(),
                scanned_at: "2026-08-01T10:00:00.000000Z".to_string(),
                meta: EventMeta {
                    matched: true,
                    local_id: 1,
                },
            }],
        };
        let v: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v["events"][0]["idempotency_key"], "Gate-1-A-1");
        assert_eq!(v["events"][0]["meta"]["local_id"], 1);
        assert_eq!(v["events"][0]["meta"]["matched"], true);
    }

    #[test]
    fn error_body_tolerates_missing_field() {
        let b: ErrorBody = serde_json::from_str("{}").unwrap();
        assert!(b.error.is_none());
        let b: ErrorBody = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(b.error.as_deref(), Some("boom"));
    }
}
