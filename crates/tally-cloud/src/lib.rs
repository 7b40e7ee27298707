//! HTTP adapter to the cloud attendance service.
//!
//! Two operations: the unauthenticated health probe (`GET /`) and the
//! authenticated batch upload (`POST /v1/scans/batch`). Every request
//! carries an explicit deadline; an expired deadline is reported as a
//! transient network failure and leaves nothing in flight.
//!
//! Upload results are folded into [`UploadOutcome`], the full error
//! taxonomy the sync engine's lifecycle decisions key off. Classification
//! happens here, at the wire edge; the engine never inspects a status code.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use tally_config::Secret;
use tally_schemas::wire::{BatchAccepted, BatchRequest, ErrorBody};

// ---------------------------------------------------------------------------
// ProbeError
// ---------------------------------------------------------------------------

/// A failed health probe. Carries a short human-readable reason for the
/// connectivity signal payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeError {
    pub message: String,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "health probe failed: {}", self.message)
    }
}

impl std::error::Error for ProbeError {}

// ---------------------------------------------------------------------------
// UploadOutcome
// ---------------------------------------------------------------------------

/// Classified result of one batch upload attempt.
#[derive(Clone, Debug)]
pub enum UploadOutcome {
    /// 2xx with a well-formed `{saved, duplicates}` body.
    Accepted(BatchAccepted),
    /// 401 / 403: permanent; the cycle halts and surfaces a credential error.
    AuthRejected { status: u16, message: String },
    /// Other 4xx (400, 404, 422, ...): permanent for this batch; the cycle
    /// continues with the next batch.
    ClientRejected { status: u16, message: String },
    /// 408, 429, 5xx: transient; retried with backoff.
    TransientService { status: u16, message: String },
    /// Timeout, connection reset, DNS or TLS failure: transient; the batch
    /// stays pending.
    TransientNetwork { message: String },
    /// 2xx whose body did not parse: permanent.
    MalformedResponse { message: String },
}

impl UploadOutcome {
    /// Whether this outcome is retried within the same cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UploadOutcome::TransientService { .. } | UploadOutcome::TransientNetwork { .. }
        )
    }

    /// Short description for `last_error` fields and signal payloads.
    pub fn describe(&self) -> String {
        match self {
            UploadOutcome::Accepted(a) => {
                format!("accepted: saved={} duplicates={}", a.saved, a.duplicates)
            }
            UploadOutcome::AuthRejected { status, message } => {
                format!("authentication error (http {status}): {message}")
            }
            UploadOutcome::ClientRejected { status, message } => {
                format!("rejected (http {status}): {message}")
            }
            UploadOutcome::TransientService { status, message } => {
                format!("service unavailable (http {status}): {message}")
            }
            UploadOutcome::TransientNetwork { message } => {
                format!("network error: {message}")
            }
            UploadOutcome::MalformedResponse { message } => {
                format!("malformed response: {message}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CloudClient
// ---------------------------------------------------------------------------

/// Client for one configured cloud endpoint. Cheap to clone.
#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    key: Secret,
}

impl CloudClient {
    /// `base_url` without a trailing slash; `key` is the bearer credential.
    pub fn new(base_url: &str, key: Secret) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Unauthenticated reachability probe: `GET /` within `timeout`.
    /// Any 2xx counts as reachable.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ProbeError> {
        let url = format!("{}/", self.base_url);
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(ProbeError {
                message: format!("http {}", resp.status().as_u16()),
            }),
            Err(e) => Err(ProbeError {
                message: condense_reqwest_error(&e),
            }),
        }
    }

    /// Upload one batch within `timeout` and classify the result. Never
    /// returns `Err`: every failure mode is an [`UploadOutcome`] variant.
    pub async fn upload_batch(&self, batch: &BatchRequest, timeout: Duration) -> UploadOutcome {
        let url = format!("{}/v1/scans/batch", self.base_url);

        let body = match serde_json::to_vec(batch) {
            Ok(b) => b,
            Err(e) => {
                // Serialization of our own types failing is a bug, not a
                // wire condition; classify as malformed so it surfaces.
                return UploadOutcome::MalformedResponse {
                    message: format!("request serialization failed: {e}"),
                };
            }
        };

        let sent = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.key.expose()))
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .timeout(timeout)
            .body(body)
            .send()
            .await;

        let resp = match sent {
            Ok(r) => r,
            Err(e) => {
                return UploadOutcome::TransientNetwork {
                    message: condense_reqwest_error(&e),
                }
            }
        };

        let status = resp.status();
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return UploadOutcome::TransientNetwork {
                    message: format!("body read failed: {}", condense_reqwest_error(&e)),
                }
            }
        };

        debug!(status = status.as_u16(), bytes = bytes.len(), "batch upload response");
        classify_response(status, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn classify_response(status: StatusCode, body: &[u8]) -> UploadOutcome {
    if status.is_success() {
        return match serde_json::from_slice::<BatchAccepted>(body) {
            Ok(accepted) => UploadOutcome::Accepted(accepted),
            Err(e) => UploadOutcome::MalformedResponse {
                message: format!("2xx body did not parse: {e}"),
            },
        };
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(200).collect());

    let code = status.as_u16();
    match code {
        401 | 403 => UploadOutcome::AuthRejected { status: code, message },
        408 | 429 => UploadOutcome::TransientService { status: code, message },
        500..=599 => UploadOutcome::TransientService { status: code, message },
        _ => UploadOutcome::ClientRejected { status: code, message },
    }
}

/// Reduce reqwest's nested error chain to one stable line for signal
/// payloads and `last_error` columns.
fn condense_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timeout".to_string()
    } else if e.is_connect() {
        format!("connect: {e}")
    } else {
        e.to_string()
    }
}
