//! Receipt Validation - Server-Side Proof-of-Purchase Round Trip
//!
//! A receipt is an opaque, signed blob issued by the platform's commerce
//! layer. Restoring entitlements re-derives ownership from it: the blob is
//! base64-encoded and POSTed to the vendor's validation endpoint, and the
//! parsed response lists the in-app purchase product ids the receipt
//! attests.
//!
//! ## Environment cross-try
//!
//! Validation runs against one of two fixed endpoints (sandbox or
//! production), starting with whichever matches the detected receipt
//! context. Any failure - transport error, non-200, unparseable body, or a
//! nonzero status in the body - triggers exactly one retry against the
//! *other* environment. Status 21007 ("sandbox receipt sent to production")
//! is the canonical case that forces this retry. There is never a second
//! retry; callers degrade to the platform's native restore instead.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ValidatorConfig;

/// Status code the endpoint returns for a sandbox receipt sent to the
/// production environment.
pub const STATUS_SANDBOX_RECEIPT_ON_PRODUCTION: i64 = 21007;

/// Which validation endpoint a request is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    /// The opposite environment, for the single cross-try.
    pub fn other(self) -> Self {
        match self {
            Self::Production => Self::Sandbox,
            Self::Sandbox => Self::Production,
        }
    }
}

/// Access to the locally stored receipt blob.
#[async_trait]
pub trait ReceiptProvider: Send + Sync {
    /// The local receipt blob, if present and readable.
    async fn local_receipt(&self) -> Option<Vec<u8>>;

    /// Ask the platform for a fresh receipt. Asynchronous; a later
    /// transaction callback follows once the receipt is in place.
    async fn request_refresh(&self);

    /// Environment matching the detected build/receipt context.
    fn environment(&self) -> Environment;
}

/// Why a validation round trip failed.
///
/// These never surface to observers; the manager logs them and falls back
/// to the platform's native restore.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The HTTP request could not be sent or answered.
    #[error("validation transport error: {0}")]
    Transport(String),

    /// The endpoint answered with a non-200 HTTP status.
    #[error("validation endpoint returned HTTP {0}")]
    Http(u16),

    /// The response body was not the expected JSON shape.
    #[error("unparseable validation response: {0}")]
    Malformed(String),

    /// The endpoint parsed the receipt but rejected it.
    #[error("validation failed with status {0}")]
    Status(i64),
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct VerifyRequest<'a> {
    #[serde(rename = "receipt-data")]
    receipt_data: &'a str,
    #[serde(rename = "exclude-old-transactions")]
    exclude_old_transactions: bool,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: i64,
    #[serde(default)]
    receipt: Option<ReceiptBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ReceiptBody {
    #[serde(default)]
    in_app: Vec<InAppEntry>,
}

#[derive(Debug, Deserialize)]
struct InAppEntry {
    product_id: String,
}

// ============================================================================
// Verifier
// ============================================================================

/// Seam over the validation round trip.
///
/// The production implementation is [`AppStoreValidator`]; tests substitute
/// canned outcomes without touching the network.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    /// Validate a receipt blob, returning the in-app product ids it
    /// attests. `first` is the environment to try before the cross-try.
    async fn verify(
        &self,
        receipt: &[u8],
        first: Environment,
    ) -> Result<Vec<String>, ValidationError>;
}

/// Validator POSTing to the vendor's sandbox/production endpoint pair.
pub struct AppStoreValidator {
    config: ValidatorConfig,
    client: reqwest::Client,
}

impl AppStoreValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn endpoint(&self, environment: Environment) -> &str {
        match environment {
            Environment::Production => &self.config.production_url,
            Environment::Sandbox => &self.config.sandbox_url,
        }
    }

    /// One POST against one environment.
    async fn attempt(
        &self,
        environment: Environment,
        request: &VerifyRequest<'_>,
    ) -> Result<Vec<String>, ValidationError> {
        let url = self.endpoint(environment);
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| ValidationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(ValidationError::Http(status.as_u16()));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        if body.status != 0 {
            return Err(ValidationError::Status(body.status));
        }

        let product_ids = body
            .receipt
            .unwrap_or_default()
            .in_app
            .into_iter()
            .map(|entry| entry.product_id)
            .collect();
        Ok(product_ids)
    }
}

#[async_trait]
impl ReceiptVerifier for AppStoreValidator {
    async fn verify(
        &self,
        receipt: &[u8],
        first: Environment,
    ) -> Result<Vec<String>, ValidationError> {
        let encoded = STANDARD.encode(receipt);
        let request = VerifyRequest {
            receipt_data: &encoded,
            exclude_old_transactions: false,
            password: &self.config.shared_secret,
        };

        match self.attempt(first, &request).await {
            Ok(product_ids) => {
                debug!(
                    environment = ?first,
                    products = product_ids.len(),
                    "Receipt validated"
                );
                Ok(product_ids)
            }
            Err(e) => {
                // One cross-try against the other environment, whatever the
                // failure. 21007 is the expected trigger.
                let second = first.other();
                if matches!(e, ValidationError::Status(STATUS_SANDBOX_RECEIPT_ON_PRODUCTION)) {
                    debug!("Sandbox receipt sent to production, redirecting");
                }
                warn!(
                    environment = ?first,
                    error = %e,
                    retry_against = ?second,
                    "Receipt validation failed, cross-trying other environment"
                );
                self.attempt(second, &request).await
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP endpoint answering each connection with the next canned
    /// JSON body. Returns the base URL and a hit counter.
    async fn stub_endpoint(bodies: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            for body in bodies {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);

                // Read headers plus the content-length'd body before
                // answering, so the client never sees a reset mid-write.
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if let Some(end) = find_headers_end(&request) {
                        let headers = String::from_utf8_lossy(&request[..end]);
                        let body_len: usize = headers
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse().ok())?
                            })
                            .unwrap_or(0);
                        while request.len() < end + 4 + body_len {
                            let n = stream.read(&mut buf).await.unwrap_or(0);
                            if n == 0 {
                                return;
                            }
                            request.extend_from_slice(&buf[..n]);
                        }
                        break;
                    }
                }

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (format!("http://{}/verifyReceipt", addr), hits)
    }

    fn find_headers_end(bytes: &[u8]) -> Option<usize> {
        bytes.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn config(production_url: String, sandbox_url: String) -> ValidatorConfig {
        ValidatorConfig {
            production_url,
            sandbox_url,
            ..ValidatorConfig::new("test-secret")
        }
    }

    #[test]
    fn test_response_parsing_ignores_extra_fields() {
        let raw = r#"{
            "status": 0,
            "environment": "Sandbox",
            "receipt": {
                "bundle_id": "com.dailymood",
                "in_app": [
                    {"product_id": "com.dailymood.theme.dark", "quantity": "1"},
                    {"product_id": "com.dailymood.theme.tides", "quantity": "1"}
                ]
            }
        }"#;
        let parsed: VerifyResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.status, 0);
        let ids: Vec<_> = parsed
            .receipt
            .unwrap()
            .in_app
            .iter()
            .map(|e| e.product_id.clone())
            .collect();
        assert_eq!(
            ids,
            vec!["com.dailymood.theme.dark", "com.dailymood.theme.tides"]
        );
    }

    #[test]
    fn test_response_parsing_tolerates_missing_receipt() {
        let parsed: VerifyResponse =
            serde_json::from_str(r#"{"status": 21007}"#).expect("parse");
        assert_eq!(parsed.status, 21007);
        assert!(parsed.receipt.is_none());
    }

    #[tokio::test]
    async fn test_success_on_first_environment() {
        let body = r#"{"status":0,"receipt":{"in_app":[{"product_id":"com.dailymood.theme.dark"}]}}"#;
        let (production, production_hits) = stub_endpoint(vec![body.to_string()]).await;
        let (sandbox, sandbox_hits) = stub_endpoint(vec![]).await;

        let validator = AppStoreValidator::new(config(production, sandbox));
        let ids = validator
            .verify(b"receipt-bytes", Environment::Production)
            .await
            .expect("valid");

        assert_eq!(ids, vec!["com.dailymood.theme.dark"]);
        assert_eq!(production_hits.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_21007_cross_tries_sandbox_exactly_once() {
        let (production, production_hits) =
            stub_endpoint(vec![r#"{"status":21007}"#.to_string()]).await;
        // Sandbox also fails; there must be no third attempt anywhere.
        let (sandbox, sandbox_hits) =
            stub_endpoint(vec![r#"{"status":21002}"#.to_string()]).await;

        let validator = AppStoreValidator::new(config(production, sandbox));
        let result = validator
            .verify(b"receipt-bytes", Environment::Production)
            .await;

        match result {
            Err(ValidationError::Status(21002)) => {}
            other => panic!("expected Status(21002), got {:?}", other.map(|_| ())),
        }
        assert_eq!(production_hits.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cross_try_recovers_sandbox_receipt() {
        let (production, _) = stub_endpoint(vec![r#"{"status":21007}"#.to_string()]).await;
        let ok = r#"{"status":0,"receipt":{"in_app":[{"product_id":"com.dailymood.theme.tides"}]}}"#;
        let (sandbox, sandbox_hits) = stub_endpoint(vec![ok.to_string()]).await;

        let validator = AppStoreValidator::new(config(production, sandbox));
        let ids = validator
            .verify(b"receipt-bytes", Environment::Production)
            .await
            .expect("sandbox cross-try succeeds");

        assert_eq!(ids, vec!["com.dailymood.theme.tides"]);
        assert_eq!(sandbox_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_cross_tries_then_fails() {
        // Nothing listens on the production URL; sandbox answers garbage.
        let (sandbox, sandbox_hits) =
            stub_endpoint(vec!["{not json".to_string()]).await;

        let validator = AppStoreValidator::new(config(
            "http://127.0.0.1:1/verifyReceipt".to_string(),
            sandbox,
        ));
        let result = validator
            .verify(b"receipt-bytes", Environment::Production)
            .await;

        assert!(matches!(result, Err(ValidationError::Malformed(_))));
        assert_eq!(sandbox_hits.load(Ordering::SeqCst), 1);
    }
}
