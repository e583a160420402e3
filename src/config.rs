//! Configuration for the entitlement manager and receipt validation.
//!
//! Plain structs with defaults; the embedding app overrides what it needs.
//! The receipt shared secret is always supplied by the caller - it is a
//! credential and never ships as a constant in this crate.

use std::time::Duration;

/// Tunables for [`EntitlementManager`](crate::manager::EntitlementManager).
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    /// Safety timeout for a restore round trip (default: 30 seconds).
    ///
    /// If neither the validation response nor the native restore answers in
    /// time, loading is force-cleared and a `RestoreTimedOut` error event
    /// fires.
    pub restore_timeout: Duration,

    /// Delay before the single product catalog re-fetch after a failed or
    /// empty first fetch (default: 5 seconds).
    pub product_fetch_retry_delay: Duration,

    /// Buffered capacity of the event broadcast channel (default: 64).
    pub event_capacity: usize,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            restore_timeout: Duration::from_secs(30),
            product_fetch_retry_delay: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

/// Configuration for the receipt validation endpoint pair.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Production validation endpoint.
    pub production_url: String,
    /// Sandbox validation endpoint.
    pub sandbox_url: String,
    /// Shared secret sent as `password` in the validation request.
    pub shared_secret: String,
    /// Timeout for one validation POST (default: 15 seconds).
    pub request_timeout: Duration,
}

impl ValidatorConfig {
    /// Config pointing at the platform's standard endpoints.
    pub fn new(shared_secret: impl Into<String>) -> Self {
        Self {
            production_url: "https://buy.itunes.apple.com/verifyReceipt".to_string(),
            sandbox_url: "https://sandbox.itunes.apple.com/verifyReceipt".to_string(),
            shared_secret: shared_secret.into(),
            request_timeout: Duration::from_secs(15),
        }
    }
}
