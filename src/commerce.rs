//! Platform Commerce Abstraction
//!
//! The payment queue is an external, platform-owned service. This module
//! defines the trait the entitlement manager talks to plus the transaction
//! types delivered back over the queue's event stream.
//!
//! Transaction updates are fanned out over a [`tokio::sync::broadcast`]
//! channel; the manager attaches a forwarding task with
//! [`EntitlementManager::attach_queue_events`](crate::manager::EntitlementManager::attach_queue_events)
//! rather than inheriting any observer interface.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// A purchasable product as returned by the store catalog fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    /// Platform product identifier (reverse-DNS string).
    pub id: String,
    /// Localized display title.
    pub title: String,
    /// Localized display price.
    pub price: String,
}

/// Result of a product catalog fetch.
#[derive(Debug, Clone, Default)]
pub struct ProductFetchResponse {
    pub products: Vec<Product>,
    /// Identifiers the store did not recognize.
    pub invalid_ids: Vec<String>,
}

/// Platform error codes attached to failed transactions.
///
/// Mapped 1:1 onto [`FailureReason`](crate::manager::FailureReason) by the
/// manager, except for [`PaymentCancelled`](Self::PaymentCancelled) which is
/// swallowed silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorCode {
    /// User backed out of the payment sheet. Not an error.
    PaymentCancelled,
    PaymentInvalid,
    PaymentNotAllowed,
    StoreProductNotAvailable,
    CloudServicePermissionDenied,
    CloudServiceNetworkConnectionFailed,
    /// Any code this build does not know about.
    Unknown,
}

/// Failure details attached to a [`TransactionState::Failed`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionError {
    pub code: TransactionErrorCode,
    pub message: String,
}

/// Lifecycle state of one platform transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Payment in flight; no state change yet.
    Purchasing,
    Purchased,
    Failed(TransactionError),
    Restored,
    /// Awaiting external approval (e.g. family purchase approval).
    Deferred,
    /// Future transaction kinds; ignored.
    Unknown,
}

/// One completed/failed/restored/deferred transaction as delivered by the
/// platform, in the platform's order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub product_id: String,
    pub state: TransactionState,
}

impl Transaction {
    pub fn new(product_id: impl Into<String>, state: TransactionState) -> Self {
        Self {
            product_id: product_id.into(),
            state,
        }
    }
}

/// Errors reported synchronously by the payment queue.
#[derive(Debug, Error)]
pub enum CommerceError {
    /// Purchases are disabled on this device.
    #[error("payments are not allowed on this device")]
    PaymentsNotAllowed,

    /// The store request could not be issued or answered.
    #[error("store request failed: {0}")]
    RequestFailed(String),
}

/// The platform payment queue.
///
/// All methods are non-blocking from the manager's point of view: payment
/// and restore outcomes arrive later as [`Transaction`] batches on the
/// subscription, never as return values.
#[async_trait]
pub trait PaymentQueue: Send + Sync {
    /// Whether this device is allowed to make payments at all.
    fn can_make_payments(&self) -> bool;

    /// Submit a payment for one product. The outcome arrives as a
    /// transaction update.
    async fn submit_payment(&self, product_id: &str) -> Result<(), CommerceError>;

    /// Ask the platform to replay the user's completed transactions.
    async fn restore_completed_transactions(&self);

    /// Fetch the store catalog for a set of product identifiers.
    async fn fetch_products(
        &self,
        product_ids: &[String],
    ) -> Result<ProductFetchResponse, CommerceError>;

    /// Subscribe to transaction update batches.
    fn subscribe(&self) -> broadcast::Receiver<Vec<Transaction>>;
}
