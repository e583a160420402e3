//! Entitlement Manager - Single Owner of Theme Ownership State
//!
//! Tracks which themes the user owns and which one is active, and
//! reconciles that state against platform purchase transactions and
//! server-side receipt validation.
//!
//! ## Concurrency model
//!
//! One instance owns all entitlement state; everything mutable lives behind
//! a single async mutex, so mutations are serialized even though the
//! triggering I/O (payment submission, receipt validation, the restore
//! timeout) runs concurrently. No operation blocks its caller: `purchase`
//! and `restore` launch background work and return, and outcomes are
//! delivered to observers over a broadcast event stream.
//!
//! Construct once at process start and hand out `Arc` clones - there is no
//! ambient global instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::catalog::{Palette, ThemeCatalog, DEFAULT_THEME_ID};
use crate::commerce::{
    CommerceError, PaymentQueue, Product, Transaction, TransactionErrorCode, TransactionState,
};
use crate::config::EntitlementConfig;
use crate::receipt::{ReceiptProvider, ReceiptVerifier};
use crate::storage::{KeyValueStore, CURRENT_THEME_KEY, PURCHASED_THEMES_KEY};

// ============================================================================
// Events and failure taxonomy
// ============================================================================

/// Why a purchase or restore did not complete.
///
/// Carried inside [`ThemeEvent::Failed`]; never returned to the caller of
/// `purchase`/`restore`, which are fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// The requested theme has no matching purchasable product.
    #[error("no purchasable product matches the requested theme")]
    ProductUnavailable,

    /// The platform reports purchases disabled on this device.
    #[error("payments are not allowed on this device")]
    PaymentsNotAllowed,

    #[error("the payment was invalid")]
    PaymentInvalid,

    #[error("the product is not available in the current storefront")]
    StoreProductNotAvailable,

    #[error("cloud service permission denied")]
    CloudServicePermissionDenied,

    #[error("cloud service network connection failed")]
    CloudServiceNetworkConnectionFailed,

    /// The restore safety timeout fired before any response arrived.
    #[error("restore timed out")]
    RestoreTimedOut,

    /// Any platform failure without a dedicated mapping.
    #[error("{0}")]
    Other(String),
}

/// One-way notifications to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThemeEvent {
    /// A purchase transaction completed and the theme was unlocked.
    PurchaseCompleted { theme_id: String },

    /// A single theme came back through a restored transaction.
    PurchaseRestored { theme_id: String },

    /// A receipt validation round trip finished. `theme_ids` lists the
    /// newly unlocked themes; already-owned ones are not repeated.
    RestoreCompleted {
        restored_count: usize,
        theme_ids: Vec<String>,
    },

    /// A purchase or restore failed. User cancellation never produces this.
    Failed { reason: FailureReason },

    /// The active theme (and therefore the exposed palette) changed.
    ActiveThemeChanged { theme_id: String },
}

/// Errors returned by [`EntitlementManager::set_active_theme`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectThemeError {
    #[error("unknown theme id: {0}")]
    UnknownTheme(String),

    /// The theme exists but has not been purchased.
    #[error("theme is not owned: {0}")]
    NotOwned(String),
}

// ============================================================================
// Manager
// ============================================================================

struct State {
    /// Owned theme ids. Always contains [`DEFAULT_THEME_ID`].
    owned: BTreeSet<String>,
    /// Active theme id. Always a member of `owned`.
    active: String,
    /// True while a purchase/restore/validation round trip is outstanding.
    loading: bool,
    last_error: Option<String>,
    /// Store products by product id, filled by `load_products`.
    products: HashMap<String, Product>,
    /// Monotonic restore attempt counter. A timeout or late validation
    /// response only applies if its attempt is still the current one.
    restore_generation: u64,
}

/// Single owned instance tracking theme entitlements.
pub struct EntitlementManager {
    catalog: ThemeCatalog,
    config: EntitlementConfig,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<dyn PaymentQueue>,
    receipts: Arc<dyn ReceiptProvider>,
    verifier: Arc<dyn ReceiptVerifier>,
    events: broadcast::Sender<ThemeEvent>,
    state: Mutex<State>,
}

impl EntitlementManager {
    /// Load persisted entitlement state and build the manager.
    ///
    /// Inconsistent saved state self-heals here: unknown theme ids are
    /// dropped, the default theme is re-inserted, and a saved active theme
    /// that is no longer owned falls back to the default, with the
    /// correction persisted.
    pub fn new(
        catalog: ThemeCatalog,
        config: EntitlementConfig,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<dyn PaymentQueue>,
        receipts: Arc<dyn ReceiptProvider>,
        verifier: Arc<dyn ReceiptVerifier>,
    ) -> Arc<Self> {
        let saved = store.get_string_list(PURCHASED_THEMES_KEY).unwrap_or_default();
        let saved_len = saved.len();
        let mut owned: BTreeSet<String> = saved
            .into_iter()
            .filter(|id| {
                let known = catalog.contains(id);
                if !known {
                    warn!(theme_id = %id, "Dropping saved entitlement for unknown theme");
                }
                known
            })
            .collect();
        let had_default = owned.contains(DEFAULT_THEME_ID);
        owned.insert(DEFAULT_THEME_ID.to_string());
        if !had_default || owned.len() != saved_len {
            let list: Vec<String> = owned.iter().cloned().collect();
            store.set_string_list(PURCHASED_THEMES_KEY, &list);
        }

        let active = match store.get_string(CURRENT_THEME_KEY) {
            Some(id) if owned.contains(&id) => id,
            Some(id) => {
                warn!(theme_id = %id, "Saved active theme no longer owned, falling back to default");
                store.set_string(CURRENT_THEME_KEY, DEFAULT_THEME_ID);
                DEFAULT_THEME_ID.to_string()
            }
            None => DEFAULT_THEME_ID.to_string(),
        };

        info!(owned = owned.len(), active = %active, "Entitlement manager loaded");

        let (events, _) = broadcast::channel(config.event_capacity);
        Arc::new(Self {
            catalog,
            config,
            store,
            queue,
            receipts,
            verifier,
            events,
            state: Mutex::new(State {
                owned,
                active,
                loading: false,
                last_error: None,
                products: HashMap::new(),
                restore_generation: 0,
            }),
        })
    }

    /// Subscribe to entitlement events.
    pub fn subscribe(&self) -> broadcast::Receiver<ThemeEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> &ThemeCatalog {
        &self.catalog
    }

    pub async fn owned_themes(&self) -> Vec<String> {
        self.state.lock().await.owned.iter().cloned().collect()
    }

    pub async fn active_theme(&self) -> String {
        self.state.lock().await.active.clone()
    }

    /// Palette of the active theme.
    pub async fn palette(&self) -> Palette {
        let active = self.active_theme().await;
        self.catalog
            .get(&active)
            .map(|t| t.palette)
            .unwrap_or_else(Palette::default_light)
    }

    pub async fn is_loading(&self) -> bool {
        self.state.lock().await.loading
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    /// Fetched store products, keyed by product id.
    pub async fn products(&self) -> Vec<Product> {
        self.state.lock().await.products.values().cloned().collect()
    }

    /// Spawn the forwarding task that feeds the payment queue's transaction
    /// stream into [`on_transaction_update`](Self::on_transaction_update).
    pub fn attach_queue_events(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut updates = self.queue.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(batch) => manager.on_transaction_update(batch).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Transaction stream lagged, updates dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Product catalog fetch
    // ------------------------------------------------------------------

    /// Fetch the store catalog for all premium themes.
    ///
    /// If the first fetch fails or yields nothing, one delayed retry runs
    /// after `product_fetch_retry_delay`; after that the store stays empty
    /// until the next explicit call.
    pub async fn load_products(self: &Arc<Self>) {
        let wanted = self.catalog.premium_product_ids();
        if self.fetch_products_once(&wanted).await {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.product_fetch_retry_delay).await;
            if !manager.fetch_products_once(&wanted).await {
                warn!("Store catalog unavailable after retry");
            }
        });
    }

    async fn fetch_products_once(&self, wanted: &[String]) -> bool {
        match self.queue.fetch_products(wanted).await {
            Ok(response) => {
                for invalid in &response.invalid_ids {
                    warn!(product_id = %invalid, "Store rejected product id");
                }
                if response.products.is_empty() {
                    warn!("Store returned no products");
                    return false;
                }
                let mut state = self.state.lock().await;
                for product in response.products {
                    state.products.insert(product.id.clone(), product);
                }
                info!(products = state.products.len(), "Store products loaded");
                true
            }
            Err(e) => {
                warn!(error = %e, "Product fetch failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Purchase
    // ------------------------------------------------------------------

    /// Start a purchase for one premium theme.
    ///
    /// Fire-and-forget: precondition failures surface as immediate
    /// [`ThemeEvent::Failed`] events; success arrives later through the
    /// transaction stream.
    pub async fn purchase(&self, theme_id: &str) {
        let Some(theme) = self.catalog.get(theme_id) else {
            warn!(theme_id = %theme_id, "Purchase requested for unknown theme");
            self.fail(FailureReason::ProductUnavailable).await;
            return;
        };
        if !theme.premium {
            debug!(theme_id = %theme_id, "Theme is free, nothing to purchase");
            return;
        }
        if self.state.lock().await.owned.contains(theme_id) {
            debug!(theme_id = %theme_id, "Theme already owned");
            return;
        }
        if !self.queue.can_make_payments() {
            self.fail(FailureReason::PaymentsNotAllowed).await;
            return;
        }
        let Some(product_id) = self.catalog.product_for_theme(theme_id) else {
            self.fail(FailureReason::ProductUnavailable).await;
            return;
        };
        // The product must have come back from the store catalog fetch.
        if !self.state.lock().await.products.contains_key(product_id) {
            warn!(theme_id = %theme_id, product_id = %product_id, "Product not in fetched catalog");
            self.fail(FailureReason::ProductUnavailable).await;
            return;
        }

        self.state.lock().await.loading = true;
        info!(theme_id = %theme_id, product_id = %product_id, "Submitting payment");
        if let Err(e) = self.queue.submit_payment(product_id).await {
            self.state.lock().await.loading = false;
            let reason = match e {
                CommerceError::PaymentsNotAllowed => FailureReason::PaymentsNotAllowed,
                CommerceError::RequestFailed(message) => FailureReason::Other(message),
            };
            self.fail(reason).await;
        }
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Re-derive entitlements from the receipt/transaction history.
    ///
    /// Sets the loading flag, runs the receipt validation round trip in the
    /// background, and arms the safety timeout. Loading is guaranteed to
    /// clear: either the validation/restore path clears it or the timeout
    /// force-clears it with a single [`FailureReason::RestoreTimedOut`]
    /// event. Whichever loses the race becomes a no-op.
    pub async fn restore(self: &Arc<Self>) {
        if !self.queue.can_make_payments() {
            self.fail(FailureReason::PaymentsNotAllowed).await;
            return;
        }

        let attempt = {
            let mut state = self.state.lock().await;
            state.loading = true;
            state.last_error = None;
            state.restore_generation += 1;
            state.restore_generation
        };
        info!(attempt, "Restore started");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.restore_timeout).await;
            let timed_out = {
                let mut state = manager.state.lock().await;
                if state.loading && state.restore_generation == attempt {
                    state.loading = false;
                    state.last_error = Some(FailureReason::RestoreTimedOut.to_string());
                    true
                } else {
                    false
                }
            };
            if timed_out {
                warn!(attempt, "Restore timed out waiting for a response");
                let _ = manager.events.send(ThemeEvent::Failed {
                    reason: FailureReason::RestoreTimedOut,
                });
            }
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_receipt_validation(Some(attempt)).await;
        });
    }

    // ------------------------------------------------------------------
    // Theme selection
    // ------------------------------------------------------------------

    /// Make an owned theme the active one.
    ///
    /// Rejects ids that are unknown or not owned, so the active theme can
    /// never dangle. Observers are notified synchronously.
    pub async fn set_active_theme(&self, theme_id: &str) -> Result<(), SelectThemeError> {
        if !self.catalog.contains(theme_id) {
            return Err(SelectThemeError::UnknownTheme(theme_id.to_string()));
        }
        {
            let mut state = self.state.lock().await;
            if !state.owned.contains(theme_id) {
                return Err(SelectThemeError::NotOwned(theme_id.to_string()));
            }
            if state.active == theme_id {
                return Ok(());
            }
            state.active = theme_id.to_string();
            self.store.set_string(CURRENT_THEME_KEY, theme_id);
        }
        debug!(theme_id = %theme_id, "Active theme changed");
        let _ = self.events.send(ThemeEvent::ActiveThemeChanged {
            theme_id: theme_id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction updates
    // ------------------------------------------------------------------

    /// Apply a batch of transaction updates in the platform's order.
    pub async fn on_transaction_update(self: &Arc<Self>, transactions: Vec<Transaction>) {
        for transaction in transactions {
            match transaction.state {
                TransactionState::Purchased => {
                    self.handle_purchased(&transaction.product_id).await;
                }
                TransactionState::Restored => {
                    self.handle_restored(&transaction.product_id).await;
                }
                TransactionState::Failed(error) => {
                    self.handle_failed(error.code, error.message).await;
                }
                // Payment still in flight; loading stays set.
                TransactionState::Purchasing | TransactionState::Deferred => {}
                TransactionState::Unknown => {
                    debug!(product_id = %transaction.product_id, "Ignoring unknown transaction kind");
                }
            }
        }
    }

    async fn handle_purchased(self: &Arc<Self>, product_id: &str) {
        let Some(theme_id) = self.catalog.theme_for_product(product_id) else {
            warn!(product_id = %product_id, "Purchased transaction for unknown product, skipping");
            return;
        };
        let theme_id = theme_id.to_string();
        {
            let mut state = self.state.lock().await;
            // Idempotent: re-adding an owned theme changes nothing.
            if state.owned.insert(theme_id.clone()) {
                self.persist_owned(&state);
            }
            state.active = theme_id.clone();
            state.loading = false;
            state.last_error = None;
            self.store.set_string(CURRENT_THEME_KEY, &theme_id);
        }
        info!(theme_id = %theme_id, "Purchase completed");
        let _ = self.events.send(ThemeEvent::PurchaseCompleted {
            theme_id: theme_id.clone(),
        });
        let _ = self.events.send(ThemeEvent::ActiveThemeChanged { theme_id });

        // Reconcile quietly against the receipt; any other purchases it
        // attests get unlocked too.
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_receipt_validation(None).await;
        });
    }

    async fn handle_restored(&self, product_id: &str) {
        let Some(theme_id) = self.catalog.theme_for_product(product_id) else {
            warn!(product_id = %product_id, "Restored transaction for unknown product, skipping");
            return;
        };
        let theme_id = theme_id.to_string();
        {
            let mut state = self.state.lock().await;
            if state.owned.insert(theme_id.clone()) {
                self.persist_owned(&state);
            }
            state.loading = false;
        }
        info!(theme_id = %theme_id, "Purchase restored");
        let _ = self.events.send(ThemeEvent::PurchaseRestored { theme_id });
    }

    async fn handle_failed(&self, code: TransactionErrorCode, message: String) {
        {
            let mut state = self.state.lock().await;
            state.loading = false;
            if code == TransactionErrorCode::PaymentCancelled {
                // Cancellation is the user changing their mind, not an error.
                state.last_error = None;
            }
        }
        if code == TransactionErrorCode::PaymentCancelled {
            debug!("Payment cancelled by user");
            return;
        }
        let reason = match code {
            TransactionErrorCode::PaymentInvalid => FailureReason::PaymentInvalid,
            TransactionErrorCode::PaymentNotAllowed => FailureReason::PaymentsNotAllowed,
            TransactionErrorCode::StoreProductNotAvailable => {
                FailureReason::StoreProductNotAvailable
            }
            TransactionErrorCode::CloudServicePermissionDenied => {
                FailureReason::CloudServicePermissionDenied
            }
            TransactionErrorCode::CloudServiceNetworkConnectionFailed => {
                FailureReason::CloudServiceNetworkConnectionFailed
            }
            TransactionErrorCode::PaymentCancelled | TransactionErrorCode::Unknown => {
                FailureReason::Other(message)
            }
        };
        warn!(reason = %reason, "Transaction failed");
        self.fail(reason).await;
    }

    // ------------------------------------------------------------------
    // Receipt validation
    // ------------------------------------------------------------------

    /// Run the receipt validation round trip.
    ///
    /// `attempt` is `Some` when driven by [`restore`](Self::restore): the
    /// outcome then only applies while that attempt is still current, and
    /// validation failure degrades to the platform's native restore. With
    /// `None` (post-purchase reconciliation) recognized themes are added
    /// quietly and failures are only logged.
    async fn run_receipt_validation(self: Arc<Self>, attempt: Option<u64>) {
        let Some(receipt) = self.receipts.local_receipt().await else {
            debug!("No local receipt, requesting a fresh one");
            self.receipts.request_refresh().await;
            return;
        };

        match self
            .verifier
            .verify(&receipt, self.receipts.environment())
            .await
        {
            Ok(product_ids) => self.apply_receipt(product_ids, attempt).await,
            Err(e) => {
                warn!(error = %e, "Receipt validation failed");
                if attempt.is_some() {
                    // Degrade to the platform's own restore rather than
                    // surfacing an error to the user.
                    self.queue.restore_completed_transactions().await;
                }
            }
        }
    }

    async fn apply_receipt(&self, product_ids: Vec<String>, attempt: Option<u64>) {
        let mut recognized: Vec<String> = Vec::new();
        for product_id in &product_ids {
            match self.catalog.theme_for_product(product_id) {
                Some(theme_id) => {
                    if !recognized.iter().any(|t| t == theme_id) {
                        recognized.push(theme_id.to_string());
                    }
                }
                None => {
                    warn!(product_id = %product_id, "Unknown product id in receipt, skipping");
                }
            }
        }

        let Some(generation) = attempt else {
            // Post-purchase reconciliation: quiet idempotent adds only.
            let mut state = self.state.lock().await;
            let mut changed = false;
            for theme_id in recognized {
                changed |= state.owned.insert(theme_id);
            }
            if changed {
                self.persist_owned(&state);
            }
            return;
        };

        let newly: Vec<String> = {
            let mut state = self.state.lock().await;
            if !(state.loading && state.restore_generation == generation) {
                debug!(generation, "Stale restore response ignored");
                return;
            }
            let newly: Vec<String> = recognized
                .iter()
                .filter(|t| !state.owned.contains(*t))
                .cloned()
                .collect();
            for theme_id in &newly {
                state.owned.insert(theme_id.clone());
            }
            if !newly.is_empty() {
                self.persist_owned(&state);
            }
            state.loading = false;
            newly
        };

        info!(restored = newly.len(), "Restore completed");
        let _ = self.events.send(ThemeEvent::RestoreCompleted {
            restored_count: newly.len(),
            theme_ids: newly,
        });

        if recognized.is_empty() {
            // Valid receipt with no recognizable purchases: let the
            // platform's native restore have a go as a safety net.
            debug!("Receipt held no recognizable products, falling back to native restore");
            self.queue.restore_completed_transactions().await;
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn persist_owned(&self, state: &State) {
        let list: Vec<String> = state.owned.iter().cloned().collect();
        self.store.set_string_list(PURCHASED_THEMES_KEY, &list);
    }

    async fn fail(&self, reason: FailureReason) {
        self.state.lock().await.last_error = Some(reason.to_string());
        let _ = self.events.send(ThemeEvent::Failed { reason });
    }
}

// ============================================================================
// Tests
// ============================================================================
