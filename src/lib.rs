//! Wardrobe - Theme Entitlement Manager for the Daily Mood Tracker
//!
//! Tracks which cosmetic color themes the user owns and which one is
//! active, and reconciles local entitlement state against platform purchase
//! transactions and server-side receipt validation.
//!
//! The crate owns only the entitlement logic. Everything platform-shaped
//! sits behind traits the embedding app implements:
//!
//! - [`commerce::PaymentQueue`] - the platform payment queue
//! - [`receipt::ReceiptProvider`] - local receipt blob access
//! - [`storage::KeyValueStore`] - durable local settings storage
//!
//! ```ignore
//! let catalog = ThemeCatalog::built_in("com.dailymood.theme");
//! let validator = Arc::new(AppStoreValidator::new(ValidatorConfig::new(secret)));
//! let manager = EntitlementManager::new(
//!     catalog,
//!     EntitlementConfig::default(),
//!     store,
//!     queue,
//!     receipts,
//!     validator,
//! );
//! manager.attach_queue_events();
//! manager.load_products().await;
//! ```

pub mod catalog;
pub mod commerce;
pub mod config;
pub mod manager;
pub mod receipt;
pub mod storage;

pub use catalog::{Color, Palette, Theme, ThemeCatalog, DEFAULT_THEME_ID};
pub use commerce::{PaymentQueue, Product, Transaction, TransactionState};
pub use config::{EntitlementConfig, ValidatorConfig};
pub use manager::{EntitlementManager, FailureReason, SelectThemeError, ThemeEvent};
pub use receipt::{AppStoreValidator, Environment, ReceiptProvider, ReceiptVerifier};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
