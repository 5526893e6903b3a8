//! Storage, pricing and metrics services.

pub mod catalog;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use catalog::{PriceCatalog, StaticPriceCatalog};
pub use database::Database;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::{BillingRunStore, LedgerStore, NotificationOutbox, SubscriptionStore};
