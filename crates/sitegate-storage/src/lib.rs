//! SiteGate Storage - SQLite persistence layer.
//!
//! This crate persists the rule configuration and intercept counters for the
//! SiteGate proxy. It handles:
//!
//! - Rules, user groups, schedules and the simple blocklist
//! - Per-site, per-day intercept statistics
//!
//! [`Database`] implements the core crate's `RuleStore` and
//! `InterceptStore`, so it can be attached directly to a rule engine and an
//! intercept recorder.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sitegate_core::{BlockRule, RuleEngine};
//! use sitegate_storage::Database;
//!
//! let db = Arc::new(Database::in_memory().unwrap());
//! let engine = RuleEngine::from_ruleset(db.load_ruleset().unwrap())
//!     .unwrap()
//!     .with_store(db.clone());
//!
//! engine.add_rule(BlockRule::block_domain("social", "social.example")).unwrap();
//! assert_eq!(db.get_rules().unwrap().len(), 1);
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::SiteTotal;
pub use pool::ConnectionPool;
pub use schema::SCHEMA_VERSION;
