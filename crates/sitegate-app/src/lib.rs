//! SiteGate - local forward proxy that blocks sites by rule.
//!
//! This crate provides the application layer around the proxy:
//!
//! - [`config`]: the JSON settings file
//! - [`app`]: loading rules and counters from storage and wiring the proxy
//!
//! # Usage
//!
//! ```ignore
//! use sitegate_app::app::App;
//! use sitegate_app::config::AppConfig;
//! use sitegate_storage::Database;
//!
//! let app = App::open(AppConfig::default(), Database::new()?)?;
//! let proxy = app.proxy()?;
//! proxy.start().await?;
//! ```

pub mod app;
pub mod config;
