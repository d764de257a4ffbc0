//! SiteGate Core - normalization, rule matching, decisions and intercept
//! counting.
//!
//! This crate holds everything the proxy needs to decide whether a request
//! is blocked, independent of any network I/O:
//!
//! - [`normalize`]: canonical hostnames from URLs and hosts
//! - [`matcher`]: exact, domain, contains, regex and wildcard patterns
//! - [`rule_engine`]: prioritized rules with schedules and user groups
//! - [`recorder`]: per-site, per-day intercept counters
//! - [`events`]: interception events and observers
//! - [`store`]: persistence collaborator traits

pub mod error;
pub mod events;
pub mod matcher;
pub mod normalize;
pub mod recorder;
pub mod rule_engine;
pub mod rules;
pub mod schedule;
pub mod store;

pub use error::{Result, RuleError, StoreError};
pub use events::{InterceptEvent, InterceptObserver, Protocol, SharedObserver};
pub use matcher::{matches, CompiledPattern, CompiledRule, MatchInput};
pub use normalize::{is_same_or_subdomain, normalize};
pub use recorder::{local_date, InterceptRecord, InterceptRecorder, InterceptStat};
pub use rule_engine::{Decision, RuleEngine, RuleSnapshot, RuleSource};
pub use rules::{BlockRule, BlockedDomain, MatchType, RuleAction, RulePatch, RuleSet, UserGroup};
pub use schedule::{Schedule, TimeOfDay, TimeRange, Weekday};
pub use store::{InterceptIncrement, InterceptStore, RuleStore, StoreResult};
