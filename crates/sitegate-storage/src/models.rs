//! Read models that only exist at the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Intercept totals for one site over a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTotal {
    pub site_id: String,
    /// Domain recorded for the site.
    pub domain: String,
    pub total: u64,
    /// Number of days with at least one intercept.
    pub days: u32,
    pub last_intercept_at: DateTime<Utc>,
}
