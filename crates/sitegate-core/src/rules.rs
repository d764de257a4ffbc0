//! Rule data model: block rules, user groups, blocked domains and rule sets.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};
use crate::normalize::normalize;
use crate::schedule::Schedule;

/// How a rule pattern is compared against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Full trimmed input equals the pattern.
    Exact,
    /// Normalized host equals the pattern or is a subdomain of it.
    #[default]
    Domain,
    /// Raw input contains the pattern.
    Contains,
    /// Raw input matches the regular expression.
    Regex,
    /// Shell-style pattern with `*` and `?`, anchored.
    Wildcard,
}

impl MatchType {
    /// Returns the storage name of this match type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Domain => "domain",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
            MatchType::Wildcard => "wildcard",
        }
    }

    /// Parses a storage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchType::Exact),
            "domain" => Some(MatchType::Domain),
            "contains" => Some(MatchType::Contains),
            "regex" => Some(MatchType::Regex),
            "wildcard" => Some(MatchType::Wildcard),
            _ => None,
        }
    }
}

/// Action to take when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Allow the request.
    #[default]
    Allow,
    /// Block the request.
    Block,
    /// Send the client somewhere else.
    Redirect,
}

impl RuleAction {
    /// Returns a human-readable name for this action.
    pub fn name(&self) -> &'static str {
        match self {
            RuleAction::Allow => "Allow",
            RuleAction::Block => "Block",
            RuleAction::Redirect => "Redirect",
        }
    }

    /// Returns the storage name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Block => "block",
            RuleAction::Redirect => "redirect",
        }
    }

    /// Parses a storage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(RuleAction::Allow),
            "block" => Some(RuleAction::Block),
            "redirect" => Some(RuleAction::Redirect),
            _ => None,
        }
    }
}

/// A single match condition with an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRule {
    /// Unique identifier, immutable after creation.
    pub id: String,
    /// Pattern compared against requests.
    pub pattern: String,
    /// How the pattern is compared.
    #[serde(default)]
    pub match_type: MatchType,
    /// Whether comparison is case sensitive.
    #[serde(default)]
    pub case_sensitive: bool,
    /// Disabled rules are never evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher priority rules are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// What to do on a match.
    #[serde(default)]
    pub action: RuleAction,
    /// Target for [`RuleAction::Redirect`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
    /// Groups the rule applies to. Empty means everyone.
    #[serde(default)]
    pub user_group_ids: BTreeSet<String>,
    /// Optional schedule gating the rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    /// When the rule was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the rule was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl BlockRule {
    /// Creates an enabled, case-insensitive rule with priority 0 that applies
    /// to everyone at all times.
    pub fn new(
        id: impl Into<String>,
        pattern: impl Into<String>,
        match_type: MatchType,
        action: RuleAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pattern: pattern.into(),
            match_type,
            case_sensitive: false,
            enabled: true,
            priority: 0,
            action,
            redirect_target: None,
            user_group_ids: BTreeSet::new(),
            schedule_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a domain block rule.
    pub fn block_domain(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::new(id, domain, MatchType::Domain, RuleAction::Block)
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Makes the rule case sensitive.
    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    /// Restricts the rule to a group.
    pub fn for_group(mut self, group_id: impl Into<String>) -> Self {
        self.user_group_ids.insert(group_id.into());
        self
    }

    /// Gates the rule with a schedule.
    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    /// Turns the rule into a redirect to `target`.
    pub fn redirect_to(mut self, target: impl Into<String>) -> Self {
        self.action = RuleAction::Redirect;
        self.redirect_target = Some(target.into());
        self
    }

    /// Disables the rule.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Checks the fields that do not depend on other engine state.
    ///
    /// Pattern compilation and reference checks happen in the engine.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuleError::invalid("id", "must not be empty"));
        }
        if self.pattern.trim().is_empty() {
            return Err(RuleError::invalid("pattern", "must not be empty"));
        }
        match (self.action, self.redirect_target.as_deref()) {
            (RuleAction::Redirect, None) => Err(RuleError::invalid(
                "redirect_target",
                "required for redirect rules",
            )),
            (RuleAction::Redirect, Some(target)) if target.trim().is_empty() => Err(
                RuleError::invalid("redirect_target", "must not be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Applies a patch, leaving `id` and `created_at` untouched.
    pub fn apply(&mut self, patch: RulePatch) {
        if let Some(pattern) = patch.pattern {
            self.pattern = pattern;
        }
        if let Some(match_type) = patch.match_type {
            self.match_type = match_type;
        }
        if let Some(case_sensitive) = patch.case_sensitive {
            self.case_sensitive = case_sensitive;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(action) = patch.action {
            self.action = action;
        }
        if let Some(target) = patch.redirect_target {
            self.redirect_target = target;
        }
        if let Some(groups) = patch.user_group_ids {
            self.user_group_ids = groups;
        }
        if let Some(schedule_id) = patch.schedule_id {
            self.schedule_id = schedule_id;
        }
    }
}

/// Partial update for a [`BlockRule`].
///
/// `None` leaves a field unchanged. For optional fields the inner `Option`
/// is the new value, so `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePatch {
    pub pattern: Option<String>,
    pub match_type: Option<MatchType>,
    pub case_sensitive: Option<bool>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub action: Option<RuleAction>,
    pub redirect_target: Option<Option<String>>,
    pub user_group_ids: Option<BTreeSet<String>>,
    pub schedule_id: Option<Option<String>>,
}

impl RulePatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `enabled`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Sets `priority`.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets `pattern` and `match_type`.
    pub fn pattern(mut self, pattern: impl Into<String>, match_type: MatchType) -> Self {
        self.pattern = Some(pattern.into());
        self.match_type = Some(match_type);
        self
    }

    /// Sets `action`.
    pub fn action(mut self, action: RuleAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Sets or clears the schedule.
    pub fn schedule(mut self, schedule_id: Option<String>) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

/// A named set of users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Member user ids.
    #[serde(default)]
    pub members: BTreeSet<String>,
    /// Free-form permission tags.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl UserGroup {
    /// Creates a group with the given members.
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
            permissions: BTreeSet::new(),
        }
    }

    /// Adds a permission tag.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    /// Returns true if the user is a member.
    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Checks id and name.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuleError::invalid("id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::invalid("name", "must not be empty"));
        }
        if self.members.iter().any(|m| m.trim().is_empty()) {
            return Err(RuleError::invalid("members", "user ids must not be empty"));
        }
        Ok(())
    }
}

/// Entry in the simple blocklist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockedDomain {
    /// Domain, stored normalized.
    pub domain: String,
    /// Disabled entries are ignored.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl BlockedDomain {
    /// Creates an enabled entry, normalizing the domain.
    pub fn new(domain: &str) -> Self {
        Self {
            domain: normalize(domain),
            enabled: true,
        }
    }

    /// Creates a disabled entry.
    pub fn disabled(domain: &str) -> Self {
        Self {
            domain: normalize(domain),
            enabled: false,
        }
    }
}

/// Everything the engine holds, in a form suitable for persistence and
/// configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub schedules: Vec<Schedule>,
    pub groups: Vec<UserGroup>,
    pub rules: Vec<BlockRule>,
    pub blocked_domains: Vec<BlockedDomain>,
}

impl RuleSet {
    /// Returns true if the set holds nothing.
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
            && self.groups.is_empty()
            && self.rules.is_empty()
            && self.blocked_domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rule_defaults() {
        let rule = BlockRule::block_domain("r1", "example.com");
        assert!(rule.enabled);
        assert!(!rule.case_sensitive);
        assert_eq!(rule.priority, 0);
        assert_eq!(rule.action, RuleAction::Block);
        assert_eq!(rule.match_type, MatchType::Domain);
        assert!(rule.user_group_ids.is_empty());
        assert!(rule.schedule_id.is_none());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn redirect_requires_target() {
        let mut rule = BlockRule::new("r", "x.test", MatchType::Domain, RuleAction::Redirect);
        assert_eq!(rule.validate().unwrap_err().field(), Some("redirect_target"));

        rule.redirect_target = Some("   ".to_string());
        assert_eq!(rule.validate().unwrap_err().field(), Some("redirect_target"));

        let rule = BlockRule::block_domain("r", "x.test").redirect_to("https://focus.test/");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn empty_pattern_rejected() {
        let rule = BlockRule::block_domain("r", " ");
        assert_eq!(rule.validate().unwrap_err().field(), Some("pattern"));

        let rule = BlockRule::block_domain("", "x.test");
        assert_eq!(rule.validate().unwrap_err().field(), Some("id"));
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut rule = BlockRule::block_domain("r", "x.test")
            .with_priority(3)
            .with_schedule("work");
        let created = rule.created_at;

        rule.apply(RulePatch::new().enabled(false).schedule(None));

        assert!(!rule.enabled);
        assert_eq!(rule.priority, 3);
        assert_eq!(rule.pattern, "x.test");
        assert!(rule.schedule_id.is_none());
        assert_eq!(rule.created_at, created);
    }

    #[test]
    fn storage_names_round_trip() {
        for mt in [
            MatchType::Exact,
            MatchType::Domain,
            MatchType::Contains,
            MatchType::Regex,
            MatchType::Wildcard,
        ] {
            assert_eq!(MatchType::parse(mt.as_str()), Some(mt));
        }
        assert_eq!(RuleAction::parse("redirect"), Some(RuleAction::Redirect));
        assert_eq!(RuleAction::parse("warn"), None);
    }

    #[test]
    fn rule_deserializes_with_defaults() {
        let rule: BlockRule = serde_json::from_str(
            r#"{"id": "r1", "pattern": "social.example", "action": "block"}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.match_type, MatchType::Domain);
        assert_eq!(rule.priority, 0);
    }

    #[test]
    fn group_membership() {
        let group = UserGroup::new("staff", "Staff", ["alice", "bob"]).with_permission("admin");
        assert!(group.contains("alice"));
        assert!(!group.contains("carol"));
        assert!(group.permissions.contains("admin"));
        assert!(group.validate().is_ok());

        let bad = UserGroup::new("g", "G", [""]);
        assert_eq!(bad.validate().unwrap_err().field(), Some("members"));
    }

    #[test]
    fn blocked_domain_is_normalized() {
        let entry = BlockedDomain::new("https://WWW.Social.Example/feed");
        assert_eq!(entry.domain, "social.example");
        assert!(entry.enabled);
        assert!(!BlockedDomain::disabled("x.test").enabled);
    }

    #[test]
    fn empty_ruleset() {
        assert!(RuleSet::default().is_empty());
        let set: RuleSet = serde_json::from_str("{}").unwrap();
        assert!(set.is_empty());
    }
}
