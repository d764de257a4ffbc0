//! Rule engine: ordered rules, schedules, user groups and the blocked-domain
//! fallback.
//!
//! ## Evaluation Order
//!
//! 1. Resolve the caller's group (the single group containing the user)
//! 2. Walk enabled rules by priority descending, ties by insertion order
//! 3. Skip rules scoped to other groups, rules outside their schedule, and
//!    rules whose pattern does not match
//! 4. The first surviving rule decides
//! 5. Otherwise an enabled blocked domain matching the host blocks
//! 6. Otherwise allow
//!
//! The current state lives in an immutable [`RuleSnapshot`] behind an
//! `Arc`. Readers clone the `Arc` and evaluate without holding a lock;
//! mutations build a new snapshot and swap it in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RuleError};
use crate::matcher::{CompiledRule, MatchInput};
use crate::normalize::normalize;
use crate::rules::{BlockRule, BlockedDomain, RuleAction, RulePatch, RuleSet, UserGroup};
use crate::schedule::Schedule;
use crate::store::{RuleStore, StoreResult};

/// What produced a decision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RuleSource {
    /// Nothing matched (default allow).
    #[default]
    None,
    /// An advanced rule matched.
    Rule {
        /// The rule's id.
        rule_id: String,
        /// The rule's priority.
        priority: i32,
    },
    /// An entry of the simple blocklist matched.
    BlockedDomain {
        /// The blocked domain.
        domain: String,
    },
}

impl RuleSource {
    /// Returns the id of the rule, or the domain of the blocklist entry.
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            RuleSource::None => None,
            RuleSource::Rule { rule_id, .. } => Some(rule_id),
            RuleSource::BlockedDomain { domain } => Some(domain),
        }
    }

    /// Returns true if something matched.
    pub fn has_rule(&self) -> bool {
        !matches!(self, RuleSource::None)
    }
}

/// Outcome of [`RuleEngine::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Decision {
    /// The action to take.
    pub action: RuleAction,
    /// What produced the action.
    pub source: RuleSource,
    /// Set when `action` is [`RuleAction::Redirect`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
}

impl Decision {
    /// Default allow.
    pub fn allow() -> Self {
        Self::default()
    }

    fn from_rule(rule: &BlockRule) -> Self {
        Self {
            action: rule.action,
            source: RuleSource::Rule {
                rule_id: rule.id.clone(),
                priority: rule.priority,
            },
            redirect_target: match rule.action {
                RuleAction::Redirect => rule.redirect_target.clone(),
                _ => None,
            },
        }
    }

    fn blocked_domain(domain: &str) -> Self {
        Self {
            action: RuleAction::Block,
            source: RuleSource::BlockedDomain {
                domain: domain.to_string(),
            },
            redirect_target: None,
        }
    }

    /// Id of the matched rule, or the blocked domain for the simple form.
    ///
    /// This is the `site_id` intercepts are counted under.
    pub fn matched_rule_id(&self) -> Option<&str> {
        self.source.rule_id()
    }

    /// Returns true if the action is Block.
    pub fn should_block(&self) -> bool {
        self.action == RuleAction::Block
    }

    /// Returns true if the action is Redirect.
    pub fn is_redirect(&self) -> bool {
        self.action == RuleAction::Redirect
    }

    /// Returns true if the action is Allow.
    pub fn should_allow(&self) -> bool {
        self.action == RuleAction::Allow
    }
}

#[derive(Debug, Clone)]
struct RuleEntry {
    seq: u64,
    compiled: Arc<CompiledRule>,
}

/// Immutable view of everything the engine holds.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    rules: HashMap<String, RuleEntry>,
    /// All rules in evaluation order.
    order: Vec<Arc<CompiledRule>>,
    groups: Vec<UserGroup>,
    schedules: Vec<Schedule>,
    blocked_domains: Vec<BlockedDomain>,
    /// Enabled blocked domains.
    blocked_index: HashSet<String>,
    next_seq: u64,
}

impl RuleSnapshot {
    /// Evaluates a URL or host for a user at a local wall-clock time.
    pub fn decide(&self, url: &str, user_id: Option<&str>, now: NaiveDateTime) -> Decision {
        let input = MatchInput::new(url);
        let group = user_id.and_then(|u| self.group_for(u)).map(|g| g.id.as_str());

        for compiled in &self.order {
            let rule = compiled.rule();
            if !rule.enabled {
                continue;
            }

            if !rule.user_group_ids.is_empty() {
                match group {
                    Some(g) if rule.user_group_ids.contains(g) => {}
                    _ => continue,
                }
            }

            if let Some(schedule_id) = &rule.schedule_id {
                match self.schedule(schedule_id) {
                    Some(schedule) if schedule.is_active(now) => {}
                    Some(_) => continue,
                    None => {
                        warn!(rule_id = %rule.id, schedule_id = %schedule_id, "Rule references unknown schedule, skipping");
                        continue;
                    }
                }
            }

            if compiled.is_match(&input) {
                return Decision::from_rule(rule);
            }
        }

        match self.blocked_domain_for(input.host()) {
            Some(domain) => Decision::blocked_domain(domain),
            None => Decision::allow(),
        }
    }

    /// Returns the group containing `user_id`.
    pub fn group_for(&self, user_id: &str) -> Option<&UserGroup> {
        self.groups.iter().find(|g| g.contains(user_id))
    }

    /// Looks up a rule by id.
    pub fn rule(&self, id: &str) -> Option<&BlockRule> {
        self.rules.get(id).map(|e| e.compiled.rule())
    }

    /// Looks up a schedule by id.
    pub fn schedule(&self, id: &str) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.id == id)
    }

    /// Looks up a group by id.
    pub fn group(&self, id: &str) -> Option<&UserGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &BlockRule> {
        self.order.iter().map(|c| c.rule())
    }

    /// Groups in insertion order.
    pub fn groups(&self) -> &[UserGroup] {
        &self.groups
    }

    /// Schedules in insertion order.
    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// The simple blocklist.
    pub fn blocked_domains(&self) -> &[BlockedDomain] {
        &self.blocked_domains
    }

    /// Number of rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Exports the snapshot as a [`RuleSet`].
    pub fn to_ruleset(&self) -> RuleSet {
        RuleSet {
            schedules: self.schedules.clone(),
            groups: self.groups.clone(),
            rules: self.rules().cloned().collect(),
            blocked_domains: self.blocked_domains.clone(),
        }
    }

    /// Finds the most specific enabled blocked domain covering `host`.
    fn blocked_domain_for(&self, host: &str) -> Option<&str> {
        let mut candidate = host;
        loop {
            if let Some(found) = self.blocked_index.get(candidate) {
                return Some(found.as_str());
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return None,
            }
        }
    }

    fn reindex(&mut self) {
        let mut entries: Vec<&RuleEntry> = self.rules.values().collect();
        entries.sort_by(|a, b| {
            b.compiled
                .rule()
                .priority
                .cmp(&a.compiled.rule().priority)
                .then(a.seq.cmp(&b.seq))
        });
        self.order = entries.into_iter().map(|e| Arc::clone(&e.compiled)).collect();

        self.blocked_index = self
            .blocked_domains
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.domain.clone())
            .collect();
    }

    fn check_references(&self, rule: &BlockRule) -> Result<()> {
        for group_id in &rule.user_group_ids {
            if self.group(group_id).is_none() {
                return Err(RuleError::invalid(
                    "user_group_ids",
                    format!("unknown group '{}'", group_id),
                ));
            }
        }
        if let Some(schedule_id) = &rule.schedule_id {
            if self.schedule(schedule_id).is_none() {
                return Err(RuleError::invalid(
                    "schedule_id",
                    format!("unknown schedule '{}'", schedule_id),
                ));
            }
        }
        Ok(())
    }

    fn insert_rule(&mut self, rule: BlockRule) -> Result<BlockRule> {
        rule.validate()?;
        if self.rules.contains_key(&rule.id) {
            return Err(RuleError::Duplicate {
                kind: "rule",
                id: rule.id,
            });
        }
        self.check_references(&rule)?;

        let compiled = CompiledRule::new(rule.clone())?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rules.insert(
            rule.id.clone(),
            RuleEntry {
                seq,
                compiled: Arc::new(compiled),
            },
        );
        Ok(rule)
    }

    fn patch_rule(&mut self, id: &str, patch: RulePatch) -> Result<BlockRule> {
        let entry = self.rules.get(id).ok_or_else(|| RuleError::NotFound {
            kind: "rule",
            id: id.to_string(),
        })?;

        let mut rule = entry.compiled.rule().clone();
        let seq = entry.seq;
        rule.apply(patch);
        rule.validate()?;
        self.check_references(&rule)?;
        rule.updated_at = Utc::now();

        let compiled = CompiledRule::new(rule.clone())?;
        self.rules.insert(
            rule.id.clone(),
            RuleEntry {
                seq,
                compiled: Arc::new(compiled),
            },
        );
        Ok(rule)
    }

    fn remove_rule(&mut self, id: &str) -> Result<BlockRule> {
        self.rules
            .remove(id)
            .map(|e| e.compiled.rule().clone())
            .ok_or_else(|| RuleError::NotFound {
                kind: "rule",
                id: id.to_string(),
            })
    }

    fn insert_group(&mut self, group: UserGroup) -> Result<UserGroup> {
        group.validate()?;
        if self.group(&group.id).is_some() {
            return Err(RuleError::Duplicate {
                kind: "group",
                id: group.id,
            });
        }
        for member in &group.members {
            if let Some(existing) = self.group_for(member) {
                return Err(RuleError::invalid(
                    "members",
                    format!("user '{}' already belongs to group '{}'", member, existing.id),
                ));
            }
        }
        self.groups.push(group.clone());
        Ok(group)
    }

    fn remove_group(&mut self, id: &str) -> Result<UserGroup> {
        let index = self
            .groups
            .iter()
            .position(|g| g.id == id)
            .ok_or_else(|| RuleError::NotFound {
                kind: "group",
                id: id.to_string(),
            })?;
        if let Some(rule) = self.rules().find(|r| r.user_group_ids.contains(id)) {
            return Err(RuleError::InUse {
                kind: "group",
                id: id.to_string(),
                by: rule.id.clone(),
            });
        }
        Ok(self.groups.remove(index))
    }

    fn insert_schedule(&mut self, schedule: Schedule) -> Result<Schedule> {
        schedule.validate()?;
        if self.schedule(&schedule.id).is_some() {
            return Err(RuleError::Duplicate {
                kind: "schedule",
                id: schedule.id,
            });
        }
        self.schedules.push(schedule.clone());
        Ok(schedule)
    }

    fn remove_schedule(&mut self, id: &str) -> Result<Schedule> {
        let index = self
            .schedules
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RuleError::NotFound {
                kind: "schedule",
                id: id.to_string(),
            })?;
        if let Some(rule) = self.rules().find(|r| r.schedule_id.as_deref() == Some(id)) {
            return Err(RuleError::InUse {
                kind: "schedule",
                id: id.to_string(),
                by: rule.id.clone(),
            });
        }
        Ok(self.schedules.remove(index))
    }

    fn replace_blocked_domains(&mut self, domains: Vec<BlockedDomain>) -> Result<Vec<BlockedDomain>> {
        let mut seen = HashSet::new();
        let mut cleaned = Vec::with_capacity(domains.len());
        for entry in domains {
            let domain = normalize(&entry.domain);
            if domain.is_empty() {
                return Err(RuleError::invalid("domain", "must not be empty"));
            }
            if seen.insert(domain.clone()) {
                cleaned.push(BlockedDomain {
                    domain,
                    enabled: entry.enabled,
                });
            }
        }
        self.blocked_domains = cleaned.clone();
        Ok(cleaned)
    }
}

/// Thread-safe rule engine shared between the management surface and the
/// proxy.
pub struct RuleEngine {
    current: RwLock<Arc<RuleSnapshot>>,
    /// Serializes writers so clone/modify/swap never loses an update.
    write_lock: Mutex<()>,
    store: Option<Arc<dyn RuleStore>>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.current.read().rule_count())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Creates an empty engine without persistence.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSnapshot::default())),
            write_lock: Mutex::new(()),
            store: None,
        }
    }

    /// Attaches a store that is signalled after every successful mutation.
    pub fn with_store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds an engine by replaying a persisted rule set.
    ///
    /// Schedules are loaded first, then groups, rules and blocked domains, so
    /// every reference is checked. The store is not signalled during replay.
    pub fn from_ruleset(set: RuleSet) -> Result<Self> {
        let mut snapshot = RuleSnapshot::default();
        for schedule in set.schedules {
            snapshot.insert_schedule(schedule)?;
        }
        for group in set.groups {
            snapshot.insert_group(group)?;
        }
        for rule in set.rules {
            snapshot.insert_rule(rule)?;
        }
        snapshot.replace_blocked_domains(set.blocked_domains)?;
        snapshot.reindex();

        info!(
            rules = snapshot.rules.len(),
            groups = snapshot.groups.len(),
            schedules = snapshot.schedules.len(),
            blocked_domains = snapshot.blocked_domains.len(),
            "Loaded rule set"
        );

        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
            store: None,
        })
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&*self.current.read())
    }

    /// Evaluates a URL or host for a user at a local wall-clock time.
    pub fn decide(&self, url: &str, user_id: Option<&str>, now: NaiveDateTime) -> Decision {
        let decision = self.snapshot().decide(url, user_id, now);
        debug!(url, user = ?user_id, action = decision.action.name(), rule = ?decision.matched_rule_id(), "Decision");
        decision
    }

    /// Evaluates using the host's local wall clock.
    pub fn decide_now(&self, url: &str, user_id: Option<&str>) -> Decision {
        self.decide(url, user_id, Local::now().naive_local())
    }

    /// Replaces the simple blocklist. Domains are normalized and deduplicated.
    pub fn update_blocked_domains(&self, domains: Vec<BlockedDomain>) -> Result<()> {
        self.mutate(
            "update_blocked_domains",
            |snap| snap.replace_blocked_domains(domains),
            |store, domains| store.replace_blocked_domains(domains),
        )
        .map(|_| ())
    }

    /// Adds a rule. Its id must be unique.
    pub fn add_rule(&self, rule: BlockRule) -> Result<()> {
        self.mutate(
            "add_rule",
            |snap| snap.insert_rule(rule),
            |store, rule| store.save_rule(rule),
        )
        .map(|_| ())
    }

    /// Applies a patch to an existing rule, returning the updated rule.
    ///
    /// The rule keeps its position among equal-priority rules.
    pub fn update_rule(&self, id: &str, patch: RulePatch) -> Result<BlockRule> {
        self.mutate(
            "update_rule",
            |snap| snap.patch_rule(id, patch),
            |store, rule| store.save_rule(rule),
        )
    }

    /// Deletes a rule, returning it.
    pub fn delete_rule(&self, id: &str) -> Result<BlockRule> {
        self.mutate(
            "delete_rule",
            |snap| snap.remove_rule(id),
            |store, rule| store.delete_rule(&rule.id),
        )
    }

    /// Adds a user group. No member may already belong to another group.
    pub fn add_user_group(&self, group: UserGroup) -> Result<()> {
        self.mutate(
            "add_user_group",
            |snap| snap.insert_group(group),
            |store, group| store.save_group(group),
        )
        .map(|_| ())
    }

    /// Removes a group that no rule references.
    pub fn remove_user_group(&self, id: &str) -> Result<UserGroup> {
        self.mutate(
            "remove_user_group",
            |snap| snap.remove_group(id),
            |store, group| store.delete_group(&group.id),
        )
    }

    /// Adds a schedule.
    pub fn add_schedule(&self, schedule: Schedule) -> Result<()> {
        self.mutate(
            "add_schedule",
            |snap| snap.insert_schedule(schedule),
            |store, schedule| store.save_schedule(schedule),
        )
        .map(|_| ())
    }

    /// Removes a schedule that no rule references.
    pub fn remove_schedule(&self, id: &str) -> Result<Schedule> {
        self.mutate(
            "remove_schedule",
            |snap| snap.remove_schedule(id),
            |store, schedule| store.delete_schedule(&schedule.id),
        )
    }

    /// Lists rules in evaluation order.
    pub fn rules(&self) -> Vec<BlockRule> {
        self.snapshot().rules().cloned().collect()
    }

    /// Lists groups.
    pub fn groups(&self) -> Vec<UserGroup> {
        self.snapshot().groups().to_vec()
    }

    /// Lists schedules.
    pub fn schedules(&self) -> Vec<Schedule> {
        self.snapshot().schedules().to_vec()
    }

    /// Lists the simple blocklist.
    pub fn blocked_domains(&self) -> Vec<BlockedDomain> {
        self.snapshot().blocked_domains().to_vec()
    }

    /// Runs `apply` on a copy of the current snapshot and swaps it in on
    /// success, then signals the store.
    fn mutate<T, A, P>(&self, operation: &'static str, apply: A, persist: P) -> Result<T>
    where
        A: FnOnce(&mut RuleSnapshot) -> Result<T>,
        P: FnOnce(&dyn RuleStore, &T) -> StoreResult<()>,
    {
        let _writer = self.write_lock.lock();

        let mut next = RuleSnapshot::clone(&**self.current.read());
        let output = match apply(&mut next) {
            Ok(output) => output,
            Err(e) => {
                debug!(operation, error = %e, "Rule mutation rejected");
                return Err(e);
            }
        };
        next.reindex();
        *self.current.write() = Arc::new(next);

        if let Some(store) = &self.store {
            if let Err(e) = persist(store.as_ref(), &output) {
                warn!(operation, error = %e, "Failed to persist rule change");
            }
        }

        Ok(output)
    }
}
