//! Wiring between storage, the rule engine, the recorder and the proxy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Days, Local, NaiveDate};
use sitegate_core::{Decision, InterceptRecorder, RuleEngine, RuleSet};
use sitegate_proxy::ProxyServer;
use sitegate_storage::{Database, SiteTotal};
use tokio::task::JoinHandle;

use crate::config::AppConfig;

/// A loaded application: persisted rules and counters ready to serve.
pub struct App {
    config: AppConfig,
    db: Arc<Database>,
    engine: Arc<RuleEngine>,
    recorder: Arc<InterceptRecorder>,
}

impl App {
    /// Loads rules and recent counters from `db`.
    ///
    /// An empty database is seeded from the config's `rules`, if any.
    pub fn open(config: AppConfig, db: Database) -> anyhow::Result<Self> {
        let db = Arc::new(db);

        let mut ruleset = db.load_ruleset().context("Failed to load rules")?;
        if ruleset.is_empty() {
            if let Some(seed) = config.rules.clone() {
                ruleset = seed_rules(&db, seed)?;
            }
        }

        let engine = RuleEngine::from_ruleset(ruleset)
            .context("Stored rules are invalid")?
            .with_store(db.clone());
        tracing::info!(
            "Loaded {} rules, {} groups, {} schedules, {} blocked domains",
            engine.rules().len(),
            engine.groups().len(),
            engine.schedules().len(),
            engine.blocked_domains().len()
        );

        let recorder = InterceptRecorder::new().with_store(db.clone());
        let today = Local::now().date_naive();
        // Same window the recorder keeps on cleanup.
        let since = today
            .checked_sub_days(Days::new(u64::from(config.retention_days)))
            .unwrap_or(NaiveDate::MIN);
        let recent = db
            .get_intercept_stats_range(since, today)
            .context("Failed to load intercept stats")?;
        tracing::debug!("Seeding recorder with {} stat rows", recent.len());
        recorder.seed(recent);

        Ok(Self {
            config,
            db,
            engine: Arc::new(engine),
            recorder: Arc::new(recorder),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn rule_engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn recorder(&self) -> &Arc<InterceptRecorder> {
        &self.recorder
    }

    /// Builds a proxy sharing this app's engine and recorder.
    pub fn proxy(&self) -> anyhow::Result<ProxyServer> {
        let config = self
            .config
            .proxy_config()?
            .with_rule_engine(Arc::clone(&self.engine))
            .with_recorder(Arc::clone(&self.recorder));

        Ok(ProxyServer::new(config))
    }

    /// Decision for `url` right now.
    pub fn check(&self, url: &str, user_id: Option<&str>) -> Decision {
        self.engine.decide_now(url, user_id)
    }

    /// Per-site totals for the last `days` days, today included.
    pub fn site_totals(&self, days: u32) -> anyhow::Result<Vec<SiteTotal>> {
        let today = Local::now().date_naive();
        let since = retention_cutoff(today, days);
        Ok(self.db.get_site_totals(since)?)
    }

    /// Drops counters older than the retention window.
    pub fn cleanup(&self) -> usize {
        let removed = self.recorder.cleanup_older_than(self.config.retention_days);
        tracing::info!(
            "Removed {} intercept rows older than {} days",
            removed,
            self.config.retention_days
        );
        removed
    }

    /// Runs [`App::cleanup`] every `interval` until the task is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let app = Arc::clone(&app);
                if let Err(e) = tokio::task::spawn_blocking(move || app.cleanup()).await {
                    tracing::warn!("Cleanup task failed: {}", e);
                }
            }
        })
    }
}

fn seed_rules(db: &Database, seed: RuleSet) -> anyhow::Result<RuleSet> {
    // Validate before writing anything.
    RuleEngine::from_ruleset(seed.clone()).context("Seed rules in config are invalid")?;
    db.save_ruleset(&seed).context("Failed to store seed rules")?;
    tracing::info!("Seeded database with {} rules from config", seed.rules.len());
    Ok(seed)
}

/// First date kept when keeping `days` days up to `today`.
fn retention_cutoff(today: NaiveDate, days: u32) -> NaiveDate {
    today - chrono::Duration::days(i64::from(days.max(1)) - 1)
}
