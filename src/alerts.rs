//! Budget alerts over the usage aggregates.
//!
//! Alert definitions live in one store record. A sweep resolves each
//! enabled alert's spend, persists the refreshed percentages for every
//! alert and notifies only the ones at or above the trigger level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{self, StateStore, prefix};
use crate::usage::{DateRange, Module, UsageAccountant};
use crate::{HyphaeError, Result, telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl AlertPeriod {
    /// First day of the period containing `today`. Weeks start on Monday.
    pub fn start(&self, today: NaiveDate) -> NaiveDate {
        match self {
            AlertPeriod::Daily => today,
            AlertPeriod::Weekly => today
                .checked_sub_days(chrono::Days::new(u64::from(today.weekday().num_days_from_monday())))
                .unwrap_or(today),
            AlertPeriod::Monthly => today.with_day(1).unwrap_or(today),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertScope {
    Global,
    Module,
    User,
}

impl AlertScope {
    fn as_str(&self) -> &'static str {
        match self {
            AlertScope::Global => "global",
            AlertScope::Module => "module",
            AlertScope::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub id: String,
    pub name: String,
    /// USD.
    pub threshold: f64,
    pub period: AlertPeriod,
    pub scope: AlertScope,
    /// Module name or user id for non-global scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub notify_targets: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub current_spend: f64,
    #[serde(default)]
    pub percent_used: f64,
}

impl BudgetAlert {
    pub fn is_triggered(&self) -> bool {
        self.percent_used >= TRIGGER_PERCENT
    }
}

/// Fields supplied when creating an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBudgetAlert {
    pub name: String,
    pub threshold: f64,
    pub period: AlertPeriod,
    pub scope: AlertScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub notify_targets: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetAlertUpdate {
    pub name: Option<String>,
    pub threshold: Option<f64>,
    pub period: Option<AlertPeriod>,
    pub scope: Option<AlertScope>,
    pub scope_id: Option<String>,
    pub notify_targets: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total: usize,
    pub active: usize,
    pub triggered: usize,
    /// The triggered alerts.
    pub alerts: Vec<BudgetAlert>,
}

/// Destination for triggered alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &BudgetAlert) -> Result<()>;
}

/// Writes triggered alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &BudgetAlert) -> Result<()> {
        let spend = format!("{:.2}", alert.current_spend);
        let percent = format!("{:.1}", alert.percent_used);
        warn!(
            alert = %alert.name,
            spend = %spend,
            threshold = alert.threshold,
            percent = %percent,
            targets = %alert.notify_targets.join(", "),
            "budget alert triggered"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Interval between sweeps when run as a loop.
    pub sweep_interval_secs: u64,
    pub retention_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            retention_secs: 365 * 86_400,
        }
    }
}

const TRIGGER_PERCENT: f64 = 80.0;

/// Alert CRUD and sweeps.
pub struct BudgetAlerts {
    store: Arc<dyn StateStore>,
    accountant: Arc<UsageAccountant>,
    notifier: Arc<dyn Notifier>,
    config: AlertsConfig,
}

impl BudgetAlerts {
    pub fn new(store: Arc<dyn StateStore>, accountant: Arc<UsageAccountant>, config: AlertsConfig) -> Self {
        Self {
            store,
            accountant,
            notifier: Arc::new(LogNotifier),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &AlertsConfig {
        &self.config
    }

    pub async fn create(&self, new: NewBudgetAlert) -> Result<BudgetAlert> {
        validate_threshold(new.threshold)?;
        let alert = BudgetAlert {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            threshold: new.threshold,
            period: new.period,
            scope: new.scope,
            scope_id: new.scope_id,
            notify_targets: new.notify_targets,
            enabled: new.enabled,
            current_spend: 0.0,
            percent_used: 0.0,
        };
        let mut alerts = self.list().await?;
        alerts.push(alert.clone());
        self.save(&alerts).await?;
        info!(id = %alert.id, name = %alert.name, "budget alert created");
        Ok(alert)
    }

    pub async fn list(&self) -> Result<Vec<BudgetAlert>> {
        Ok(store::get_json(self.store.as_ref(), &alerts_key())
            .await?
            .unwrap_or_default())
    }

    /// Apply `update` to alert `id`; `None` if no such alert.
    pub async fn update(&self, id: &str, update: BudgetAlertUpdate) -> Result<Option<BudgetAlert>> {
        if let Some(threshold) = update.threshold {
            validate_threshold(threshold)?;
        }
        let mut alerts = self.list().await?;
        let Some(alert) = alerts.iter_mut().find(|a| a.id == id) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            alert.name = name;
        }
        if let Some(threshold) = update.threshold {
            alert.threshold = threshold;
        }
        if let Some(period) = update.period {
            alert.period = period;
        }
        if let Some(scope) = update.scope {
            alert.scope = scope;
        }
        if let Some(scope_id) = update.scope_id {
            alert.scope_id = Some(scope_id);
        }
        if let Some(targets) = update.notify_targets {
            alert.notify_targets = targets;
        }
        if let Some(enabled) = update.enabled {
            alert.enabled = enabled;
        }
        let updated = alert.clone();
        self.save(&alerts).await?;
        Ok(Some(updated))
    }

    /// Remove alert `id`. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut alerts = self.list().await?;
        let before = alerts.len();
        alerts.retain(|a| a.id != id);
        let removed = alerts.len() != before;
        if removed {
            self.save(&alerts).await?;
        }
        Ok(removed)
    }

    /// Refresh every enabled alert's spend and return the triggered subset.
    pub async fn check_alerts(&self) -> Result<Vec<BudgetAlert>> {
        self.check_alerts_as_of(Utc::now().date_naive()).await
    }

    pub async fn check_alerts_as_of(&self, today: NaiveDate) -> Result<Vec<BudgetAlert>> {
        let mut alerts = self.list().await?;
        let mut triggered = Vec::new();
        for alert in alerts.iter_mut().filter(|a| a.enabled) {
            alert.current_spend = self.resolve_spend(alert, today).await?;
            alert.percent_used = alert.current_spend / alert.threshold * 100.0;
            if alert.is_triggered() {
                triggered.push(alert.clone());
            }
        }
        self.save(&alerts).await?;
        Ok(triggered)
    }

    /// One sweep: check, then notify each triggered alert. Notifier failures
    /// are logged and do not stop the sweep.
    pub async fn run_sweep(&self) -> Result<Vec<BudgetAlert>> {
        self.run_sweep_as_of(Utc::now().date_naive()).await
    }

    pub async fn run_sweep_as_of(&self, today: NaiveDate) -> Result<Vec<BudgetAlert>> {
        let triggered = self.check_alerts_as_of(today).await?;
        for alert in &triggered {
            metrics::counter!(telemetry::BUDGET_ALERTS_TRIGGERED_TOTAL, "scope" => alert.scope.as_str())
                .increment(1);
            if let Err(e) = self.notifier.notify(alert).await {
                warn!(alert = %alert.name, error = %e, "failed to send alert notification");
            }
        }
        info!(triggered = triggered.len(), "budget alert sweep complete");
        Ok(triggered)
    }

    /// Sweep every `sweep_interval_secs` until the task is dropped.
    pub async fn run_forever(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_sweep().await {
                warn!(error = %e, "budget alert sweep failed");
            }
        }
    }

    /// Counts from the last persisted sweep.
    pub async fn summary(&self) -> Result<AlertSummary> {
        let alerts = self.list().await?;
        let total = alerts.len();
        let active: Vec<BudgetAlert> = alerts.into_iter().filter(|a| a.enabled).collect();
        let triggered: Vec<BudgetAlert> = active.iter().filter(|a| a.is_triggered()).cloned().collect();
        Ok(AlertSummary {
            total,
            active: active.len(),
            triggered: triggered.len(),
            alerts: triggered,
        })
    }

    /// Ready-made alert definitions.
    pub fn templates() -> Vec<NewBudgetAlert> {
        vec![
            NewBudgetAlert {
                name: "Daily Spend Limit".into(),
                threshold: 50.0,
                period: AlertPeriod::Daily,
                scope: AlertScope::Global,
                scope_id: None,
                notify_targets: vec!["admin@lab.com".into()],
                enabled: true,
            },
            NewBudgetAlert {
                name: "Monthly Budget".into(),
                threshold: 1000.0,
                period: AlertPeriod::Monthly,
                scope: AlertScope::Global,
                scope_id: None,
                notify_targets: vec!["admin@lab.com".into(), "finance@lab.com".into()],
                enabled: true,
            },
            NewBudgetAlert {
                name: "Crowe Vision Daily Limit".into(),
                threshold: 20.0,
                period: AlertPeriod::Daily,
                scope: AlertScope::Module,
                scope_id: Some(Module::CroweVision.as_str().into()),
                notify_targets: vec!["vision-team@lab.com".into()],
                enabled: true,
            },
        ]
    }

    async fn resolve_spend(&self, alert: &BudgetAlert, today: NaiveDate) -> Result<f64> {
        match (alert.scope, alert.scope_id.as_deref()) {
            (AlertScope::Global, _) => Ok(self
                .accountant
                .get_daily_stats(today)
                .await?
                .map_or(0.0, |s| s.total_cost)),
            (AlertScope::Module, Some(module)) => {
                let range = DateRange::new(alert.period.start(today), today);
                let breakdown = self.accountant.get_module_cost_breakdown(range).await?;
                Ok(breakdown
                    .iter()
                    .find(|m| m.module.as_str() == module)
                    .map_or(0.0, |m| m.total_cost))
            }
            (AlertScope::User, Some(user)) => Ok(self
                .accountant
                .get_user_usage(user)
                .await?
                .map_or(0.0, |u| u.totals.total_cost)),
            (_, None) => Ok(0.0),
        }
    }

    async fn save(&self, alerts: &[BudgetAlert]) -> Result<()> {
        let ttl = Duration::from_secs(self.config.retention_secs);
        store::set_json(self.store.as_ref(), &alerts_key(), alerts, ttl).await?;
        Ok(())
    }
}

fn alerts_key() -> String {
    store::key(prefix::TOKENS, &["budget-alerts", "config"])
}

fn validate_threshold(threshold: f64) -> Result<()> {
    if threshold.is_finite() && threshold > 0.0 {
        Ok(())
    } else {
        Err(HyphaeError::InvalidInput(format!(
            "alert threshold must be positive, got {threshold}"
        )))
    }
}
