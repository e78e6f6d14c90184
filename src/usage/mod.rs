//! Token usage and cost accounting.
//!
//! Each completed request produces one [`TokenUsageEvent`]. Recording it
//! stores the raw event briefly and folds it into several additive
//! aggregates under the `tokens:` prefix:
//!
//! | key                              | contents            | ttl    |
//! |----------------------------------|---------------------|--------|
//! | `tokens:{user}:events:{ts}:{id}` | raw event           | 24 h   |
//! | `tokens:daily:{YYYY-MM-DD}`      | [`UsageStats`]      | 90 d   |
//! | `tokens:{user}:totals`           | [`UserTotals`]      | 1 y    |
//! | `tokens:models:{model}`          | [`ModelStats`]      | 90 d   |
//! | `tokens:modules:{module}:{day}`  | [`ModuleDayStats`]  | 90 d   |
//! | `tokens:{user}:modules:{module}` | cost (f64)          | 90 d   |
//!
//! Aggregates are read-modify-write. Two instances updating the same
//! aggregate in the same instant can lose one contribution.

pub mod forecast;
pub mod report;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

pub use forecast::{CostForecast, ForecastPeriod, ModuleProjection, Trend, forecast_from_series};
pub use report::{
    DashboardSummary, PeriodComparison, PeriodTotals, ReportFormat, SummaryPeriod,
};

use crate::store::{self, StateStore, StoreError, StoreResult, prefix, unix_millis};
use crate::{HyphaeError, Result, telemetry};

/// Product area a request is attributed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Module {
    CroweVision,
    GrowthAnalytics,
    EnvironmentalMonitoring,
    YieldPrediction,
    ContaminationDetection,
    SpeciesLibrary,
    #[default]
    GeneralChat,
    BatchAnalysis,
}

impl Module {
    pub const ALL: [Module; 8] = [
        Module::CroweVision,
        Module::GrowthAnalytics,
        Module::EnvironmentalMonitoring,
        Module::YieldPrediction,
        Module::ContaminationDetection,
        Module::SpeciesLibrary,
        Module::GeneralChat,
        Module::BatchAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::CroweVision => "crowe-vision",
            Module::GrowthAnalytics => "growth-analytics",
            Module::EnvironmentalMonitoring => "environmental-monitoring",
            Module::YieldPrediction => "yield-prediction",
            Module::ContaminationDetection => "contamination-detection",
            Module::SpeciesLibrary => "species-library",
            Module::GeneralChat => "general-chat",
            Module::BatchAnalysis => "batch-analysis",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = HyphaeError;

    fn from_str(s: &str) -> Result<Self> {
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| HyphaeError::InvalidInput(format!("unknown module: {s}")))
    }
}

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageEvent {
    pub user_id: String,
    pub model_id: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// User charge in USD.
    pub cost: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub cached: bool,
    pub latency_ms: u64,
    #[serde(default)]
    pub module: Module,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TokenUsageEvent {
    pub fn new(user_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            model_id: model_id.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            timestamp: unix_millis(),
            cached: false,
            latency_ms: 0,
            module: Module::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, usd: f64) -> Self {
        self.cost = usd;
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn module(mut self, module: Module) -> Self {
        self.module = module;
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }

    /// UTC calendar day of the event.
    pub fn day(&self) -> NaiveDate {
        day_of(self.timestamp)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDayStats {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    pub avg_latency: f64,
}

/// Daily aggregate across all users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_latency: f64,
    pub cache_hit_rate: f64,
    pub errors: u64,
    pub error_rate: f64,
    pub by_model: BTreeMap<String, ModelDayStats>,
}

impl UsageStats {
    fn apply(&mut self, event: &TokenUsageEvent) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        self.total_tokens += event.total_tokens();
        self.total_cost += event.cost;
        self.avg_latency = running_mean(self.avg_latency, n, event.latency_ms as f64);
        let hit = if event.cached { 1.0 } else { 0.0 };
        self.cache_hit_rate = running_mean(self.cache_hit_rate, n, hit);
        self.refresh_error_rate();

        let model = self.by_model.entry(event.model_id.clone()).or_default();
        model.requests += 1;
        model.tokens += event.total_tokens();
        model.cost += event.cost;
        model.avg_latency = running_mean(model.avg_latency, model.requests as f64, event.latency_ms as f64);
    }

    fn refresh_error_rate(&mut self) {
        let attempts = self.total_requests + self.errors;
        self.error_rate = if attempts == 0 {
            0.0
        } else {
            self.errors as f64 / attempts as f64
        };
    }
}

/// Lifetime totals for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserTotals {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub last_used: i64,
}

/// Rolling per-model performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_latency: f64,
    pub p95_latency: u64,
    pub p99_latency: u64,
    pub last_used: i64,
    /// Most recent latencies, oldest first.
    pub latency_history: Vec<u64>,
}

impl ModelStats {
    fn apply(&mut self, event: &TokenUsageEvent, window: usize) {
        self.total_requests += 1;
        self.total_tokens += event.total_tokens();
        self.total_cost += event.cost;
        self.last_used = event.timestamp;
        self.avg_latency =
            running_mean(self.avg_latency, self.total_requests as f64, event.latency_ms as f64);

        self.latency_history.push(event.latency_ms);
        if self.latency_history.len() > window {
            let excess = self.latency_history.len() - window;
            self.latency_history.drain(..excess);
        }
        let mut sorted = self.latency_history.clone();
        sorted.sort_unstable();
        self.p95_latency = percentile(&sorted, 0.95);
        self.p99_latency = percentile(&sorted, 0.99);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub cost: f64,
    pub requests: u64,
}

/// One module's usage on one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDayStats {
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub by_model: BTreeMap<String, ModelCost>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopModel {
    pub model_id: String,
    pub cost: f64,
    pub requests: u64,
}

/// Module spend over a date range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleCostBreakdown {
    pub module: Module,
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub avg_cost_per_request: f64,
    pub percent_of_total: f64,
    /// Up to five models, most expensive first.
    pub top_models: Vec<TopModel>,
}

/// Per-user spend summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearcherUsage {
    pub user_id: String,
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub cost_by_module: BTreeMap<Module, f64>,
    /// Unix milliseconds.
    pub last_active: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserUsage {
    #[serde(flatten)]
    pub totals: UserTotals,
    /// Most recent events first.
    pub recent_events: Vec<TokenUsageEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserDataExport {
    pub totals: Option<UserTotals>,
    pub events: Vec<TokenUsageEvent>,
}

/// Inclusive range of UTC days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// `days` days back from `end`, inclusive of both ends.
    pub fn trailing(end: NaiveDate, days: u64) -> Self {
        let start = end.checked_sub_days(Days::new(days)).unwrap_or(end);
        Self { start, end }
    }

    /// Every day in the range; empty if `start > end`.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

/// Retention and window sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub event_ttl_secs: u64,
    pub aggregate_ttl_secs: u64,
    pub user_ttl_secs: u64,
    /// Latency samples kept per model for percentiles.
    pub latency_window: usize,
    /// Events returned by [`UsageAccountant::get_user_usage`].
    pub recent_events: usize,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            event_ttl_secs: 86_400,
            aggregate_ttl_secs: 90 * 86_400,
            user_ttl_secs: 365 * 86_400,
            latency_window: 100,
            recent_events: 20,
        }
    }
}

/// Records usage events and serves the aggregates.
pub struct UsageAccountant {
    store: Arc<dyn StateStore>,
    config: AccountingConfig,
    // Serializes aggregate read-modify-write within this process.
    aggregates: Mutex<()>,
}

impl UsageAccountant {
    pub fn new(store: Arc<dyn StateStore>, config: AccountingConfig) -> Self {
        Self {
            store,
            config,
            aggregates: Mutex::new(()),
        }
    }

    /// Fold one event into every aggregate. Never fails the caller.
    pub async fn record(&self, event: TokenUsageEvent) {
        metrics::counter!(telemetry::TOKENS_TOTAL, "model" => event.model_id.clone(), "direction" => "prompt")
            .increment(u64::from(event.input_tokens));
        metrics::counter!(telemetry::TOKENS_TOTAL, "model" => event.model_id.clone(), "direction" => "completion")
            .increment(u64::from(event.output_tokens));
        metrics::histogram!(telemetry::REQUEST_COST_USD, "model" => event.model_id.clone())
            .record(event.cost);

        let _guard = self.aggregates.lock().await;
        let (raw, daily, user, model, module) = tokio::join!(
            self.store_event(&event),
            self.update_daily(&event),
            self.update_user(&event),
            self.update_model(&event),
            self.update_module(&event),
        );
        for (aggregate, result) in [
            ("event", raw),
            ("daily", daily),
            ("user", user),
            ("model", model),
            ("module", module),
        ] {
            if let Err(e) = result {
                self.swallow(aggregate, &e);
            }
        }
    }

    /// Count a failed request against today's error rate.
    pub async fn record_error(&self, model_id: &str) {
        let key = self.daily_key(Utc::now().date_naive());
        let _guard = self.aggregates.lock().await;
        let result = async {
            let mut stats: UsageStats = store::get_json(self.store.as_ref(), &key).await?.unwrap_or_default();
            stats.errors += 1;
            stats.refresh_error_rate();
            store::set_json(self.store.as_ref(), &key, &stats, self.aggregate_ttl()).await
        };
        if let Err(e) = result.await {
            warn!(model = model_id, error = %e, "failed to record error");
            self.count_store_error();
        }
    }

    /// Lifetime totals plus the most recent events, or `None` for an
    /// unknown user.
    pub async fn get_user_usage(&self, user_id: &str) -> Result<Option<UserUsage>> {
        let Some(totals) = store::get_json::<UserTotals>(self.store.as_ref(), &self.totals_key(user_id)).await?
        else {
            return Ok(None);
        };
        let mut keys = self.store.keys(&self.events_pattern(user_id)).await?;
        keys.sort_unstable_by(|a, b| b.cmp(a));
        keys.truncate(self.config.recent_events);
        let recent_events = self.fetch_events(&keys).await?;
        Ok(Some(UserUsage { totals, recent_events }))
    }

    pub async fn get_daily_stats(&self, date: NaiveDate) -> Result<Option<UsageStats>> {
        Ok(store::get_json(self.store.as_ref(), &self.daily_key(date)).await?)
    }

    pub async fn get_model_stats(&self, model_id: &str) -> Result<Option<ModelStats>> {
        Ok(store::get_json(self.store.as_ref(), &self.model_key(model_id)).await?)
    }

    pub async fn get_all_model_stats(&self) -> Result<BTreeMap<String, ModelStats>> {
        let model_prefix = store::key(prefix::TOKENS, &["models", ""]);
        let keys = self.store.keys(&store::glob(prefix::TOKENS, &["models"])).await?;
        let stats: Vec<Option<ModelStats>> = store::mget_json(self.store.as_ref(), &keys).await?;
        Ok(keys
            .iter()
            .zip(stats)
            .filter_map(|(key, stats)| {
                let model = key.strip_prefix(&model_prefix)?;
                Some((model.to_owned(), stats?))
            })
            .collect())
    }

    /// Daily stats for every day in `range` that has data.
    pub async fn get_historical_stats(&self, range: DateRange) -> Result<BTreeMap<NaiveDate, UsageStats>> {
        let days: Vec<NaiveDate> = range.days().collect();
        let keys: Vec<String> = days.iter().map(|d| self.daily_key(*d)).collect();
        let stats: Vec<Option<UsageStats>> = store::mget_json(self.store.as_ref(), &keys).await?;
        Ok(days
            .into_iter()
            .zip(stats)
            .filter_map(|(day, stats)| Some((day, stats?)))
            .collect())
    }

    /// Spend per module over `range`, most expensive first. Modules with no
    /// spend are omitted.
    pub async fn get_module_cost_breakdown(&self, range: DateRange) -> Result<Vec<ModuleCostBreakdown>> {
        let days: Vec<NaiveDate> = range.days().collect();
        let mut breakdown = Vec::new();

        for module in Module::ALL {
            let keys: Vec<String> = days.iter().map(|d| self.module_day_key(module, *d)).collect();
            let per_day: Vec<Option<ModuleDayStats>> = store::mget_json(self.store.as_ref(), &keys).await?;

            let mut total = ModuleDayStats::default();
            for day in per_day.into_iter().flatten() {
                total.total_cost += day.total_cost;
                total.total_requests += day.total_requests;
                total.total_tokens += day.total_tokens;
                for (model, cost) in day.by_model {
                    let entry = total.by_model.entry(model).or_default();
                    entry.cost += cost.cost;
                    entry.requests += cost.requests;
                }
            }
            if total.total_cost <= 0.0 {
                continue;
            }

            let mut top_models: Vec<TopModel> = total
                .by_model
                .into_iter()
                .map(|(model_id, c)| TopModel {
                    model_id,
                    cost: c.cost,
                    requests: c.requests,
                })
                .collect();
            top_models.sort_by(|a, b| b.cost.total_cmp(&a.cost));
            top_models.truncate(5);

            breakdown.push(ModuleCostBreakdown {
                module,
                total_cost: total.total_cost,
                total_requests: total.total_requests,
                total_tokens: total.total_tokens,
                avg_cost_per_request: ratio(total.total_cost, total.total_requests as f64),
                percent_of_total: 0.0,
                top_models,
            });
        }

        let grand_total: f64 = breakdown.iter().map(|m| m.total_cost).sum();
        for item in &mut breakdown {
            item.percent_of_total = ratio(item.total_cost, grand_total) * 100.0;
        }
        breakdown.sort_by(|a, b| b.total_cost.total_cmp(&a.total_cost));
        Ok(breakdown)
    }

    /// Users active on or after `range.start`, highest lifetime spend first.
    pub async fn get_researcher_usage(&self, range: DateRange) -> Result<Vec<ResearcherUsage>> {
        let since = range
            .start
            .and_hms_opt(0, 0, 0)
            .map_or(0, |t| t.and_utc().timestamp_millis());
        let totals_keys = self.store.keys(&store::key(prefix::TOKENS, &["*", "totals"])).await?;
        let user_prefix = store::key(prefix::TOKENS, &[""]);
        let totals: Vec<Option<UserTotals>> = store::mget_json(self.store.as_ref(), &totals_keys).await?;

        let mut researchers = Vec::new();
        for (key, totals) in totals_keys.iter().zip(totals) {
            let Some(totals) = totals else { continue };
            let Some(user_id) = key
                .strip_prefix(&user_prefix)
                .and_then(|rest| rest.strip_suffix(":totals"))
            else {
                continue;
            };
            if totals.last_used < since {
                continue;
            }
            let module_keys: Vec<String> = Module::ALL
                .iter()
                .map(|m| self.user_module_key(user_id, *m))
                .collect();
            let costs: Vec<Option<f64>> = store::mget_json(self.store.as_ref(), &module_keys).await?;
            let cost_by_module = Module::ALL
                .into_iter()
                .zip(costs)
                .filter_map(|(module, cost)| cost.filter(|c| *c > 0.0).map(|c| (module, c)))
                .collect();

            researchers.push(ResearcherUsage {
                user_id: user_id.to_owned(),
                total_cost: totals.total_cost,
                total_requests: totals.total_requests,
                total_tokens: totals.total_tokens,
                cost_by_module,
                last_active: totals.last_used,
            });
        }
        researchers.sort_by(|a, b| b.total_cost.total_cmp(&a.total_cost));
        Ok(researchers)
    }

    pub async fn export_user_data(&self, user_id: &str) -> Result<UserDataExport> {
        let totals = store::get_json(self.store.as_ref(), &self.totals_key(user_id)).await?;
        let mut keys = self.store.keys(&self.events_pattern(user_id)).await?;
        keys.sort_unstable();
        let events = self.fetch_events(&keys).await?;
        Ok(UserDataExport { totals, events })
    }

    /// Remove a user's totals, events and module rollups.
    pub async fn delete_user_data(&self, user_id: &str) -> Result<()> {
        let mut keys = self.store.keys(&self.events_pattern(user_id)).await?;
        keys.extend(
            self.store
                .keys(&store::glob(prefix::TOKENS, &[user_id, "modules"]))
                .await?,
        );
        keys.push(self.totals_key(user_id));
        self.store.del_many(&keys).await?;
        Ok(())
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    async fn fetch_events(&self, keys: &[String]) -> StoreResult<Vec<TokenUsageEvent>> {
        let events: Vec<Option<TokenUsageEvent>> = store::mget_json(self.store.as_ref(), keys).await?;
        Ok(events.into_iter().flatten().collect())
    }

    async fn store_event(&self, event: &TokenUsageEvent) -> StoreResult<()> {
        let key = store::key(
            prefix::TOKENS,
            &[
                &event.user_id,
                "events",
                &format!("{:013}", event.timestamp),
                &uuid::Uuid::new_v4().to_string(),
            ],
        );
        let ttl = Duration::from_secs(self.config.event_ttl_secs);
        store::set_json(self.store.as_ref(), &key, event, ttl).await
    }

    async fn update_daily(&self, event: &TokenUsageEvent) -> StoreResult<()> {
        let key = self.daily_key(event.day());
        let mut stats: UsageStats = store::get_json(self.store.as_ref(), &key).await?.unwrap_or_default();
        stats.apply(event);
        store::set_json(self.store.as_ref(), &key, &stats, self.aggregate_ttl()).await
    }

    async fn update_user(&self, event: &TokenUsageEvent) -> StoreResult<()> {
        let key = self.totals_key(&event.user_id);
        let mut totals: UserTotals = store::get_json(self.store.as_ref(), &key).await?.unwrap_or_default();
        totals.total_requests += 1;
        totals.total_tokens += event.total_tokens();
        totals.total_cost += event.cost;
        totals.last_used = event.timestamp;
        let ttl = Duration::from_secs(self.config.user_ttl_secs);
        store::set_json(self.store.as_ref(), &key, &totals, ttl).await
    }

    async fn update_model(&self, event: &TokenUsageEvent) -> StoreResult<()> {
        let key = self.model_key(&event.model_id);
        let mut stats: ModelStats = store::get_json(self.store.as_ref(), &key).await?.unwrap_or_default();
        stats.apply(event, self.config.latency_window);
        store::set_json(self.store.as_ref(), &key, &stats, self.aggregate_ttl()).await
    }

    async fn update_module(&self, event: &TokenUsageEvent) -> StoreResult<()> {
        let key = self.module_day_key(event.module, event.day());
        let mut day: ModuleDayStats = store::get_json(self.store.as_ref(), &key).await?.unwrap_or_default();
        day.total_cost += event.cost;
        day.total_requests += 1;
        day.total_tokens += event.total_tokens();
        let model = day.by_model.entry(event.model_id.clone()).or_default();
        model.cost += event.cost;
        model.requests += 1;
        store::set_json(self.store.as_ref(), &key, &day, self.aggregate_ttl()).await?;

        let user_key = self.user_module_key(&event.user_id, event.module);
        let spent: f64 = store::get_json(self.store.as_ref(), &user_key).await?.unwrap_or(0.0);
        store::set_json(self.store.as_ref(), &user_key, &(spent + event.cost), self.aggregate_ttl()).await
    }

    fn aggregate_ttl(&self) -> Duration {
        Duration::from_secs(self.config.aggregate_ttl_secs)
    }

    fn daily_key(&self, date: NaiveDate) -> String {
        store::key(prefix::TOKENS, &["daily", &date.to_string()])
    }

    fn totals_key(&self, user_id: &str) -> String {
        store::key(prefix::TOKENS, &[user_id, "totals"])
    }

    fn events_pattern(&self, user_id: &str) -> String {
        store::glob(prefix::TOKENS, &[user_id, "events"])
    }

    fn model_key(&self, model_id: &str) -> String {
        store::key(prefix::TOKENS, &["models", model_id])
    }

    fn module_day_key(&self, module: Module, date: NaiveDate) -> String {
        store::key(prefix::TOKENS, &["modules", module.as_str(), &date.to_string()])
    }

    fn user_module_key(&self, user_id: &str, module: Module) -> String {
        store::key(prefix::TOKENS, &[user_id, "modules", module.as_str()])
    }

    fn swallow(&self, aggregate: &str, error: &StoreError) {
        warn!(aggregate, error = %error, "failed to update usage aggregate");
        self.count_store_error();
    }

    fn count_store_error(&self) {
        metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "component" => "usage").increment(1);
    }
}

pub(crate) fn day_of(timestamp_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .date_naive()
}

fn running_mean(mean: f64, n: f64, sample: f64) -> f64 {
    (mean * (n - 1.0) + sample) / n
}

/// `sorted[floor(len * p)]`, clamped to the last element; 0 when empty.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 { 0.0 } else { numerator / denominator }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn accountant() -> UsageAccountant {
        UsageAccountant::new(Arc::new(MemoryStore::new()), AccountingConfig::default())
    }

    fn ts(date: &str) -> i64 {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn daily_aggregate_running_averages() {
        let acct = accountant();
        let day = "2026-03-02";
        acct.record(TokenUsageEvent::new("u1", "openai/gpt-4o").tokens(100, 50).cost(0.01).latency_ms(100).at(ts(day)))
            .await;
        acct.record(
            TokenUsageEvent::new("u2", "openai/gpt-4o")
                .tokens(10, 5)
                .latency_ms(300)
                .cached(true)
                .at(ts(day)),
        )
        .await;

        let stats = acct.get_daily_stats(date(day)).await.unwrap().unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_tokens, 165);
        assert!((stats.total_cost - 0.01).abs() < 1e-9);
        assert!((stats.avg_latency - 200.0).abs() < 1e-9);
        assert!((stats.cache_hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.by_model["openai/gpt-4o"].requests, 2);
    }

    #[tokio::test]
    async fn error_rate_counts_failures() {
        let acct = accountant();
        acct.record(TokenUsageEvent::new("u", "m")).await;
        acct.record(TokenUsageEvent::new("u", "m")).await;
        acct.record(TokenUsageEvent::new("u", "m")).await;
        acct.record_error("m").await;
        let stats = acct.get_daily_stats(Utc::now().date_naive()).await.unwrap().unwrap();
        assert_eq!(stats.errors, 1);
        assert!((stats.error_rate - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn model_percentiles_over_bounded_window() {
        let acct = accountant();
        for latency in 1..=150 {
            acct.record(TokenUsageEvent::new("u", "m").latency_ms(latency)).await;
        }
        let stats = acct.get_model_stats("m").await.unwrap().unwrap();
        assert_eq!(stats.total_requests, 150);
        assert_eq!(stats.latency_history.len(), 100);
        assert_eq!(stats.latency_history[0], 51);
        // window is 51..=150: sorted[95] = 146, sorted[99] = 150
        assert_eq!(stats.p95_latency, 146);
        assert_eq!(stats.p99_latency, 150);

        let all = acct.get_all_model_stats().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["m"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_all_counted() {
        let acct = Arc::new(accountant());
        let day = ts("2026-03-02");
        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let acct = Arc::clone(&acct);
                tokio::spawn(async move {
                    acct.record(TokenUsageEvent::new("u", "m").tokens(1, 1).cost(0.5).at(day)).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let usage = acct.get_user_usage("u").await.unwrap().unwrap();
        assert_eq!(usage.totals.total_requests, 40);
        assert_eq!(usage.totals.total_tokens, 80);
        let daily = acct.get_daily_stats(date("2026-03-02")).await.unwrap().unwrap();
        assert_eq!(daily.total_requests, 40);
        assert_eq!(acct.get_model_stats("m").await.unwrap().unwrap().total_requests, 40);
    }

    #[tokio::test]
    async fn user_usage_and_gdpr_operations() {
        let acct = accountant();
        assert!(acct.get_user_usage("u").await.unwrap().is_none());
        for i in 0..25 {
            acct.record(TokenUsageEvent::new("u", "m").cost(0.001).at(1_700_000_000_000 + i)).await;
        }
        let usage = acct.get_user_usage("u").await.unwrap().unwrap();
        assert_eq!(usage.totals.total_requests, 25);
        assert_eq!(usage.recent_events.len(), 20);
        assert_eq!(usage.recent_events[0].timestamp, 1_700_000_000_024);

        let export = acct.export_user_data("u").await.unwrap();
        assert_eq!(export.events.len(), 25);
        assert!(export.totals.is_some());

        acct.delete_user_data("u").await.unwrap();
        assert!(acct.get_user_usage("u").await.unwrap().is_none());
        assert!(acct.export_user_data("u").await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn module_breakdown_and_researchers() {
        let acct = accountant();
        let day = ts("2026-03-02");
        acct.record(TokenUsageEvent::new("alice", "openai/gpt-4o").cost(3.0).tokens(10, 10).module(Module::CroweVision).at(day))
            .await;
        acct.record(TokenUsageEvent::new("bob", "openai/gpt-4o-mini").cost(1.0).tokens(5, 5).at(day))
            .await;

        let range = DateRange::new(date("2026-03-01"), date("2026-03-03"));
        let breakdown = acct.get_module_cost_breakdown(range).await.unwrap();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].module, Module::CroweVision);
        assert!((breakdown[0].percent_of_total - 75.0).abs() < 1e-9);
        assert_eq!(breakdown[1].module, Module::GeneralChat);
        assert_eq!(breakdown[1].top_models[0].model_id, "openai/gpt-4o-mini");

        let researchers = acct.get_researcher_usage(range).await.unwrap();
        assert_eq!(researchers.len(), 2);
        assert_eq!(researchers[0].user_id, "alice");
        assert_eq!(researchers[0].cost_by_module[&Module::CroweVision], 3.0);

        let later = DateRange::new(date("2026-04-01"), date("2026-04-02"));
        assert!(acct.get_researcher_usage(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_ids_are_matched_literally() {
        let acct = accountant();
        let day = ts("2026-03-02");
        acct.record(TokenUsageEvent::new("org:alice", "m").cost(2.0).at(day)).await;
        acct.record(TokenUsageEvent::new("*", "m").cost(1.0).at(day)).await;
        acct.record(TokenUsageEvent::new("bob", "m").cost(0.5).at(day)).await;

        let range = DateRange::new(date("2026-03-01"), date("2026-03-03"));
        let researchers = acct.get_researcher_usage(range).await.unwrap();
        let ids: Vec<_> = researchers.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["org:alice", "*", "bob"]);

        acct.delete_user_data("*").await.unwrap();
        assert!(acct.get_user_usage("*").await.unwrap().is_none());
        assert!(acct.get_user_usage("bob").await.unwrap().is_some());
        assert_eq!(acct.export_user_data("org:alice").await.unwrap().events.len(), 1);
    }

    #[tokio::test]
    async fn historical_stats_skip_empty_days() {
        let acct = accountant();
        acct.record(TokenUsageEvent::new("u", "m").at(ts("2026-03-02"))).await;
        let range = DateRange::new(date("2026-03-01"), date("2026-03-05"));
        let stats = acct.get_historical_stats(range).await.unwrap();
        assert_eq!(stats.keys().copied().collect::<Vec<_>>(), vec![date("2026-03-02")]);
    }

    #[test]
    fn date_range_days() {
        let range = DateRange::trailing(date("2026-03-07"), 7);
        assert_eq!(range.days().count(), 8);
        assert_eq!(DateRange::new(date("2026-03-02"), date("2026-03-01")).days().count(), 0);
    }

    #[test]
    fn module_names_round_trip() {
        for module in Module::ALL {
            assert_eq!(module.as_str().parse::<Module>().unwrap(), module);
        }
        assert!("lab".parse::<Module>().is_err());
        assert_eq!(Module::default(), Module::GeneralChat);
    }
}
