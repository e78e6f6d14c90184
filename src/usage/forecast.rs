//! Linear cost projection from recent daily spend.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{DateRange, Module, UsageAccountant};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastPeriod {
    Week,
    Month,
    Quarter,
}

impl ForecastPeriod {
    pub fn days(&self) -> u64 {
        match self {
            ForecastPeriod::Week => 7,
            ForecastPeriod::Month => 30,
            ForecastPeriod::Quarter => 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleProjection {
    pub module: Module,
    pub projected: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostForecast {
    pub period: ForecastPeriod,
    /// Spend over the lookback window.
    pub current_spend: f64,
    pub projected_spend: f64,
    pub trend: Trend,
    pub confidence: f64,
    pub breakdown: Vec<ModuleProjection>,
}

const CONFIDENCE: f64 = 0.75;
const STABLE_BAND: f64 = 0.10;

/// `(current_spend, projected_spend, trend)` for a series of daily costs,
/// oldest first, projected over `horizon_days`.
///
/// The trend compares the mean of the second half of the series with the
/// mean of the whole; within ±10% is stable.
pub fn forecast_from_series(daily_costs: &[f64], horizon_days: u64) -> (f64, f64, Trend) {
    if daily_costs.is_empty() {
        return (0.0, 0.0, Trend::Stable);
    }
    let current: f64 = daily_costs.iter().sum();
    let mean = current / daily_costs.len() as f64;
    let projected = mean * horizon_days as f64;

    let recent = &daily_costs[daily_costs.len() / 2..];
    let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let trend = if recent_mean > mean * (1.0 + STABLE_BAND) {
        Trend::Up
    } else if recent_mean < mean * (1.0 - STABLE_BAND) {
        Trend::Down
    } else {
        Trend::Stable
    };
    (current, projected, trend)
}

impl UsageAccountant {
    pub async fn get_forecast(&self, period: ForecastPeriod) -> Result<CostForecast> {
        self.forecast_as_of(period, Utc::now().date_naive()).await
    }

    /// Forecast using the `period.days()` days ending on `today`.
    pub async fn forecast_as_of(&self, period: ForecastPeriod, today: NaiveDate) -> Result<CostForecast> {
        let range = DateRange::trailing(today, period.days());
        let history = self.get_historical_stats(range).await?;
        let series: Vec<f64> = history.values().map(|day| day.total_cost).collect();
        let (current_spend, projected_spend, trend) = forecast_from_series(&series, period.days());

        let observed_days = series.len() as f64;
        let breakdown = if series.is_empty() {
            Vec::new()
        } else {
            self.get_module_cost_breakdown(range)
                .await?
                .into_iter()
                .map(|m| ModuleProjection {
                    module: m.module,
                    projected: m.total_cost / observed_days * period.days() as f64,
                })
                .collect()
        };

        Ok(CostForecast {
            period,
            current_spend,
            projected_spend,
            trend,
            confidence: if series.is_empty() { 0.0 } else { CONFIDENCE },
            breakdown,
        })
    }
}
