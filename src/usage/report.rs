//! Dashboard summary and cost report export.

use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{CostForecast, DateRange, ForecastPeriod, ModuleCostBreakdown, ResearcherUsage, UsageAccountant};
use crate::{HyphaeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryPeriod {
    Day,
    Week,
    Month,
}

impl SummaryPeriod {
    fn days(&self) -> u64 {
        match self {
            SummaryPeriod::Day => 1,
            SummaryPeriod::Week => 7,
            SummaryPeriod::Month => 30,
        }
    }

    fn forecast(&self) -> ForecastPeriod {
        match self {
            SummaryPeriod::Day => ForecastPeriod::Week,
            SummaryPeriod::Week => ForecastPeriod::Month,
            SummaryPeriod::Month => ForecastPeriod::Quarter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Csv,
    Json,
}

impl FromStr for ReportFormat {
    type Err = HyphaeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "json" => Ok(ReportFormat::Json),
            other => Err(HyphaeError::InvalidInput(format!("unknown report format: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeriodTotals {
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub active_users: usize,
    pub active_modules: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeriodComparison {
    pub previous_cost: f64,
    pub previous_requests: u64,
    /// Percent change in cost against the previous period; 0 without a baseline.
    pub cost_change: f64,
    pub requests_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub timestamp: DateTime<Utc>,
    pub current_period: PeriodTotals,
    pub comparison: PeriodComparison,
    /// Up to five modules.
    pub top_modules: Vec<ModuleCostBreakdown>,
    /// Up to ten users.
    pub top_users: Vec<ResearcherUsage>,
    pub forecast: CostForecast,
}

#[derive(Serialize)]
struct CostReport<'a> {
    module_breakdown: &'a [ModuleCostBreakdown],
    researchers: &'a [ResearcherUsage],
}

const CSV_HEADER: &str = "Report Type,Module/User,Total Cost,Total Requests,Total Tokens,Avg Cost/Request";

impl UsageAccountant {
    pub async fn dashboard_summary(&self, period: SummaryPeriod) -> Result<DashboardSummary> {
        self.dashboard_summary_as_of(period, Utc::now().date_naive()).await
    }

    /// Summary of the `period` ending on `today`, compared with the period
    /// before it.
    pub async fn dashboard_summary_as_of(
        &self,
        period: SummaryPeriod,
        today: NaiveDate,
    ) -> Result<DashboardSummary> {
        let range = DateRange::trailing(today, period.days());
        let previous = DateRange {
            start: range
                .start
                .checked_sub_days(Days::new(period.days()))
                .unwrap_or(range.start),
            end: range.start.pred_opt().unwrap_or(range.start),
        };

        let current = self.get_historical_stats(range).await?;
        let before = self.get_historical_stats(previous).await?;
        let modules = self.get_module_cost_breakdown(range).await?;
        let users = self.get_researcher_usage(range).await?;
        let forecast = self.forecast_as_of(period.forecast(), today).await?;

        let current_period = PeriodTotals {
            total_cost: current.values().map(|d| d.total_cost).sum(),
            total_requests: current.values().map(|d| d.total_requests).sum(),
            total_tokens: current.values().map(|d| d.total_tokens).sum(),
            active_users: users.len(),
            active_modules: modules.len(),
        };
        let previous_cost: f64 = before.values().map(|d| d.total_cost).sum();
        let previous_requests: u64 = before.values().map(|d| d.total_requests).sum();
        let comparison = PeriodComparison {
            previous_cost,
            previous_requests,
            cost_change: percent_change(current_period.total_cost, previous_cost),
            requests_change: percent_change(current_period.total_requests as f64, previous_requests as f64),
        };

        Ok(DashboardSummary {
            timestamp: Utc::now(),
            current_period,
            comparison,
            top_modules: modules.into_iter().take(5).collect(),
            top_users: users.into_iter().take(10).collect(),
            forecast,
        })
    }

    /// Module and researcher spend over `range` as CSV or pretty JSON.
    pub async fn export_cost_report(&self, range: DateRange, format: ReportFormat) -> Result<String> {
        let modules = self.get_module_cost_breakdown(range).await?;
        let researchers = self.get_researcher_usage(range).await?;

        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(&CostReport {
                module_breakdown: &modules,
                researchers: &researchers,
            })?),
            ReportFormat::Csv => {
                let mut csv = String::from(CSV_HEADER);
                csv.push('\n');
                for m in &modules {
                    let _ = writeln!(
                        csv,
                        "Module,{},{:.4},{},{},{:.4}",
                        m.module, m.total_cost, m.total_requests, m.total_tokens, m.avg_cost_per_request
                    );
                }
                for r in &researchers {
                    let avg = if r.total_requests == 0 {
                        0.0
                    } else {
                        r.total_cost / r.total_requests as f64
                    };
                    let _ = writeln!(
                        csv,
                        "Researcher,{},{:.4},{},{},{avg:.4}",
                        r.user_id, r.total_cost, r.total_requests, r.total_tokens
                    );
                }
                Ok(csv)
            }
        }
    }
}

fn percent_change(current: f64, previous: f64) -> f64 {
    if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::usage::{AccountingConfig, Module, TokenUsageEvent};
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    async fn seeded() -> UsageAccountant {
        let acct = UsageAccountant::new(Arc::new(MemoryStore::new()), AccountingConfig::default());
        acct.record(
            TokenUsageEvent::new("alice", "openai/gpt-4o")
                .cost(2.0)
                .tokens(100, 100)
                .module(Module::YieldPrediction)
                .at(at(2026, 3, 9)),
        )
        .await;
        acct.record(TokenUsageEvent::new("bob", "openai/gpt-4o-mini").cost(0.5).tokens(10, 10).at(at(2026, 3, 10)))
            .await;
        acct.record(TokenUsageEvent::new("bob", "openai/gpt-4o-mini").cost(0.5).tokens(10, 10).at(at(2026, 3, 10)))
            .await;
        acct
    }

    fn march(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[tokio::test]
    async fn csv_report() {
        let acct = seeded().await;
        let csv = acct
            .export_cost_report(DateRange::new(march(1), march(31)), ReportFormat::Csv)
            .await
            .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "Module,yield-prediction,2.0000,1,200,2.0000");
        assert_eq!(lines[2], "Module,general-chat,1.0000,2,40,0.5000");
        assert_eq!(lines[3], "Researcher,alice,2.0000,1,200,2.0000");
        assert_eq!(lines[4], "Researcher,bob,1.0000,2,40,0.5000");
    }

    #[tokio::test]
    async fn json_report() {
        let acct = seeded().await;
        let json = acct
            .export_cost_report(DateRange::new(march(1), march(31)), ReportFormat::Json)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["module_breakdown"].as_array().unwrap().len(), 2);
        assert_eq!(value["researchers"][0]["user_id"], "alice");
    }

    #[tokio::test]
    async fn week_summary() {
        let acct = seeded().await;
        let summary = acct.dashboard_summary_as_of(SummaryPeriod::Week, march(10)).await.unwrap();
        assert_eq!(summary.current_period.total_requests, 3);
        assert_eq!(summary.current_period.total_cost, 3.0);
        assert_eq!(summary.current_period.active_users, 2);
        assert_eq!(summary.current_period.active_modules, 2);
        assert_eq!(summary.comparison.cost_change, 0.0);
        assert_eq!(summary.forecast.period, ForecastPeriod::Month);
    }

    #[test]
    fn report_format_parsing() {
        assert_eq!("CSV".parse::<ReportFormat>().unwrap(), ReportFormat::Csv);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
