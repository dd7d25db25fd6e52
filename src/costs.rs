//! Cost tracking and budget enforcement.
//!
//! Every cloud call (embedding, rerank, LLM completion) records a usage row
//! through [`CostTracker::track`]. Costs come from a static pricing table
//! keyed by `(provider, model)`; unknown pairs are recorded at zero cost
//! with a warning. After each insert the tracker re-checks monthly spend
//! against the configured budget: at 80% it raises a `warning` alert, at
//! 100% it raises `limit_reached` and flips the process into fallback mode.
//!
//! Fallback mode is a [`RuntimeOverrides`] value shared by constructor
//! injection, not an ambient global. While active, embedding selection
//! resolves to `local`, rerank selection to `local_rerank`, and
//! contradiction detection is disabled, regardless of per-call overrides,
//! until explicitly cleared.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::BudgetConfig;
use crate::error::Result;
use crate::models::{AlertType, BudgetAlert, CostOperation, CostRecord, now_ts};
use crate::store::{Store, UsageBreakdown};

/// Alert dedupe window: at most one alert per `(type, period)` per day.
const ALERT_DEDUPE_SECS: i64 = 24 * 60 * 60;
/// Fraction of the monthly budget that triggers a warning alert.
const WARNING_FRACTION: f64 = 0.8;

/// How a `(provider, model)` pair is priced.
#[derive(Debug, Clone, Copy)]
enum Price {
    /// USD per 1,000 tokens.
    PerKiloTokens(f64),
    /// Flat USD per request.
    PerRequest(f64),
}

/// Static pricing table. Embedding prices are per-1K tokens (local runs
/// free), reranking is per request, LLM completions are per-1K input
/// tokens.
const PRICING: &[(&str, &str, Price)] = &[
    ("local", "bge-base-en-v1.5", Price::PerKiloTokens(0.0)),
    (
        "general_cloud",
        "text-embedding-3-small",
        Price::PerKiloTokens(0.00002),
    ),
    ("code_cloud", "voyage-code-3", Price::PerKiloTokens(0.00018)),
    ("cloud_rerank", "rerank-v3.5", Price::PerRequest(0.002)),
    (
        "anthropic",
        "claude-3-5-haiku-latest",
        Price::PerKiloTokens(0.0008),
    ),
];

/// Compute the USD cost for a call. Unknown `(provider, model)` pairs log
/// a warning and cost zero.
pub fn compute_cost(provider: &str, model: &str, tokens: i64) -> f64 {
    for (p, m, price) in PRICING {
        if *p == provider && *m == model {
            return match price {
                Price::PerKiloTokens(rate) => rate * tokens as f64 / 1000.0,
                Price::PerRequest(flat) => *flat,
            };
        }
    }
    warn!(provider, model, "no pricing entry; recording zero cost");
    0.0
}

/// Process-wide degradation switches, atomically toggled by the budget
/// guard and read cooperatively by the routers.
#[derive(Debug, Default)]
pub struct RuntimeOverrides {
    budget_fallback: AtomicBool,
}

impl RuntimeOverrides {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True once the monthly budget has been exhausted.
    pub fn fallback_active(&self) -> bool {
        self.budget_fallback.load(Ordering::Relaxed)
    }

    pub fn enable_fallback(&self) {
        self.budget_fallback.store(true, Ordering::Relaxed);
    }

    /// Explicit operator reset (e.g. when the billing month rolls over).
    pub fn clear_fallback(&self) {
        self.budget_fallback.store(false, Ordering::Relaxed);
    }
}

/// A single usage event to record.
#[derive(Debug, Clone)]
pub struct Usage {
    pub provider: String,
    pub operation: CostOperation,
    pub tokens: i64,
    pub model: String,
    pub collection_id: Option<String>,
}

/// Records usage rows and enforces the monthly budget.
#[derive(Clone)]
pub struct CostTracker {
    store: Store,
    budget: BudgetConfig,
    overrides: Arc<RuntimeOverrides>,
}

impl CostTracker {
    pub fn new(store: Store, budget: BudgetConfig, overrides: Arc<RuntimeOverrides>) -> Self {
        Self {
            store,
            budget,
            overrides,
        }
    }

    pub fn overrides(&self) -> Arc<RuntimeOverrides> {
        self.overrides.clone()
    }

    /// Record usage without blocking the caller. Insert and budget check
    /// run on a spawned task; failures are logged, never surfaced.
    pub fn track(&self, usage: Usage) {
        let tracker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.record(usage).await {
                warn!(error = %e, "failed to record usage");
            }
        });
    }

    /// Insert the usage row, then re-check the budget. Awaitable variant
    /// of [`track`] used internally and by tests.
    pub async fn record(&self, usage: Usage) -> Result<()> {
        let cost_usd = compute_cost(&usage.provider, &usage.model, usage.tokens);
        let record = CostRecord {
            provider: usage.provider,
            operation: usage.operation,
            tokens_used: usage.tokens,
            cost_usd,
            model: usage.model,
            collection_id: usage.collection_id,
            created_at: now_ts(),
        };
        self.store.insert_cost(&record).await?;

        if self.budget.alerts_enabled {
            self.check_budget().await?;
        }
        Ok(())
    }

    /// Spend since the start of the current UTC month.
    pub async fn monthly_spend(&self) -> Result<f64> {
        self.store.spend_since(month_start_ts()).await
    }

    /// Spend for one UTC calendar day.
    pub async fn daily_spend(&self, date: NaiveDate) -> Result<f64> {
        let start = Utc
            .from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"))
            .timestamp();
        let end = start + 86_400;
        let total = self.store.spend_since(start).await?;
        let after = self.store.spend_since(end).await?;
        Ok(total - after)
    }

    pub async fn breakdown(&self, start_ts: i64, end_ts: i64) -> Result<Vec<UsageBreakdown>> {
        self.store.usage_breakdown(start_ts, end_ts).await
    }

    /// Compare monthly spend to the budget, raising alerts and toggling
    /// fallback mode as thresholds are crossed.
    pub async fn check_budget(&self) -> Result<()> {
        let budget = self.budget.monthly_usd;
        if budget <= 0.0 {
            return Ok(());
        }
        let spend = self.monthly_spend().await?;

        if spend >= budget {
            if !self.overrides.fallback_active() {
                warn!(spend, budget, "monthly budget exhausted; enabling fallback mode");
            }
            self.overrides.enable_fallback();
            self.raise_alert(AlertType::LimitReached, budget, spend).await?;
        } else if spend >= budget * WARNING_FRACTION {
            self.raise_alert(AlertType::Warning, budget * WARNING_FRACTION, spend)
                .await?;
        }
        Ok(())
    }

    async fn raise_alert(&self, alert_type: AlertType, threshold: f64, spend: f64) -> Result<()> {
        if self
            .store
            .alert_within(alert_type, "monthly", ALERT_DEDUPE_SECS)
            .await?
        {
            return Ok(());
        }
        info!(alert = alert_type.as_str(), spend, "budget alert raised");
        self.store
            .insert_alert(&BudgetAlert {
                alert_type,
                period: "monthly".to_string(),
                threshold_usd: threshold,
                current_spend_usd: spend,
                triggered_at: now_ts(),
            })
            .await
    }
}

/// Unix timestamp for the first instant of the current UTC month.
pub fn month_start_ts() -> i64 {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn tracker_with_budget(monthly_usd: f64) -> CostTracker {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        CostTracker::new(
            Store::new(pool),
            BudgetConfig {
                monthly_usd,
                alerts_enabled: true,
            },
            RuntimeOverrides::new(),
        )
    }

    fn usage(provider: &str, model: &str, tokens: i64) -> Usage {
        Usage {
            provider: provider.to_string(),
            operation: CostOperation::Embed,
            tokens,
            model: model.to_string(),
            collection_id: None,
        }
    }

    #[test]
    fn pricing_per_kilo_tokens() {
        let cost = compute_cost("code_cloud", "voyage-code-3", 10_000);
        assert!((cost - 0.0018).abs() < 1e-9);
        assert_eq!(compute_cost("local", "bge-base-en-v1.5", 1_000_000), 0.0);
    }

    #[test]
    fn pricing_per_request_ignores_tokens() {
        assert_eq!(compute_cost("cloud_rerank", "rerank-v3.5", 1), 0.002);
        assert_eq!(compute_cost("cloud_rerank", "rerank-v3.5", 999), 0.002);
    }

    #[test]
    fn unknown_pricing_is_zero() {
        assert_eq!(compute_cost("mystery", "model-x", 5_000), 0.0);
    }

    #[tokio::test]
    async fn budget_trip_enables_fallback_and_dedupes() {
        let tracker = tracker_with_budget(1.0).await;

        // $1.10 of code_cloud embedding: 0.00018/1K * ~6.1M tokens
        tracker
            .record(usage("code_cloud", "voyage-code-3", 6_200_000))
            .await
            .unwrap();

        assert!(tracker.overrides().fallback_active());

        let alerts = tracker.store.list_alerts(10).await.unwrap();
        let limit_alerts: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::LimitReached)
            .collect();
        assert_eq!(limit_alerts.len(), 1);

        // A second tracked call inside the dedupe window must not add
        // another limit_reached alert.
        tracker
            .record(usage("code_cloud", "voyage-code-3", 1_000))
            .await
            .unwrap();
        let alerts = tracker.store.list_alerts(10).await.unwrap();
        let limit_alerts: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::LimitReached)
            .collect();
        assert_eq!(limit_alerts.len(), 1);
    }

    #[tokio::test]
    async fn warning_at_eighty_percent() {
        let tracker = tracker_with_budget(1.0).await;

        // ~$0.85 spend
        tracker
            .record(usage("code_cloud", "voyage-code-3", 4_750_000))
            .await
            .unwrap();

        assert!(!tracker.overrides().fallback_active());
        let alerts = tracker.store.list_alerts(10).await.unwrap();
        assert!(alerts.iter().any(|a| a.alert_type == AlertType::Warning));
        assert!(!alerts.iter().any(|a| a.alert_type == AlertType::LimitReached));
    }

    #[tokio::test]
    async fn breakdown_aggregates_by_provider_and_operation() {
        let tracker = tracker_with_budget(100.0).await;
        tracker
            .record(usage("code_cloud", "voyage-code-3", 1_000))
            .await
            .unwrap();
        tracker
            .record(usage("code_cloud", "voyage-code-3", 3_000))
            .await
            .unwrap();

        let rows = tracker
            .breakdown(0, now_ts() + 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_count, 2);
        assert_eq!(rows[0].total_tokens, 4_000);
        assert!(rows[0].avg_cost_per_request > 0.0);
    }

    #[tokio::test]
    async fn fallback_clear_is_explicit() {
        let overrides = RuntimeOverrides::new();
        overrides.enable_fallback();
        assert!(overrides.fallback_active());
        overrides.clear_fallback();
        assert!(!overrides.fallback_active());
    }
}
