use super::{Pipeline, PipelineError, StageOutcome};
use crate::ledger::JobStage;
use crate::marketplace::MarketplaceError;
use crate::models::{ScrapeResult, TrendUpsert, normalize_keyword};
use serde::Serialize;
use serde_json::json;
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

const STAGE: &str = "scrape";

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub marketplace: String,
    pub ok: bool,
    pub count: usize,
    /// Results came from the last successful scan of this source.
    pub from_cache: bool,
    pub error: Option<String>,
}

impl SourceReport {
    fn succeeded(marketplace: &str, count: usize, from_cache: bool) -> Self {
        Self {
            marketplace: marketplace.to_string(),
            ok: true,
            count,
            from_cache,
            error: None,
        }
    }

    fn failed(marketplace: &str, error: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.to_string(),
            ok: false,
            count: 0,
            from_cache: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeReport {
    pub job_id: Uuid,
    pub trends_upserted: usize,
    pub results_stored: usize,
    pub sources: Vec<SourceReport>,
}

impl Pipeline {
    /// Scans every configured source and merges what they report into the
    /// trend table. One failing source never stops the others.
    pub async fn scrape(&self) -> Result<ScrapeReport, PipelineError> {
        let metadata = json!({ "sources": self.settings.scrape_sources });
        self.tracked(JobStage::Scrape, "batch", metadata, None, |job| async move {
            let mut sources = Vec::new();
            let mut rows = Vec::new();
            let mut attempts = 0;
            let mut unconfigured = 0;

            for name in &self.settings.scrape_sources {
                let Some(adapter) = self.marketplaces.get(name) else {
                    sources.push(SourceReport::failed(name, "unknown marketplace"));
                    unconfigured += 1;
                    continue;
                };
                if !adapter.is_available() {
                    let err = MarketplaceError::NotConfigured(name.clone());
                    warn!(target = "trendforge.pipeline", marketplace = %name, "scrape_source_unavailable");
                    sources.push(SourceReport::failed(name, err.to_string()));
                    unconfigured += 1;
                    continue;
                }

                let context = format!("scan:{name}");
                let adapter_ref = adapter.as_ref();
                let category = self.settings.scan_category.as_deref();
                let limit = self.settings.scan_limit;
                let outcome = self
                    .recovery
                    .run_cached(&context, move || adapter_ref.scan_trends(category, limit))
                    .await;
                attempts += outcome.attempts;

                match outcome.value {
                    Some(results) => {
                        sources.push(SourceReport::succeeded(name, results.len(), false));
                        rows.extend(results);
                    }
                    None => {
                        let message = outcome.failure_message();
                        match self.recovery.cached::<Vec<ScrapeResult>>(&context).await {
                            Some(cached) => {
                                warn!(target = "trendforge.pipeline", marketplace = %name, error = %message, "scrape_served_from_cache");
                                sources.push(SourceReport::succeeded(name, cached.len(), true));
                                rows.extend(cached);
                            }
                            None => {
                                warn!(target = "trendforge.pipeline", marketplace = %name, error = %message, "scrape_source_failed");
                                sources.push(SourceReport::failed(name, message));
                            }
                        }
                    }
                }
            }
            self.record_attempts(job.id, attempts.max(1)).await;

            if !sources.iter().any(|source| source.ok) {
                let summary = sources
                    .iter()
                    .filter_map(|source| {
                        source
                            .error
                            .as_ref()
                            .map(|err| format!("{}: {err}", source.marketplace))
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                let message = format!("no scrape source succeeded ({summary})");
                return Err(if unconfigured == sources.len() {
                    PipelineError::configuration(STAGE, message)
                } else {
                    PipelineError::external(STAGE, message)
                });
            }

            let mut results_stored = 0;
            for row in &rows {
                if self
                    .store
                    .insert_scrape_result(row.clone())
                    .await
                    .map_err(|err| PipelineError::from_store(STAGE, err))?
                {
                    results_stored += 1;
                }
            }

            let upserts = aggregate(&rows);
            for upsert in &upserts {
                self.store
                    .upsert_trend(upsert.clone())
                    .await
                    .map_err(|err| PipelineError::from_store(STAGE, err))?;
            }

            info!(
                target = "trendforge.pipeline",
                trends = upserts.len(),
                results = results_stored,
                "scrape_complete"
            );
            let report = ScrapeReport {
                job_id: job.id,
                trends_upserted: upserts.len(),
                results_stored,
                sources,
            };
            let output = json!({
                "trendsUpserted": report.trends_upserted,
                "resultsStored": report.results_stored,
                "sources": report.sources,
            });
            Ok(StageOutcome::new(report, output))
        })
        .await
    }
}

/// Folds scraped rows into one upsert per keyword: volumes add up, the
/// average price is the mean of priced rows, and competition takes the
/// highest level any source reported.
pub(crate) fn aggregate(rows: &[ScrapeResult]) -> Vec<TrendUpsert> {
    struct Acc {
        upsert: TrendUpsert,
        price_total: f64,
        priced: u32,
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Acc> = HashMap::new();
    for row in rows {
        let key = normalize_keyword(&row.keyword);
        if key.is_empty() {
            continue;
        }
        let acc = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Acc {
                upsert: TrendUpsert {
                    keyword: row.keyword.trim().to_string(),
                    search_volume: 0,
                    competition: row.competition,
                    avg_price: 0.0,
                },
                price_total: 0.0,
                priced: 0,
            }
        });
        acc.upsert.search_volume += row.search_volume;
        acc.upsert.competition = acc.upsert.competition.max(row.competition);
        if row.price.is_finite() && row.price > 0.0 {
            acc.price_total += row.price;
            acc.priced += 1;
        }
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|mut acc| {
            if acc.priced > 0 {
                acc.upsert.avg_price = acc.price_total / f64::from(acc.priced);
            }
            acc.upsert
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Competition;
    use crate::testing::{FakeMarketplace, PipelineBuilder, scrape_row};

    #[test]
    fn aggregation_merges_rows_per_keyword() {
        let rows = vec![
            scrape_row("Wedding Planner", "1", 100, Competition::Low, 10.0),
            scrape_row("wedding planner", "2", 50, Competition::High, 20.0),
            scrape_row("Aura Candle", "3", 7, Competition::Medium, 0.0),
        ];
        let upserts = aggregate(&rows);
        assert_eq!(upserts.len(), 2);
        assert_eq!(upserts[0].keyword, "Wedding Planner");
        assert_eq!(upserts[0].search_volume, 150);
        assert_eq!(upserts[0].competition, Competition::High);
        assert!((upserts[0].avg_price - 15.0).abs() < f64::EPSILON);
        assert_eq!(upserts[1].avg_price, 0.0);
    }

    #[tokio::test]
    async fn rescanning_updates_the_same_trend_row() {
        let etsy = FakeMarketplace::new("etsy").with_scan(vec![scrape_row(
            "wedding planner",
            "1",
            120,
            Competition::Low,
            18.5,
        )]);
        let pipeline = PipelineBuilder::new().marketplace(etsy.clone()).build();

        let report = pipeline.scrape().await.unwrap();
        assert_eq!(report.trends_upserted, 1);
        assert_eq!(report.results_stored, 1);
        let trends = pipeline.store().list_trends().await.unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].keyword, "wedding planner");
        assert_eq!(trends[0].search_volume, 120);
        assert_eq!(trends[0].competition, Competition::Low);
        assert!((trends[0].avg_price - 18.5).abs() < f64::EPSILON);

        etsy.set_scan(vec![scrape_row(
            "wedding planner",
            "1",
            150,
            Competition::Low,
            18.5,
        )]);
        pipeline.scrape().await.unwrap();
        let trends = pipeline.store().list_trends().await.unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].search_volume, 150);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_abort_the_others() {
        let etsy = FakeMarketplace::new("etsy").with_scan(vec![scrape_row(
            "aura candle",
            "1",
            40,
            Competition::Medium,
            21.0,
        )]);
        let ebay = FakeMarketplace::new("ebay").failing_scan("HTTP 503 service unavailable");
        let pipeline = PipelineBuilder::new()
            .marketplace(etsy)
            .marketplace(ebay)
            .build();

        let report = pipeline.scrape().await.unwrap();
        assert_eq!(report.sources.len(), 2);
        assert!(report.sources[0].ok);
        assert!(!report.sources[1].ok);
        assert_eq!(report.trends_upserted, 1);
        let job = pipeline.ledger().get(report.job_id).await.unwrap();
        assert_eq!(job.status, crate::ledger::JobStatus::Success);
    }

    #[tokio::test]
    async fn unconfigured_sources_fail_the_stage_as_configuration() {
        let pipeline = PipelineBuilder::new()
            .marketplace(FakeMarketplace::new("etsy").unavailable())
            .build();
        let err = pipeline.scrape().await.unwrap_err();
        assert_eq!(err.kind(), crate::pipeline::PipelineErrorKind::Configuration);
        let failed = pipeline
            .ledger()
            .list_by_status(crate::ledger::JobStatus::Failed)
            .await;
        assert_eq!(failed.len(), 1);
    }
}
