use super::Pipeline;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    /// False only when the run never got past scraping.
    pub success: bool,
    pub scrape_job_id: Option<Uuid>,
    pub trends_processed: usize,
    pub products_created: usize,
    pub listings_created: usize,
    pub failed_trends: Vec<String>,
    pub errors: Vec<String>,
}

impl Pipeline {
    /// Scrape, rank, then generate and list a product for each of the top
    /// trends. Trends are processed one at a time in rank order; a failure on
    /// one trend is recorded and the next trend still runs.
    pub async fn run_full_pipeline(&self) -> PipelineSummary {
        let mut summary = PipelineSummary::default();

        let report = match self.scrape().await {
            Ok(report) => report,
            Err(err) => {
                warn!(target = "trendforge.pipeline", error = %err, "run_aborted_at_scrape");
                summary.errors.push(err.to_string());
                return summary;
            }
        };
        summary.scrape_job_id = Some(report.job_id);

        if let Err(err) = self.analyze().await {
            warn!(
                target = "trendforge.pipeline",
                kind = ?err.kind(),
                error = %err,
                "analyze_skipped_using_local_score"
            );
            summary.errors.push(err.to_string());
        }

        let trends = match self.store.top_trends(self.settings.top_n).await {
            Ok(trends) => trends,
            Err(err) => {
                summary.errors.push(format!("reading top trends failed: {err}"));
                return summary;
            }
        };
        summary.success = true;

        let mut targets = Vec::new();
        for name in &self.settings.target_marketplaces {
            match self.marketplaces.get(name) {
                Some(adapter) if adapter.is_available() => targets.push(adapter.name().to_string()),
                Some(_) => {
                    warn!(target = "trendforge.pipeline", marketplace = %name, "target_unavailable_skipped");
                    summary.errors.push(format!("{name} marketplace is not configured"));
                }
                None => {
                    warn!(target = "trendforge.pipeline", marketplace = %name, "target_unknown_skipped");
                    summary.errors.push(format!("unknown marketplace '{name}'"));
                }
            }
        }

        for (idx, trend) in trends.iter().enumerate() {
            if idx > 0 && !self.settings.product_delay.is_zero() {
                sleep(self.settings.product_delay).await;
            }
            summary.trends_processed += 1;

            let generated = match self
                .generate_for(&trend.keyword, None, Some(report.job_id))
                .await
            {
                Ok(generated) => generated,
                Err(err) => {
                    summary.failed_trends.push(trend.keyword.clone());
                    summary.errors.push(err.to_string());
                    continue;
                }
            };
            summary.products_created += 1;

            let mut listed = 0;
            for marketplace in &targets {
                match self
                    .list_for(generated.product.id, marketplace, Some(generated.job_id))
                    .await
                {
                    Ok(outcome) => {
                        listed += 1;
                        if !outcome.skipped {
                            summary.listings_created += 1;
                        }
                    }
                    Err(err) => summary.errors.push(err.to_string()),
                }
            }
            if !targets.is_empty() && listed == 0 {
                summary.failed_trends.push(trend.keyword.clone());
            }
        }

        info!(
            target = "trendforge.pipeline",
            trends = summary.trends_processed,
            products = summary.products_created,
            listings = summary.listings_created,
            failed = summary.failed_trends.len(),
            "run_complete"
        );
        summary
    }
}
