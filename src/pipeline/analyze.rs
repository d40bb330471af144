use super::{Pipeline, PipelineError, StageOutcome};
use crate::ledger::JobStage;
use crate::models::{TrendData, normalize_keyword};
use crate::store::StoreError;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use tracing::{info, warn};

const STAGE: &str = "analyze";

impl Pipeline {
    /// Ranks the trends seen in the recent scrape window with the AI
    /// provider and writes score, rank, and insight back onto each trend.
    pub async fn analyze(&self) -> Result<Vec<TrendData>, PipelineError> {
        let min_points = self.settings.analyze_min_points;
        let window_hours = self.settings.analyze_window.num_hours();
        let metadata = json!({ "minPoints": min_points, "windowHours": window_hours });

        self.tracked(JobStage::Analyze, "batch", metadata, None, |job| async move {
            let since = Utc::now() - self.settings.analyze_window;
            let points = self
                .store
                .recent_scrape_results(since)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?;
            if points.len() < min_points {
                return Err(PipelineError::insufficient_data(
                    STAGE,
                    format!(
                        "need at least {min_points} scrape results from the last {window_hours}h, found {}",
                        points.len()
                    ),
                ));
            }

            let recent: HashSet<String> = points
                .iter()
                .map(|point| normalize_keyword(&point.keyword))
                .collect();
            let candidates: Vec<TrendData> = self
                .store
                .list_trends()
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?
                .into_iter()
                .filter(|trend| recent.contains(&normalize_keyword(&trend.keyword)))
                .collect();
            if candidates.is_empty() {
                return Err(PipelineError::insufficient_data(
                    STAGE,
                    "recent scrape results match no stored trend",
                ));
            }

            let ai = self.ai.as_ref();
            let candidates_ref = &candidates;
            let outcome = self
                .recovery
                .run(STAGE, move || ai.analyze_trends(candidates_ref))
                .await;
            self.record_attempts(job.id, outcome.attempts).await;
            let Some(ranked) = outcome.value else {
                return Err(outcome
                    .last_error
                    .as_ref()
                    .map(|err| PipelineError::from_ai(STAGE, err))
                    .unwrap_or_else(|| PipelineError::external(STAGE, "analysis produced no result")));
            };

            let mut updated = Vec::with_capacity(ranked.len());
            for (idx, entry) in ranked.into_iter().enumerate() {
                let rank = entry.rank.unwrap_or(idx as u32 + 1);
                match self
                    .store
                    .rank_trend(&entry.keyword, entry.score, rank, entry.insight)
                    .await
                {
                    Ok(trend) => updated.push(trend),
                    Err(StoreError::NotFound { .. }) => {
                        warn!(target = "trendforge.pipeline", keyword = %entry.keyword, "ranked_unknown_keyword");
                    }
                    Err(err) => return Err(PipelineError::from_store(STAGE, err)),
                }
            }
            updated.sort_by_key(|trend| trend.rank);

            info!(target = "trendforge.pipeline", points = points.len(), ranked = updated.len(), "analyze_complete");
            let output = json!({
                "points": points.len(),
                "ranked": updated
                    .iter()
                    .map(|trend| json!({ "keyword": trend.keyword, "score": trend.score, "rank": trend.rank }))
                    .collect::<Vec<_>>(),
            });
            Ok(StageOutcome::new(updated, output))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::ai::RankedTrend;
    use crate::models::Competition;
    use crate::pipeline::PipelineErrorKind;
    use crate::testing::{FakeAi, FakeMarketplace, PipelineBuilder, scrape_row};

    fn rows(count: usize) -> Vec<crate::models::ScrapeResult> {
        (0..count)
            .map(|idx| {
                let keyword = if idx % 2 == 0 { "aura candle" } else { "wedding planner" };
                scrape_row(keyword, &idx.to_string(), 10, Competition::Low, 20.0)
            })
            .collect()
    }

    #[tokio::test]
    async fn fewer_than_minimum_points_is_refused() {
        let pipeline = PipelineBuilder::new()
            .marketplace(FakeMarketplace::new("etsy").with_scan(rows(9)))
            .build();
        pipeline.scrape().await.unwrap();

        let err = pipeline.analyze().await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InsufficientData);
        let trends = pipeline.store().list_trends().await.unwrap();
        assert!(trends.iter().all(|trend| trend.rank.is_none()));
    }

    #[tokio::test]
    async fn ranking_is_written_back_to_trends() {
        let ai = FakeAi::new().with_ranking(vec![
            RankedTrend {
                keyword: "wedding planner".into(),
                score: 88.0,
                rank: None,
                insight: Some("seasonal".into()),
            },
            RankedTrend {
                keyword: "aura candle".into(),
                score: 42.0,
                rank: None,
                insight: None,
            },
            RankedTrend {
                keyword: "not scraped".into(),
                score: 10.0,
                rank: None,
                insight: None,
            },
        ]);
        let pipeline = PipelineBuilder::new()
            .marketplace(FakeMarketplace::new("etsy").with_scan(rows(10)))
            .ai(ai)
            .build();
        pipeline.scrape().await.unwrap();

        let ranked = pipeline.analyze().await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].keyword, "wedding planner");
        assert_eq!(ranked[0].rank, Some(1));
        assert_eq!(ranked[0].insight.as_deref(), Some("seasonal"));
        let top = pipeline.store().top_trends(1).await.unwrap();
        assert_eq!(top[0].keyword, "wedding planner");
    }
}
