//! The four stages and the orchestrator that chains them.
//!
//! Every stage invocation runs under a ledger job (see [`Pipeline::tracked`]),
//! and every external call inside a stage goes through the recovery engine.

mod analyze;
mod error;
mod generate;
mod list;
mod orchestrator;
mod scrape;

pub use error::{PipelineError, PipelineErrorKind};
pub use list::ListOutcome;
pub use orchestrator::PipelineSummary;
pub use scrape::ScrapeReport;

use crate::ai::AiProvider;
use crate::config::PipelineSettings;
use crate::ledger::{Job, JobLedger, JobStage};
use crate::marketplace::MarketplaceRegistry;
use crate::recovery::{RecoveryEngine, RecoveryHooks};
use crate::store::Store;
use async_trait::async_trait;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn Store>,
    ledger: JobLedger,
    recovery: Arc<RecoveryEngine>,
    marketplaces: Arc<MarketplaceRegistry>,
    ai: Arc<dyn AiProvider>,
    settings: Arc<PipelineSettings>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: JobLedger,
        recovery: Arc<RecoveryEngine>,
        marketplaces: Arc<MarketplaceRegistry>,
        ai: Arc<dyn AiProvider>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            recovery,
            marketplaces,
            ai,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    pub fn marketplaces(&self) -> &Arc<MarketplaceRegistry> {
        &self.marketplaces
    }

    pub fn ai(&self) -> &Arc<dyn AiProvider> {
        &self.ai
    }

    /// Runs `body` as one ledger job for `unit`.
    ///
    /// A key collision with a running job is returned as a duplicate-job
    /// error without creating a record. Otherwise the job always ends
    /// terminal: SUCCESS with the body's output, or FAILED with its error.
    async fn tracked<T, F, Fut>(
        &self,
        stage: JobStage,
        unit: &str,
        metadata: Value,
        parent_job_id: Option<Uuid>,
        body: F,
    ) -> Result<T, PipelineError>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let name = stage.key_prefix();
        let job_key = self.ledger.next_key(stage, unit).await;
        let job = self
            .ledger
            .begin(&job_key, stage, metadata, parent_job_id)
            .await
            .map_err(|err| PipelineError::from_ledger(name, err))?;
        let job_id = job.id;

        let started = Instant::now();
        let result = body(job).await;
        crate::metrics::stage_elapsed(name, started.elapsed().as_millis());

        match result {
            Ok(outcome) => {
                self.ledger
                    .complete(job_id, outcome.output)
                    .await
                    .map_err(|err| PipelineError::from_ledger(name, err))?;
                Ok(outcome.value)
            }
            Err(err) => {
                warn!(
                    target = "trendforge.pipeline",
                    stage = name,
                    job_key = %job_key,
                    kind = ?err.kind(),
                    error = %err,
                    "stage_failed"
                );
                if let Err(ledger_err) = self.ledger.fail(job_id, err.to_string()).await {
                    warn!(target = "trendforge.ledger", job_key = %job_key, error = %ledger_err, "job_fail_not_recorded");
                }
                Err(err)
            }
        }
    }

    async fn record_attempts(&self, job_id: Uuid, attempts: u32) {
        if let Err(err) = self.ledger.record_attempts(job_id, attempts).await {
            warn!(target = "trendforge.ledger", job_id = %job_id, error = %err, "attempts_not_recorded");
        }
    }
}

/// Value a stage hands back plus the JSON stored on its job.
#[derive(Debug)]
struct StageOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Recovery side effects backed by the live store and the `.env` file.
pub struct StoreHooks {
    store: Arc<dyn Store>,
}

impl StoreHooks {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryHooks for StoreHooks {
    async fn reconnect(&self) -> Result<(), String> {
        info!(target = "trendforge.recovery", "store_reconnect");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), String> {
        self.store.health_check().await.map_err(|err| err.to_string())
    }

    async fn reload_config(&self) -> Result<(), String> {
        dotenvy::dotenv_override()
            .map(|path| {
                info!(target = "trendforge.recovery", path = %path.display(), "config_reloaded");
            })
            .map_err(|err| format!("config reload failed: {err}"))
    }
}
