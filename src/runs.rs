//! Background execution of full pipeline runs requested over HTTP.

use crate::pipeline::{Pipeline, PipelineSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Finished runs kept for lookup; the oldest are forgotten first.
const RETAINED_RUNS: usize = 256;

/// Single worker draining a bounded queue, so at most one run touches the
/// marketplaces at a time.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::Sender<Uuid>,
    statuses: Arc<Mutex<HashMap<Uuid, RunInfo>>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed { summary: PipelineSummary },
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: RunState,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
#[error("run queue is not accepting work")]
pub struct QueueClosed;

impl RunQueue {
    pub fn spawn(pipeline: Pipeline, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Uuid>(capacity.max(1));
        let statuses: Arc<Mutex<HashMap<Uuid, RunInfo>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                set_state(&statuses_bg, id, RunState::Running).await;
                info!(target = "trendforge.api", run_id = %id, "pipeline_run_started");

                let summary = pipeline.run_full_pipeline().await;
                let state = if summary.success {
                    RunState::Completed { summary }
                } else {
                    let error = summary
                        .errors
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "pipeline run failed".to_string());
                    warn!(target = "trendforge.api", run_id = %id, error = %error, "pipeline_run_failed");
                    RunState::Failed { error }
                };
                set_state(&statuses_bg, id, state).await;
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self) -> Result<RunInfo, QueueClosed> {
        let info = RunInfo {
            id: Uuid::new_v4(),
            state: RunState::Queued,
            queued_at: Utc::now(),
            finished_at: None,
        };
        {
            let mut statuses = self.statuses.lock().await;
            prune_finished(&mut statuses, RETAINED_RUNS);
            statuses.insert(info.id, info.clone());
        }
        if self.tx.send(info.id).await.is_err() {
            self.statuses.lock().await.remove(&info.id);
            return Err(QueueClosed);
        }
        Ok(info)
    }

    pub async fn get(&self, id: Uuid) -> Option<RunInfo> {
        self.statuses.lock().await.get(&id).cloned()
    }
}

/// Drops the oldest finished runs until fewer than `keep` entries remain.
/// Queued and running entries are never dropped.
fn prune_finished(statuses: &mut HashMap<Uuid, RunInfo>, keep: usize) {
    if statuses.len() < keep {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = statuses
        .values()
        .filter_map(|info| info.finished_at.map(|at| (at, info.id)))
        .collect();
    finished.sort();
    let excess = statuses.len() + 1 - keep;
    for (_, id) in finished.into_iter().take(excess) {
        statuses.remove(&id);
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, RunInfo>>, id: Uuid, state: RunState) {
    let mut guard = statuses.lock().await;
    if let Some(info) = guard.get_mut(&id) {
        if matches!(state, RunState::Completed { .. } | RunState::Failed { .. }) {
            info.finished_at = Some(Utc::now());
        }
        info.state = state;
    }
}
