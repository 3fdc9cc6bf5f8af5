use crate::models::ApiError;
use crate::orchestrator::{self, BatchReport, Fulfillment};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::info;
use uuid::Uuid;

/// Single background worker running generation batches off an mpsc queue,
/// with an in-process status map for introspection. Delivery is
/// at-least-once from the caller's perspective; re-enqueueing an order is
/// harmless because slots overwrite by display order.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
    orders: Arc<Mutex<HashMap<Uuid, Uuid>>>,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    order_id: Uuid,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: BatchReport },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub order_id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(fx: Fulfillment) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobState::Running);
                }

                info!(target = "pawtraits.worker", job_id = %job.id, order_id = %job.order_id, "batch started");
                let result = orchestrator::run_batch(&fx, job.order_id).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(report) => {
                        guard.insert(job.id, JobState::Completed { result: report });
                    }
                    Err(err) => {
                        guard.insert(
                            job.id,
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                }
            }
        });

        (
            Self {
                tx,
                statuses,
                orders: Arc::new(Mutex::new(HashMap::new())),
            },
            handle,
        )
    }

    pub async fn enqueue_batch(&self, order_id: Uuid) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        {
            let mut guard = self.orders.lock().await;
            guard.insert(id, order_id);
        }
        self.tx.send(Job { id, order_id }).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("generation worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let state = self.statuses.lock().await.get(&id).cloned()?;
        let order_id = self
            .orders
            .lock()
            .await
            .get(&id)
            .map(Uuid::to_string)
            .unwrap_or_default();
        Some(JobInfo {
            id: id.to_string(),
            order_id,
            state,
        })
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testutil::{sample_order, seed_order_assets};
    use std::time::Duration;

    #[tokio::test]
    async fn enqueued_batch_completes_with_report() {
        let fx = Fulfillment::demo();
        let order = sample_order();
        seed_order_assets(&fx, &order).await;
        let order_id = fx.store.insert_order(order).await;

        let (queue, _handle) = JobQueue::spawn(fx.clone());
        let job_id = queue.enqueue_batch(order_id).await.unwrap();

        let mut state = None;
        for _ in 0..200 {
            if let Some(info) = queue.get(job_id).await {
                if matches!(info.state, JobState::Completed { .. } | JobState::Failed { .. }) {
                    state = Some(info.state);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        match state {
            Some(JobState::Completed { result }) => {
                assert_eq!(result.order_id, order_id);
                assert_eq!(result.generated_primary, 5);
            }
            _ => panic!("job did not complete in time"),
        }
    }

    #[tokio::test]
    async fn unknown_order_marks_job_failed() {
        let fx = Fulfillment::demo();
        let (queue, _handle) = JobQueue::spawn(fx);
        let job_id = queue.enqueue_batch(Uuid::new_v4()).await.unwrap();

        for _ in 0..200 {
            if let Some(info) = queue.get(job_id).await {
                if let JobState::Failed { stage, .. } = info.state {
                    assert_eq!(stage.as_deref(), Some("generate_batch"));
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never failed");
    }
}
