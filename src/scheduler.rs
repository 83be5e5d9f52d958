use crate::errors::{AppError, AppResult};
use crate::models::{ConnectionStatus, DataSource, SyncFrequency};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueSync {
    pub data_source_id: String,
    pub frequency: SyncFrequency,
    // i64::MAX when never synced
    pub overdue_seconds: i64,
}

pub type ExecutorFuture = Pin<Box<dyn Future<Output = AppResult<ConnectionStatus>> + Send>>;
pub type SyncExecutor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

pub fn interval_for(frequency: SyncFrequency) -> Option<Duration> {
    match frequency {
        SyncFrequency::Manual => None,
        SyncFrequency::Hourly => Some(Duration::hours(1)),
        SyncFrequency::Daily => Some(Duration::days(1)),
        SyncFrequency::Weekly => Some(Duration::weeks(1)),
    }
}

pub fn due_entry(source: &DataSource, last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DueSync> {
    if source.connection_status == ConnectionStatus::Syncing {
        return None;
    }
    let interval = interval_for(source.sync_frequency)?;
    let reference = match (source.last_synced_at, last_attempt) {
        (Some(synced), Some(attempted)) => Some(synced.max(attempted)),
        (synced, attempted) => synced.or(attempted),
    };
    let overdue_seconds = match reference {
        None => i64::MAX,
        Some(reference) => {
            let due_at = reference + interval;
            if due_at > now {
                return None;
            }
            (now - due_at).num_seconds()
        }
    };
    Some(DueSync {
        data_source_id: source.id.clone(),
        frequency: source.sync_frequency,
        overdue_seconds,
    })
}

#[derive(Clone)]
pub struct SyncScheduler {
    permits: Arc<Semaphore>,
    last_attempts: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    executor: SyncExecutor,
}

impl SyncScheduler {
    pub fn new(max_concurrent: usize, executor: SyncExecutor) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            last_attempts: Arc::new(Mutex::new(HashMap::new())),
            executor,
        }
    }

    pub async fn select_due(&self, sources: &[DataSource], now: DateTime<Utc>) -> Vec<DueSync> {
        let attempts = self.last_attempts.lock().await;
        let mut due: Vec<DueSync> = sources
            .iter()
            .filter_map(|source| due_entry(source, attempts.get(&source.id).copied(), now))
            .collect();
        due.sort_by(|left, right| {
            right
                .overdue_seconds
                .cmp(&left.overdue_seconds)
                .then_with(|| left.data_source_id.cmp(&right.data_source_id))
        });
        due
    }

    pub async fn run_due(&self, sources: &[DataSource], now: DateTime<Utc>) -> Vec<(String, AppResult<ConnectionStatus>)> {
        let due = self.select_due(sources, now).await;
        {
            let mut attempts = self.last_attempts.lock().await;
            for entry in &due {
                attempts.insert(entry.data_source_id.clone(), now);
            }
        }

        let mut tasks = JoinSet::new();
        for entry in due {
            let permits = self.permits.clone();
            let executor = self.executor.clone();
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => executor(entry.data_source_id.clone()).await,
                    Err(_) => Err(AppError::Internal("scheduler semaphore closed".to_string())),
                };
                (entry.data_source_id, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((data_source_id, outcome)) => {
                    if let Err(error) = &outcome {
                        tracing::warn!(data_source_id = %data_source_id, error = %error, "scheduled sync failed");
                    }
                    results.push((data_source_id, outcome));
                }
                Err(error) => tracing::error!(error = %error, "scheduled sync task panicked"),
            }
        }
        results.sort_by(|left, right| left.0.cmp(&right.0));
        results
    }
}
