//! Background jobs
//!
//! History compaction removes finished instances in fixed-size batches
//! under a distributed lease; the timeout sweep fails polled tasks whose
//! lock expired, routing them through the normal retry path. Every run is
//! persisted as a job record.

use crate::config::EngineConfig;
use crate::dispatch::{Command, Dispatcher};
use conflux_core::model::{Failure, Job};
use conflux_core::persistence::{ActivityStore, JobStore, LeaseStore, ProcessStore};
use conflux_core::EngineError;
use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const COMPACTION_LEASE: &str = "compaction";

/// A held term on a named distributed lease
///
/// The guard does not release itself; callers release on every exit path
/// and a crashed holder's term simply expires.
pub struct LeaseGuard {
    lease_store: Arc<dyn LeaseStore>,
    name: String,
}

impl LeaseGuard {
    /// Try to take the named lease for the given term
    pub async fn try_acquire(
        lease_store: Arc<dyn LeaseStore>,
        name: impl Into<String>,
        term: Duration,
        owner: &str,
    ) -> Result<Option<Self>, EngineError> {
        let name = name.into();
        let until = Utc::now() + term;
        if lease_store.try_acquire(&name, until, owner).await? {
            Ok(Some(Self { lease_store, name }))
        } else {
            Ok(None)
        }
    }

    /// Give the lease back before the term expires
    pub async fn release(self) -> Result<(), EngineError> {
        self.lease_store.release(&self.name).await
    }
}

/// Periodic removal of finished process history
pub struct CompactionJob {
    process_store: Arc<dyn ProcessStore>,
    job_store: Arc<dyn JobStore>,
    lease_store: Arc<dyn LeaseStore>,
    config: Arc<EngineConfig>,
    owner: String,
}

impl CompactionJob {
    /// Create the job over its stores
    pub fn new(
        process_store: Arc<dyn ProcessStore>,
        job_store: Arc<dyn JobStore>,
        lease_store: Arc<dyn LeaseStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            process_store,
            job_store,
            lease_store,
            config,
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Run the job on its configured interval until the task is aborted
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                self.config.compaction_interval_secs,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(error) = self.run_once().await {
                    tracing::error!(%error, "compaction run failed");
                }
            }
        })
    }

    /// One compaction pass; returns how many instances were removed
    ///
    /// A run that does not win the lease is a no-op. The lease is released
    /// whether the pass succeeds or fails.
    pub async fn run_once(&self) -> Result<usize, EngineError> {
        if !self.config.compaction_enabled {
            return Ok(0);
        }
        let Some(guard) = LeaseGuard::try_acquire(
            self.lease_store.clone(),
            COMPACTION_LEASE,
            self.config.lease_duration(),
            &self.owner,
        )
        .await?
        else {
            tracing::debug!("compaction lease held elsewhere");
            return Ok(0);
        };

        let result = self.run_recorded().await;
        if let Err(error) = guard.release().await {
            tracing::warn!(%error, "compaction lease release failed");
        }
        result
    }

    async fn run_recorded(&self) -> Result<usize, EngineError> {
        let input = HashMap::from([
            (
                "batch_size".to_string(),
                json!(self.config.compaction_batch_size),
            ),
            (
                "max_jobs".to_string(),
                json!(self.config.compaction_max_jobs),
            ),
        ]);
        let job = self.job_store.run(Job::new("compaction", input)).await?;

        tracing::info!(workers = self.config.compaction_max_jobs, "compaction started");
        match self.compact_all().await {
            Ok(removed) => {
                self.job_store
                    .complete(&job.id, HashMap::from([("removed".to_string(), json!(removed))]))
                    .await?;
                tracing::info!(removed, "compaction finished");
                Ok(removed)
            }
            Err(error) => {
                self.job_store
                    .fail(&job.id, error.to_string(), None)
                    .await?;
                Err(error)
            }
        }
    }

    async fn compact_all(&self) -> Result<usize, EngineError> {
        let workers = (0..self.config.compaction_max_jobs).map(|_| self.compact_worker());
        let totals = join_all(workers).await;
        totals.into_iter().try_fold(0, |sum, total| Ok(sum + total?))
    }

    /// Remove fixed-size batches until a batch comes back short
    async fn compact_worker(&self) -> Result<usize, EngineError> {
        let batch_size = self.config.compaction_batch_size;
        let mut total = 0;
        loop {
            let removed = self.process_store.compact(batch_size).await?;
            total += removed;
            if removed < batch_size {
                return Ok(total);
            }
        }
    }
}

/// Periodic sweep failing polled tasks whose lock timeout elapsed
pub struct TimeoutSweep {
    activity_store: Arc<dyn ActivityStore>,
    job_store: Arc<dyn JobStore>,
    config: Arc<EngineConfig>,
}

impl TimeoutSweep {
    /// Create the sweep over its stores
    pub fn new(
        activity_store: Arc<dyn ActivityStore>,
        job_store: Arc<dyn JobStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            activity_store,
            job_store,
            config,
        }
    }

    /// Run the sweep on its configured interval until the task is aborted
    pub fn spawn(self: Arc<Self>, dispatcher: Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                self.config.timeout_sweep_interval_secs,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(error) = self.run_once(&dispatcher).await {
                    tracing::error!(%error, "timeout sweep failed");
                }
            }
        })
    }

    /// One sweep pass; returns how many tasks were failed
    pub async fn run_once(&self, dispatcher: &Arc<Dispatcher>) -> Result<usize, EngineError> {
        let timed_out = self.activity_store.find_timed_out(Utc::now()).await?;
        if timed_out.is_empty() {
            return Ok(0);
        }

        let job = self
            .job_store
            .run(Job::new("timeout-sweep", HashMap::new()))
            .await?;
        let count = timed_out.len();
        tracing::info!(count, "failing timed out tasks");
        for execution in timed_out {
            dispatcher.dispatch_async(Command::FailActivity {
                activity_id: execution.id,
                failure: Failure::new("Timeout"),
            });
        }
        self.job_store
            .complete(&job.id, HashMap::from([("failed".to_string(), json!(count))]))
            .await?;
        Ok(count)
    }
}
