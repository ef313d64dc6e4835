use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::{RunMode, SyncPipeline};

/// Trigger name used by the CLI for the recurring feed pull.
pub const PULL_TRIGGER: &str = "calendar_pull";

/// Named periodic triggers that run the pipeline unattended.
pub struct SyncScheduler {
    inner: JobScheduler,
    jobs: Mutex<BTreeMap<String, Uuid>>,
}

impl SyncScheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            inner,
            jobs: Mutex::new(BTreeMap::new()),
        })
    }

    /// Register (or replace) the trigger `name` firing on `cron` (six-field, seconds first).
    pub async fn register_periodic_trigger(
        &self,
        name: &str,
        cron: &str,
        pipeline: Arc<SyncPipeline>,
    ) -> Result<Uuid> {
        let trigger = name.to_string();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let trigger = trigger.clone();
            Box::pin(async move {
                match pipeline.run_once(RunMode::Scheduled).await {
                    Ok(summary) => info!(
                        trigger = %trigger,
                        run_id = %summary.run_id,
                        created = summary.created,
                        updated = summary.updated,
                        skipped = summary.skipped,
                        failed = summary.failed,
                        "scheduled pull finished"
                    ),
                    Err(err) => error!(trigger = %trigger, "scheduled pull aborted: {err:#}"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;

        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.remove(name) {
            self.inner
                .remove(&previous)
                .await
                .with_context(|| format!("replacing trigger {name}"))?;
        }
        let id = self.inner.add(job).await.context("adding scheduler job")?;
        jobs.insert(name.to_string(), id);
        info!(trigger = name, cron, "periodic trigger registered");
        Ok(id)
    }

    /// Returns whether a trigger by that name existed.
    pub async fn unregister_trigger(&self, name: &str) -> Result<bool> {
        let Some(id) = self.jobs.lock().await.remove(name) else {
            return Ok(false);
        };
        self.inner
            .remove(&id)
            .await
            .with_context(|| format!("removing trigger {name}"))?;
        info!(trigger = name, "periodic trigger unregistered");
        Ok(true)
    }

    pub async fn triggers(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await.context("starting scheduler")
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.shutdown().await.context("stopping scheduler")
    }
}
