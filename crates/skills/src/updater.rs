//! Change detection and in-place re-materialization of installed bundles.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    tokio::{sync::Semaphore, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    client::RemoteTreeClient,
    error::{Error, Result},
    materialize::Materializer,
    pool::{acquire, collect_indexed},
    registry::RegistryStore,
    source::SourceRef,
    types::BundleRecord,
};

pub const DEFAULT_CHECK_CONCURRENCY: usize = 5;
pub const DEFAULT_APPLY_CONCURRENCY: usize = 3;

/// Outcome of comparing a record against its remote branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    pub has_update: bool,
    pub latest_revision: String,
}

/// Per-record result of [`Updater::check_all_updates`].
#[derive(Debug)]
pub struct CheckResult {
    pub record: BundleRecord,
    pub outcome: Result<UpdateCheck>,
}

#[derive(Debug)]
pub struct UpdateFailure {
    pub name: String,
    pub error: Error,
}

/// Summary of [`Updater::apply_all_updates`].
#[derive(Debug, Default)]
pub struct UpdateStats {
    pub total: usize,
    pub updated: usize,
    pub failed: usize,
    pub duration: Duration,
    pub failures: Vec<UpdateFailure>,
}

pub struct Updater {
    registry: Arc<RegistryStore>,
    materializer: Arc<Materializer>,
    check_concurrency: usize,
    apply_concurrency: usize,
}

impl Updater {
    pub fn new(registry: Arc<RegistryStore>, materializer: Arc<Materializer>) -> Self {
        Self {
            registry,
            materializer,
            check_concurrency: DEFAULT_CHECK_CONCURRENCY,
            apply_concurrency: DEFAULT_APPLY_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, checks: usize, applies: usize) -> Self {
        self.check_concurrency = checks.max(1);
        self.apply_concurrency = applies.max(1);
        self
    }

    fn client(&self) -> &Arc<dyn RemoteTreeClient> {
        self.materializer.client()
    }

    /// Any difference from the recorded revision, including an empty one,
    /// counts as an update.
    pub async fn check_update(
        &self,
        record: &BundleRecord,
        cancel: &CancellationToken,
    ) -> Result<UpdateCheck> {
        let source = SourceRef::parse(&record.source_ref)
            .map_err(|e| e.context("check update", record.name.clone()))?;
        let latest = self
            .client()
            .latest_revision(&source, cancel)
            .await
            .map_err(|e| e.context("check update", record.name.clone()))?;
        let has_update = latest != record.revision;
        debug!(
            skill = %record.name,
            current = %record.revision,
            latest = %latest,
            has_update,
            "checked for update"
        );
        Ok(UpdateCheck {
            has_update,
            latest_revision: latest,
        })
    }

    /// Check every record on a bounded pool. Results keep the input order and
    /// one failure never affects the others.
    pub async fn check_all_updates(
        self: &Arc<Self>,
        records: Vec<BundleRecord>,
        cancel: &CancellationToken,
    ) -> Vec<CheckResult> {
        let permits = Arc::new(Semaphore::new(self.check_concurrency));
        let mut tasks = JoinSet::new();
        for (index, record) in records.into_iter().enumerate() {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = match acquire(&permits, &cancel).await {
                    Ok(_permit) => this.check_update(&record, &cancel).await,
                    Err(e) => Err(e),
                };
                (index, CheckResult { record, outcome })
            });
        }

        let mut results = collect_indexed(&mut tasks).await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Re-materialize `record` into its store path and record the new revision.
    ///
    /// The registry is only touched after the new content is in place.
    pub async fn apply_update(
        &self,
        record: &BundleRecord,
        cancel: &CancellationToken,
    ) -> Result<BundleRecord> {
        self.apply_inner(record, cancel)
            .await
            .map_err(|e| e.context("update", record.name.clone()))
    }

    async fn apply_inner(
        &self,
        record: &BundleRecord,
        cancel: &CancellationToken,
    ) -> Result<BundleRecord> {
        let source = SourceRef::parse(&record.source_ref)?;
        let latest = self.client().latest_revision(&source, cancel).await?;
        let stats = self
            .materializer
            .materialize(&source, &source.path, &record.store_path, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let revision = latest.clone();
        let updated = self
            .registry
            .update_with_blocking(&record.id, move |r| {
                r.revision = revision;
                r.clone()
            })
            .await?;
        info!(
            skill = %record.name,
            revision = %crate::types::short_sha(&latest),
            files = stats.files,
            "updated"
        );
        Ok(updated)
    }

    /// Apply updates on a smaller pool than checks. Failures are counted,
    /// never propagated.
    pub async fn apply_all_updates(
        self: &Arc<Self>,
        records: Vec<BundleRecord>,
        cancel: &CancellationToken,
    ) -> UpdateStats {
        let started = Instant::now();
        let total = records.len();
        let permits = Arc::new(Semaphore::new(self.apply_concurrency));
        let mut tasks = JoinSet::new();
        for (index, record) in records.into_iter().enumerate() {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = match acquire(&permits, &cancel).await {
                    Ok(_permit) => this.apply_update(&record, &cancel).await,
                    Err(e) => Err(e),
                };
                (index, (record.name, outcome))
            });
        }

        let mut stats = UpdateStats {
            total,
            ..UpdateStats::default()
        };
        let mut results = collect_indexed(&mut tasks).await;
        results.sort_by_key(|(index, _)| *index);
        for (_, (name, outcome)) in results {
            match outcome {
                Ok(_) => stats.updated += 1,
                Err(error) => {
                    warn!(skill = %name, error = %error, "update failed");
                    stats.failed += 1;
                    stats.failures.push(UpdateFailure { name, error });
                },
            }
        }
        stats.duration = started.elapsed();
        info!(
            total = stats.total,
            updated = stats.updated,
            failed = stats.failed,
            elapsed_ms = stats.duration.as_millis() as u64,
            "update batch finished"
        );
        stats
    }
}
