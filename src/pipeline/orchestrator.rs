use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::limits::TimeLimits;
use super::retry::RetryPolicy;
use crate::ai::RelevanceFilter;
use crate::db::{CategoryStore, JobTracker, Repository};
use crate::error::{AppError, ErrorKind, Result};
use crate::models::{
    Category, CategoryContext, RunCounts, ScoredItem, Source, WriteMode,
};
use crate::sources::Connector;

/// A connector wired in for one source, with the way its batches are written.
#[derive(Clone)]
pub struct SourceRuntime {
    pub connector: Arc<dyn Connector>,
    pub write_mode: WriteMode,
}

/// Result of one run, as recorded on the task.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job_id: i64,
    pub owners: usize,
    pub created: i64,
    pub updated: i64,
}

/// Turns "refresh source X" into per-owner work and aggregates the outcome
/// into an ingestion job.
///
/// A fan-out run starts one child per owner with an applicable active
/// category, at most `owner_concurrency` at a time, and completes its job
/// once every child has finished. A child that fails contributes nothing and
/// is only visible in the logs.
pub struct Orchestrator {
    repo: Repository,
    store: CategoryStore,
    jobs: JobTracker,
    sources: HashMap<Source, SourceRuntime>,
    relevance: Option<Arc<RelevanceFilter>>,
    retry: RetryPolicy,
    limits: TimeLimits,
    owner_concurrency: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Repository,
        store: CategoryStore,
        jobs: JobTracker,
        sources: HashMap<Source, SourceRuntime>,
        relevance: Option<Arc<RelevanceFilter>>,
        retry: RetryPolicy,
        limits: TimeLimits,
        owner_concurrency: usize,
    ) -> Self {
        Self {
            repo,
            store,
            jobs,
            sources,
            relevance,
            retry,
            limits,
            owner_concurrency: owner_concurrency.max(1),
        }
    }

    fn runtime(&self, source: Source) -> Result<&SourceRuntime> {
        self.sources.get(&source).ok_or_else(|| {
            AppError::Config(format!(
                "source '{}' is not active or has no credential",
                source
            ))
        })
    }

    /// Refreshes `source` for every owner with an applicable category.
    pub async fn refresh_all(&self, source: Source) -> Result<RunSummary> {
        let job_id = self
            .jobs
            .create(&source.fan_out_kind(), Some(json!({ "source": source })))
            .await?;

        let runtime = match self.runtime(source) {
            Ok(runtime) => runtime.clone(),
            Err(e) => {
                self.jobs.fail(job_id, &e.to_string()).await?;
                return Err(e);
            }
        };
        self.jobs.start(job_id).await?;

        let label = source.fan_out_kind();
        let outcome = self
            .limits
            .run(&label, self.fan_out(source, &runtime))
            .await;

        match outcome {
            Ok((owners, counts)) => {
                self.jobs.complete(job_id, counts).await?;
                info!(
                    job_id,
                    source = %source,
                    owners,
                    created = counts.created,
                    updated = counts.updated,
                    "Fan-out run completed"
                );
                Ok(RunSummary {
                    job_id,
                    owners,
                    created: counts.created,
                    updated: counts.updated,
                })
            }
            Err(e) => {
                error!(job_id, source = %source, "Fan-out run failed: {}", e);
                self.jobs.fail(job_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Refreshes `source` for a single owner under its own job.
    pub async fn refresh_owner(&self, source: Source, owner_id: i64) -> Result<RunSummary> {
        let job_id = self
            .jobs
            .create(
                source.as_str(),
                Some(json!({ "source": source, "owner_id": owner_id })),
            )
            .await?;

        let runtime = match self.runtime(source) {
            Ok(runtime) => runtime.clone(),
            Err(e) => {
                self.jobs.fail(job_id, &e.to_string()).await?;
                return Err(e);
            }
        };
        self.jobs.start(job_id).await?;

        let label = format!("{}:{}", source, owner_id);
        let outcome = self
            .limits
            .run(&label, async {
                let categories = self.applicable_categories(owner_id, &runtime).await?;
                self.owner_task(source, &runtime, owner_id, categories).await
            })
            .await;

        match outcome {
            Ok(counts) => {
                self.jobs.complete(job_id, counts).await?;
                Ok(RunSummary {
                    job_id,
                    owners: 1,
                    created: counts.created,
                    updated: counts.updated,
                })
            }
            Err(e) => {
                error!(job_id, owner_id, source = %source, "Owner refresh failed: {}", e);
                self.jobs.fail(job_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Fan-out, then fan-in once every child is done.
    async fn fan_out(&self, source: Source, runtime: &SourceRuntime) -> Result<(usize, RunCounts)> {
        let owners = self.owners_for(runtime).await?;
        let owner_count = owners.len();
        info!(source = %source, owners = owner_count, "Fanning out");

        let results: Vec<RunCounts> = stream::iter(owners)
            .map(|(owner_id, categories)| async move {
                let label = format!("{}:{}", source, owner_id);
                let child = self.owner_task(source, runtime, owner_id, categories);
                match self.limits.run(&label, child).await {
                    Ok(counts) => counts,
                    Err(e) => {
                        error!(owner_id, source = %source, "Owner task failed: {}", e);
                        RunCounts::default()
                    }
                }
            })
            .buffer_unordered(self.owner_concurrency)
            .collect()
            .await;

        let mut total = RunCounts::default();
        for counts in results {
            total += counts;
        }
        Ok((owner_count, total))
    }

    /// Active categories grouped by owner, keeping only owners the connector
    /// has something to fetch for.
    async fn owners_for(&self, runtime: &SourceRuntime) -> Result<BTreeMap<i64, Vec<Category>>> {
        let mut owners: BTreeMap<i64, Vec<Category>> = BTreeMap::new();
        for category in self.repo.active_categories().await? {
            if runtime.connector.applies_to(&CategoryContext::from(&category)) {
                owners.entry(category.owner_id).or_default().push(category);
            }
        }
        Ok(owners)
    }

    async fn applicable_categories(
        &self,
        owner_id: i64,
        runtime: &SourceRuntime,
    ) -> Result<Vec<Category>> {
        Ok(self
            .repo
            .categories_for_owner(owner_id, true)
            .await?
            .into_iter()
            .filter(|c| runtime.connector.applies_to(&CategoryContext::from(c)))
            .collect())
    }

    /// One owner's categories, in order. The first error that survives the
    /// retry policy aborts the rest of this owner's work.
    async fn owner_task(
        &self,
        source: Source,
        runtime: &SourceRuntime,
        owner_id: i64,
        categories: Vec<Category>,
    ) -> Result<RunCounts> {
        let mut total = RunCounts::default();
        for category in &categories {
            total += self.refresh_category(source, runtime, category).await?;
        }
        debug!(
            owner_id,
            source = %source,
            categories = categories.len(),
            created = total.created,
            "Owner task done"
        );
        Ok(total)
    }

    /// fetch (with retry) -> relevance -> store.
    pub async fn refresh_category(
        &self,
        source: Source,
        runtime: &SourceRuntime,
        category: &Category,
    ) -> Result<RunCounts> {
        let ctx = CategoryContext::from(category);
        let label = format!("{}:{}", source, category.id);

        let items = match self
            .retry
            .run(&label, || runtime.connector.fetch(&ctx))
            .await
        {
            Ok(items) => items,
            Err(e) if e.kind() == ErrorKind::Malformed => {
                warn!(category_id = category.id, source = %source, "Malformed payload, skipping: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if items.is_empty() {
            info!(category_id = category.id, source = %source, "No items fetched, category left untouched");
            return Ok(RunCounts::default());
        }

        let scored = match &self.relevance {
            Some(filter) => filter.apply(&ctx, items).await,
            None => items.into_iter().map(ScoredItem::relevant).collect(),
        };

        let counts = self
            .store
            .write(category.id, source, runtime.write_mode, scored)
            .await?;
        debug!(
            category_id = category.id,
            source = %source,
            created = counts.created,
            updated = counts.updated,
            "Category refreshed"
        );
        Ok(counts)
    }
}
