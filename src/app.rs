use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::{ChatClient, ChatProvider, MetadataDeriver, RelevanceFilter};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{CategoryStore, JobTracker, Repository, ResponseCache, RetentionManager, TaskQueue};
use crate::error::Result;
use crate::models::{Source, TaskRecord};
use crate::pipeline::{
    schedules, Orchestrator, RetryPolicy, Scheduler, SourceRuntime, TimeLimits, Worker, WorkerPool,
};
use crate::services::{CategoryService, IngestService};
use crate::sources::{Connector, NewsApiConnector, PerplexityConnector, RateLimiter, RedditConnector};

pub struct App {
    pub config: Arc<Config>,
    pub categories: CategoryService,
    pub ingest: IngestService,
    queue: TaskQueue,
    worker: Arc<Worker>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let repo = Repository::new(&config.db_path).await?;
        let store = CategoryStore::new(&repo, clock.clone());
        let jobs = JobTracker::new(&repo);
        let queue = TaskQueue::new(&repo);
        let retention = RetentionManager::new(&repo, clock.clone());
        let cache = Arc::new(ResponseCache::new(
            &repo,
            clock.clone(),
            chrono::Duration::hours(config.cache.ttl_hours as i64),
        ));

        let relevance_chat = relevance_chat(&config)?;
        let relevance = relevance_chat
            .clone()
            .map(|chat| Arc::new(RelevanceFilter::new(chat, config.relevance.model.clone())));
        let deriver = relevance_chat
            .map(|chat| Arc::new(MetadataDeriver::new(chat, config.relevance.model.clone())));

        let sources = build_sources(&config, cache, clock)?;
        let limits = TimeLimits::from_config(&config);
        let orchestrator = Arc::new(Orchestrator::new(
            repo.clone(),
            store.clone(),
            jobs.clone(),
            sources,
            relevance,
            RetryPolicy::from_config(&config.retry),
            limits,
            config.owner_concurrency,
        ));
        let worker = Arc::new(Worker::new(
            queue.clone(),
            orchestrator,
            retention.clone(),
            limits,
            chrono::Duration::hours(config.retention.task_result_hours as i64),
        ));

        Ok(Self {
            categories: CategoryService::new(repo, deriver),
            ingest: IngestService::new(config.clone(), queue.clone(), jobs, store, retention),
            config,
            queue,
            worker,
        })
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Runs workers and the scheduler until ctrl-c.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate_sources()?;
        self.queue.requeue_interrupted().await?;

        let pool = WorkerPool::start(self.worker.clone(), self.config.workers, self.poll_interval());
        let scheduler = Scheduler::start(self.queue.clone(), schedules(&self.config));
        info!(workers = self.config.workers, "Serving");

        tokio::signal::ctrl_c().await?;
        info!("Shutting down, waiting for in-flight tasks");
        scheduler.shutdown().await;
        pool.shutdown().await;
        Ok(())
    }

    /// Works the queue in this process until `id` finishes.
    pub async fn run_until_done(&self, id: Uuid) -> Result<TaskRecord> {
        let pool = WorkerPool::start(self.worker.clone(), self.config.workers, self.poll_interval());
        let timeout = self.config.hard_time_limit() + Duration::from_secs(60);
        let result = self.ingest.wait_for(id, self.poll_interval(), timeout).await;
        pool.shutdown().await;
        result
    }
}

/// The chat provider used for relevance and category derivatives, if enabled
/// and a key is configured.
fn relevance_chat(config: &Config) -> Result<Option<Arc<dyn ChatProvider>>> {
    if !config.relevance.enabled {
        return Ok(None);
    }
    let Some(key) = config.relevance.credential() else {
        warn!("Relevance filtering enabled but no API key configured; items are kept unfiltered");
        return Ok(None);
    };
    let client = ChatClient::new("relevance", &completions_url(&config.relevance.base_url), key)?;
    Ok(Some(Arc::new(client)))
}

/// Connectors for every source that is enabled and has what it needs to run.
fn build_sources(
    config: &Config,
    cache: Arc<ResponseCache>,
    clock: Arc<dyn Clock>,
) -> Result<HashMap<Source, SourceRuntime>> {
    let mut sources = HashMap::new();
    for source in Source::ALL {
        if let Err(e) = config.check_source(source) {
            info!(source = %source, "Source unavailable: {}", e);
            continue;
        }
        let settings = config.settings(source);
        let connector: Arc<dyn Connector> = match source {
            Source::Perplexity => {
                let key = settings.credential().unwrap_or_default();
                let chat = ChatClient::new("perplexity", &completions_url(&settings.base_url), key)?;
                Arc::new(PerplexityConnector::new(
                    Arc::new(chat),
                    cache.clone(),
                    clock.clone(),
                    RateLimiter::new(settings.request_interval()),
                    config.perplexity.model.clone(),
                    config.perplexity.max_tokens,
                ))
            }
            Source::Reddit => Arc::new(RedditConnector::new(&config.reddit)?),
            Source::NewsApi => Arc::new(NewsApiConnector::new(
                &config.newsapi,
                settings.credential().unwrap_or_default(),
            )?),
        };
        sources.insert(
            source,
            SourceRuntime {
                connector,
                write_mode: settings.write_mode,
            },
        );
    }
    Ok(sources)
}

fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}
