use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::config::Config;
use crate::db::TaskQueue;
use crate::models::{Source, TaskSpec};

/// A task enqueued every `every`.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub every: Duration,
    pub spec: TaskSpec,
}

/// Periodic refreshes for sources with a schedule, plus the retention purge.
pub fn schedules(config: &Config) -> Vec<Schedule> {
    let mut schedules: Vec<Schedule> = Source::ALL
        .into_iter()
        .filter_map(|source| {
            let settings = config.settings(source);
            if !settings.enabled {
                return None;
            }
            let hours = settings.schedule_hours?;
            Some(Schedule {
                every: Duration::from_secs(hours * 3600),
                spec: TaskSpec::RefreshAll { source },
            })
        })
        .collect();

    schedules.push(Schedule {
        every: Duration::from_secs(config.retention.interval_hours * 3600),
        spec: TaskSpec::Purge {
            max_age_hours: config.retention.max_age_hours,
        },
    });
    schedules
}

/// Enqueues each schedule's task on its own interval. The first tick comes
/// one period after start; ticks missed while the process was busy are
/// skipped rather than replayed.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn start(queue: TaskQueue, schedules: Vec<Schedule>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = schedules
            .into_iter()
            .map(|schedule| {
                let queue = queue.clone();
                let mut rx = rx.clone();
                tokio::spawn(async move {
                    let name = schedule.spec.name();
                    info!(task = %name, every = ?schedule.every, "Schedule registered");
                    let mut ticker = interval_at(Instant::now() + schedule.every, schedule.every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(e) = queue.enqueue(&schedule.spec).await {
                                    error!(task = %name, "Failed to enqueue scheduled task: {}", e);
                                }
                            }
                            _ = rx.changed() => break,
                        }
                    }
                })
            })
            .collect();
        Self { handles, shutdown }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Repository;
    use crate::models::TaskStatus;

    #[test]
    fn default_schedules() {
        let config = Config::default();
        let schedules = schedules(&config);
        assert_eq!(
            schedules,
            vec![
                Schedule {
                    every: Duration::from_secs(6 * 3600),
                    spec: TaskSpec::RefreshAll {
                        source: Source::Perplexity
                    },
                },
                Schedule {
                    every: Duration::from_secs(3 * 3600),
                    spec: TaskSpec::Purge { max_age_hours: 24 },
                },
            ]
        );
    }

    #[test]
    fn disabled_sources_are_not_scheduled() {
        let mut config = Config::default();
        config.perplexity.settings.enabled = false;
        config.reddit.settings.schedule_hours = Some(1);
        let specs: Vec<TaskSpec> = schedules(&config).into_iter().map(|s| s.spec).collect();
        assert_eq!(specs[0], TaskSpec::RefreshAll { source: Source::Reddit });
        assert_eq!(specs.len(), 2);
    }

    #[tokio::test]
    async fn first_tick_comes_after_one_period() {
        let repo = Repository::open_in_memory().await.unwrap();
        let queue = TaskQueue::new(&repo);
        let scheduler = Scheduler::start(
            queue.clone(),
            vec![Schedule {
                every: Duration::from_millis(200),
                spec: TaskSpec::Purge { max_age_hours: 24 },
            }],
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.claim_next().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let task = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(task.spec, TaskSpec::Purge { max_age_hours: 24 });
        assert_eq!(task.status, TaskStatus::Running);

        scheduler.shutdown().await;
    }
}
