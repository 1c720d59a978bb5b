use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            soft: config.soft_time_limit(),
            hard: config.hard_time_limit(),
        }
    }

    /// Runs `fut` under both limits. Passing the soft limit only logs; at the
    /// hard limit the future is dropped and whatever it already wrote stays.
    pub async fn run<T>(&self, label: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::pin!(fut);

        if let Ok(result) = tokio::time::timeout(self.soft, &mut fut).await {
            return result;
        }
        tracing::warn!(task = label, limit = ?self.soft, "Soft time limit exceeded");

        let remaining = self.hard.saturating_sub(self.soft);
        match tokio::time::timeout(remaining, &mut fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(task = label, limit = ?self.hard, "Hard time limit exceeded, task terminated");
                Err(AppError::TimeLimit(self.hard))
            }
        }
    }
}
