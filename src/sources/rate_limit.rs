use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Spaces outbound calls to one source at least `interval` apart. Callers
/// queue on the lock, so calls are serialized across concurrent tasks.
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn spaces_consecutive_calls() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(30)));
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.wait().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let started = Instant::now();
        for _ in 0..100 {
            limiter.wait().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
