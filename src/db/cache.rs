use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio_rusqlite::Connection;

use crate::clock::Clock;
use crate::error::Result;
use crate::models::Source;

use super::repository::{fmt_ts, Repository};

/// Memoizes raw provider responses for a (query, model, calendar day) key.
///
/// Expired entries are misses; nothing is deleted on read. Concurrent
/// `get_or_fetch` calls for the same key are serialized, so a key costs at
/// most one outbound call per day.
pub struct ResponseCache {
    conn: Connection,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResponseCache {
    pub fn new(repo: &Repository, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            conn: repo.conn.clone(),
            clock,
            ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// `sha256(normalized_query:model:YYYY-MM-DD)` as hex, dated in UTC.
    pub fn key(&self, query: &str, model: &str) -> String {
        let normalized = query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let day = self.clock.now().format("%Y-%m-%d");

        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}", normalized, model, day).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let now = fmt_ts(self.clock.now());
        let payload = self
            .conn
            .call(move |conn| {
                let payload = conn
                    .query_row(
                        "SELECT payload FROM content_cache WHERE cache_key = ?1 AND expires_at > ?2",
                        params![key, now],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(payload)
            })
            .await?;
        Ok(payload)
    }

    pub async fn put(&self, key: &str, source: Source, payload: &str) -> Result<()> {
        let now = self.clock.now();
        let created_at = fmt_ts(now);
        let expires_at = fmt_ts(now + self.ttl);
        let key = key.to_string();
        let payload = payload.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO content_cache (cache_key, source, payload, created_at, expires_at)
                       VALUES (?1, ?2, ?3, ?4, ?5)
                       ON CONFLICT(cache_key) DO UPDATE SET
                           source = excluded.source,
                           payload = excluded.payload,
                           created_at = excluded.created_at,
                           expires_at = excluded.expires_at"#,
                    params![key, source.as_str(), payload, created_at, expires_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Returns the cached payload for `key`, or runs `fetch`, stores its
    /// output and returns it. The flag is true on a cache hit.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        source: Source,
        fetch: F,
    ) -> Result<(String, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let gate = self.gate(key);
        let result = {
            let _guard = gate.lock().await;
            self.fill(key, source, fetch).await
        };
        self.release(key, gate);
        result
    }

    async fn fill<F, Fut>(&self, key: &str, source: Source, fetch: F) -> Result<(String, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(payload) = self.get(key).await? {
            tracing::debug!(key, source = %source, "Cache hit");
            return Ok((payload, true));
        }
        tracing::debug!(key, source = %source, "Cache miss");
        let payload = fetch().await?;
        self.put(key, source, &payload).await?;
        Ok((payload, false))
    }

    fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this caller hold the gate: nobody is waiting on it.
        if Arc::strong_count(&gate) <= 2 {
            in_flight.remove(key);
        }
        drop(gate);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::error::AppError;

    async fn setup() -> (Arc<ManualClock>, Arc<ResponseCache>) {
        let repo = Repository::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        let cache = ResponseCache::new(&repo, clock.clone(), Duration::hours(24));
        (clock, Arc::new(cache))
    }

    #[tokio::test]
    async fn key_normalizes_query_and_changes_daily() {
        let (clock, cache) = setup().await;
        let a = cache.key("  Latest news on   AI Policy ", "sonar");
        let b = cache.key("latest news on ai policy", "sonar");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache.key("latest news on ai policy", "sonar-pro"));

        clock.advance(Duration::days(1));
        assert_ne!(a, cache.key("latest news on ai policy", "sonar"));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (clock, cache) = setup().await;
        cache.put("k", Source::Perplexity, "payload").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("payload"));

        clock.advance(Duration::hours(23));
        assert!(cache.get("k").await.unwrap().is_some());
        clock.advance(Duration::hours(1));
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_call() {
        let (_clock, cache) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("same", Source::Perplexity, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("body".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut hits = 0;
        for handle in handles {
            let (payload, hit) = handle.await.unwrap();
            assert_eq!(payload, "body");
            hits += usize::from(hit);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 4);
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let (_clock, cache) = setup().await;
        let err = cache
            .get_or_fetch("k", Source::Perplexity, || async {
                Err(AppError::malformed("perplexity", "empty"))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
