//! TTL-indexed answer cache with single-flight loading.
//!
//! Expired entries behave exactly like absent ones and are evicted lazily on
//! the next lookup. Concurrent `get_or_load` calls for the same cold key
//! coalesce: one caller runs the loader, the rest wait for its outcome. A
//! failed load is not cached, so the next caller simply retries.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

enum Slot<V> {
    Ready { value: V, expires_at: Instant },
    // The sender side lives in the loading task; waiters observe its drop.
    InFlight(watch::Receiver<()>),
}

pub struct Cache<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    /// Upper bound applied to every inserted TTL.
    max_ttl: Duration,
}

impl<V: Clone> Cache<V> {
    pub fn new(max_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(Slot::Ready { value, expires_at }) if *expires_at > Instant::now() => Some(value.clone()),
            Some(Slot::Ready { .. }) => {
                entries.remove(key);
                None
            }
            _ => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl.min(self.max_ttl);
        self.entries
            .lock()
            .insert(key.into(), Slot::Ready { value, expires_at });
    }

    /// Cache-or-compute. At most one loader runs per key at a time; every
    /// waiter observes the loader's value, or retries after its failure.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, Duration), E>>,
    {
        let flight = loop {
            let mut wait_rx = {
                let mut entries = self.entries.lock();
                match entries.get(key) {
                    Some(Slot::Ready { value, expires_at }) if *expires_at > Instant::now() => {
                        return Ok(value.clone());
                    }
                    // A receiver whose sender is gone marks a loader that was
                    // cancelled mid-flight; this caller takes over.
                    Some(Slot::InFlight(rx)) if rx.has_changed().is_ok() => rx.clone(),
                    _ => {
                        let (tx, rx) = watch::channel(());
                        entries.insert(key.to_string(), Slot::InFlight(rx));
                        break tx;
                    }
                }
            };
            let _ = wait_rx.changed().await;
        };

        let result = loader().await;
        {
            let mut entries = self.entries.lock();
            match &result {
                Ok((value, ttl)) => {
                    let expires_at = Instant::now() + (*ttl).min(self.max_ttl);
                    entries.insert(
                        key.to_string(),
                        Slot::Ready {
                            value: value.clone(),
                            expires_at,
                        },
                    );
                }
                Err(_) => {
                    entries.remove(key);
                }
            }
        }
        // Dropping the sender wakes every waiter parked on this flight.
        drop(flight);
        result.map(|(value, _)| value)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn hit_before_expiry_miss_after() {
        let cache: Cache<u32> = Cache::new(Duration::from_secs(60));
        cache.set("k", 7, Duration::from_millis(40));
        assert_eq!(cache.get("k"), Some(7));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("k"), None);
        // Expired slot was evicted, not just hidden.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn ttl_is_clamped_to_cache_maximum() {
        let cache: Cache<u32> = Cache::new(Duration::from_millis(30));
        cache.set("k", 1, Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn single_flight_runs_loader_once() {
        let cache: Arc<Cache<u64>> = Arc::new(Cache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_load("cold", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, std::io::Error>((42u64, Duration::from_secs(10)))
                    })
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let cache: Cache<u64> = Cache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let first: Result<u64, std::io::Error> = cache
            .get_or_load("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::other("upstream down"))
            })
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_load("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>((9u64, Duration::from_secs(10)))
            })
            .await;
        assert_eq!(second.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_key_skips_the_loader() {
        let cache: Cache<String> = Cache::new(Duration::from_secs(60));
        cache.set("warm", "hello".to_string(), Duration::from_secs(30));
        let calls = AtomicUsize::new(0);

        let value = cache
            .get_or_load("warm", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(("reloaded".to_string(), Duration::ZERO))
            })
            .await
            .unwrap();
        assert_eq!(value, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
