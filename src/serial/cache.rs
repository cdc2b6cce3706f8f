use crate::serial::types::PortError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::log::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const TTL_SERVING_CELL: Duration = Duration::from_millis(200);
const TTL_SIM_AND_MAP: Duration = Duration::from_secs(30);
const TTL_PROVIDER_DATA: Duration = Duration::from_secs(90);
const TTL_DEFAULT: Duration = Duration::from_secs(60);

/// Families that must hit the wire every time: traffic counters move between
/// reads, and SMS service/list/delete/send traffic mutates modem state.
const NON_CACHEABLE: [&str; 5] = ["AT+QGDCNT?", "AT+QGDNRCNT?", "AT+CSMS", "AT+CMGD", "+CMGS="];

/// TTL policy, matched on the normalized command. `None` bypasses the cache.
pub fn ttl_for(command: &str) -> Option<Duration> {
    if NON_CACHEABLE.iter().any(|family| command.contains(family)) {
        return None;
    }
    if command.contains("AT+QENG=\"servingcell\"") {
        return Some(TTL_SERVING_CELL);
    }
    if command.contains("AT+QSIMSTAT?") || command.contains("AT+QMAP=") {
        return Some(TTL_SIM_AND_MAP);
    }
    if command.contains("AT+QSPN") || command.contains("AT+CGCONTRDP") {
        return Some(TTL_PROVIDER_DATA);
    }
    Some(TTL_DEFAULT)
}

pub fn normalize(command: &str) -> String {
    command.trim().replace(['\r', '\n'], "")
}

/// First 8 bytes of SHA-256 over the normalized command.
pub fn fingerprint(normalized: &str) -> u64 {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

struct CacheEntry {
    data: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
}
impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() <= self.ttl
    }
}

type SharedResult = Result<Vec<u8>, PortError>;

enum SlotRole {
    Leader,
    Follower(broadcast::Receiver<SharedResult>),
}

/// Response cache plus in-flight request coalescer. The two maps use
/// independent locks; acquisition order is in-flight before cache, and no
/// lock is held across an await.
pub struct CommandCache {
    entries: Mutex<HashMap<u64, CacheEntry>>,
    in_flight: Mutex<HashMap<u64, broadcast::Sender<SharedResult>>>,
}
impl CommandCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `exec` for the command unless a fresh cached response or an
    /// identical in-flight command can answer instead. At most one executor
    /// runs per fingerprint; coalesced callers wait at most `wait_timeout`.
    pub async fn execute<F, Fut>(
        &self,
        command: &str,
        wait_timeout: Duration,
        exec: F,
    ) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult>,
    {
        let normalized = normalize(command);
        let Some(ttl) = ttl_for(&normalized) else {
            return exec().await;
        };
        let fp = fingerprint(&normalized);

        if let Some(data) = self.lookup(fp) {
            debug!("cache hit for {normalized:?}");
            return Ok(data);
        }

        let role = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            match in_flight.get(&fp) {
                Some(slot) => SlotRole::Follower(slot.subscribe()),
                None => {
                    let (slot, _) = broadcast::channel(1);
                    in_flight.insert(fp, slot);
                    SlotRole::Leader
                }
            }
        };

        match role {
            SlotRole::Follower(mut slot_rx) => {
                debug!("coalescing onto in-flight command {normalized:?}");
                match timeout(wait_timeout, slot_rx.recv()).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(PortError::Closed),
                    Err(_) => Err(PortError::Timeout),
                }
            }
            SlotRole::Leader => {
                let result = exec().await;

                if let Ok(data) = &result {
                    if !data.is_empty() && !ttl.is_zero() {
                        self.store(fp, data.clone(), ttl);
                    }
                }

                let slot = self
                    .in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&fp);
                if let Some(slot) = slot {
                    // No receivers just means nobody coalesced.
                    let _ = slot.send(result.clone());
                }
                result
            }
        }
    }

    fn lookup(&self, fp: u64) -> Option<Vec<u8>> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(&fp)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.data.clone())
    }

    fn store(&self, fp: u64, data: Vec<u8>, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            fp,
            CacheEntry {
                data,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    fn evict_expired(&self) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh());
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("evicted {evicted} expired cache entries");
        }
    }

    /// Periodic eviction of expired entries. Aborted by the supervisor on
    /// shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.evict_expired();
            }
        })
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }
}
impl Default for CommandCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ttl_policy_table() {
        assert_eq!(ttl_for("AT+QGDCNT?"), None);
        assert_eq!(ttl_for("AT+QGDNRCNT?"), None);
        assert_eq!(ttl_for("AT+CMGD=1;+CMGD=2"), None);
        assert_eq!(
            ttl_for("AT+CSMS=1;+CSDH=0;+CMGF=1;+CMGL=\"ALL\""),
            None
        );
        assert_eq!(
            ttl_for("AT+CMGF=1;+CSCS=\"UCS2\";+CMGS=\"004F\",9,1,1"),
            None
        );

        assert_eq!(ttl_for("AT+QENG=\"servingcell\""), Some(TTL_SERVING_CELL));
        assert_eq!(ttl_for("AT+QSIMSTAT?"), Some(TTL_SIM_AND_MAP));
        assert_eq!(ttl_for("AT+QMAP=\"WWAN\""), Some(TTL_SIM_AND_MAP));
        assert_eq!(ttl_for("AT+QSPN"), Some(TTL_PROVIDER_DATA));
        assert_eq!(ttl_for("AT+CGCONTRDP"), Some(TTL_PROVIDER_DATA));
        assert_eq!(ttl_for("ATI"), Some(TTL_DEFAULT));
        assert_eq!(ttl_for("AT+QTEMP"), Some(TTL_DEFAULT));
    }

    #[test]
    fn test_fingerprint_ignores_framing_whitespace() {
        let a = fingerprint(&normalize("AT+QSPN\r\n"));
        let b = fingerprint(&normalize("  AT+QSPN  "));
        let c = fingerprint(&normalize("AT+QTEMP\r\n"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_fresh_entry_answers_without_executing() {
        let cache = CommandCache::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            let data = cache
                .execute("AT+QSPN\r\n", Duration::from_secs(1), || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(b"\r\n+QSPN: \"carrier\",1\r\nOK\r\n".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(data, b"\r\n+QSPN: \"carrier\",1\r\nOK\r\n");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = CommandCache::new();
        let executions = AtomicUsize::new(0);

        let run = |response: &'static [u8]| {
            cache.execute("AT+QENG=\"servingcell\"\r\n", Duration::from_secs(1), || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(response.to_vec())
            })
        };

        assert_eq!(run(b"first\r\nOK\r\n").await.unwrap(), b"first\r\nOK\r\n");
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(run(b"second\r\nOK\r\n").await.unwrap(), b"second\r\nOK\r\n");
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_cacheable_commands_always_execute() {
        let cache = CommandCache::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .execute("AT+QGDCNT?\r\n", Duration::from_secs(1), || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(b"\r\n+QGDCNT: 1,2\r\nOK\r\n".to_vec())
                })
                .await
                .unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = CommandCache::new();
        let executions = AtomicUsize::new(0);

        let err = cache
            .execute("ATI\r\n", Duration::from_secs(1), || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Err(PortError::Timeout)
            })
            .await
            .unwrap_err();
        assert_eq!(err, PortError::Timeout);

        cache
            .execute("ATI\r\n", Duration::from_secs(1), || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(b"hello\r\nOK\r\n".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_identical_commands_coalesce() {
        let cache = Arc::new(CommandCache::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let leader = {
            let cache = Arc::clone(&cache);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                cache
                    .execute("AT+QENG=\"servingcell\"\r\n", Duration::from_secs(5), || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(b"\r\n+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\"\r\nOK\r\n".to_vec())
                    })
                    .await
            })
        };

        // Give the leader time to claim the in-flight slot.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let cache = Arc::clone(&cache);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                cache
                    .execute("AT+QENG=\"servingcell\"\r\n", Duration::from_secs(5), || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(b"unexpected".to_vec())
                    })
                    .await
            })
        };

        let leader_data = leader.await.unwrap().unwrap();
        let follower_data = follower.await.unwrap().unwrap();

        assert_eq!(leader_data, follower_data);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_expired_entries() {
        let cache = Arc::new(CommandCache::new());
        cache
            .execute("AT+QENG=\"servingcell\"\r\n", Duration::from_secs(1), || async {
                Ok(b"data\r\nOK\r\n".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(cache.entry_count(), 1);

        let sweeper = cache.start_sweeper();
        // `advance` jumps the clock forward but, per its own documentation,
        // does not guarantee that timers are polled before it returns — step
        // forward in small increments so the sweeper's tick is actually
        // driven before we assert on its effect.
        for _ in 0..16 {
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
            if cache.entry_count() == 0 {
                break;
            }
        }

        assert_eq!(cache.entry_count(), 0);
        sweeper.abort();
    }
}
