use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockKey = (i64, String);

/// A merge may land between resolving a fingerprint and locking it; callers
/// give up after this many re-resolutions.
pub(crate) const MAX_RESOLVE_ATTEMPTS: usize = 8;

/// Entries beyond this count trigger a sweep of locks nobody holds.
const PRUNE_THRESHOLD: usize = 1024;

/// Per-(site, fingerprint) async mutexes.
///
/// Ingestion for one fingerprint and merges touching it serialize on the same
/// key; unrelated fingerprints never contend.
#[derive(Default)]
pub struct KeyedLocks {
    inner: StdMutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

/// Held for as long as the key must stay exclusive.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, site_id: i64, fingerprint: &str) -> Arc<Mutex<()>> {
        // A poisoned map still holds valid Arcs; keep serving them.
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if map.len() >= PRUNE_THRESHOLD {
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        map.entry((site_id, fingerprint.to_string()))
            .or_default()
            .clone()
    }

    pub async fn lock(&self, site_id: i64, fingerprint: &str) -> KeyGuard {
        let slot = self.slot(site_id, fingerprint);
        KeyGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Lock two fingerprints of one site in a fixed order so two merges over
    /// the same pair in opposite directions cannot deadlock.
    pub async fn lock_pair(&self, site_id: i64, a: &str, b: &str) -> Vec<KeyGuard> {
        if a == b {
            return vec![self.lock(site_id, a).await];
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.lock(site_id, first).await;
        let g2 = self.lock(site_id, second).await;
        vec![g1, g2]
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
