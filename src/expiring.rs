//! Concurrent map whose entries expire after a period without access.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Expiring<V> {
    value: V,
    expires_at: Instant,
}

/// Sharded map with a per-entry deadline.
///
/// Every access through [`with_entry_at`](Self::with_entry_at) pushes the
/// entry's deadline to `now + ttl`. An entry past its deadline is treated as
/// absent on the next access and is physically removed by [`sweep_at`](Self::sweep_at),
/// which the owner is expected to call every `sweep_interval`.
///
/// Get-or-create runs under the key's shard write lock, so concurrent first
/// accesses to one key create exactly one value.
pub struct ConcurrentExpiringMap<K, V> {
    entries: DashMap<K, Expiring<V>>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl<K, V> ConcurrentExpiringMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            sweep_interval,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Runs `f` on the live value for `key`, creating it with `init` when the
    /// key is absent or expired.
    pub fn with_entry_at<R>(
        &self,
        key: K,
        now: Instant,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let expires_at = now + self.ttl;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.expires_at <= now {
                    slot.value = init();
                }
                slot.expires_at = expires_at;
                f(&mut slot.value)
            }
            Entry::Vacant(vacant) => {
                let mut slot = vacant.insert(Expiring {
                    value: init(),
                    expires_at,
                });
                f(&mut slot.value)
            }
        }
    }

    /// Whether `key` has a live entry at `now`. Does not refresh it.
    #[cfg(test)]
    pub fn contains_at(&self, key: &K, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| slot.expires_at > now)
    }

    /// Removes every entry expired at `now` and returns how many were dropped.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
