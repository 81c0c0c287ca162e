// SPDX-License-Identifier: Apache-2.0

//! Per-network serialisation (§5): every state-changing operation on a
//! given network (`start`/`stop`/`update`/`delete`/`forward_*`) is
//! serialised by that network's lock, while reads (`leases`, `state`) take
//! no lock and see best-effort snapshots. This is a plain
//! `std::sync::Mutex` registry, not an async lock: the core crate runs on
//! blocking worker threads per §5, never a cooperative scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Registry handing out one mutex per network name. Entries are created
/// lazily and pruned when no operation holds or is waiting on them.
#[derive(Default)]
pub struct NetworkLockRegistry {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl NetworkLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, network_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = locks.get(network_name).and_then(Weak::upgrade) {
            existing
        } else {
            let fresh = Arc::new(Mutex::new(()));
            locks.insert(network_name.to_string(), Arc::downgrade(&fresh));
            fresh
        }
    }

    /// Blocks the calling thread until the named network's lock is free,
    /// runs `f` while holding it, and releases it before returning.
    pub fn with_lock<R>(&self, network_name: &str, f: impl FnOnce() -> R) -> R {
        let inner = self.entry(network_name);
        let _guard = inner.lock().unwrap_or_else(|p| p.into_inner());
        f()
    }
}

/// Process-wide mutex serialising writes to a network's forkdns servers
/// list file (§4.5, §9). Kept as a single flat mutex rather than sharded
/// per network: the write is cheap and sharding would only add
/// re-entrancy risk.
#[derive(Default)]
pub struct ForkdnsFileLock(Mutex<()>);

impl ForkdnsFileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn serialises_same_network() {
        let registry = Arc::new(NetworkLockRegistry::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let counter = counter.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    registry.with_lock("br0", || {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        thread::yield_now();
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_networks_do_not_block_each_other() {
        let registry = NetworkLockRegistry::new();
        registry.with_lock("br0", || {
            registry.with_lock("br1", || {});
        });
    }
}
