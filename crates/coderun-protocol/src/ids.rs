use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Correlates one dispatched request with every envelope that answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(u64);

impl RequestKey {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of request keys. Implementations must never hand the same key to
/// two callers, including callers racing on different threads.
pub trait KeyAllocator: Send + Sync {
    fn allocate(&self) -> RequestKey;
}

#[derive(Debug, Default)]
pub struct LocalKeyAllocator {
    last_issued: AtomicU64,
}

impl LocalKeyAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first allocated key will be `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            last_issued: AtomicU64::new(first.saturating_sub(1)),
        }
    }
}

impl KeyAllocator for LocalKeyAllocator {
    fn allocate(&self) -> RequestKey {
        let mut current = self.last_issued.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(1)
                .expect("request key space exhausted");
            match self.last_issued.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return RequestKey(next),
                Err(observed) => current = observed,
            }
        }
    }
}

/// Cloneable handle onto a single counter, for several dispatchers that
/// share one executor host.
#[derive(Debug, Clone, Default)]
pub struct SharedKeyAllocator {
    counter: Arc<LocalKeyAllocator>,
}

impl SharedKeyAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyAllocator for SharedKeyAllocator {
    fn allocate(&self) -> RequestKey {
        self.counter.allocate()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::{KeyAllocator, LocalKeyAllocator, RequestKey, SharedKeyAllocator};

    #[test]
    fn local_allocator_starts_at_one_and_increments() {
        let keys = LocalKeyAllocator::new();
        assert_eq!(keys.allocate(), RequestKey::new(1));
        assert_eq!(keys.allocate(), RequestKey::new(2));
        assert_eq!(LocalKeyAllocator::starting_at(40).allocate().get(), 40);
    }

    #[test]
    #[should_panic(expected = "request key space exhausted")]
    fn local_allocator_panics_when_key_space_is_exhausted() {
        let keys = LocalKeyAllocator::new();
        keys.last_issued
            .store(u64::MAX, std::sync::atomic::Ordering::Relaxed);
        let _ = keys.allocate();
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let keys = Arc::new(LocalKeyAllocator::new());
        let workers = (0..8)
            .map(|_| {
                let keys = Arc::clone(&keys);
                thread::spawn(move || (0..500).map(|_| keys.allocate()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for worker in workers {
            for key in worker.join().expect("allocator thread") {
                assert!(seen.insert(key), "duplicate key {key}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn shared_allocator_clones_draw_from_one_counter() {
        let first = SharedKeyAllocator::new();
        let second = first.clone();

        assert_eq!(first.allocate().get(), 1);
        assert_eq!(second.allocate().get(), 2);
        assert_eq!(first.allocate().get(), 3);
    }

    #[test]
    fn request_key_serializes_as_bare_integer() {
        let json = serde_json::to_string(&RequestKey::new(17)).expect("serialize key");
        assert_eq!(json, "17");
    }
}
