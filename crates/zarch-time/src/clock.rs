use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic host time source, in nanoseconds since an arbitrary origin.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Host clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_nanos().min(u64::MAX as u128) as u64
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying counter so a test can keep a handle while the machine owns
/// another one.
#[derive(Debug, Clone, Default)]
pub struct FakeHostClock {
    now: Arc<AtomicU64>,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
