//! Process-wide serialization of mutating pipeline sequences

use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

/// One async mutex shared by every read-then-write sequence over derived
/// artifacts (extract, train, reset, recalculate, garbage collection).
///
/// Internal steps take a `&GateGuard` so they can only run while the gate
/// is held, and compose without re-entering it.
#[derive(Debug, Default)]
pub struct Gate {
    lock: Mutex<()>,
}

/// Proof that the gate is held.
#[derive(Debug)]
pub struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    op: &'static str,
}

impl GateGuard<'_> {
    pub fn op(&self) -> &'static str {
        self.op
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the gate.
    pub async fn enter(&self, op: &'static str) -> GateGuard<'_> {
        let started = Instant::now();
        let guard = self.lock.lock().await;
        tracing::debug!(op, waited_ms = started.elapsed().as_millis() as u64, "gate acquired");
        GateGuard { _guard: guard, op }
    }

    /// Take the gate only if it is free.
    pub fn try_enter(&self, op: &'static str) -> Option<GateGuard<'_>> {
        self.lock
            .try_lock()
            .ok()
            .map(|guard| GateGuard { _guard: guard, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn excludes_second_holder() {
        let gate = Gate::new();
        let held = gate.enter("first").await;
        assert_eq!(held.op(), "first");
        assert!(gate.try_enter("second").is_none());
        drop(held);
        assert!(gate.try_enter("second").is_some());
    }

    #[tokio::test]
    async fn serializes_concurrent_sections() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = gate.enter("section").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
