//! Per-namespace registries enforcing at most one active fiber per key.

use crate::work::fiber::{CompletionCallback, Fiber};
use crate::work::packet::Packet;
use crate::work::step::StepRef;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Serializes all fibers started under the same key (a domain UID).
/// A namespace gets one gate for make-right work and another for status
/// reads; gates are independent of each other.
pub struct FiberGate {
    fibers: Mutex<HashMap<String, Arc<Fiber>>>,
}

impl Default for FiberGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberGate {
    pub fn new() -> Self {
        Self {
            fibers: Mutex::new(HashMap::new()),
        }
    }

    /// Cancels any current fiber for `key`, then starts a new one.
    pub fn start_fiber(
        self: &Arc<Self>,
        key: &str,
        steps: Vec<StepRef>,
        packet: Packet,
        callback: Arc<dyn CompletionCallback>,
    ) -> Arc<Fiber> {
        let fiber = Fiber::new();
        let previous = {
            let mut map = self.fibers.lock().unwrap();
            map.insert(key.to_string(), fiber.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        fiber.launch(steps, packet, callback, self.remove_on_exit(key, fiber.id()));
        fiber
    }

    /// Starts a fiber only if no fiber is currently active for `key`.
    pub fn start_fiber_if_no_current_fiber(
        self: &Arc<Self>,
        key: &str,
        steps: Vec<StepRef>,
        packet: Packet,
        callback: Arc<dyn CompletionCallback>,
    ) -> Option<Arc<Fiber>> {
        let fiber = Fiber::new();
        {
            let mut map = self.fibers.lock().unwrap();
            if map.get(key).map(|f| !f.is_terminated()).unwrap_or(false) {
                return None;
            }
            map.insert(key.to_string(), fiber.clone());
        }
        fiber.launch(steps, packet, callback, self.remove_on_exit(key, fiber.id()));
        Some(fiber)
    }

    /// Starts a fiber only if the current fiber for `key` is the given
    /// one; used to chain a follow-up safely from a completion callback.
    pub fn start_fiber_if_last_fiber_matches(
        self: &Arc<Self>,
        key: &str,
        expected: &Fiber,
        steps: Vec<StepRef>,
        packet: Packet,
        callback: Arc<dyn CompletionCallback>,
    ) -> Option<Arc<Fiber>> {
        let fiber = Fiber::new();
        {
            let mut map = self.fibers.lock().unwrap();
            if map.get(key).map(|f| f.id()) != Some(expected.id()) {
                return None;
            }
            map.insert(key.to_string(), fiber.clone());
        }
        fiber.launch(steps, packet, callback, self.remove_on_exit(key, fiber.id()));
        Some(fiber)
    }

    /// Snapshot of the live fibers, for diagnostics.
    pub fn current_fibers(&self) -> HashMap<String, Arc<Fiber>> {
        let map = self.fibers.lock().unwrap();
        map.iter()
            .filter(|(_, f)| !f.is_terminated())
            .map(|(k, f)| (k.clone(), f.clone()))
            .collect()
    }

    fn remove_on_exit(self: &Arc<Self>, key: &str, fiber_id: u64) -> Box<dyn FnOnce() + Send> {
        let gate = self.clone();
        let key = key.to_string();
        Box::new(move || {
            let mut map = gate.fibers.lock().unwrap();
            if map.get(&key).map(|f| f.id()) == Some(fiber_id) {
                map.remove(&key);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::DomainPresenceInfo;
    use crate::types::Error;
    use crate::work::step::testing::FnStep;
    use crate::work::step::NextAction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoopCallback;

    impl CompletionCallback for NoopCallback {
        fn on_completion(&self, _packet: &Packet) {}
        fn on_throwable(&self, _packet: &Packet, _error: &Error) {}
    }

    fn packet() -> Packet {
        Packet::new(Arc::new(DomainPresenceInfo::new("ns", "uid1")))
    }

    fn parked_step() -> StepRef {
        FnStep::arc("park", |_p| {
            Ok(NextAction::Suspend(Box::pin(std::future::pending())))
        })
    }

    fn counting_step(counter: &Arc<AtomicUsize>) -> StepRef {
        let counter = counter.clone();
        FnStep::arc("count", move |_p| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(NextAction::Continue)
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn at_most_one_active_fiber_per_key() {
        let gate = Arc::new(FiberGate::new());
        gate.start_fiber("uid1", vec![parked_step()], packet(), Arc::new(NoopCallback));
        settle().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let rejected = gate.start_fiber_if_no_current_fiber(
            "uid1",
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        assert!(rejected.is_none());
        assert_eq!(gate.current_fibers().len(), 1);

        // A different key is unaffected.
        let other = gate.start_fiber_if_no_current_fiber(
            "uid2",
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        assert!(other.is_some());
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_fiber_interrupts_the_current_one() {
        let gate = Arc::new(FiberGate::new());
        let first = gate.start_fiber("uid1", vec![parked_step()], packet(), Arc::new(NoopCallback));
        settle().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let second = gate.start_fiber(
            "uid1",
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        settle().await;
        assert!(first.is_cancelled());
        assert!(second.is_terminated());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn follow_up_requires_matching_fiber() {
        let gate = Arc::new(FiberGate::new());
        let first = gate.start_fiber("uid1", vec![parked_step()], packet(), Arc::new(NoopCallback));
        settle().await;

        let ran = Arc::new(AtomicUsize::new(0));
        // Matching fiber: follow-up replaces it.
        let followed = gate.start_fiber_if_last_fiber_matches(
            "uid1",
            &first,
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        assert!(followed.is_some());
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // Stale fiber: no-op.
        let stale = gate.start_fiber_if_last_fiber_matches(
            "uid1",
            &first,
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn terminated_fibers_leave_the_gate() {
        let gate = Arc::new(FiberGate::new());
        let ran = Arc::new(AtomicUsize::new(0));
        gate.start_fiber(
            "uid1",
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        settle().await;
        assert!(gate.current_fibers().is_empty());

        // The key is free again.
        let restarted = gate.start_fiber_if_no_current_fiber(
            "uid1",
            vec![counting_step(&ran)],
            packet(),
            Arc::new(NoopCallback),
        );
        assert!(restarted.is_some());
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
