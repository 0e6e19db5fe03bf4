//! Fibers: cooperative tasks executing step chains on the tokio runtime.

use crate::types::Error;
use crate::work::packet::Packet;
use crate::work::step::{NextAction, StepRef};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, trace};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_FIBER: Arc<Fiber>;
}

/// Delivered exactly once when a fiber finishes its chain or fails.
/// Cancelled fibers receive neither call.
pub trait CompletionCallback: Send + Sync {
    fn on_completion(&self, packet: &Packet);

    fn on_throwable(&self, packet: &Packet, error: &Error);
}

/// Handle to a running (or finished) fiber. The executing task is the
/// only one that ever calls `apply`, so at most one step of a fiber runs
/// at any instant.
pub struct Fiber {
    id: u64,
    cancel_tx: watch::Sender<bool>,
    terminated: AtomicBool,
    suspended_at: Mutex<Option<String>>,
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(Error),
}

impl Fiber {
    pub(crate) fn new() -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            cancel_tx,
            terminated: AtomicBool::new(false),
            suspended_at: Mutex::new(None),
        })
    }

    /// Starts a new fiber executing `steps` front to back.
    /// `on_exit` runs after the fiber terminates for any reason.
    pub fn start(
        steps: Vec<StepRef>,
        packet: Packet,
        callback: Arc<dyn CompletionCallback>,
        on_exit: Box<dyn FnOnce() + Send>,
    ) -> Arc<Fiber> {
        let fiber = Fiber::new();
        fiber.launch(steps, packet, callback, on_exit);
        fiber
    }

    /// Starts a fiber that is not tracked by any gate.
    pub fn start_detached(
        steps: Vec<StepRef>,
        packet: Packet,
        callback: Arc<dyn CompletionCallback>,
    ) -> Arc<Fiber> {
        Fiber::start(steps, packet, callback, Box::new(|| {}))
    }

    pub(crate) fn launch(
        self: &Arc<Self>,
        steps: Vec<StepRef>,
        packet: Packet,
        callback: Arc<dyn CompletionCallback>,
        on_exit: Box<dyn FnOnce() + Send>,
    ) {
        let fiber = self.clone();
        tokio::spawn(CURRENT_FIBER.scope(fiber.clone(), async move {
            run(fiber, steps.into(), packet, callback, on_exit).await;
        }));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The fiber executing the current task, if any.
    pub fn current() -> Option<Arc<Fiber>> {
        CURRENT_FIBER.try_with(Arc::clone).ok()
    }

    /// Requests cancellation; honored at the next apply boundary or
    /// suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Name of the step this fiber is currently suspended at, if any.
    pub fn suspended_step(&self) -> Option<String> {
        self.suspended_at.lock().unwrap().clone()
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn run(
    fiber: Arc<Fiber>,
    mut queue: VecDeque<StepRef>,
    mut packet: Packet,
    callback: Arc<dyn CompletionCallback>,
    on_exit: Box<dyn FnOnce() + Send>,
) {
    let outcome = loop {
        if fiber.is_cancelled() {
            break Outcome::Cancelled;
        }
        let Some(step) = queue.pop_front() else {
            break Outcome::Completed;
        };
        trace!(fiber = fiber.id, step = step.name(), "applying step");
        match step.apply(&mut packet).await {
            Ok(NextAction::Continue) => {}
            Ok(NextAction::Invoke(steps)) => {
                for s in steps.into_iter().rev() {
                    queue.push_front(s);
                }
            }
            Ok(NextAction::Divert(steps)) => {
                queue = steps.into();
            }
            Ok(NextAction::Suspend(resumption)) => {
                *fiber.suspended_at.lock().unwrap() = Some(step.name().to_string());
                let resumed = tokio::select! {
                    () = fiber.cancelled() => None,
                    r = resumption => Some(r),
                };
                *fiber.suspended_at.lock().unwrap() = None;
                match resumed {
                    None => break Outcome::Cancelled,
                    Some(Err(e)) => break Outcome::Failed(e),
                    Some(Ok(())) => {}
                }
            }
            Ok(NextAction::End) => break Outcome::Completed,
            Err(e) => break Outcome::Failed(e),
        }
    };

    fiber.terminated.store(true, Ordering::Release);
    match outcome {
        Outcome::Completed => callback.on_completion(&packet),
        Outcome::Failed(error) => callback.on_throwable(&packet, &error),
        Outcome::Cancelled => {
            debug!(fiber = fiber.id, "fiber cancelled");
        }
    }
    on_exit();
}
