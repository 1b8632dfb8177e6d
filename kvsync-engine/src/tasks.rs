//! Tracking of detached background work.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Counter {
    running: AtomicUsize,
    idle: Notify,
}

/// Spawns detached tasks on a runtime and lets callers wait for all of
/// them to finish.
///
/// Tasks are never joined individually; the caller of an operation that
/// spawns one never waits for it.
#[derive(Debug, Clone)]
pub(crate) struct TaskTracker {
    runtime: Handle,
    counter: Arc<Counter>,
}

/// Decrements the running count even when the task panics or is aborted.
struct RunningGuard(Arc<Counter>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskTracker {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            counter: Arc::new(Counter::default()),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.counter.running.fetch_add(1, Ordering::AcqRel);
        let guard = RunningGuard(self.counter.clone());
        self.runtime.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    pub(crate) fn running(&self) -> usize {
        self.counter.running.load(Ordering::Acquire)
    }

    /// Wait until no tracked task is running.
    ///
    /// Tasks spawned while waiting are waited for too.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.counter.idle.notified();
            if self.running() == 0 {
                return;
            }
            idle.await;
        }
    }
}
