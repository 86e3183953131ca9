use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use crate::error::CoordinatorError;

pub type Task = Box<dyn FnOnce() + Send>;

/// Runs a task once after a delay. Used for the deferred teardown of operations
/// nobody subscribes to anymore.
pub trait SchedulerInner: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<dyn SchedulerInner>,
}

impl Scheduler {
    pub fn new(scheduler: impl SchedulerInner + 'static) -> Scheduler {
        Scheduler {
            inner: Arc::new(scheduler),
        }
    }

    /// A scheduler driven by the tokio runtime of the calling context.
    pub fn tokio() -> Result<Scheduler, CoordinatorError> {
        TokioScheduler::current().map(Scheduler::new)
    }
}

impl Deref for Scheduler {
    type Target = dyn SchedulerInner;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// Cancels a scheduled task. Dropping the handle lets the task run.
#[must_use]
pub struct TaskHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        TaskHandle {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle for a task that cannot be cancelled anymore.
    pub fn detached() -> Self {
        TaskHandle { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

pub struct TokioScheduler {
    runtime: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        TokioScheduler { runtime }
    }

    pub fn current() -> Result<Self, CoordinatorError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|_| CoordinatorError::NoRuntime)
    }
}

impl SchedulerInner for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });

        TaskHandle::new(move || join.abort())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use manual::ManualScheduler;

#[cfg(any(test, feature = "test-utils"))]
mod manual {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    };

    use super::{SchedulerInner, Task, TaskHandle};

    /// A virtual clock. Nothing runs until the test advances time.
    #[derive(Clone, Default)]
    pub struct ManualScheduler {
        state: Arc<Mutex<State>>,
    }

    #[derive(Default)]
    struct State {
        now: Duration,
        next_id: u64,
        tasks: BTreeMap<(Duration, u64), Task>,
    }

    impl ManualScheduler {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn now(&self) -> Duration {
            self.lock().now
        }

        pub fn pending(&self) -> usize {
            self.lock().tasks.len()
        }

        /// Moves the clock forward, running every task that becomes due in
        /// deadline order. Tasks scheduled while advancing run too if they fall
        /// within the window.
        pub fn advance(&self, by: Duration) {
            let target = self.lock().now + by;

            loop {
                let task = {
                    let mut state = self.lock();
                    match state.tasks.first_key_value() {
                        Some((&(deadline, id), _)) if deadline <= target => {
                            state.now = deadline;
                            state.tasks.remove(&(deadline, id))
                        }
                        _ => None,
                    }
                };

                match task {
                    Some(task) => task(),
                    None => break,
                }
            }

            self.lock().now = target;
        }

        /// Runs every task due at the current instant.
        pub fn run_pending(&self) {
            self.advance(Duration::ZERO);
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl SchedulerInner for ManualScheduler {
        fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
            let key = {
                let mut state = self.lock();
                let key = (state.now + delay, state.next_id);
                state.next_id += 1;
                state.tasks.insert(key, task);
                key
            };

            let state = Arc::downgrade(&self.state);
            TaskHandle::new(move || {
                if let Some(state) = state.upgrade() {
                    let task = state.lock().unwrap_or_else(PoisonError::into_inner).tasks.remove(&key);
                    drop(task);
                }
            })
        }
    }
}
