//! Self-rescheduling timer tasks.
//!
//! A [`RecurringTask`] arms a one-shot timer, runs its callback when the timer
//! fires and arms the next timer only after the callback has returned. The
//! callback decides whether to continue through a `&mut bool` that starts out
//! `true` on every invocation.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::debug;

use crate::event_loop::{Executor, Job};

type Callback = Box<dyn FnMut(&mut bool)>;

/// Lifecycle of a recurring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, nothing scheduled or run yet.
    Idle,
    /// A timer is pending.
    Armed,
    /// The callback is executing.
    Running,
    /// The callback cleared the continuation flag. Terminal.
    Stopped,
}

struct TaskCore {
    interval: Duration,
    callback: RefCell<Callback>,
    state: Cell<TaskState>,
    invocations: Cell<u64>,
}

impl TaskCore {
    fn invoke(self: &Rc<Self>, executor: &dyn Executor) {
        if self.state.get() == TaskState::Stopped {
            return;
        }
        self.state.set(TaskState::Running);
        self.invocations.set(self.invocations.get() + 1);

        let mut keep_going = true;
        let unwind = RearmOnUnwind {
            core: self,
            executor,
        };
        {
            let mut callback = self.callback.borrow_mut();
            (*callback)(&mut keep_going);
        }
        std::mem::forget(unwind);

        if keep_going {
            self.rearm(executor);
        } else {
            self.state.set(TaskState::Stopped);
            debug!(
                "Recurring task stopped after {} invocation(s)",
                self.invocations.get()
            );
        }
    }

    fn rearm(self: &Rc<Self>, executor: &dyn Executor) {
        self.state.set(TaskState::Armed);
        let job: Weak<TaskCore> = Rc::downgrade(self);
        executor.arm(self.interval, job);
    }
}

impl Job for TaskCore {
    fn fire(self: Rc<Self>, executor: &dyn Executor) {
        self.invoke(executor);
    }
}

/// A panicking callback never got to clear the flag, so the task keeps going.
struct RearmOnUnwind<'a> {
    core: &'a Rc<TaskCore>,
    executor: &'a dyn Executor,
}

impl Drop for RearmOnUnwind<'_> {
    fn drop(&mut self) {
        self.core.rearm(self.executor);
    }
}

/// Handle to a recurring task.
///
/// Clones share the task. Dropping the last clone cancels it: a pending timer
/// is discarded and the callback is not called again, even if the timer was
/// already due. A callback that captures a clone of its own handle keeps
/// itself alive until it clears the continuation flag.
#[derive(Clone)]
pub struct RecurringTask {
    core: Rc<TaskCore>,
}

impl RecurringTask {
    /// Starts a task that runs `callback` every `interval`.
    ///
    /// With `call_on_start`, the first invocation happens synchronously inside
    /// this call; clearing the flag there stops the task before any timer is
    /// armed.
    pub fn start<F>(
        executor: &dyn Executor,
        interval: Duration,
        call_on_start: bool,
        callback: F,
    ) -> RecurringTask
    where
        F: FnMut(&mut bool) + 'static,
    {
        let core = Rc::new(TaskCore {
            interval,
            callback: RefCell::new(Box::new(callback)),
            state: Cell::new(TaskState::Idle),
            invocations: Cell::new(0),
        });

        if call_on_start {
            core.invoke(executor);
        } else {
            core.rearm(executor);
        }

        RecurringTask { core }
    }

    /// Millisecond form of [`start`](Self::start).
    pub fn start_millis<F>(
        executor: &dyn Executor,
        interval_ms: u64,
        callback: F,
        call_on_start: bool,
    ) -> RecurringTask
    where
        F: FnMut(&mut bool) + 'static,
    {
        RecurringTask::start(
            executor,
            Duration::from_millis(interval_ms),
            call_on_start,
            callback,
        )
    }

    /// Begins configuring a task that repeats every `interval`.
    pub fn every(interval: Duration) -> TaskBuilder {
        TaskBuilder {
            interval,
            call_on_start: false,
        }
    }

    pub fn state(&self) -> TaskState {
        self.core.state.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TaskState::Stopped
    }

    /// How many times the callback has been entered.
    pub fn invocations(&self) -> u64 {
        self.core.invocations.get()
    }

    pub fn interval(&self) -> Duration {
        self.core.interval
    }
}

impl fmt::Debug for RecurringTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringTask")
            .field("interval", &self.core.interval)
            .field("state", &self.core.state.get())
            .field("invocations", &self.core.invocations.get())
            .finish()
    }
}

/// Builder returned by [`RecurringTask::every`].
#[derive(Debug, Clone, Copy)]
pub struct TaskBuilder {
    interval: Duration,
    call_on_start: bool,
}

impl TaskBuilder {
    /// Runs the callback once immediately instead of waiting one interval.
    pub fn call_on_start(mut self, call: bool) -> Self {
        self.call_on_start = call;
        self
    }

    pub fn start<F>(self, executor: &dyn Executor, callback: F) -> RecurringTask
    where
        F: FnMut(&mut bool) + 'static,
    {
        RecurringTask::start(executor, self.interval, self.call_on_start, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    /// Executor that only records arm requests; tests fire them by hand.
    #[derive(Default)]
    struct ManualExecutor {
        armed: RefCell<Vec<(Duration, Weak<dyn Job>)>>,
    }

    impl Executor for ManualExecutor {
        fn arm(&self, delay: Duration, job: Weak<dyn Job>) {
            self.armed.borrow_mut().push((delay, job));
        }
    }

    impl ManualExecutor {
        fn armed_count(&self) -> usize {
            self.armed.borrow().len()
        }

        /// Fires the oldest armed job. Returns false if it was already released.
        fn fire_next(&self) -> bool {
            let (_, job) = self.armed.borrow_mut().remove(0);
            match job.upgrade() {
                Some(job) => {
                    job.fire(self);
                    true
                }
                None => false,
            }
        }
    }

    fn countdown(from: u32) -> (Rc<Cell<u32>>, impl FnMut(&mut bool) + 'static) {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let mut left = from;
        let callback = move |keep_going: &mut bool| {
            seen.set(seen.get() + 1);
            left = left.saturating_sub(1);
            if left == 0 {
                *keep_going = false;
            }
        };
        (calls, callback)
    }

    #[test]
    fn arms_without_calling_when_not_on_start() {
        let executor = ManualExecutor::default();
        let (calls, callback) = countdown(3);
        let task = RecurringTask::start(&executor, Duration::from_millis(50), false, callback);

        assert_eq!(calls.get(), 0);
        assert_eq!(task.state(), TaskState::Armed);
        assert_eq!(executor.armed_count(), 1);
        assert_eq!(executor.armed.borrow()[0].0, Duration::from_millis(50));
    }

    #[test]
    fn call_on_start_runs_synchronously_then_arms() {
        let executor = ManualExecutor::default();
        let (calls, callback) = countdown(3);
        let task = RecurringTask::every(Duration::from_millis(5))
            .call_on_start(true)
            .start(&executor, callback);

        assert_eq!(calls.get(), 1);
        assert_eq!(task.invocations(), 1);
        assert_eq!(task.state(), TaskState::Armed);
        assert_eq!(executor.armed_count(), 1);
    }

    #[test]
    fn clearing_flag_on_start_never_arms() {
        let executor = ManualExecutor::default();
        let task = RecurringTask::start(&executor, Duration::from_millis(5), true, |keep_going| {
            *keep_going = false;
        });

        assert!(task.is_stopped());
        assert_eq!(executor.armed_count(), 0);
    }

    #[test]
    fn rearms_until_flag_is_cleared() {
        let executor = ManualExecutor::default();
        let (calls, callback) = countdown(3);
        let task = RecurringTask::start(&executor, Duration::from_millis(5), false, callback);

        while executor.armed_count() > 0 {
            assert!(executor.fire_next());
        }

        assert_eq!(calls.get(), 3);
        assert!(task.is_stopped());
    }

    #[test]
    fn state_is_running_inside_callback() {
        let executor = ManualExecutor::default();
        let handle: Rc<RefCell<Option<RecurringTask>>> = Rc::new(RefCell::new(None));
        let observed = Rc::new(Cell::new(None));

        let slot = Rc::downgrade(&handle);
        let seen = Rc::clone(&observed);
        let task = RecurringTask::start(&executor, Duration::ZERO, false, move |keep_going| {
            if let Some(slot) = slot.upgrade() {
                seen.set(slot.borrow().as_ref().map(RecurringTask::state));
            }
            *keep_going = false;
        });
        *handle.borrow_mut() = Some(task.clone());

        executor.fire_next();
        assert_eq!(observed.get(), Some(TaskState::Running));
        assert!(task.is_stopped());
    }

    #[test]
    fn dropping_handle_suppresses_armed_firing() {
        let executor = ManualExecutor::default();
        let (calls, callback) = countdown(10);
        let task = RecurringTask::start(&executor, Duration::from_millis(5), false, callback);

        drop(task);
        assert!(!executor.fire_next());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn clones_keep_the_task_alive() {
        let executor = ManualExecutor::default();
        let (calls, callback) = countdown(10);
        let task = RecurringTask::start(&executor, Duration::from_millis(5), false, callback);
        let other = task.clone();

        drop(task);
        assert!(executor.fire_next());
        assert_eq!(calls.get(), 1);
        assert_eq!(other.invocations(), 1);
    }

    #[test]
    fn panicking_callback_is_rearmed() {
        let executor = ManualExecutor::default();
        let task = RecurringTask::start(&executor, Duration::from_millis(5), false, |_| {
            panic!("callback failure");
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| executor.fire_next()));
        assert!(result.is_err());
        assert_eq!(task.state(), TaskState::Armed);
        assert_eq!(executor.armed_count(), 1);
        assert_eq!(task.invocations(), 1);
    }

    #[test]
    fn unrepresentable_interval_arms_without_panicking() {
        let event_loop = crate::event_loop::EventLoop::new();
        let (calls, callback) = countdown(3);
        let task = RecurringTask::start(&event_loop, Duration::MAX, false, callback);

        assert_eq!(task.state(), TaskState::Armed);
        assert_eq!(event_loop.turn(), 0);
        assert_eq!(event_loop.pending(), 1);
        assert_eq!(calls.get(), 0);

        drop(task);
        assert_eq!(event_loop.run_for(Duration::MAX), crate::event_loop::RunOutcome::Idle);
    }

    #[test]
    fn start_millis_converts_interval() {
        let executor = ManualExecutor::default();
        let task = RecurringTask::start_millis(&executor, 250, |_| {}, false);
        assert_eq!(task.interval(), Duration::from_millis(250));
    }
}
