//! A single-threaded timer executor.
//!
//! The loop only keeps [`Weak`] references to its jobs. Whoever owns the
//! strong reference decides whether a job is still alive; once it is gone, a
//! queued firing is skipped and pruned.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{ForgeError, ForgeResult};

/// Longest uninterrupted sleep, so stop requests are noticed promptly.
const STOP_POLL: Duration = Duration::from_millis(10);

/// Something that can schedule one-shot firings.
pub trait Executor {
    /// Fires `job` once, no earlier than `delay` from now, if it is still alive.
    fn arm(&self, delay: Duration, job: Weak<dyn Job>);
}

/// A unit of work fired by an [`Executor`].
pub trait Job {
    fn fire(self: Rc<Self>, executor: &dyn Executor);
}

struct Pending {
    /// `None` when the delay does not fit in an `Instant`; never due.
    deadline: Option<Instant>,
    seq: u64,
    job: Weak<dyn Job>,
}

impl Pending {
    fn is_live(&self) -> bool {
        self.job.strong_count() > 0
    }
}

// BinaryHeap is a max-heap; reverse so the earliest deadline pops first and
// equal deadlines pop in arm order.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        deadline_order(other.deadline, self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

fn deadline_order(a: Option<Instant>, b: Option<Instant>) -> CmpOrdering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Pending {}

/// Requests a running [`EventLoop`] to return. Usable from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested and not yet consumed by a run.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a `run*` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No live timer is left.
    Idle,
    /// A [`StopHandle`] or registered signal asked the loop to stop.
    Stopped,
    /// The deadline passed.
    TimedOut,
}

/// Single-threaded event loop driving one-shot timers.
///
/// Jobs run on the thread that calls [`run`](Self::run) and friends, one at a
/// time. The loop is neither `Send` nor `Sync`.
pub struct EventLoop {
    timers: RefCell<BinaryHeap<Pending>>,
    next_seq: Cell<u64>,
    stop: Arc<AtomicBool>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            timers: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Stops the loop when `signal` is delivered to the process.
    ///
    /// Signals the process cannot catch (e.g. `SIGKILL`) are rejected.
    pub fn stop_on_signal(&self, signal: i32) -> ForgeResult<()> {
        if signal_hook::consts::FORBIDDEN.contains(&signal) {
            return Err(ForgeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("signal {} cannot be handled", signal),
            )));
        }
        signal_hook::flag::register(signal, Arc::clone(&self.stop))?;
        Ok(())
    }

    /// Number of timers whose job is still alive.
    pub fn pending(&self) -> usize {
        self.prune();
        self.timers.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Fires every timer that is due, without sleeping. Returns how many jobs ran.
    ///
    /// Timers armed while this runs are not fired until the next turn.
    pub fn turn(&self) -> usize {
        let now = Instant::now();
        let limit = self.next_seq.get();
        let mut fired = 0;

        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(p) if p.deadline.is_some_and(|d| d <= now) && p.seq < limit => timers.pop(),
                    _ => None,
                }
            };
            let Some(pending) = due else { break };

            // The heap is not borrowed while the job runs; it may arm again.
            if let Some(job) = pending.job.upgrade() {
                job.fire(self);
                fired += 1;
            }
        }

        fired
    }

    /// Runs until no live timer is left or a stop is requested.
    pub fn run(&self) -> RunOutcome {
        self.run_inner(None)
    }

    /// Runs for at most `duration`. Returns early once no live timer is left.
    ///
    /// A duration too large to represent behaves like [`run`](Self::run).
    pub fn run_for(&self, duration: Duration) -> RunOutcome {
        self.run_inner(Instant::now().checked_add(duration))
    }

    /// Runs until `deadline` at the latest.
    pub fn run_until(&self, deadline: Instant) -> RunOutcome {
        self.run_inner(Some(deadline))
    }

    fn run_inner(&self, deadline: Option<Instant>) -> RunOutcome {
        loop {
            // A stop request is consumed by the run it ends.
            if self.stop.swap(false, Ordering::SeqCst) {
                debug!("Event loop stopped on request");
                return RunOutcome::Stopped;
            }

            self.turn();

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return RunOutcome::TimedOut;
            }

            let Some(next) = self.next_deadline() else {
                return RunOutcome::Idle;
            };

            let wake = match (deadline, next) {
                (Some(d), Some(n)) => Some(d.min(n)),
                (d, n) => d.or(n),
            };
            let nap = wake.map_or(STOP_POLL, |w| w.saturating_duration_since(now));
            if !nap.is_zero() {
                thread::sleep(nap.min(STOP_POLL));
            }
        }
    }

    /// Deadline of the earliest live timer; the inner `None` is a timer that never fires.
    fn next_deadline(&self) -> Option<Option<Instant>> {
        self.prune();
        self.timers.borrow().peek().map(|p| p.deadline)
    }

    fn prune(&self) {
        self.timers.borrow_mut().retain(Pending::is_live);
    }
}

impl Executor for EventLoop {
    fn arm(&self, delay: Duration, job: Weak<dyn Job>) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.timers.borrow_mut().push(Pending {
            deadline: Instant::now().checked_add(delay),
            seq,
            job,
        });
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("timers", &self.timers.borrow().len())
            .field("stopped", &self.stop.load(Ordering::SeqCst))
            .finish()
    }
}
