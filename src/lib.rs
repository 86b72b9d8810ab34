//! # InstanceForge
//!
//! **InstanceForge** provides two start-up primitives for long-running applications and daemons:
//!
//! - [`SingleInstance`] / [`InstanceGuard`]: system-wide single-instance detection over a named,
//!   OS-managed shared memory segment. The OS releases the claim when the holder exits, even on crash.
//! - [`RecurringTask`]: a callback re-armed on an [`EventLoop`] after each run, for as long as the
//!   callback asks for it and a handle to the task is alive.
//!
//! Targets without named shared memory (Android, iOS) degrade to permissive claims.
//!

mod error;
pub mod event_loop;
mod instance;
pub mod recurring;
pub mod sys;
mod types;

// Re-export public types to keep the API flat
pub use error::{ForgeError, ForgeResult};
pub use event_loop::{EventLoop, Executor, Job, RunOutcome, StopHandle};
pub use instance::{InstanceGuard, SingleInstance};
pub use recurring::{RecurringTask, TaskBuilder, TaskState};
pub use types::{DEFAULT_NAMESPACE, SegmentKey, Token};
