#![allow(unsafe_op_in_unsafe_fn)]

use crate::context::AsyncContext;
use crate::executor::ExecutorRef;
use crate::task::AsyncTask;
use bitflags::bitflags;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use static_assertions::const_assert_eq;

/// Entry point of a job that is not an async task.
pub type JobInvokeFn = unsafe fn(NonNull<Job>, ExecutorRef);

/// Entry point resuming an async task at one of its continuations.
pub type TaskResumeFn = unsafe fn(NonNull<AsyncTask>, ExecutorRef, NonNull<AsyncContext>);

bitflags! {
    /// Flag word stored in every [`Job`].
    ///
    /// `IS_ASYNC_TASK` is the dispatch tag: it alone decides how the job's
    /// entry slot is interpreted. The `TASK_*` bits are only meaningful when
    /// it is set. Bits 8..16 hold the scheduling priority; see
    /// [`JobFlags::priority`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct JobFlags: u32 {
        /// The job is the embedded header of an [`AsyncTask`].
        const IS_ASYNC_TASK = 1;

        /// Mask of the priority byte.
        const PRIORITY = 0xFF00;

        /// The task has a trailing [`ChildFragment`](crate::task::ChildFragment).
        const TASK_IS_CHILD = 1 << 24;

        /// The task carries a future fragment. The fragment layout is not
        /// part of this crate; only the bit is reserved.
        const TASK_IS_FUTURE = 1 << 25;
    }
}

impl JobFlags {
    const PRIORITY_SHIFT: u32 = 8;

    pub fn is_async_task(self) -> bool {
        self.contains(JobFlags::IS_ASYNC_TASK)
    }

    pub fn task_is_child(self) -> bool {
        self.contains(JobFlags::TASK_IS_CHILD)
    }

    pub fn task_is_future(self) -> bool {
        self.contains(JobFlags::TASK_IS_FUTURE)
    }

    pub fn priority(self) -> JobPriority {
        JobPriority::from_bits(((self.bits() & JobFlags::PRIORITY.bits()) >> Self::PRIORITY_SHIFT) as u8)
    }

    #[must_use]
    pub fn with_priority(self, priority: JobPriority) -> JobFlags {
        let bits = (self.bits() & !JobFlags::PRIORITY.bits())
            | ((priority as u32) << Self::PRIORITY_SHIFT);
        JobFlags::from_bits_retain(bits)
    }
}

/// Scheduling priority of a job, stored in the priority byte of [`JobFlags`].
///
/// The numeric values are part of the producer/consumer ABI and sort in
/// execution-preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum JobPriority {
    Unspecified = 0x00,
    Background = 0x09,
    Utility = 0x11,
    Default = 0x15,
    UserInitiated = 0x19,
    UserInteractive = 0x21,
}

impl JobPriority {
    fn from_bits(bits: u8) -> JobPriority {
        match bits {
            0x09 => JobPriority::Background,
            0x11 => JobPriority::Utility,
            0x15 => JobPriority::Default,
            0x19 => JobPriority::UserInitiated,
            0x21 => JobPriority::UserInteractive,
            _ => JobPriority::Unspecified,
        }
    }
}

/// Type-erased job entry function.
///
/// The slot holds either a [`JobInvokeFn`] or a [`TaskResumeFn`]; which one
/// is decided solely by [`JobFlags::IS_ASYNC_TASK`] on the owning job, and
/// the accessors must only be called once that tag has been checked. On
/// targets with hardware pointer integrity, signing and authentication would
/// live inside this type without touching any call site.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct RawEntryFn(*const ());

impl RawEntryFn {
    pub(crate) fn from_invoke(f: JobInvokeFn) -> RawEntryFn {
        RawEntryFn(f as *const ())
    }

    pub(crate) fn from_resume(f: TaskResumeFn) -> RawEntryFn {
        RawEntryFn(f as *const ())
    }

    /// # Safety
    ///
    /// The slot must have been initialized with [`RawEntryFn::from_invoke`],
    /// i.e. the owning job's `IS_ASYNC_TASK` flag is clear.
    pub(crate) unsafe fn as_invoke(self) -> JobInvokeFn {
        std::mem::transmute::<*const (), JobInvokeFn>(self.0)
    }

    /// # Safety
    ///
    /// The slot must have been initialized with [`RawEntryFn::from_resume`],
    /// i.e. the owning job's `IS_ASYNC_TASK` flag is set.
    pub(crate) unsafe fn as_resume(self) -> TaskResumeFn {
        std::mem::transmute::<*const (), TaskResumeFn>(self.0)
    }
}

/// A schedulable unit of work.
///
/// The layout is an ABI contract shared with generated code: exactly four
/// pointer widths, aligned to two pointer widths. The first two slots belong
/// to whichever scheduler currently has the job queued; this crate never
/// reads or writes them.
///
/// A job is owned by its producer, lent to the scheduler while queued, and
/// handed back when [`Job::run`] returns.
#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
pub struct Job {
    /// Scratch space reserved for the scheduler.
    scheduler_private: [MaybeUninit<*mut ()>; 2],

    flags: JobFlags,

    /// Plain invoke function or task resume function, discriminated by
    /// `IS_ASYNC_TASK`.
    entry: RawEntryFn,
}

// Jobs migrate between scheduler worker threads; exclusive use during `run`
// is the scheduler's contract.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    /// Creates a job driven by a plain invoke function.
    ///
    /// # Panics
    ///
    /// Panics if `flags` marks the job as an async task; the entry slot of a
    /// task holds a [`TaskResumeFn`] and must go through
    /// [`AsyncTask::new`](crate::task::AsyncTask::new).
    pub fn new_plain(flags: JobFlags, invoke: JobInvokeFn) -> Job {
        assert!(!flags.is_async_task(), "wrong constructor for a task");
        Job {
            scheduler_private: [MaybeUninit::uninit(); 2],
            flags,
            entry: RawEntryFn::from_invoke(invoke),
        }
    }

    /// Creates the job header of an async task.
    pub(crate) fn new_task_entry(flags: JobFlags, resume: TaskResumeFn) -> Job {
        assert!(flags.is_async_task(), "wrong constructor for a non-task job");
        Job {
            scheduler_private: [MaybeUninit::uninit(); 2],
            flags,
            entry: RawEntryFn::from_resume(resume),
        }
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    pub fn is_async_task(&self) -> bool {
        self.flags.is_async_task()
    }

    pub(crate) fn entry(&self) -> RawEntryFn {
        self.entry
    }

    /// The scheduler-private slots. Only the scheduler that currently owns
    /// the queued job may interpret these.
    pub fn scheduler_private(&mut self) -> &mut [MaybeUninit<*mut ()>; 2] {
        &mut self.scheduler_private
    }

    /// Runs this job on behalf of `current_executor`.
    ///
    /// If the job is the header of an [`AsyncTask`], dispatch goes through
    /// the task's stored continuation; otherwise the plain invoke function is
    /// called with `(job, current_executor)`. This is the only entry point
    /// the scheduler calls.
    ///
    /// # Safety
    ///
    /// `this` must point to a live job that was just dequeued, with no other
    /// thread running it concurrently. If the task flag is set, `this` must
    /// be the embedded job header of an [`AsyncTask`].
    pub unsafe fn run(this: NonNull<Job>, current_executor: ExecutorRef) {
        if this.as_ref().is_async_task() {
            AsyncTask::run(AsyncTask::from_job(this), current_executor);
        } else {
            let invoke = this.as_ref().entry.as_invoke();
            invoke(this, current_executor);
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("flags", &self.flags).finish()
    }
}

// Producers bake these numbers into generated code; they are contracts, not
// incidental layout.
const_assert_eq!(std::mem::size_of::<Job>(), 4 * std::mem::size_of::<*mut ()>());
const_assert_eq!(std::mem::align_of::<Job>(), 2 * std::mem::align_of::<*mut ()>());

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PLAIN_RUNS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn plain_invoke(_job: NonNull<Job>, _executor: ExecutorRef) {
        PLAIN_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_plain_job_runs_invoke_path() {
        let before = PLAIN_RUNS.load(Ordering::SeqCst);
        let mut job = Job::new_plain(JobFlags::empty(), plain_invoke);

        unsafe { Job::run(NonNull::from(&mut job), ExecutorRef::no_preference()) };

        assert_eq!(PLAIN_RUNS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    #[should_panic(expected = "wrong constructor for a task")]
    fn test_plain_constructor_rejects_task_flag() {
        let _ = Job::new_plain(JobFlags::IS_ASYNC_TASK, plain_invoke);
    }

    #[rstest]
    #[case::unspecified(JobPriority::Unspecified)]
    #[case::background(JobPriority::Background)]
    #[case::utility(JobPriority::Utility)]
    #[case::default_prio(JobPriority::Default)]
    #[case::user_initiated(JobPriority::UserInitiated)]
    #[case::user_interactive(JobPriority::UserInteractive)]
    fn test_priority_byte_roundtrip(#[case] priority: JobPriority) {
        let flags = (JobFlags::IS_ASYNC_TASK | JobFlags::TASK_IS_CHILD).with_priority(priority);

        assert_eq!(flags.priority(), priority);
        // The priority byte never leaks into the single-bit flags.
        assert!(flags.is_async_task());
        assert!(flags.task_is_child());
        assert!(!flags.task_is_future());
    }

    #[test]
    fn test_with_priority_overwrites_previous() {
        let flags = JobFlags::empty()
            .with_priority(JobPriority::Background)
            .with_priority(JobPriority::UserInteractive);

        assert_eq!(flags.priority(), JobPriority::UserInteractive);
        assert_eq!(
            flags.bits() & JobFlags::PRIORITY.bits(),
            (JobPriority::UserInteractive as u32) << 8
        );
    }
}
