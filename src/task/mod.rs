#![allow(unsafe_op_in_unsafe_fn)]

//! Persistent task identity: the [`AsyncTask`] layout, its atomically shared
//! status word, the status-record list, and the child-task fragment.

mod fragment;
pub use self::fragment::ChildFragment;

mod record;
pub use self::record::{
    record_parent, Children, ChildTaskStatusRecord, RecordKind, Records, TaskStatusRecord,
};

mod status;
pub use self::status::{ActiveTaskStatus, AtomicActiveTaskStatus};


use crate::context::AsyncContext;
use crate::executor::ExecutorRef;
use crate::job::{Job, JobFlags, TaskResumeFn};
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use static_assertions::const_assert_eq;

/// Opaque header of a reference-counted heap object.
///
/// Allocation and refcounting of task objects live outside this crate; the
/// core records the metadata pointer at construction and never interprets
/// it, and the count word belongs to the external refcounting runtime.
#[repr(C)]
pub struct HeapHeader {
    metadata: *const (),
    ref_counts: AtomicUsize,
}

impl HeapHeader {
    pub fn new(metadata: *const ()) -> HeapHeader {
        HeapHeader {
            metadata,
            ref_counts: AtomicUsize::new(1),
        }
    }

    pub fn metadata(&self) -> *const () {
        self.metadata
    }
}

/// Persistent identity of an async computation.
///
/// Tasks are the analogue of threads for async functions. An `AsyncTask`
/// *is* a [`Job`]: the job header sits at offset zero, so a task pointer and
/// a job pointer to the same object are interchangeable once the
/// `IS_ASYNC_TASK` flag has been checked ([`AsyncTask::from_job`]).
///
/// The layout is ABI-frozen at exactly twelve pointer widths, aligned to two
/// pointer widths. Tasks with the child flag carry a [`ChildFragment`]
/// directly after this fixed region.
#[repr(C)]
pub struct AsyncTask {
    /// Must stay the first field; the checked downcast relies on offset 0.
    job: Job,

    heap: HeapHeader,

    /// The frame the next resume runs with. When the task suspends, the next
    /// continuation is installed in the job header and this frame becomes
    /// its context.
    resume_context: NonNull<AsyncContext>,

    /// The currently-active cancellation and bookkeeping word.
    status: AtomicActiveTaskStatus,

    /// Scratch space reserved for the task-local stack allocator.
    allocator_private: [MaybeUninit<*mut ()>; 4],
}

// Same contract as `Job`: the scheduler moves tasks between worker threads
// and guarantees exclusive use during `run`.
unsafe impl Send for AsyncTask {}
unsafe impl Sync for AsyncTask {}

impl AsyncTask {
    /// Creates a task resuming at `resume` with `initial_context`.
    ///
    /// `metadata` is the opaque type descriptor handed to the heap-object
    /// header; its meaning is the allocator's concern.
    ///
    /// # Panics
    ///
    /// Panics unless `flags` sets `IS_ASYNC_TASK`.
    pub fn new(
        metadata: *const (),
        flags: JobFlags,
        resume: TaskResumeFn,
        initial_context: NonNull<AsyncContext>,
    ) -> AsyncTask {
        AsyncTask {
            job: Job::new_task_entry(flags, resume),
            heap: HeapHeader::new(metadata),
            resume_context: initial_context,
            status: AtomicActiveTaskStatus::initial(),
            allocator_private: [MaybeUninit::uninit(); 4],
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn flags(&self) -> JobFlags {
        self.job.flags()
    }

    pub fn heap(&self) -> &HeapHeader {
        &self.heap
    }

    /// Upcast to the embedded job header.
    pub fn as_job(this: NonNull<AsyncTask>) -> NonNull<Job> {
        this.cast()
    }

    /// Checked downcast from a job header.
    ///
    /// # Panics
    ///
    /// Panics if the job's `IS_ASYNC_TASK` flag is clear.
    ///
    /// # Safety
    ///
    /// `job` must point to a live job; when the flag is set, the producer
    /// contract guarantees it is the first field of an `AsyncTask`.
    pub unsafe fn from_job(job: NonNull<Job>) -> NonNull<AsyncTask> {
        assert!(job.as_ref().is_async_task(), "job is not an async task");
        job.cast()
    }

    pub fn status(&self) -> &AtomicActiveTaskStatus {
        &self.status
    }

    /// Whether this task has been cancelled.
    ///
    /// Inherently race-prone on its own: the relaxed load may return stale
    /// information, and that is the documented behavior. Cancellation is
    /// advisory; callers re-check at their next safe point instead of
    /// treating one read as authoritative.
    pub fn is_cancelled(&self) -> bool {
        self.status.load_relaxed().is_cancelled()
    }

    pub fn resume_context(&self) -> NonNull<AsyncContext> {
        self.resume_context
    }

    /// Installs the continuation frame the next resume will run with. Only
    /// the task's own (strictly sequential) execution does this.
    pub fn set_resume_context(&mut self, context: NonNull<AsyncContext>) {
        self.resume_context = context;
    }

    /// Runs the task by resuming its stored continuation with
    /// `(task, current_executor, resume_context)`. No tag dispatch: a task
    /// is always a task.
    ///
    /// # Safety
    ///
    /// Same contract as [`Job::run`]: `this` is live, dequeued, and not run
    /// concurrently.
    pub unsafe fn run(this: NonNull<AsyncTask>, current_executor: ExecutorRef) {
        let resume = this.as_ref().job.entry().as_resume();
        let frame = this.as_ref().resume_context;
        resume(this, current_executor, frame);
    }

    /// Whether the task carries a future fragment. The fragment itself is an
    /// extension point this crate does not define.
    pub fn is_future(&self) -> bool {
        self.flags().task_is_future()
    }

    pub fn has_child_fragment(&self) -> bool {
        self.flags().task_is_child()
    }

    /// Pointer to the trailing [`ChildFragment`].
    ///
    /// The producer of a child task allocates the fragment directly after
    /// the task's fixed region, so the fragment's address is
    /// `task address + size_of::<AsyncTask>()`.
    ///
    /// # Panics
    ///
    /// Panics if the task has no child fragment.
    pub fn child_fragment(&self) -> NonNull<ChildFragment> {
        assert!(self.has_child_fragment(), "task has no child fragment");
        let end = NonNull::from(self).as_ptr().wrapping_add(1);
        // Safety: derived from a non-null reference.
        unsafe { NonNull::new_unchecked(end.cast::<ChildFragment>()) }
    }
}

// ABI contract shared with generated code and the scheduler.
const_assert_eq!(
    std::mem::size_of::<AsyncTask>(),
    12 * std::mem::size_of::<*mut ()>()
);
const_assert_eq!(
    std::mem::align_of::<AsyncTask>(),
    2 * std::mem::align_of::<*mut ()>()
);
