//! ABI-stable building blocks for a cooperative async-task scheduler.
//!
//! This crate pins down the binary contract between generated async-function
//! code and the scheduler that runs it:
//!
//! - [`Job`]: the minimal schedulable unit, four pointer widths, with a
//!   single tagged entry slot.
//! - [`task::AsyncTask`]: the persistent identity of an async computation,
//!   twelve pointer widths, embedding a `Job` at offset zero.
//! - [`task::AtomicActiveTaskStatus`]: the one piece of concurrently mutated
//!   state, a bit-packed word updated only by whole-word compare-and-swap.
//! - [`AsyncContext`] / [`YieldingAsyncContext`]: the chain of continuation
//!   frames that lets execution suspend at a call boundary and resume later,
//!   possibly on a different executor.
//!
//! Sizes and alignments here are load-bearing: producers bake them into
//! generated code, so they are enforced with compile-time assertions rather
//! than treated as incidental layout. Allocation, refcounting, and scheduling
//! policy are external collaborators and appear only as opaque tokens and
//! reserved scratch slots.

mod executor;
pub use executor::ExecutorRef;

mod job;
pub use job::{Job, JobFlags, JobInvokeFn, JobPriority, TaskResumeFn};

pub mod task;
pub use task::AsyncTask;

mod context;
pub use context::{
    AsyncContext, AsyncContextFlags, AsyncContextKind, AsyncFunctionPointer,
    YieldingAsyncContext, MAXIMUM_ALIGNMENT,
};
