#![allow(unsafe_op_in_unsafe_fn)]

use crate::executor::ExecutorRef;
use crate::job::TaskResumeFn;
use std::marker::PhantomPinned;
use std::ops::Deref;
use std::ptr::NonNull;
use static_assertions::const_assert_eq;

/// Alignment required of every continuation frame: the platform's maximum
/// fundamental alignment. Generated code allocates frames at this boundary so
/// the function owning a frame can freely use any padding after the flags.
pub const MAXIMUM_ALIGNMENT: usize = 16;

/// Discriminates the shape of an [`AsyncContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AsyncContextKind {
    Ordinary = 0,
    Yielding = 1,
}

/// Flag word of a continuation frame. The kind lives in the low byte; the
/// remaining bits are reserved for the function that owns the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AsyncContextFlags(u32);

impl AsyncContextFlags {
    const KIND_MASK: u32 = 0xFF;

    pub fn new(kind: AsyncContextKind) -> AsyncContextFlags {
        AsyncContextFlags(kind as u32)
    }

    /// # Panics
    ///
    /// Panics if the kind byte holds a value this crate does not know; a
    /// frame with a corrupt kind byte must not be interpreted at all.
    pub fn kind(self) -> AsyncContextKind {
        match self.0 & Self::KIND_MASK {
            0 => AsyncContextKind::Ordinary,
            1 => AsyncContextKind::Yielding,
            other => panic!("invalid async context kind: {other}"),
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> AsyncContextFlags {
        AsyncContextFlags(bits)
    }
}

/// One frame in the chain of suspended continuations.
///
/// Each frame names its parent frame, the function that resumes the parent,
/// and the executor the parent wants to be resumed on. The parent pointer is
/// a non-owning back-reference; the chain is finite and terminates at the
/// original non-async caller.
///
/// A frame's identity is its address for the whole suspension: frames are
/// neither cloneable nor `Unpin`, and the resume function stored in a frame
/// receives that same frame when the scheduler finally calls it.
#[repr(C, align(16))]
pub struct AsyncContext {
    parent: Option<NonNull<AsyncContext>>,
    resume_parent: TaskResumeFn,
    resume_parent_executor: ExecutorRef,
    flags: AsyncContextFlags,
    _pinned: PhantomPinned,
}

impl AsyncContext {
    pub fn new(
        flags: AsyncContextFlags,
        resume_parent: TaskResumeFn,
        resume_parent_executor: ExecutorRef,
        parent: Option<NonNull<AsyncContext>>,
    ) -> AsyncContext {
        AsyncContext {
            parent,
            resume_parent,
            resume_parent_executor,
            flags,
            _pinned: PhantomPinned,
        }
    }

    pub fn parent(&self) -> Option<NonNull<AsyncContext>> {
        self.parent
    }

    pub fn flags(&self) -> AsyncContextFlags {
        self.flags
    }

    pub fn kind(&self) -> AsyncContextKind {
        self.flags.kind()
    }

    pub fn is_yielding(&self) -> bool {
        self.kind() == AsyncContextKind::Yielding
    }

    /// The function to call once this frame's work is fully done. Semantic
    /// return into the parent frame.
    ///
    /// All continuation functions are reached through accessors like this
    /// one; on targets with pointer integrity hardware the check would go
    /// here without touching call sites.
    pub fn resume_parent(&self) -> TaskResumeFn {
        self.resume_parent
    }

    /// Where the parent needs to be resumed. If this names a different
    /// executor than the current one, the scheduler re-enqueues instead of
    /// calling in place.
    pub fn resume_parent_executor(&self) -> ExecutorRef {
        self.resume_parent_executor
    }

    /// Checked downcast to the yielding variant.
    ///
    /// # Panics
    ///
    /// Panics if the frame's kind is not [`AsyncContextKind::Yielding`].
    ///
    /// # Safety
    ///
    /// `this` must point at the embedded base of a live
    /// [`YieldingAsyncContext`] whenever the kind flag says yielding.
    pub unsafe fn as_yielding(this: NonNull<AsyncContext>) -> NonNull<YieldingAsyncContext> {
        assert!(
            this.as_ref().is_yielding(),
            "context is not a yielding context"
        );
        this.cast()
    }
}

const_assert_eq!(std::mem::align_of::<AsyncContext>(), MAXIMUM_ALIGNMENT);

/// A continuation frame that also supports a temporary return to the parent.
///
/// `yield_to_parent` differs from the resume function in that the parent
/// expects control to come back into this same frame later; the frame stays
/// live across the yield.
#[repr(C)]
pub struct YieldingAsyncContext {
    base: AsyncContext,
    yield_to_parent: TaskResumeFn,
    yield_to_parent_executor: ExecutorRef,
}

impl YieldingAsyncContext {
    /// # Panics
    ///
    /// Panics if `flags` does not carry the yielding kind; a yielding frame
    /// with ordinary flags would make the downcast in
    /// [`AsyncContext::as_yielding`] unsound.
    pub fn new(
        flags: AsyncContextFlags,
        resume_parent: TaskResumeFn,
        resume_parent_executor: ExecutorRef,
        yield_to_parent: TaskResumeFn,
        yield_to_parent_executor: ExecutorRef,
        parent: Option<NonNull<AsyncContext>>,
    ) -> YieldingAsyncContext {
        assert_eq!(
            flags.kind(),
            AsyncContextKind::Yielding,
            "yielding context requires the yielding kind"
        );
        YieldingAsyncContext {
            base: AsyncContext::new(flags, resume_parent, resume_parent_executor, parent),
            yield_to_parent,
            yield_to_parent_executor,
        }
    }

    pub fn yield_to_parent(&self) -> TaskResumeFn {
        self.yield_to_parent
    }

    pub fn yield_to_parent_executor(&self) -> ExecutorRef {
        self.yield_to_parent_executor
    }
}

impl Deref for YieldingAsyncContext {
    type Target = AsyncContext;

    fn deref(&self) -> &AsyncContext {
        &self.base
    }
}

/// Descriptor for an async function: where execution enters and how large an
/// initial frame the function expects its caller to allocate.
#[repr(C)]
pub struct AsyncFunctionPointer {
    function: TaskResumeFn,
    expected_context_size: u32,
}

impl AsyncFunctionPointer {
    pub fn new(function: TaskResumeFn, expected_context_size: u32) -> AsyncFunctionPointer {
        AsyncFunctionPointer {
            function,
            expected_context_size,
        }
    }

    pub fn function(&self) -> TaskResumeFn {
        self.function
    }

    pub fn expected_context_size(&self) -> u32 {
        self.expected_context_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRef;
    use crate::task::AsyncTask;

    unsafe fn noop_resume(
        _task: NonNull<AsyncTask>,
        _executor: ExecutorRef,
        _frame: NonNull<AsyncContext>,
    ) {
    }

    #[test]
    fn test_kind_tag_roundtrip() {
        let ordinary = AsyncContextFlags::new(AsyncContextKind::Ordinary);
        let yielding = AsyncContextFlags::new(AsyncContextKind::Yielding);

        assert_eq!(ordinary.kind(), AsyncContextKind::Ordinary);
        assert_eq!(yielding.kind(), AsyncContextKind::Yielding);

        // Reserved bits above the kind byte ride along untouched.
        let with_reserved = AsyncContextFlags::from_bits(yielding.bits() | 0xABCD_0000);
        assert_eq!(with_reserved.kind(), AsyncContextKind::Yielding);
    }

    #[test]
    fn test_downcast_yielding_context() {
        let ctx = YieldingAsyncContext::new(
            AsyncContextFlags::new(AsyncContextKind::Yielding),
            noop_resume,
            ExecutorRef::no_preference(),
            noop_resume,
            ExecutorRef::no_preference(),
            None,
        );

        assert!(ctx.is_yielding());
        assert!(ctx.parent().is_none());

        let base = NonNull::from(&*ctx);
        let down = unsafe { AsyncContext::as_yielding(base) };
        assert_eq!(down.as_ptr() as usize, &ctx as *const _ as usize);
    }

    #[test]
    #[should_panic(expected = "context is not a yielding context")]
    fn test_downcast_ordinary_context_panics() {
        let ctx = AsyncContext::new(
            AsyncContextFlags::new(AsyncContextKind::Ordinary),
            noop_resume,
            ExecutorRef::no_preference(),
            None,
        );

        let _ = unsafe { AsyncContext::as_yielding(NonNull::from(&ctx)) };
    }

    #[test]
    #[should_panic(expected = "yielding context requires the yielding kind")]
    fn test_yielding_constructor_rejects_ordinary_kind() {
        let _ = YieldingAsyncContext::new(
            AsyncContextFlags::new(AsyncContextKind::Ordinary),
            noop_resume,
            ExecutorRef::no_preference(),
            noop_resume,
            ExecutorRef::no_preference(),
            None,
        );
    }
}
