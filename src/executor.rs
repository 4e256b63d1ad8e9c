use std::fmt;
use std::ptr::NonNull;

/// Names the executor a job or continuation should run on.
///
/// An `ExecutorRef` is a pure value: a pointer-sized token whose meaning is
/// owned entirely by the scheduler. The core never dereferences it; it only
/// stores it and hands it back. Equality is identity equality.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ExecutorRef {
    ptr: *mut (),
}

impl ExecutorRef {
    /// An executor ref expressing no preference about where execution
    /// resumes. Only meaningful in continuations and return contexts; it is
    /// not generally passed to executing functions.
    pub const fn no_preference() -> ExecutorRef {
        ExecutorRef {
            ptr: std::ptr::null_mut(),
        }
    }

    /// Wraps a scheduler-owned executor identity.
    pub fn from_raw(ptr: NonNull<()>) -> ExecutorRef {
        ExecutorRef { ptr: ptr.as_ptr() }
    }

    /// The raw identity, or `None` for [`ExecutorRef::no_preference`].
    pub fn as_raw(self) -> Option<NonNull<()>> {
        NonNull::new(self.ptr)
    }

    pub fn is_no_preference(self) -> bool {
        self.ptr.is_null()
    }
}

// The token is an identity, not a reference the core follows; handing it
// across threads is the scheduler's business.
unsafe impl Send for ExecutorRef {}
unsafe impl Sync for ExecutorRef {}

impl fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_preference() {
            f.write_str("ExecutorRef(no preference)")
        } else {
            write!(f, "ExecutorRef({:p})", self.ptr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_preference_is_identity() {
        assert!(ExecutorRef::no_preference().is_no_preference());
        assert_eq!(ExecutorRef::no_preference(), ExecutorRef::no_preference());
    }

    #[test]
    fn test_equality_is_identity_equality() {
        let a = 1u32;
        let b = 1u32;
        let ra = ExecutorRef::from_raw(NonNull::from(&a).cast());
        let rb = ExecutorRef::from_raw(NonNull::from(&b).cast());

        assert_eq!(ra, ra);
        assert_ne!(ra, rb);
        assert_ne!(ra, ExecutorRef::no_preference());
        assert_eq!(ra.as_raw(), Some(NonNull::from(&a).cast()));
    }
}
