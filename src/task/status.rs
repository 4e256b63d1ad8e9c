use crate::task::record::{Records, TaskStatusRecord};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use static_assertions::const_assert_eq;

const IS_CANCELLED: usize = 0b01;
const IS_LOCKED: usize = 0b10;
const RECORD_MASK: usize = !(IS_CANCELLED | IS_LOCKED);

/// Snapshot of a task's cancellation state and status-record list.
///
/// Three fields share one pointer-sized word: the cancelled bit, the lock
/// bit, and the pointer to the innermost [`TaskStatusRecord`]. Record
/// addresses are required to keep the two low bits clear, which is what makes
/// the packing lossless.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ActiveTaskStatus(usize);

impl ActiveTaskStatus {
    /// The status of a freshly created task: not cancelled, not locked, no
    /// records.
    pub const fn initial() -> ActiveTaskStatus {
        ActiveTaskStatus(0)
    }

    pub fn new(
        innermost_record: Option<NonNull<TaskStatusRecord>>,
        cancelled: bool,
        locked: bool,
    ) -> ActiveTaskStatus {
        let record = innermost_record.map_or(0, |r| r.as_ptr() as usize);
        debug_assert_eq!(
            record & !RECORD_MASK,
            0,
            "status record address must leave the two low bits clear"
        );
        ActiveTaskStatus(
            record
                | if cancelled { IS_CANCELLED } else { 0 }
                | if locked { IS_LOCKED } else { 0 },
        )
    }

    pub fn is_cancelled(self) -> bool {
        self.0 & IS_CANCELLED != 0
    }

    pub fn is_locked(self) -> bool {
        self.0 & IS_LOCKED != 0
    }

    /// The innermost status record. Code running asynchronously with the
    /// owning task must not follow this without holding the status lock.
    pub fn innermost_record(self) -> Option<NonNull<TaskStatusRecord>> {
        NonNull::new((self.0 & RECORD_MASK) as *mut TaskStatusRecord)
    }

    /// Walks the record list from the innermost record outward, following
    /// each record's parent link until null. The iterator is lazy and can be
    /// restarted from scratch by calling `records` again.
    ///
    /// # Safety
    ///
    /// Every record reachable from this snapshot must still be live and
    /// well-formed for the duration of the walk; normally that means the
    /// caller holds the status lock, or owns the task outright.
    pub unsafe fn records(self) -> Records {
        Records::starting_at(self.innermost_record())
    }

    fn with_cancelled(self) -> ActiveTaskStatus {
        ActiveTaskStatus(self.0 | IS_CANCELLED)
    }

    fn with_locked(self) -> ActiveTaskStatus {
        ActiveTaskStatus(self.0 | IS_LOCKED)
    }

    fn without_locked(self) -> ActiveTaskStatus {
        ActiveTaskStatus(self.0 & !IS_LOCKED)
    }

    fn with_record(self, record: Option<NonNull<TaskStatusRecord>>) -> ActiveTaskStatus {
        let record = record.map_or(0, |r| r.as_ptr() as usize);
        debug_assert_eq!(record & !RECORD_MASK, 0);
        ActiveTaskStatus((self.0 & !RECORD_MASK) | record)
    }
}

impl fmt::Debug for ActiveTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTaskStatus")
            .field("cancelled", &self.is_cancelled())
            .field("locked", &self.is_locked())
            .field("innermost_record", &self.innermost_record())
            .finish()
    }
}

// The whole point: one atomically swappable word.
const_assert_eq!(
    std::mem::size_of::<ActiveTaskStatus>(),
    std::mem::size_of::<*mut ()>()
);

/// The atomically shared status word of a task.
///
/// This is the only state in the core that multiple logical actors mutate
/// concurrently: the task itself, external cancellers, and scopes pushing or
/// popping status records. Every mutation is a single compare-and-swap of the
/// whole packed word; the only retries anywhere in the core are the CAS
/// loops below, and nothing ever blocks.
///
/// Protocol: writers that mutate or traverse the record list must hold the
/// lock bit first. Readers that only need the cancelled bit use a plain
/// relaxed load and accept the race window.
#[repr(transparent)]
pub struct AtomicActiveTaskStatus(AtomicUsize);

impl AtomicActiveTaskStatus {
    pub const fn new(status: ActiveTaskStatus) -> AtomicActiveTaskStatus {
        AtomicActiveTaskStatus(AtomicUsize::new(status.0))
    }

    pub const fn initial() -> AtomicActiveTaskStatus {
        AtomicActiveTaskStatus::new(ActiveTaskStatus::initial())
    }

    /// A racy snapshot. Sufficient for advisory cancellation checks; stale by
    /// the time the caller looks at it.
    pub fn load_relaxed(&self) -> ActiveTaskStatus {
        ActiveTaskStatus(self.0.load(Ordering::Relaxed))
    }

    /// Sets the cancelled bit, preserving the lock bit and record list.
    ///
    /// Never preempts running code; the bit only becomes visible at the next
    /// voluntary check. Returns the snapshot after the store, so callers can
    /// tell whether they raced with an earlier cancellation.
    pub fn cancel(&self) -> ActiveTaskStatus {
        let mut current = self.load_relaxed();
        loop {
            if current.is_cancelled() {
                return current;
            }
            let next = current.with_cancelled();
            match self
                .0
                .compare_exchange_weak(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    tracing::trace!(status = ?next, "task cancellation requested");
                    return next;
                }
                Err(observed) => current = ActiveTaskStatus(observed),
            }
        }
    }

    /// Tries to acquire the status lock. Returns `false` if another actor
    /// holds it. Does not spin.
    pub fn try_lock(&self) -> bool {
        let mut current = self.load_relaxed();
        loop {
            if current.is_locked() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current.0,
                current.with_locked().0,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = ActiveTaskStatus(observed),
            }
        }
    }

    /// Acquires the status lock, spinning on CAS retries until it succeeds.
    /// Critical sections under this lock are required to be short and
    /// non-blocking.
    pub fn lock(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    /// Releases the status lock.
    ///
    /// A cancellation raised while the lock was held must survive the
    /// release, so this is a CAS loop clearing only the lock bit rather than
    /// a store of the pre-lock snapshot.
    pub fn unlock(&self) {
        let mut current = self.load_relaxed();
        loop {
            debug_assert!(current.is_locked(), "unlock without holding the status lock");
            match self.0.compare_exchange_weak(
                current.0,
                current.without_locked().0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                // A concurrent canceller flipped its bit under us; retry with
                // the fresh word so the bit is kept.
                Err(observed) => current = ActiveTaskStatus(observed),
            }
        }
    }

    /// Replaces the innermost record pointer, preserving both flag bits.
    ///
    /// The caller must hold the status lock; pushing and popping records
    /// without it races with every other writer.
    pub fn set_innermost_record(&self, record: Option<NonNull<TaskStatusRecord>>) {
        let mut current = self.load_relaxed();
        loop {
            debug_assert!(
                current.is_locked(),
                "record list mutated without holding the status lock"
            );
            let next = current.with_record(record);
            match self
                .0
                .compare_exchange_weak(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = ActiveTaskStatus(observed),
            }
        }
    }
}

impl fmt::Debug for AtomicActiveTaskStatus {
    // Show the decoded word rather than a raw integer.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load_relaxed(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::record::RecordKind;
    use rstest::rstest;

    #[rstest]
    #[case::clear(false, false)]
    #[case::cancelled(true, false)]
    #[case::locked(false, true)]
    #[case::both(true, true)]
    fn test_pack_roundtrip_without_record(#[case] cancelled: bool, #[case] locked: bool) {
        let status = ActiveTaskStatus::new(None, cancelled, locked);

        assert_eq!(status.is_cancelled(), cancelled);
        assert_eq!(status.is_locked(), locked);
        assert_eq!(status.innermost_record(), None);
    }

    #[rstest]
    #[case::clear(false, false)]
    #[case::cancelled(true, false)]
    #[case::locked(false, true)]
    #[case::both(true, true)]
    fn test_pack_roundtrip_with_record(#[case] cancelled: bool, #[case] locked: bool) {
        let record = TaskStatusRecord::new(RecordKind::CancellationNotification, None);
        let ptr = NonNull::from(&record);

        let status = ActiveTaskStatus::new(Some(ptr), cancelled, locked);

        assert_eq!(status.is_cancelled(), cancelled);
        assert_eq!(status.is_locked(), locked);
        assert_eq!(status.innermost_record(), Some(ptr));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let status = AtomicActiveTaskStatus::initial();

        assert!(!status.load_relaxed().is_cancelled());
        assert!(status.cancel().is_cancelled());
        assert!(status.cancel().is_cancelled());
        assert!(status.load_relaxed().is_cancelled());
    }

    #[test]
    fn test_second_lock_attempt_fails_until_release() {
        let status = AtomicActiveTaskStatus::initial();

        assert!(status.try_lock());
        assert!(!status.try_lock());

        status.unlock();
        assert!(status.try_lock());
        status.unlock();
    }

    #[test]
    fn test_unlock_preserves_concurrent_cancellation() {
        let status = AtomicActiveTaskStatus::initial();
        assert!(status.try_lock());

        // Cancellation arrives from another thread while the lock is held.
        std::thread::scope(|s| {
            s.spawn(|| {
                status.cancel();
            });
        });

        status.unlock();

        let after = status.load_relaxed();
        assert!(after.is_cancelled(), "unlock lost a cancellation signal");
        assert!(!after.is_locked());
    }

    #[test]
    fn test_lock_is_mutually_exclusive_across_threads() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let status = AtomicActiveTaskStatus::initial();
        let in_critical = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1_000 {
                        status.lock();
                        assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(in_critical.fetch_sub(1, Ordering::SeqCst), 1);
                        status.unlock();
                    }
                });
            }
        });

        assert!(!status.load_relaxed().is_locked());
    }

    #[test]
    fn test_set_innermost_record_keeps_flags() {
        let record = TaskStatusRecord::new(RecordKind::CancellationNotification, None);
        let status = AtomicActiveTaskStatus::initial();

        status.cancel();
        status.lock();
        status.set_innermost_record(Some(NonNull::from(&record)));

        let snapshot = status.load_relaxed();
        assert!(snapshot.is_cancelled());
        assert!(snapshot.is_locked());
        assert_eq!(snapshot.innermost_record(), Some(NonNull::from(&record)));

        status.unlock();
        assert_eq!(
            status.load_relaxed().innermost_record(),
            Some(NonNull::from(&record))
        );
    }
}
