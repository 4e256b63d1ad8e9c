#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::AsyncTask;
use std::ptr::NonNull;

/// Discriminates the concrete shape of a [`TaskStatusRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RecordKind {
    /// Anchors the head of a singly linked child-task list; the full shape is
    /// [`ChildTaskStatusRecord`].
    ChildTask = 0,

    /// A cancellation handler registered by some scope. The handler itself is
    /// owned by the scope that pushed the record, not by this crate.
    CancellationNotification = 1,
}

/// Node in the intrusive, singly linked list of a task's active status
/// entries.
///
/// The list hangs off the task's status word, innermost record first. Each
/// record is owned by whichever logical scope pushed it and must be popped
/// before that scope exits; this crate only traverses the list.
///
/// Records must keep the two low bits of their address clear so the status
/// word can fold its flag bits into the pointer; the explicit alignment
/// guarantees that on every target.
#[repr(C, align(4))]
pub struct TaskStatusRecord {
    kind: RecordKind,
    parent: Option<NonNull<TaskStatusRecord>>,
}

impl TaskStatusRecord {
    pub fn new(kind: RecordKind, parent: Option<NonNull<TaskStatusRecord>>) -> TaskStatusRecord {
        TaskStatusRecord { kind, parent }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn parent(&self) -> Option<NonNull<TaskStatusRecord>> {
        self.parent
    }

    /// Relinks the record one level outward. Used by the scope pushing this
    /// record on top of the previous innermost record, under the status lock.
    pub fn set_parent(&mut self, parent: Option<NonNull<TaskStatusRecord>>) {
        self.parent = parent;
    }
}

/// Returns the record one level outward from `record`.
///
/// Traversal goes through this free function rather than a trait object so
/// the walk stays a plain load; any record-shaped node that embeds
/// [`TaskStatusRecord`] as its first field traverses identically.
///
/// # Safety
///
/// `record` must point to a live status record.
pub unsafe fn record_parent(record: NonNull<TaskStatusRecord>) -> Option<NonNull<TaskStatusRecord>> {
    record.as_ref().parent()
}

/// Lazy walk over a status-record list, innermost first. Created by
/// [`ActiveTaskStatus::records`](crate::task::ActiveTaskStatus::records).
pub struct Records {
    next: Option<NonNull<TaskStatusRecord>>,
}

impl Records {
    pub(crate) fn starting_at(innermost: Option<NonNull<TaskStatusRecord>>) -> Records {
        Records { next: innermost }
    }
}

impl Iterator for Records {
    type Item = NonNull<TaskStatusRecord>;

    fn next(&mut self) -> Option<NonNull<TaskStatusRecord>> {
        let record = self.next?;
        // Safety: the caller of `records` vouched for the list staying live.
        self.next = unsafe { record_parent(record) };
        Some(record)
    }
}

/// Status record anchoring a parent's child-task list.
///
/// The record stores only the head; the children themselves chain through
/// their [`ChildFragment`](crate::task::ChildFragment) sibling links. A
/// parent may carry several of these records at once (one per spawning
/// scope).
#[repr(C)]
pub struct ChildTaskStatusRecord {
    record: TaskStatusRecord,
    first_child: Option<NonNull<AsyncTask>>,
}

impl ChildTaskStatusRecord {
    pub fn new(
        first_child: Option<NonNull<AsyncTask>>,
        parent: Option<NonNull<TaskStatusRecord>>,
    ) -> ChildTaskStatusRecord {
        ChildTaskStatusRecord {
            record: TaskStatusRecord::new(RecordKind::ChildTask, parent),
            first_child,
        }
    }

    pub fn record(&self) -> &TaskStatusRecord {
        &self.record
    }

    /// The base record pointer, suitable for installing as a task's innermost
    /// record.
    pub fn as_record(&self) -> NonNull<TaskStatusRecord> {
        NonNull::from(&self.record)
    }

    pub fn first_child(&self) -> Option<NonNull<AsyncTask>> {
        self.first_child
    }

    /// Downcast from a base record pointer.
    ///
    /// # Panics
    ///
    /// Panics if the record's kind is not [`RecordKind::ChildTask`].
    ///
    /// # Safety
    ///
    /// `record` must point at the embedded header of a live
    /// `ChildTaskStatusRecord`.
    pub unsafe fn from_record(record: NonNull<TaskStatusRecord>) -> NonNull<ChildTaskStatusRecord> {
        assert_eq!(
            record.as_ref().kind(),
            RecordKind::ChildTask,
            "record does not anchor a child-task list"
        );
        record.cast()
    }

    /// Iterates the child tasks anchored here, following each child's
    /// sibling link.
    ///
    /// # Safety
    ///
    /// Every task on the list must be live, be flagged as a child task, and
    /// stay unmodified for the duration of the walk; normally the caller
    /// holds the parent's status lock.
    pub unsafe fn children(&self) -> Children {
        Children {
            next: self.first_child,
        }
    }
}

/// Iterator over the singly linked child-task list of one
/// [`ChildTaskStatusRecord`].
pub struct Children {
    next: Option<NonNull<AsyncTask>>,
}

impl Iterator for Children {
    type Item = NonNull<AsyncTask>;

    fn next(&mut self) -> Option<NonNull<AsyncTask>> {
        let child = self.next?;
        // Safety: `children` put the well-formedness of the list on its
        // caller; every node on it is a child task with a trailing fragment.
        self.next = unsafe { child.as_ref().child_fragment().as_ref().next_child() };
        Some(child)
    }
}
