use crate::task::AsyncTask;
use std::ptr::NonNull;

/// Trailing data on a task that has a parent.
///
/// The fragment lives immediately after the task's fixed twelve-pointer
/// region (see [`AsyncTask::child_fragment`]) and exists exactly when the
/// task's flags mark it a child task. Both stored references are non-owning
/// back-references: the sibling list is anchored in a
/// [`ChildTaskStatusRecord`](crate::task::ChildTaskStatusRecord) owned by the
/// parent, and linking a child into that record is the job of the
/// collaborator that created the child. The fragment itself never mutates
/// the parent's record list.
#[repr(C)]
pub struct ChildFragment {
    parent: NonNull<AsyncTask>,
    next_child: Option<NonNull<AsyncTask>>,
}

impl ChildFragment {
    pub fn new(parent: NonNull<AsyncTask>) -> ChildFragment {
        ChildFragment {
            parent,
            next_child: None,
        }
    }

    pub fn parent(&self) -> NonNull<AsyncTask> {
        self.parent
    }

    pub fn next_child(&self) -> Option<NonNull<AsyncTask>> {
        self.next_child
    }

    /// Links the next sibling. Called under the parent's status lock by the
    /// collaborator maintaining the child list.
    pub fn set_next_child(&mut self, next: Option<NonNull<AsyncTask>>) {
        self.next_child = next;
    }
}
