use crate::error::Error;
use crate::task::core::TaskCore;
use crate::task::state::Flags;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::mem;
use std::sync::Arc;
use tracing::{trace, warn};

// Most coroutines spawn a handful of children at most.
const INLINE_CHILDREN: usize = 4;

pub(crate) type Children = SmallVec<[Arc<TaskCore>; INLINE_CHILDREN]>;

/// The children owned by a task, in spawn order.
///
/// Spawning happens on the parent's worker thread and can race with the tree
/// walk of the driver, hence the lock. Keeping spawn order makes the order in
/// which siblings are stepped repeatable.
#[derive(Debug)]
pub(crate) struct ChildSet {
    inner: RwLock<Children>,
}

impl ChildSet {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(SmallVec::new()),
        }
    }

    /// Adds `child` unless it is already a member.
    pub(crate) fn add(&self, child: Arc<TaskCore>) {
        let mut inner = self.inner.write();
        if !inner.iter().any(|c| Arc::ptr_eq(c, &child)) {
            inner.push(child);
        }
    }

    pub(crate) fn remove(&self, child: &Arc<TaskCore>) -> bool {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|c| !Arc::ptr_eq(c, child));
        inner.len() != before
    }

    pub(crate) fn snapshot(&self) -> Children {
        self.inner.read().clone()
    }

    pub(crate) fn take_all(&self) -> Children {
        mem::take(&mut *self.inner.write())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// Supervision: stepping children top-down, and tearing the whole subtree down
// before a task is allowed to report Done.
impl TaskCore {
    /// Steps every child once, in spawn order, releasing those that are done.
    /// Children spawned by a child during this walk are stepped by that child.
    pub(crate) fn update_children(&self) {
        if self.children.is_empty() {
            return;
        }

        // A task that is not running owns no live children. Anything left
        // here is a straggler to be cancelled right away.
        let stray = !self.state.is_running();

        for child in self.children.snapshot() {
            if stray {
                child.state.request_cancel();
            }

            if let Err(err) = child.update() {
                self.child_failed(&child, err);
            }

            if child.is_done() && self.children.remove(&child) {
                self.release_child(&child);
            }
        }
    }

    // Failures of child bodies settle their join handles, what lands here is
    // a worker that went away.
    fn child_failed(&self, child: &TaskCore, err: Error) {
        if matches!(err, Error::Closed) {
            child.state.unset(Flags::RUNNING);
        }
        warn!(task = %self.id(), child = %child.id(), error = %err, "child coroutine failed");
    }

    /// Cancels every child and keeps stepping them until all are done, then
    /// releases them. Runs on the worker right after the body returned, so no
    /// descendant executes anything after this task becomes Done.
    pub(crate) fn terminate_children(&self) {
        loop {
            let children = self.children.take_all();
            if children.is_empty() {
                return;
            }

            trace!(task = %self.id(), count = children.len(), "terminating children");

            for child in &children {
                child.state.request_cancel();
            }

            loop {
                let mut pending = false;

                for child in children.iter().filter(|c| !c.is_done()) {
                    if let Err(err) = child.update() {
                        self.child_failed(child, err);
                    }
                    pending |= !child.is_done();
                }

                if !pending {
                    break;
                }
            }

            for child in &children {
                self.release_child(child);
            }
        }
    }

    fn release_child(&self, child: &Arc<TaskCore>) {
        // Without a runtime there is no pool to go back to.
        if let Some(shared) = self.shared() {
            shared.pool.release(child);
        } else {
            child.gate.close();
        }
    }
}
