use crate::task::core::TaskCore;
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::sync::Arc;
use tracing::trace;

/// Recycles task records, and the worker threads attached to them.
///
/// Every record lives in a slab slot for as long as it exists. Released
/// records are reset, their generation is bumped so that stale handles can
/// tell, and they wait on the idle list for the next `acquire`.
#[derive(Debug)]
pub(crate) struct Pool {
    inner: Mutex<Inner>,
    max_idle: usize,
}

#[derive(Debug)]
struct Inner {
    records: Slab<Arc<TaskCore>>,
    idle: Vec<usize>,
}

impl Pool {
    pub(crate) fn new(max_idle: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Slab::new(),
                idle: Vec::new(),
            }),
            max_idle,
        }
    }

    /// Creates `count` idle records up front.
    pub(crate) fn prealloc<F>(&self, count: usize, mut make: F) -> io::Result<()>
    where
        F: FnMut(usize) -> io::Result<Arc<TaskCore>>,
    {
        let mut inner = self.inner.lock();
        inner.records.reserve(count);

        for _ in 0..count {
            let entry = inner.records.vacant_entry();
            let key = entry.key();
            entry.insert(make(key)?);
            inner.idle.push(key);
        }
        Ok(())
    }

    /// Leases an idle record, or creates one with `make` if none is left.
    pub(crate) fn acquire<F>(&self, make: F) -> io::Result<Arc<TaskCore>>
    where
        F: FnOnce(usize) -> io::Result<Arc<TaskCore>>,
    {
        let mut inner = self.inner.lock();

        let idle = inner
            .idle
            .pop()
            .and_then(|key| inner.records.get(key).cloned());

        let core = match idle {
            Some(core) => core,
            None => Self::vacant(&mut inner, make)?,
        };

        core.lease();
        trace!(task = %core.id(), key = core.key, "acquired");
        Ok(core)
    }

    fn vacant<F>(inner: &mut Inner, make: F) -> io::Result<Arc<TaskCore>>
    where
        F: FnOnce(usize) -> io::Result<Arc<TaskCore>>,
    {
        let entry = inner.records.vacant_entry();
        let core = make(entry.key())?;
        entry.insert(Arc::clone(&core));
        Ok(core)
    }

    /// Returns a done record to the pool. Releasing a record that is not
    /// leased is a no-op.
    pub(crate) fn release(&self, core: &Arc<TaskCore>) {
        if !core.unlease() {
            return;
        }

        trace!(task = %core.id(), key = core.key, "released");
        core.reset();

        let mut inner = self.inner.lock();
        if inner.idle.len() < self.max_idle {
            inner.idle.push(core.key);
        } else {
            Self::evict(&mut inner, core);
        }
    }

    /// Drops a record for good, e.g. one whose body refuses to finish.
    pub(crate) fn discard(&self, core: &Arc<TaskCore>) {
        core.unlease();
        let mut inner = self.inner.lock();
        Self::evict(&mut inner, core);
    }

    fn evict(inner: &mut Inner, core: &Arc<TaskCore>) {
        if inner
            .records
            .get(core.key)
            .is_some_and(|c| Arc::ptr_eq(c, core))
        {
            inner.records.remove(core.key);
        }
        inner.idle.retain(|key| *key != core.key);

        trace!(task = %core.id(), key = core.key, "evicted");
        core.gate.close();
    }

    pub(crate) fn idle(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub(crate) fn total(&self) -> usize {
        self.inner.lock().records.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Parked workers wake up and exit.
        for (_, core) in self.inner.get_mut().records.iter() {
            core.gate.close();
        }
    }
}
