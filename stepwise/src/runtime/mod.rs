//! Explicit runtime context: worker configuration, the task pool and the
//! debug switch shared by every script created from it.

mod builder;
pub use builder::Builder;
pub(crate) use builder::RuntimeConfig;

mod pool;
pub(crate) use pool::Pool;

use crate::script::Script;
use crate::task::core::TaskCore;
use crate::task::Control;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns the task pool backing a family of [`Script`]s.
///
/// A `Runtime` is cheap to clone. Worker threads of idle records stay parked
/// until the last clone, and the last script created from it, are dropped.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub(crate) shared: Arc<Shared>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,
    pub(crate) pool: Pool,
    tracing: AtomicBool,
}

impl Shared {
    fn new(cfg: RuntimeConfig) -> Self {
        Self {
            pool: Pool::new(cfg.max_idle),
            tracing: AtomicBool::new(cfg.trace),
            cfg,
        }
    }

    fn prealloc(self: &Arc<Self>, count: usize) -> io::Result<()> {
        let weak = Arc::downgrade(self);
        self.pool
            .prealloc(count, |key| TaskCore::spawn(key, weak.clone(), &self.cfg))
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> io::Result<Arc<TaskCore>> {
        self.pool
            .acquire(|key| TaskCore::spawn(key, Arc::downgrade(self), &self.cfg))
    }

    pub(crate) fn is_tracing(&self) -> bool {
        self.tracing.load(Ordering::Relaxed)
    }
}

impl Runtime {
    /// A runtime with the default configuration.
    pub fn new() -> io::Result<Runtime> {
        Builder::new().build()
    }

    /// Creates a script running `body`. It starts on the first
    /// [`Script::step`].
    pub fn start<F>(&self, body: F) -> io::Result<Script>
    where
        F: Fn(&Control) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let root = self.shared.acquire()?;
        root.install(Arc::new(body));
        Ok(Script::new(self.clone(), root))
    }

    /// Creates a script without a body. It is done until given one with
    /// [`Script::transition`].
    pub fn create(&self) -> io::Result<Script> {
        let root = self.shared.acquire()?;
        Ok(Script::new(self.clone(), root))
    }

    /// Turns the debug sink behind [`Control::log`] on or off.
    pub fn set_tracing(&self, enable: bool) {
        self.shared.tracing.store(enable, Ordering::Relaxed);
    }

    pub fn is_tracing(&self) -> bool {
        self.shared.is_tracing()
    }

    /// Records waiting in the pool for reuse.
    pub fn idle_tasks(&self) -> usize {
        self.shared.pool.idle()
    }

    /// Records owned by the pool, leased or idle.
    pub fn total_tasks(&self) -> usize {
        self.shared.pool.total()
    }
}
