use crate::runtime::{Runtime, Shared};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Task records created up front by a new runtime.
const DEFAULT_PREALLOC: usize = 5;

/// Idle records kept around for recycling, the rest are evicted.
const DEFAULT_MAX_IDLE: usize = 64;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("stepwise-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`Runtime`].
///
/// ```
/// let rt = stepwise::Builder::new()
///     .thread_name("npc-brain")
///     .prealloc(16)
///     .trace(true)
///     .build()?;
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Name fn used for the worker threads backing each task.
    thread_name: ThreadNameFn,

    /// Stack size used for the worker threads backing each task.
    thread_stack_size: Option<usize>,

    /// Records spawned eagerly at build time.
    prealloc: usize,

    /// Upper bound on idle records kept by the pool.
    max_idle: usize,

    /// Initial state of the debug sink, see [`Runtime::set_tracing`].
    trace: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        let cfg = RuntimeConfig::default();
        Builder {
            thread_name: cfg.thread_name,
            thread_stack_size: cfg.thread_stack_size,
            prealloc: cfg.prealloc,
            max_idle: cfg.max_idle,
            trace: cfg.trace,
        }
    }

    /// Sets the name of the worker threads. All workers share it.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function generating the name of each worker thread.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) of the worker threads. Bodies run on
    /// those stacks, deep recursion inside a body needs a bigger one.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Number of task records, and worker threads, created at build time.
    pub fn prealloc(mut self, val: usize) -> Self {
        self.prealloc = val;
        self
    }

    /// Maximum number of finished task records kept for reuse.
    pub fn max_idle(mut self, val: usize) -> Self {
        self.max_idle = val;
        self
    }

    /// Enables the debug sink behind [`Control::log`](crate::Control::log).
    pub fn trace(mut self, enable: bool) -> Self {
        self.trace = enable;
        self
    }

    /// Creates the configured `Runtime`, spawning the preallocated workers.
    pub fn build(self) -> io::Result<Runtime> {
        let cfg = RuntimeConfig::from(self);
        let prealloc = cfg.prealloc;

        let shared = Arc::new(Shared::new(cfg));
        shared.prealloc(prealloc)?;

        Ok(Runtime { shared })
    }
}

// Snapshot of the builder consumed by the runtime and its pool.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) prealloc: usize,
    pub(crate) max_idle: usize,
    pub(crate) trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            prealloc: DEFAULT_PREALLOC,
            max_idle: DEFAULT_MAX_IDLE,
            trace: false,
        }
    }
}

impl From<Builder> for RuntimeConfig {
    fn from(builder: Builder) -> Self {
        RuntimeConfig {
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            prealloc: builder.prealloc,
            // Never keep fewer idle records than were preallocated.
            max_idle: builder.max_idle.max(builder.prealloc),
            trace: builder.trace,
        }
    }
}
