use crate::error::Error;
use crate::runtime::{Builder, Runtime};
use crate::task::core::TaskCore;
use crate::task::{Control, Id};
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Drives one root coroutine, and everything it spawns, from an external
/// loop such as a game loop.
///
/// Nothing runs until the first [`step`](Script::step). Each step advances
/// the root body and then every live descendant up to their next suspension
/// point, and only returns once all of them are parked again.
pub struct Script {
    runtime: Runtime,
    root: Control,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("root", &self.root).finish()
    }
}

impl Script {
    pub(crate) fn new(runtime: Runtime, root: Arc<TaskCore>) -> Self {
        Self {
            runtime,
            root: Control::new(root),
        }
    }

    /// Creates a script on a runtime of its own. Only the root's worker is
    /// spawned up front, children add workers as they start.
    ///
    /// Scripts that come and go should share a [`Runtime`] instead and be
    /// created with [`Runtime::start`].
    pub fn start<F>(body: F) -> io::Result<Script>
    where
        F: Fn(&Control) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        standalone()?.start(body)
    }

    /// Creates an inactive script on a runtime of its own, to be given a body
    /// with [`transition`](Script::transition).
    pub fn create() -> io::Result<Script> {
        standalone()?.create()
    }

    /// Advances the whole coroutine tree by one step.
    ///
    /// Blocks until every resumed body has suspended again or returned. A body
    /// that never suspends blocks this call until it returns.
    ///
    /// Returns the error of a root body that failed or panicked during this
    /// step. The script is done afterwards and its children were cancelled.
    pub fn step(&mut self) -> Result<(), Error> {
        self.root.core().update()
    }

    /// Cancels the root coroutine and every coroutine it started, at the next
    /// step.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    /// Starts the root coroutine over at the next step, cancelling the
    /// current run first if there is one.
    pub fn restart(&self) {
        self.root.restart();
    }

    /// Replaces the root body. The old body never runs again, the new one
    /// starts at the next step. Works on finished and inactive scripts too.
    pub fn transition<F>(&self, body: F)
    where
        F: Fn(&Control) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.root.transition(body);
    }

    /// True once the root body returned, or was cancelled, and no restart is
    /// pending.
    pub fn is_done(&self) -> bool {
        self.root.is_done()
    }

    pub fn id(&self) -> Id {
        self.root.id()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// See [`Control::log`].
    pub fn log(&self, msg: impl fmt::Display) {
        self.root.log(msg);
    }
}

fn standalone() -> io::Result<Runtime> {
    Builder::new().prealloc(1).build()
}

impl Drop for Script {
    fn drop(&mut self) {
        let core = self.root.core();

        if core.state.is_running() {
            core.state.request_cancel();
            if let Err(err) = core.update() {
                debug!(task = %core.id(), error = %err, "error while dropping script");
            }
        }

        let pool = &self.runtime.shared.pool;
        if core.state.is_running() {
            pool.discard(core);
        } else {
            pool.release(core);
        }
    }
}
