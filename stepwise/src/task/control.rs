use crate::error::Cancelled;
use crate::task::core::{Body, TaskCore};
use crate::task::join::{report_to, supervised, JoinHandle, Report, ResultSlot, SubControl};
use crate::task::Id;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// The handle a coroutine body uses to direct its own flow.
///
/// Every blocking method is a suspension point built on [`yield_now`]: it
/// parks the body until the next [`Script::step`] and returns
/// `Err(Cancelled)` once the task has been cancelled. Bodies should bubble
/// that error up with `?`, it is caught at the task boundary.
///
/// Blocking methods must only be called from the body owning this handle.
/// `cancel`, `restart`, `transition` and the `is_*` queries are safe from
/// anywhere.
///
/// [`yield_now`]: Control::yield_now
/// [`Script::step`]: crate::Script::step
#[derive(Clone)]
pub struct Control {
    core: Arc<TaskCore>,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Control").field(&self.core).finish()
    }
}

impl Control {
    pub(crate) fn new(core: Arc<TaskCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    pub fn id(&self) -> Id {
        self.core.id()
    }

    /// Waits for the next step.
    pub fn yield_now(&self) -> Result<(), Cancelled> {
        if !self.core.gate.suspend() || self.core.state.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Waits for `count` steps.
    pub fn delay(&self, count: usize) -> Result<(), Cancelled> {
        for _ in 0..count {
            self.yield_now()?;
        }
        Ok(())
    }

    /// Yields until at least `duration` of wall-clock time has passed.
    ///
    /// The actual duration depends on the step cadence of the driver, it is
    /// never shorter than `duration` but may overshoot by up to one step.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let start = Instant::now();
        loop {
            self.yield_now()?;
            if start.elapsed() >= duration {
                return Ok(());
            }
        }
    }

    /// Yields as long as `cond` returns true. Checked before each yield.
    pub fn yield_while<F>(&self, mut cond: F) -> Result<(), Cancelled>
    where
        F: FnMut() -> bool,
    {
        while cond() {
            self.yield_now()?;
        }
        Ok(())
    }

    /// Yields until `cond` returns true. Checked before each yield.
    pub fn yield_until<F>(&self, mut cond: F) -> Result<(), Cancelled>
    where
        F: FnMut() -> bool,
    {
        while !cond() {
            self.yield_now()?;
        }
        Ok(())
    }

    /// Yields as long as `flag` is set.
    pub fn yield_while_flag(&self, flag: &AtomicBool) -> Result<(), Cancelled> {
        self.yield_while(|| flag.load(Ordering::Acquire))
    }

    /// Yields until `flag` is set.
    pub fn yield_until_flag(&self, flag: &AtomicBool) -> Result<(), Cancelled> {
        self.yield_until(|| flag.load(Ordering::Acquire))
    }

    /// Parks the body for good. Only ever returns through cancellation.
    pub fn abyss(&self) -> Result<Infallible, Cancelled> {
        loop {
            self.yield_now()?;
        }
    }

    /// Runs `f` on the driver's thread at the start of the next step and
    /// returns its result. Useful for APIs that only work on the main loop.
    ///
    /// `f` is dropped without running if the task is cancelled first.
    pub fn run_on_update<F, R>(&self, f: F) -> Result<R, Cancelled>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.core.state.is_cancelled() {
            return Err(Cancelled);
        }

        let out = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&out);
        self.core.queue(Box::new(move || {
            *slot.lock() = Some(f());
        }));

        self.yield_now()?;

        let res = out.lock().take();
        res.ok_or(Cancelled)
    }

    /// Requests cancellation of this task and all of its children. Takes
    /// effect at the next step, the body stops at its next suspension point.
    /// Parents are not affected.
    pub fn cancel(&self) {
        self.core.state.request_cancel();
    }

    /// Requests the body to run again from the beginning at the next step. A
    /// running body is cancelled first. Ignored while a cancel is pending.
    pub fn restart(&self) {
        self.core.state.request_restart();
    }

    /// Replaces the body. At the next step the current body, if running, is
    /// cancelled and `body` starts in its place.
    pub fn transition<F>(&self, body: F)
    where
        F: Fn(&Control) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.core.transition(Arc::new(body));
    }

    /// True while the body has not returned.
    pub fn is_running(&self) -> bool {
        self.core.state.is_running()
    }

    /// True once the body has returned and no restart is pending.
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.state.is_cancelled()
    }

    /// Starts `body` as a child of this task. It takes its first step within
    /// the current driver step, right after this body suspends.
    ///
    /// The child is cancelled when this body ends. Its outcome is collected
    /// with [`JoinHandle::join`].
    ///
    /// # Panics
    ///
    /// Panics if the runtime is gone or a worker thread cannot be spawned.
    pub fn start_async<T, F>(&self, body: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Fn(&Control) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let slot = Arc::new(ResultSlot::new());
        let report = report_to(&slot);
        let child = self.spawn_child(child_body(&slot, Arc::clone(&report), body), report);
        JoinHandle::new(child, slot)
    }

    /// Like [`start_async`](Control::start_async), handing a clone of `arg`
    /// to every run of the body.
    pub fn start_async_with<A, T, F>(&self, arg: A, body: F) -> JoinHandle<T>
    where
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(&Control, A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.start_async(move |ctl| body(ctl, arg.clone()))
    }

    /// A child that waits `count` steps.
    pub fn delay_async(&self, count: usize) -> JoinHandle<()> {
        self.start_async(move |ctl| Ok(ctl.delay(count)?))
    }

    /// A child that sleeps for `duration`.
    pub fn sleep_async(&self, duration: Duration) -> JoinHandle<()> {
        self.start_async(move |ctl| Ok(ctl.sleep(duration)?))
    }

    fn spawn_child(&self, body: Body, report: Report) -> SubControl {
        let Some(shared) = self.core.shared() else {
            detached();
        };
        let child = match shared.acquire() {
            Ok(child) => child,
            Err(err) => spawn_failed(err),
        };

        child.supervise(report);
        child.install(body);
        self.core.children.add(Arc::clone(&child));
        SubControl::new(child)
    }

    /// Debug trace tagged with this task's id. Only emitted while tracing is
    /// enabled on the runtime.
    pub fn log(&self, msg: impl fmt::Display) {
        if self.core.is_tracing() {
            debug!(task = %self.id(), "{}", msg);
        }
    }
}

// Resolves the slot with the value of `body`, failures go through `report`.
fn child_body<T, F>(slot: &Arc<ResultSlot<T>>, report: Report, body: F) -> Body
where
    T: Send + 'static,
    F: Fn(&Control) -> anyhow::Result<T> + Send + Sync + 'static,
{
    let slot = Arc::downgrade(slot);
    Arc::new(move |ctl: &Control| {
        if let Some(value) = supervised(ctl, &report, || body(ctl))? {
            if let Some(slot) = slot.upgrade() {
                slot.settle(Ok(value));
            }
        }
        Ok(())
    })
}

#[cold]
fn detached() -> ! {
    panic!("cannot start a child coroutine: runtime has been dropped")
}

#[cold]
fn spawn_failed(err: io::Error) -> ! {
    panic!("failed to spawn coroutine worker thread: {}", err)
}
