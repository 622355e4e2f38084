use crate::error::{Cancelled, JoinError};
use crate::task::core::{Body, TaskCore};
use crate::task::{Control, Id};
use crate::utils::guarded;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A limited handle on a child coroutine.
///
/// The handle is bound to one lease of the child's record. Once the child is
/// done and its record went back to the pool, the handle keeps reporting
/// done and every request through it is ignored.
#[derive(Clone)]
pub struct SubControl {
    core: Arc<TaskCore>,
    generation: u64,
    id: Id,
}

impl fmt::Debug for SubControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubControl")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("stale", &self.live().is_none())
            .finish()
    }
}

impl SubControl {
    pub(crate) fn new(core: Arc<TaskCore>) -> Self {
        Self {
            generation: core.generation(),
            id: core.id(),
            core,
        }
    }

    fn live(&self) -> Option<&TaskCore> {
        (self.core.generation() == self.generation).then_some(&*self.core)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(core) = self.live() {
            core.state.request_cancel();
        }
    }

    pub fn restart(&self) {
        if let Some(core) = self.live() {
            core.state.request_restart();
        }
    }

    pub fn transition<F>(&self, body: F)
    where
        F: Fn(&Control) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if let Some(core) = self.live() {
            core.transition(Arc::new(body));
        }
    }

    pub fn is_running(&self) -> bool {
        self.live().is_some_and(|core| core.state.is_running())
    }

    pub fn is_done(&self) -> bool {
        self.live().map_or(true, |core| core.is_done())
    }

    /// Suspends `ctl` until the child is done.
    pub fn wait(&self, ctl: &Control) -> Result<(), Cancelled> {
        ctl.yield_until(|| self.is_done())
    }
}

enum Slot<T> {
    Pending,
    Settled(Result<T, JoinError>),
    Taken,
}

/// Single-assignment cell a child writes its outcome into.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Slot<T>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Slot::Pending),
        }
    }

    /// First outcome wins, later ones are dropped.
    pub(crate) fn settle(&self, outcome: Result<T, JoinError>) -> bool {
        let mut inner = self.inner.lock();
        match *inner {
            Slot::Pending => {
                *inner = Slot::Settled(outcome);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        self.settle(Err(JoinError::Cancelled))
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(*self.inner.lock(), Slot::Pending)
    }

    pub(crate) fn try_take(&self) -> Option<Result<T, JoinError>> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut *inner, Slot::Taken) {
            Slot::Pending => {
                *inner = Slot::Pending;
                None
            }
            Slot::Settled(outcome) => Some(outcome),
            Slot::Taken => Some(Err(JoinError::Cancelled)),
        }
    }
}

/// Where a child sends its failures, whichever body it is running.
pub(crate) type Report = Arc<dyn Fn(&Control, JoinError) + Send + Sync>;

/// A report settling `slot`. Once every handle on the slot is gone, failures
/// are logged instead.
pub(crate) fn report_to<T: Send + 'static>(slot: &Arc<ResultSlot<T>>) -> Report {
    let slot = Arc::downgrade(slot);
    Arc::new(move |ctl: &Control, err: JoinError| match slot.upgrade() {
        Some(slot) => {
            slot.settle(Err(err));
        }
        None => warn!(task = %ctl.id(), error = %err, "detached child coroutine failed"),
    })
}

/// Runs `f`, handing errors and panics to `report`. Those come out as
/// `Ok(None)`, cancellation goes through untouched so the task boundary sees
/// it.
pub(crate) fn supervised<T, F>(
    ctl: &Control,
    report: &Report,
    f: F,
) -> anyhow::Result<Option<T>>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match guarded(f) {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(err)) if Cancelled::is_in(&err) => Err(err),
        Ok(Err(err)) => {
            report(ctl, JoinError::Failed(err));
            Ok(None)
        }
        Err(msg) => {
            report(ctl, JoinError::Panicked(msg));
            Ok(None)
        }
    }
}

/// Wraps a replacement body of a child so its failures keep reaching the
/// child's join handle.
pub(crate) fn reporting(report: Report, body: Body) -> Body {
    Arc::new(move |ctl: &Control| supervised(ctl, &report, || body(ctl)).map(drop))
}

/// Owned handle to a child coroutine started with
/// [`Control::start_async`], and to the value it produces.
///
/// Dropping the handle does not cancel the child, it keeps running until it
/// returns or its parent's body ends.
///
/// # Examples
///
/// ```no_run
/// let mut script = stepwise::Script::start(|ctl| {
///     let small = ctl.start_async_with(10, |ctl, n: u32| {
///         let mut sum = 0;
///         for i in 0..n {
///             sum += i;
///             ctl.yield_now()?;
///         }
///         Ok(sum)
///     });
///
///     let timeout = ctl.sleep_async(std::time::Duration::from_secs(60));
///     timeout.cancel();
///
///     assert_eq!(small.join(ctl)?, 45);
///     assert!(timeout.join(ctl).is_err());
///     Ok(())
/// })?;
///
/// while !script.is_done() {
///     script.step()?;
/// }
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct JoinHandle<T> {
    child: SubControl,
    slot: Arc<ResultSlot<T>>,
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("child", &self.child)
            .field("settled", &self.slot.is_settled())
            .finish()
    }
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(child: SubControl, slot: Arc<ResultSlot<T>>) -> Self {
        Self { child, slot }
    }

    pub fn id(&self) -> Id {
        self.child.id()
    }

    /// Suspends `ctl` until the child settles.
    ///
    /// Returns the child's value, or [`JoinError::Cancelled`] if the child
    /// ended without one. If `ctl` itself gets cancelled while waiting this
    /// returns [`JoinError::Interrupted`], which `?` propagates as a
    /// cancellation.
    pub fn join(self, ctl: &Control) -> Result<T, JoinError> {
        loop {
            if let Some(outcome) = self.slot.try_take() {
                return outcome;
            }

            // Done without settling: cancelled, or transitioned to a body
            // that returned without a value for this handle.
            if self.child.is_done() {
                self.slot.cancel();
                continue;
            }

            ctl.yield_now()?;
        }
    }

    /// Cancels the child. A value it did not produce yet will never be
    /// returned by [`join`](JoinHandle::join).
    pub fn cancel(&self) {
        self.slot.cancel();
        self.child.cancel();
    }

    /// True once the child settled or ended.
    pub fn is_done(&self) -> bool {
        self.slot.is_settled() || self.child.is_done()
    }

    pub fn sub_control(&self) -> &SubControl {
        &self.child
    }
}
