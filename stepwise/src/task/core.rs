use crate::error::{Cancelled, Error};
use crate::runtime::{RuntimeConfig, Shared};
use crate::task::gate::Gate;
use crate::task::join::{reporting, Report};
use crate::task::node::ChildSet;
use crate::task::state::{Action, Flags, State};
use crate::task::{Control, Id};
use crate::utils::{guarded, ScopeGuard};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, trace};

/// A coroutine body as stored on a task. Restarts call it again from scratch.
pub(crate) type Body = Arc<dyn Fn(&Control) -> anyhow::Result<()> + Send + Sync>;

/// Callback queued by a body to run on the driver's thread.
pub(crate) type Queued = Box<dyn FnOnce() + Send>;

/// A recyclable task record: one worker thread, one gate, one body at a time.
pub(crate) struct TaskCore {
    id: Mutex<Id>,

    /// Slot in the pool's slab.
    pub(crate) key: usize,

    /// Bumped every time the record goes back to the pool, stale handles
    /// compare against it.
    generation: AtomicU64,

    leased: AtomicBool,

    pub(crate) gate: Gate,

    pub(crate) state: State,

    body: Mutex<Option<Body>>,

    queued: Mutex<Option<Queued>>,

    // Children only: where failures of any body go instead of `failure`.
    report: Mutex<Option<Report>>,

    // Set by the worker when the body errors or panics, taken by the driver.
    failure: Mutex<Option<Error>>,

    pub(crate) children: ChildSet,

    // MUST be Weak, the pool inside `Shared` owns this record.
    shared: Weak<Shared>,
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id())
            .field("key", &self.key)
            .field("generation", &self.generation())
            .field("flags", &self.state.flags())
            .field("action", &self.state.action())
            .field("children", &self.children.len())
            .field("closed", &self.gate.is_closed())
            .finish()
    }
}

impl TaskCore {
    fn new(key: usize, shared: Weak<Shared>) -> Self {
        Self {
            id: Mutex::new(Id::next()),
            key,
            generation: AtomicU64::new(0),
            leased: AtomicBool::new(false),
            gate: Gate::new(),
            state: State::new(),
            body: Mutex::new(None),
            queued: Mutex::new(None),
            report: Mutex::new(None),
            failure: Mutex::new(None),
            children: ChildSet::new(),
            shared,
        }
    }

    /// Creates a record and starts its worker thread. The worker stays parked
    /// on the gate until the first step.
    pub(crate) fn spawn(
        key: usize,
        shared: Weak<Shared>,
        cfg: &RuntimeConfig,
    ) -> io::Result<Arc<TaskCore>> {
        let core = Arc::new(TaskCore::new(key, shared));

        let mut builder = thread::Builder::new().name(cfg.thread_name.0());
        if let Some(stack_size) = cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker = Arc::clone(&core);
        builder.spawn(move || worker.run_worker())?;

        trace!(task = %core.id(), key, "created");
        Ok(core)
    }

    pub(crate) fn id(&self) -> Id {
        *self.id.lock()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub(crate) fn is_tracing(&self) -> bool {
        self.shared().is_some_and(|shared| shared.is_tracing())
    }

    /// Hands the record out of the pool under a fresh id.
    pub(crate) fn lease(&self) {
        *self.id.lock() = Id::next();
        self.leased.store(true, Ordering::Release);
    }

    /// Returns false if the record was not leased, e.g. released twice.
    pub(crate) fn unlease(&self) -> bool {
        self.leased.swap(false, Ordering::AcqRel)
    }

    /// Forget everything about the previous lease. Only valid once the body
    /// has ended and every child was released.
    pub(crate) fn reset(&self) {
        self.body.lock().take();
        self.queued.lock().take();
        self.report.lock().take();
        self.failure.lock().take();
        self.state.reset();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Installs `body` and schedules its first run for the next step.
    pub(crate) fn install(&self, body: Body) {
        *self.body.lock() = Some(body);
        self.state.request_restart();
    }

    /// Marks the record as a child reporting to a join handle.
    pub(crate) fn supervise(&self, report: Report) {
        *self.report.lock() = Some(report);
    }

    /// Swaps the body and schedules a restart. The old body, if running, is
    /// cancelled during that same step and never executes another statement.
    pub(crate) fn transition(&self, body: Body) {
        let report = self.report.lock().clone();
        let body = match report {
            Some(report) => reporting(report, body),
            None => body,
        };
        *self.body.lock() = Some(body);
        self.state.force_restart();
    }

    pub(crate) fn queue(&self, f: Queued) {
        *self.queued.lock() = Some(f);
    }

    /// Applies the pending action, resumes the body if it is running, then
    /// steps every live child. This is one driver step for this subtree.
    ///
    /// Only this task's own failure is returned. Children report theirs to
    /// their join handles.
    pub(crate) fn update(&self) -> Result<(), Error> {
        let res = match self.state.take_action() {
            Action::Cancel => self.apply_cancel(),
            Action::Restart => self.apply_restart(),
            Action::None if self.state.is_running() => self.resume(),
            Action::None => Ok(()),
        };

        self.update_children();
        res
    }

    fn apply_cancel(&self) -> Result<(), Error> {
        trace!(task = %self.id(), "cancel applied");
        self.state.set(Flags::CANCELLED);
        self.queued.lock().take();

        // Let a parked body observe the latch and unwind. No user statement
        // runs past its suspension point.
        if self.state.is_running() {
            self.resume()
        } else {
            Ok(())
        }
    }

    fn apply_restart(&self) -> Result<(), Error> {
        let mut res = Ok(());

        if self.state.is_running() {
            res = self.apply_cancel();

            // The body swallowed its cancellation and parked again, try
            // again next step.
            if self.state.is_running() {
                self.state.request_restart();
                return res;
            }
        }

        self.state.unset(Flags::CANCELLED);
        if self.body.lock().is_none() {
            return res;
        }

        trace!(task = %self.id(), "restart applied");

        // Flagged from the driver side so the task never looks done between
        // the request and the body actually starting.
        self.state.set(Flags::RUNNING);
        let started = self.resume();
        res.and(started)
    }

    fn resume(&self) -> Result<(), Error> {
        let queued = self.queued.lock().take();
        if let Some(f) = queued {
            f();
        }

        if !self.gate.step() {
            self.state.unset(Flags::RUNNING);
            return Err(Error::Closed);
        }

        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn run_worker(self: Arc<Self>) {
        // If anything below unwinds, nobody may stay parked on the gate.
        let mut guard = ScopeGuard::new(|| self.gate.close());

        let ctl = Control::new(Arc::clone(&self));
        if self.gate.enter() {
            loop {
                self.run_once(&ctl);
                if !self.gate.suspend() {
                    break;
                }
            }
        }

        trace!(task = %self.id(), "worker exiting");
        guard.disarm();
    }

    /// One full run of the body, from entry to Done.
    fn run_once(&self, ctl: &Control) {
        let body = self.body.lock().clone();

        if let Some(body) = body {
            debug!(task = %self.id(), "coroutine start");

            // The one place a cancellation is caught.
            match guarded(|| body(ctl)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) if Cancelled::is_in(&err) => {
                    trace!(task = %self.id(), "coroutine cancelled");
                }
                Ok(Err(err)) => {
                    *self.failure.lock() = Some(Error::Failed(err));
                }
                Err(msg) => {
                    *self.failure.lock() = Some(Error::Panicked(msg));
                }
            }
        }

        self.terminate_children();
        self.state.unset(Flags::RUNNING);
        debug!(task = %self.id(), "coroutine end");
    }
}
