use bitflags::bitflags;
use std::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Flags: u8 {
        /// The body is executing or parked mid-body.
        const RUNNING = 1;

        /// Cancellation has been applied. Every suspension point reports it
        /// until the next restart.
        const CANCELLED = 1 << 1;
    }
}

/// The single action waiting to be applied at the next step.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    None = 0,
    Cancel = 1,
    Restart = 2,
}

impl Action {
    fn from_u8(raw: u8) -> Action {
        match raw {
            1 => Action::Cancel,
            2 => Action::Restart,
            _ => Action::None,
        }
    }
}

/// Lock-free run state of a task.
///
/// Requests may come from any thread. They are only applied by whoever is
/// currently driving the task.
#[derive(Debug)]
pub(crate) struct State {
    flags: AtomicU8,
    action: AtomicU8,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            flags: AtomicU8::new(Flags::empty().bits()),
            action: AtomicU8::new(Action::None as u8),
        }
    }

    pub(crate) fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, flags: Flags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn unset(&self, flags: Flags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.flags().contains(Flags::RUNNING)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flags().contains(Flags::CANCELLED)
    }

    pub(crate) fn action(&self) -> Action {
        Action::from_u8(self.action.load(Ordering::Acquire))
    }

    /// Cancel overrides whatever was pending.
    pub(crate) fn request_cancel(&self) {
        self.action.store(Action::Cancel as u8, Ordering::Release);
    }

    /// Dropped if a cancel is already pending.
    pub(crate) fn request_restart(&self) {
        let _ = self
            .action
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match Action::from_u8(raw) {
                    Action::Cancel => None,
                    _ => Some(Action::Restart as u8),
                }
            });
    }

    /// Restart even over a pending cancel. Restarting a running task cancels
    /// its current run first, so the cancel is subsumed.
    pub(crate) fn force_restart(&self) {
        self.action.store(Action::Restart as u8, Ordering::Release);
    }

    pub(crate) fn take_action(&self) -> Action {
        Action::from_u8(self.action.swap(Action::None as u8, Ordering::AcqRel))
    }

    pub(crate) fn is_done(&self) -> bool {
        !self.is_running() && self.action() != Action::Restart
    }

    pub(crate) fn reset(&self) {
        self.flags.store(Flags::empty().bits(), Ordering::Release);
        self.action.store(Action::None as u8, Ordering::Release);
    }
}
