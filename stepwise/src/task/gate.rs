use parking_lot::{Condvar, Mutex};

/// Which side of the gate currently holds the baton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    /// The driver runs, the body is parked.
    Driver,
    /// The body runs, the driver is parked in `step`.
    Body,
    /// Nobody will ever be parked again.
    Closed,
}

/// One-to-one rendezvous between a driver and the worker running a body.
///
/// Exactly one side runs at any time. `step` hands the baton to the body and
/// waits for it to come back, `suspend` hands it to the driver and waits for
/// the next `step`. Neither side can get more than one hand-off ahead.
#[derive(Debug)]
pub(crate) struct Gate {
    turn: Mutex<Turn>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            turn: Mutex::new(Turn::Driver),
            cv: Condvar::new(),
        }
    }

    /// Body side. Parks until the very first `step`, returns false if the gate
    /// was closed instead.
    pub(crate) fn enter(&self) -> bool {
        let mut turn = self.turn.lock();
        while *turn == Turn::Driver {
            self.cv.wait(&mut turn);
        }
        *turn == Turn::Body
    }

    /// Driver side. Resumes the body and blocks until it suspends again or
    /// finishes. Returns false if the gate is, or got, closed.
    pub(crate) fn step(&self) -> bool {
        let mut turn = self.turn.lock();
        if *turn == Turn::Closed {
            return false;
        }

        *turn = Turn::Body;
        self.cv.notify_all();

        while *turn == Turn::Body {
            self.cv.wait(&mut turn);
        }
        *turn == Turn::Driver
    }

    /// Body side. Gives control back to the driver and parks until the next
    /// `step`. Returns false if the gate is, or got, closed.
    pub(crate) fn suspend(&self) -> bool {
        let mut turn = self.turn.lock();
        if *turn == Turn::Closed {
            return false;
        }

        *turn = Turn::Driver;
        self.cv.notify_all();

        while *turn == Turn::Driver {
            self.cv.wait(&mut turn);
        }
        *turn == Turn::Body
    }

    /// Wakes both sides for good. Idempotent.
    pub(crate) fn close(&self) {
        *self.turn.lock() = Turn::Closed;
        self.cv.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.turn.lock() == Turn::Closed
    }
}
