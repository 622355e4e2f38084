use std::any::Any;

/// Returned by every suspension point once the owning task has been cancelled.
///
/// Bodies are expected to bubble it up with `?`. It is caught at the task
/// boundary and turned into the Done state, so there is no need to handle it.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("coroutine has been cancelled")]
pub struct Cancelled;

impl Cancelled {
    /// Whether `err` is, or was caused by, a cancellation.
    pub(crate) fn is_in(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<Cancelled>())
    }
}

/// Failure of a body surfaced to whoever drives its task.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("coroutine failed: {0}")]
    Failed(#[from] anyhow::Error),

    #[error("coroutine panicked: {0}")]
    Panicked(String),

    #[error("coroutine gate is closed")]
    Closed,
}

/// Outcome of awaiting a [`JoinHandle`](crate::JoinHandle) that did not
/// produce a value.
#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    /// The child ended without producing a value.
    #[error("child coroutine was cancelled")]
    Cancelled,

    #[error("child coroutine failed: {0}")]
    Failed(anyhow::Error),

    #[error("child coroutine panicked: {0}")]
    Panicked(String),

    /// The awaiting body was itself cancelled while waiting.
    #[error("interrupted while waiting on child coroutine")]
    Interrupted(#[source] Cancelled),
}

impl JoinError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }
}

impl From<Cancelled> for JoinError {
    fn from(cancelled: Cancelled) -> Self {
        JoinError::Interrupted(cancelled)
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
