use crate::error::panic_message;
use std::panic::{self, AssertUnwindSafe};

/// Runs `f`, turning a panic into an `Err` holding the panic message.
///
/// Bodies run on worker threads that are recycled across tasks, a panic must
/// never unwind past the task boundary.
pub(crate) fn guarded<F, R>(f: F) -> Result<R, String>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}
