//! Coroutine tasks: the handle given to bodies, child handles, and the
//! state machine behind them.

mod control;
pub use control::Control;

pub(crate) mod core;

pub(crate) mod gate;

pub mod id;
pub use id::Id;

mod join;
pub use join::{JoinHandle, SubControl};

pub(crate) mod node;

pub(crate) mod state;

#[cfg(test)]
mod tests;
