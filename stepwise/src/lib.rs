//! Cooperative coroutines driven one step at a time by an external loop.
//!
//! Long-running logic is written as ordinary sequential code inside a body
//! closure. Every call to [`Script::step`] advances the body, and all of the
//! children it spawned, up to their next suspension point.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let mut script = stepwise::Script::start(|ctl| {
//!     for frame in 0..3 {
//!         ctl.log(format!("frame {frame}"));
//!         ctl.yield_now()?;
//!     }
//!     ctl.sleep(Duration::from_millis(20))?;
//!     Ok(())
//! })?;
//!
//! while !script.is_done() {
//!     script.step()?;
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
pub use error::{Cancelled, Error, JoinError};

pub mod runtime;
pub use runtime::{Builder, Runtime};

mod script;
pub use script::Script;

pub mod task;
pub use task::{Control, Id, JoinHandle, SubControl};

mod utils;
