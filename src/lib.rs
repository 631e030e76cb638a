//! reactor-core
//!
//! A portable, single-threaded event loop: timers, non-blocking stream I/O,
//! a bounded worker pool for blocking work, child-process supervision, and a
//! thread-safe wakeup signal, all driven through one [`Loop`].
//!
//! The loop is callback based, not `Future`/`async` based: [`Loop`] is itself
//! the scheduler, so there is no executor underneath it to hand continuations
//! to. See `DESIGN.md` for why.

#[cfg(test)]
mod tests;

pub mod backend;
pub mod error;
pub mod handle;
mod r#loop;
pub mod process;
pub mod request;
pub mod stream;
pub mod timer;
pub mod wakeup;
pub mod work;

pub use error::{Code, Error};
pub use handle::{Handle, HandleId, HandleKind};
pub use r#loop::{Loop, LoopOptions, RunMode, RunResult};
pub use request::{Request, RequestId};
