//! Built-in consumer middlewares.
//!
//! Order matters when stacking these: put [`panic_recovery`] first so it
//! also contains panics raised inside the tracing and logging wrappers.

pub mod logging;
pub mod recovery;
pub mod trace;

pub use logging::message_logger;
pub use recovery::{panic_message, panic_recovery, panic_recovery_with_nack, PanicCallback};
pub use trace::trace_propagation;
