//! Macro playback for the hotmacro router.
//!
//! A [`Macro`] replays a list of signals on worker threads whenever it is
//! triggered, with bounded concurrency and interrupt control.

pub mod budget;
pub mod config;
pub mod playback;

pub use budget::{Permit, WorkerBudget};
pub use config::{PlaybackConfig, THREAD_MAX};
pub use playback::{ErrorCallback, InterruptState, Macro, MacroBuilder, MacroStats};
