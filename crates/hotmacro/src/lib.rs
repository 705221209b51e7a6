//! Signal routing for hotkey and macro engines.
//!
//! This crate provides the shared core: signal and modifier types, a registry of
//! signal and trigger kinds, and a dispatch router that fans signals out to
//! receivers in a fixed priority order. Staged sequences and macro playback are
//! built on top of it in sibling crates.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod modifier;
pub mod registry;
pub mod sender;
pub mod signal;

pub use config::{DEFAULT_LOCK_TIMEOUT, EngineConfig, duration_ms};
pub use dispatch::{Batch, Receiver, ReceiverCallback, ReceiverId, Router, RouterStats};
pub use error::{Error, Result};
pub use modifier::{ModifierMask, ModifierState, Modifiers, Polarity};
pub use registry::{KindId, Registry};
pub use sender::{CancelToken, Paced, Routed, Sender};
pub use signal::{CustomPayload, Discriminator, Key, Motion, Payload, Scroll, Signal};
