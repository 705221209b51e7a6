//! Staged multi-step activation.
//!
//! A [`Staged`] sequence matches an ordered chain of [`Stage`]s against
//! incoming signals and runs a callback once the whole chain has matched in
//! order, e.g. a leader key followed by a command key.

pub mod sequence;
pub mod stage;

pub use sequence::{Staged, StagedCallback};
pub use stage::{BlockPolicy, Matcher, Stage};
