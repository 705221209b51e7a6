use std::sync::Arc;

use hotmacro::{Modifiers, Signal};
use serde::{Deserialize, Serialize};

/// What a stage compares incoming signals against
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Compare by value, honoring wildcards and tolerance
    Signal(Signal),
    /// Accept only this exact signal object
    Identity(Arc<Signal>),
}

impl Matcher {
    fn matches(&self, signal: &Signal, tolerance: u32) -> bool {
        match self {
            Matcher::Signal(pattern) => pattern.matches(signal, tolerance),
            Matcher::Identity(target) => std::ptr::eq(target.as_ref(), signal),
        }
    }

    fn resembles(&self, signal: &Signal) -> bool {
        match self {
            Matcher::Signal(pattern) => pattern.resembles(signal),
            Matcher::Identity(target) => std::ptr::eq(target.as_ref(), signal),
        }
    }
}

impl From<Signal> for Matcher {
    fn from(signal: Signal) -> Self {
        Matcher::Signal(signal)
    }
}

/// How a staged sequence decides whether to block the signals it consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlockPolicy {
    /// Each stage's own blocking flag decides
    #[default]
    Unmanaged,
    /// Never block
    NoBlock,
    /// Block only the signal that completes the sequence
    BlockFinal,
    /// Block every signal a stage consumes
    BlockAll,
}

impl BlockPolicy {
    /// Stage flags this policy imposes on stage `index` of `len`, or `None`
    /// if it leaves them alone.
    pub(crate) fn flag_for(self, index: usize, len: usize) -> Option<bool> {
        match self {
            BlockPolicy::Unmanaged => None,
            BlockPolicy::NoBlock => Some(false),
            BlockPolicy::BlockFinal => Some(index + 1 == len),
            BlockPolicy::BlockAll => Some(true),
        }
    }
}

/// One link of a staged sequence.
#[derive(Debug, Clone)]
pub struct Stage {
    matcher: Matcher,
    modifiers: Modifiers,
    tolerance: u32,
    blocking: bool,
    activated: bool,
}

impl Stage {
    /// A stage matching `matcher` under any modifiers, with no tolerance
    pub fn new(matcher: impl Into<Matcher>) -> Self {
        Self {
            matcher: matcher.into(),
            modifiers: Modifiers::ANY,
            tolerance: 0,
            blocking: false,
            activated: false,
        }
    }

    /// A stage matching one specific signal object
    pub fn identity(signal: Arc<Signal>) -> Self {
        Self::new(Matcher::Identity(signal))
    }

    /// Require these live modifiers; `Modifiers::ANY` accepts all
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Numeric fuzz for move, scroll and delay payloads
    pub fn with_tolerance(mut self, tolerance: u32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    pub fn tolerance(&self) -> u32 {
        self.tolerance
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Full match: kind, discriminator, polarity, tolerance and modifiers.
    pub fn matches(&self, signal: &Signal, mods: Modifiers) -> bool {
        self.modifiers.accepts(mods) && self.matcher.matches(signal, self.tolerance)
    }

    /// Loose match used to keep an activated stage alive.
    pub fn resembles(&self, signal: &Signal, mods: Modifiers) -> bool {
        self.modifiers.accepts(mods) && self.matcher.resembles(signal)
    }

    pub(crate) fn set_activated(&mut self, activated: bool) {
        self.activated = activated;
    }

    pub(crate) fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }
}
