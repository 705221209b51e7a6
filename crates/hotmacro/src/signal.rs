//! Signals: one occurrence of an input or output event.
//!
//! A [`Signal`] pairs a registered kind with a payload. The payload is one of
//! a closed set of built-in kinds, or a [`CustomPayload`] object that brings
//! its own matching rules.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::modifier::{ModifierMask, Modifiers, Polarity};
use crate::registry::{KindId, Registry};

/// Narrows dispatch lookup within a kind, e.g. a key code. `None` is the
/// wildcard and lands in the "any" bucket.
pub type Discriminator = Option<u32>;

fn discriminators_compatible(pattern: Discriminator, actual: Discriminator) -> bool {
    match (pattern, actual) {
        (Some(p), Some(a)) => p == a,
        _ => true,
    }
}

/// A key press or release. A `None` code matches any key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub code: Option<u32>,
    pub polarity: Polarity,
}

/// Pointer motion, either relative to the current position or absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Motion {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub relative: bool,
}

/// Scroll wheel deltas per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scroll {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// A payload kind defined outside this crate.
///
/// `matches` is called on the pattern side with the incoming payload as
/// `other`.
pub trait CustomPayload: fmt::Debug + Send + Sync {
    fn discriminator(&self) -> Discriminator {
        None
    }

    /// Adjust live modifiers when a signal carrying this payload is dispatched.
    fn modify(&self, mods: Modifiers) -> Modifiers {
        mods
    }

    /// Exact match, with a numeric fuzz of `tolerance`.
    fn matches(&self, other: &dyn CustomPayload, tolerance: u32) -> bool;

    /// Loose match used to keep an activated stage alive.
    fn resembles(&self, other: &dyn CustomPayload) -> bool {
        discriminators_compatible(self.discriminator(), other.discriminator())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Everything a signal can carry.
#[derive(Debug, Clone)]
pub enum Payload {
    Key(Key),
    Modifier(ModifierMask),
    Move(Motion),
    Scroll(Scroll),
    Delay(Duration),
    Custom(Arc<dyn CustomPayload>),
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Key(a), Payload::Key(b)) => a == b,
            (Payload::Modifier(a), Payload::Modifier(b)) => a == b,
            (Payload::Move(a), Payload::Move(b)) => a == b,
            (Payload::Scroll(a), Payload::Scroll(b)) => a == b,
            (Payload::Delay(a), Payload::Delay(b)) => a == b,
            (Payload::Custom(a), Payload::Custom(b)) => {
                Arc::ptr_eq(a, b) || a.matches(b.as_ref(), 0)
            }
            _ => false,
        }
    }
}

fn within(a: i32, b: i32, tolerance: u32) -> bool {
    a.abs_diff(b) <= tolerance
}

/// One input or output event, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    kind: KindId,
    payload: Payload,
}

impl Signal {
    /// A key event
    pub fn key(code: u32, polarity: Polarity) -> Self {
        Self {
            kind: KindId::KEY,
            payload: Payload::Key(Key {
                code: Some(code),
                polarity,
            }),
        }
    }

    /// A key pattern that matches every key code
    pub fn any_key(polarity: Polarity) -> Self {
        Self {
            kind: KindId::KEY,
            payload: Payload::Key(Key {
                code: None,
                polarity,
            }),
        }
    }

    /// Press or release (or with `Both`, toggle) a set of modifiers
    pub fn modifier(bits: Modifiers, polarity: Polarity) -> Self {
        Self {
            kind: KindId::MODIFIER,
            payload: Payload::Modifier(ModifierMask::new(bits, polarity)),
        }
    }

    /// Pointer motion relative to the current position
    pub fn move_by(x: i32, y: i32, z: i32) -> Self {
        Self {
            kind: KindId::MOVE,
            payload: Payload::Move(Motion {
                x,
                y,
                z,
                relative: true,
            }),
        }
    }

    /// Pointer motion to an absolute position
    pub fn move_to(x: i32, y: i32, z: i32) -> Self {
        Self {
            kind: KindId::MOVE,
            payload: Payload::Move(Motion {
                x,
                y,
                z,
                relative: false,
            }),
        }
    }

    pub fn scroll(x: i32, y: i32, z: i32) -> Self {
        Self {
            kind: KindId::SCROLL,
            payload: Payload::Scroll(Scroll { x, y, z }),
        }
    }

    /// A pause of `duration` during playback
    pub fn delay(duration: Duration) -> Self {
        Self {
            kind: KindId::DELAY,
            payload: Payload::Delay(duration),
        }
    }

    /// A signal of a kind registered at runtime
    pub fn custom(kind: KindId, payload: impl CustomPayload + 'static) -> Self {
        Self {
            kind,
            payload: Payload::Custom(Arc::new(payload)),
        }
    }

    pub fn kind(&self) -> KindId {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The value used to pick a dispatch bucket within this signal's kind
    pub fn discriminator(&self) -> Discriminator {
        match &self.payload {
            Payload::Key(key) => key.code,
            Payload::Modifier(mask) if !mask.bits.is_any() => Some(mask.bits.bits()),
            Payload::Modifier(_) => None,
            Payload::Move(_) | Payload::Scroll(_) | Payload::Delay(_) => None,
            Payload::Custom(custom) => custom.discriminator(),
        }
    }

    /// Does this signal land in the "any" bucket?
    pub fn is_wildcard(&self) -> bool {
        self.discriminator().is_none()
    }

    /// The live modifier set after this signal is applied to `mods`.
    pub fn modify(&self, mods: Modifiers, registry: &Registry) -> Modifiers {
        match &self.payload {
            Payload::Key(Key {
                code: Some(code),
                polarity,
            }) => match registry.modifier_for_key(*code) {
                Some(bits) => ModifierMask::new(bits, *polarity).apply_press(mods),
                None => mods,
            },
            Payload::Modifier(mask) if !mask.bits.is_any() => mask.apply(mods),
            Payload::Custom(custom) => custom.modify(mods),
            _ => mods,
        }
    }

    /// Exact match of `incoming` against this signal used as a pattern.
    ///
    /// Wildcard codes and `Both` polarity on the pattern side match anything;
    /// numeric payloads match within `tolerance` (milliseconds for delays).
    pub fn matches(&self, incoming: &Signal, tolerance: u32) -> bool {
        if self.kind != incoming.kind {
            return false;
        }
        match (&self.payload, &incoming.payload) {
            (Payload::Key(p), Payload::Key(a)) => {
                discriminators_compatible(p.code, a.code) && p.polarity.accepts(a.polarity)
            }
            (Payload::Modifier(p), Payload::Modifier(a)) => {
                (p.bits.is_any() || p.bits == a.bits) && p.polarity.accepts(a.polarity)
            }
            (Payload::Move(p), Payload::Move(a)) => {
                p.relative == a.relative
                    && within(p.x, a.x, tolerance)
                    && within(p.y, a.y, tolerance)
                    && within(p.z, a.z, tolerance)
            }
            (Payload::Scroll(p), Payload::Scroll(a)) => {
                within(p.x, a.x, tolerance)
                    && within(p.y, a.y, tolerance)
                    && within(p.z, a.z, tolerance)
            }
            (Payload::Delay(p), Payload::Delay(a)) => {
                p.as_millis().abs_diff(a.as_millis()) <= u128::from(tolerance)
            }
            (Payload::Custom(p), Payload::Custom(a)) => p.matches(a.as_ref(), tolerance),
            _ => false,
        }
    }

    /// Loose match: same kind and compatible discriminator, ignoring polarity
    /// and numeric values.
    pub fn resembles(&self, incoming: &Signal) -> bool {
        if self.kind != incoming.kind {
            return false;
        }
        match (&self.payload, &incoming.payload) {
            (Payload::Key(p), Payload::Key(a)) => discriminators_compatible(p.code, a.code),
            (Payload::Modifier(p), Payload::Modifier(a)) => p.bits.is_any() || p.bits == a.bits,
            (Payload::Move(p), Payload::Move(a)) => p.relative == a.relative,
            (Payload::Scroll(_), Payload::Scroll(_)) => true,
            (Payload::Delay(_), Payload::Delay(_)) => true,
            (Payload::Custom(p), Payload::Custom(a)) => p.resembles(a.as_ref()),
            _ => false,
        }
    }

    /// Downcast a custom payload
    pub fn custom_payload<T: 'static>(&self) -> Option<&T> {
        match &self.payload {
            Payload::Custom(custom) => custom.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl ModifierMask {
    /// Key semantics: a press sets, a release clears, a full click leaves the
    /// set unchanged.
    fn apply_press(self, mods: Modifiers) -> Modifiers {
        match self.polarity {
            Polarity::Both => mods,
            _ => self.apply(mods),
        }
    }
}
