//! Modifier bitsets, event polarity and the shared live modifier state.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// A set of held modifier keys.
    ///
    /// Bits outside the named flags are retained, so callers can register
    /// their own modifier bits through the [`Registry`](crate::Registry).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Modifiers: u32 {
        const ALT = 1;
        const ALTGR = 1 << 1;
        const CTRL = 1 << 2;
        const SHIFT = 1 << 3;
        const META = 1 << 4;
        const SUPER = 1 << 5;
        const HYPER = 1 << 6;
        const FN = 1 << 7;
        const _ = !0;
    }
}

impl Modifiers {
    /// Wildcard filter: matches any live modifier set.
    pub const ANY: Modifiers = Modifiers::from_bits_retain(u32::MAX);

    /// Is this the wildcard filter?
    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// Does this filter accept the live modifier set `live`? Only the filter
    /// side may be the wildcard.
    pub fn accepts(self, live: Modifiers) -> bool {
        self.is_any() || self == live
    }
}

impl Default for Modifiers {
    fn default() -> Self {
        Modifiers::empty()
    }
}

/// Direction of a key or modifier event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    /// Pressed
    #[default]
    Down,
    /// Released
    Up,
    /// Pressed then released; as a pattern, either direction
    Both,
}

impl Polarity {
    /// Pattern test: `Both` on either side matches anything.
    pub fn accepts(self, other: Polarity) -> bool {
        self == other || self == Polarity::Both || other == Polarity::Both
    }
}

/// A modifier bitset with the direction it is applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModifierMask {
    pub bits: Modifiers,
    pub polarity: Polarity,
}

impl ModifierMask {
    pub fn new(bits: Modifiers, polarity: Polarity) -> Self {
        Self { bits, polarity }
    }

    /// Apply this mask to a live modifier set. `Both` toggles.
    pub fn apply(self, mods: Modifiers) -> Modifiers {
        match self.polarity {
            Polarity::Down => mods | self.bits,
            Polarity::Up => mods.difference(self.bits),
            Polarity::Both => mods.symmetric_difference(self.bits),
        }
    }
}

/// Currently held modifiers, shared between producers and the router.
///
/// Reads are lock-free. Writes normally happen through the router's
/// modifier mutation step, once per dispatched signal.
#[derive(Debug, Default)]
pub struct ModifierState {
    bits: AtomicU32,
}

impl ModifierState {
    pub fn new(initial: Modifiers) -> Self {
        Self {
            bits: AtomicU32::new(initial.bits()),
        }
    }

    /// The live modifier set
    pub fn get(&self) -> Modifiers {
        Modifiers::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    /// Overwrite the live modifier set
    pub fn set(&self, mods: Modifiers) {
        self.bits.store(mods.bits(), Ordering::Release);
    }

    /// Atomically replace the live set with `f(current)` and return the new set.
    pub fn update(&self, f: impl Fn(Modifiers) -> Modifiers) -> Modifiers {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = f(Modifiers::from_bits_retain(current)).bits();
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Modifiers::from_bits_retain(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release every modifier
    pub fn clear(&self) {
        self.set(Modifiers::empty());
    }
}
