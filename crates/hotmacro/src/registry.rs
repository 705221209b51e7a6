//! Identity tables for signal and trigger kinds, plus modifier names and
//! modifier keys.
//!
//! A [`Registry`] is an explicit object: create one per engine and share it by
//! `Arc` with every component that needs to resolve kinds. Dropping the last
//! handle tears it down.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::modifier::Modifiers;

/// Stable numeric id of a signal or trigger kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindId(pub u32);

impl KindId {
    pub const KEY: KindId = KindId(0);
    pub const MODIFIER: KindId = KindId(1);
    pub const MOVE: KindId = KindId(2);
    pub const SCROLL: KindId = KindId(3);
    pub const DELAY: KindId = KindId(4);

    pub const ACTION: KindId = KindId(0);
    pub const STAGED: KindId = KindId(1);
    pub const MACRO: KindId = KindId(2);
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

const BUILTIN_SIGNALS: &[(&str, &[&str])] = &[
    ("key", &["keyboard"]),
    ("modifier", &["mods", "modifiers"]),
    ("move", &["movecursor", "motion"]),
    ("scroll", &["wheel"]),
    ("delay", &["nosend", "noop", "pause"]),
];

const BUILTIN_TRIGGERS: &[(&str, &[&str])] = &[
    ("action", &[]),
    ("staged", &["sequence"]),
    ("macro", &[]),
];

const BUILTIN_MODIFIERS: &[(&str, Modifiers, &[&str])] = &[
    ("alt", Modifiers::ALT, &["option"]),
    ("altgr", Modifiers::ALTGR, &[]),
    ("ctrl", Modifiers::CTRL, &["control"]),
    ("shift", Modifiers::SHIFT, &[]),
    ("meta", Modifiers::META, &[]),
    ("super", Modifiers::SUPER, &["cmd", "command", "win", "windows"]),
    ("hyper", Modifiers::HYPER, &[]),
    ("fn", Modifiers::FN, &["function"]),
];

/// Names and aliases for one family of kinds. Ids are dense and start at 0.
#[derive(Debug, Default)]
struct KindTable {
    names: Vec<String>,
    lookup: HashMap<String, KindId>,
}

impl KindTable {
    fn with_builtins(builtins: &[(&str, &[&str])]) -> Self {
        let mut table = Self::default();
        for (name, aliases) in builtins {
            table.insert(name, aliases);
        }
        table
    }

    fn register(&mut self, name: &str, aliases: &[&str]) -> Result<KindId> {
        let key = name.to_lowercase();
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty kind name".to_string()));
        }
        if self.lookup.contains_key(&key) {
            return Err(Error::InvalidArgument(format!(
                "kind name already registered: {name}"
            )));
        }
        for alias in aliases {
            if self.lookup.contains_key(&alias.to_lowercase()) {
                return Err(Error::InvalidArgument(format!(
                    "kind alias already registered: {alias}"
                )));
            }
        }

        self.names.try_reserve(1)?;
        self.lookup.try_reserve(aliases.len() + 1)?;
        Ok(self.insert(name, aliases))
    }

    /// Add a name already checked for collisions
    fn insert(&mut self, name: &str, aliases: &[&str]) -> KindId {
        let id = KindId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.lookup.insert(name.to_lowercase(), id);
        for alias in aliases {
            self.lookup.insert(alias.to_lowercase(), id);
        }
        id
    }

    fn alias(&mut self, id: KindId, alias: &str) -> Result<()> {
        if self.name(id).is_none() {
            return Err(Error::InvalidArgument(format!("unknown kind {id}")));
        }
        let key = alias.to_lowercase();
        match self.lookup.get(&key) {
            Some(existing) if *existing == id => Ok(()),
            Some(_) => Err(Error::InvalidArgument(format!(
                "kind alias already registered: {alias}"
            ))),
            None => {
                self.lookup.try_reserve(1)?;
                self.lookup.insert(key, id);
                Ok(())
            }
        }
    }

    fn id(&self, name: &str) -> Option<KindId> {
        self.lookup.get(&name.to_lowercase()).copied()
    }

    fn name(&self, id: KindId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct ModifierTable {
    names: Vec<(String, Modifiers)>,
    lookup: HashMap<String, Modifiers>,
    keys: HashMap<u32, Modifiers>,
}

impl ModifierTable {
    fn with_builtins() -> Self {
        let mut table = Self::default();
        for (name, bits, aliases) in BUILTIN_MODIFIERS {
            table.names.push((name.to_string(), *bits));
            table.lookup.insert(name.to_string(), *bits);
            for alias in *aliases {
                table.lookup.insert(alias.to_string(), *bits);
            }
        }
        table
    }
}

/// Registrar for signal kinds, trigger kinds and modifiers.
///
/// Built-in signal kinds occupy the ids named by the `KindId` constants; kinds
/// registered later receive the next free id.
#[derive(Debug)]
pub struct Registry {
    signals: RwLock<KindTable>,
    triggers: RwLock<KindTable>,
    modifiers: RwLock<ModifierTable>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry holding the built-in kinds and modifier names
    pub fn new() -> Self {
        Self {
            signals: RwLock::new(KindTable::with_builtins(BUILTIN_SIGNALS)),
            triggers: RwLock::new(KindTable::with_builtins(BUILTIN_TRIGGERS)),
            modifiers: RwLock::new(ModifierTable::with_builtins()),
        }
    }

    /// Drop everything registered at runtime, keeping only built-ins
    pub fn reset(&self) {
        *self.signals.write() = KindTable::with_builtins(BUILTIN_SIGNALS);
        *self.triggers.write() = KindTable::with_builtins(BUILTIN_TRIGGERS);
        *self.modifiers.write() = ModifierTable::with_builtins();
        debug!("registry reset to built-ins");
    }

    /// Reserve an id for a new signal kind
    pub fn register_signal(&self, name: &str, aliases: &[&str]) -> Result<KindId> {
        let id = self.signals.write().register(name, aliases)?;
        debug!("registered signal kind {} as {}", name, id);
        Ok(id)
    }

    /// Add another name for an existing signal kind
    pub fn add_signal_alias(&self, id: KindId, alias: &str) -> Result<()> {
        self.signals.write().alias(id, alias)
    }

    pub fn signal_id(&self, name: &str) -> Option<KindId> {
        self.signals.read().id(name)
    }

    pub fn signal_name(&self, id: KindId) -> Option<String> {
        self.signals.read().name(id).map(str::to_string)
    }

    pub fn has_signal(&self, id: KindId) -> bool {
        self.signals.read().name(id).is_some()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.read().names.len()
    }

    /// Reserve an id for a new trigger kind
    pub fn register_trigger(&self, name: &str, aliases: &[&str]) -> Result<KindId> {
        let id = self.triggers.write().register(name, aliases)?;
        debug!("registered trigger kind {} as {}", name, id);
        Ok(id)
    }

    pub fn add_trigger_alias(&self, id: KindId, alias: &str) -> Result<()> {
        self.triggers.write().alias(id, alias)
    }

    pub fn trigger_id(&self, name: &str) -> Option<KindId> {
        self.triggers.read().id(name)
    }

    pub fn trigger_name(&self, id: KindId) -> Option<String> {
        self.triggers.read().name(id).map(str::to_string)
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.read().names.len()
    }

    /// Name a modifier bit set. Names are case-insensitive.
    pub fn register_modifier(&self, name: &str, bits: Modifiers, aliases: &[&str]) -> Result<()> {
        let key = name.to_lowercase();
        let mut table = self.modifiers.write();
        if key.is_empty() || table.lookup.contains_key(&key) {
            return Err(Error::InvalidArgument(format!(
                "modifier name unavailable: {name:?}"
            )));
        }
        table.names.try_reserve(1)?;
        table.lookup.try_reserve(aliases.len() + 1)?;
        table.names.push((name.to_string(), bits));
        table.lookup.insert(key, bits);
        for alias in aliases {
            table.lookup.insert(alias.to_lowercase(), bits);
        }
        Ok(())
    }

    /// Look up modifier bits by name or alias
    pub fn modifier(&self, name: &str) -> Option<Modifiers> {
        self.modifiers.read().lookup.get(&name.to_lowercase()).copied()
    }

    /// The primary name of an exact modifier bit set
    pub fn modifier_name(&self, bits: Modifiers) -> Option<String> {
        self.modifiers
            .read()
            .names
            .iter()
            .find(|(_, b)| *b == bits)
            .map(|(name, _)| name.clone())
    }

    /// Declare that key `code` is a modifier key for `bits`.
    ///
    /// Key signals for that code then set or clear `bits` in the live
    /// modifier state when dispatched.
    pub fn map_modifier_key(&self, code: u32, bits: Modifiers) -> Result<()> {
        let mut table = self.modifiers.write();
        table.keys.try_reserve(1)?;
        table.keys.insert(code, bits);
        Ok(())
    }

    pub fn unmap_modifier_key(&self, code: u32) {
        self.modifiers.write().keys.remove(&code);
    }

    /// The modifier bits key `code` controls, if it is a modifier key
    pub fn modifier_for_key(&self, code: u32) -> Option<Modifiers> {
        self.modifiers.read().keys.get(&code).copied()
    }

    /// The key codes mapped to any bit in `bits`
    pub fn keys_for_modifier(&self, bits: Modifiers) -> Vec<u32> {
        let mut codes: Vec<u32> = self
            .modifiers
            .read()
            .keys
            .iter()
            .filter(|(_, b)| b.intersects(bits))
            .map(|(code, _)| *code)
            .collect();
        codes.sort_unstable();
        codes
    }
}
