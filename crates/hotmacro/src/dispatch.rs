//! The dispatch router.
//!
//! Every signal kind gets its own table mapping a modifier filter and a
//! discriminator to an ordered set of receivers, plus a generic list that
//! fires for every signal of that kind. A cross-type generic list fires for
//! every signal of every kind.
//!
//! For a signal with discriminator `d` under live modifiers `m`, receivers are
//! invoked group by group:
//!
//! 1. `(m, d)`
//! 2. `(m, any)`
//! 3. `(any, d)`, when `d` is not the wildcard
//! 4. the kind's generic list
//! 5. the cross-type generic list
//!
//! A receiver that returns `true` blocks the signal and stops the rest of its
//! own group; later groups still run. The dispatch result is true if any
//! group blocked.
//!
//! Tables sit behind a read/write lock with a bounded wait. Mutations wait
//! for in-flight dispatch passes, so once `unregister` returns the receiver
//! is never invoked again. A dispatch that cannot take the lock in time falls
//! back to the last published snapshot of the tables; mutations still in
//! progress are then not visible to it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::modifier::{ModifierState, Modifiers};
use crate::registry::{KindId, Registry};
use crate::signal::{Discriminator, Signal};

/// Callback invoked for a routed signal; returns true to block it.
pub type ReceiverCallback = Arc<dyn Fn(&Signal, Modifiers) -> bool + Send + Sync>;

/// Identity of a receiver, used for deduplication and removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(u64);

impl ReceiverId {
    /// Allocate a fresh, process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ReceiverId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receiver-{}", self.0)
    }
}

/// An identity plus the callback to run when a signal is routed to it.
#[derive(Clone)]
pub struct Receiver {
    id: ReceiverId,
    callback: ReceiverCallback,
}

impl Receiver {
    /// Create a receiver with a fresh id
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Signal, Modifiers) -> bool + Send + Sync + 'static,
    {
        Self::with_id(ReceiverId::next(), callback)
    }

    /// Create a receiver with an existing id, e.g. to add it to more buckets
    pub fn with_id<F>(id: ReceiverId, callback: F) -> Self
    where
        F: Fn(&Signal, Modifiers) -> bool + Send + Sync + 'static,
    {
        Self {
            id,
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> ReceiverId {
        self.id
    }

    /// Invoke the callback directly
    pub fn receive(&self, signal: &Signal, mods: Modifiers) -> bool {
        (self.callback)(signal, mods)
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").field("id", &self.id).finish()
    }
}

/// A registered receiver. The same slot is shared by every bucket the
/// receiver sits in, so killing it silences all of them at once.
struct Slot {
    receiver: Receiver,
    alive: AtomicBool,
}

impl Slot {
    fn new(receiver: Receiver) -> Self {
        Self {
            receiver,
            alive: AtomicBool::new(true),
        }
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Where a receiver was inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Keyed {
        kind: KindId,
        mods: Modifiers,
        disc: Discriminator,
    },
    KindGeneric(KindId),
    Generic,
}

#[derive(Clone)]
struct Membership {
    slot: Arc<Slot>,
    buckets: Vec<Bucket>,
}

type SlotList = Vec<Arc<Slot>>;

#[derive(Clone, Default)]
struct KindTable {
    keyed: HashMap<Modifiers, HashMap<Discriminator, SlotList>>,
    generic: SlotList,
}

impl KindTable {
    fn is_empty(&self) -> bool {
        self.keyed.is_empty() && self.generic.is_empty()
    }
}

#[derive(Clone, Default)]
struct Tables {
    kinds: HashMap<KindId, KindTable>,
    generic: SlotList,
    index: HashMap<ReceiverId, Membership>,
}

/// Invoke live receivers in order until one blocks.
fn fire(list: Option<&SlotList>, signal: &Signal, mods: Modifiers) -> bool {
    let Some(list) = list else {
        return false;
    };
    for slot in list {
        if slot.is_alive() && slot.receiver.receive(signal, mods) {
            trace!("{} blocked {:?}", slot.receiver.id, signal.kind());
            return true;
        }
    }
    false
}

impl Tables {
    fn route(&self, signal: &Signal, mods: Modifiers) -> bool {
        let disc = signal.discriminator();
        let mut blocked = false;

        if let Some(table) = self.kinds.get(&signal.kind()) {
            if !mods.is_any() {
                if let Some(by_disc) = table.keyed.get(&mods) {
                    if disc.is_some() {
                        blocked |= fire(by_disc.get(&disc), signal, mods);
                    }
                    blocked |= fire(by_disc.get(&None), signal, mods);
                }
            }
            if disc.is_some() {
                if let Some(by_disc) = table.keyed.get(&Modifiers::ANY) {
                    blocked |= fire(by_disc.get(&disc), signal, mods);
                }
            }
            blocked |= fire(Some(&table.generic), signal, mods);
        }

        blocked |= fire(Some(&self.generic), signal, mods);
        blocked
    }

    /// Insert `receiver` into `bucket`. Returns false if it was already there.
    ///
    /// All growth is reserved up front, so an allocation failure leaves the
    /// tables as they were apart from empty containers, which are pruned.
    fn insert(&mut self, bucket: Bucket, receiver: Receiver) -> Result<bool> {
        let id = receiver.id();
        if let Some(membership) = self.index.get(&id) {
            if membership.buckets.contains(&bucket) {
                return Ok(false);
            }
        }

        self.index.try_reserve(1)?;
        let result = self.insert_slot(bucket, receiver);
        if result.is_err() {
            self.prune(bucket);
        }
        result.map(|()| true)
    }

    fn insert_slot(&mut self, bucket: Bucket, receiver: Receiver) -> Result<()> {
        let id = receiver.id();
        let slot = match self.index.get(&id) {
            Some(membership) => membership.slot.clone(),
            None => Arc::new(Slot::new(receiver)),
        };
        let mut buckets = self
            .index
            .get(&id)
            .map(|m| m.buckets.clone())
            .unwrap_or_default();
        buckets.try_reserve(1)?;

        let list = self.list_for_insert(bucket)?;
        list.try_reserve(1)?;
        list.push(slot.clone());

        buckets.push(bucket);
        self.index.insert(id, Membership { slot, buckets });
        Ok(())
    }

    fn list_for_insert(&mut self, bucket: Bucket) -> Result<&mut SlotList> {
        match bucket {
            Bucket::Generic => Ok(&mut self.generic),
            Bucket::KindGeneric(kind) => {
                self.kinds.try_reserve(1)?;
                Ok(&mut self.kinds.entry(kind).or_default().generic)
            }
            Bucket::Keyed { kind, mods, disc } => {
                self.kinds.try_reserve(1)?;
                let table = self.kinds.entry(kind).or_default();
                table.keyed.try_reserve(1)?;
                let by_disc = table.keyed.entry(mods).or_default();
                by_disc.try_reserve(1)?;
                Ok(by_disc.entry(disc).or_default())
            }
        }
    }

    fn list_mut(&mut self, bucket: Bucket) -> Option<&mut SlotList> {
        match bucket {
            Bucket::Generic => Some(&mut self.generic),
            Bucket::KindGeneric(kind) => self.kinds.get_mut(&kind).map(|t| &mut t.generic),
            Bucket::Keyed { kind, mods, disc } => self
                .kinds
                .get_mut(&kind)?
                .keyed
                .get_mut(&mods)?
                .get_mut(&disc),
        }
    }

    /// Drop empty containers along the path to `bucket`
    fn prune(&mut self, bucket: Bucket) {
        let kind = match bucket {
            Bucket::Generic => return,
            Bucket::KindGeneric(kind) => kind,
            Bucket::Keyed { kind, mods, disc } => {
                if let Some(table) = self.kinds.get_mut(&kind) {
                    if let Some(by_disc) = table.keyed.get_mut(&mods) {
                        if by_disc.get(&disc).is_some_and(Vec::is_empty) {
                            by_disc.remove(&disc);
                        }
                        if by_disc.is_empty() {
                            table.keyed.remove(&mods);
                        }
                    }
                }
                kind
            }
        };
        if self.kinds.get(&kind).is_some_and(KindTable::is_empty) {
            self.kinds.remove(&kind);
        }
    }

    /// Remove a receiver from every bucket it was inserted into.
    fn remove(&mut self, id: ReceiverId) -> bool {
        let Some(membership) = self.index.remove(&id) else {
            return false;
        };
        membership.slot.kill();
        for bucket in membership.buckets {
            if let Some(list) = self.list_mut(bucket) {
                list.retain(|slot| slot.receiver.id != id);
            }
            self.prune(bucket);
        }
        true
    }

    fn clear(&mut self) {
        for membership in self.index.values() {
            membership.slot.kill();
        }
        *self = Tables::default();
    }
}

fn bucket_for(
    registry: &Registry,
    kind: KindId,
    trigger: Option<&Signal>,
    mods: Modifiers,
) -> Result<Bucket> {
    if !registry.has_signal(kind) {
        return Err(Error::InvalidArgument(format!(
            "unknown signal kind {kind}"
        )));
    }
    if let Some(trigger) = trigger {
        if trigger.kind() != kind {
            return Err(Error::InvalidArgument(format!(
                "trigger signal of kind {} registered under kind {kind}",
                trigger.kind()
            )));
        }
    }
    let disc = trigger.and_then(Signal::discriminator);
    if disc.is_none() && mods.is_any() {
        Ok(Bucket::KindGeneric(kind))
    } else {
        Ok(Bucket::Keyed { kind, mods, disc })
    }
}

thread_local! {
    /// Routers with a dispatch pass running on this thread
    static ACTIVE_PASSES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a router as dispatching on the current thread for the guard's life.
struct DispatchPass {
    key: usize,
}

impl DispatchPass {
    fn enter(router: &Router) -> Self {
        let key = router as *const Router as usize;
        ACTIVE_PASSES.with(|passes| passes.borrow_mut().push(key));
        Self { key }
    }

    fn is_active(router: &Router) -> bool {
        let key = router as *const Router as usize;
        ACTIVE_PASSES.with(|passes| passes.borrow().contains(&key))
    }
}

impl Drop for DispatchPass {
    fn drop(&mut self) {
        ACTIVE_PASSES.with(|passes| {
            let mut passes = passes.borrow_mut();
            if let Some(pos) = passes.iter().rposition(|k| *k == self.key) {
                passes.remove(pos);
            }
        });
    }
}

/// A point-in-time view of router bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterStats {
    /// Registered receivers (each counted once)
    pub receivers: usize,
    /// Signal kinds with a dedicated table
    pub kinds: usize,
    /// Dispatch passes that fell back to the snapshot
    pub fallback_dispatches: u64,
    /// Removals waiting for the table lock
    pub deferred_removals: usize,
}

/// Several mutations applied under one hold of the table lock.
///
/// Changes become visible to dispatch when the batch ends. Changes made
/// before an error are kept.
pub struct Batch<'a> {
    tables: &'a mut Tables,
    registry: &'a Registry,
}

impl Batch<'_> {
    /// See [`Router::register`]
    pub fn register(
        &mut self,
        kind: KindId,
        trigger: Option<&Signal>,
        mods: Modifiers,
        receiver: Receiver,
    ) -> Result<()> {
        let bucket = bucket_for(self.registry, kind, trigger, mods)?;
        let id = receiver.id();
        if self.tables.insert(bucket, receiver)? {
            debug!("registered {} in {:?}", id, bucket);
        }
        Ok(())
    }

    /// See [`Router::register_generic`]
    pub fn register_generic(&mut self, receiver: Receiver) -> Result<()> {
        let id = receiver.id();
        if self.tables.insert(Bucket::Generic, receiver)? {
            debug!("registered {} for every signal kind", id);
        }
        Ok(())
    }

    /// See [`Router::unregister`]
    pub fn unregister(&mut self, id: ReceiverId) -> bool {
        self.tables.remove(id)
    }

    pub fn contains(&self, id: ReceiverId) -> bool {
        self.tables.index.contains_key(&id)
    }
}

/// Routes signals to registered receivers.
pub struct Router {
    registry: Arc<Registry>,
    modifiers: Arc<ModifierState>,
    config: EngineConfig,
    tables: RwLock<Tables>,
    snapshot: ArcSwap<Tables>,
    deferred: Mutex<Vec<ReceiverId>>,
    fallbacks: AtomicU64,
}

impl Router {
    /// A router with its own modifier state and default configuration
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_parts(
            registry,
            Arc::new(ModifierState::default()),
            EngineConfig::default(),
        )
    }

    /// A router sharing `modifiers` with other components
    pub fn with_parts(
        registry: Arc<Registry>,
        modifiers: Arc<ModifierState>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            modifiers,
            config,
            tables: RwLock::new(Tables::default()),
            snapshot: ArcSwap::from_pointee(Tables::default()),
            deferred: Mutex::new(Vec::new()),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn modifiers(&self) -> &Arc<ModifierState> {
        &self.modifiers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register `receiver` for signals of `kind`.
    ///
    /// The discriminator is taken from `trigger`; `None` means any. With a
    /// wildcard discriminator and `Modifiers::ANY` the receiver joins the
    /// kind's generic list. Registering the same receiver twice in one bucket
    /// is a no-op.
    ///
    /// Each call republishes a full copy of the tables, so registering many
    /// receivers one call at a time is quadratic. Use [`Router::batch`] for
    /// bulk registration.
    pub fn register(
        &self,
        kind: KindId,
        trigger: Option<&Signal>,
        mods: Modifiers,
        receiver: Receiver,
    ) -> Result<()> {
        self.batch(|batch| batch.register(kind, trigger, mods, receiver))
    }

    /// Register `receiver` for every signal of every kind
    pub fn register_generic(&self, receiver: Receiver) -> Result<()> {
        self.batch(|batch| batch.register_generic(receiver))
    }

    /// Remove a receiver from every bucket. Never fails.
    ///
    /// The receiver is silenced immediately. If the table lock cannot be
    /// taken in time (or the caller is itself inside a dispatch pass of this
    /// router) the structural removal is deferred to the next mutation.
    /// Like [`Router::register`], each call republishes the tables.
    pub fn unregister(&self, id: ReceiverId) {
        if let Some(membership) = self.snapshot.load().index.get(&id) {
            membership.slot.kill();
        }

        match self.write() {
            Ok(mut tables) => {
                self.apply_deferred(&mut tables);
                if tables.remove(id) {
                    debug!("unregistered {}", id);
                }
                self.publish(&tables);
            }
            Err(e) => {
                warn!("deferring removal of {}: {}", id, e);
                self.deferred.lock().push(id);
            }
        }
    }

    /// Apply several mutations under one hold of the table lock. The tables
    /// are published once, when `f` returns.
    pub fn batch<T>(&self, f: impl FnOnce(&mut Batch<'_>) -> Result<T>) -> Result<T> {
        let mut tables = self.write()?;
        self.apply_deferred(&mut tables);
        let result = f(&mut Batch {
            tables: &mut tables,
            registry: &self.registry,
        });
        self.publish(&tables);
        result
    }

    /// Remove every receiver
    pub fn clear(&self) -> Result<()> {
        let mut tables = self.write()?;
        tables.clear();
        self.deferred.lock().clear();
        self.publish(&tables);
        debug!("router cleared");
        Ok(())
    }

    /// Is `id` registered? Reads the published snapshot.
    pub fn contains(&self, id: ReceiverId) -> bool {
        self.snapshot
            .load()
            .index
            .get(&id)
            .is_some_and(|m| m.slot.is_alive())
    }

    pub fn stats(&self) -> RouterStats {
        let snapshot = self.snapshot.load();
        RouterStats {
            receivers: snapshot.index.len(),
            kinds: snapshot.kinds.len(),
            fallback_dispatches: self.fallbacks.load(Ordering::Relaxed),
            deferred_removals: self.deferred.lock().len(),
        }
    }

    /// Dispatch a signal under the live modifier state.
    ///
    /// The signal first adjusts the shared modifier state (a modifier key
    /// press sets its bit, for instance); matching then uses the adjusted set.
    /// Returns true if a receiver blocked the signal.
    pub fn dispatch(&self, signal: &Signal) -> bool {
        let mods = self
            .modifiers
            .update(|mods| signal.modify(mods, &self.registry));
        self.route(signal, mods)
    }

    /// Route a signal under explicit modifiers, leaving the shared state alone.
    pub fn route(&self, signal: &Signal, mods: Modifiers) -> bool {
        let reentrant = DispatchPass::is_active(self);
        let _pass = DispatchPass::enter(self);
        trace!("dispatch {:?} {:?} under {:?}", signal.kind(), signal.discriminator(), mods);

        let guard = if reentrant {
            self.tables.try_read_recursive_for(self.config.lock_timeout)
        } else {
            self.tables.try_read_for(self.config.lock_timeout)
        };
        match guard {
            Some(tables) => tables.route(signal, mods),
            None => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "dispatch table lock busy for {:?}, routing on last snapshot",
                    self.config.lock_timeout
                );
                self.snapshot.load_full().route(signal, mods)
            }
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        let timeout = self.config.lock_timeout;
        let guard = if DispatchPass::is_active(self) {
            self.tables.try_write()
        } else {
            self.tables.try_write_for(timeout)
        };
        guard.ok_or_else(|| Error::timeout("dispatch table lock", timeout))
    }

    fn apply_deferred(&self, tables: &mut Tables) {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for id in deferred {
            if tables.remove(id) {
                debug!("applied deferred removal of {}", id);
            }
        }
    }

    fn publish(&self, tables: &Tables) {
        self.snapshot.store(Arc::new(tables.clone()));
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
