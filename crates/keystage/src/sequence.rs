//! Staged sequences: an ordered chain of stages that fires a callback once
//! every stage has matched in order.

use std::fmt;
use std::sync::{Arc, Weak};

use hotmacro::{Error, Modifiers, Receiver, ReceiverId, Result, Router, Signal};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::stage::{BlockPolicy, Stage};

/// Callback run when a sequence completes, with the completing signal
pub type StagedCallback = Arc<dyn Fn(&Signal, Modifiers) + Send + Sync>;

struct Inner {
    stages: Vec<Stage>,
    policy: BlockPolicy,
}

impl Inner {
    fn deactivate(&mut self) {
        for stage in &mut self.stages {
            stage.set_activated(false);
        }
    }

    fn apply_policy(&mut self) {
        let len = self.stages.len();
        for (index, stage) in self.stages.iter_mut().enumerate() {
            if let Some(flag) = self.policy.flag_for(index, len) {
                stage.set_blocking(flag);
            }
        }
    }

    fn check_index(&self, index: usize, len: usize) -> Result<()> {
        if index < len {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "stage index {index} out of range for {} stages",
                self.stages.len()
            )))
        }
    }

    /// Advance the chain on one signal. Returns whether the sequence
    /// completed and which stages matched.
    fn advance(&mut self, signal: &Signal, mods: Modifiers) -> (bool, Vec<bool>) {
        let len = self.stages.len();
        let before: Vec<bool> = self.stages.iter().map(Stage::is_activated).collect();
        let mut matched = vec![false; len];
        let mut complete = false;

        // Last to first, so each stage sees its successor's new state.
        for index in (0..len).rev() {
            let successor_active = index + 1 < len && self.stages[index + 1].is_activated();
            let stage = &mut self.stages[index];
            if before[index] {
                if stage.resembles(signal, mods) {
                    matched[index] = true;
                } else if !successor_active {
                    trace!("stage {} reset", index);
                    stage.set_activated(false);
                }
            } else {
                let eligible = index == 0 || before[index - 1];
                if eligible && stage.matches(signal, mods) {
                    trace!("stage {} activated", index);
                    stage.set_activated(true);
                    matched[index] = true;
                    if index + 1 == len && before[..index].iter().all(|a| *a) {
                        complete = true;
                    }
                }
            }
        }

        if complete {
            self.deactivate();
        }
        (complete, matched)
    }

    fn blocks(&self, matched: &[bool]) -> bool {
        match self.policy {
            BlockPolicy::NoBlock => false,
            BlockPolicy::Unmanaged => self
                .stages
                .iter()
                .zip(matched)
                .any(|(stage, matched)| *matched && stage.blocking()),
            BlockPolicy::BlockFinal => match self.stages.last() {
                Some(last) => last.blocking() && matched.last().copied().unwrap_or(false),
                None => false,
            },
            BlockPolicy::BlockAll => {
                matched.iter().any(|m| *m) && self.stages.iter().all(Stage::blocking)
            }
        }
    }
}

/// An ordered chain of stages with a completion callback.
///
/// A stage activates only once its predecessor is active, so the callback
/// fires only for an unbroken run of matching signals in stage order.
/// Every structural change deactivates the whole chain first.
pub struct Staged {
    inner: Mutex<Inner>,
    callback: StagedCallback,
}

impl Staged {
    /// Create an empty sequence
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Signal, Modifiers) + Send + Sync + 'static,
    {
        Self {
            inner: Mutex::new(Inner {
                stages: Vec::new(),
                policy: BlockPolicy::default(),
            }),
            callback: Arc::new(callback),
        }
    }

    /// Set the initial stages
    pub fn with_stages(self, stages: Vec<Stage>) -> Self {
        self.set_stages(stages);
        self
    }

    /// Set the initial blocking policy
    pub fn with_policy(self, policy: BlockPolicy) -> Self {
        self.set_policy(policy);
        self
    }

    /// Feed one signal through the chain. Returns whether to block it.
    ///
    /// With no stages the callback fires on every signal and nothing blocks.
    pub fn receive(&self, signal: &Signal, mods: Modifiers) -> bool {
        let (complete, blocked) = {
            let mut inner = self.inner.lock();
            if inner.stages.is_empty() {
                (true, false)
            } else {
                let (complete, matched) = inner.advance(signal, mods);
                (complete, inner.blocks(&matched))
            }
        };

        if complete {
            debug!("staged sequence completed on {:?}", signal.kind());
            (self.callback)(signal, mods);
        }
        blocked
    }

    /// Append a stage
    pub fn push(&self, stage: Stage) {
        let mut inner = self.inner.lock();
        inner.deactivate();
        inner.stages.push(stage);
        inner.apply_policy();
    }

    /// Insert a stage before `index`; `index == len` appends
    pub fn insert(&self, index: usize, stage: Stage) -> Result<()> {
        let mut inner = self.inner.lock();
        let len = inner.stages.len();
        inner.check_index(index, len + 1)?;
        inner.deactivate();
        inner.stages.insert(index, stage);
        inner.apply_policy();
        Ok(())
    }

    /// Remove and return the stage at `index`
    pub fn remove(&self, index: usize) -> Result<Stage> {
        let mut inner = self.inner.lock();
        let len = inner.stages.len();
        inner.check_index(index, len)?;
        inner.deactivate();
        let stage = inner.stages.remove(index);
        inner.apply_policy();
        Ok(stage)
    }

    /// Swap in a new stage at `index`, returning the old one
    pub fn replace(&self, index: usize, stage: Stage) -> Result<Stage> {
        let mut inner = self.inner.lock();
        let len = inner.stages.len();
        inner.check_index(index, len)?;
        inner.deactivate();
        let old = std::mem::replace(&mut inner.stages[index], stage);
        inner.apply_policy();
        Ok(old)
    }

    /// Replace every stage
    pub fn set_stages(&self, stages: Vec<Stage>) {
        let mut inner = self.inner.lock();
        inner.deactivate();
        inner.stages = stages;
        inner.deactivate();
        inner.apply_policy();
    }

    /// Remove every stage
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.deactivate();
        inner.stages.clear();
    }

    /// Set the blocking policy, rewriting stage flags unless `Unmanaged`
    pub fn set_policy(&self, policy: BlockPolicy) {
        let mut inner = self.inner.lock();
        inner.policy = policy;
        inner.apply_policy();
    }

    pub fn policy(&self) -> BlockPolicy {
        self.inner.lock().policy
    }

    /// Reset every stage to inactive
    pub fn deactivate(&self) {
        self.inner.lock().deactivate();
    }

    /// Activation state of each stage, first to last
    pub fn activation(&self) -> Vec<bool> {
        self.inner.lock().stages.iter().map(Stage::is_activated).collect()
    }

    /// A copy of the current stages
    pub fn stages(&self) -> Vec<Stage> {
        self.inner.lock().stages.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().stages.is_empty()
    }

    /// A router receiver feeding this sequence. It holds a weak reference
    /// and goes inert once the sequence is dropped.
    pub fn receiver(self: &Arc<Self>) -> Receiver {
        let weak: Weak<Staged> = Arc::downgrade(self);
        Receiver::new(move |signal, mods| {
            weak.upgrade()
                .is_some_and(|staged| staged.receive(signal, mods))
        })
    }

    /// Feed every routed signal into this sequence
    pub fn attach(self: &Arc<Self>, router: &Router) -> Result<ReceiverId> {
        let receiver = self.receiver();
        let id = receiver.id();
        router.register_generic(receiver)?;
        debug!("staged sequence attached as {}", id);
        Ok(id)
    }
}

impl fmt::Debug for Staged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Staged")
            .field("stages", &inner.stages)
            .field("policy", &inner.policy)
            .finish()
    }
}
