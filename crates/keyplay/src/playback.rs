//! Macro playback.
//!
//! A [`Macro`] replays a fixed list of signals through a [`Sender`] each time
//! it is triggered. Playback runs on worker threads, at most `thread_max` at a
//! time, and can be paused, interrupted or disabled from any thread.
//!
//! Workers check the interrupt state before every signal and after every
//! pass. Structural changes (replacing the signal list, interrupting all
//! playback) disable the macro, cancel the current [`CancelToken`] and wait
//! for workers to drain. A worker stuck in a send that ignores its token is
//! abandoned once the drain times out: the epoch moves on, and the stale
//! worker exits at its next checkpoint without touching the counters.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use hotmacro::{
    CancelToken, Error, KindId, Modifiers, Receiver, ReceiverId, Result, Router, Sender, Signal,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::budget::{Permit, WorkerBudget};
use crate::config::PlaybackConfig;

/// Callback for failed sends, with the macro name
pub type ErrorCallback = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Control state of a macro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterruptState {
    /// Play normally
    Continue,
    /// Hold workers between signals; resumes on its own after a bounded wait
    Pause,
    /// Cancel one running or queued trigger, then continue
    Interrupt,
    /// Cancel everything and wait for workers to drain, then continue
    InterruptAll,
    /// No new playback until re-enabled
    Disable,
}

/// A point-in-time view of a macro
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroStats {
    pub state: InterruptState,
    /// Workers of the current epoch still running
    pub running: usize,
    /// Triggers waiting for a worker
    pub queued: u32,
    /// Passes played to the end
    pub passes: u64,
    /// Passes aborted by a send failure
    pub failures: u64,
    /// Workers given up on after a drain timeout
    pub abandoned: u64,
}

struct State {
    interrupt: InterruptState,
    running: usize,
    queued: u32,
    signals: Arc<[Signal]>,
    epoch: u64,
    token: CancelToken,
    passes: u64,
    failures: u64,
    abandoned: u64,
}

impl State {
    /// Replace a cancelled token so new workers start clean
    fn refresh_token(&mut self) {
        if self.token.is_cancelled() {
            self.token = CancelToken::new();
        }
    }
}

/// What a worker should do at a checkpoint
enum Gate {
    Proceed,
    Interrupted,
    Exit,
}

enum Pass {
    Completed,
    Interrupted,
    Failed(Error),
    Stopped,
}

struct Shared {
    name: String,
    sender: Arc<dyn Sender>,
    config: PlaybackConfig,
    thread_max: usize,
    budget: Arc<WorkerBudget>,
    on_error: Option<ErrorCallback>,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn trigger(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if matches!(
            state.interrupt,
            InterruptState::Disable | InterruptState::InterruptAll
        ) {
            trace!("macro {} ignoring trigger while {:?}", self.name, state.interrupt);
            return self.config.blocking;
        }

        state.queued = state.queued.saturating_add(1);
        if state.running < self.thread_max {
            match self.budget.try_acquire() {
                Some(permit) => self.spawn(&mut state, permit),
                None => debug!("macro {}: worker budget exhausted, trigger queued", self.name),
            }
        }
        self.config.blocking
    }

    fn spawn(self: &Arc<Self>, state: &mut State, permit: Permit) {
        let shared = self.clone();
        let epoch = state.epoch;
        let token = state.token.clone();
        let spawned = thread::Builder::new()
            .name(format!("keyplay-{}", self.name))
            .spawn(move || shared.run(epoch, token, permit));
        match spawned {
            Ok(_) => {
                state.running += 1;
                debug!("macro {} started worker ({} running)", self.name, state.running);
            }
            Err(e) => error!("macro {}: failed to spawn worker: {}", self.name, e),
        }
    }

    fn run(self: Arc<Self>, epoch: u64, mut token: CancelToken, _permit: Permit) {
        while let Some(signals) = self.next_pass(epoch, &mut token) {
            match self.play(&signals, epoch, &token) {
                Pass::Completed => {
                    let mut state = self.state.lock();
                    if state.epoch == epoch {
                        state.passes += 1;
                    }
                }
                Pass::Interrupted => debug!("macro {}: pass interrupted", self.name),
                Pass::Failed(e) => {
                    error!("macro {}: send failed, pass aborted: {}", self.name, e);
                    {
                        let mut state = self.state.lock();
                        if state.epoch == epoch {
                            state.failures += 1;
                        }
                    }
                    if let Some(on_error) = &self.on_error {
                        on_error(&self.name, &e);
                    }
                }
                Pass::Stopped => debug!("macro {}: pass stopped", self.name),
            }
        }
    }

    /// Claim the next pass, or retire the worker. Both happen under one lock
    /// hold so a concurrent trigger either sees this worker or none.
    fn next_pass(&self, epoch: u64, token: &mut CancelToken) -> Option<Arc<[Signal]>> {
        let mut state = self.state.lock();
        loop {
            match self.gate(&mut state, epoch, token) {
                Gate::Proceed => break,
                Gate::Interrupted => {
                    state.queued = state.queued.saturating_sub(1);
                }
                Gate::Exit if self.adopt(&state, epoch, token) => {}
                Gate::Exit => {
                    self.retire(&mut state, epoch);
                    return None;
                }
            }
        }

        if state.queued > 0 {
            state.queued -= 1;
        } else if !(self.config.sticky && state.running == 1) {
            self.retire(&mut state, epoch);
            return None;
        }
        Some(state.signals.clone())
    }

    fn play(&self, signals: &[Signal], epoch: u64, token: &CancelToken) -> Pass {
        for signal in signals {
            let gate = {
                let mut state = self.state.lock();
                self.gate(&mut state, epoch, token)
            };
            match gate {
                Gate::Proceed => {}
                Gate::Interrupted => return Pass::Interrupted,
                Gate::Exit => return Pass::Stopped,
            }
            if let Err(e) = self.sender.send_cancellable(signal, token) {
                return Pass::Failed(e);
            }
        }
        Pass::Completed
    }

    /// A checkpoint. Pause waits here, bounded by the pause retries.
    fn gate(&self, state: &mut MutexGuard<'_, State>, epoch: u64, token: &CancelToken) -> Gate {
        let mut waits = 0;
        loop {
            if state.epoch != epoch || token.is_cancelled() {
                return Gate::Exit;
            }
            match state.interrupt {
                InterruptState::Continue => return Gate::Proceed,
                InterruptState::Pause => {
                    if waits >= self.config.pause_retries {
                        warn!("macro {}: pause expired, resuming", self.name);
                        state.interrupt = InterruptState::Continue;
                        self.changed.notify_all();
                        return Gate::Proceed;
                    }
                    waits += 1;
                    self.changed.wait_for(state, self.config.pause_interval);
                }
                InterruptState::Interrupt => {
                    info!("macro {}: interrupt taken", self.name);
                    state.interrupt = InterruptState::Continue;
                    self.changed.notify_all();
                    return Gate::Interrupted;
                }
                InterruptState::InterruptAll | InterruptState::Disable => return Gate::Exit,
            }
        }
    }

    /// Carry a worker across a disable and re-enable. Triggers accepted after
    /// the re-enable were queued against this worker, so it takes the fresh
    /// token and keeps playing instead of exiting.
    fn adopt(&self, state: &State, epoch: u64, token: &mut CancelToken) -> bool {
        let resumable = state.epoch == epoch
            && state.queued > 0
            && token.is_cancelled()
            && !state.token.is_cancelled()
            && matches!(
                state.interrupt,
                InterruptState::Continue | InterruptState::Pause
            );
        if resumable {
            debug!("macro {}: worker resumed after re-enable", self.name);
            *token = state.token.clone();
        }
        resumable
    }

    /// Count a worker out. Stale workers were already written off.
    fn retire(&self, state: &mut State, epoch: u64) {
        if state.epoch == epoch {
            state.running = state.running.saturating_sub(1);
            debug!("macro {} worker exited ({} running)", self.name, state.running);
            self.changed.notify_all();
        } else {
            debug!("macro {}: abandoned worker exited", self.name);
        }
    }

    /// Wait for current workers to finish; abandon them on timeout.
    fn drain(&self, state: &mut MutexGuard<'_, State>) -> Result<()> {
        let timeout = self.config.drain_timeout;
        let deadline = Instant::now() + timeout;
        while state.running > 0 {
            if self.changed.wait_until(state, deadline).timed_out() && state.running > 0 {
                let stuck = state.running;
                warn!(
                    "macro {}: abandoning {} worker(s) after {:?}",
                    self.name, stuck, timeout
                );
                state.abandoned += stuck as u64;
                state.running = 0;
                state.epoch += 1;
                return Err(Error::timeout(
                    format!("draining macro {}", self.name),
                    timeout,
                ));
            }
        }
        Ok(())
    }

    /// Stop playback and cancel in-flight sends. Does not wait.
    fn stop(&self, state: &mut State, next: InterruptState) {
        state.interrupt = next;
        state.queued = 0;
        state.token.cancel();
        self.changed.notify_all();
    }
}

/// A list of signals replayed on demand.
///
/// Created disabled; call [`Macro::enable`] to start accepting triggers.
/// Dropping a macro disables it and waits (bounded) for its workers.
pub struct Macro {
    shared: Arc<Shared>,
}

impl Macro {
    /// Start building a macro that plays through `sender`
    pub fn builder(name: impl Into<String>, sender: impl Sender + 'static) -> MacroBuilder {
        MacroBuilder {
            name: name.into(),
            sender: Arc::new(sender),
            signals: Vec::new(),
            config: PlaybackConfig::default(),
            budget: None,
            on_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.shared.config
    }

    /// Accept triggers again
    pub fn enable(&self) {
        let mut state = self.shared.state.lock();
        if state.interrupt == InterruptState::InterruptAll {
            debug!("macro {}: enable ignored during interrupt-all", self.shared.name);
            return;
        }
        state.refresh_token();
        state.interrupt = InterruptState::Continue;
        self.shared.changed.notify_all();
        info!("macro {} enabled", self.shared.name);
    }

    /// Stop accepting triggers and tell running workers to exit. Does not
    /// wait for them.
    pub fn disable(&self) {
        let mut state = self.shared.state.lock();
        self.shared.stop(&mut state, InterruptState::Disable);
        info!("macro {} disabled", self.shared.name);
    }

    pub fn is_enabled(&self) -> bool {
        self.state() != InterruptState::Disable
    }

    pub fn state(&self) -> InterruptState {
        self.shared.state.lock().interrupt
    }

    /// Queue one playback pass. Returns the configured blocking flag.
    pub fn trigger(&self) -> bool {
        self.shared.trigger()
    }

    /// Replace the signal list.
    ///
    /// Playback is stopped and drained first, so no pass ever sees a mix of
    /// old and new signals. If workers do not drain in time they are
    /// abandoned, the list is installed anyway and a timeout is returned.
    pub fn set_signals(&self, signals: Vec<Signal>) -> Result<()> {
        let mut state = self.shared.state.lock();
        let previous = state.interrupt;
        self.shared.stop(&mut state, InterruptState::Disable);
        let drained = self.shared.drain(&mut state);

        state.signals = Arc::from(signals);
        state.refresh_token();
        state.interrupt = match previous {
            InterruptState::Continue | InterruptState::Pause => previous,
            InterruptState::Interrupt | InterruptState::InterruptAll => InterruptState::Continue,
            InterruptState::Disable => InterruptState::Disable,
        };
        self.shared.changed.notify_all();
        debug!(
            "macro {}: installed {} signals",
            self.shared.name,
            state.signals.len()
        );
        drained
    }

    /// The current signal list
    pub fn signals(&self) -> Arc<[Signal]> {
        self.shared.state.lock().signals.clone()
    }

    /// Change how playback proceeds.
    ///
    /// `InterruptAll` blocks until workers drain (or are abandoned), then
    /// returns to `Continue`. `Interrupt` with no worker running drops one
    /// queued trigger; otherwise the first worker to reach a checkpoint
    /// abandons its pass. `Continue` and `Pause` have no effect while an
    /// interrupt-all is in progress, and `Pause` none while disabled.
    pub fn interrupt(&self, kind: InterruptState) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.interrupt == InterruptState::InterruptAll && kind != InterruptState::Disable {
            debug!("macro {}: {:?} ignored during interrupt-all", shared.name, kind);
            return Ok(());
        }

        match kind {
            InterruptState::Continue => {
                drop(state);
                self.enable();
            }
            InterruptState::Pause => {
                if state.interrupt != InterruptState::Disable {
                    state.interrupt = InterruptState::Pause;
                    shared.changed.notify_all();
                    info!("macro {} paused", shared.name);
                }
            }
            InterruptState::Interrupt => {
                if state.interrupt == InterruptState::Disable {
                    return Ok(());
                }
                if state.running == 0 {
                    state.queued = state.queued.saturating_sub(1);
                    debug!("macro {}: dropped a queued trigger", shared.name);
                } else {
                    state.interrupt = InterruptState::Interrupt;
                    shared.changed.notify_all();
                }
            }
            InterruptState::InterruptAll => {
                if state.interrupt == InterruptState::Disable {
                    return Ok(());
                }
                info!("macro {}: interrupting all playback", shared.name);
                shared.stop(&mut state, InterruptState::InterruptAll);
                let drained = shared.drain(&mut state);
                state.refresh_token();
                state.interrupt = InterruptState::Continue;
                shared.changed.notify_all();
                return drained;
            }
            InterruptState::Disable => {
                drop(state);
                self.disable();
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> MacroStats {
        let state = self.shared.state.lock();
        MacroStats {
            state: state.interrupt,
            running: state.running,
            queued: state.queued,
            passes: state.passes,
            failures: state.failures,
            abandoned: state.abandoned,
        }
    }

    /// A router receiver that triggers this macro. It holds a weak reference
    /// and goes inert once the macro is dropped.
    pub fn receiver(&self) -> Receiver {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        Receiver::new(move |_, _| weak.upgrade().is_some_and(|shared| shared.trigger()))
    }

    /// Trigger this macro whenever the router sees a matching signal
    pub fn attach(
        &self,
        router: &Router,
        kind: KindId,
        trigger: Option<&Signal>,
        mods: Modifiers,
    ) -> Result<ReceiverId> {
        let receiver = self.receiver();
        let id = receiver.id();
        router.register(kind, trigger, mods, receiver)?;
        debug!("macro {} attached as {}", self.shared.name, id);
        Ok(id)
    }
}

impl Drop for Macro {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        self.shared.stop(&mut state, InterruptState::Disable);
        if let Err(e) = self.shared.drain(&mut state) {
            warn!("macro {} dropped with workers still running: {}", self.shared.name, e);
        }
    }
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macro")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builder for [`Macro`]
pub struct MacroBuilder {
    name: String,
    sender: Arc<dyn Sender>,
    signals: Vec<Signal>,
    config: PlaybackConfig,
    budget: Option<Arc<WorkerBudget>>,
    on_error: Option<ErrorCallback>,
}

impl MacroBuilder {
    pub fn with_signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_config(mut self, config: PlaybackConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a worker budget with other macros
    pub fn with_budget(mut self, budget: Arc<WorkerBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Report send failures to `f`
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Build the macro, disabled
    pub fn build(self) -> Macro {
        let thread_max = self.config.effective_thread_max();
        if thread_max != self.config.thread_max {
            warn!(
                "macro {}: thread_max {} clamped to {}",
                self.name, self.config.thread_max, thread_max
            );
        }
        Macro {
            shared: Arc::new(Shared {
                name: self.name,
                sender: self.sender,
                thread_max,
                config: self.config,
                budget: self.budget.unwrap_or_default(),
                on_error: self.on_error,
                state: Mutex::new(State {
                    interrupt: InterruptState::Disable,
                    running: 0,
                    queued: 0,
                    signals: Arc::from(self.signals),
                    epoch: 0,
                    token: CancelToken::new(),
                    passes: 0,
                    failures: 0,
                    abandoned: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotmacro::{Paced, Polarity, Registry};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::ThreadId;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn key(code: u32) -> Signal {
        Signal::key(code, Polarity::Both)
    }

    /// Records every signal with the sending thread. Delays are performed as
    /// cancellable waits; keys take `pace` each.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(ThreadId, Signal)>>,
        pace: Duration,
        fail_on: Option<u32>,
    }

    impl Recorder {
        fn paced(pace: Duration) -> Self {
            Self {
                pace,
                ..Self::default()
            }
        }

        fn codes(&self) -> Vec<u32> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, s)| s.discriminator())
                .collect()
        }
    }

    impl Sender for Recorder {
        fn send(&self, signal: &Signal) -> Result<()> {
            self.send_cancellable(signal, &CancelToken::new())
        }

        fn send_cancellable(&self, signal: &Signal, cancel: &CancelToken) -> Result<()> {
            if signal.discriminator().is_some() && signal.discriminator() == self.fail_on {
                return Err(Error::Send("device unplugged".to_string()));
            }
            self.sent.lock().push((thread::current().id(), signal.clone()));
            if let hotmacro::Payload::Delay(d) = signal.payload() {
                cancel.wait_timeout(*d);
            } else if !self.pace.is_zero() {
                thread::sleep(self.pace);
            }
            Ok(())
        }
    }

    /// Blocks in `send` and ignores cancellation
    struct Stuck {
        hold: Duration,
        entered: AtomicUsize,
    }

    impl Sender for Stuck {
        fn send(&self, _: &Signal) -> Result<()> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.hold);
            Ok(())
        }
    }

    fn enabled(recorder: &Arc<Recorder>, signals: Vec<Signal>, config: PlaybackConfig) -> Macro {
        let m = Macro::builder("test", recorder.clone())
            .with_signals(signals)
            .with_config(config)
            .build();
        m.enable();
        m
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_idle(m: &Macro) {
        wait_for("macro to go idle", || {
            let stats = m.stats();
            stats.running == 0 && stats.queued == 0
        });
    }

    #[test]
    fn test_starts_disabled_and_ignores_triggers() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = Macro::builder("idle", recorder.clone())
            .with_signals(vec![key(1)])
            .with_config(PlaybackConfig::default().with_blocking(true))
            .build();

        assert_eq!(m.state(), InterruptState::Disable);
        assert!(!m.is_enabled());
        assert!(m.trigger());
        let stats = m.stats();
        assert_eq!((stats.running, stats.queued), (0, 0));

        m.enable();
        m.trigger();
        wait_idle(&m);
        assert_eq!(recorder.codes(), vec![1]);
        assert_eq!(m.stats().passes, 1);
    }

    #[test]
    fn test_passes_play_in_order() {
        init_tracing();
        let recorder = Arc::new(Recorder::paced(Duration::from_millis(1)));
        let m = enabled(&recorder, vec![key(1), key(2), key(3)], PlaybackConfig::default());

        for _ in 0..5 {
            assert!(!m.trigger());
        }
        assert!(m.stats().running <= 1);
        wait_idle(&m);

        assert_eq!(m.stats().passes, 5);
        let codes = recorder.codes();
        assert_eq!(codes.len(), 15);
        for pass in codes.chunks(3) {
            assert_eq!(pass, [1, 2, 3]);
        }
    }

    #[test]
    fn test_two_workers_each_play_whole_pass() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = enabled(
            &recorder,
            vec![Signal::delay(Duration::from_millis(100)), key(272)],
            PlaybackConfig::default().with_thread_max(2),
        );

        m.trigger();
        m.trigger();
        assert_eq!(m.stats().running, 2);
        wait_idle(&m);
        assert_eq!(m.stats().passes, 2);

        let mut by_thread: HashMap<ThreadId, Vec<Signal>> = HashMap::new();
        for (id, signal) in recorder.sent.lock().iter() {
            by_thread.entry(*id).or_default().push(signal.clone());
        }
        assert_eq!(by_thread.len(), 2);
        for signals in by_thread.values() {
            assert_eq!(signals.len(), 2);
            assert_eq!(signals[0].kind(), KindId::DELAY);
            assert_eq!(signals[1].discriminator(), Some(272));
        }
    }

    #[test]
    fn test_interrupt_all_drains_workers() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = enabled(
            &recorder,
            vec![Signal::delay(Duration::from_secs(10)), key(1)],
            PlaybackConfig::default().with_thread_max(3),
        );

        for _ in 0..3 {
            m.trigger();
        }
        assert_eq!(m.stats().running, 3);
        wait_for("workers to start sending", || recorder.sent.lock().len() == 3);

        let started = Instant::now();
        m.interrupt(InterruptState::InterruptAll).unwrap();
        assert!(started.elapsed() < m.config().drain_timeout);

        let stats = m.stats();
        assert_eq!(stats.state, InterruptState::Continue);
        assert_eq!((stats.running, stats.queued, stats.abandoned), (0, 0, 0));
        assert!(recorder.codes().is_empty());

        // Still usable afterwards
        m.set_signals(vec![key(9)]).unwrap();
        m.trigger();
        wait_idle(&m);
        assert_eq!(recorder.codes(), vec![9]);
    }

    #[test]
    fn test_drain_timeout_abandons_stuck_worker() {
        init_tracing();
        let stuck = Arc::new(Stuck {
            hold: Duration::from_millis(400),
            entered: AtomicUsize::new(0),
        });
        let m = Macro::builder("stuck", stuck.clone())
            .with_signals(vec![key(1)])
            .with_config(
                PlaybackConfig::default()
                    .with_thread_max(1)
                    .with_drain_timeout(Duration::from_millis(50)),
            )
            .build();
        m.enable();
        m.trigger();
        wait_for("send to start", || stuck.entered.load(Ordering::SeqCst) == 1);

        let err = m.set_signals(vec![key(2), key(3)]).unwrap_err();
        assert!(err.is_timeout());
        let stats = m.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.state, InterruptState::Continue);
        assert_eq!(m.signals().len(), 2);

        // A fresh worker runs while the abandoned one is still asleep
        m.trigger();
        assert_eq!(m.stats().running, 1);
        wait_idle(&m);
        assert_eq!(m.stats().passes, 1);
        assert_eq!(stuck.entered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reenable_during_slow_send_plays_new_trigger() {
        init_tracing();
        let stuck = Arc::new(Stuck {
            hold: Duration::from_millis(150),
            entered: AtomicUsize::new(0),
        });
        let m = Macro::builder("reenabled", stuck.clone())
            .with_signals(vec![key(1)])
            .with_config(PlaybackConfig::default().with_thread_max(1))
            .build();
        m.enable();
        m.trigger();
        wait_for("send to start", || stuck.entered.load(Ordering::SeqCst) == 1);

        m.disable();
        m.enable();
        m.trigger();
        let stats = m.stats();
        assert_eq!((stats.running, stats.queued), (1, 1));

        wait_idle(&m);
        assert_eq!(stuck.entered.load(Ordering::SeqCst), 2);
        let stats = m.stats();
        assert_eq!(stats.state, InterruptState::Continue);
        assert_eq!(stats.passes, 2);
    }

    #[test]
    fn test_reenable_alone_does_not_restart_sticky_worker() {
        init_tracing();
        let stuck = Arc::new(Stuck {
            hold: Duration::from_millis(50),
            entered: AtomicUsize::new(0),
        });
        let m = Macro::builder("sticky", stuck.clone())
            .with_signals(vec![key(1)])
            .with_config(PlaybackConfig::default().with_sticky(true))
            .build();
        m.enable();
        m.trigger();
        wait_for("send to start", || stuck.entered.load(Ordering::SeqCst) == 1);

        m.disable();
        m.enable();
        wait_idle(&m);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(stuck.entered.load(Ordering::SeqCst), 1);
        assert_eq!(m.stats().running, 0);
    }

    #[test]
    fn test_set_signals_never_mixes_lists() {
        init_tracing();
        let recorder = Arc::new(Recorder::paced(Duration::from_millis(2)));
        let old: Vec<Signal> = (1..=4).map(key).collect();
        let new: Vec<Signal> = (11..=14).map(key).collect();
        let m = enabled(&recorder, old, PlaybackConfig::default().with_sticky(true));

        m.trigger();
        wait_for("a few passes", || recorder.sent.lock().len() >= 10);
        m.set_signals(new).unwrap();
        m.trigger();
        wait_for("new passes", || recorder.codes().iter().filter(|c| **c > 10).count() >= 8);
        m.disable();
        wait_idle(&m);

        let codes = recorder.codes();
        let mut passes: Vec<Vec<u32>> = Vec::new();
        for code in codes {
            if code == 1 || code == 11 {
                passes.push(Vec::new());
            }
            passes.last_mut().expect("pass start").push(code);
        }
        for pass in &passes {
            let base = pass[0];
            let expected: Vec<u32> = (base..base + pass.len() as u32).collect();
            assert_eq!(*pass, expected, "pass {pass:?} mixes lists");
        }
        assert!(passes.iter().any(|p| p[0] == 1));
        assert!(passes.iter().any(|p| p[0] == 11));
    }

    #[test]
    fn test_sticky_worker_replays_until_disabled() {
        init_tracing();
        let recorder = Arc::new(Recorder::paced(Duration::from_millis(1)));
        let m = enabled(&recorder, vec![key(5)], PlaybackConfig::default().with_sticky(true));
        m.trigger();
        wait_for("several passes", || m.stats().passes >= 5);
        m.disable();
        wait_idle(&m);
        assert_eq!(m.state(), InterruptState::Disable);
        let passes = m.stats().passes;
        thread::sleep(Duration::from_millis(20));
        assert_eq!(m.stats().passes, passes);
    }

    #[test]
    fn test_pause_resumes_on_its_own() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = enabled(
            &recorder,
            vec![key(1), key(2)],
            PlaybackConfig::default().with_pause(Duration::from_millis(10), 3),
        );
        m.interrupt(InterruptState::Pause).unwrap();
        assert_eq!(m.state(), InterruptState::Pause);

        m.trigger();
        wait_idle(&m);
        assert_eq!(recorder.codes(), vec![1, 2]);
        assert_eq!(m.state(), InterruptState::Continue);
    }

    #[test]
    fn test_pause_holds_until_continue() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = enabled(
            &recorder,
            vec![key(1), key(2)],
            PlaybackConfig::default().with_pause(Duration::from_millis(10), 10_000),
        );
        m.interrupt(InterruptState::Pause).unwrap();
        m.trigger();
        thread::sleep(Duration::from_millis(60));
        assert!(recorder.codes().is_empty());
        assert_eq!(m.stats().running, 1);

        m.interrupt(InterruptState::Continue).unwrap();
        wait_idle(&m);
        assert_eq!(recorder.codes(), vec![1, 2]);
    }

    #[test]
    fn test_interrupt_drops_queued_trigger() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = Macro::builder("starved", recorder.clone())
            .with_signals(vec![key(1)])
            .with_budget(Arc::new(WorkerBudget::new(0)))
            .build();
        m.enable();

        m.trigger();
        m.trigger();
        assert_eq!(m.stats().queued, 2);
        assert_eq!(m.stats().running, 0);

        m.interrupt(InterruptState::Interrupt).unwrap();
        let stats = m.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.state, InterruptState::Continue);
    }

    #[test]
    fn test_interrupt_aborts_running_pass() {
        init_tracing();
        let recorder = Arc::new(Recorder::paced(Duration::from_millis(20)));
        let m = enabled(&recorder, (1..=10).map(key).collect(), PlaybackConfig::default());
        m.trigger();
        wait_for("playback to start", || !recorder.sent.lock().is_empty());

        m.interrupt(InterruptState::Interrupt).unwrap();
        wait_idle(&m);
        let stats = m.stats();
        assert_eq!(stats.passes, 0);
        assert_eq!(stats.state, InterruptState::Continue);
        assert!(recorder.codes().len() < 10);
    }

    #[test]
    fn test_send_failure_aborts_pass() {
        init_tracing();
        let recorder = Arc::new(Recorder {
            fail_on: Some(13),
            ..Recorder::default()
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let m = Macro::builder("flaky", recorder.clone())
            .with_signals(vec![key(1), key(13), key(2)])
            .on_error(move |name, err| e.lock().push((name.to_string(), err.clone())))
            .build();
        m.enable();

        m.trigger();
        m.trigger();
        wait_idle(&m);

        assert_eq!(recorder.codes(), vec![1, 1]);
        let stats = m.stats();
        assert_eq!((stats.passes, stats.failures), (0, 2));
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0, "flaky");
        assert!(matches!(errors[0].1, Error::Send(_)));
    }

    #[test]
    fn test_shared_budget_caps_workers() {
        init_tracing();
        let budget = Arc::new(WorkerBudget::new(1));
        let recorder = Arc::new(Recorder::default());
        let make = |name: &str| {
            let m = Macro::builder(name, recorder.clone())
                .with_signals(vec![Signal::delay(Duration::from_millis(200))])
                .with_config(PlaybackConfig::default().with_thread_max(4))
                .with_budget(budget.clone())
                .build();
            m.enable();
            m
        };
        let first = make("first");
        let second = make("second");

        first.trigger();
        second.trigger();
        assert_eq!(first.stats().running, 1);
        assert_eq!(second.stats().running, 0);
        assert_eq!(second.stats().queued, 1);
        assert_eq!(budget.active(), 1);

        first.interrupt(InterruptState::InterruptAll).unwrap();
        wait_for("permit release", || budget.active() == 0);
    }

    #[test]
    fn test_drop_cancels_long_delay() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = enabled(
            &recorder,
            vec![Signal::delay(Duration::from_secs(30))],
            PlaybackConfig::default(),
        );
        m.trigger();
        wait_for("delay to start", || !recorder.sent.lock().is_empty());

        let started = Instant::now();
        drop(m);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_router_triggers_macro() {
        init_tracing();
        let router = Router::new(Arc::new(Registry::new()));
        let recorder = Arc::new(Recorder::default());
        let m = enabled(
            &recorder,
            vec![key(1), key(2)],
            PlaybackConfig::default().with_blocking(true),
        );
        let hotkey = Signal::key(59, Polarity::Down);
        let id = m
            .attach(&router, KindId::KEY, Some(&hotkey), Modifiers::CTRL)
            .unwrap();

        assert!(router.route(&hotkey, Modifiers::CTRL));
        assert!(!router.route(&hotkey, Modifiers::empty()));
        wait_idle(&m);
        assert_eq!(recorder.codes(), vec![1, 2]);

        drop(m);
        router.unregister(id);
        assert!(!router.contains(id));
    }

    #[test]
    fn test_paced_sender_in_playback() {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let m = Macro::builder("paced", Paced::new(recorder.clone()))
            .with_signals(vec![key(1), Signal::delay(Duration::from_secs(30)), key(2)])
            .build();
        m.enable();
        m.trigger();
        wait_for("first key", || recorder.codes() == vec![1]);

        m.interrupt(InterruptState::InterruptAll).unwrap();
        assert_eq!(recorder.codes(), vec![1]);
        assert!(
            recorder
                .sent
                .lock()
                .iter()
                .all(|(_, s)| s.kind() != KindId::DELAY)
        );
    }
}
