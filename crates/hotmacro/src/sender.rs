//! The outbound side: the [`Sender`] collaborator and the adapters the engine
//! builds on top of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::dispatch::Router;
use crate::error::Result;
use crate::signal::{Payload, Signal};

/// Sends signals to the outside world, e.g. a virtual input device.
///
/// Implementations live outside the engine. `send_cancellable` lets a sender
/// that blocks (a long delay, a slow device) stop early when playback is
/// interrupted; the default ignores the token.
pub trait Sender: Send + Sync {
    fn send(&self, signal: &Signal) -> Result<()>;

    fn send_cancellable(&self, signal: &Signal, _cancel: &CancelToken) -> Result<()> {
        self.send(signal)
    }
}

impl<S: Sender + ?Sized> Sender for Arc<S> {
    fn send(&self, signal: &Signal) -> Result<()> {
        (**self).send(signal)
    }

    fn send_cancellable(&self, signal: &Signal, cancel: &CancelToken) -> Result<()> {
        (**self).send_cancellable(signal, cancel)
    }
}

impl<S: Sender + ?Sized> Sender for Box<S> {
    fn send(&self, signal: &Signal) -> Result<()> {
        (**self).send(signal)
    }

    fn send_cancellable(&self, signal: &Signal, cancel: &CancelToken) -> Result<()> {
        (**self).send_cancellable(signal, cancel)
    }
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// A shared, one-way cancellation flag that can also be waited on.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel, waking every waiter
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for `duration` or until cancelled. Returns true if cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }

    /// Do both handles share one flag?
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Performs `Delay` signals itself and forwards everything else.
///
/// Delays are cancellable waits, so interrupting playback does not have to
/// sit out a long pause.
#[derive(Debug, Clone)]
pub struct Paced<S> {
    inner: S,
}

impl<S: Sender> Paced<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Sender> Sender for Paced<S> {
    fn send(&self, signal: &Signal) -> Result<()> {
        match signal.payload() {
            Payload::Delay(duration) => {
                std::thread::sleep(*duration);
                Ok(())
            }
            _ => self.inner.send(signal),
        }
    }

    fn send_cancellable(&self, signal: &Signal, cancel: &CancelToken) -> Result<()> {
        match signal.payload() {
            Payload::Delay(duration) => {
                if cancel.wait_timeout(*duration) {
                    trace!("delay of {:?} cut short", duration);
                }
                Ok(())
            }
            _ => self.inner.send_cancellable(signal, cancel),
        }
    }
}

/// Dispatches each outgoing signal through a [`Router`] first and only
/// forwards it when no receiver blocked it.
pub struct Routed<S> {
    router: Arc<Router>,
    inner: S,
}

impl<S: Sender> Routed<S> {
    pub fn new(router: Arc<Router>, inner: S) -> Self {
        Self { router, inner }
    }
}

impl<S: Sender> Sender for Routed<S> {
    fn send(&self, signal: &Signal) -> Result<()> {
        if self.router.dispatch(signal) {
            trace!("outgoing {:?} blocked by a receiver", signal.kind());
            return Ok(());
        }
        self.inner.send(signal)
    }

    fn send_cancellable(&self, signal: &Signal, cancel: &CancelToken) -> Result<()> {
        if self.router.dispatch(signal) {
            trace!("outgoing {:?} blocked by a receiver", signal.kind());
            return Ok(());
        }
        self.inner.send_cancellable(signal, cancel)
    }
}
