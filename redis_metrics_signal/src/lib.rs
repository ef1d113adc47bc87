//! Drained cancellation for scrape epochs.
//!
//! A scrape epoch runs one task per monitored node and must be able to stop
//! all of them and then know, without polling, that every one has returned.
//! This crate provides that as a pair: a single `Broadcaster` owned by the
//! epoch and any number of `Watcher` instances held by the node tasks.
//!
//! A `Watcher` observes cancellation between iterations with
//! [`Watcher::is_signaled`] or waits for it with [`Watcher::recv`]. A
//! registered `Watcher` counts as a peer until it is dropped, so
//! [`Broadcaster::signal_and_wait`] returns only once every task holding one
//! has finished. The signal is a one-time event; each epoch gets a fresh pair.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered. Callers that only use it to derive
/// further watchers must drop it, otherwise `signal_and_wait` will wait on it.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        signal_received: false,
        notify: Arc::clone(&notify),
        departed: false,
        registered: true,
    };

    let b = Broadcaster {
        peers,
        sender,
        notify,
    };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that cancellation has
/// been requested.
pub struct Broadcaster {
    /// The number of registered `Watcher` instances still alive.
    peers: Arc<AtomicU32>,
    /// Dropping this closes the channel, which every `Watcher` observes.
    sender: broadcast::Sender<()>,
    /// Woken each time a registered `Watcher` departs.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal to all `Watcher` instances without waiting for them.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal to all `Watcher` instances and wait until every
    /// registered `Watcher` has been dropped.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        // Register for notification before checking the count. Checking first
        // would let a departing peer notify between the check and the
        // registration, and the wakeup would be lost.
        loop {
            let notified = self.notify.notified();

            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            debug!("Waiting for {peers} peers to drain");

            notified.await;
        }
    }

    /// The number of registered `Watcher` instances that have not yet been
    /// dropped.
    #[must_use]
    pub fn peers(&self) -> u32 {
        self.peers.load(Ordering::SeqCst)
    }
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has been received and yet `register` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Mechanism to watch for cancellation of the epoch a task belongs to.
pub struct Watcher {
    /// Set once the signal is observed, so later checks need no
    /// synchronization.
    signal_received: bool,
    /// Whether this instance has already decremented the peer count.
    departed: bool,
    /// Shared count of registered, live `Watcher` instances.
    peers: Arc<AtomicU32>,
    /// Closed by the `Broadcaster` to deliver the signal.
    receiver: broadcast::Receiver<()>,
    /// Woken on departure so `signal_and_wait` can re-check the count.
    notify: Arc<Notify>,
    /// Whether `signal_and_wait` waits for this instance to be dropped.
    registered: bool,
}

impl Watcher {
    /// Decrease the peer count in the `Broadcaster`, allowing it to unblock if
    /// it is waiting in `signal_and_wait`.
    fn depart(&mut self) {
        if !self.registered || self.departed {
            return;
        }

        // `fetch_sub` would wrap at zero.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
        self.departed = true;
    }

    /// Wait for the signal. Returns immediately if it was already observed.
    ///
    /// This function is cancel safe and does not consume the `Watcher`: it may
    /// be used as one arm of a `select!` on every loop iteration. The peer is
    /// released only when the `Watcher` is dropped.
    pub async fn recv(&mut self) {
        if self.signal_received {
            return;
        }

        // Nothing is ever sent on the channel, it is only closed. A lag can't
        // happen and would still mean the sender is gone.
        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed | error::RecvError::Lagged(_)) => {
                self.signal_received = true;
            }
        }
    }

    /// Check, without blocking, whether the signal has been sent.
    ///
    /// Once this returns `true` it returns `true` on every later call.
    pub fn is_signaled(&mut self) -> bool {
        if self.signal_received {
            return true;
        }

        match self.receiver.try_recv() {
            Ok(()) | Err(error::TryRecvError::Closed | error::TryRecvError::Lagged(_)) => {
                self.signal_received = true;
                true
            }
            Err(error::TryRecvError::Empty) => false,
        }
    }

    /// Register with the `Broadcaster`, returning a new instance of `Watcher`
    /// that `signal_and_wait` will wait on.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this watcher has already
    /// observed the signal. Tasks must not join an epoch that is stopping.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }

        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            signal_received: false,
            notify: Arc::clone(&self.notify),
            departed: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.depart();
    }
}

impl Clone for Watcher {
    /// Clones are unregistered: `signal_and_wait` does not wait for them.
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            signal_received: self.signal_received,
            notify: Arc::clone(&self.notify),
            departed: false,
            registered: false,
        }
    }
}
