//! Edge triggered reload requests.
//!
//! The channel holds at most one pending request. A request made while one is
//! already pending is coalesced into it: the controller reloads once and reads
//! the configuration as it is at that moment, which covers both.

use tokio::sync::mpsc::{self, error::TrySendError};

/// Create a connected [`Trigger`] and [`Listener`].
#[must_use]
pub fn channel() -> (Trigger, Listener) {
    let (sender, receiver) = mpsc::channel(1);
    (Trigger { sender }, Listener { receiver })
}

/// What became of a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// The request is pending.
    Queued,
    /// A request was already pending and covers this one.
    Coalesced,
    /// The controller is gone.
    Closed,
}

/// Requests reloads. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Trigger {
    sender: mpsc::Sender<()>,
}

impl Trigger {
    /// Request a reload without waiting.
    #[must_use]
    pub fn request(&self) -> Request {
        match self.sender.try_send(()) {
            Ok(()) => Request::Queued,
            Err(TrySendError::Full(())) => Request::Coalesced,
            Err(TrySendError::Closed(())) => Request::Closed,
        }
    }
}

/// Receives reload requests.
#[derive(Debug)]
pub struct Listener {
    receiver: mpsc::Receiver<()>,
}

impl Listener {
    /// Wait for the next request. Returns `None` once every [`Trigger`] is
    /// dropped and no request is pending.
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_requests_coalesce() {
        let (trigger, mut listener) = channel();
        assert_eq!(trigger.request(), Request::Queued);
        assert_eq!(trigger.clone().request(), Request::Coalesced);

        assert_eq!(listener.recv().await, Some(()));
        assert_eq!(trigger.request(), Request::Queued);
        assert_eq!(listener.recv().await, Some(()));
    }

    #[tokio::test]
    async fn closed_ends() {
        let (trigger, mut listener) = channel();
        assert_eq!(trigger.request(), Request::Queued);
        drop(trigger);
        assert_eq!(listener.recv().await, Some(()));
        assert_eq!(listener.recv().await, None);

        let (trigger, listener) = channel();
        drop(listener);
        assert_eq!(trigger.request(), Request::Closed);
    }
}
