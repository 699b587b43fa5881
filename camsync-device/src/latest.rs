//! Single-slot publish/subscribe.
//!
//! A [`Publisher`] delivers the latest value to currently registered
//! subscribers and does not replay history:
//!
//! * a subscriber only sees values published after it subscribed;
//! * a subscriber that falls behind skips straight to the newest value;
//! * publishing with no subscribers simply overwrites the slot.

use tokio::sync::watch;

pub struct Publisher<T> {
    tx: watch::Sender<Option<T>>,
}

pub struct Subscription<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Publisher<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    pub fn subscribe(&self) -> Subscription<T> {
        // watch::Sender::subscribe marks the current value as seen
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Subscription<T> {
    /// Waits for a value newer than the last one this subscription returned.
    /// Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<T> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        self.rx.borrow_and_update().clone()
    }
}
