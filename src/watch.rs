//! Status change notifications keyed by record id.
//!
//! A [`Watcher`] keeps one `tokio::sync::watch` channel per id that somebody
//! is waiting on. Writers publish after every persisted state change; a
//! terminal publish also drops the channel, since nothing leaves a terminal
//! state. Waiters subscribe *before* reading the persisted state, so a
//! change landing between the two shows up in one or the other.

use std::hash::Hash;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::domain::JobState;
use crate::types::{JobId, Status, TxId};

/// States that can be waited on.
pub trait Terminal: Copy + Default + Send + Sync + 'static {
    /// `true` once the state can no longer change.
    fn is_terminal(&self) -> bool;
}

impl Terminal for Status {
    fn is_terminal(&self) -> bool {
        Status::is_terminal(self)
    }
}

impl Terminal for JobState {
    fn is_terminal(&self) -> bool {
        JobState::is_terminal(self)
    }
}

#[derive(Debug)]
pub struct Watcher<K: Eq + Hash, S> {
    channels: DashMap<K, watch::Sender<S>>,
}

/// Watcher for transaction meta-status.
pub type StatusWatcher = Watcher<TxId, Status>;

/// Watcher for job lifecycle.
pub type JobWatcher = Watcher<JobId, JobState>;

impl<K: Eq + Hash, S> Default for Watcher<K, S> {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }
}

impl<K, S> Watcher<K, S>
where
    K: Eq + Hash + Clone,
    S: Terminal,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to state changes of `id`.
    pub fn subscribe(&self, id: K) -> watch::Receiver<S> {
        self.channels
            .entry(id)
            .or_insert_with(|| watch::channel(S::default()).0)
            .subscribe()
    }

    /// Wakes every subscriber of `id`.
    pub fn publish(&self, id: &K, state: S) {
        if state.is_terminal() {
            if let Some((_, sender)) = self.channels.remove(id) {
                sender.send_replace(state);
            }
        } else if let Some(sender) = self.channels.get(id) {
            sender.send_replace(state);
        }
    }

    /// Drops the channel for `id` if nobody listens anymore.
    pub fn release(&self, id: &K) {
        self.channels
            .remove_if(id, |_, sender| sender.receiver_count() == 0);
    }

    /// Number of ids currently watched.
    pub fn watched(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_publish_wakes_and_drops_channel() {
        let watcher = StatusWatcher::new();
        let id = TxId::new();
        let mut rx = watcher.subscribe(id);
        assert_eq!(watcher.watched(), 1);

        watcher.publish(&id, Status::Success);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Status::Success);
        assert_eq!(watcher.watched(), 0);
    }

    #[tokio::test]
    async fn non_terminal_publish_keeps_channel() {
        let watcher = JobWatcher::new();
        let id = JobId::new();
        let mut rx = watcher.subscribe(id.clone());
        watcher.publish(&id, JobState::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), JobState::Running);
        assert_eq!(watcher.watched(), 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let watcher = StatusWatcher::new();
        watcher.publish(&TxId::new(), Status::Failed);
        assert_eq!(watcher.watched(), 0);
    }

    #[test]
    fn release_keeps_channels_with_listeners() {
        let watcher = StatusWatcher::new();
        let id = TxId::new();
        let rx = watcher.subscribe(id);
        watcher.release(&id);
        assert_eq!(watcher.watched(), 1);
        drop(rx);
        watcher.release(&id);
        assert_eq!(watcher.watched(), 0);
    }
}
