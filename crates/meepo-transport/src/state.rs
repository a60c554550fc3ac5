//! Transport state bridge
//!
//! Lets any component subscribe to lifecycle transitions of a transport.
//! Callbacks are keyed by the state they wait for and fire once per
//! transition into that state; subscribers arriving after a transition do not
//! see it. A callback that wants "fire once then detach" unsubscribes itself
//! from inside the callback using the handle it is given.

use crate::TransportState;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::trace;

/// Opaque subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked on a state transition
///
/// Runs on the thread driving the transition and must not block.
pub type StateCallback = Arc<dyn Fn(HandleId) + Send + Sync>;

type Observers = HashMap<TransportState, Vec<(HandleId, StateCallback)>>;

/// Current state plus the observers waiting on each state
pub struct StateBridge {
    state: watch::Sender<TransportState>,
    observers: Mutex<Observers>,
    next_handle: AtomicU64,
}

impl StateBridge {
    pub fn new(initial: TransportState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            observers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Receiver for async waiters that prefer polling the state
    pub fn watch(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self, state: TransportState, callback: StateCallback) -> HandleId {
        let handle = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.lock_observers()
            .entry(state)
            .or_default()
            .push((handle, callback));
        trace!(%state, %handle, "state observer added");
        handle
    }

    /// Returns false if the handle was not subscribed to `state`
    pub fn unsubscribe(&self, state: TransportState, handle: HandleId) -> bool {
        let mut observers = self.lock_observers();
        let Some(list) = observers.get_mut(&state) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != handle);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(&state);
        }
        if removed {
            trace!(%state, %handle, "state observer removed");
        }
        removed
    }

    pub fn observer_count(&self, state: TransportState) -> usize {
        self.lock_observers().get(&state).map_or(0, Vec::len)
    }

    /// Move to `next` and notify its observers
    ///
    /// Returns false (and notifies nobody) when the transition is not allowed,
    /// including a repeat of the current state. Observers run after the lock
    /// is released, so they may subscribe or unsubscribe freely.
    pub fn transition(&self, next: TransportState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if !changed {
            return false;
        }

        let callbacks: Vec<(HandleId, StateCallback)> = self
            .lock_observers()
            .get(&next)
            .cloned()
            .unwrap_or_default();

        trace!(state = %next, observers = callbacks.len(), "transport state changed");
        for (handle, callback) in callbacks {
            callback(handle);
        }
        true
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Observers> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StateBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBridge")
            .field("state", &self.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, StateCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move |_: HandleId| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_callbacks_fire_on_matching_state() {
        let bridge = StateBridge::new(TransportState::Connecting);
        let (connected, on_connected) = counter();
        let (failed, on_failed) = counter();

        bridge.subscribe(TransportState::Connected, on_connected);
        bridge.subscribe(TransportState::Failed, on_failed);

        assert!(bridge.transition(TransportState::Connected));
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.current(), TransportState::Connected);
    }

    #[test]
    fn test_repeat_transition_is_ignored() {
        let bridge = StateBridge::new(TransportState::Connecting);
        let (count, callback) = counter();
        bridge.subscribe(TransportState::Connected, callback);

        assert!(bridge.transition(TransportState::Connected));
        assert!(!bridge.transition(TransportState::Connected));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_subscriber_not_notified() {
        let bridge = StateBridge::new(TransportState::Connecting);
        bridge.transition(TransportState::Failed);

        let (count, callback) = counter();
        bridge.subscribe(TransportState::Failed, callback);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        // Failed can only move on to Closed
        assert!(!bridge.transition(TransportState::Connected));
        assert!(bridge.transition(TransportState::Closed));
    }

    #[test]
    fn test_unsubscribe_from_inside_callback() {
        let bridge = Arc::new(StateBridge::new(TransportState::Connected));
        let fired = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&bridge);
        let f = fired.clone();
        bridge.subscribe(
            TransportState::Failed,
            Arc::new(move |handle: HandleId| {
                f.fetch_add(1, Ordering::SeqCst);
                if let Some(bridge) = weak.upgrade() {
                    assert!(bridge.unsubscribe(TransportState::Failed, handle));
                }
            }),
        );

        assert!(bridge.transition(TransportState::Failed));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.observer_count(TransportState::Failed), 0);
    }

    #[test]
    fn test_unsubscribe_unknown_handle() {
        let bridge = StateBridge::new(TransportState::Connecting);
        let (_, callback) = counter();
        let handle = bridge.subscribe(TransportState::Closed, callback);

        assert!(!bridge.unsubscribe(TransportState::Failed, handle));
        assert!(bridge.unsubscribe(TransportState::Closed, handle));
        assert!(!bridge.unsubscribe(TransportState::Closed, handle));
    }

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let bridge = StateBridge::new(TransportState::Connecting);
        let mut rx = bridge.watch();

        bridge.transition(TransportState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TransportState::Connected);
    }
}
