//! Fan-out of live migration events to watchers.
//!
//! One channel exists per instance while an action (or an automatic chain of
//! actions) is in flight. Each channel keeps the events of the current action
//! so a watcher attaching late first sees what already happened, then the live
//! tail. The channel is dropped as soon as the `end` event is published.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::WatchEvent;
use crate::metrics::{WATCH_LAGGED, WATCH_SUBSCRIBERS};

/// Stream of events for one watcher. Ends after the `end` event, when the
/// watcher falls behind, or immediately if nothing was in flight.
pub type WatchStream = BoxStream<'static, WatchEvent>;

struct ActionChannel {
    sender: broadcast::Sender<WatchEvent>,
    buffered: VecDeque<WatchEvent>,
}

/// Per-instance event broadcaster.
pub struct EventBroadcaster {
    capacity: usize,
    channels: Mutex<HashMap<String, ActionChannel>>,
}

impl EventBroadcaster {
    /// Create a broadcaster. `capacity` bounds both each watcher's queue and
    /// the replay buffer kept for late watchers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, ActionChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the channel for an instance. Returns false if one is already open,
    /// in which case the existing channel (and its buffer) is kept.
    pub fn open(&self, instance_id: &str) -> bool {
        let mut channels = self.channels();
        if channels.contains_key(instance_id) {
            return false;
        }
        let (sender, _) = broadcast::channel(self.capacity);
        channels.insert(
            instance_id.to_string(),
            ActionChannel {
                sender,
                buffered: VecDeque::new(),
            },
        );
        true
    }

    /// Publish an event. Never blocks: slow watchers are cut off by the
    /// bounded channel. Publishing an `end` event closes the channel.
    pub fn publish(&self, instance_id: &str, event: WatchEvent) {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(instance_id) else {
            debug!(instance_id, "No watch channel open, dropping event");
            return;
        };

        let is_end = event.is_end();
        if channel.buffered.len() == self.capacity {
            channel.buffered.pop_front();
        }
        channel.buffered.push_back(event.clone());

        // An error only means nobody is listening right now.
        let _ = channel.sender.send(event);

        if is_end {
            channels.remove(instance_id);
            debug!(instance_id, "Watch channel closed");
        }
    }

    /// Attach a watcher to the instance's in-flight action.
    pub fn subscribe(&self, instance_id: &str) -> WatchStream {
        let (replay, rx) = {
            let channels = self.channels();
            match channels.get(instance_id) {
                Some(channel) => (
                    channel.buffered.iter().cloned().collect::<Vec<_>>(),
                    channel.sender.subscribe(),
                ),
                None => return stream::empty().boxed(),
            }
        };

        let live = LiveState {
            rx,
            done: false,
            instance_id: instance_id.to_string(),
            _guard: SubscriberGuard::new(),
        };

        let live = stream::unfold(live, |mut state| async move {
            if state.done {
                return None;
            }
            match state.rx.recv().await {
                Ok(event) => {
                    state.done = event.is_end();
                    Some((event, state))
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        instance_id = %state.instance_id,
                        skipped, "Watcher fell behind, disconnecting"
                    );
                    WATCH_LAGGED.inc();
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        stream::iter(replay).chain(live).boxed()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

struct LiveState {
    rx: broadcast::Receiver<WatchEvent>,
    done: bool,
    instance_id: String,
    _guard: SubscriberGuard,
}

struct SubscriberGuard;

impl SubscriberGuard {
    fn new() -> Self {
        WATCH_SUBSCRIBERS.inc();
        Self
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        WATCH_SUBSCRIBERS.dec();
    }
}
