//! Watch fan-out.
//!
//! Subscribers get a bounded channel each. Publishing never blocks the
//! writer: a full buffer drops the event for that subscriber and bumps its
//! lag counter. The registry keeps only weak references to subscriber
//! state, so dropping a [`WatchSubscription`] tears it down without any
//! unsubscribe call; dead entries are reaped on the next publish.
//!
//! Delivered events arrive in CSN order per collective. Drops create gaps,
//! never reorderings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::trace;

use crate::experience::Experience;
use crate::types::{CollectiveId, Csn, ExperienceId, Timestamp};

/// What happened to an experience.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Recorded.
    Created,
    /// Mutable fields changed (updates, reinforce, unarchive).
    Updated,
    /// Archived out of the vector index.
    Archived,
    /// Permanently removed.
    Deleted,
}

/// A change notification.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    /// The experience concerned.
    pub experience_id: ExperienceId,

    /// Its collective.
    pub collective_id: CollectiveId,

    /// What happened.
    pub kind: WatchEventKind,

    /// CSN of the commit that produced this event.
    pub csn: Csn,

    /// Commit wall-clock time.
    pub timestamp: Timestamp,
}

/// Per-subscriber event filter, evaluated before the send attempt.
#[derive(Clone, Debug, Default)]
pub struct WatchFilter {
    /// Only events whose experience shares one of these domain tags.
    pub domains: Option<Vec<String>>,

    /// Only events whose experience type tag is in this set.
    pub type_tags: Option<Vec<u8>>,

    /// Only events whose experience has at least this importance.
    pub min_importance: Option<f32>,
}

impl WatchFilter {
    fn matches(&self, experience: &Experience) -> bool {
        if let Some(ref domains) = self.domains {
            let overlap = experience
                .domain_tags
                .iter()
                .any(|tag| domains.iter().any(|d| d == tag));
            if !overlap {
                return false;
            }
        }
        if let Some(ref tags) = self.type_tags {
            if !tags.contains(&experience.experience_type.tag()) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if experience.importance < min {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct SubscriberShared {
    sender: Sender<WatchEvent>,
    filter: Option<WatchFilter>,
    lagged: AtomicU64,
}

/// A live subscription: a pull interface over the bounded event buffer.
///
/// Dropping the subscription removes it from the registry on the next
/// publish; no explicit unsubscribe exists or is needed.
#[derive(Debug)]
pub struct WatchSubscription {
    shared: Arc<SubscriberShared>,
    receiver: Receiver<WatchEvent>,
}

impl WatchSubscription {
    /// Takes the next buffered event without blocking.
    pub fn try_recv(&self) -> Option<WatchEvent> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WatchEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Number of buffered events ready to read.
    pub fn ready(&self) -> usize {
        self.receiver.len()
    }

    /// How many events were dropped because this subscriber's buffer was
    /// full.
    pub fn lag(&self) -> u64 {
        self.shared.lagged.load(Ordering::Relaxed)
    }
}

/// The per-database subscriber registry.
pub(crate) struct WatchRegistry {
    subscribers: RwLock<HashMap<CollectiveId, Vec<Weak<SubscriberShared>>>>,
    buffer_size: usize,
    enabled: bool,
}

impl WatchRegistry {
    pub(crate) fn new(buffer_size: usize, enabled: bool) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer_size,
            enabled,
        }
    }

    /// Registers a subscriber for one collective.
    pub(crate) fn subscribe(
        &self,
        collective: CollectiveId,
        filter: Option<WatchFilter>,
    ) -> WatchSubscription {
        let (sender, receiver) = bounded(self.buffer_size);
        let shared = Arc::new(SubscriberShared {
            sender,
            filter,
            lagged: AtomicU64::new(0),
        });
        self.subscribers
            .write()
            .entry(collective)
            .or_default()
            .push(Arc::downgrade(&shared));
        WatchSubscription { shared, receiver }
    }

    /// Number of live subscribers for a collective.
    pub(crate) fn subscriber_count(&self, collective: CollectiveId) -> usize {
        self.subscribers
            .read()
            .get(&collective)
            .map(|subs| subs.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Fans an event out to the collective's subscribers. Non-blocking:
    /// full buffers drop the event and count lag. `experience` is the row
    /// the event describes (pre-delete state for deletions), used for
    /// filter evaluation.
    pub(crate) fn publish(&self, event: &WatchEvent, experience: &Experience) {
        if !self.enabled {
            return;
        }

        let mut saw_dead = false;
        {
            let subscribers = self.subscribers.read();
            let Some(subs) = subscribers.get(&event.collective_id) else {
                return;
            };
            for weak in subs {
                let Some(shared) = weak.upgrade() else {
                    saw_dead = true;
                    continue;
                };
                if let Some(ref filter) = shared.filter {
                    if !filter.matches(experience) {
                        continue;
                    }
                }
                match shared.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        shared.lagged.fetch_add(1, Ordering::Relaxed);
                        trace!(collective = %event.collective_id, "subscriber lagging, event dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => saw_dead = true,
                }
            }
        }

        if saw_dead {
            let mut subscribers = self.subscribers.write();
            if let Some(subs) = subscribers.get_mut(&event.collective_id) {
                subs.retain(|w| w.strong_count() > 0);
                if subs.is_empty() {
                    subscribers.remove(&event.collective_id);
                }
            }
        }
    }
}
