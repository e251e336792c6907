//! Change notifications emitted by the manager.
//!
//! Events fan out over `tokio::sync::broadcast` channels, one per subscriber.
//! Nothing in the manager awaits; receivers can drain synchronously with
//! `try_recv` or asynchronously with `recv`.

use tokio::sync::broadcast;
use tracing::debug;

use strata_types::{AttributeKey, EntryState, ObjectKey, Slice, SliceId};

/// Something observable happened in a manager.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// The current slice pointer moved.
    SliceChanged {
        previous: Option<Slice>,
        current: Slice,
    },
    /// Objects were created or removed.
    ObjectsChanged {
        state: EntryState,
        keys: Vec<ObjectKey>,
    },
    /// Attribute writes were recorded in `slice`.
    DataChanged {
        state: EntryState,
        slice: SliceId,
        entries: Vec<(ObjectKey, AttributeKey)>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SliceChanged,
    ObjectsChanged,
    DataChanged,
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SliceChanged { .. } => EventKind::SliceChanged,
            Self::ObjectsChanged { .. } => EventKind::ObjectsChanged,
            Self::DataChanged { .. } => EventKind::DataChanged,
        }
    }
}

/// A receiver of manager events.
pub type EventStream = broadcast::Receiver<StoreEvent>;

struct Subscriber {
    kinds: Option<Vec<EventKind>>,
    sender: broadcast::Sender<StoreEvent>,
}

impl Subscriber {
    fn wants(&self, event: &StoreEvent) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.kind()))
    }
}

/// Fan-out router owned by the manager.
pub(crate) struct EventRouter {
    subscribers: Vec<Subscriber>,
    capacity: usize,
}

impl EventRouter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn subscribe(&mut self, kinds: Option<Vec<EventKind>>) -> EventStream {
        let (sender, receiver) = broadcast::channel(self.capacity);
        self.subscribers.push(Subscriber { kinds, sender });
        receiver
    }

    /// Deliver `event` to every interested subscriber, pruning closed ones.
    pub(crate) fn emit(&mut self, event: StoreEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| {
            if sub.wants(&event) {
                sub.sender.send(event.clone()).is_ok()
            } else {
                sub.sender.receiver_count() > 0
            }
        });
        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            debug!(pruned, "dropped closed event subscribers");
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
