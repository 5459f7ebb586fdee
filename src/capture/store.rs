//! Append-only capture log shared by every exchange.

use super::event::ProxyEvent;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

type EventLog = Vec<Arc<ProxyEvent>>;

/// Copy-on-write event log.
///
/// Appends publish a new vector atomically, so readers always see a complete
/// sequence and never wait on writers.
#[derive(Clone)]
pub struct EventStore {
    events: Arc<ArcSwap<EventLog>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }

    pub fn register(&self, event: ProxyEvent) {
        tracing::trace!(
            target_uri = %event.request().target,
            status = event.status().as_u16(),
            "Registering proxy event"
        );

        let event = Arc::new(event);
        self.events.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(event.clone());
            next
        });
    }

    /// Drop every captured event. Only meaningful while no exchange is in flight.
    pub fn reset(&self) {
        self.events.store(Arc::new(Vec::new()));
    }

    pub fn snapshot(&self) -> EventsCaptured {
        EventsCaptured {
            events: self.events.load_full(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("events", &self.len())
            .finish()
    }
}

/// Immutable view of the capture log at one point in time.
#[derive(Debug, Clone)]
pub struct EventsCaptured {
    events: Arc<EventLog>,
}

impl EventsCaptured {
    pub fn events(&self) -> &[Arc<ProxyEvent>] {
        &self.events
    }

    pub fn get(&self, index: usize) -> Option<&ProxyEvent> {
        self.events.get(index).map(Arc::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyEvent> {
        self.events.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn matching<F>(&self, predicate: F) -> Vec<Arc<ProxyEvent>>
    where
        F: Fn(&ProxyEvent) -> bool,
    {
        self.events
            .iter()
            .filter(|event| predicate(Arc::as_ref(event)))
            .cloned()
            .collect()
    }

    /// Events whose target contains `part`, ignoring case.
    pub fn with_target_containing(&self, part: &str) -> Vec<Arc<ProxyEvent>> {
        let part = part.to_lowercase();
        self.matching(|event| {
            event
                .request()
                .target
                .to_string()
                .to_lowercase()
                .contains(&part)
        })
    }

    pub fn summary(&self) -> String {
        let mut summary = format!("Captured {} proxy events:", self.events.len());
        for event in self.events.iter() {
            summary.push_str("\n\t");
            summary.push_str(&event.to_string());
        }
        summary
    }
}

impl fmt::Display for EventsCaptured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}
