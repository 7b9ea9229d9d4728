use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// What happened to an occurrence (or to the schedule around it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Booked,
    Rescheduled,
    Cancelled,
    Completed,
    NoShow,
    FlaggedForReview,
    BlackoutCreated,
    SeriesCancelled,
}

/// Fire-and-forget change notification. Downstream dispatchers (SMS, email)
/// subscribe per resource; a failure or absence of listeners never rolls
/// back the booking that produced the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceChange {
    pub resource_id: Ulid,
    pub appointment_id: Option<Ulid>,
    pub kind: ChangeKind,
}

/// Broadcast hub, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<OccurrenceChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<OccurrenceChange> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a change notification. No-op if nobody is listening; lagging
    /// receivers drop messages rather than blocking the engine.
    pub fn send(&self, change: OccurrenceChange) {
        if let Some(sender) = self.channels.get(&change.resource_id) {
            let _ = sender.send(change);
        }
    }

    /// Remove a channel (e.g. when a resource is retired).
    #[allow(dead_code)]
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let change = OccurrenceChange {
            resource_id: rid,
            appointment_id: Some(Ulid::new()),
            kind: ChangeKind::Booked,
        };
        hub.send(change.clone());

        assert_eq!(rx.recv().await.unwrap(), change);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(OccurrenceChange {
            resource_id: Ulid::new(),
            appointment_id: None,
            kind: ChangeKind::BlackoutCreated,
        });
    }
}
