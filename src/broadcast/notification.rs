use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
};

use serde::{Serialize, Serializer};

use crate::domain::{
    aggregate::{Aggregate, AggregateKind},
    hash::{AggregateId, TrackId},
    track::Track,
};

/// Type of a dispatch.
///
/// Variant order is dispatch order: track events first, then aggregate
/// changes, then aggregate removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    TrackChange,
    TrackRemoval,
    Change(AggregateKind),
    Removal(AggregateKind),
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackChange => "track-change",
            Self::TrackRemoval => "track-removal",
            Self::Change(AggregateKind::Album) => "album-change",
            Self::Change(AggregateKind::Artist) => "artist-change",
            Self::Change(AggregateKind::Playlist) => "playlist-change",
            Self::Removal(AggregateKind::Album) => "album-removal",
            Self::Removal(AggregateKind::Artist) => "artist-removal",
            Self::Removal(AggregateKind::Playlist) => "playlist-removal",
        }
    }

    /// the type that undoes this one for the same entity
    pub fn opposite(&self) -> Self {
        match *self {
            Self::TrackChange => Self::TrackRemoval,
            Self::TrackRemoval => Self::TrackChange,
            Self::Change(kind) => Self::Removal(kind),
            Self::Removal(kind) => Self::Change(kind),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Entity a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Track(TrackId),
    Aggregate(AggregateKind, AggregateId),
}

/// One change, published after the write it describes has committed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    TrackChanged(Track),
    TrackRemoved(TrackId),
    AggregateChanged(Aggregate),
    AggregateRemoved { kind: AggregateKind, id: AggregateId },
}

impl Notification {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TrackChanged(_) => EventType::TrackChange,
            Self::TrackRemoved(_) => EventType::TrackRemoval,
            Self::AggregateChanged(aggregate) => EventType::Change(aggregate.kind),
            Self::AggregateRemoved { kind, .. } => EventType::Removal(*kind),
        }
    }

    pub fn entity(&self) -> EntityKey {
        match self {
            Self::TrackChanged(track) => EntityKey::Track(track.id),
            Self::TrackRemoved(id) => EntityKey::Track(*id),
            Self::AggregateChanged(aggregate) => {
                EntityKey::Aggregate(aggregate.kind, aggregate.id)
            }
            Self::AggregateRemoved { kind, id } => EntityKey::Aggregate(*kind, *id),
        }
    }
}

/// What subscribers receive: every notification of one type from one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatch {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payloads: Vec<Notification>,
}

/// Notifications accumulated during one batching window.
///
/// Keeps at most one pending notification per entity: a later one of the
/// same type replaces the earlier in place, one of the opposite type cancels
/// it and is queued instead.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    slots: BTreeMap<EventType, Vec<Option<Notification>>>,
    pending: HashMap<EntityKey, (EventType, usize)>,
}

impl Batch {
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn push(&mut self, notification: Notification) {
        let event_type = notification.event_type();
        let key = notification.entity();

        if let Some((pending_type, at)) = self.pending.remove(&key) {
            let slot = self
                .slots
                .get_mut(&pending_type)
                .and_then(|slots| slots.get_mut(at));
            if let Some(slot) = slot {
                if pending_type == event_type {
                    *slot = Some(notification);
                    self.pending.insert(key, (pending_type, at));
                    return;
                }
                *slot = None;
            }
        }

        let slots = self.slots.entry(event_type).or_default();
        self.pending.insert(key, (event_type, slots.len()));
        slots.push(Some(notification));
    }

    /// one dispatch per type, in dispatch order; leaves the batch empty
    pub(crate) fn drain(&mut self) -> Vec<Dispatch> {
        self.pending.clear();
        std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|(event_type, slots)| {
                let payloads: Vec<Notification> = slots.into_iter().flatten().collect();
                (!payloads.is_empty()).then_some(Dispatch {
                    event_type,
                    payloads,
                })
            })
            .collect()
    }
}
