use std::collections::{HashMap, hash_map::Entry};

use crate::{
    domain::{
        aggregate::Mutation,
        hash::{AggregateId, TrackId},
    },
    engine::differ::{Membership, MembershipEvent},
};

/// Groups the membership events of one batch (one aggregate kind) into one
/// mutation per aggregate.
///
/// Events are first keyed by (aggregate, track) with the later event
/// winning, so a track that leaves and re-enters the same aggregate within
/// the batch ends up in exactly one of `track_ids` / `removed_track_ids`.
/// Output follows the order in which aggregates first appear.
pub fn group(events: impl IntoIterator<Item = MembershipEvent>) -> Vec<Mutation> {
    let mut latest: Vec<MembershipEvent> = Vec::new();
    let mut index: HashMap<(AggregateId, TrackId), usize> = HashMap::new();

    for event in events {
        match index.entry((event.reference.id, event.track_id)) {
            Entry::Occupied(slot) => latest[*slot.get()] = event,
            Entry::Vacant(slot) => {
                slot.insert(latest.len());
                latest.push(event);
            }
        }
    }

    let mut mutations: Vec<Mutation> = Vec::new();
    let mut positions: HashMap<AggregateId, usize> = HashMap::new();

    for event in latest {
        let id = event.reference.id;
        let at = *positions.entry(id).or_insert_with(|| {
            mutations.push(Mutation::new(id));
            mutations.len() - 1
        });
        let mutation = &mut mutations[at];

        match event.membership {
            Membership::Joined => {
                mutation.track_ids.push(event.track_id);
                if event.reference.name.is_some() {
                    mutation.name = event.reference.name;
                }
                if mutation.media.is_none() {
                    mutation.media = event.media;
                }
            }
            Membership::Left => mutation.removed_track_ids.push(event.track_id),
        }
    }

    mutations
}
