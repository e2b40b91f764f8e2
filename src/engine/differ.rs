use crate::domain::{
    aggregate::AggregateKind,
    hash::TrackId,
    reference::Reference,
    track::TrackDiff,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Joined,
    Left,
}

/// A track entering or leaving one aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipEvent {
    pub track_id: TrackId,
    /// media of the track as saved, offered as a cover for the aggregate
    pub media: Option<String>,
    pub kind: AggregateKind,
    /// the aggregate joined, or for [`Membership::Left`] the one left behind
    pub reference: Reference,
    pub membership: Membership,
}

impl MembershipEvent {
    pub fn is_addition(&self) -> bool {
        self.membership == Membership::Joined
    }
}

fn contains_id(refs: &[Reference], reference: &Reference) -> bool {
    refs.iter().any(|r| r.id == reference.id)
}

/// Expands one track diff into membership events for one aggregate kind.
///
/// Every current reference is joined, even one the track already had; the
/// store drops joins that change nothing. Leaves are a set difference by id,
/// so a track keeping the same aggregates (in any order) leaves none.
/// Joins come first, then leaves.
pub fn membership_events(
    diff: &TrackDiff,
    kind: AggregateKind,
) -> impl Iterator<Item = MembershipEvent> + '_ {
    let current: &[Reference] = diff.current.as_ref().map_or(&[][..], |t| t.references(kind));
    let previous: &[Reference] = diff.previous.as_ref().map_or(&[][..], |t| t.references(kind));
    let track_id = diff.id;
    let media = diff.current.as_ref().and_then(|t| t.media.clone());

    let joined = current.iter().map(move |r| MembershipEvent {
        track_id,
        media: media.clone(),
        kind,
        reference: r.clone(),
        membership: Membership::Joined,
    });

    let left = previous
        .iter()
        .filter(move |r| !contains_id(current, r))
        .map(move |r| MembershipEvent {
            track_id,
            media: None,
            kind,
            reference: r.clone(),
            membership: Membership::Left,
        });

    joined.chain(left)
}
