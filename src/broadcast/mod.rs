//! Batched, ordered change notifications.

pub mod broadcaster;
pub mod notification;

pub use broadcaster::{BroadcastSink, Broadcaster, SubscriptionId};
pub use notification::{Dispatch, EventType, Notification};
