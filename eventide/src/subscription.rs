//! The durable-subscription port the acknowledging publisher drives.
//!
//! A backend adapter hands out a [`SubscriptionFeed`]: a stream of delivered
//! messages plus a [`Subscription`] handle used to settle each event.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Negative-acknowledgment actions understood by durable subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackAction {
    /// Keep the event aside for manual redelivery.
    Park,
    /// Discard the event permanently.
    Skip,
    /// Ask the backend to deliver the event again.
    Retry,
    /// Stop the subscription.
    Stop,
}

impl fmt::Display for NackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            Self::Park => "park",
            Self::Skip => "skip",
            Self::Retry => "retry",
            Self::Stop => "stop",
        };
        f.write_str(action)
    }
}

/// Why a backend ended a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The subscription was closed by its owner.
    Disposed,
    /// The subscriber side failed.
    SubscriberError(String),
    /// The server or connection failed.
    ServerError(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => f.write_str("disposed"),
            Self::SubscriberError(reason) => write!(f, "subscriber error: {reason}"),
            Self::ServerError(reason) => write!(f, "server error: {reason}"),
        }
    }
}

/// A raw event delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredEvent<R> {
    /// Unique id used to settle the event.
    pub event_id: Uuid,
    /// Logical name the event was recorded under.
    pub event_name: String,
    /// Encoded event.
    pub payload: R,
}

/// A message read from a subscription feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage<R> {
    /// An event that must be acked or nacked.
    Event(DeliveredEvent<R>),
    /// All historical events have been delivered.
    CaughtUp,
    /// The backend ended the subscription. No further messages follow.
    Dropped(DropReason),
}

/// Settles events delivered on one subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Positively acknowledges an event so it is never redelivered.
    async fn ack(&self, event_id: Uuid) -> Result<()>;

    /// Negatively acknowledges an event.
    async fn nack(&self, action: NackAction, reason: &str, event_id: Uuid) -> Result<()>;

    /// Releases the subscription. Must be idempotent.
    fn close(&self);
}

/// An open subscription.
pub struct SubscriptionFeed<R> {
    /// Handle used to settle events and to close the subscription.
    pub handle: Arc<dyn Subscription>,
    /// Messages in delivery order.
    pub messages: BoxStream<'static, SubscriptionMessage<R>>,
}

impl<R> fmt::Debug for SubscriptionFeed<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFeed").finish_non_exhaustive()
    }
}

/// Opens durable subscriptions.
///
/// Every call to [`SubscriptionClient::subscribe`] must start a fresh
/// subscription that redelivers events the previous one left unsettled.
#[async_trait]
pub trait SubscriptionClient<R>: Send + Sync {
    /// Opens a subscription.
    async fn subscribe(&self) -> Result<SubscriptionFeed<R>>;
}
