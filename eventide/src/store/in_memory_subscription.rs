//! An in-memory persistent subscription.
//!
//! Events published to it are kept until they are settled. Opening a new
//! subscription replays every event that was never acked, parked or skipped,
//! which mirrors how a durable subscription group behaves after a reconnect.
use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, channel::mpsc};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::{
    Error, Result,
    subscription::{
        DeliveredEvent, DropReason, NackAction, Subscription, SubscriptionClient,
        SubscriptionFeed, SubscriptionMessage,
    },
};

/// A negative acknowledgment recorded by [`InMemoryPersistentSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackRecord {
    /// The nacked event.
    pub event_id: Uuid,
    /// Action the subscriber asked for.
    pub action: NackAction,
    /// Reason the subscriber gave.
    pub reason: String,
}

struct ActiveSubscription<R> {
    generation: u64,
    sender: mpsc::UnboundedSender<SubscriptionMessage<R>>,
}

struct State<R> {
    log: Vec<DeliveredEvent<R>>,
    settled: HashSet<Uuid>,
    acks: Vec<Uuid>,
    nacks: Vec<NackRecord>,
    active: Option<ActiveSubscription<R>>,
    live: bool,
    generation: u64,
    reject_settlements: bool,
}

impl<R: Clone> State<R> {
    fn send(&mut self, message: SubscriptionMessage<R>) {
        if let Some(active) = &self.active {
            if active.sender.unbounded_send(message).is_err() {
                self.active = None;
            }
        }
    }

    fn check_settlements(&self) -> Result<()> {
        if self.reject_settlements {
            return Err(Error::Store("subscription rejected the settlement".into()));
        }
        Ok(())
    }
}

/// An in-memory, thread-safe persistent subscription.
///
/// Acts as both the [`SubscriptionClient`] and the publishing side, and
/// records every ack and nack for inspection. Cloning shares the state.
pub struct InMemoryPersistentSubscription<R> {
    state: Arc<Mutex<State<R>>>,
}

impl<R> Default for InMemoryPersistentSubscription<R> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                log: Vec::new(),
                settled: HashSet::new(),
                acks: Vec::new(),
                nacks: Vec::new(),
                active: None,
                live: false,
                generation: 0,
                reject_settlements: false,
            })),
        }
    }
}

impl<R> Clone for InMemoryPersistentSubscription<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Clone + Send + 'static> InMemoryPersistentSubscription<R> {
    /// Publishes an event and returns the id it was delivered under.
    pub fn publish(&self, event_name: impl Into<String>, payload: R) -> Uuid {
        let event = DeliveredEvent {
            event_id: Uuid::new_v4(),
            event_name: event_name.into(),
            payload,
        };
        let event_id = event.event_id;
        let mut state = self.state.lock();
        state.log.push(event.clone());
        state.send(SubscriptionMessage::Event(event));
        event_id
    }

    /// Signals that the historical events have all been delivered.
    ///
    /// Subscriptions opened afterwards receive the marker right after their
    /// replay.
    pub fn caught_up(&self) {
        let mut state = self.state.lock();
        state.live = true;
        state.send(SubscriptionMessage::CaughtUp);
    }

    /// Drops the open subscription, if any, with `reason`.
    pub fn drop_subscription(&self, reason: DropReason) {
        let mut state = self.state.lock();
        state.send(SubscriptionMessage::Dropped(reason));
        state.active = None;
    }

    /// Makes every subsequent ack and nack fail.
    pub fn reject_settlements(&self, reject: bool) {
        self.state.lock().reject_settlements = reject;
    }

    /// Ids of acked events, in acknowledgment order.
    pub fn acked(&self) -> Vec<Uuid> {
        self.state.lock().acks.clone()
    }

    /// Recorded negative acknowledgments, in order.
    pub fn nacked(&self) -> Vec<NackRecord> {
        self.state.lock().nacks.clone()
    }

    /// Number of subscriptions opened so far.
    pub fn subscribe_count(&self) -> u64 {
        self.state.lock().generation
    }

    /// Returns `true` while a subscription is open.
    pub fn is_subscribed(&self) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| !active.sender.is_closed())
    }
}

#[async_trait]
impl<R> SubscriptionClient<R> for InMemoryPersistentSubscription<R>
where
    R: Clone + Send + Sync + 'static,
{
    #[instrument(skip(self))]
    async fn subscribe(&self) -> Result<SubscriptionFeed<R>> {
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.active = Some(ActiveSubscription { generation, sender });

        let unsettled = state
            .log
            .iter()
            .filter(|e| !state.settled.contains(&e.event_id))
            .cloned()
            .collect::<Vec<_>>();
        debug!(generation, replay = unsettled.len(), "Opened subscription");
        for event in unsettled {
            state.send(SubscriptionMessage::Event(event));
        }
        if state.live {
            state.send(SubscriptionMessage::CaughtUp);
        }

        Ok(SubscriptionFeed {
            handle: Arc::new(InMemorySubscriptionHandle {
                state: Arc::clone(&self.state),
                generation,
            }),
            messages: receiver.boxed(),
        })
    }
}

struct InMemorySubscriptionHandle<R> {
    state: Arc<Mutex<State<R>>>,
    generation: u64,
}

#[async_trait]
impl<R> Subscription for InMemorySubscriptionHandle<R>
where
    R: Clone + Send + 'static,
{
    async fn ack(&self, event_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        state.check_settlements()?;
        trace!(%event_id, "Acked event");
        state.settled.insert(event_id);
        state.acks.push(event_id);
        Ok(())
    }

    async fn nack(&self, action: NackAction, reason: &str, event_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        state.check_settlements()?;
        trace!(%event_id, %action, "Nacked event");
        state.nacks.push(NackRecord {
            event_id,
            action,
            reason: reason.to_string(),
        });
        match action {
            NackAction::Park | NackAction::Skip => {
                state.settled.insert(event_id);
            }
            NackAction::Retry => {
                let redelivery = state.log.iter().find(|e| e.event_id == event_id).cloned();
                if let Some(event) = redelivery {
                    state.send(SubscriptionMessage::Event(event));
                }
            }
            NackAction::Stop => {
                state.active = None;
            }
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state
            .active
            .as_ref()
            .is_some_and(|active| active.generation == self.generation)
        {
            debug!(generation = self.generation, "Closed subscription");
            state.active = None;
        }
    }
}
