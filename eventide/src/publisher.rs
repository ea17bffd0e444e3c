//! Event publishers feed notifications from a durable subscription into a
//! callback and settle every delivered event with the backend.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, future::BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    config::SubscriptionConfig,
    subscription::{
        DropReason, NackAction, Subscription, SubscriptionClient, SubscriptionFeed,
        SubscriptionMessage,
    },
};

/// A notification handed to a publisher callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventNotification<R> {
    /// A delivered event.
    Event {
        /// Unique id of the event.
        event_id: Uuid,
        /// Logical name the event was recorded under.
        event_name: String,
        /// Encoded event.
        payload: R,
    },
    /// The subscription has delivered every historical event.
    CaughtUp,
}

/// Callback invoked for every notification.
pub type NotificationHandler<R> =
    Arc<dyn Fn(EventNotification<R>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Delivers notifications to a callback.
#[async_trait]
pub trait EventPublisher<R>: Send + Sync {
    /// Starts delivering notifications to `on_event`.
    async fn start(&self, on_event: NotificationHandler<R>) -> Result<()>;

    /// Stops delivery and releases the subscription.
    ///
    /// Idempotent, and safe to call from inside the callback.
    fn stop(&self);
}

/// What to do with an event that keeps failing after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxRetriesFailureAction {
    /// Keep the event aside for manual redelivery.
    #[default]
    Park,
    /// Discard the event.
    Skip,
}

impl From<MaxRetriesFailureAction> for NackAction {
    fn from(action: MaxRetriesFailureAction) -> Self {
        match action {
            MaxRetriesFailureAction::Park => NackAction::Park,
            MaxRetriesFailureAction::Skip => NackAction::Skip,
        }
    }
}

/// Retry policy for events whose handler fails.
#[derive(Clone)]
pub struct RetrySettings {
    max_retry_count: u32,
    delay_for_attempt: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    failure_action: MaxRetriesFailureAction,
}

impl RetrySettings {
    /// Creates retry settings with a custom delay function.
    ///
    /// `delay_for_attempt` receives the retry number, starting at 1.
    pub fn new(
        max_retry_count: u32,
        delay_for_attempt: impl Fn(u32) -> Duration + Send + Sync + 'static,
        failure_action: MaxRetriesFailureAction,
    ) -> Self {
        Self {
            max_retry_count,
            delay_for_attempt: Arc::new(delay_for_attempt),
            failure_action,
        }
    }

    /// Waits `delay` before every retry.
    pub fn fixed(max_retry_count: u32, delay: Duration, failure_action: MaxRetriesFailureAction) -> Self {
        Self::new(max_retry_count, move |_| delay, failure_action)
    }

    /// Doubles the delay after every retry, up to `max_delay`.
    pub fn exponential(
        max_retry_count: u32,
        initial_delay: Duration,
        max_delay: Duration,
        failure_action: MaxRetriesFailureAction,
    ) -> Self {
        Self::new(
            max_retry_count,
            move |attempt| {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial_delay.saturating_mul(factor).min(max_delay)
            },
            failure_action,
        )
    }

    /// Number of retries after the first attempt.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Action taken once retries are exhausted.
    pub fn failure_action(&self) -> MaxRetriesFailureAction {
        self.failure_action
    }

    /// Delay before retry number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        (self.delay_for_attempt)(attempt)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(250), MaxRetriesFailureAction::Park)
    }
}

impl fmt::Debug for RetrySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySettings")
            .field("max_retry_count", &self.max_retry_count)
            .field("failure_action", &self.failure_action)
            .finish_non_exhaustive()
    }
}

/// Outcome of a [`DropHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDecision {
    /// Open a new subscription after the given pause.
    Resubscribe {
        /// Pause before resubscribing.
        after: Duration,
    },
    /// Stop the publisher.
    Stop,
}

/// Decides how a publisher reacts when its subscription is dropped.
pub trait DropHandler: Send + Sync {
    /// Called once per drop.
    fn on_dropped(&self, reason: &DropReason) -> DropDecision;
}

/// Resubscribes after a fixed pause unless the subscription was disposed.
#[derive(Debug, Clone, Copy)]
pub struct ResubscribeOnDrop {
    delay: Duration,
}

impl ResubscribeOnDrop {
    /// Creates a handler pausing `delay` before resubscribing.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl DropHandler for ResubscribeOnDrop {
    fn on_dropped(&self, reason: &DropReason) -> DropDecision {
        match reason {
            DropReason::Disposed => DropDecision::Stop,
            _ => DropDecision::Resubscribe { after: self.delay },
        }
    }
}

/// Lifecycle states of an [`AcknowledgingPublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// Not consuming.
    Stopped,
    /// Opening a subscription.
    Subscribing,
    /// Consuming a subscription.
    Active,
    /// The subscription was dropped and the drop handler is deciding.
    Dropped,
}

struct Session {
    id: u64,
    cancel: watch::Sender<bool>,
    handle: Option<Arc<dyn Subscription>>,
}

struct Shared<R> {
    client: Arc<dyn SubscriptionClient<R>>,
    retry: RetrySettings,
    drop_handler: Arc<dyn DropHandler>,
    stream: String,
    group: String,
    state: watch::Sender<PublisherState>,
    running: watch::Sender<usize>,
    session: Mutex<Option<Session>>,
    fatal: Mutex<Option<Error>>,
    next_session: AtomicU64,
}

impl<R> Shared<R> {
    fn is_current(&self, session_id: u64) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.id == session_id)
    }

    fn set_state(&self, session_id: u64, state: PublisherState) {
        // Holding the lock keeps a concurrent stop from being overwritten.
        let session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.id == session_id) {
            self.state.send_replace(state);
        }
    }

    fn attach(&self, session_id: u64, handle: Arc<dyn Subscription>) -> bool {
        let mut session = self.session.lock();
        match session.as_mut() {
            Some(current) if current.id == session_id => {
                current.handle = Some(handle);
                self.state.send_replace(PublisherState::Active);
                true
            }
            _ => false,
        }
    }

    fn record_fatal(&self, err: Error) {
        self.fatal.lock().get_or_insert(err);
    }

    fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel.send_replace(true);
            if let Some(handle) = session.handle {
                handle.close();
            }
            info!(stream = %self.stream, group = %self.group, "Stopped event publisher");
        }
        self.state.send_replace(PublisherState::Stopped);
    }

    fn stop_session(&self, session_id: u64) {
        if self.is_current(session_id) {
            self.stop();
        }
    }
}

/// Publishes events from a durable subscription, acknowledging each one.
///
/// Every delivered event is handed to the callback. Successful events are
/// acked; failing events are retried according to the [`RetrySettings`] and
/// then parked or skipped. When the subscription drops, the [`DropHandler`]
/// decides whether to resubscribe. If the backend refuses an ack or nack the
/// publisher stops, and [`AcknowledgingPublisher::stopped`] returns
/// [`Error::SubscriptionFatal`].
pub struct AcknowledgingPublisher<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for AcknowledgingPublisher<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> fmt::Debug for AcknowledgingPublisher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgingPublisher")
            .field("stream", &self.shared.stream)
            .field("group", &self.shared.group)
            .field("state", &*self.shared.state.borrow())
            .field("retry", &self.shared.retry)
            .finish_non_exhaustive()
    }
}

impl<R> AcknowledgingPublisher<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Creates a publisher over `client` using the given retry policy.
    pub fn new(client: Arc<dyn SubscriptionClient<R>>, retry: RetrySettings) -> Self {
        Self::with_parts(
            client,
            retry,
            Arc::new(ResubscribeOnDrop::new(Duration::from_millis(1000))),
            String::new(),
            String::new(),
        )
    }

    /// Creates a publisher from a subscription descriptor.
    pub fn from_config(client: Arc<dyn SubscriptionClient<R>>, config: &SubscriptionConfig) -> Self {
        Self::with_parts(
            client,
            RetrySettings::from(&config.retry),
            Arc::new(ResubscribeOnDrop::new(config.resubscribe_delay)),
            config.stream.clone(),
            config.group.clone(),
        )
    }

    fn with_parts(
        client: Arc<dyn SubscriptionClient<R>>,
        retry: RetrySettings,
        drop_handler: Arc<dyn DropHandler>,
        stream: String,
        group: String,
    ) -> Self {
        let (state, _) = watch::channel(PublisherState::Stopped);
        let (running, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                client,
                retry,
                drop_handler,
                stream,
                group,
                state,
                running,
                session: Mutex::new(None),
                fatal: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Replaces the drop handler.
    ///
    /// Must be called before the publisher is shared.
    pub fn with_drop_handler(self, drop_handler: impl DropHandler + 'static) -> Self {
        let shared = &self.shared;
        Self::with_parts(
            Arc::clone(&shared.client),
            shared.retry.clone(),
            Arc::new(drop_handler),
            shared.stream.clone(),
            shared.group.clone(),
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PublisherState {
        *self.shared.state.borrow()
    }

    /// Waits until the publisher has stopped and its pump has exited.
    ///
    /// Returns the error that stopped it, if any. The error is handed out
    /// once.
    pub async fn stopped(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == PublisherState::Stopped).await;
        let mut running = self.shared.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
        let fatal = self.shared.fatal.lock().take();
        fatal.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl<R> EventPublisher<R> for AcknowledgingPublisher<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn start(&self, on_event: NotificationHandler<R>) -> Result<()> {
        let shared = &self.shared;
        let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = watch::channel(false);
        {
            let mut session = shared.session.lock();
            if session.is_some() {
                warn!(stream = %shared.stream, "Event publisher already started");
                return Ok(());
            }
            *session = Some(Session {
                id: session_id,
                cancel,
                handle: None,
            });
            shared.state.send_replace(PublisherState::Subscribing);
            // An error from an earlier run nobody awaited is stale now.
            shared.fatal.lock().take();
        }

        debug!(stream = %shared.stream, group = %shared.group, "Subscribing");
        let feed = match shared.client.subscribe().await {
            Ok(feed) => feed,
            Err(err) => {
                error!(error = %err, stream = %shared.stream, "Unable to open subscription");
                shared.stop_session(session_id);
                return Err(err);
            }
        };
        if !shared.attach(session_id, Arc::clone(&feed.handle)) {
            feed.handle.close();
            return Ok(());
        }
        info!(stream = %shared.stream, group = %shared.group, "Event publisher started");

        shared.running.send_modify(|n| *n += 1);
        tokio::spawn(pump(
            Arc::clone(shared),
            session_id,
            feed,
            on_event,
            cancelled,
        ));
        Ok(())
    }

    fn stop(&self) {
        self.shared.stop();
    }
}

enum Interrupt {
    Cancelled,
    Dropped(DropReason),
    Fatal(Error),
}

async fn pump<R>(
    shared: Arc<Shared<R>>,
    session_id: u64,
    mut feed: SubscriptionFeed<R>,
    on_event: NotificationHandler<R>,
    mut cancelled: watch::Receiver<bool>,
) where
    R: Clone + Send + Sync + 'static,
{
    loop {
        match consume(&shared, &mut feed, &on_event, &mut cancelled).await {
            Interrupt::Cancelled => break,
            Interrupt::Fatal(err) => {
                shared.record_fatal(err);
                shared.stop_session(session_id);
                break;
            }
            Interrupt::Dropped(reason) => {
                feed.handle.close();
                shared.set_state(session_id, PublisherState::Dropped);
                warn!(%reason, stream = %shared.stream, group = %shared.group, "Subscription dropped");
                match shared.drop_handler.on_dropped(&reason) {
                    DropDecision::Stop => {
                        shared.stop_session(session_id);
                        break;
                    }
                    DropDecision::Resubscribe { after } => {
                        match resubscribe(&shared, session_id, after, &mut cancelled).await {
                            Some(next) => feed = next,
                            None => break,
                        }
                    }
                }
            }
        }
    }
    shared.running.send_modify(|n| *n -= 1);
}

async fn resubscribe<R>(
    shared: &Shared<R>,
    session_id: u64,
    after: Duration,
    cancelled: &mut watch::Receiver<bool>,
) -> Option<SubscriptionFeed<R>> {
    loop {
        if sleep_or_cancelled(after, cancelled).await {
            return None;
        }
        shared.set_state(session_id, PublisherState::Subscribing);
        match shared.client.subscribe().await {
            Ok(feed) => {
                if !shared.attach(session_id, Arc::clone(&feed.handle)) {
                    feed.handle.close();
                    return None;
                }
                info!(stream = %shared.stream, group = %shared.group, "Resubscribed after drop");
                return Some(feed);
            }
            Err(err) => {
                warn!(error = %err, stream = %shared.stream, "Unable to resubscribe. Trying again");
            }
        }
    }
}

async fn consume<R>(
    shared: &Shared<R>,
    feed: &mut SubscriptionFeed<R>,
    on_event: &NotificationHandler<R>,
    cancelled: &mut watch::Receiver<bool>,
) -> Interrupt
where
    R: Clone + Send + Sync + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = wait_cancelled(cancelled) => return Interrupt::Cancelled,
            message = feed.messages.next() => message,
        };

        let result = match message {
            None => {
                return Interrupt::Dropped(DropReason::ServerError(
                    "subscription stream ended".into(),
                ));
            }
            Some(SubscriptionMessage::Dropped(reason)) => return Interrupt::Dropped(reason),
            Some(SubscriptionMessage::CaughtUp) => {
                let result = on_event(EventNotification::CaughtUp).await;
                if let Err(err) = &result {
                    if !is_cancelled(cancelled) {
                        error!(error = %err, "Failed to handle caught up notification");
                    }
                }
                result
            }
            Some(SubscriptionMessage::Event(event)) => {
                let notification = EventNotification::Event {
                    event_id: event.event_id,
                    event_name: event.event_name,
                    payload: event.payload,
                };
                let event_id = event.event_id;
                if let Err(interrupt) =
                    deliver(shared, &feed.handle, on_event, notification, event_id, cancelled).await
                {
                    return interrupt;
                }
                Ok(())
            }
        };

        if is_cancelled(cancelled) {
            if let Err(err) = result {
                shared.record_fatal(err);
            }
            return Interrupt::Cancelled;
        }
    }
}

// Runs the callback for one event until it succeeds or retries run out. A
// stop observed after the callback returns leaves the event unsettled.
async fn deliver<R>(
    shared: &Shared<R>,
    handle: &Arc<dyn Subscription>,
    on_event: &NotificationHandler<R>,
    notification: EventNotification<R>,
    event_id: Uuid,
    cancelled: &mut watch::Receiver<bool>,
) -> std::result::Result<(), Interrupt>
where
    R: Clone + Send + Sync + 'static,
{
    let retry = &shared.retry;
    let mut attempt = 0;
    loop {
        let result = on_event(notification.clone()).await;
        if is_cancelled(cancelled) {
            if let Err(err) = result {
                shared.record_fatal(err);
            }
            return Err(Interrupt::Cancelled);
        }

        let err = match result {
            Ok(()) => {
                return match handle.ack(event_id).await {
                    Ok(()) => {
                        trace!(%event_id, "Handled and acknowledged event");
                        Ok(())
                    }
                    Err(ack_err) => Err(settlement_failed(shared, handle, event_id, ack_err).await),
                };
            }
            Err(err) => err,
        };
        warn!(error = %err, %event_id, attempt, "Failed to handle event");

        if attempt <= retry.max_retry_count() {
            attempt += 1;
            let delay = retry.delay_for_attempt(attempt);
            info!(%event_id, attempt, ?delay, "Retrying event after delay");
            if sleep_or_cancelled(delay, cancelled).await {
                return Err(Interrupt::Cancelled);
            }
            continue;
        }

        let action = NackAction::from(retry.failure_action());
        let reason = format!(
            "{action} event {event_id} after maximum retries reached and event could not be processed successfully"
        );
        error!(%event_id, %action, "Could not handle event after maximum retries");
        return match handle.nack(action, &reason, event_id).await {
            Ok(()) => Ok(()),
            Err(nack_err) => Err(settlement_failed(shared, handle, event_id, nack_err).await),
        };
    }
}

async fn settlement_failed<R>(
    shared: &Shared<R>,
    handle: &Arc<dyn Subscription>,
    event_id: Uuid,
    err: Error,
) -> Interrupt {
    error!(
        error = %err,
        %event_id,
        stream = %shared.stream,
        group = %shared.group,
        "Failed to settle event. Stopping persistent subscription"
    );
    if let Err(stop_err) = handle
        .nack(
            NackAction::Stop,
            "Stopping subscription after unhandled error trying to process event",
            event_id,
        )
        .await
    {
        warn!(error = %stop_err, %event_id, "Unable to send stop nack");
    }
    Interrupt::Fatal(Error::SubscriptionFatal(format!(
        "unable to settle event {event_id}: {err}"
    )))
}

fn is_cancelled(cancelled: &watch::Receiver<bool>) -> bool {
    *cancelled.borrow()
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    let _ = cancelled.wait_for(|stop| *stop).await;
}

async fn sleep_or_cancelled(delay: Duration, cancelled: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_cancelled(cancelled) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
