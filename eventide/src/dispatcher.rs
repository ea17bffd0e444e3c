//! The event dispatcher: the read path of the engine.
//!
//! The dispatcher consumes notifications from an [`EventPublisher`], decodes
//! each event into every type registered under its name and fans the result
//! out to the projections in a [`ProjectionRegistry`] under a deadline.
use std::{fmt, sync::Arc};

use futures::future::{BoxFuture, join_all};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};
use uuid::Uuid;

use crate::{
    BoxError, Error, Result,
    codec::EventCodec,
    config::DispatcherConfig,
    projection::{ProjectedEvent, ProjectionContext, ProjectionRegistry},
    publisher::{EventNotification, EventPublisher, NotificationHandler},
};

struct Inner<C: EventCodec> {
    publisher: Arc<dyn EventPublisher<C::Raw>>,
    registry: Arc<ProjectionRegistry<C>>,
    codec: C,
    config: DispatcherConfig,
}

/// Dispatches published events to projections.
pub struct EventDispatcher<C: EventCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: EventCodec> Clone for EventDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: EventCodec> fmt::Debug for EventDispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<C: EventCodec> EventDispatcher<C> {
    /// Creates a dispatcher reading from `publisher`.
    pub fn new(
        publisher: Arc<dyn EventPublisher<C::Raw>>,
        registry: Arc<ProjectionRegistry<C>>,
        codec: C,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                publisher,
                registry,
                codec,
                config,
            }),
        }
    }

    /// Runs every context's `on_subscribing` hook in registration order and
    /// then starts the publisher.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        debug!("Starting event stream");
        for context in self.inner.registry.contexts() {
            context.on_subscribing().await.map_err(Error::Projection)?;
        }
        debug!("Context on_subscribing hooks called");

        let inner = Arc::clone(&self.inner);
        let on_event: NotificationHandler<C::Raw> = Arc::new(
            move |notification: EventNotification<C::Raw>| -> BoxFuture<'static, Result<()>> {
                let inner = Arc::clone(&inner);
                Box::pin(async move { inner.handle_notification(notification).await })
            },
        );
        self.inner.publisher.start(on_event).await?;
        debug!("Event publisher started");
        Ok(())
    }

    /// Stops the underlying publisher.
    pub fn stop(&self) {
        self.inner.publisher.stop();
    }

    /// Handles a single notification.
    ///
    /// This is the callback the publisher drives; it is public so hosts can
    /// feed notifications from their own sources.
    pub async fn handle_notification(&self, notification: EventNotification<C::Raw>) -> Result<()> {
        self.inner.handle_notification(notification).await
    }
}

impl<C: EventCodec> Inner<C> {
    async fn handle_notification(&self, notification: EventNotification<C::Raw>) -> Result<()> {
        match notification {
            EventNotification::Event {
                event_id,
                event_name,
                payload,
            } => self.handle_event(&payload, &event_name, event_id).await,
            EventNotification::CaughtUp => self.handle_caught_up().await,
        }
    }

    async fn handle_caught_up(&self) -> Result<()> {
        debug!("Received caught up notification");
        match self.run_caught_up_hooks().await {
            Ok(()) => {
                debug!("Context on_caught_up hooks called");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Error occurred handling caught up notification");
                if self.config.continue_after_projection_exception {
                    return Ok(());
                }
                self.publisher.stop();
                Err(Error::CaughtUpDispatchFailed {
                    source: Box::new(err),
                })
            }
        }
    }

    // Contexts are notified one at a time, in registration order.
    async fn run_caught_up_hooks(&self) -> Result<()> {
        for context in self.registry.contexts() {
            context.on_caught_up().await.map_err(Error::Projection)?;
        }
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn handle_event(&self, payload: &C::Raw, event_name: &str, event_id: Uuid) -> Result<()> {
        let decoders = self.registry.decoders(event_name);
        if decoders.is_empty() {
            trace!("No types registered for event name. Skipping");
            return Ok(());
        }

        let events = decoders
            .iter()
            .map(|decoder| decoder.decode(&self.codec, payload, event_name))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|err| error!(error = %err, "Unable to decode event"))?;

        join_all(events.into_iter().map(|event| self.dispatch(event, event_id)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    async fn dispatch(&self, event: ProjectedEvent, event_id: Uuid) -> Result<()> {
        match self.dispatch_to_projections(&event, event_id).await {
            Ok(()) => Ok(()),
            Err(err @ Error::TimeoutExceeded { .. }) => Err(err),
            Err(err) => {
                error!(error = %err, %event_id, "Error occurred handling event");
                if self.config.continue_after_projection_exception {
                    return Ok(());
                }
                self.publisher.stop();
                Err(Error::ProjectionDispatchFailed {
                    event_id,
                    source: Box::new(err),
                })
            }
        }
    }

    async fn dispatch_to_projections(&self, event: &ProjectedEvent, event_id: Uuid) -> Result<()> {
        trace!(%event_id, event_type = event.type_name, "Handling event");
        let contexts = self.registry.contexts_for(event.type_id);

        run_hooks(contexts, |context| context.on_before_handle_event()).await?;
        trace!(%event_id, "Context on_before_handle_event hooks called");

        let projections = self.registry.projections_for(event.type_id);
        if !projections.is_empty() {
            let mut tasks: Vec<JoinHandle<std::result::Result<(), BoxError>>> = projections
                .iter()
                .map(|projection| tokio::spawn(projection.handle(Arc::clone(&event.value))))
                .collect();

            let timeout = self.config.projection_handler_timeout;
            let outcome = tokio::time::timeout(timeout, join_all(tasks.iter_mut())).await;
            match outcome {
                Ok(results) => {
                    for result in results {
                        result
                            .map_err(|join_err| Error::Projection(Box::new(join_err)))?
                            .map_err(Error::Projection)?;
                    }
                }
                Err(_) => {
                    error!(%event_id, ?timeout, "Timed out waiting for projections to handle event");
                    if !self.config.continue_after_timeout {
                        for task in &tasks {
                            task.abort();
                        }
                        self.publisher.stop();
                        return Err(Error::TimeoutExceeded { event_id, timeout });
                    }
                    // Dropping the handles detaches the slow projections.
                }
            }
        }
        trace!(%event_id, "All projections completed");

        run_hooks(contexts, |context| context.on_after_handle_event()).await?;
        trace!(%event_id, "Context on_after_handle_event hooks called");
        Ok(())
    }
}

async fn run_hooks<'a, F>(contexts: &'a [Arc<dyn ProjectionContext>], hook: F) -> Result<()>
where
    F: Fn(&'a Arc<dyn ProjectionContext>) -> BoxFuture<'a, std::result::Result<(), BoxError>>,
{
    join_all(contexts.iter().map(hook))
        .await
        .into_iter()
        .collect::<std::result::Result<Vec<_>, BoxError>>()
        .map_err(Error::Projection)?;
    Ok(())
}
