//! Routing tables for the read path.
//!
//! A [`ProjectionRegistry`] maps logical event names to the concrete types
//! they decode into, concrete types to the projections that handle them, and
//! concrete types to the [`ProjectionContext`]s owning those projections. It
//! is built once and never mutated afterwards.
use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    future::Future,
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{BoxError, Event, Result, codec::EventCodec};

/// Lifecycle hooks of a read-model sink backing one or more projections.
///
/// Every hook defaults to a no-op.
#[async_trait]
pub trait ProjectionContext: Send + Sync {
    /// Called once before the subscription starts.
    async fn on_subscribing(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called each time the subscription catches up with the stream head.
    async fn on_caught_up(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called before this context's projections handle an event.
    async fn on_before_handle_event(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after this context's projections handled an event.
    async fn on_after_handle_event(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// A decoded event shared between the projections handling it.
pub(crate) struct ProjectedEvent {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) value: Arc<dyn Any + Send + Sync>,
}

type DecodeFn<C> =
    fn(&C, &<C as EventCodec>::Raw, &str) -> Result<Arc<dyn Any + Send + Sync>>;

fn decode_as<E: Event, C: EventCodec>(
    codec: &C,
    raw: &C::Raw,
    event_name: &str,
) -> Result<Arc<dyn Any + Send + Sync>> {
    let event: E = codec.decode(raw, event_name)?;
    Ok(Arc::new(event))
}

/// Decodes one logical event name into one concrete type.
pub(crate) struct EventDecoder<C: EventCodec> {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn<C>,
}

impl<C: EventCodec> EventDecoder<C> {
    fn of<E: Event>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            decode: decode_as::<E, C>,
        }
    }

    pub(crate) fn decode(&self, codec: &C, raw: &C::Raw, event_name: &str) -> Result<ProjectedEvent> {
        Ok(ProjectedEvent {
            type_id: self.type_id,
            type_name: self.type_name,
            value: (self.decode)(codec, raw, event_name)?,
        })
    }
}

type HandlerFn =
    dyn Fn(Arc<dyn Any + Send + Sync>) -> BoxFuture<'static, std::result::Result<(), BoxError>>
        + Send
        + Sync;

/// A single projection handler bound to one event type.
#[derive(Clone)]
pub(crate) struct Projection {
    handler: Arc<HandlerFn>,
}

impl Projection {
    fn of<E, F, Fut>(handler: F) -> Self
    where
        E: Event,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let handler = move |value: Arc<dyn Any + Send + Sync>| -> BoxFuture<'static, _> {
            match value.downcast::<E>() {
                Ok(event) => Box::pin(handler(event)),
                Err(_) => Box::pin(async {
                    Err(format!("projection expected {}", type_name::<E>()).into())
                }),
            }
        };
        Self {
            handler: Arc::new(handler),
        }
    }

    pub(crate) fn handle(
        &self,
        event: Arc<dyn Any + Send + Sync>,
    ) -> BoxFuture<'static, std::result::Result<(), BoxError>> {
        (self.handler)(event)
    }
}

/// Collects the projections of one [`ProjectionContext`].
pub struct ContextScope<C: EventCodec> {
    projections: Vec<(TypeId, Projection)>,
    default_names: Vec<(&'static str, EventDecoder<C>)>,
}

impl<C: EventCodec> ContextScope<C> {
    /// Adds a projection handling events of type `E`.
    pub fn on<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.projections
            .push((TypeId::of::<E>(), Projection::of::<E, F, Fut>(handler)));
        self.default_names
            .push((E::EVENT_NAME, EventDecoder::of::<E>()));
        self
    }
}

/// Builder for a [`ProjectionRegistry`].
pub struct ProjectionRegistryBuilder<C: EventCodec> {
    names: Vec<(String, EventDecoder<C>)>,
    projections: Vec<(TypeId, Projection, Option<Arc<dyn ProjectionContext>>)>,
    default_names: Vec<(&'static str, EventDecoder<C>)>,
    contexts: Vec<Arc<dyn ProjectionContext>>,
}

impl<C: EventCodec> ProjectionRegistryBuilder<C> {
    /// Maps `E::EVENT_NAME` to `E`.
    pub fn event<E: Event>(self) -> Self {
        self.event_as::<E>(E::EVENT_NAME)
    }

    /// Maps `name` to `E`.
    ///
    /// A name may map to several types; every one of them is decoded and
    /// dispatched when an event with that name arrives.
    pub fn event_as<E: Event>(mut self, name: impl Into<String>) -> Self {
        self.names.push((name.into(), EventDecoder::of::<E>()));
        self
    }

    /// Adds a projection that belongs to no context.
    pub fn projection<E, F, Fut>(mut self, handler: F) -> Self
    where
        E: Event,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.projections
            .push((TypeId::of::<E>(), Projection::of::<E, F, Fut>(handler), None));
        self.default_names.push((E::EVENT_NAME, EventDecoder::of::<E>()));
        self
    }

    /// Registers `context` together with the projections it backs.
    ///
    /// ```rust,ignore
    /// builder.context(Arc::clone(&orders_view), |scope| {
    ///     scope.on::<OrderPlaced, _, _>(place).on::<OrderShipped, _, _>(ship);
    /// })
    /// ```
    pub fn context<X>(
        mut self,
        context: Arc<X>,
        projections: impl FnOnce(&mut ContextScope<C>),
    ) -> Self
    where
        X: ProjectionContext + 'static,
    {
        let context: Arc<dyn ProjectionContext> = context;
        let mut scope = ContextScope {
            projections: Vec::new(),
            default_names: Vec::new(),
        };
        projections(&mut scope);
        self.default_names.extend(scope.default_names);

        if !self.contexts.iter().any(|c| same_context(c, &context)) {
            self.contexts.push(Arc::clone(&context));
        }
        for (type_id, projection) in scope.projections {
            self.projections
                .push((type_id, projection, Some(Arc::clone(&context))));
        }
        self
    }

    /// Builds the registry.
    ///
    /// Types handled by a projection but never mapped to a name are mapped
    /// to their [`Event::EVENT_NAME`].
    pub fn build(self) -> ProjectionRegistry<C> {
        let mut names: HashMap<String, Vec<EventDecoder<C>>> = HashMap::new();
        for (name, decoder) in self.names {
            push_decoder(names.entry(name).or_default(), decoder);
        }
        let mapped = names
            .values()
            .flatten()
            .map(|d| d.type_id)
            .collect::<Vec<_>>();
        for (name, decoder) in self.default_names {
            if !mapped.contains(&decoder.type_id) {
                push_decoder(names.entry(name.to_string()).or_default(), decoder);
            }
        }

        let mut projections: HashMap<TypeId, Vec<Projection>> = HashMap::new();
        let mut contexts_by_type: HashMap<TypeId, Vec<Arc<dyn ProjectionContext>>> =
            HashMap::new();
        for (type_id, projection, context) in self.projections {
            projections.entry(type_id).or_default().push(projection);
            if let Some(context) = context {
                let contexts = contexts_by_type.entry(type_id).or_default();
                if !contexts.iter().any(|c| same_context(c, &context)) {
                    contexts.push(context);
                }
            }
        }

        ProjectionRegistry {
            names,
            projections,
            contexts_by_type,
            contexts: self.contexts,
        }
    }
}

fn push_decoder<C: EventCodec>(decoders: &mut Vec<EventDecoder<C>>, decoder: EventDecoder<C>) {
    if !decoders.iter().any(|d| d.type_id == decoder.type_id) {
        decoders.push(decoder);
    }
}

fn same_context(a: &Arc<dyn ProjectionContext>, b: &Arc<dyn ProjectionContext>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Immutable routing tables consulted by the
/// [`EventDispatcher`](crate::EventDispatcher).
pub struct ProjectionRegistry<C: EventCodec> {
    names: HashMap<String, Vec<EventDecoder<C>>>,
    projections: HashMap<TypeId, Vec<Projection>>,
    contexts_by_type: HashMap<TypeId, Vec<Arc<dyn ProjectionContext>>>,
    contexts: Vec<Arc<dyn ProjectionContext>>,
}

impl<C: EventCodec> ProjectionRegistry<C> {
    /// Creates a new builder.
    pub fn builder() -> ProjectionRegistryBuilder<C> {
        ProjectionRegistryBuilder {
            names: Vec::new(),
            projections: Vec::new(),
            default_names: Vec::new(),
            contexts: Vec::new(),
        }
    }

    pub(crate) fn decoders(&self, event_name: &str) -> &[EventDecoder<C>] {
        self.names.get(event_name).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn projections_for(&self, type_id: TypeId) -> &[Projection] {
        self.projections.get(&type_id).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn contexts_for(&self, type_id: TypeId) -> &[Arc<dyn ProjectionContext>] {
        self.contexts_by_type.get(&type_id).map_or(&[], Vec::as_slice)
    }

    /// Every registered context, in registration order.
    pub fn contexts(&self) -> &[Arc<dyn ProjectionContext>] {
        &self.contexts
    }

    /// Names of the concrete types `event_name` decodes into.
    pub fn types_for(&self, event_name: &str) -> Vec<&'static str> {
        self.decoders(event_name).iter().map(|d| d.type_name).collect()
    }

    /// Number of projections handling `E`.
    pub fn projection_count<E: Event>(&self) -> usize {
        self.projections_for(TypeId::of::<E>()).len()
    }
}

impl<C: EventCodec> fmt::Debug for ProjectionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionRegistry")
            .field("names", &self.names.keys().collect::<Vec<_>>())
            .field("projections", &self.projections.len())
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
