//! Aggregate registration and the in-memory session used by the repository.
//!
//! An aggregate is described once, at start-up, by an
//! [`AggregateRegistration`]: how to build its initial state, how to derive
//! stream and snapshot keys from its id, which command types it accepts and
//! how each registered event type folds into its state. Registrations are
//! collected into an immutable [`AggregateRegistry`] keyed by the state type.
//!
//! Routing is done through lookup tables keyed by [`TypeId`] (commands and
//! events) and by logical event name (decoding). Nothing is looked up by
//! reflection at run time.
use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    marker::PhantomData,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    Error, Event, Result,
    codec::EventCodec,
    store::{EventData, RecordedEvent},
    version::NEW_STREAM,
};

/// A type-erased event produced by a command handler.
///
/// Command handlers return `Vec<DomainEvent>`; any type implementing
/// [`Event`] converts into one with `.into()`.
pub struct DomainEvent {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
    debug: fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result,
}

impl DomainEvent {
    /// Wraps a typed event.
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            value: Box::new(event),
            debug: debug_event::<E>,
        }
    }

    /// The [`TypeId`] of the wrapped event.
    pub fn event_type(&self) -> TypeId {
        self.type_id
    }

    /// The Rust type name of the wrapped event.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrows the wrapped event as an `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }
}

impl<E: Event> From<E> for DomainEvent {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}

impl fmt::Debug for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.debug)(&*self.value, f)
    }
}

fn debug_event<E: Event>(
    value: &(dyn Any + Send + Sync),
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    match value.downcast_ref::<E>() {
        Some(event) => fmt::Debug::fmt(event, f),
        None => f.write_str(type_name::<E>()),
    }
}

type CommandHandler<S> =
    Box<dyn Fn(&S, &(dyn Any + Send + Sync)) -> Result<Vec<DomainEvent>> + Send + Sync>;
type EventApplier<S> = Box<dyn Fn(S, &DomainEvent) -> Result<S> + Send + Sync>;
type KeyFn = Box<dyn Fn(&str) -> String + Send + Sync>;

struct EventBinding<S, C: EventCodec> {
    name: &'static str,
    apply: EventApplier<S>,
    encode: fn(&C, &DomainEvent) -> Result<C::Raw>,
    decode: fn(&C, &C::Raw, &str) -> Result<DomainEvent>,
}

struct SnapshotBinding<S, C: EventCodec> {
    key: KeyFn,
    encode: fn(&C, &S) -> Result<C::Raw>,
    decode: fn(&C, &C::Raw) -> Result<S>,
}

fn encode_event<E: Event, C: EventCodec>(codec: &C, event: &DomainEvent) -> Result<C::Raw> {
    let event = event
        .downcast_ref::<E>()
        .ok_or_else(|| Error::UnregisteredEvent(event.type_name()))?;
    codec.encode(event)
}

fn decode_event<E: Event, C: EventCodec>(
    codec: &C,
    raw: &C::Raw,
    event_name: &str,
) -> Result<DomainEvent> {
    codec.decode::<E>(raw, event_name).map(DomainEvent::new)
}

fn encode_state<S: Serialize, C: EventCodec>(codec: &C, state: &S) -> Result<C::Raw> {
    codec.encode(state)
}

fn decode_state<S: DeserializeOwned, C: EventCodec>(codec: &C, raw: &C::Raw) -> Result<S> {
    codec.decode(raw, type_name::<S>())
}

/// Everything the repository needs to know about one aggregate state type.
pub struct AggregateRegistration<S, C: EventCodec> {
    initial_state: Box<dyn Fn() -> S + Send + Sync>,
    id: Option<Box<dyn Fn(&S) -> String + Send + Sync>>,
    persistence_key: KeyFn,
    snapshot: Option<SnapshotBinding<S, C>>,
    commands: HashMap<TypeId, CommandHandler<S>>,
    events: HashMap<TypeId, EventBinding<S, C>>,
    names: HashMap<&'static str, TypeId>,
    duplicate_names: Vec<&'static str>,
}

impl<S, C> AggregateRegistration<S, C>
where
    S: Clone + Send + Sync + 'static,
    C: EventCodec,
{
    /// Starts a registration whose initial state is produced by `initial_state`.
    ///
    /// The persistence key defaults to the aggregate id itself and no
    /// snapshots are taken until [`Self::snapshot_key`] is set.
    pub fn new(initial_state: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            initial_state: Box::new(initial_state),
            id: None,
            persistence_key: Box::new(|id: &str| id.to_string()),
            snapshot: None,
            commands: HashMap::new(),
            events: HashMap::new(),
            names: HashMap::new(),
            duplicate_names: Vec::new(),
        }
    }

    /// Sets the function extracting the aggregate id from its state.
    pub fn id(mut self, id: impl Fn(&S) -> String + Send + Sync + 'static) -> Self {
        self.id = Some(Box::new(id));
        self
    }

    /// Sets the function mapping an aggregate id to its stream name.
    pub fn persistence_key(mut self, key: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.persistence_key = Box::new(key);
        self
    }

    /// Enables snapshots, stored under the key produced by `key`.
    pub fn snapshot_key(mut self, key: impl Fn(&str) -> String + Send + Sync + 'static) -> Self
    where
        S: Serialize + DeserializeOwned,
    {
        self.snapshot = Some(SnapshotBinding {
            key: Box::new(key),
            encode: encode_state::<S, C>,
            decode: decode_state::<S, C>,
        });
        self
    }

    /// Routes commands of type `Cmd` to `handler`.
    ///
    /// The handler sees the current in-memory state and returns the events to
    /// record, or an error (typically [`Error::Validation`]) to reject the
    /// command.
    pub fn command<Cmd, F>(mut self, handler: F) -> Self
    where
        Cmd: Any + Send + Sync,
        F: Fn(&S, &Cmd) -> Result<Vec<DomainEvent>> + Send + Sync + 'static,
    {
        let handler: CommandHandler<S> = Box::new(move |state: &S, command: &(dyn Any + Send + Sync)| {
            let command = command
                .downcast_ref::<Cmd>()
                .ok_or(Error::UnregisteredCommand(type_name::<Cmd>()))?;
            handler(state, command)
        });
        self.commands.insert(TypeId::of::<Cmd>(), handler);
        self
    }

    /// Registers `E` under its [`Event::EVENT_NAME`] and folds it with `apply`.
    pub fn event<E, F>(self, apply: F) -> Self
    where
        E: Event,
        F: Fn(S, &E) -> S + Send + Sync + 'static,
    {
        self.event_as::<E, F>(E::EVENT_NAME, apply)
    }

    /// Registers `E` under an explicit event name and folds it with `apply`.
    pub fn event_as<E, F>(mut self, name: &'static str, apply: F) -> Self
    where
        E: Event,
        F: Fn(S, &E) -> S + Send + Sync + 'static,
    {
        let applier: EventApplier<S> = Box::new(move |state: S, event: &DomainEvent| {
            let event = event
                .downcast_ref::<E>()
                .ok_or_else(|| Error::UnregisteredEvent(event.type_name()))?;
            Ok(apply(state, event))
        });
        let type_id = TypeId::of::<E>();
        if self.names.insert(name, type_id).is_some_and(|t| t != type_id) {
            self.duplicate_names.push(name);
        }
        self.events.insert(
            type_id,
            EventBinding {
                name,
                apply: applier,
                encode: encode_event::<E, C>,
                decode: decode_event::<E, C>,
            },
        );
        self
    }

    /// Produces a fresh initial state.
    pub fn initial_state(&self) -> S {
        (self.initial_state)()
    }

    /// Extracts the aggregate id from `state`, if an id function is registered.
    pub fn aggregate_id(&self, state: &S) -> Option<String> {
        self.id.as_ref().map(|id| id(state))
    }

    /// Stream name for the aggregate with `id`.
    pub fn stream_name(&self, id: &str) -> String {
        (self.persistence_key)(id)
    }

    /// Snapshot key for the aggregate with `id`, when snapshots are enabled.
    pub fn snapshot_key_for(&self, id: &str) -> Option<String> {
        self.snapshot.as_ref().map(|s| (s.key)(id))
    }

    /// The logical name `E` is recorded under, if registered.
    pub fn event_name_of<E: Event>(&self) -> Option<&'static str> {
        self.events.get(&TypeId::of::<E>()).map(|b| b.name)
    }

    /// Runs the handler registered for `Cmd` against `state`.
    pub fn handle_command<Cmd: Any + Send + Sync>(
        &self,
        state: &S,
        command: &Cmd,
    ) -> Result<Vec<DomainEvent>> {
        let handler = self
            .commands
            .get(&TypeId::of::<Cmd>())
            .ok_or(Error::UnregisteredCommand(type_name::<Cmd>()))?;
        handler(state, command)
    }

    /// Folds one event into `state`.
    pub fn apply(&self, state: S, event: &DomainEvent) -> Result<S> {
        let binding = self
            .events
            .get(&event.event_type())
            .ok_or_else(|| Error::UnregisteredEvent(event.type_name()))?;
        (binding.apply)(state, event)
    }

    /// Runs `command` against the aggregate and folds the produced events
    /// into its state, recording them as pending.
    ///
    /// Either every produced event is applied and recorded, or none is.
    pub fn dispatch<Cmd: Any + Send + Sync>(
        &self,
        aggregate: &mut LoadedAggregate<S>,
        command: &Cmd,
    ) -> Result<usize> {
        let events = self.handle_command(&aggregate.state, command)?;
        let mut state = aggregate.state.clone();
        for event in &events {
            state = self.apply(state, event)?;
        }
        let produced = events.len();
        aggregate.state = state;
        aggregate.pending.extend(events);
        Ok(produced)
    }

    pub(crate) fn encode_event(&self, codec: &C, event: &DomainEvent) -> Result<EventData<C::Raw>> {
        let binding = self
            .events
            .get(&event.event_type())
            .ok_or_else(|| Error::UnregisteredEvent(event.type_name()))?;
        Ok(EventData::new(binding.name, (binding.encode)(codec, event)?))
    }

    pub(crate) fn decode_event(
        &self,
        codec: &C,
        record: &RecordedEvent<C::Raw>,
    ) -> Result<DomainEvent> {
        let binding = self
            .names
            .get(record.event_name.as_str())
            .and_then(|type_id| self.events.get(type_id))
            .ok_or_else(|| Error::InvalidEventType {
                event_name: record.event_name.clone(),
                expected: type_name::<S>(),
            })?;
        (binding.decode)(codec, &record.payload, &record.event_name)
    }

    pub(crate) fn encode_state(&self, codec: &C, state: &S) -> Option<Result<C::Raw>> {
        self.snapshot.as_ref().map(|s| (s.encode)(codec, state))
    }

    pub(crate) fn decode_state(&self, codec: &C, raw: &C::Raw) -> Option<Result<S>> {
        self.snapshot.as_ref().map(|s| (s.decode)(codec, raw))
    }
}

trait RegisteredAggregate: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn state_type(&self) -> &'static str;
    fn validate(&self) -> Result<()>;
}

impl<S, C> RegisteredAggregate for AggregateRegistration<S, C>
where
    S: Clone + Send + Sync + 'static,
    C: EventCodec,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn state_type(&self) -> &'static str {
        type_name::<S>()
    }

    fn validate(&self) -> Result<()> {
        match self.duplicate_names.first() {
            Some(name) => Err(Error::InvalidArgument(format!(
                "event name {name} is registered for more than one type of aggregate {}",
                type_name::<S>()
            ))),
            None => Ok(()),
        }
    }
}

/// Immutable set of aggregate registrations, keyed by state type.
pub struct AggregateRegistry<C: EventCodec> {
    registrations: HashMap<TypeId, Box<dyn RegisteredAggregate>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: EventCodec> AggregateRegistry<C> {
    /// Starts building a registry.
    pub fn builder() -> AggregateRegistryBuilder<C> {
        AggregateRegistryBuilder {
            registrations: Vec::new(),
            _codec: PhantomData,
        }
    }

    /// Returns the registration for state type `S`.
    pub fn get<S>(&self) -> Result<&AggregateRegistration<S, C>>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.registrations
            .get(&TypeId::of::<S>())
            .and_then(|r| r.as_any().downcast_ref::<AggregateRegistration<S, C>>())
            .ok_or(Error::UnregisteredAggregate(type_name::<S>()))
    }

    /// Number of registered aggregate types.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns `true` when no aggregate is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl<C: EventCodec> fmt::Debug for AggregateRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.registrations.values().map(|r| r.state_type()))
            .finish()
    }
}

/// Collects registrations before freezing them into an [`AggregateRegistry`].
pub struct AggregateRegistryBuilder<C: EventCodec> {
    registrations: Vec<(TypeId, Box<dyn RegisteredAggregate>)>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: EventCodec> AggregateRegistryBuilder<C> {
    /// Adds the registration for state type `S`.
    pub fn register<S>(mut self, registration: AggregateRegistration<S, C>) -> Self
    where
        S: Clone + Send + Sync + 'static,
    {
        self.registrations
            .push((TypeId::of::<S>(), Box::new(registration)));
        self
    }

    /// Validates the registrations and freezes the registry.
    ///
    /// Fails with [`Error::InvalidArgument`] if a state type is registered
    /// twice or one aggregate maps a single event name to several types.
    pub fn build(self) -> Result<AggregateRegistry<C>> {
        let mut registrations = HashMap::with_capacity(self.registrations.len());
        for (type_id, registration) in self.registrations {
            registration.validate()?;
            let state_type = registration.state_type();
            if registrations.insert(type_id, registration).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "aggregate {state_type} is registered more than once"
                )));
            }
        }
        Ok(AggregateRegistry {
            registrations,
            _codec: PhantomData,
        })
    }
}

/// An aggregate loaded by the repository, together with the events recorded
/// against it since it was loaded.
///
/// `state` is always the fold of the initial state over every persisted and
/// pending event.
#[derive(Debug)]
pub struct LoadedAggregate<S> {
    id: String,
    stream_name: String,
    state: S,
    version: i64,
    pending: Vec<DomainEvent>,
}

impl<S> LoadedAggregate<S> {
    pub(crate) fn new(id: String, stream_name: String, state: S, version: i64) -> Self {
        Self {
            id,
            stream_name,
            state,
            version,
            pending: Vec::new(),
        }
    }

    /// The aggregate id the session was loaded with.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stream backing the aggregate.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Current in-memory state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Position of the last persisted event, or [`NEW_STREAM`] when nothing
    /// has been persisted yet.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Events recorded since load that have not been saved yet.
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Returns `true` if nothing has been persisted for this aggregate.
    pub fn is_new(&self) -> bool {
        self.version == NEW_STREAM
    }

    /// Consumes the session and returns the state.
    pub fn into_state(self) -> S {
        self.state
    }

    pub(crate) fn mark_saved(&mut self, version: i64) {
        self.version = version;
        self.pending.clear();
    }
}
