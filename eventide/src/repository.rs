//! Provides the aggregate repository: the write path of the engine.
use std::{
    any::{Any, type_name},
    sync::Arc,
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    Error, Result,
    aggregate::{AggregateRegistration, AggregateRegistry, DomainEvent, LoadedAggregate},
    codec::EventCodec,
    snapshot::{SnapshotPolicy, SnapshotStore},
    store::{RecordedEvent, StreamStore},
    version::{ExpectedVersion, NEW_STREAM},
};

/// Callback receiving stream records that could not be decoded.
pub type DecodeErrorHandler<R> = Arc<dyn Fn(&RecordedEvent<R>, &Error) + Send + Sync>;

/// A high-level repository for loading and saving aggregates.
///
/// This repository drives the common load-dispatch-save cycle by
/// orchestrating the [`AggregateRegistry`], a [`StreamStore`] and an optional
/// [`SnapshotStore`]. It holds no per-aggregate state and can be shared
/// freely between tasks.
pub struct AggregateRepository<St, Sn, C: EventCodec> {
    store: Arc<St>,
    snapshot_store: Option<Arc<Sn>>,
    registry: Arc<AggregateRegistry<C>>,
    codec: C,
    snapshot_policy: SnapshotPolicy,
    on_decode_error: Option<DecodeErrorHandler<C::Raw>>,
}

impl<St, Sn, C> AggregateRepository<St, Sn, C>
where
    C: EventCodec,
    St: StreamStore<Raw = C::Raw>,
    Sn: SnapshotStore<Raw = C::Raw>,
{
    /// Creates a new `AggregateRepository`.
    pub fn new(
        store: Arc<St>,
        snapshot_store: Option<Arc<Sn>>,
        registry: Arc<AggregateRegistry<C>>,
        codec: C,
    ) -> Self {
        Self {
            store,
            snapshot_store,
            registry,
            codec,
            snapshot_policy: SnapshotPolicy::Never,
            on_decode_error: None,
        }
    }

    /// Sets the frequency at which snapshots should be created.
    ///
    /// For example, a value of `Some(100)` means a snapshot will be created
    /// every 100 events. Only aggregates registered with a snapshot key are
    /// snapshotted.
    pub fn with_snapshot_frequency(mut self, frequency: Option<u64>) -> Self {
        self.snapshot_policy = SnapshotPolicy::from(frequency);
        self
    }

    /// Sets the callback receiving records that fail to decode while loading.
    ///
    /// Undecodable records are skipped whether or not a callback is set.
    pub fn with_decode_error_handler(
        mut self,
        handler: impl Fn(&RecordedEvent<C::Raw>, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_decode_error = Some(Arc::new(handler));
        self
    }

    /// The registry this repository routes through.
    pub fn registry(&self) -> &AggregateRegistry<C> {
        &self.registry
    }

    /// Loads the aggregate with `id`.
    ///
    /// Starts from the latest snapshot when one exists and replays the events
    /// recorded after it. A missing stream is not an error: it yields the
    /// initial state at version [`NEW_STREAM`].
    #[instrument(skip(self), fields(aggregate = type_name::<S>()))]
    pub async fn load<S>(&self, id: &str) -> Result<LoadedAggregate<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        if id.is_empty() {
            return Err(Error::InvalidArgument("aggregate id must not be empty".into()));
        }
        let registration = self.registry.get::<S>()?;
        let stream_name = registration.stream_name(id);

        // Attempt to hydrate the aggregate from a snapshot first so we can
        // replay only the delta of events that occurred afterwards.
        let (mut state, mut version) = match self.load_snapshot(registration, id).await? {
            Some(hydrated) => hydrated,
            None => (registration.initial_state(), NEW_STREAM),
        };

        let records = self.store.read(&stream_name, version + 1).await?;
        debug!(stream = %stream_name, count = records.len(), from = version + 1, "Read events");

        for record in &records {
            match registration.decode_event(&self.codec, record) {
                Ok(event) => state = registration.apply(state, &event)?,
                Err(err) if err.is_decode_failure() => self.report_decode_failure(record, &err),
                Err(err) => return Err(err),
            }
            version = record.position;
        }

        Ok(LoadedAggregate::new(
            id.to_string(),
            stream_name,
            state,
            version,
        ))
    }

    /// Runs `command` against the in-memory state of `aggregate`.
    ///
    /// The produced events are folded into the state immediately and queued
    /// for the next [`Self::save`]. No I/O happens here. Returns the events
    /// the command produced.
    pub fn dispatch_command<'a, S, Cmd>(
        &self,
        aggregate: &'a mut LoadedAggregate<S>,
        command: Cmd,
    ) -> Result<&'a [DomainEvent]>
    where
        S: Clone + Send + Sync + 'static,
        Cmd: Any + Send + Sync,
    {
        let registration = self.registry.get::<S>()?;
        let produced = registration.dispatch(aggregate, &command)?;
        trace_dispatch::<S, Cmd>(produced);
        let pending = aggregate.pending_events();
        Ok(&pending[pending.len() - produced..])
    }

    /// Appends the pending events of `aggregate` to its stream and returns
    /// the new stream version.
    ///
    /// The append expects the stream to still be at the version the
    /// aggregate was loaded at; otherwise [`Error::Conflict`] is returned and
    /// the aggregate is left untouched so the caller can reload and retry.
    #[instrument(skip(self, aggregate), fields(stream = aggregate.stream_name(), version = aggregate.version()))]
    pub async fn save<S>(&self, aggregate: &mut LoadedAggregate<S>) -> Result<i64>
    where
        S: Clone + Send + Sync + 'static,
    {
        if aggregate.pending_events().is_empty() {
            debug!("No pending events. Nothing to save");
            return Ok(aggregate.version());
        }
        let registration = self.registry.get::<S>()?;

        let events = aggregate
            .pending_events()
            .iter()
            .map(|event| registration.encode_event(&self.codec, event))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|err| {
                error!(error = %err, "Unable to serialize events. Aborting write to stream");
            })?;

        let version_before = aggregate.version();
        let expected = ExpectedVersion::after(version_before);
        debug!(count = events.len(), %expected, "Appending events to stream");

        let version = self
            .store
            .append(aggregate.stream_name(), expected, events)
            .await
            .inspect_err(|err| error!(error = %err, "Unable to save events to stream"))?;

        aggregate.mark_saved(version);

        if self
            .snapshot_policy
            .should_snapshot(version_before, version)
        {
            self.save_snapshot(registration, aggregate).await;
        }

        Ok(version)
    }

    /// Loads the aggregate, dispatches `command` and saves the result.
    pub async fn execute<S, Cmd>(&self, id: &str, command: Cmd) -> Result<LoadedAggregate<S>>
    where
        S: Clone + Send + Sync + 'static,
        Cmd: Any + Send + Sync,
    {
        let mut aggregate = self.load::<S>(id).await?;
        self.dispatch_command(&mut aggregate, command)?;
        self.save(&mut aggregate).await?;
        Ok(aggregate)
    }

    async fn load_snapshot<S>(
        &self,
        registration: &AggregateRegistration<S, C>,
        id: &str,
    ) -> Result<Option<(S, i64)>>
    where
        S: Clone + Send + Sync + 'static,
    {
        let (Some(snapshot_store), Some(key)) =
            (&self.snapshot_store, registration.snapshot_key_for(id))
        else {
            return Ok(None);
        };

        let Some(snapshot) = snapshot_store.load(&key).await? else {
            debug!(key, "No snapshot found");
            return Ok(None);
        };
        if snapshot.version() < 0 {
            return Ok(None);
        }

        match registration.decode_state(&self.codec, snapshot.payload()) {
            Some(Ok(state)) => {
                debug!(key, version = snapshot.version(), "Loaded snapshot");
                Ok(Some((state, snapshot.version())))
            }
            Some(Err(err)) => {
                warn!(error = %err, key, "Unable to decode snapshot. Replaying full stream");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // Snapshot writes never fail a save: the events are already committed and
    // the next snapshot write will catch up.
    async fn save_snapshot<S>(
        &self,
        registration: &AggregateRegistration<S, C>,
        aggregate: &LoadedAggregate<S>,
    ) where
        S: Clone + Send + Sync + 'static,
    {
        let (Some(snapshot_store), Some(key)) = (
            &self.snapshot_store,
            registration.snapshot_key_for(aggregate.id()),
        ) else {
            return;
        };

        let payload = match registration.encode_state(&self.codec, aggregate.state()) {
            Some(Ok(payload)) => payload,
            Some(Err(err)) => {
                warn!(error = %err, key, "Unable to encode snapshot state");
                return;
            }
            None => return,
        };

        match snapshot_store.save(&key, aggregate.version(), payload).await {
            Ok(()) => debug!(key, version = aggregate.version(), "Saved snapshot"),
            Err(err) => warn!(error = %err, key, "Unable to save snapshot"),
        }
    }

    fn report_decode_failure(&self, record: &RecordedEvent<C::Raw>, err: &Error) {
        match &self.on_decode_error {
            Some(handler) => {
                handler(record, err);
                info!(
                    error = %err,
                    stream = %record.stream,
                    position = record.position,
                    "Error deserializing event. Called error handler"
                );
            }
            None => warn!(
                error = %err,
                stream = %record.stream,
                position = record.position,
                "Error deserializing event and no error handler set up. This may cause data inconsistencies"
            ),
        }
    }
}

fn trace_dispatch<S, Cmd>(produced: usize) {
    tracing::trace!(
        aggregate = type_name::<S>(),
        command = type_name::<Cmd>(),
        produced,
        "Dispatched command"
    );
}
