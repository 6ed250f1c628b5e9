/**
 * SYNC CONTEXT - One owning context per screen / feature
 *
 * ROLE:
 * Owns the bus session, the aggregator, the rate snapshot, the unit labels and
 * the recent log buffer for a single experiment. All of that state lives inside
 * one worker task; inbound bus messages and fetch completions are fed to it
 * through channels and applied strictly one at a time.
 *
 * READERS:
 * After each applied event the worker copies a `SyncView` into a shared slot.
 * Readers take a clone of the slot and never wait on the worker.
 *
 * TEARDOWN:
 * `shutdown` (or drop) stops the worker and closes the session. Fetches still
 * in flight find the worker's channel closed and their results are dropped.
 */

use crate::api::Backend;
use crate::bus::{
    BusConnection, BusEndpoint, BusOptions, BusPublisher, ConnectionState, Identity,
    InboundMessage,
};
use crate::config::SyncConfig;
use crate::dispatch::{Command, CommandDispatcher, DispatchReceipt, DosingAutomation};
use crate::error::{ContextError, FetchError, PublishError, TransportError};
use crate::identity::{IdentityMap, IdentityResolver};
use crate::logs::{LogBuffer, LogEvent};
use crate::router::TopicRouter;
use crate::snapshot::{RateSnapshot, SnapshotReconciler, UnitRates};
use crate::telemetry::{AggregateState, Aggregator, TelemetryDelta, UnitTotals};
use crate::topic::{Topic, TopicPattern, FLEET_TAG};
use parking_lot::Mutex;
use rumqttc::QoS;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const INBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 16;

pub const TELEMETRY_QOS: QoS = QoS::AtMostOnce;
pub const LOGS_QOS: QoS = QoS::AtLeastOnce;

/// Read-only copy of a context's state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncView {
    pub experiment: String,
    pub connection: ConnectionState,
    pub aggregate: AggregateState,
    pub rates: RateSnapshot,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rates_loaded_at: Option<OffsetDateTime>,
    pub labels: IdentityMap,
    pub recent_logs: Vec<LogEvent>,
    pub deltas_applied: u64,
    pub discarded: u64,
}

/// Slot the worker writes a fresh `SyncView` into after every event. Locks
/// are held only for a copy in or out, never across an await.
pub type SharedView = Arc<Mutex<SyncView>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitRow {
    pub unit: String,
    pub label: String,
    pub totals: UnitTotals,
    pub rates: UnitRates,
}

impl SyncView {
    /// Every unit seen in either the stream or the snapshot, with its label.
    pub fn units(&self) -> Vec<UnitRow> {
        let units: BTreeSet<&String> = self
            .aggregate
            .per_unit
            .keys()
            .chain(self.rates.per_unit.keys())
            .collect();
        units
            .into_iter()
            .map(|unit| UnitRow {
                unit: unit.clone(),
                label: self.labels.resolve(unit).to_string(),
                totals: self.aggregate.unit(unit),
                rates: self.rates.unit(unit),
            })
            .collect()
    }
}

struct ContextState {
    experiment: String,
    aggregator: Aggregator,
    logs: LogBuffer,
    reconciler: SnapshotReconciler,
    identities: IdentityResolver,
    last_snapshot_seq: u64,
    discarded: u64,
}

impl ContextState {
    fn view(&self) -> SyncView {
        SyncView {
            experiment: self.experiment.clone(),
            connection: ConnectionState::Disconnected,
            aggregate: self.aggregator.state().clone(),
            rates: self.reconciler.current().clone(),
            rates_loaded_at: self.reconciler.loaded_at(),
            labels: self.identities.map().clone(),
            recent_logs: self.logs.to_vec(),
            deltas_applied: self.aggregator.applied(),
            discarded: self.discarded,
        }
    }

    fn apply_snapshot(&mut self, seq: u64, outcome: Result<RateSnapshot, FetchError>) -> Result<(), FetchError> {
        match outcome {
            Ok(_) if seq <= self.last_snapshot_seq => {
                debug!(seq, applied = self.last_snapshot_seq, "dropping out-of-date snapshot");
                Ok(())
            }
            Ok(snapshot) => {
                self.last_snapshot_seq = seq;
                self.reconciler.accept(Ok(snapshot)).map(|_| ())
            }
            Err(e) => self.reconciler.accept(Err(e)).map(|_| ()),
        }
    }
}

fn build_router(experiment: &str) -> TopicRouter<ContextState> {
    let mut router = TopicRouter::new();
    router
        .register(TopicPattern::throughput(experiment), |state: &mut ContextState, m, payload| {
            let unit = m.wildcard(0).unwrap_or_default();
            let metric = m.wildcard(1).unwrap_or_default();
            match TelemetryDelta::decode(unit, metric, payload) {
                Ok(delta) => state.aggregator.apply_delta(&delta),
                Err(e) => {
                    state.discarded += 1;
                    debug!(unit, metric, error = %e, "discarding telemetry message");
                }
            }
        })
        .register(TopicPattern::logs(experiment), |state: &mut ContextState, m, payload| {
            let unit = m.wildcard(0).unwrap_or_default();
            let source = m.wildcard(1).unwrap_or_default();
            match LogEvent::decode(unit, source, payload) {
                Ok(event) => state.logs.push(event),
                Err(e) => {
                    state.discarded += 1;
                    debug!(unit, source, error = %e, "discarding log message");
                }
            }
        });
    router
}

enum ContextEvent {
    SnapshotLoaded {
        seq: u64,
        outcome: Result<RateSnapshot, FetchError>,
        done: Option<oneshot::Sender<Result<(), FetchError>>>,
    },
    LabelsLoaded {
        outcome: Result<IdentityMap, FetchError>,
        done: Option<oneshot::Sender<bool>>,
    },
}

pub struct SyncContext {
    experiment: String,
    bus: Arc<dyn BusPublisher>,
    connection: Option<Arc<BusConnection>>,
    backend: Arc<dyn Backend>,
    dispatcher: CommandDispatcher,
    view: SharedView,
    events: mpsc::Sender<ContextEvent>,
    snapshot_seq: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl SyncContext {
    /// Connects a fresh session for `experiment`, subscribes to its telemetry
    /// and log topics, and starts the worker. Rates and labels are fetched in
    /// the background.
    pub async fn open(
        cfg: &SyncConfig,
        backend: Arc<dyn Backend>,
        experiment: &str,
        identity_base: &str,
    ) -> Result<Self, ContextError> {
        Topic::from_segments([FLEET_TAG, experiment])?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let connection = BusConnection::connect(
            BusEndpoint::from_config(cfg),
            Identity::for_context(identity_base),
            BusOptions::from_config(cfg),
            inbound_tx,
        )
        .await?;
        connection
            .subscribe(&TopicPattern::throughput(experiment).to_string(), TELEMETRY_QOS)
            .await?;
        connection
            .subscribe(&TopicPattern::logs(experiment).to_string(), LOGS_QOS)
            .await?;

        let connection = Arc::new(connection);
        let mut ctx = Self::start(
            experiment,
            connection.clone(),
            backend,
            inbound_rx,
            cfg.log_buffer,
        );
        ctx.connection = Some(connection);
        Ok(ctx)
    }

    /// Starts a context over an already-established inbound stream. `open`
    /// goes through here; so do tests driving a stub bus.
    pub fn start(
        experiment: &str,
        bus: Arc<dyn BusPublisher>,
        backend: Arc<dyn Backend>,
        inbound: mpsc::Receiver<InboundMessage>,
        log_capacity: usize,
    ) -> Self {
        let state = ContextState {
            experiment: experiment.to_string(),
            aggregator: Aggregator::new(),
            logs: LogBuffer::new(log_capacity),
            reconciler: SnapshotReconciler::new(),
            identities: IdentityResolver::new(),
            last_snapshot_seq: 0,
            discarded: 0,
        };
        let view: SharedView = Arc::new(Mutex::new(state.view()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let router = build_router(experiment);
        let worker = tokio::spawn(run_worker(state, router, inbound, events_rx, view.clone()));
        info!(experiment, "sync context started");

        let ctx = Self {
            experiment: experiment.to_string(),
            dispatcher: CommandDispatcher::new(bus.clone()),
            bus,
            connection: None,
            backend,
            view,
            events: events_tx,
            snapshot_seq: Arc::new(AtomicU64::new(0)),
            worker: Some(worker),
        };
        ctx.refresh_labels();
        ctx.refresh_snapshot();
        ctx
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.bus.state()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.connection.as_ref().map(|c| c.identity())
    }

    pub fn view(&self) -> SyncView {
        let mut view = self.view.lock().clone();
        view.connection = self.bus.state();
        view
    }

    /// The slot itself. It outlives the context, frozen at the last event the
    /// worker applied.
    pub fn view_handle(&self) -> SharedView {
        self.view.clone()
    }

    pub fn aggregate(&self) -> AggregateState {
        self.view.lock().aggregate.clone()
    }

    pub fn rates(&self) -> RateSnapshot {
        self.view.lock().rates.clone()
    }

    pub fn labels(&self) -> IdentityMap {
        self.view.lock().labels.clone()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn next_snapshot_seq(&self) -> u64 {
        self.snapshot_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fire-and-forget rate refresh.
    pub fn refresh_snapshot(&self) {
        let seq = self.next_snapshot_seq();
        let backend = self.backend.clone();
        let events = self.events.clone();
        let experiment = self.experiment.clone();
        tokio::spawn(async move {
            let outcome = backend.recent_media_rates(&experiment).await;
            let event = ContextEvent::SnapshotLoaded {
                seq,
                outcome,
                done: None,
            };
            if events.send(event).await.is_err() {
                debug!(seq, "context closed, dropping snapshot");
            }
        });
    }

    /// Fetches rates and waits until the worker has applied them. On failure
    /// the previous snapshot stays visible and the error is returned.
    pub async fn load_snapshot(&self) -> Result<(), FetchError> {
        let seq = self.next_snapshot_seq();
        let outcome = self.backend.recent_media_rates(&self.experiment).await;
        let (done_tx, done_rx) = oneshot::channel();
        let event = ContextEvent::SnapshotLoaded {
            seq,
            outcome,
            done: Some(done_tx),
        };
        if self.events.send(event).await.is_err() {
            return Ok(());
        }
        done_rx.await.unwrap_or(Ok(()))
    }

    /// Fire-and-forget label refresh.
    pub fn refresh_labels(&self) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = backend.unit_labels().await;
            if events
                .send(ContextEvent::LabelsLoaded { outcome, done: None })
                .await
                .is_err()
            {
                debug!("context closed, dropping labels");
            }
        });
    }

    /// Returns whether fresh labels were applied.
    pub async fn load_identity_map(&self) -> bool {
        let outcome = self.backend.unit_labels().await;
        let (done_tx, done_rx) = oneshot::channel();
        let event = ContextEvent::LabelsLoaded {
            outcome,
            done: Some(done_tx),
        };
        if self.events.send(event).await.is_err() {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    pub async fn dispatch(&self, command: &Command) -> Result<DispatchReceipt, PublishError> {
        let labels = self.labels();
        self.dispatcher.dispatch(command, &labels).await
    }

    /// Sets the dosing automation of `unit` within this context's experiment.
    pub async fn dispatch_dosing(
        &self,
        unit: &str,
        automation: DosingAutomation,
    ) -> Result<DispatchReceipt, PublishError> {
        let command = Command::dosing_automation(unit, self.experiment.clone(), automation);
        self.dispatch(&command).await
    }

    /// Recreates the session against the currently configured endpoint.
    pub async fn reconnect(&self, cfg: &SyncConfig) -> Result<(), TransportError> {
        match &self.connection {
            Some(connection) => connection.reconnect(BusEndpoint::from_config(cfg)).await,
            None => Ok(()),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect().await;
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!(experiment = %self.experiment, "sync context closed");
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn run_worker(
    mut state: ContextState,
    router: TopicRouter<ContextState>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    mut events: mpsc::Receiver<ContextEvent>,
    view: SharedView,
) {
    let mut inbound_open = true;
    loop {
        tokio::select! {
            msg = inbound.recv(), if inbound_open => match msg {
                Some(msg) => {
                    router.route(&mut state, &msg.topic, &msg.payload);
                }
                None => {
                    debug!(experiment = %state.experiment, "inbound stream closed");
                    inbound_open = false;
                    continue;
                }
            },
            event = events.recv() => match event {
                Some(ContextEvent::SnapshotLoaded { seq, outcome, done }) => {
                    let result = state.apply_snapshot(seq, outcome);
                    if let Some(done) = done {
                        let _ = done.send(result);
                    }
                }
                Some(ContextEvent::LabelsLoaded { outcome, done }) => {
                    let applied = state.identities.accept(outcome);
                    if let Some(done) = done {
                        let _ = done.send(applied);
                    }
                }
                None => break,
            },
        }
        *view.lock() = state.view();
    }
    debug!(experiment = %state.experiment, "context worker stopped");
}
