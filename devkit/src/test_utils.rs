/*!
Test harness for sync contexts.

Starts a `SyncContext` over a `MockBus` and a `FakeBackend`, then offers
helpers to inject bus traffic and wait for the context to apply it.
*/

use crate::fake_backend::FakeBackend;
use crate::mqtt_stub::MockBus;
use anyhow::Result;
use pioreactor_sync::context::{SyncContext, SyncView};
use pioreactor_sync::topic::{FLEET_TAG, LOGS_SUBSYSTEM, THROUGHPUT_SUBSYSTEM};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::info;

const DEFAULT_WAIT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const LOG_CAPACITY: usize = 50;

pub struct TestHarness {
    pub bus: Arc<MockBus>,
    pub backend: Arc<FakeBackend>,
    pub context: SyncContext,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("pioreactor_sync=debug"))
        .with_test_writer()
        .try_init();
}

impl TestHarness {
    pub async fn start(experiment: &str) -> Self {
        Self::start_with(experiment, FakeBackend::new()).await
    }

    pub async fn start_with(experiment: &str, backend: FakeBackend) -> Self {
        init_tracing();
        let (bus, inbound) = MockBus::new();
        let backend = Arc::new(backend);
        let context = SyncContext::start(
            experiment,
            bus.clone(),
            backend.clone(),
            inbound,
            LOG_CAPACITY,
        );
        info!(experiment, "test harness started");
        Self {
            bus,
            backend,
            context,
        }
    }

    pub fn throughput_topic(&self, unit: &str, metric: &str) -> String {
        format!(
            "{FLEET_TAG}/{unit}/{}/{THROUGHPUT_SUBSYSTEM}/{metric}",
            self.context.experiment()
        )
    }

    pub fn log_topic(&self, unit: &str, source: &str) -> String {
        format!(
            "{FLEET_TAG}/{unit}/{}/{LOGS_SUBSYSTEM}/{source}",
            self.context.experiment()
        )
    }

    pub async fn send_throughput(&self, unit: &str, metric: &str, payload: &str) -> Result<()> {
        let topic = self.throughput_topic(unit, metric);
        self.bus.simulate_incoming(&topic, payload).await
    }

    pub async fn send_log(&self, unit: &str, source: &str, payload: serde_json::Value) -> Result<()> {
        let topic = self.log_topic(unit, source);
        self.bus
            .simulate_incoming(&topic, serde_json::to_vec(&payload)?)
            .await
    }

    /// Polls the view until `predicate` holds.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SyncView>
    where
        F: Fn(&SyncView) -> bool,
    {
        let poll = async {
            loop {
                let view = self.context.view();
                if predicate(&view) {
                    return view;
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        timeout(DEFAULT_WAIT, poll)
            .await
            .map_err(|_| anyhow::anyhow!("view did not reach expected state within {DEFAULT_WAIT:?}"))
    }

    /// Waits until `count` bus messages (applied or discarded) went through.
    pub async fn wait_for_processed(&self, count: u64) -> Result<SyncView> {
        self.wait_for(|v| v.deltas_applied + v.discarded + v.recent_logs.len() as u64 >= count)
            .await
    }

    /// Waits until the backend has seen at least `count` rate fetches.
    pub async fn wait_for_rate_calls(&self, count: usize) {
        let deadline = Instant::now() + DEFAULT_WAIT;
        while self.backend.rate_calls() < count && Instant::now() < deadline {
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Lets the worker drain whatever is queued, then returns the view.
    pub async fn settle(&self, quiet: Duration) -> SyncView {
        let deadline = Instant::now() + quiet;
        while Instant::now() < deadline {
            sleep(POLL_INTERVAL).await;
        }
        self.context.view()
    }

    pub fn assert_totals(&self, unit: &str, primary: f64, secondary: f64) {
        let aggregate = self.context.aggregate();
        let row = aggregate.unit(unit);
        assert!(
            (row.primary_total - primary).abs() < 1e-9,
            "{unit} primary total {} != {primary}",
            row.primary_total
        );
        assert!(
            (row.secondary_total - secondary).abs() < 1e-9,
            "{unit} secondary total {} != {secondary}",
            row.secondary_total
        );
    }

    pub async fn shutdown(self) {
        self.context.shutdown().await;
    }
}
