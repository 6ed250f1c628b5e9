/*!
Scripted leader REST collaborator.

Rate responses are queued per call; once the queue is empty the last
configured default answers. Any response can carry a delay so tests can
reorder completions.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use pioreactor_sync::api::{
    AutomationDefinition, Backend, Experiment, ExportRequest, ExportedDataset,
};
use pioreactor_sync::error::FetchError;
use pioreactor_sync::identity::IdentityMap;
use pioreactor_sync::snapshot::RateSnapshot;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone)]
struct Scripted<T> {
    outcome: Option<T>,
    delay: Duration,
}

impl<T> Scripted<T> {
    async fn resolve(self, path: &str) -> Result<T, FetchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.ok_or_else(|| FetchError::Status {
            path: path.to_string(),
            status: UNAVAILABLE,
        })
    }
}

pub struct FakeBackend {
    automations: Mutex<Vec<AutomationDefinition>>,
    experiments: Mutex<Vec<Experiment>>,
    labels: Mutex<Option<IdentityMap>>,
    rates_queue: Mutex<VecDeque<Scripted<RateSnapshot>>>,
    rates_default: Mutex<Option<RateSnapshot>>,
    export: Mutex<Result<ExportedDataset, String>>,
    rate_calls: AtomicUsize,
    label_calls: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            automations: Mutex::new(Vec::new()),
            experiments: Mutex::new(Vec::new()),
            labels: Mutex::new(Some(IdentityMap::default())),
            rates_queue: Mutex::new(VecDeque::new()),
            rates_default: Mutex::new(Some(RateSnapshot::default())),
            export: Mutex::new(Err("no export scripted".into())),
            rate_calls: AtomicUsize::new(0),
            label_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_automations(self, automations: Vec<AutomationDefinition>) -> Self {
        *self.automations.lock() = automations;
        self
    }

    pub fn with_experiments(self, experiments: Vec<Experiment>) -> Self {
        *self.experiments.lock() = experiments;
        self
    }

    /// `None` makes the labels endpoint fail.
    pub fn set_labels(&self, labels: Option<IdentityMap>) {
        *self.labels.lock() = labels;
    }

    /// Answer for every rate fetch once the queue is drained. `None` fails.
    pub fn set_rates(&self, rates: Option<RateSnapshot>) {
        *self.rates_default.lock() = rates;
    }

    /// Answer for exactly one upcoming rate fetch.
    pub fn queue_rates(&self, rates: Option<RateSnapshot>, delay: Duration) {
        self.rates_queue.lock().push_back(Scripted {
            outcome: rates,
            delay,
        });
    }

    pub fn set_export(&self, outcome: Result<ExportedDataset, String>) {
        *self.export.lock() = outcome;
    }

    pub fn rate_calls(&self) -> usize {
        self.rate_calls.load(Ordering::SeqCst)
    }

    pub fn label_calls(&self) -> usize {
        self.label_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn dosing_automations(&self) -> Result<Vec<AutomationDefinition>, FetchError> {
        Ok(self.automations.lock().clone())
    }

    async fn recent_media_rates(&self, experiment: &str) -> Result<RateSnapshot, FetchError> {
        self.rate_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.rates_queue.lock().pop_front().unwrap_or_else(|| Scripted {
            outcome: self.rates_default.lock().clone(),
            delay: Duration::ZERO,
        });
        scripted
            .resolve(&format!("/recent_media_rates/{experiment}"))
            .await
    }

    async fn unit_labels(&self) -> Result<IdentityMap, FetchError> {
        self.label_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.labels.lock().clone();
        Scripted {
            outcome,
            delay: Duration::ZERO,
        }
        .resolve("/get_current_unit_labels")
        .await
    }

    async fn experiments(&self) -> Result<Vec<Experiment>, FetchError> {
        Ok(self.experiments.lock().clone())
    }

    async fn export_datasets(&self, _request: &ExportRequest) -> Result<ExportedDataset, FetchError> {
        self.export.lock().clone().map_err(FetchError::Export)
    }
}
