//! Dosing rate snapshots fetched from the backend.
//!
//! A snapshot is a flow (ml/h over the recent window), not a cumulative
//! total; it is shown beside the streamed aggregate and never folded into it.
//! Each successful fetch replaces the previous snapshot wholesale. A failed
//! fetch leaves the previous snapshot visible.

use crate::error::FetchError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Key of the fleet-wide row in the backend response.
pub const FLEET_ROW: &str = "all";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitRates {
    #[serde(rename = "mediaRate", default)]
    pub primary_rate: f64,
    #[serde(rename = "altMediaRate", default)]
    pub secondary_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub per_unit: BTreeMap<String, UnitRates>,
    pub fleet_rate: UnitRates,
}

impl RateSnapshot {
    /// Builds a snapshot from `{all: {...}, <unit>: {...}, ...}`. Without an
    /// `all` row the fleet rate is the sum of the unit rows.
    pub fn from_rows(mut rows: HashMap<String, UnitRates>) -> Self {
        let fleet = rows.remove(FLEET_ROW);
        let per_unit: BTreeMap<String, UnitRates> = rows.into_iter().collect();
        let fleet_rate = fleet.unwrap_or_else(|| UnitRates {
            primary_rate: per_unit.values().map(|r| r.primary_rate).sum(),
            secondary_rate: per_unit.values().map(|r| r.secondary_rate).sum(),
        });
        Self { per_unit, fleet_rate }
    }

    pub fn unit(&self, unit: &str) -> UnitRates {
        self.per_unit.get(unit).copied().unwrap_or_default()
    }
}

/// Holds the latest good snapshot for one experiment.
#[derive(Debug, Default)]
pub struct SnapshotReconciler {
    current: RateSnapshot,
    loaded_at: Option<OffsetDateTime>,
}

impl SnapshotReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// All zeros until the first successful load.
    pub fn current(&self) -> &RateSnapshot {
        &self.current
    }

    pub fn loaded_at(&self) -> Option<OffsetDateTime> {
        self.loaded_at
    }

    /// Applies a fetch outcome: success replaces, failure keeps what we had.
    pub fn accept(
        &mut self,
        outcome: Result<RateSnapshot, FetchError>,
    ) -> Result<&RateSnapshot, FetchError> {
        match outcome {
            Ok(snapshot) => {
                debug!(units = snapshot.per_unit.len(), "rate snapshot replaced");
                self.current = snapshot;
                self.loaded_at = Some(OffsetDateTime::now_utc());
                Ok(&self.current)
            }
            Err(e) => {
                warn!(error = %e, "rate snapshot refresh failed, keeping previous values");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(primary: f64, secondary: f64) -> UnitRates {
        UnitRates {
            primary_rate: primary,
            secondary_rate: secondary,
        }
    }

    fn snapshot(u1: f64) -> RateSnapshot {
        RateSnapshot::from_rows(HashMap::from([
            ("all".to_string(), rates(u1 + 1.0, 0.0)),
            ("u1".to_string(), rates(u1, 0.0)),
            ("u2".to_string(), rates(1.0, 0.0)),
        ]))
    }

    #[test]
    fn parses_backend_shape() {
        let rows: HashMap<String, UnitRates> = serde_json::from_str(
            r#"{"all": {"mediaRate": 3.0, "altMediaRate": 1.0},
                "u1": {"mediaRate": 2.0, "altMediaRate": 0.5},
                "u2": {"mediaRate": 1.0, "altMediaRate": 0.5}}"#,
        )
        .unwrap();
        let snap = RateSnapshot::from_rows(rows);
        assert_eq!(snap.fleet_rate, rates(3.0, 1.0));
        assert_eq!(snap.unit("u1"), rates(2.0, 0.5));
        assert!(!snap.per_unit.contains_key("all"));
    }

    #[test]
    fn missing_fleet_row_sums_units() {
        let snap = RateSnapshot::from_rows(HashMap::from([
            ("u1".to_string(), rates(2.0, 0.25)),
            ("u2".to_string(), rates(1.0, 0.25)),
        ]));
        assert_eq!(snap.fleet_rate, rates(3.0, 0.5));
    }

    #[test]
    fn starts_all_zero() {
        let reconciler = SnapshotReconciler::new();
        assert_eq!(reconciler.current(), &RateSnapshot::default());
        assert!(reconciler.loaded_at().is_none());
    }

    #[test]
    fn success_replaces_wholesale() {
        let mut reconciler = SnapshotReconciler::new();
        reconciler.accept(Ok(snapshot(2.0))).unwrap();
        reconciler
            .accept(Ok(RateSnapshot::from_rows(HashMap::from([(
                "u3".to_string(),
                rates(0.5, 0.0),
            )]))))
            .unwrap();

        let current = reconciler.current();
        assert_eq!(current.per_unit.len(), 1);
        assert_eq!(current.unit("u1"), UnitRates::default());
        assert_eq!(current.unit("u3"), rates(0.5, 0.0));
    }

    #[test]
    fn failure_keeps_previous_snapshot() {
        let mut reconciler = SnapshotReconciler::new();
        reconciler.accept(Ok(snapshot(2.0))).unwrap();
        let before = reconciler.current().clone();

        let result = reconciler.accept(Err(FetchError::Status {
            path: "/recent_media_rates/expA".into(),
            status: 500,
        }));

        assert!(result.is_err());
        assert_eq!(reconciler.current(), &before);
    }
}
