//! Streaming aggregation of dosing throughput telemetry.
//!
//! Devices publish increments of dosed volume on
//! `pioreactor/<unit>/<experiment>/throughput_calculating/{media_throughput|alt_media_throughput}`.
//! Each message is a delta; the aggregator accumulates them per unit and keeps
//! fleet totals that are recomputed from the per-unit rows after every update.
//!
//! The aggregator is a pure accumulator: a delta delivered twice is counted
//! twice. That is the price of at-least-once delivery and is not filtered here.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `media_throughput`
    Primary,
    /// `alt_media_throughput`
    Secondary,
}

impl Metric {
    pub fn from_topic_segment(segment: &str) -> Result<Self, DecodeError> {
        match segment {
            "media_throughput" => Ok(Metric::Primary),
            "alt_media_throughput" => Ok(Metric::Secondary),
            other => Err(DecodeError::UnknownMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryDelta {
    pub unit: String,
    pub metric: Metric,
    pub value: f64,
    pub received_at: OffsetDateTime,
}

impl TelemetryDelta {
    pub fn new(unit: impl Into<String>, metric: Metric, value: f64) -> Self {
        Self {
            unit: unit.into(),
            metric,
            value,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    /// Decodes a UTF-8 decimal payload. Non-finite values are rejected so a
    /// single `NaN` cannot poison the running totals.
    pub fn decode(unit: &str, metric_segment: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let metric = Metric::from_topic_segment(metric_segment)?;
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
        let trimmed = text.trim();
        let value: f64 = trimmed
            .parse()
            .map_err(|_| DecodeError::NotNumeric(trimmed.to_string()))?;
        if !value.is_finite() {
            return Err(DecodeError::NotFinite(trimmed.to_string()));
        }
        Ok(Self::new(unit, metric, value))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitTotals {
    pub primary_total: f64,
    pub secondary_total: f64,
}

impl UnitTotals {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Primary => self.primary_total,
            Metric::Secondary => self.secondary_total,
        }
    }

    fn get_mut(&mut self, metric: Metric) -> &mut f64 {
        match metric {
            Metric::Primary => &mut self.primary_total,
            Metric::Secondary => &mut self.secondary_total,
        }
    }
}

/// Per-unit totals plus fleet totals. Invariant: each fleet total equals the
/// sum of the corresponding per-unit totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub per_unit: BTreeMap<String, UnitTotals>,
    pub fleet_totals: UnitTotals,
}

impl AggregateState {
    pub fn unit(&self, unit: &str) -> UnitTotals {
        self.per_unit.get(unit).copied().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    state: AggregateState,
    applied: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_delta(&mut self, delta: &TelemetryDelta) {
        *self
            .state
            .per_unit
            .entry(delta.unit.clone())
            .or_default()
            .get_mut(delta.metric) += delta.value;

        // Summed from the rows rather than carried forward, so the fleet
        // figure never drifts from the rows it is shown next to.
        let fleet: f64 = self
            .state
            .per_unit
            .values()
            .map(|totals| totals.get(delta.metric))
            .sum();
        *self.state.fleet_totals.get_mut(delta.metric) = fleet;
        self.applied += 1;
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    /// Number of deltas applied since creation.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary(unit: &str, value: f64) -> TelemetryDelta {
        TelemetryDelta::new(unit, Metric::Primary, value)
    }

    fn assert_fleet_is_row_sum(state: &AggregateState) {
        let primary: f64 = state.per_unit.values().map(|t| t.primary_total).sum();
        let secondary: f64 = state.per_unit.values().map(|t| t.secondary_total).sum();
        assert_eq!(state.fleet_totals.primary_total, primary);
        assert_eq!(state.fleet_totals.secondary_total, secondary);
    }

    #[test]
    fn accumulates_per_unit_and_fleet() {
        let mut agg = Aggregator::new();
        agg.apply_delta(&primary("u1", 2.5));
        agg.apply_delta(&primary("u2", 1.0));
        agg.apply_delta(&primary("u1", 0.5));

        let state = agg.state();
        assert_eq!(state.unit("u1").primary_total, 3.0);
        assert_eq!(state.unit("u2").primary_total, 1.0);
        assert_eq!(state.fleet_totals.primary_total, 4.0);
        assert_eq!(state.fleet_totals.secondary_total, 0.0);
        assert_eq!(agg.applied(), 3);
    }

    #[test]
    fn fleet_equals_row_sum_after_every_application() {
        let mut agg = Aggregator::new();
        let units = ["u1", "u2", "u3", "u4"];
        for i in 0..500u32 {
            let metric = if i % 3 == 0 { Metric::Secondary } else { Metric::Primary };
            let value = f64::from(i % 17) * 0.1 + 0.013;
            agg.apply_delta(&TelemetryDelta::new(units[(i % 4) as usize], metric, value));
            assert_fleet_is_row_sum(agg.state());
        }
    }

    #[test]
    fn duplicate_delivery_is_counted_twice() {
        let mut agg = Aggregator::new();
        let delta = primary("u1", 1.25);
        agg.apply_delta(&delta);
        agg.apply_delta(&delta);

        assert_eq!(agg.state().unit("u1").primary_total, 2.5);
        assert_eq!(agg.state().fleet_totals.primary_total, 2.5);
    }

    #[test]
    fn order_does_not_matter() {
        let d1 = primary("u1", 0.75);
        let d2 = TelemetryDelta::new("u2", Metric::Secondary, 1.5);
        let d3 = primary("u1", 0.5);

        let mut forward = Aggregator::new();
        for d in [&d1, &d2, &d3] {
            forward.apply_delta(d);
        }
        let mut backward = Aggregator::new();
        for d in [&d3, &d2, &d1] {
            backward.apply_delta(d);
        }

        assert_eq!(forward.state(), backward.state());
    }

    #[test]
    fn unseen_unit_reads_as_zero() {
        let agg = Aggregator::new();
        assert_eq!(agg.state().unit("ghost"), UnitTotals::default());
    }

    #[test]
    fn decodes_decimal_payloads() {
        let delta = TelemetryDelta::decode("u1", "alt_media_throughput", b" 0.75\n").unwrap();
        assert_eq!(delta.unit, "u1");
        assert_eq!(delta.metric, Metric::Secondary);
        assert_eq!(delta.value, 0.75);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            TelemetryDelta::decode("u1", "media_throughput", b"abc"),
            Err(DecodeError::NotNumeric(_))
        ));
        assert!(matches!(
            TelemetryDelta::decode("u1", "media_throughput", &[0xff, 0xfe]),
            Err(DecodeError::NotUtf8)
        ));
        assert!(matches!(
            TelemetryDelta::decode("u1", "media_throughput", b"NaN"),
            Err(DecodeError::NotFinite(_))
        ));
        assert!(matches!(
            TelemetryDelta::decode("u1", "od_reading", b"1.0"),
            Err(DecodeError::UnknownMetric(_))
        ));
    }
}
