//! Sampling window gating.
//!
//! Decoded readings are only kept while a sampling window is open. Opening a
//! window clears the history of the previous one; closing it leaves the
//! readings in place so the completed window can still be inspected and
//! summarized.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::{SensorKind, SensorReading};

/// Per-kind averages of a sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct SampleSummary {
    /// Mean temperature, if any temperature reading was captured.
    pub temperature_mean: Option<f64>,

    /// Mean carbon monoxide, if any CO reading was captured.
    pub carbon_monoxide_mean: Option<f64>,

    /// Number of temperature readings.
    pub temperature_count: usize,

    /// Number of carbon monoxide readings.
    pub carbon_monoxide_count: usize,
}

impl SampleSummary {
    /// Summarize two reading sequences, e.g. those of a published snapshot.
    #[must_use]
    pub fn from_readings(temperature: &[SensorReading], carbon_monoxide: &[SensorReading]) -> Self {
        Self {
            temperature_mean: mean(temperature),
            carbon_monoxide_mean: mean(carbon_monoxide),
            temperature_count: temperature.len(),
            carbon_monoxide_count: carbon_monoxide.len(),
        }
    }
}

/// Buffers readings while a sampling window is open.
#[derive(Debug, Default)]
pub struct SamplingGate {
    active: bool,
    ends_at: Option<DateTime<Utc>>,
    temperature: Vec<SensorReading>,
    carbon_monoxide: Vec<SensorReading>,
}

impl SamplingGate {
    /// Create a closed gate with empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an untimed window, clearing both histories.
    pub fn start(&mut self) {
        self.temperature.clear();
        self.carbon_monoxide.clear();
        self.ends_at = None;
        self.active = true;
    }

    /// Open a window that closes itself once `length` has elapsed.
    ///
    /// Readings at or past the deadline are refused by
    /// [`SamplingGate::ingest`]; [`SamplingGate::expire`] closes the window.
    pub fn start_timed(&mut self, now: DateTime<Utc>, length: Duration) {
        self.start();
        self.ends_at = Some(now + length);
    }

    /// Close the window. Histories are kept.
    pub fn stop(&mut self) {
        self.active = false;
        self.ends_at = None;
    }

    /// Close the window if its deadline has passed. Returns `true` if this
    /// call closed it.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        match self.ends_at {
            Some(deadline) if self.active && now >= deadline => {
                self.stop();
                true
            }
            _ => false,
        }
    }

    /// Append a reading if a window is open; otherwise discard it.
    ///
    /// A reading captured at or after a timed window's deadline is
    /// discarded even if [`SamplingGate::expire`] has not run yet.
    /// Returns whether the reading was kept.
    pub fn ingest(&mut self, kind: SensorKind, value: f64, now: DateTime<Utc>) -> bool {
        if !self.active || self.ends_at.is_some_and(|deadline| now >= deadline) {
            return false;
        }
        let reading = SensorReading {
            kind,
            value,
            captured_at: now,
        };
        match kind {
            SensorKind::Temperature => self.temperature.push(reading),
            SensorKind::CarbonMonoxide => self.carbon_monoxide.push(reading),
        }
        true
    }

    /// Whether a window is open.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Deadline of the open timed window.
    #[must_use]
    pub const fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at
    }

    /// Readings of one kind, in arrival order.
    #[must_use]
    pub fn readings(&self, kind: SensorKind) -> &[SensorReading] {
        match kind {
            SensorKind::Temperature => &self.temperature,
            SensorKind::CarbonMonoxide => &self.carbon_monoxide,
        }
    }

    /// Averages over the current (or last completed) window.
    #[must_use]
    pub fn summary(&self) -> SampleSummary {
        SampleSummary::from_readings(&self.temperature, &self.carbon_monoxide)
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(readings: &[SensorReading]) -> Option<f64> {
    if readings.is_empty() {
        return None;
    }
    let sum: f64 = readings.iter().map(|r| r.value).sum();
    Some(sum / readings.len() as f64)
}
