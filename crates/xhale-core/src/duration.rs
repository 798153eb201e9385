//! Cumulative connected-time accounting.
//!
//! Each physical sensor, keyed by [`HardwareAddress`], accumulates the
//! seconds it has spent connected across every session and every install of
//! the same account. The remote store holds the authoritative total in
//! `cumulativeDuration`. While a session runs, the document also carries a
//! `startTime` marker so a reader can recover the elapsed time after an
//! ungraceful termination. A graceful session end folds the elapsed time
//! into the total and removes the marker in one write.
//!
//! [`DurationTracker`] is pure bookkeeping: it decides which writes to make
//! and the session manager performs them. Every callback is tagged with the
//! generation of the session that spawned it so late completions from an
//! earlier session are discarded.
//!
//! A session whose remote record could not be read never overwrites the
//! remote total. Its end produces [`FinalTotal::Elapsed`], which is added to
//! whatever the store holds once a read succeeds.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::store::{FieldUpdate, Fields};
use crate::types::{DeviceDuration, HardwareAddress};

/// Remote field holding the total seconds of all finished sessions.
pub const CUMULATIVE_FIELD: &str = "cumulativeDuration";

/// Remote field present only while a session is running.
pub const START_FIELD: &str = "startTime";

/// Seconds between `start` and `now`, never negative.
#[allow(clippy::cast_precision_loss)]
fn elapsed_secs(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - start).num_milliseconds().max(0) as f64 / 1000.0
}

/// Duration state of one sensor as stored remotely.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DurationRecord {
    /// Seconds accumulated by finished sessions.
    pub cumulative_secs: f64,

    /// Start of the running session, if one is in progress.
    pub session_start: Option<DateTime<Utc>>,
}

impl DurationRecord {
    /// Parse a remote document. Missing or malformed fields read as absent.
    #[must_use]
    pub fn from_fields(fields: &Fields) -> Self {
        let cumulative_secs = fields
            .get(CUMULATIVE_FIELD)
            .and_then(Value::as_f64)
            .unwrap_or_default();
        let session_start = fields
            .get(START_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            cumulative_secs,
            session_start,
        }
    }

    /// Fields of an in-progress marker document.
    #[must_use]
    pub fn marker_fields(cumulative_secs: f64, session_start: DateTime<Utc>) -> Fields {
        let mut fields = Fields::new();
        fields.insert(CUMULATIVE_FIELD.to_string(), Value::from(cumulative_secs));
        fields.insert(
            START_FIELD.to_string(),
            Value::from(session_start.to_rfc3339()),
        );
        fields
    }

    /// The single write that ends a session: store the total and drop the
    /// marker.
    #[must_use]
    pub fn finish_updates(total_secs: f64) -> Vec<FieldUpdate> {
        vec![
            FieldUpdate::Set(CUMULATIVE_FIELD.to_string(), Value::from(total_secs)),
            FieldUpdate::Delete(START_FIELD.to_string()),
        ]
    }

    /// Whether the record carries an in-progress marker.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        self.session_start.is_some()
    }

    /// Total including the running session's elapsed time.
    ///
    /// Applied to a record left behind by a crash, this recovers the time
    /// the interrupted session had accumulated.
    #[must_use]
    pub fn current(&self, now: DateTime<Utc>) -> f64 {
        self.cumulative_secs
            + self
                .session_start
                .map_or(0.0, |start| elapsed_secs(start, now))
    }
}

/// What a session end stores in `cumulativeDuration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FinalTotal {
    /// The new total, built on a remote total the session has read.
    Absolute(f64),
    /// Seconds to add to the stored total, for a session that never read it.
    Elapsed(f64),
}

impl FinalTotal {
    /// The total to write, given the total currently stored.
    #[must_use]
    pub fn resolve(self, stored_secs: f64) -> f64 {
        match self {
            Self::Absolute(total) => total,
            Self::Elapsed(elapsed) => stored_secs + elapsed,
        }
    }

    /// Whether the stored total must be read before writing.
    #[must_use]
    pub const fn needs_stored_total(self) -> bool {
        matches!(self, Self::Elapsed(_))
    }

    fn add_elapsed(self, secs: f64) -> Self {
        match self {
            Self::Absolute(total) => Self::Absolute(total + secs),
            Self::Elapsed(elapsed) => Self::Elapsed(elapsed + secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveSession {
    generation: u64,
    record: DurationRecord,
    reconciled: bool,
    last_fetch: DateTime<Utc>,
}

/// A final write that failed and is waiting to be retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingWrite {
    /// What to store.
    pub total: FinalTotal,
    /// When the last attempt was made.
    pub last_attempt: DateTime<Utc>,
}

/// Per-sensor connected-time bookkeeping.
#[derive(Debug, Default)]
pub struct DurationTracker {
    active: HashMap<HardwareAddress, ActiveSession>,
    totals: BTreeMap<HardwareAddress, f64>,
    pending: HashMap<HardwareAddress, PendingWrite>,
}

impl DurationTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for `address` at `now`.
    ///
    /// The local total is seeded from an unsent final write, then from the
    /// last published total, until the remote record is reconciled. The
    /// seed is only ever displayed, never written.
    pub fn begin(&mut self, address: HardwareAddress, generation: u64, now: DateTime<Utc>) {
        let seed = match self.pending.get(&address).map(|p| p.total) {
            Some(FinalTotal::Absolute(total)) => Some(total),
            _ => self.totals.get(&address).copied(),
        }
        .unwrap_or_default();
        debug!(address = %address, generation, seed, "Duration session started");
        self.active.insert(
            address,
            ActiveSession {
                generation,
                record: DurationRecord {
                    cumulative_secs: seed,
                    session_start: Some(now),
                },
                reconciled: false,
                last_fetch: now,
            },
        );
    }

    fn session_mut(
        &mut self,
        address: HardwareAddress,
        generation: u64,
    ) -> Option<&mut ActiveSession> {
        self.active
            .get_mut(&address)
            .filter(|s| s.generation == generation)
    }

    /// Fold a successfully read remote record into a running session.
    ///
    /// Returns the marker document to merge into the remote store, or
    /// `None` if no write is needed (or the session is stale).
    ///
    /// - An unsent final write for this sensor is resolved against the
    ///   remote total and carried by the marker.
    /// - A remote record with an in-progress marker is authoritative for
    ///   both the total and the start time.
    /// - Otherwise the remote total is adopted and a marker is written with
    ///   the local start time.
    pub fn reconcile(
        &mut self,
        address: HardwareAddress,
        generation: u64,
        remote: Option<DurationRecord>,
    ) -> Option<Fields> {
        let session = self
            .active
            .get_mut(&address)
            .filter(|s| s.generation == generation)?;
        let local_start = session.record.session_start?;
        session.reconciled = true;

        if let Some(pending) = self.pending.remove(&address) {
            let total = pending
                .total
                .resolve(remote.map_or(0.0, |r| r.cumulative_secs));
            session.record = DurationRecord {
                cumulative_secs: total,
                session_start: Some(local_start),
            };
            debug!(address = %address, total, "Unsent total carried by marker");
            return Some(DurationRecord::marker_fields(total, local_start));
        }

        match remote {
            Some(record) if record.is_in_progress() => {
                info!(
                    address = %address,
                    cumulative = record.cumulative_secs,
                    "Adopting interrupted session from remote store"
                );
                session.record = record;
                None
            }
            Some(record) => {
                session.record.cumulative_secs = record.cumulative_secs;
                Some(DurationRecord::marker_fields(record.cumulative_secs, local_start))
            }
            None => {
                session.record.cumulative_secs = 0.0;
                Some(DurationRecord::marker_fields(0.0, local_start))
            }
        }
    }

    /// Whether the running session still needs its remote record read.
    ///
    /// Returns `true` at most once per `interval` while the session is
    /// unreconciled, and records `now` as the attempt time.
    pub fn needs_fetch(
        &mut self,
        address: HardwareAddress,
        generation: u64,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> bool {
        let Some(session) = self.session_mut(address, generation) else {
            return false;
        };
        if session.reconciled || now - session.last_fetch < interval {
            return false;
        }
        session.last_fetch = now;
        true
    }

    /// Merge a remote snapshot delivered by the document listener.
    ///
    /// The remote total always wins. A remote marker is adopted when
    /// present; its absence keeps the local start, since the running session
    /// is still connected here. Returns `false` for stale snapshots.
    pub fn apply_remote(
        &mut self,
        address: HardwareAddress,
        generation: u64,
        remote: DurationRecord,
    ) -> bool {
        let Some(session) = self.session_mut(address, generation) else {
            return false;
        };
        session.record.cumulative_secs = remote.cumulative_secs;
        if let Some(start) = remote.session_start {
            session.record.session_start = Some(start);
        }
        true
    }

    /// Live total for one sensor.
    #[must_use]
    pub fn current(&self, address: &HardwareAddress, now: DateTime<Utc>) -> Option<f64> {
        self.active
            .get(address)
            .map(|s| s.record.current(now))
            .or_else(|| self.totals.get(address).copied())
    }

    /// Whether a session is running for the sensor.
    #[must_use]
    pub fn is_active(&self, address: &HardwareAddress) -> bool {
        self.active.contains_key(address)
    }

    /// End the running session and return what to store.
    ///
    /// An unreconciled session yields only its elapsed time, folded into
    /// any unsent total for the sensor. Returns `None` if no session is
    /// running, so a repeated cleanup never produces a second write.
    pub fn finish(&mut self, address: HardwareAddress, now: DateTime<Utc>) -> Option<FinalTotal> {
        let session = self.active.remove(&address)?;
        let local = session.record.current(now);
        self.totals.insert(address, local);

        let total = if session.reconciled {
            FinalTotal::Absolute(local)
        } else {
            let elapsed = session
                .record
                .session_start
                .map_or(0.0, |start| elapsed_secs(start, now));
            self.pending
                .remove(&address)
                .map_or(FinalTotal::Elapsed(elapsed), |p| p.total.add_elapsed(elapsed))
        };
        debug!(address = %address, total = ?total, "Duration session finished");
        Some(total)
    }

    /// Record a final write that failed. Replaces any earlier pending write
    /// for the sensor.
    pub fn mark_pending(&mut self, address: HardwareAddress, total: FinalTotal, now: DateTime<Utc>) {
        self.pending.insert(
            address,
            PendingWrite {
                total,
                last_attempt: now,
            },
        );
    }

    /// Drop the pending write for a sensor once it has been stored.
    pub fn clear_pending(&mut self, address: &HardwareAddress) -> Option<PendingWrite> {
        self.pending.remove(address)
    }

    /// Unsent total for a sensor.
    #[must_use]
    pub fn pending_total(&self, address: &HardwareAddress) -> Option<FinalTotal> {
        self.pending.get(address).map(|p| p.total)
    }

    /// Pending writes whose last attempt is older than `interval`, for
    /// sensors with no running session. Marks them as attempted at `now`.
    pub fn due_retries(
        &mut self,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> Vec<(HardwareAddress, FinalTotal)> {
        let active = &self.active;
        self.pending
            .iter_mut()
            .filter(|(address, p)| !active.contains_key(*address) && now - p.last_attempt >= interval)
            .map(|(address, p)| {
                p.last_attempt = now;
                (*address, p.total)
            })
            .collect()
    }

    /// Live totals for every sensor seen since start-up.
    #[must_use]
    pub fn durations(&self, now: DateTime<Utc>) -> Vec<DeviceDuration> {
        let mut addresses: Vec<HardwareAddress> = self.totals.keys().copied().collect();
        addresses.extend(self.active.keys().filter(|a| !self.totals.contains_key(*a)));
        addresses.sort_unstable();
        addresses
            .into_iter()
            .filter_map(|address| {
                self.current(&address, now).map(|seconds| DeviceDuration {
                    hardware_address: address,
                    seconds,
                    active: self.is_active(&address),
                })
            })
            .collect()
    }
}
