use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ObservationError;

/// Default number of historical samples kept in a window.
pub const DEFAULT_WINDOW_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Reasoning,
    Done,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    Start,
    WindowReady,
    /// Analysis finished; `degraded` is set when the preferred backend was not used.
    Analyzed { degraded: bool },
    /// Input could not be fetched; the cycle is abandoned.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn is_alerting(self) -> bool {
        self != Severity::Normal
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an [`AnalysisResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Remote,
    Cached,
    Heuristic,
}

impl ResultSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultSource::Remote => "remote",
            ResultSource::Cached => "cached",
            ResultSource::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag attached to every record written downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Prediction,
    Alert,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Prediction => "prediction",
            Origin::Alert => "alert",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bed-occupancy sample. Construct through [`Observation::new`] so the
/// `occupied <= total_capacity` invariant holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    timestamp: DateTime<Utc>,
    total_capacity: u32,
    occupied: u32,
}

impl Observation {
    pub fn new(
        timestamp: DateTime<Utc>,
        total_capacity: u32,
        occupied: u32,
    ) -> Result<Self, ObservationError> {
        if occupied > total_capacity {
            return Err(ObservationError::OverCapacity {
                occupied,
                total_capacity,
            });
        }

        Ok(Self {
            timestamp,
            total_capacity,
            occupied,
        })
    }

    /// Snapshot used when the source has no rows for a unit yet.
    pub fn empty(timestamp: DateTime<Utc>, total_capacity: u32) -> Self {
        Self {
            timestamp,
            total_capacity,
            occupied: 0,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn total_capacity(&self) -> u32 {
        self.total_capacity
    }

    pub fn occupied(&self) -> u32 {
        self.occupied
    }
}

/// Bounded history (most recent first) plus the latest snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    history: Vec<Observation>,
    current: Observation,
}

impl SampleWindow {
    pub fn build(history: Vec<Observation>, current: Observation) -> Self {
        Self::build_bounded(history, current, DEFAULT_WINDOW_LEN)
    }

    /// Keeps at most `limit` samples from the front of `history`.
    pub fn build_bounded(
        mut history: Vec<Observation>,
        current: Observation,
        limit: usize,
    ) -> Self {
        history.truncate(limit);
        Self { history, current }
    }

    pub fn history(&self) -> &[Observation] {
        &self.history
    }

    pub fn current(&self) -> &Observation {
        &self.current
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Mean of `occupied` across the history, or `current.occupied` when the
    /// history is empty.
    pub fn average_occupied(&self) -> f64 {
        if self.history.is_empty() {
            return f64::from(self.current.occupied);
        }

        let total: u64 = self.history.iter().map(|o| u64::from(o.occupied)).sum();
        total as f64 / self.history.len() as f64
    }
}

/// Forecast and risk judgment for one cycle. This is the JSON shape shared
/// with the remote backend and the cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub forecast: u32,
    pub forecast_reasoning: String,
    pub severity: Severity,
    pub risk_reasoning: String,
    pub action_plan: String,
    pub source: ResultSource,
}
