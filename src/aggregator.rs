#![forbid(unsafe_code)]

// Latency aggregation - shared append-only sample store and summary statistics

use crate::config::RoomId;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// One completed round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySample {
    pub room_id: RoomId,
    pub username: String,
    /// 1-based index of the message within its session
    pub sequence: usize,
    pub latency: Duration,
}

/// Append-only collection of round-trip samples, written concurrently by every
/// session and summarized once after all of them have finished.
#[derive(Debug, Default)]
pub struct LatencyAggregator {
    samples: Mutex<Vec<LatencySample>>,
}

impl LatencyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: LatencySample) {
        // A poisoned lock only means another writer panicked mid-push; the Vec is still valid.
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything recorded so far
    pub fn samples(&self) -> Vec<LatencySample> {
        self.samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Summary over all samples. Intended to be called once every writer is done.
    pub fn summarize(&self) -> LatencySummary {
        let samples = self.samples();
        if samples.is_empty() {
            return LatencySummary::NoSamples;
        }

        let mut by_room: BTreeMap<RoomId, Vec<Duration>> = BTreeMap::new();
        for sample in &samples {
            by_room
                .entry(sample.room_id.clone())
                .or_default()
                .push(sample.latency);
        }

        let mut all: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
        let Some(overall) = LatencyStats::from_samples(&mut all) else {
            return LatencySummary::NoSamples;
        };

        let rooms = by_room
            .into_iter()
            .filter_map(|(room_id, mut latencies)| {
                LatencyStats::from_samples(&mut latencies).map(|stats| RoomLatency { room_id, stats })
            })
            .collect();

        LatencySummary::Collected { overall, rooms }
    }
}

/// Result of `LatencyAggregator::summarize`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum LatencySummary {
    /// Nothing was recorded; there is no mean to report.
    NoSamples,
    Collected {
        overall: LatencyStats,
        /// Sorted by room id
        rooms: Vec<RoomLatency>,
    },
}

impl LatencySummary {
    pub fn count(&self) -> usize {
        match self {
            Self::NoSamples => 0,
            Self::Collected { overall, .. } => overall.count,
        }
    }

    pub fn mean(&self) -> Option<Duration> {
        match self {
            Self::NoSamples => None,
            Self::Collected { overall, .. } => Some(overall.mean),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLatency {
    pub room_id: RoomId,
    #[serde(flatten)]
    pub stats: LatencyStats,
}

/// Statistics over a non-empty set of latencies
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    #[serde(rename = "meanMs", serialize_with = "as_millis")]
    pub mean: Duration,
    #[serde(rename = "minMs", serialize_with = "as_millis")]
    pub min: Duration,
    #[serde(rename = "maxMs", serialize_with = "as_millis")]
    pub max: Duration,
    #[serde(rename = "p50Ms", serialize_with = "as_millis")]
    pub p50: Duration,
    #[serde(rename = "p95Ms", serialize_with = "as_millis")]
    pub p95: Duration,
    #[serde(rename = "p99Ms", serialize_with = "as_millis")]
    pub p99: Duration,
}

impl LatencyStats {
    /// Sorts `samples` in place. Returns `None` for an empty slice.
    pub fn from_samples(samples: &mut [Duration]) -> Option<Self> {
        let count = samples.len();
        if count == 0 {
            return None;
        }
        samples.sort_unstable();

        let total: Duration = samples.iter().sum();
        let mean = Duration::from_nanos((total.as_nanos() / count as u128) as u64);

        Some(Self {
            count,
            mean,
            min: samples[0],
            max: samples[count - 1],
            p50: percentile(samples, 0.50),
            p95: percentile(samples, 0.95),
            p99: percentile(samples, 0.99),
        })
    }
}

/// Percentile over sorted data: the sample at index `round(p * (n - 1))`
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_nanos() as f64 / 1_000_000.0)
}
