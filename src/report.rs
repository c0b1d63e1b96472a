#![forbid(unsafe_code)]

// Run report - outcome counts, latency summary, console and JSON output

use crate::aggregator::{LatencyStats, LatencySummary};
use crate::session::{SessionOutcome, SessionReport};
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RESULTS_FILE: &str = "latency_results.json";
pub const SUMMARY_FILE: &str = "latency_summary.json";

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    pub run_id: String,
    pub total_sessions: usize,
    pub completed: usize,
    pub closed_early: usize,
    pub connect_failed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub messages_sent: usize,
    pub echoes_matched: usize,
    pub echo_timeouts: usize,
    pub rejected_samples: usize,
    #[serde(rename = "elapsedMs", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub latency: LatencySummary,
    /// Per-session detail, written separately to `RESULTS_FILE`
    #[serde(skip)]
    pub sessions: Vec<SessionReport>,
}

impl FleetReport {
    pub fn new(
        run_id: &str,
        sessions: Vec<SessionReport>,
        latency: LatencySummary,
        elapsed: Duration,
    ) -> Self {
        let mut report = Self {
            run_id: run_id.to_string(),
            total_sessions: sessions.len(),
            completed: 0,
            closed_early: 0,
            connect_failed: 0,
            failed: 0,
            aborted: 0,
            messages_sent: 0,
            echoes_matched: 0,
            echo_timeouts: 0,
            rejected_samples: 0,
            elapsed,
            latency,
            sessions: Vec::new(),
        };

        for session in &sessions {
            match session.outcome {
                SessionOutcome::Completed => report.completed += 1,
                SessionOutcome::ClosedEarly { .. } => report.closed_early += 1,
                SessionOutcome::ConnectFailed { .. } => report.connect_failed += 1,
                SessionOutcome::Failed { .. } => report.failed += 1,
                SessionOutcome::Aborted => report.aborted += 1,
            }
            report.messages_sent += session.messages_sent;
            report.echoes_matched += session.echoes_matched;
            report.echo_timeouts += session.echo_timeouts;
            report.rejected_samples += session.rejected_samples;
        }
        report.sessions = sessions;
        report
    }

    /// At least one sample, and every session completed without timeouts or
    /// rejected samples.
    pub fn all_clean(&self) -> bool {
        self.latency.count() > 0
            && self.completed == self.total_sessions
            && self.echo_timeouts == 0
            && self.rejected_samples == 0
    }

    pub fn print_summary(&self) {
        println!("\n=== Latency Test Summary ===");
        println!("Run: {}", self.run_id);
        println!("Sessions: {}", self.total_sessions);
        println!("  Completed: {}", self.completed);
        println!("  Closed Early: {}", self.closed_early);
        println!("  Connect Failed: {}", self.connect_failed);
        if self.failed > 0 {
            println!("  Failed: {}", self.failed);
        }
        if self.aborted > 0 {
            println!("  Aborted (deadline): {}", self.aborted);
        }
        println!("\nMessages:");
        println!("  Sent: {}", self.messages_sent);
        println!("  Echoes Matched: {}", self.echoes_matched);
        println!("  Echo Timeouts: {}", self.echo_timeouts);
        if self.rejected_samples > 0 {
            println!("  Rejected Samples: {}", self.rejected_samples);
        }

        match &self.latency {
            LatencySummary::NoSamples => {
                println!("\nNo latency data was collected.");
            }
            LatencySummary::Collected { overall, rooms } => {
                println!("\nRound-Trip Latency:");
                println!("  {}", format_stats(overall));
                if rooms.len() > 1 {
                    println!("\nPer-Room Breakdown ({} rooms):", rooms.len());
                    for room in rooms {
                        println!("  {}: {}", room.room_id, format_stats(&room.stats));
                    }
                }
            }
        }

        println!("\nElapsed: {:.2} s", self.elapsed.as_secs_f64());
        println!("============================\n");
    }

    /// Write per-session detail and the summary as pretty JSON into `dir`.
    /// Returns the paths written.
    pub fn write_json(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;

        let results = dir.join(RESULTS_FILE);
        std::fs::write(&results, serde_json::to_string_pretty(&self.sessions)?)?;

        let summary = dir.join(SUMMARY_FILE);
        std::fs::write(&summary, serde_json::to_string_pretty(self)?)?;

        Ok(vec![results, summary])
    }
}

fn format_stats(stats: &LatencyStats) -> String {
    format!(
        "avg={:.3}ms min={:.3}ms max={:.3}ms p50={:.3}ms p95={:.3}ms p99={:.3}ms (n={})",
        ms(stats.mean),
        ms(stats.min),
        ms(stats.max),
        ms(stats.p50),
        ms(stats.p95),
        ms(stats.p99),
        stats.count
    )
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
