#![forbid(unsafe_code)]

// Fleet orchestration - launch every session, gate the start, collect reports

use crate::aggregator::LatencyAggregator;
use crate::barrier::{ReadyLatch, StartBarrier};
use crate::config::{FleetConfig, RunSettings};
use crate::protocol::new_run_id;
use crate::report::FleetReport;
use crate::session::{Session, SessionContext, SessionOutcome, SessionReport, SessionSettings};
use crate::transport::Transport;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::timeout_at;
use tracing::{error, info, warn};

/// Runs one session per configured identity against a transport.
pub struct Fleet<T: Transport> {
    transport: Arc<T>,
    config: FleetConfig,
    settings: RunSettings,
    run_id: String,
}

impl<T: Transport> Fleet<T> {
    pub fn new(transport: T, config: FleetConfig, settings: RunSettings) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            settings,
            run_id: new_run_id(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute the run. Individual session failures never fail the run; they
    /// show up in the returned report.
    pub async fn run(&self) -> FleetReport {
        let started = Instant::now();
        let deadline = self.settings.deadline.map(|d| tokio::time::Instant::now() + d);

        let barrier = StartBarrier::new();
        let latch = ReadyLatch::new();
        let aggregator = Arc::new(LatencyAggregator::new());
        let context = SessionContext {
            run_id: Arc::from(self.run_id.as_str()),
            settings: SessionSettings::from(&self.settings),
            barrier: barrier.clone(),
            aggregator: aggregator.clone(),
        };

        let identities = self.config.identities();
        // Sessions with no report yet; whatever is left after draining was aborted or
        // panicked, and is reported from its shared progress counters.
        let mut pending = BTreeMap::new();
        let mut sessions = JoinSet::new();
        for (index, identity) in identities.iter().enumerate() {
            let session = Session::new(index, identity.clone(), context.clone(), latch.ticket());
            pending.insert(index, (identity, session.progress()));
            let transport = self.transport.clone();
            sessions.spawn(async move { session.run(transport.as_ref()).await });
        }

        info!(
            "Run {}: launched {} sessions across {} rooms",
            self.run_id,
            identities.len(),
            self.config.room_count()
        );

        let expected = identities.len();
        let settle_until = tokio::time::Instant::now() + self.settings.settle;
        let settle_until = deadline.map_or(settle_until, |at| at.min(settle_until));
        match timeout_at(settle_until, latch.wait_for(expected)).await {
            Ok(()) => info!("All {} sessions ready", expected),
            Err(_) => warn!(
                "Stopped waiting for readiness with {}/{} sessions ready; starting anyway",
                latch.arrived(),
                expected
            ),
        }

        barrier.release();
        info!("Start barrier released");

        let mut reports: Vec<SessionReport> = Vec::with_capacity(expected);
        let mut deadline_hit = false;
        loop {
            let joined = match deadline.filter(|_| !deadline_hit) {
                Some(at) => match timeout_at(at, sessions.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            "Run deadline reached with {} sessions still running; aborting them",
                            sessions.len()
                        );
                        deadline_hit = true;
                        sessions.abort_all();
                        continue;
                    }
                },
                None => sessions.join_next().await,
            };

            match joined {
                Some(Ok(report)) => {
                    pending.remove(&report.session);
                    reports.push(report);
                }
                Some(Err(e)) if e.is_panic() => error!("Session task panicked: {}", e),
                Some(Err(_)) => {}
                None => break,
            }
        }

        for (index, (identity, progress)) in pending {
            let outcome = if deadline_hit {
                SessionOutcome::Aborted
            } else {
                SessionOutcome::Failed {
                    error: "session task panicked".into(),
                }
            };
            let mut report = SessionReport::new(index, identity, outcome);
            progress.fill(&mut report);
            reports.push(report);
        }
        reports.sort_by_key(|r| r.session);

        FleetReport::new(&self.run_id, reports, aggregator.summarize(), started.elapsed())
    }
}
