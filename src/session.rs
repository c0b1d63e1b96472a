#![forbid(unsafe_code)]

// Session - one simulated client: connect, join, wait for the start gate, timed echo loop

use crate::aggregator::{LatencyAggregator, LatencySample};
use crate::barrier::{ReadyTicket, StartBarrier};
use crate::config::{ClientIdentity, RoomId, RunSettings};
use crate::protocol::{ClientMessage, ContentTag};
use crate::transport::{Connection, Transport, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Failures of a single round trip
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No echo of '{content}' within {timeout:?}")]
    EchoTimeout { content: String, timeout: Duration },

    #[error("Receive timestamp precedes send timestamp for '{content}'")]
    InvalidLatency { content: String },
}

/// Per-session loop parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub messages: usize,
    pub interval: Duration,
    pub echo_timeout: Option<Duration>,
}

impl From<&RunSettings> for SessionSettings {
    fn from(settings: &RunSettings) -> Self {
        Self {
            messages: settings.messages,
            interval: settings.interval,
            echo_timeout: settings.echo_timeout,
        }
    }
}

/// State shared by every session of one run
#[derive(Clone)]
pub struct SessionContext {
    pub run_id: Arc<str>,
    pub settings: SessionSettings,
    pub barrier: StartBarrier,
    pub aggregator: Arc<LatencyAggregator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Connecting,
    Joined,
    AwaitingStart,
    Sending(usize),
    AwaitingEcho(usize),
    Done,
    Closed,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionOutcome {
    /// Every iteration ran
    Completed,
    /// The connection terminated mid-run; samples recorded before that stay valid.
    #[serde(rename_all = "camelCase")]
    ClosedEarly {
        completed_iterations: usize,
        reason: Option<String>,
    },
    /// Never got a connection (unreachable, auth rejected)
    ConnectFailed { error: String },
    /// Unrecoverable transport error other than a close
    Failed { error: String },
    /// Cancelled by the run deadline
    Aborted,
}

impl SessionOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// What one session did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session: usize,
    pub username: String,
    pub room_id: RoomId,
    pub outcome: SessionOutcome,
    pub final_state: SessionState,
    pub messages_sent: usize,
    pub echoes_matched: usize,
    pub echo_timeouts: usize,
    pub rejected_samples: usize,
    /// Inbound events skipped while waiting for an echo (other members' traffic)
    pub discarded_events: usize,
    pub errors: Vec<String>,
}

impl SessionReport {
    pub fn new(session: usize, identity: &ClientIdentity, outcome: SessionOutcome) -> Self {
        Self {
            session,
            username: identity.username.clone(),
            room_id: identity.room_id.clone(),
            outcome,
            final_state: SessionState::Connecting,
            messages_sent: 0,
            echoes_matched: 0,
            echo_timeouts: 0,
            rejected_samples: 0,
            discarded_events: 0,
            errors: Vec::new(),
        }
    }
}

/// Running counters of one session, shared with whoever spawned it so that the
/// progress of a session cancelled mid-run is still reported.
#[derive(Debug, Default)]
pub struct SessionProgress {
    messages_sent: AtomicUsize,
    echoes_matched: AtomicUsize,
    echo_timeouts: AtomicUsize,
    rejected_samples: AtomicUsize,
    discarded_events: AtomicUsize,
}

impl SessionProgress {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into `report`
    pub fn fill(&self, report: &mut SessionReport) {
        report.messages_sent = self.messages_sent.load(Ordering::Relaxed);
        report.echoes_matched = self.echoes_matched.load(Ordering::Relaxed);
        report.echo_timeouts = self.echo_timeouts.load(Ordering::Relaxed);
        report.rejected_samples = self.rejected_samples.load(Ordering::Relaxed);
        report.discarded_events = self.discarded_events.load(Ordering::Relaxed);
    }
}

/// Latency of one round trip; a receive stamped before its send is a data-integrity error.
pub fn measure_latency(
    send_time: Instant,
    recv_time: Instant,
    content: &str,
) -> Result<Duration, SessionError> {
    recv_time
        .checked_duration_since(send_time)
        .ok_or_else(|| SessionError::InvalidLatency {
            content: content.to_string(),
        })
}

pub struct Session {
    identity: ClientIdentity,
    label: String,
    context: SessionContext,
    ready: ReadyTicket,
    state: SessionState,
    progress: Arc<SessionProgress>,
    report: SessionReport,
}

impl Session {
    pub fn new(
        index: usize,
        identity: ClientIdentity,
        context: SessionContext,
        ready: ReadyTicket,
    ) -> Self {
        let report = SessionReport::new(index, &identity, SessionOutcome::Completed);
        Self {
            label: identity.label(),
            identity,
            context,
            ready,
            state: SessionState::Connecting,
            progress: Arc::default(),
            report,
        }
    }

    /// Counters that stay readable after the session's task is gone
    pub fn progress(&self) -> Arc<SessionProgress> {
        self.progress.clone()
    }

    /// Drive the session to completion. Never fails: every failure is folded into
    /// the report. The connection is released on every path, including the task
    /// being aborted (the connection is dropped with the future).
    pub async fn run<T: Transport>(mut self, transport: &T) -> SessionReport {
        debug!("{}: Connecting", self.label);

        let mut connection = match transport.connect(&self.identity).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("{}: Connect failed: {}", self.label, e);
                self.report.errors.push(e.to_string());
                self.transition(SessionState::Closed);
                return self.finish(SessionOutcome::ConnectFailed {
                    error: e.to_string(),
                });
            }
        };

        info!("{}: Connected", self.label);
        let outcome = self.drive(&mut connection).await;

        if let Err(e) = connection.close().await {
            debug!("{}: Close error (non-fatal): {}", self.label, e);
        }

        self.finish(outcome)
    }

    async fn drive<C: Connection>(&mut self, connection: &mut C) -> SessionOutcome {
        let room_id = self.identity.room_id.clone();

        if let Err(e) = connection.send(&ClientMessage::join(&room_id)).await {
            return self.terminated(e, 0);
        }
        info!("{}: JOIN room {}", self.label, room_id);
        self.transition(SessionState::Joined);

        self.transition(SessionState::AwaitingStart);
        self.ready.arrive();
        self.context.barrier.wait().await;

        let messages = self.context.settings.messages;
        for sequence in 1..=messages {
            match self.round_trip(connection, sequence).await {
                Ok(_) => {}
                Err(SessionError::EchoTimeout { content, timeout }) => {
                    warn!("{}: No echo of '{}' within {:?}", self.label, content, timeout);
                    SessionProgress::bump(&self.progress.echo_timeouts);
                    self.report.errors.push(format!("echo timeout: {content}"));
                }
                Err(SessionError::InvalidLatency { content }) => {
                    error!("{}: Discarding invalid latency sample for '{}'", self.label, content);
                    SessionProgress::bump(&self.progress.rejected_samples);
                    self.report.errors.push(format!("invalid latency: {content}"));
                }
                Err(SessionError::Transport(e)) => return self.terminated(e, sequence - 1),
            }

            if sequence < messages {
                sleep(self.context.settings.interval).await;
            }
        }

        if let Err(e) = connection.send(&ClientMessage::leave(&room_id)).await {
            debug!("{}: Leave not sent: {}", self.label, e);
        }
        self.transition(SessionState::Done);
        SessionOutcome::Completed
    }

    async fn round_trip<C: Connection>(
        &mut self,
        connection: &mut C,
        sequence: usize,
    ) -> Result<Duration, SessionError> {
        let tag = ContentTag::new(
            &self.context.run_id,
            self.report.session,
            &self.identity.username,
            sequence,
        );
        let content = tag.content();
        let message = ClientMessage::chat(&self.identity.room_id, &tag);

        self.transition(SessionState::Sending(sequence));
        let send_time = Instant::now();
        connection.send(&message).await?;
        SessionProgress::bump(&self.progress.messages_sent);
        info!("{}: SEND '{}'", self.label, content);

        self.transition(SessionState::AwaitingEcho(sequence));
        let recv_time = match self.context.settings.echo_timeout {
            Some(limit) => match timeout(limit, self.await_echo(connection, &content)).await {
                Ok(received) => received?,
                Err(_) => {
                    return Err(SessionError::EchoTimeout {
                        content,
                        timeout: limit,
                    })
                }
            },
            None => self.await_echo(connection, &content).await?,
        };

        let latency = measure_latency(send_time, recv_time, &content)?;
        self.context.aggregator.record(LatencySample {
            room_id: self.identity.room_id.clone(),
            username: self.identity.username.clone(),
            sequence,
            latency,
        });
        SessionProgress::bump(&self.progress.echoes_matched);
        info!(
            "{}: RECV '{}' | latency: {:.3}ms",
            self.label,
            content,
            latency.as_secs_f64() * 1000.0
        );

        Ok(latency)
    }

    /// Receive until the broadcast of exactly `content` arrives; everything else is
    /// other members' traffic and is dropped.
    async fn await_echo<C: Connection>(
        &mut self,
        connection: &mut C,
        content: &str,
    ) -> Result<Instant, TransportError> {
        loop {
            let event = connection.receive().await?;
            let recv_time = Instant::now();
            if event.is_echo_of(content) {
                return Ok(recv_time);
            }
            SessionProgress::bump(&self.progress.discarded_events);
        }
    }

    fn terminated(&mut self, error: TransportError, completed_iterations: usize) -> SessionOutcome {
        self.transition(SessionState::Closed);
        match error {
            TransportError::Closed { reason } => {
                info!(
                    "{}: CLOSE connection closed after {} iterations{}",
                    self.label,
                    completed_iterations,
                    reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
                );
                SessionOutcome::ClosedEarly {
                    completed_iterations,
                    reason,
                }
            }
            other => {
                warn!("{}: Transport failure: {}", self.label, other);
                self.report.errors.push(other.to_string());
                SessionOutcome::Failed {
                    error: other.to_string(),
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            !matches!(next, SessionState::Sending(_)) || self.context.barrier.is_released(),
            "session entered its send loop before the start barrier was released"
        );
        debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }

    fn finish(mut self, outcome: SessionOutcome) -> SessionReport {
        // Count down even if the session never reached the start gate.
        self.ready.arrive();
        self.progress.fill(&mut self.report);
        self.report.outcome = outcome;
        self.report.final_state = self.state;
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ReadyLatch;
    use crate::testing::{MockBehavior, MockTransport};

    fn context(messages: usize, echo_timeout: Option<Duration>) -> SessionContext {
        SessionContext {
            run_id: Arc::from("testrun"),
            settings: SessionSettings {
                messages,
                interval: Duration::ZERO,
                echo_timeout,
            },
            barrier: StartBarrier::new(),
            aggregator: Arc::new(LatencyAggregator::new()),
        }
    }

    fn identity(username: &str) -> ClientIdentity {
        ClientIdentity::new(username, format!("tok-{username}"), RoomId::new("room-1"))
    }

    #[tokio::test]
    async fn test_completes_all_iterations() {
        let transport = MockTransport::new(MockBehavior::default());
        let ctx = context(3, Some(Duration::from_secs(1)));
        ctx.barrier.release();

        let session = Session::new(0, identity("alice"), ctx.clone(), ReadyTicket::detached());
        let report = session.run(&transport).await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.final_state, SessionState::Done);
        assert_eq!(report.messages_sent, 3);
        assert_eq!(report.echoes_matched, 3);
        assert_eq!(ctx.aggregator.len(), 3);

        let sequences: Vec<usize> = ctx.aggregator.samples().iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        // join, 3 chats, leave
        let sent = transport.hub().sent_by("alice");
        assert!(matches!(sent.first(), Some(ClientMessage::Join { .. })));
        assert!(matches!(sent.last(), Some(ClientMessage::Leave { .. })));
        assert_eq!(sent.len(), 5);
        assert_eq!(transport.hub().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_barrier_before_sending() {
        let transport = MockTransport::new(MockBehavior::default());
        let ctx = context(2, Some(Duration::from_secs(1)));
        let latch = ReadyLatch::new();

        let session = Session::new(0, identity("alice"), ctx.clone(), latch.ticket());
        let handle = {
            let transport = transport.clone();
            tokio::spawn(async move { session.run(&transport).await })
        };

        latch.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.hub().chat_sends().is_empty(), "sent before release");

        ctx.barrier.release();
        let report = handle.await.unwrap();
        assert_eq!(report.echoes_matched, 2);

        let released_at = ctx.barrier.released_at().unwrap();
        for send in transport.hub().chat_sends() {
            assert!(send.at >= released_at);
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_contained() {
        let transport = MockTransport::new(MockBehavior {
            rejected_tokens: ["tok-mallory".to_string()].into(),
            ..Default::default()
        });
        let ctx = context(3, None);
        let latch = ReadyLatch::new();

        let session = Session::new(4, identity("mallory"), ctx.clone(), latch.ticket());
        let report = session.run(&transport).await;

        assert!(matches!(report.outcome, SessionOutcome::ConnectFailed { .. }));
        assert_eq!(report.session, 4);
        assert_eq!(report.messages_sent, 0);
        assert_eq!(ctx.aggregator.len(), 0);
        // counted down without ever reaching the gate
        assert_eq!(latch.arrived(), 1);
    }

    #[tokio::test]
    async fn test_close_mid_run_keeps_earlier_samples() {
        let transport = MockTransport::new(MockBehavior {
            close_on_send: [("alice".to_string(), 3)].into(),
            ..Default::default()
        });
        let ctx = context(3, None);
        ctx.barrier.release();

        let report = Session::new(0, identity("alice"), ctx.clone(), ReadyTicket::detached())
            .run(&transport)
            .await;

        assert!(matches!(
            report.outcome,
            SessionOutcome::ClosedEarly { completed_iterations: 2, .. }
        ));
        assert_eq!(report.final_state, SessionState::Closed);
        assert_eq!(report.echoes_matched, 2);
        assert_eq!(ctx.aggregator.len(), 2);
        assert_eq!(transport.hub().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_failed() {
        let transport = MockTransport::new(MockBehavior {
            io_error_on_send: [("alice".to_string(), 3)].into(),
            ..Default::default()
        });
        let ctx = context(3, Some(Duration::from_secs(1)));
        ctx.barrier.release();

        let report = Session::new(0, identity("alice"), ctx.clone(), ReadyTicket::detached())
            .run(&transport)
            .await;

        assert!(matches!(report.outcome, SessionOutcome::Failed { .. }));
        assert!(!report.outcome.is_clean());
        assert_eq!(report.final_state, SessionState::Closed);
        assert_eq!(report.messages_sent, 2);
        assert_eq!(report.echoes_matched, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(ctx.aggregator.len(), 2);
        assert_eq!(transport.hub().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_progress_outlives_aborted_task() {
        let transport = MockTransport::new(MockBehavior::default());
        let mut ctx = context(3, Some(Duration::from_secs(1)));
        ctx.settings.interval = Duration::from_secs(30);
        ctx.barrier.release();

        let session = Session::new(0, identity("alice"), ctx.clone(), ReadyTicket::detached());
        let progress = session.progress();
        let handle = {
            let transport = transport.clone();
            tokio::spawn(async move { session.run(&transport).await })
        };

        // first round trip done, now parked in the interval sleep
        while ctx.aggregator.len() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let mut report = SessionReport::new(0, &identity("alice"), SessionOutcome::Aborted);
        progress.fill(&mut report);
        assert_eq!(report.messages_sent, 1);
        assert_eq!(report.echoes_matched, 1);
        assert_eq!(transport.hub().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_echo_timeout_is_recorded_and_loop_continues() {
        let transport = MockTransport::new(MockBehavior {
            silent_users: ["alice".to_string()].into(),
            ..Default::default()
        });
        let ctx = context(2, Some(Duration::from_millis(40)));
        ctx.barrier.release();

        let report = Session::new(0, identity("alice"), ctx.clone(), ReadyTicket::detached())
            .run(&transport)
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.messages_sent, 2);
        assert_eq!(report.echo_timeouts, 2);
        assert_eq!(report.echoes_matched, 0);
        assert_eq!(report.errors.len(), 2);
        assert!(ctx.aggregator.is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_traffic_is_skipped() {
        let transport = MockTransport::new(MockBehavior {
            noise_per_echo: 4,
            ..Default::default()
        });
        let ctx = context(3, Some(Duration::from_secs(1)));
        ctx.barrier.release();

        let report = Session::new(0, identity("alice"), ctx.clone(), ReadyTicket::detached())
            .run(&transport)
            .await;

        assert_eq!(report.echoes_matched, 3);
        assert_eq!(report.discarded_events, 12);
        assert_eq!(ctx.aggregator.len(), 3);
    }

    #[test]
    fn test_negative_latency_is_rejected() {
        let earlier = Instant::now();
        let later = earlier + Duration::from_millis(5);

        assert_eq!(
            measure_latency(earlier, later, "m").unwrap(),
            Duration::from_millis(5)
        );
        assert!(matches!(
            measure_latency(later, earlier, "m"),
            Err(SessionError::InvalidLatency { .. })
        ));
    }

    #[test]
    fn test_outcome_json_shape() {
        let closed = SessionOutcome::ClosedEarly {
            completed_iterations: 2,
            reason: Some("4002 invalid token".into()),
        };
        let json = serde_json::to_value(&closed).unwrap();
        assert_eq!(json["kind"], "closedEarly");
        assert_eq!(json["completedIterations"], 2);
        assert!(!closed.is_clean());
        assert!(SessionOutcome::Completed.is_clean());
    }
}
