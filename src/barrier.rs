#![forbid(unsafe_code)]

// Start synchronization - one-shot start gate and the ready rendezvous that precedes it

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// One-shot gate shared by every session.
///
/// Waiting → Released, exactly once. Waiters that arrive after the release pass
/// straight through.
#[derive(Clone)]
pub struct StartBarrier {
    state: Arc<watch::Sender<Option<Instant>>>,
}

impl StartBarrier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Open the gate. Returns `true` for the call that actually released it;
    /// later calls change nothing.
    pub fn release(&self) -> bool {
        self.state.send_if_modified(|released_at| {
            if released_at.is_some() {
                return false;
            }
            *released_at = Some(Instant::now());
            true
        })
    }

    /// Suspend until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(Option::is_some).await;
    }

    pub fn is_released(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// When the gate was opened
    pub fn released_at(&self) -> Option<Instant> {
        *self.state.borrow()
    }
}

impl Default for StartBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Countdown of sessions that have reached the start gate (or given up before it).
#[derive(Clone)]
pub struct ReadyLatch {
    arrived: Arc<watch::Sender<usize>>,
}

impl ReadyLatch {
    pub fn new() -> Self {
        let (arrived, _) = watch::channel(0);
        Self {
            arrived: Arc::new(arrived),
        }
    }

    /// A ticket that counts down exactly once: on `arrive` or on drop.
    pub fn ticket(&self) -> ReadyTicket {
        ReadyTicket {
            latch: Some(self.clone()),
        }
    }

    pub fn arrived(&self) -> usize {
        *self.arrived.borrow()
    }

    /// Suspend until at least `expected` tickets have arrived.
    pub async fn wait_for(&self, expected: usize) {
        let mut rx = self.arrived.subscribe();
        let _ = rx.wait_for(|n| *n >= expected).await;
    }

    fn arrive(&self) {
        self.arrived.send_modify(|n| *n += 1);
    }
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle on one slot of a `ReadyLatch`.
///
/// A session that fails before reaching the start gate still counts down when its
/// ticket is dropped, so the orchestrator never waits on a session that will not come.
pub struct ReadyTicket {
    latch: Option<ReadyLatch>,
}

impl ReadyTicket {
    /// A ticket not attached to any latch
    pub fn detached() -> Self {
        Self { latch: None }
    }

    pub fn arrive(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.arrive();
        }
    }
}

impl Drop for ReadyTicket {
    fn drop(&mut self) {
        self.arrive();
    }
}
