//! Run cancellation and bail coordination
//!
//! A [`CancellationController`] is the single source of truth for whether a
//! run (or, inside a context, a batch) should stop scheduling new work. It is
//! tripped either by an explicit [`cancel`](CancellationController::cancel) or
//! by failure counting once the bail threshold is reached. Cancellation is
//! cooperative: holders of a [`CancelToken`] check it between task
//! boundaries. [`cancel_with_escalation`](CancellationController::cancel_with_escalation)
//! follows up with a forced signal when active units do not drain within the
//! grace period.

use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use trellis_core::CancelReason;

/// Escalation stages broadcast to pool slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelSignal {
    /// Stop starting work; let in-flight tasks finish their hooks
    Cooperative(CancelReason),
    /// Grace period elapsed; terminate whatever is still running
    Forced,
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("Run already cancelled: {0}")]
    AlreadyCancelled(CancelReason),

    #[error("{0} units still active after forced cancellation")]
    UnitsRemaining(usize),
}

/// Read side of a cancellation state
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.rx.borrow().clone()
    }

    /// Resolve once cancelled; never resolves if the controller is dropped uncancelled
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct Inner {
    state: watch::Sender<Option<CancelReason>>,
    signals: broadcast::Sender<CancelSignal>,
    failures: AtomicU32,
    base_failures: u32,
    bail: Option<u32>,
    active: AtomicUsize,
    grace_period: Duration,
    escalating: Mutex<bool>,
}

/// Bail counter plus cancellation state, cheap to clone
#[derive(Clone)]
pub struct CancellationController {
    inner: Arc<Inner>,
}

impl CancellationController {
    /// `bail` of `None` disables failure-triggered cancellation
    pub fn new(bail: Option<u32>, grace_period: Duration) -> Self {
        Self::with_base_failures(bail, grace_period, 0)
    }

    /// Start counting from failures that happened elsewhere in the run
    pub fn with_base_failures(bail: Option<u32>, grace_period: Duration, base: u32) -> Self {
        let (state, _) = watch::channel(None);
        let (signals, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state,
                signals,
                failures: AtomicU32::new(0),
                base_failures: base,
                bail,
                active: AtomicUsize::new(0),
                grace_period,
                escalating: Mutex::new(false),
            }),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.inner.state.subscribe(),
        }
    }

    /// Subscribe to escalation signals
    pub fn subscribe(&self) -> broadcast::Receiver<CancelSignal> {
        self.inner.signals.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.borrow().clone()
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    /// Failures seen by this controller, including the base
    pub fn failed_count(&self) -> u32 {
        self.inner.base_failures + self.inner.failures.load(Ordering::SeqCst)
    }

    /// Whether a bail threshold exists and has been reached
    pub fn threshold_reached(&self) -> bool {
        self.inner
            .bail
            .map(|bail| self.failed_count() >= bail)
            .unwrap_or(false)
    }

    /// Count failed tests; returns the bail reason the first time the threshold is hit
    pub fn record_failures(&self, count: u32) -> Option<CancelReason> {
        if count == 0 {
            return None;
        }
        self.inner.failures.fetch_add(count, Ordering::SeqCst);

        if self.threshold_reached() {
            let reason = CancelReason::Bail {
                failures: self.failed_count(),
            };
            if self.cancel(reason.clone()) {
                return Some(reason);
            }
        }
        None
    }

    /// Trip the controller; only the first reason is kept
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut first = false;
        self.inner.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason.clone());
                first = true;
                true
            } else {
                false
            }
        });

        if first {
            info!("Cancelling: {}", reason);
            let _ = self.inner.signals.send(CancelSignal::Cooperative(reason));
        }
        first
    }

    /// Track a unit (context, batch) that has to drain before cancellation completes
    pub fn unit_started(&self) {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unit_finished(&self) {
        let _ = self
            .inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn active_units(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Cancel, wait up to the grace period for active units, then force
    pub async fn cancel_with_escalation(&self, reason: CancelReason) -> Result<(), CancelError> {
        self.cancel(reason);
        self.escalate().await
    }

    /// Wait up to the grace period for active units, then broadcast `Forced`
    pub async fn escalate(&self) -> Result<(), CancelError> {
        {
            let mut escalating = self.inner.escalating.lock();
            if *escalating {
                return Ok(());
            }
            *escalating = true;
        }

        if self.wait_for_units(self.inner.grace_period).await {
            info!("Cancellation drained within grace period");
            return Ok(());
        }

        warn!(
            "{} units still active after {:?}; forcing termination",
            self.active_units(),
            self.inner.grace_period
        );
        let _ = self.inner.signals.send(CancelSignal::Forced);

        // Give a brief moment for forced termination to take effect
        if self.wait_for_units(Duration::from_millis(500)).await {
            Ok(())
        } else {
            Err(CancelError::UnitsRemaining(self.active_units()))
        }
    }

    /// Wait for all units to finish within the given timeout
    async fn wait_for_units(&self, timeout_duration: Duration) -> bool {
        let start = tokio::time::Instant::now();

        loop {
            if self.active_units() == 0 {
                return true;
            }
            if start.elapsed() >= timeout_duration {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl std::fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationController")
            .field("reason", &self.reason())
            .field("failed", &self.failed_count())
            .field("bail", &self.inner.bail)
            .field("active", &self.active_units())
            .finish()
    }
}
