//! Per-call deadline and cancellation.
//!
//! Every blocking step of an `Execute` call (runtime inspection, create/start,
//! readiness sleeps, the invocation itself) is raced against the caller's
//! `CallContext`, so a cancelled or expired call stops at the next await point
//! instead of running out its full poll budget.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a call stopped before its step completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("call cancelled")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,
}

/// Deadline and cancellation signal threaded through one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: watch::Receiver<bool>,
}

impl CallContext {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        // The sender is dropped right away; `cancelled()` then parks forever.
        let (_tx, cancel) = watch::channel(false);
        Self {
            deadline: None,
            cancel,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Cancel the call once `cancel` turns `true` (e.g. the shutdown channel).
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drive `fut` until it completes, the deadline passes, or the call is cancelled.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        let mut cancel = self.cancel.clone();
        let deadline = self.deadline;

        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(Interrupted::Cancelled),
            _ = expired => Err(Interrupted::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling: this call can no longer be cancelled.
            std::future::pending::<()>().await;
        }
    }
}
