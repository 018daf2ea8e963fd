//! Request contexts: deadlines and cooperative cancellation.
//!
//! Every store operation and long-running worker takes a [`Context`].
//! Cancellation uses the same `watch::channel(false)` signal the runtime
//! uses for shutdown.

use crate::core::error::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancellation carried through an operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every context derived from [`Context::with_cancel`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Context {
    /// A context that never expires.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline`, keeping an earlier one.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// Derive a cancelable context.
    ///
    /// Only the newest cancel signal is observed; cancel the parent handle
    /// to stop a whole tree.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: self.deadline,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Derive a context observing an external shutdown signal.
    pub fn with_shutdown(&self, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            deadline: self.deadline,
            cancel: Some(shutdown),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp `wait` so it never extends past the deadline.
    pub fn clamp(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(wait),
            None => wait,
        }
    }

    /// The error this context ended with, if it has ended.
    pub fn err(&self) -> Option<StoreError> {
        if let Some(cancel) = &self.cancel {
            if *cancel.borrow() {
                return Some(StoreError::Canceled);
            }
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(StoreError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail fast if the context already ended.
    pub fn check(&self) -> StoreResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve when the context ends, with the reason.
    pub async fn done(&self) -> StoreError {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let canceled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone without canceling: never fires.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = deadline => StoreError::DeadlineExceeded,
            _ = canceled => StoreError::Canceled,
        }
    }

    /// Run `fut` until it completes or the context ends.
    pub async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check()?;
        tokio::select! {
            res = fut => res,
            err = self.done() => Err(err),
        }
    }

    /// Sleep for `wait`, returning early with an error if the context ends.
    pub async fn sleep(&self, wait: Duration) -> StoreResult<()> {
        self.run(async {
            tokio::time::sleep(wait).await;
            Ok(())
        })
        .await
    }
}
