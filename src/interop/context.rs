//! Per-request deadline and cancellation

use std::future::{pending, Future};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::error::JoinError;

/// Deadline and cancellation signal supplied by the caller of the handler.
///
/// The handler checks it at every state transition and races registry
/// lookups against it; once a join is committed it is always answered.
#[derive(Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RequestContext {
    /// No deadline, never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Cancel the request once `true` is published on `signal`.
    pub fn cancel_on(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cancel = Some(signal);
        self
    }

    pub fn is_done(&self) -> bool {
        let expired = self.deadline.is_some_and(|at| Instant::now() >= at);
        let cancelled = self.cancel.as_ref().is_some_and(|rx| *rx.borrow());
        expired || cancelled
    }

    pub fn check(&self) -> Result<(), JoinError> {
        if self.is_done() {
            Err(JoinError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` unless the context ends first.
    pub async fn run<F: Future>(&mut self, fut: F) -> Result<F::Output, JoinError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.done() => Err(JoinError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn done(&mut self) {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        let cancelled = async {
            match self.cancel.as_mut() {
                Some(rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // sender gone: the request can no longer be cancelled
                        pending::<()>().await;
                    }
                },
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = expired => {}
            _ = cancelled => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_runs_future() {
        let mut ctx = RequestContext::new();
        assert!(!ctx.is_done());
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_expired_deadline_cancels() {
        let mut ctx = RequestContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.is_done());
        assert!(matches!(ctx.run(async { 7 }).await, Err(JoinError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_signal_interrupts_pending_future() {
        let (tx, rx) = watch::channel(false);
        let mut ctx = RequestContext::new().cancel_on(rx);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).ok();
        });

        let result = ctx.run(pending::<()>()).await;
        assert!(matches!(result, Err(JoinError::Cancelled)));
        assert!(ctx.is_done());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_cancel() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let mut ctx = RequestContext::with_timeout(Duration::from_secs(5)).cancel_on(rx);
        assert_eq!(ctx.run(async { "ok" }).await.unwrap(), "ok");
    }
}
