// feltwatch/src/context.rs
//
// Cancellation + deadline context passed to every entry point.
// A Context is cheap to clone; all clones observe the same cancel flag.
// Long-running work (ring detection, broker calls) either polls `check()`
// between steps or races its future against `done()`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{FraudError, Result};

#[derive(Clone, Debug)]
pub struct Context {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
    // Keeps the channel open for contexts nobody can cancel.
    _root: Option<Arc<watch::Sender<bool>>>,
}

/// Owner side of a cancellable context.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// New context plus the handle that cancels it.
pub fn cancellable() -> (CancelHandle, Context) {
    let (tx, rx) = watch::channel(false);
    let handle = CancelHandle { tx: Arc::new(tx) };
    let ctx = Context { cancel: rx, deadline: None, _root: None };
    (handle, ctx)
}

impl Context {
    /// Never cancelled, no deadline.
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { cancel: rx, deadline: None, _root: Some(Arc::new(tx)) }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) if d < candidate => d,
            _ => candidate,
        };
        Self { cancel: self.cancel.clone(), deadline: Some(deadline), _root: self._root.clone() }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(FraudError::Cancelled);
        }
        if self.is_expired() {
            return Err(FraudError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        let mut rx = self.cancel.clone();
        let flag = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling: never fires.
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(d) => tokio::select! {
                _ = flag => {}
                _ = tokio::time::sleep_until(d) => {}
            },
            None => flag.await,
        }
    }

    /// Race `fut` against cancellation / deadline.
    pub async fn run<T, E>(&self, fut: impl Future<Output = std::result::Result<T, E>>) -> Result<T>
    where
        FraudError: From<E>,
    {
        self.check()?;
        tokio::select! {
            res = fut => Ok(res?),
            _ = self.done() => Err(self.reason()),
        }
    }

    /// The error `done()` resolved for.
    pub fn reason(&self) -> FraudError {
        if self.is_cancelled() {
            FraudError::Cancelled
        } else {
            FraudError::DeadlineExceeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (handle, ctx) = cancellable();
        assert!(ctx.check().is_ok());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.done().await })
        };
        handle.cancel();
        waiter.await.unwrap();
        assert!(matches!(ctx.check(), Err(FraudError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_expired());
        ctx.done().await;
        assert!(matches!(ctx.check(), Err(FraudError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, FraudError>(1)
        };
        assert!(matches!(ctx.run(slow).await, Err(FraudError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn child_keeps_earlier_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
