use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{CastError, Result};

/// Task group owning everything one running session spawned.
///
/// Children observe [`token`](Self::token). A child that returns an error
/// or panics has it delivered on the scope's error channel as a
/// classified [`CastError`]; nothing fails silently. [`shutdown`] cancels
/// every child and returns only once all of them have finished.
///
/// [`shutdown`]: Self::shutdown
#[derive(Debug, Clone)]
pub struct TaskScope {
    cancel: CancellationToken,
    tracker: TaskTracker,
    errors: mpsc::UnboundedSender<CastError>,
}

impl TaskScope {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CastError>) {
        let (errors, rx) = mpsc::unbounded_channel();
        (
            Self {
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                errors,
            },
            rx,
        )
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sender for components that report failures themselves, such as the
    /// capture pipeline.
    pub fn error_sender(&self) -> mpsc::UnboundedSender<CastError> {
        self.errors.clone()
    }

    pub fn report(&self, error: CastError) {
        let _ = self.errors.send(error);
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let errors = self.errors.clone();
        self.tracker.spawn(async move {
            let error = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::trace!(task = name, "task finished");
                    return;
                }
                Ok(Err(e)) => e,
                Err(panic) => CastError::TaskFailed {
                    task: name.to_string(),
                    reason: panic_message(panic.as_ref()),
                },
            };
            tracing::debug!(task = name, error = %error, "task failed");
            let _ = errors.send(error);
        });
    }

    /// A nested scope sharing this scope's error channel. Cancelling or
    /// shutting down the parent also cancels the child and waits for it.
    pub fn child(&self) -> TaskScope {
        let child = TaskScope {
            cancel: self.cancel.child_token(),
            tracker: TaskTracker::new(),
            errors: self.errors.clone(),
        };
        let (cancel, tracker) = (child.cancel.clone(), child.tracker.clone());
        self.tracker.spawn(async move {
            cancel.cancelled().await;
            tracker.close();
            tracker.wait().await;
        });
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel all children and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn errors_and_panics_are_reported() {
        let (scope, mut errors) = TaskScope::new();
        scope.spawn("fails", async { Err(CastError::Encode("boom".into())) });
        scope.spawn("panics", async {
            let explode = true;
            if explode {
                panic!("kaboom");
            }
            Ok(())
        });
        scope.spawn("ok", async { Ok(()) });

        let mut seen = vec![errors.recv().await.unwrap(), errors.recv().await.unwrap()];
        seen.sort_by_key(|e| e.to_string());
        assert!(matches!(seen[0], CastError::Encode(_)));
        match &seen[1] {
            CastError::TaskFailed { task, reason } => {
                assert_eq!(task, "panics");
                assert_eq!(reason, "kaboom");
            }
            other => panic!("unexpected {other:?}"),
        }
        scope.shutdown().await;
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_waits_for_children() {
        let (scope, _errors) = TaskScope::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            let token = scope.token();
            let done = done_tx.clone();
            scope.spawn("worker", async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = done.send(());
                Ok(())
            });
        }
        assert_eq!(scope.active_tasks(), 3);
        scope.shutdown().await;
        for _ in 0..3 {
            assert!(done_rx.try_recv().is_ok());
        }
        assert!(scope.is_cancelled());
        assert_eq!(scope.active_tasks(), 0);
    }

    #[tokio::test]
    async fn parent_shutdown_waits_for_child() {
        let (parent, mut errors) = TaskScope::new();
        let child = parent.child();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let token = child.token();
        child.spawn("nested", async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = done_tx.send(());
            Err(CastError::NotConnected)
        });

        parent.shutdown().await;
        assert!(child.is_cancelled());
        assert!(done_rx.try_recv().is_ok());
        assert!(matches!(errors.try_recv(), Ok(CastError::NotConnected)));
    }

    #[tokio::test]
    async fn child_shutdown_leaves_parent_running() {
        let (parent, _errors) = TaskScope::new();
        let child = parent.child();
        child.shutdown().await;
        assert!(!parent.is_cancelled());
        // the parent's watcher for the child has finished too
        tokio::task::yield_now().await;
        parent.shutdown().await;
    }
}
