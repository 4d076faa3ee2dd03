//! Cancellable task group.
//!
//! Every worker belonging to a session (or to one discovery pass) is spawned
//! into a [`TaskScope`]. Tearing the scope down aborts all of them at once and
//! waits until they have stopped, so no worker outlives its owner. Dropping a
//! scope without calling [`TaskScope::shutdown`] still aborts the tasks.

use std::future::Future;
use tokio::task::JoinSet;
use tracing::{debug, error, trace};

pub struct TaskScope {
    label: String,
    tasks: JoinSet<()>,
}

impl TaskScope {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn `worker` into the scope.
    pub fn spawn<F>(&mut self, name: &'static str, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = self.label.clone();
        trace!("[{}] starting {}", label, name);
        self.tasks.spawn(async move {
            worker.await;
            trace!("[{}] {} finished", label, name);
        });
    }

    /// Abort every worker and wait for all of them to stop.
    pub async fn shutdown(mut self) {
        let count = self.tasks.len();
        self.tasks.abort_all();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("[{}] worker panicked: {}", self.label, e);
                }
            }
        }
        debug!("[{}] scope torn down ({} workers)", self.label, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_workers() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut scope = TaskScope::new("test");

        for _ in 0..3 {
            let guard = DropCounter(dropped.clone());
            scope.spawn("sleeper", async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
        }

        scope.shutdown().await;
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drop_aborts_workers() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        {
            let mut scope = TaskScope::new("dropped");
            let guard = DropCounter(dropped.clone());
            scope.spawn("sleeper", async move {
                let _guard = guard;
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
            });
            started_rx.await.unwrap();
        }

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_scope_shutdown() {
        TaskScope::new("empty").shutdown().await;
    }
}
