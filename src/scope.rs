//! Parent/child task scopes.
//!
//! Every background task runs inside a [`Scope`]. Shutting a scope down cancels it and all
//! child scopes, then waits until every task spawned into any of them has finished,
//! including cleanup that runs after cancellation was observed.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
    tracker: TaskTracker,
    /// Trackers of the enclosing scopes. Every task also holds a token on each of them.
    ancestors: Arc<[TaskTracker]>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A new root scope.
    pub fn new() -> Self {
        Scope {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ancestors: Vec::new().into(),
        }
    }

    /// A scope cancelled together with `self`, whose tasks `self.shutdown()` also awaits.
    pub fn child(&self) -> Scope {
        let ancestors: Vec<TaskTracker> = self
            .ancestors
            .iter()
            .cloned()
            .chain(std::iter::once(self.tracker.clone()))
            .collect();
        Scope {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
            ancestors: ancestors.into(),
        }
    }

    fn ancestor_tokens(&self) -> Vec<TaskTrackerToken> {
        self.ancestors.iter().map(TaskTracker::token).collect()
    }

    /// Run `fut` until it completes or the scope is cancelled.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        let held = self.ancestor_tokens();
        self.tracker.spawn(async move {
            let _held = held;
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                out = fut => Some(out),
            }
        })
    }

    /// Run `fut` to completion even after cancellation. The task must watch
    /// [`Scope::token`] itself; shutdown still waits for it.
    pub fn spawn_tracked<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let held = self.ancestor_tokens();
        self.tracker.spawn(async move {
            let _held = held;
            fut.await
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancel without waiting for tasks to finish.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for every task of this scope and its descendants.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_cancels_children_and_awaits_cleanup() {
        let root = Scope::new();
        let child = root.child();
        let grandchild = child.child();

        let cleaned = Arc::new(AtomicBool::new(false));
        let token = grandchild.token().clone();
        let flag = cleaned.clone();
        grandchild.spawn_tracked(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });
        let forever = child.spawn(std::future::pending::<()>());

        root.shutdown().await;
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(grandchild.is_cancelled());
        assert_eq!(forever.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_child_shutdown_leaves_parent_running() {
        let root = Scope::new();
        let child = root.child();
        child.shutdown().await;
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
        let out = root.spawn(async { 7 }).await.unwrap();
        assert_eq!(out, Some(7));
    }

    #[tokio::test]
    async fn test_finished_children_leave_nothing_behind() {
        let root = Scope::new();
        for i in 0..100 {
            let child = root.child();
            assert_eq!(child.spawn(async move { i }).await.unwrap(), Some(i));
        }
        assert!(root.tracker.is_empty());

        // A live grandchild task still counts against the root.
        let grandchild = root.child().child();
        let task = grandchild.spawn(std::future::pending::<()>());
        assert_eq!(root.tracker.len(), 1);
        root.shutdown().await;
        assert_eq!(task.await.unwrap(), None);
        assert!(root.tracker.is_empty());
    }
}
