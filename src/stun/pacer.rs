//! Transmit-slot pacing for binding requests.
//!
//! NATs and some ISPs start dropping flows when a host opens bindings too quickly, so every
//! request that may create a new binding first waits for a slot here. Server traffic (STUN
//! and TURN) uses the high-priority lane, peer connectivity checks the regular one.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::scope::Scope;

/// Gap after a high-priority grant.
pub const HIGH_PRIORITY_INTERVAL: Duration = Duration::from_millis(5);

/// Default gap after a regular grant.
pub const DEFAULT_REGULAR_INTERVAL: Duration = Duration::from_millis(50);

type Grant = oneshot::Sender<()>;

#[derive(Debug, Clone)]
pub struct BindingPacer {
    high: mpsc::UnboundedSender<Grant>,
    regular: mpsc::UnboundedSender<Grant>,
}

impl BindingPacer {
    pub fn new(scope: &Scope, regular_interval: Duration) -> Self {
        let (high, high_rx) = mpsc::unbounded_channel();
        let (regular, regular_rx) = mpsc::unbounded_channel();
        scope.spawn(run_pacer(high_rx, regular_rx, regular_interval));
        BindingPacer { high, regular }
    }

    /// Suspend until a transmit slot is granted.
    ///
    /// Dropping the returned future before it completes gives up the place in the queue
    /// without using a slot. Returns `false` without waiting once the pacer has shut down.
    pub async fn wait(&self, high_priority: bool) -> bool {
        let (grant, granted) = oneshot::channel();
        let lane = if high_priority {
            &self.high
        } else {
            &self.regular
        };
        if lane.send(grant).is_err() {
            return false;
        }
        granted.await.is_ok()
    }
}

async fn run_pacer(
    mut high: mpsc::UnboundedReceiver<Grant>,
    mut regular: mpsc::UnboundedReceiver<Grant>,
    regular_interval: Duration,
) {
    loop {
        let (grant, pause) = if let Ok(grant) = high.try_recv() {
            (grant, HIGH_PRIORITY_INTERVAL)
        } else if let Ok(grant) = regular.try_recv() {
            (grant, regular_interval)
        } else {
            tokio::select! {
                biased;
                Some(grant) = high.recv() => (grant, HIGH_PRIORITY_INTERVAL),
                Some(grant) = regular.recv() => (grant, regular_interval),
                else => return,
            }
        };

        // The waiter went away: skip it without spending the slot.
        if grant.send(()).is_err() {
            continue;
        }
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;
    use tokio_test::assert_pending;

    #[tokio::test(start_paused = true)]
    async fn test_regular_grants_are_spaced() {
        let scope = Scope::new();
        let pacer = BindingPacer::new(&scope, DEFAULT_REGULAR_INTERVAL);

        let mut grants = Vec::new();
        for _ in 0..10 {
            pacer.wait(false).await;
            grants.push(Instant::now());
        }
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_jumps_queue() {
        let scope = Scope::new();
        let pacer = BindingPacer::new(&scope, DEFAULT_REGULAR_INTERVAL);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..6 {
            let (pacer, order) = (pacer.clone(), order.clone());
            tasks.push(tokio::spawn(async move {
                pacer.wait(false).await;
                order.lock().unwrap().push(format!("regular-{}", i));
            }));
            tokio::task::yield_now().await;
        }
        let (p, o) = (pacer.clone(), order.clone());
        tasks.push(tokio::spawn(async move {
            p.wait(true).await;
            o.lock().unwrap().push("high".to_string());
        }));
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock().unwrap();
        let high_at = order.iter().position(|s| s == "high").unwrap();
        assert!(high_at <= 1, "high-priority grant came at {}", high_at);
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_use_slot() {
        let scope = Scope::new();
        let pacer = BindingPacer::new(&scope, DEFAULT_REGULAR_INTERVAL);
        let start = Instant::now();
        pacer.wait(false).await;

        let mut abandoned = tokio_test::task::spawn(pacer.wait(false));
        assert_pending!(abandoned.poll());
        drop(abandoned);

        pacer.wait(false).await;
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(100));
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_interval() {
        let scope = Scope::new();
        let pacer = BindingPacer::new(&scope, DEFAULT_REGULAR_INTERVAL);
        let start = Instant::now();
        pacer.wait(true).await;
        pacer.wait(true).await;
        let elapsed = Instant::now() - start;
        assert!(elapsed >= HIGH_PRIORITY_INTERVAL && elapsed < DEFAULT_REGULAR_INTERVAL);
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_reports_shutdown() {
        let scope = Scope::new();
        let pacer = BindingPacer::new(&scope, DEFAULT_REGULAR_INTERVAL);
        assert!(pacer.wait(false).await);

        scope.shutdown().await;
        let start = Instant::now();
        assert!(!pacer.wait(false).await);
        assert!(!pacer.wait(true).await);
        assert_eq!(Instant::now(), start);
    }
}
