//! Background Tasks
//!
//! Spawned loops that stop on a watch signal. Periodic passes skip missed
//! ticks instead of bursting to catch up.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{Error, Result};

/// Handle to a spawned loop
pub struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn a loop that receives the shutdown signal itself
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        Self { name, shutdown, handle }
    }

    /// Run `pass` every `period`, starting one period from now
    pub fn periodic<F, Fut>(name: &'static str, period: Duration, mut pass: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::spawn(name, move |mut shutdown| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => pass().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("{} task stopped", name);
        })
    }

    /// Task name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop and wait for it to finish the pass in progress
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("{} task failed: {}", self.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_runs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let task = BackgroundTask::periodic("counter", Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(65)).await;
        task.stop().await.unwrap();

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several passes, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_first_pass_waits_one_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let task = BackgroundTask::periodic("slow", Duration::from_secs(60), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.name(), "slow");
        task.stop().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
