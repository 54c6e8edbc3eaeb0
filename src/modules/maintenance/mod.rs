//! Supervised background maintenance loops.
//!
//! Each loop runs one iteration at a time inside its own task so a failing
//! or panicking iteration is logged and retried after a fixed backoff. Loops
//! never return on their own; they stop only when their task is aborted.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::modules::records::PoolError;
use crate::store::StoreError;

/// Any failure inside one maintenance iteration.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

/// Interval between successful iterations and backoff after a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSchedule {
    pub interval: Duration,
    pub error_backoff: Duration,
}

impl LoopSchedule {
    pub fn new(interval: Duration, error_backoff: Duration) -> Self {
        Self {
            interval,
            error_backoff,
        }
    }
}

/// Run `iteration` forever on `schedule`.
pub async fn run_forever<F, Fut>(name: &'static str, schedule: LoopSchedule, mut iteration: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), MaintenanceError>> + Send + 'static,
{
    log::info!(
        "{name} maintenance started (interval {:?}, backoff {:?})",
        schedule.interval,
        schedule.error_backoff
    );
    loop {
        let wait = match tokio::spawn(iteration()).await {
            Ok(Ok(())) => schedule.interval,
            Ok(Err(err)) => {
                log::error!("{name} maintenance failed: {err}");
                schedule.error_backoff
            }
            Err(join_err) => {
                log::error!("{name} maintenance iteration aborted: {join_err}");
                schedule.error_backoff
            }
        };
        sleep(wait).await;
    }
}

/// Handles for spawned maintenance loops; aborting them is the shutdown path.
#[derive(Debug, Default)]
pub struct MaintenanceHandles {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl MaintenanceHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Whether every loop is still running.
    pub fn all_running(&self) -> bool {
        self.handles.iter().all(|(_, handle)| !handle.is_finished())
    }

    pub fn shutdown(self) {
        for (name, handle) in self.handles {
            handle.abort();
            log::info!("{name} maintenance stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_do_not_stop_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let schedule = LoopSchedule::new(Duration::from_secs(300), Duration::from_secs(60));

        let handle = tokio::spawn(run_forever("test", schedule, move || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(MaintenanceError::Other("boom".into())),
                    1 => panic!("iteration panicked"),
                    _ => Ok(()),
                }
            }
        }));

        // run 0 fails (60s backoff), run 1 panics (60s backoff), run 2 succeeds (300s).
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        let mut handles = MaintenanceHandles::new();
        handles.push("test", handle);
        assert!(handles.all_running());
        assert_eq!(handles.names(), vec!["test"]);
        handles.shutdown();
    }
}
