//! Cancellable periodic tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs an async job repeatedly.
///
/// The next run is scheduled `interval` after the previous one completes,
/// so runs never overlap. Once [`stop`](Self::stop) returns no new run
/// starts. Dropping the task stops it.
#[derive(Debug)]
pub struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns the task on the current runtime.
    pub fn spawn<F, Fut>(interval: Duration, execute_at_start: bool, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            if execute_at_start {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => return,
                    () = job() => {}
                }
            }
            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    () = job() => {}
                }
            }
        });
        Self { token, handle }
    }

    /// Stops the task.
    pub fn stop(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    /// Returns true once the task has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(count: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn runs_repeatedly() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::spawn(Duration::from_millis(10), false, counting(&count));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.stop();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn execute_at_start_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::spawn(Duration::from_secs(60), true, counting(&count));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(task);
    }

    #[tokio::test]
    async fn no_run_after_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::spawn(Duration::from_millis(10), false, counting(&count));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop();
        assert!(task.is_stopped());
        // let an in-flight abort settle
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn runs_do_not_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let (r, o) = (running.clone(), overlapped.clone());
        let task = PeriodicTask::spawn(Duration::from_millis(1), true, move || {
            let (r, o) = (r.clone(), o.clone());
            async move {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.stop();
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }
}
