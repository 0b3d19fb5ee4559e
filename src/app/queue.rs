use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::app::runner::TaskRunner;

/// Bounds how many tasks run at once. Each task runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    semaphore: Arc<Semaphore>,
}

impl InProcessQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn spawn<F>(&self, job: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::error!("in-process queue semaphore is closed");
                return;
            };
            if let Err(err) = tokio::task::spawn_blocking(job).await {
                tracing::error!(?err, "queued task panicked");
            }
        })
    }

    /// Run the given tasks and wait for all of them. Returns how many ran.
    pub async fn run_all(&self, runner: Arc<TaskRunner>, task_ids: Vec<String>) -> usize {
        let handles: Vec<_> = task_ids
            .into_iter()
            .map(|task_id| {
                let runner = Arc::clone(&runner);
                self.spawn(move || runner.run_task(&task_id))
            })
            .collect();

        let mut finished = 0;
        for handle in handles {
            match handle.await {
                Ok(()) => finished += 1,
                Err(err) => tracing::error!(?err, "queue worker aborted"),
            }
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrency_is_bounded() {
        let queue = InProcessQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                queue.spawn(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_concurrency_still_makes_progress() {
        let queue = InProcessQueue::new(0);
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        queue
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
