//! Bounded pool of spawned tasks.
//!
//! Jobs run on the runtime's worker threads, so parsing and hashing in one job
//! overlap with network waits in another. The number of jobs in flight is
//! capped here; outbound request rates are capped by the shared
//! `RateLimitedClient` the jobs call through.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::error;

type Job<I, T> = Box<dyn Fn(I) -> BoxFuture<'static, T> + Send + Sync>;

pub struct WorkerPool<I, T> {
    queue: std::vec::IntoIter<I>,
    running: JoinSet<(I, Result<T, String>)>,
    limit: usize,
    job: Job<I, T>,
}

impl<I, T> WorkerPool<I, T>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut>(items: Vec<I>, limit: usize, job: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            queue: items.into_iter(),
            running: JoinSet::new(),
            limit: limit.max(1),
            job: Box::new(move |item| job(item).boxed()),
        }
    }

    /// Next finished job in completion order, with the item it was given.
    /// A job that panicked yields `Err` with the panic message.
    pub async fn next(&mut self) -> Option<(I, Result<T, String>)> {
        loop {
            while self.running.len() < self.limit {
                let Some(item) = self.queue.next() else { break };
                let fut = (self.job)(item.clone());
                self.running.spawn(async move {
                    let out = AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message);
                    (item, out)
                });
            }
            match self.running.join_next().await? {
                Ok(done) => return Some(done),
                Err(e) => error!(error = %e, "Worker task did not finish"),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_overlap_up_to_the_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        let mut pool = WorkerPool::new((0..12).collect(), 3, move |i: u32| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        });

        let mut seen = Vec::new();
        while let Some((i, out)) = pool.next().await {
            assert_eq!(out, Ok(i * 2));
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported_for_its_item() {
        let mut pool = WorkerPool::new(vec![1u32, 2, 3], 2, |i: u32| async move {
            if i == 2 {
                panic!("bad input {i}");
            }
            i
        });

        let mut results = Vec::new();
        while let Some(done) = pool.next().await {
            results.push(done);
        }
        results.sort_by_key(|(i, _)| *i);
        assert_eq!(results[0], (1, Ok(1)));
        assert_eq!(results[1], (2, Err("bad input 2".to_string())));
        assert_eq!(results[2], (3, Ok(3)));
    }
}
