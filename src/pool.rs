//! Bounded fan-out with order restoration.
//!
//! ## Why an indexed slot array?
//!
//! `buffer_unordered` yields results in completion order. Later stages assume
//! reading order ("the first segment of a chapter shows the chapter title"),
//! so every task carries the index it was submitted with and its outcome is
//! written straight into `slots[index]`. No sort, no search, no ambiguity
//! when two segments carry equal content.
//!
//! ## Why a semaphore on top of `buffer_unordered`?
//!
//! `buffer_unordered(n)` bounds one stream. The semaphore is shared by every
//! clone of the pool, and [`WorkerPool::shared`] hands out one pool per limit
//! for the whole process, so two books narrated at once still respect one
//! limit on external calls.

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Why one task produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The task returned an error.
    Failed(String),
    /// The task ran past its deadline and was dropped.
    TimedOut { secs: u64 },
    /// The task panicked or was cancelled.
    Aborted(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Failed(detail) => write!(f, "{detail}"),
            TaskFailure::TimedOut { secs } => write!(f, "timed out after {secs}s"),
            TaskFailure::Aborted(detail) => write!(f, "task aborted: {detail}"),
        }
    }
}

static SHARED: Lazy<Mutex<HashMap<usize, WorkerPool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// A concurrency limit shared by every clone.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    limit: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// The process-wide pool for `limit`. Every caller asking for the same
    /// limit draws from the same permits.
    pub fn shared(limit: usize) -> Self {
        let limit = limit.max(1);
        let mut pools = SHARED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pools.entry(limit).or_insert_with(|| WorkerPool::new(limit)).clone()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `task` once per item, at most `limit` at a time, each under
    /// `timeout`, and return the outcomes in submission order.
    ///
    /// `observe` sees every outcome as it completes (in completion order).
    pub async fn map_ordered<T, R, E, F, Fut, O>(
        &self,
        items: Vec<T>,
        timeout: Duration,
        task: F,
        mut observe: O,
    ) -> Vec<Result<R, TaskFailure>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        O: FnMut(usize, &Result<R, TaskFailure>),
    {
        let total = items.len();
        let mut slots: Vec<Option<Result<R, TaskFailure>>> = (0..total).map(|_| None).collect();
        let task = Arc::new(task);

        let mut completions = stream::iter(items.into_iter().enumerate().map(|(index, item)| {
            let permits = Arc::clone(&self.permits);
            let task = Arc::clone(&task);
            async move {
                let handle = tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| TaskFailure::Aborted(e.to_string()))?;
                    match tokio::time::timeout(timeout, (*task)(index, item)).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(TaskFailure::Failed(e.to_string())),
                        Err(_) => Err(TaskFailure::TimedOut {
                            secs: timeout.as_secs(),
                        }),
                    }
                });
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(join) => Err(TaskFailure::Aborted(join.to_string())),
                };
                (index, outcome)
            }
        }))
        .buffer_unordered(self.limit);

        while let Some((index, outcome)) = completions.next().await {
            observe(index, &outcome);
            slots[index] = Some(outcome);
        }
        debug!("Fan-out of {} tasks complete (limit {})", total, self.limit);

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(TaskFailure::Aborted("no outcome recorded".into()))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reversed_completion_keeps_submission_order() {
        let pool = WorkerPool::new(10);
        let mut completion_order = Vec::new();
        let out = pool
            .map_ordered(
                (0..10).collect::<Vec<u64>>(),
                Duration::from_secs(5),
                |_, i| async move {
                    // s9 finishes first, s0 last
                    tokio::time::sleep(Duration::from_millis((10 - i) * 15)).await;
                    Ok::<_, String>(format!("s{i}"))
                },
                |index, _| completion_order.push(index),
            )
            .await;
        let values: Vec<String> = out.into_iter().map(Result::unwrap).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("s{i}")).collect();
        assert_eq!(values, expected);
        assert_eq!(completion_order.first(), Some(&9));
        assert_eq!(completion_order.last(), Some(&0));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let pool = WorkerPool::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
        pool.map_ordered(
            vec![(); 12],
            Duration::from_secs(5),
            move |_, ()| {
                let (c, p) = (Arc::clone(&c), Arc::clone(&p));
                async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
            |_, _| {},
        )
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn failures_stay_in_their_slot() {
        let pool = WorkerPool::new(4);
        let out = pool
            .map_ordered(
                vec![0u32, 1, 2, 3],
                Duration::from_millis(100),
                |_, i| async move {
                    match i {
                        1 => Err("service said no".to_string()),
                        2 => {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(i)
                        }
                        3 => panic!("worker blew up"),
                        _ => Ok(i),
                    }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(out[0], Ok(0));
        assert_eq!(out[1], Err(TaskFailure::Failed("service said no".into())));
        assert!(matches!(out[2], Err(TaskFailure::TimedOut { .. })));
        assert!(matches!(out[3], Err(TaskFailure::Aborted(_))));
    }

    #[tokio::test]
    async fn empty_input_is_empty_output() {
        let pool = WorkerPool::new(2);
        let out = pool
            .map_ordered(
                Vec::<u8>::new(),
                Duration::from_secs(1),
                |_, b| async move { Ok::<_, String>(b) },
                |_, _| {},
            )
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn shared_pools_draw_from_one_limit() {
        let a = WorkerPool::shared(5);
        let b = WorkerPool::shared(5);
        assert!(Arc::ptr_eq(&a.permits, &b.permits));
        assert!(!Arc::ptr_eq(&a.permits, &WorkerPool::shared(6).permits));
        assert_eq!(WorkerPool::shared(0).limit(), 1);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let fan_out = |pool: WorkerPool| {
            let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
            async move {
                pool.map_ordered(
                    vec![(); 10],
                    Duration::from_secs(5),
                    move |_, ()| {
                        let (c, p) = (Arc::clone(&c), Arc::clone(&p));
                        async move {
                            let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                            p.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            c.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, String>(())
                        }
                    },
                    |_, _| {},
                )
                .await
            }
        };
        tokio::join!(fan_out(a), fan_out(b));
        assert!(peak.load(Ordering::SeqCst) <= 5);
    }
}
