//! Batch Scheduler (§4.6): bounded-concurrency dispatch of many small
//! operations, with admission control driven by memory and socket pressure.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::error::{StorageClientError, StorageClientResult};

type BoxedOp<T> = Pin<Box<dyn Future<Output = StorageClientResult<T>> + Send>>;

/// Admission-control parameters (§4.6 "Queueing").
#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    pub concurrency: usize,
    /// Socket reuse raises the effective ceiling (`concurrency * 5`); without
    /// it the ceiling is just `concurrency`.
    pub socket_reuse: bool,
    pub memory_per_op_bytes: u64,
    pub system_memory_bytes: u64,
}

impl SchedulerLimits {
    fn shared_factor(&self) -> usize {
        if self.socket_reuse {
            5
        } else {
            1
        }
    }
}

/// Bounded-concurrency queue of operations (§3 Batch Operation, §4.6).
/// Operations enter QUEUED via [`submit`](Self::submit); [`run`](Self::run)
/// drives them through RUNNING to exactly one of COMPLETED/ERRORED,
/// delivered to the caller's callback in completion order.
pub struct BatchScheduler<T> {
    limits: SchedulerLimits,
    queued: VecDeque<(u64, BoxedOp<T>)>,
    active: usize,
    poison: Option<Arc<StorageClientError>>,
}

impl<T: Send + 'static> BatchScheduler<T> {
    pub fn new(limits: SchedulerLimits) -> Self {
        Self { limits, queued: VecDeque::new(), active: 0, poison: None }
    }

    pub fn submit(&mut self, id: u64, op: impl Future<Output = StorageClientResult<T>> + Send + 'static) {
        self.queued.push_back((id, Box::pin(op)));
    }

    /// Poisons the scheduler: every operation still QUEUED (and any submitted
    /// afterward) fires its callback with `err` instead of dispatching
    /// (§4.6 "Cancellation").
    pub fn poison(&mut self, err: &StorageClientError) {
        self.poison = Some(Arc::new(poisoned_copy(err)));
    }

    fn is_heavy(&self) -> bool {
        let limits = &self.limits;
        if self.active >= limits.concurrency * limits.shared_factor() {
            return true;
        }
        if self.active >= limits.concurrency {
            let projected = limits.memory_per_op_bytes * (self.queued.len() + self.active) as u64;
            if projected > limits.system_memory_bytes / 2 {
                return true;
            }
        }
        false
    }

    /// Runs every queued (and poisoned) operation to completion, invoking
    /// `on_result` in completion order, and returns once the active set is
    /// empty and nothing remains queued — the scheduler's `end` event.
    pub async fn run(mut self, mut on_result: impl FnMut(u64, StorageClientResult<T>)) {
        let mut running: FuturesUnordered<Pin<Box<dyn Future<Output = (u64, StorageClientResult<T>)> + Send>>> =
            FuturesUnordered::new();

        loop {
            while let Some((id, op)) = self.queued.pop_front() {
                if let Some(poison) = &self.poison {
                    on_result(id, Err(poisoned_copy(poison)));
                    continue;
                }
                if self.is_heavy() {
                    self.queued.push_front((id, op));
                    break;
                }
                self.active += 1;
                running.push(Box::pin(async move { (id, op.await) }));
            }

            if running.is_empty() {
                break;
            }

            if let Some((id, result)) = running.next().await {
                self.active -= 1;
                on_result(id, result);
            }
        }
    }
}

fn poisoned_copy(err: &StorageClientError) -> StorageClientError {
    let mut copy = StorageClientError::new(err.kind, err.message.clone());
    if let Some(status) = err.status_code {
        copy = copy.with_status(status);
    }
    if let Some(request_id) = &err.request_id {
        copy = copy.with_request_id(request_id.clone());
    }
    if let Some(service_code) = &err.service_code {
        copy = copy.with_service_code(service_code.clone());
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn limits(concurrency: usize) -> SchedulerLimits {
        SchedulerLimits {
            concurrency,
            socket_reuse: false,
            memory_per_op_bytes: 1,
            system_memory_bytes: u64::MAX,
        }
    }

    #[tokio::test]
    async fn every_operation_completes_exactly_once() {
        let mut scheduler: BatchScheduler<u64> = BatchScheduler::new(limits(2));
        for id in 0..10 {
            scheduler.submit(id, async move { Ok(id * 10) });
        }
        let results = Mutex::new(Vec::new());
        scheduler.run(|id, result| results.lock().unwrap().push((id, result.unwrap()))).await;
        let mut results = results.into_inner().unwrap();
        results.sort_by_key(|(id, _)| *id);
        assert_eq!(results, (0..10).map(|id| (id, id * 10)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn active_count_never_exceeds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut scheduler: BatchScheduler<()> = BatchScheduler::new(limits(3));
        for _ in 0..20 {
            let active = active.clone();
            let max_active = max_active.clone();
            scheduler.submit(0, async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        scheduler.run(|_, _| {}).await;
        assert!(max_active.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn poisoned_operations_fire_callback_without_dispatch() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut scheduler: BatchScheduler<()> = BatchScheduler::new(limits(2));
        scheduler.poison(&StorageClientError::new(ErrorKind::InternalError, "batch aborted"));
        for _ in 0..5 {
            let ran = ran.clone();
            scheduler.submit(0, async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let errors = Mutex::new(0);
        scheduler
            .run(|_, result| {
                assert!(result.is_err());
                *errors.lock().unwrap() += 1;
            })
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(errors.into_inner().unwrap(), 5);
    }
}
