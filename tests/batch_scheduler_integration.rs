//! Batch scheduler completion-order and backpressure invariants (§8
//! "Scheduler invariants").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use storage_client_core::{BatchScheduler, SchedulerLimits};

fn limits(concurrency: usize) -> SchedulerLimits {
    SchedulerLimits { concurrency, socket_reuse: false, memory_per_op_bytes: 1, system_memory_bytes: u64::MAX }
}

#[tokio::test]
async fn callbacks_fire_once_each_in_completion_not_submission_order() {
    let mut scheduler: BatchScheduler<u64> = BatchScheduler::new(limits(4));
    let delays_ms = [30u64, 5, 20, 1, 15];
    for (id, delay) in delays_ms.iter().enumerate() {
        let delay = *delay;
        scheduler.submit(id as u64, async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            Ok(id as u64)
        });
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = order.clone();
    scheduler
        .run(move |id, result| {
            order_clone.lock().unwrap().push(id);
            assert!(result.is_ok());
        })
        .await;

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 5);
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4], "every id completes exactly once");
    assert_ne!(*order, vec![0u64, 1, 2, 3, 4], "fastest ops should complete before slower ones submitted earlier");
}

#[tokio::test]
async fn concurrency_ceiling_is_respected_under_load() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let mut scheduler: BatchScheduler<()> = BatchScheduler::new(limits(5));

    for _ in 0..50 {
        let active = active.clone();
        let max_active = max_active.clone();
        scheduler.submit(0, async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
    }

    scheduler.run(|_, _| {}).await;
    assert!(max_active.load(Ordering::SeqCst) <= 5);
}
