//! Operation queue behavior under contention: the started promise gives
//! callers backpressure, and weight caps hold across mixed workloads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keel_engine::OperationQueue;
use pretty_assertions::assert_eq;

#[test_log::test(tokio::test)]
async fn started_promises_fire_once_work_is_admitted() {
    let queue = OperationQueue::new(1);
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut started = Vec::new();
    let mut runs = Vec::new();
    for index in 0..4usize {
        let (ready, run) = queue.enqueue_with_started(0, {
            let order = Arc::clone(&order);
            async move {
                order.lock().expect("order lock poisoned").push(index);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        started.push(ready);
        runs.push(run);
    }

    // Single slot: the runs proceed one at a time, and every started
    // promise has fired by the time its work ran.
    futures::future::join_all(runs).await;
    for ready in started {
        ready.await.expect("work started");
    }
    assert_eq!(order.lock().expect("order lock poisoned").len(), 4);
}

#[test_log::test(tokio::test)]
async fn mixed_weights_respect_the_share_cap() {
    let queue = Arc::new(OperationQueue::new(16).with_share_capacity(6));
    let in_flight_weight = Arc::new(AtomicUsize::new(0));
    let peak_weight = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for weight in [1u32, 2, 3, 1, 2, 3, 1, 2] {
        let queue = Arc::clone(&queue);
        let in_flight = Arc::clone(&in_flight_weight);
        let peak = Arc::clone(&peak_weight);
        handles.push(tokio::spawn(async move {
            queue
                .enqueue_weighted(weight, async move {
                    let now = in_flight.fetch_add(weight as usize, Ordering::SeqCst)
                        + weight as usize;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    in_flight.fetch_sub(weight as usize, Ordering::SeqCst);
                })
                .await;
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    assert!(
        peak_weight.load(Ordering::SeqCst) <= 6,
        "in-flight weight stayed under the share cap",
    );
}
