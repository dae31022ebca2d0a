use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use localbridge_queue::{AdmissionQueue, QueueOptions};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_holds_under_parallel_runtime() {
    let queue = AdmissionQueue::new(QueueOptions {
        concurrency: 3,
        max_pending: None,
    });
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tickets: Vec<_> = (0..40)
        .map(|_| {
            let current = current.clone();
            let peak = peak.clone();
            queue
                .enqueue(move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
        })
        .collect();

    for result in join_all(tickets).await {
        result.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(queue.stats().running, 0);
    assert_eq!(queue.stats().pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serialized_queue_preserves_arrival_order() {
    let queue = AdmissionQueue::default();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Enqueue from several tasks; the arrival order is whatever order the
    // queue accepted them in, recorded under the same lock.
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let producers: Vec<_> = (0..16)
        .map(|i| {
            let queue = queue.clone();
            let order = order.clone();
            let arrivals = arrivals.clone();
            tokio::spawn(async move {
                let ticket = {
                    let mut arrivals = arrivals.lock().unwrap();
                    let ticket = queue
                        .enqueue(move || async move {
                            order.lock().unwrap().push(i);
                        })
                        .unwrap();
                    arrivals.push(i);
                    ticket
                };
                ticket.await.unwrap();
            })
        })
        .collect();

    for producer in join_all(producers).await {
        producer.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), *arrivals.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_slots_start_jobs_in_enqueue_order() {
    for _ in 0..50 {
        let queue = AdmissionQueue::new(QueueOptions {
            concurrency: 8,
            max_pending: None,
        });
        let started = Arc::new(Mutex::new(Vec::new()));

        let tickets: Vec<_> = (0..32)
            .map(|i| {
                let started = started.clone();
                queue
                    .enqueue(move || {
                        started.lock().unwrap().push(i);
                        async move {
                            tokio::time::sleep(Duration::from_micros(200)).await;
                        }
                    })
                    .unwrap()
            })
            .collect();

        for result in join_all(tickets).await {
            result.unwrap();
        }

        assert_eq!(*started.lock().unwrap(), (0..32).collect::<Vec<_>>());
        assert_eq!(queue.running(), 0);
    }
}

#[tokio::test]
async fn test_failures_do_not_disturb_other_jobs() {
    let queue = AdmissionQueue::default();

    let results: Vec<_> = (0..6)
        .map(|i| {
            queue
                .enqueue(move || async move {
                    if i % 2 == 0 {
                        Err(format!("job {i} failed"))
                    } else {
                        Ok(i)
                    }
                })
                .unwrap()
        })
        .collect();

    let outcomes: Vec<_> = join_all(results)
        .await
        .into_iter()
        .map(|ticket| ticket.unwrap())
        .collect();

    assert_eq!(outcomes[0], Err("job 0 failed".to_string()));
    assert_eq!(outcomes[1], Ok(1));
    assert_eq!(outcomes[4], Err("job 4 failed".to_string()));
    assert_eq!(outcomes[5], Ok(5));
    assert_eq!(queue.running(), 0);
}
