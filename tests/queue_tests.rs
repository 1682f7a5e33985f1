use std::sync::Arc;
use std::time::Duration;

use task_orchestrator::scheduler::{JobId, JobQueue};
use task_orchestrator::OrchestratorError;

#[test]
fn test_higher_priority_first() {
    let queue = JobQueue::new();
    let low = JobId::new();
    let high = JobId::new();
    let mid = JobId::new();

    queue.enqueue(low, -5).unwrap();
    queue.enqueue(high, 10).unwrap();
    queue.enqueue(mid, 0).unwrap();

    assert_eq!(queue.len(), 3);
    assert_eq!(queue.try_dequeue().unwrap(), Some(high));
    assert_eq!(queue.try_dequeue().unwrap(), Some(mid));
    assert_eq!(queue.try_dequeue().unwrap(), Some(low));
    assert_eq!(queue.try_dequeue().unwrap(), None);
    assert!(queue.is_empty());
}

#[test]
fn test_equal_priority_is_fifo() {
    let queue = JobQueue::new();
    let ids: Vec<JobId> = (0..10).map(|_| JobId::new()).collect();
    for id in &ids {
        queue.enqueue(*id, 1).unwrap();
    }

    let drained: Vec<JobId> = std::iter::from_fn(|| queue.try_dequeue().unwrap()).collect();
    assert_eq!(drained, ids);
}

#[tokio::test]
async fn test_dequeue_waits_for_enqueue() {
    let queue = Arc::new(JobQueue::new());
    let id = JobId::new();

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    queue.enqueue(id, 0).unwrap();
    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, id);
}

#[tokio::test]
async fn test_close_wakes_all_waiters() {
    let queue = Arc::new(JobQueue::new());

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    queue.close();
    assert!(queue.is_closed());

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(OrchestratorError::QueueClosed)));
    }
}

#[tokio::test]
async fn test_dequeue_cancelled_by_select() {
    let queue = JobQueue::new();
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();

    let cancelled = tokio::select! {
        _ = queue.dequeue() => false,
        _ = token.cancelled() => true,
    };
    assert!(cancelled);

    // The abandoned dequeue did not swallow anything
    let id = JobId::new();
    queue.enqueue(id, 0).unwrap();
    assert_eq!(queue.dequeue().await.unwrap(), id);
}

#[test]
fn test_enqueue_after_close_fails() {
    let queue = JobQueue::new();
    queue.enqueue(JobId::new(), 0).unwrap();
    queue.close();

    assert!(matches!(
        queue.enqueue(JobId::new(), 0),
        Err(OrchestratorError::QueueClosed)
    ));
    assert!(matches!(
        queue.try_dequeue(),
        Err(OrchestratorError::QueueClosed)
    ));
}
