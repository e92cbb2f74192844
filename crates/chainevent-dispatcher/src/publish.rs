//! Delivery of events to consumer output queues.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use chainevent_core::Backpressure;

/// Send `event` to one consumer under the configured backpressure policy.
///
/// Returns `true` if the event was enqueued. A full queue drops the event
/// (immediately, or after the bounded wait); a closed queue is logged and
/// skipped.
pub async fn publish<T>(
    sender: &mpsc::Sender<T>,
    event: T,
    backpressure: Backpressure,
    label: &'static str,
) -> bool {
    match backpressure {
        Backpressure::NonBlocking => match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(event = label, "consumer queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(event = label, "consumer queue closed");
                false
            }
        },
        Backpressure::Blocking => match sender.send(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!(event = label, "consumer queue closed");
                false
            }
        },
        Backpressure::Timeout(limit) => {
            match tokio::time::timeout(limit, sender.send(event)).await {
                Ok(Ok(())) => true,
                Ok(Err(_)) => {
                    debug!(event = label, "consumer queue closed");
                    false
                }
                Err(_) => {
                    warn!(
                        event = label,
                        timeout_ms = limit.as_millis() as u64,
                        "timed out publishing to consumer, event dropped"
                    );
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn non_blocking_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(publish(&tx, 1, Backpressure::NonBlocking, "test").await);
        assert!(!publish(&tx, 2, Backpressure::NonBlocking, "test").await);
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn blocking_waits_for_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(1).await.unwrap();

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });

        assert!(publish(&tx, 2, Backpressure::Blocking, "test").await);
        drop(tx);
        assert_eq!(consumer.await.unwrap(), (Some(1), Some(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_within_bound() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(1).await.unwrap();

        let started = tokio::time::Instant::now();
        let sent = publish(
            &tx,
            2,
            Backpressure::Timeout(Duration::from_millis(300)),
            "test",
        )
        .await;
        assert!(!sent);
        assert!(started.elapsed() <= Duration::from_millis(310));
    }

    #[tokio::test]
    async fn closed_queue_is_skipped() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        assert!(!publish(&tx, 1, Backpressure::NonBlocking, "test").await);
        assert!(!publish(&tx, 1, Backpressure::Blocking, "test").await);
    }
}
