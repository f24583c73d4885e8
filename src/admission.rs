// Admission control for the Whisper server
//
// A counting gate bounds the number of transcriptions in flight. Requests
// that cannot get a slot wait up to the configured queue window and are then
// turned away with 429. The ticket wraps an owned semaphore permit, so a
// slot is released exactly once, by dropping the ticket; a second release is
// unrepresentable.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The server is at capacity and the queue wait elapsed
#[derive(Error, Debug)]
#[error("too many concurrent transcription requests")]
pub struct BusyError;

/// A held in-flight slot. Dropping the ticket returns the slot.
#[derive(Debug)]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
}

/// Bounded-concurrency gate with a bounded queue wait.
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    queue_wait: Duration,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize, queue_wait: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queue_wait,
        }
    }

    /// Wait for an in-flight slot, up to the queue window.
    ///
    /// Cancellation-safe: dropping the returned future while queued gives up
    /// the place in line without consuming a permit.
    pub async fn try_enter(&self) -> Result<AdmissionTicket, BusyError> {
        let acquire = self.permits.clone().acquire_owned();
        match tokio::time::timeout(self.queue_wait, acquire).await {
            Ok(Ok(permit)) => {
                debug!(
                    "admission granted ({} of {} slots free)",
                    self.permits.available_permits(),
                    self.max_concurrent
                );
                Ok(AdmissionTicket { _permit: permit })
            }
            // Semaphore closed: treated the same as exhaustion
            Ok(Err(_)) => Err(BusyError),
            Err(_) => {
                debug!("admission refused after {:?} queue wait", self.queue_wait);
                Err(BusyError)
            }
        }
    }

    /// Slots not currently held.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_up_to_the_cap() {
        let gate = AdmissionController::new(2, Duration::from_millis(10));
        let first = gate.try_enter().await.unwrap();
        let _second = gate.try_enter().await.unwrap();
        assert_eq!(gate.available_slots(), 0);

        drop(first);
        assert_eq!(gate.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_when_full_and_wait_elapses() {
        let gate = AdmissionController::new(1, Duration::from_secs(1));
        let _held = gate.try_enter().await.unwrap();

        let refused = gate.try_enter().await;
        assert!(refused.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_admits_when_slot_frees_within_window() {
        let gate = Arc::new(AdmissionController::new(1, Duration::from_secs(5)));
        let held = gate.try_enter().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_enter().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(held);

        let ticket = waiter.await.unwrap();
        assert!(ticket.is_ok());
    }

    #[tokio::test]
    async fn in_flight_count_never_exceeds_cap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let gate = Arc::new(AdmissionController::new(3, Duration::from_millis(50)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                match gate.try_enter().await {
                    Ok(_ticket) => {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        assert!(now <= 3, "observed {} holders with cap 3", now);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        true
                    }
                    Err(BusyError) => false,
                }
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        // everything eventually ran or was refused; slots all returned
        assert!(admitted >= 3);
        assert_eq!(gate.available_slots(), 3);
    }
}
