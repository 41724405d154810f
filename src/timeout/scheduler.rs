//! Cancellable deadline timers raced against event waits.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

/// A timer that fires once after its duration unless cancelled first.
///
/// The handle is itself a future: it resolves when the timer fires and stays
/// pending forever once cancelled, so it can sit in a `tokio::select!` next to
/// an event wait.
#[derive(Debug)]
pub struct TimeoutHandle {
    receiver: Option<oneshot::Receiver<()>>,
    task: JoinHandle<()>,
    fired: Arc<AtomicBool>,
    cancelled: AtomicBool,
    duration: Duration,
}

impl TimeoutHandle {
    /// Cancel the timer. Idempotent; a no-op once the timer has fired.
    pub fn cancel(&self) {
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.task.abort();
            trace!(duration_ms = self.duration.as_millis() as u64, "Timeout cancelled");
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Future for TimeoutHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(())) => {
                self.receiver = None;
                Poll::Ready(())
            }
            // Sender dropped without firing: the timer was cancelled
            Poll::Ready(Err(_)) => {
                self.receiver = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        if !self.has_fired() {
            self.task.abort();
        }
    }
}

/// Produces timers on the tokio timer wheel; no polling, cheap to hold for
/// tens of minutes.
#[derive(Debug, Clone, Default)]
pub struct TimeoutScheduler;

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Timer firing once after `duration`
    pub fn after(&self, duration: Duration) -> TimeoutHandle {
        let (sender, receiver) = oneshot::channel();
        let fired = Arc::new(AtomicBool::new(false));
        let task_fired = fired.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            task_fired.store(true, Ordering::Release);
            let _ = sender.send(());
        });

        TimeoutHandle {
            receiver: Some(receiver),
            task,
            fired,
            cancelled: AtomicBool::new(false),
            duration,
        }
    }

    /// Timer firing at a wall-clock deadline; fires immediately if it has passed
    pub fn until(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) -> TimeoutHandle {
        self.after(remaining_until(deadline, now))
    }
}

/// Time left until `deadline`, zero once it has passed
pub fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_duration() {
        let scheduler = TimeoutScheduler::new();
        let mut handle = scheduler.after(Duration::from_secs(30));

        tokio::select! {
            _ = &mut handle => {}
            _ = tokio::time::sleep(Duration::from_secs(31)) => panic!("timer did not fire"),
        }
        assert!(handle.has_fired());
        // Cancelling after firing is a no-op
        handle.cancel();
        assert!(!handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let scheduler = TimeoutScheduler::new();
        let mut handle = scheduler.after(Duration::from_secs(5));
        handle.cancel();
        handle.cancel();

        let fired = tokio::select! {
            _ = &mut handle => true,
            _ = tokio::time::sleep(Duration::from_secs(60)) => false,
        };
        assert!(!fired);
        assert!(handle.is_cancelled());
        assert!(!handle.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_stays_pending_until_deadline() {
        let scheduler = TimeoutScheduler::new();
        let mut handle = tokio_test::task::spawn(scheduler.after(Duration::from_secs(10)));
        tokio_test::assert_pending!(handle.poll());

        tokio::time::sleep(Duration::from_secs(9)).await;
        tokio_test::assert_pending!(handle.poll());

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio_test::assert_ready!(handle.poll());
    }

    #[test]
    fn test_remaining_until_past_deadline_is_zero() {
        let now = Utc::now();
        assert_eq!(
            remaining_until(now - chrono::Duration::seconds(10), now),
            Duration::ZERO
        );
        assert_eq!(
            remaining_until(now + chrono::Duration::seconds(10), now),
            Duration::from_secs(10)
        );
    }
}
