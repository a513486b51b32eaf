use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Shared completion/cancellation state of one streaming call.
///
/// The producer marks the stream completed once the terminal chunk is
/// emitted; the response wrapper cancels it when dropped. A cancel that
/// arrives before completion is a caller disconnect.
#[derive(Clone)]
pub struct StreamCancelHandle {
    sender: Arc<watch::Sender<bool>>,
    completed: Arc<AtomicBool>,
}

impl StreamCancelHandle {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the stream as completed normally.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Signal cancellation.
    ///
    /// Returns `true` when this is a disconnect, i.e. the stream had not
    /// completed yet and was not already cancelled.
    pub fn cancel(&self) -> bool {
        if self.is_completed() {
            return false;
        }
        let mut newly_cancelled = false;
        self.sender.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                newly_cancelled = true;
                true
            }
        });
        newly_cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Get a receiver for use in `select!`.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for StreamCancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_notifies_subscribers() {
        let handle = StreamCancelHandle::new();
        let mut rx = handle.subscribe();

        assert!(!handle.is_cancelled());
        assert!(handle.cancel());
        assert!(handle.is_cancelled());

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_cancel_after_completion_is_not_a_disconnect() {
        let handle = StreamCancelHandle::new();
        handle.mark_completed();

        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_second_cancel_is_not_reported() {
        let handle = StreamCancelHandle::new();
        assert!(handle.cancel());
        assert!(!handle.cancel());
    }
}
