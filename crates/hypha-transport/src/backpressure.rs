//! Byte budget for a connection's outbound queue.
//!
//! Each encoded frame reserves its length before it is queued and releases it
//! once the writer has flushed it to the stream. A reservation that would push
//! the queue past its limit is refused; the caller decides what to do with the
//! connection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Backpressure error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackpressureError {
    #[error("write queue full: {queued} bytes queued, {requested} requested, limit {limit}")]
    BufferFull {
        queued: usize,
        requested: usize,
        limit: usize,
    },
}

/// Tracks bytes queued for sending against a fixed limit.
pub struct BackpressureHandler {
    send_buffer_limit: usize,
    current_buffer: Mutex<usize>,
    rejected_count: AtomicU64,
}

impl BackpressureHandler {
    pub fn new(limit: usize) -> Self {
        Self {
            send_buffer_limit: limit,
            current_buffer: Mutex::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Check if a frame of `size` bytes would currently fit.
    pub fn can_send(&self, size: usize) -> bool {
        let current = *self.current_buffer.lock();
        current.saturating_add(size) <= self.send_buffer_limit
    }

    /// Reserve buffer space for one frame.
    pub fn try_reserve(&self, size: usize) -> Result<(), BackpressureError> {
        let mut current = self.current_buffer.lock();
        let next = current.saturating_add(size);
        if next > self.send_buffer_limit {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            return Err(BackpressureError::BufferFull {
                queued: *current,
                requested: size,
                limit: self.send_buffer_limit,
            });
        }
        *current = next;
        Ok(())
    }

    /// Release buffer space after a frame has been written (or discarded).
    pub fn release(&self, size: usize) {
        let mut current = self.current_buffer.lock();
        *current = current.saturating_sub(size);
    }

    /// Number of reservations refused so far.
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    pub fn current_usage(&self) -> usize {
        *self.current_buffer.lock()
    }

    pub fn limit(&self) -> usize {
        self.send_buffer_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_can_send() {
        let handler = BackpressureHandler::new(1000);
        assert!(handler.can_send(500));
        assert!(handler.can_send(1000));
        assert!(!handler.can_send(1500));
    }

    #[test]
    fn test_reserve_release() {
        let handler = BackpressureHandler::new(1000);
        handler.try_reserve(500).unwrap();
        assert_eq!(handler.current_usage(), 500);
        handler.release(500);
        assert_eq!(handler.current_usage(), 0);
    }

    #[test]
    fn test_reserve_over_limit_is_refused() {
        let handler = BackpressureHandler::new(1000);
        handler.try_reserve(600).unwrap();
        assert_eq!(
            handler.try_reserve(600),
            Err(BackpressureError::BufferFull {
                queued: 600,
                requested: 600,
                limit: 1000
            })
        );
        // A refused reservation leaves the budget untouched.
        assert_eq!(handler.current_usage(), 600);
        assert_eq!(handler.rejected_count(), 1);
        handler.try_reserve(400).unwrap();
    }

    #[test]
    fn test_release_saturates() {
        let handler = BackpressureHandler::new(10);
        handler.try_reserve(4).unwrap();
        handler.release(100);
        assert_eq!(handler.current_usage(), 0);
    }

    proptest! {
        #[test]
        fn prop_backpressure_enforcement(
            limit in 1000..10000usize,
            frame_sizes in prop::collection::vec(100..2000usize, 1..50),
        ) {
            let handler = BackpressureHandler::new(limit);
            let mut total_used = 0;

            for size in frame_sizes {
                match handler.try_reserve(size) {
                    Ok(()) => {
                        total_used += size;
                        prop_assert!(total_used <= limit, "reservations must not exceed limit");
                    }
                    Err(BackpressureError::BufferFull { queued, .. }) => {
                        prop_assert_eq!(queued, total_used);
                        prop_assert!(total_used + size > limit);
                    }
                }
            }

            prop_assert_eq!(handler.current_usage(), total_used);
        }
    }
}
