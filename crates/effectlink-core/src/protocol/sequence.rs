//! Thread-safe request id allocation for the requester.
//!
//! # Why ids start at 1
//!
//! Every packet that is not an `EFFECT_RESULT` carries id 0 (keep-alive,
//! login, disconnect).  Handing out 0 to an effect request would make its
//! replies indistinguishable from those packets in logs, so the counter
//! starts at 1 and skips 0 when it wraps.
//!
//! # Thread safety
//!
//! The counter is a single `AtomicU32`; many tasks may call [`next`] at once
//! without a lock and never receive the same value twice (until the 32-bit
//! space wraps, which takes four billion requests on one connection).
//!
//! [`next`]: RequestIdCounter::next

use std::sync::atomic::{AtomicU32, Ordering};

/// A lock-free, monotonically increasing allocator of request ids.
///
/// # Examples
///
/// ```rust
/// use effectlink_core::protocol::RequestIdCounter;
///
/// let ids = RequestIdCounter::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct RequestIdCounter {
    inner: AtomicU32,
}

impl RequestIdCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU32::new(1),
        }
    }

    /// Returns the next id, never 0.
    ///
    /// `Relaxed` is enough: ids only need to be unique, they do not publish
    /// any other memory.
    pub fn next(&self) -> u32 {
        loop {
            let id = self.inner.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Returns the id the next call to [`next`](Self::next) would try, for diagnostics.
    pub fn peek(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for RequestIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_one() {
        // Arrange
        let counter = RequestIdCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 1);
    }

    #[test]
    fn test_counter_skips_zero_on_wrap() {
        // Arrange – one step before overflow
        let counter = RequestIdCounter {
            inner: AtomicU32::new(u32::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap, u32::MAX);
        assert_eq!(after_wrap, 1, "0 is reserved for non-effect packets");
    }

    #[test]
    fn test_counter_is_unique_across_threads() {
        // Arrange
        let counter = Arc::new(RequestIdCounter::new());

        // Act
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..1000).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                // Assert
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }

        assert_eq!(seen.len(), 8000);
        assert_eq!(counter.peek(), 8001);
    }
}
