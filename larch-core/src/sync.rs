//! Cross-thread result handoff.
//!
//! Host integrations that complete asynchronously (a UI callback, a
//! worker thread) hand their value back through a
//! [`CallbackResultHolder`]: the producing side sets the result exactly
//! once, the consuming side blocks until it arrives.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A set-once slot shared between a producer and a waiting consumer.
///
/// Clones share the same slot. The first [`set_result`] wins; any
/// later call is rejected so a double-firing callback cannot
/// overwrite the value a consumer may already have observed.
///
/// [`set_result`]: CallbackResultHolder::set_result
#[derive(Debug, Clone)]
pub struct CallbackResultHolder<T: Clone> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Clone> Default for CallbackResultHolder<T> {
    fn default() -> CallbackResultHolder<T> {
        CallbackResultHolder::new()
    }
}

impl<T: Clone> CallbackResultHolder<T> {
    pub fn new() -> CallbackResultHolder<T> {
        CallbackResultHolder {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Store the result. Returns `false` when a value was already set,
    /// leaving the first value in place.
    pub fn set_result(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// The current value, if one has been set.
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Block until a result arrives and return a copy of it.
    pub fn wait_result(&self) -> T {
        loop {
            if let Some(value) = self.peek() {
                return value;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_wins() {
        let holder = CallbackResultHolder::new();
        assert!(holder.set_result(1));
        assert!(!holder.set_result(2));
        assert_eq!(holder.peek(), Some(1));
    }

    #[test]
    fn wait_blocks_until_a_thread_delivers() {
        let holder = CallbackResultHolder::new();
        let producer = holder.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            assert!(producer.set_result(String::from("done")));
        });
        assert_eq!(holder.wait_result(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn every_waiter_observes_the_same_outcome() {
        let holder: CallbackResultHolder<i32> = CallbackResultHolder::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let shared = holder.clone();
                thread::spawn(move || shared.wait_result())
            })
            .collect();
        thread::sleep(Duration::from_millis(5));
        assert!(holder.set_result(42));
        assert!(!holder.set_result(7));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 42);
        }
    }

    #[test]
    fn clones_share_one_slot() {
        let a: CallbackResultHolder<i32> = CallbackResultHolder::new();
        let b = a.clone();
        assert!(b.set_result(7));
        assert_eq!(a.peek(), Some(7));
        assert!(!a.set_result(8));
    }
}
