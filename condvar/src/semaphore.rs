// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Condvar, Mutex};

/// A counting semaphore. Posts are never lost: a post that arrives before
/// the matching wait leaves the count raised, and the wait returns
/// immediately.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Starts with a count of zero; the first wait blocks until a post.
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self.available.wait(count).expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count += 1;
        self.available.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_post_before_wait_is_not_lost() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = sem.clone();

        let waiter = std::thread::spawn(move || {
            sem2.wait();
            true
        });

        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_counts_accumulate() {
        let sem = Semaphore::new();
        for _ in 0..5 {
            sem.post();
        }
        for _ in 0..5 {
            sem.wait();
        }
    }
}
