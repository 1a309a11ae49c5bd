#![forbid(unsafe_code)]

use parking_lot::{Condvar, Mutex};

/// Counting semaphore used to hand work to pre-read workers.
#[derive(Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Adds one permit and wakes a single waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }
}

/// One-shot completion signal: `post` once, any number of `wait`ers return.
#[derive(Default)]
pub struct Signal {
    posted: Mutex<bool>,
    done: Condvar,
}

impl Signal {
    /// Creates an unposted signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal complete and wakes every waiter.
    pub fn post(&self) {
        let mut posted = self.posted.lock();
        *posted = true;
        self.done.notify_all();
    }

    /// Blocks until the signal has been posted.
    pub fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.done.wait(&mut posted);
        }
    }
}
