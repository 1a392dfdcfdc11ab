//! Host events.
//!
//! An event counts how many times it was recorded and how many of those
//! records a stream has reached. Waiting on generation `g` blocks until the
//! `g`-th record has executed.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Generations {
    recorded: u64,
    completed: u64,
}

/// Shared state of one event.
#[derive(Debug, Default)]
pub(crate) struct EventState {
    generations: Mutex<Generations>,
    reached: Condvar,
}

impl EventState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate the generation of a new record.
    pub(crate) fn next_record(&self) -> u64 {
        let mut g = self.generations.lock();
        g.recorded += 1;
        g.recorded
    }

    /// Latest allocated record, 0 if never recorded.
    pub(crate) fn latest_record(&self) -> u64 {
        self.generations.lock().recorded
    }

    /// Mark `generation` as reached by its stream.
    pub(crate) fn complete(&self, generation: u64) {
        let mut g = self.generations.lock();
        if generation > g.completed {
            g.completed = generation;
        }
        self.reached.notify_all();
    }

    /// Block until `generation` has been reached.
    pub(crate) fn wait_for(&self, generation: u64) {
        let mut g = self.generations.lock();
        while g.completed < generation {
            self.reached.wait(&mut g);
        }
    }

    #[cfg(test)]
    pub(crate) fn completed(&self) -> u64 {
        self.generations.lock().completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_generations() {
        let event = EventState::new();
        assert_eq!(event.latest_record(), 0);
        assert_eq!(event.next_record(), 1);
        assert_eq!(event.next_record(), 2);
        assert_eq!(event.latest_record(), 2);

        event.complete(2);
        event.complete(1);
        assert_eq!(event.completed(), 2);
    }

    #[test]
    fn test_wait_for_blocks_until_complete() {
        let event = Arc::new(EventState::new());
        let generation = event.next_record();

        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_for(generation))
        };

        event.complete(generation);
        waiter.join().unwrap();
    }
}
