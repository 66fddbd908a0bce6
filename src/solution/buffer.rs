use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use hifitime::Epoch;

use crate::solution::Solution;

/// Bounded buffer of the latest [Solution]s.
///
/// Single writer (the processing thread), any number of readers.
/// Readers copy out of a short critical section, they never hold
/// references to buffered solutions.
#[derive(Debug)]
pub struct SolutionBuffer {
    capacity: usize,
    inner: Mutex<VecDeque<Solution>>,
}

impl SolutionBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Solution>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a new [Solution], evicting the oldest one when full.
    pub fn publish(&self, solution: Solution) {
        let mut inner = self.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(solution);
    }

    /// Latest [Solution]
    pub fn read_last(&self) -> Option<Solution> {
        self.lock().back().copied()
    }

    /// All buffered [Solution]s strictly after this [Epoch], oldest first.
    /// Iterates over a snapshot: later publications are not visible.
    pub fn read_since(&self, t: Epoch) -> std::vec::IntoIter<Solution> {
        let snapshot = self
            .lock()
            .iter()
            .filter(|solution| solution.epoch > t)
            .copied()
            .collect::<Vec<_>>();

        snapshot.into_iter()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{solution::Quality, utils::gpst_epoch};
    use std::sync::Arc;

    fn solution(i: usize) -> Solution {
        Solution {
            epoch: gpst_epoch(2300, i as f64),
            position_ecef_m: [i as f64, 0.0, 0.0],
            quality: Quality::Single,
            degraded: false,
            variance_m2: [1.0; 3],
            satellites: 8,
            age_s: 0.0,
        }
    }

    #[test]
    fn eviction_and_read_since() {
        let buffer = SolutionBuffer::new(10);
        assert!(buffer.read_last().is_none());

        for i in 1..=15 {
            buffer.publish(solution(i));
        }

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.read_last(), Some(solution(15)));

        let since = buffer.read_since(gpst_epoch(2300, 6.0)).collect::<Vec<_>>();
        assert_eq!(since.len(), 9);
        assert_eq!(since[0], solution(7));
        assert_eq!(since[8], solution(15));

        // restartable
        assert_eq!(buffer.read_since(gpst_epoch(2300, 6.0)).count(), 9);

        // evicted solutions are gone
        assert_eq!(buffer.read_since(gpst_epoch(2300, 0.0)).count(), 10);
    }

    #[test]
    fn snapshot_iteration() {
        let buffer = SolutionBuffer::new(4);
        buffer.publish(solution(1));

        let iter = buffer.read_since(gpst_epoch(2300, 0.0));
        buffer.publish(solution(2));
        assert_eq!(iter.count(), 1);
    }

    #[test]
    fn concurrent_readers() {
        let buffer = Arc::new(SolutionBuffer::new(8));

        let readers = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let mut last_seen = 0.0;
                    for _ in 0..1000 {
                        if let Some(last) = buffer.read_last() {
                            // never torn: epoch and content published together
                            let (_, tow) = crate::utils::gpst_week_tow(last.epoch);
                            assert_eq!(tow, last.position_ecef_m[0]);
                            assert!(tow >= last_seen);
                            last_seen = tow;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for i in 1..=500 {
            buffer.publish(solution(i));
        }

        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(buffer.read_last(), Some(solution(500)));
    }
}
