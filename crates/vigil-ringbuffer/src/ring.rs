//! Byte-weighted FIFO storage.

use std::collections::VecDeque;

/// Result of [`WeightedRing::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The entry was stored after evicting `evicted` older entries.
    Stored {
        /// Number of entries removed from the front.
        evicted: usize,
    },
    /// The entry alone exceeds the budget and was not stored.
    Rejected,
}

/// FIFO of entries with a byte weight each, bounded by a total weight.
///
/// `weight_bytes() <= max_weight_bytes()` holds after every push. Entries are
/// never modified once stored; eviction only removes from the front.
#[derive(Debug)]
pub struct WeightedRing<T> {
    entries: VecDeque<(usize, T)>,
    weight_bytes: usize,
    max_weight_bytes: usize,
}

impl<T> WeightedRing<T> {
    /// Create an empty ring with the given budget.
    pub fn new(max_weight_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            weight_bytes: 0,
            max_weight_bytes,
        }
    }

    /// Append an entry, evicting the oldest ones until it fits.
    ///
    /// An entry heavier than the whole budget is rejected without evicting
    /// anything.
    pub fn push(&mut self, weight: usize, value: T) -> PushOutcome {
        if weight > self.max_weight_bytes {
            return PushOutcome::Rejected;
        }
        let mut evicted = 0;
        while self.weight_bytes + weight > self.max_weight_bytes {
            match self.entries.pop_front() {
                Some((w, _)) => {
                    self.weight_bytes -= w;
                    evicted += 1;
                }
                None => break,
            }
        }
        self.entries.push_back((weight, value));
        self.weight_bytes += weight;
        PushOutcome::Stored { evicted }
    }

    /// Remove and return the oldest entry.
    pub fn pop_front(&mut self) -> Option<T> {
        let (w, value) = self.entries.pop_front()?;
        self.weight_bytes -= w;
        Some(value)
    }

    /// Entry at `index`, oldest first.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|(_, v)| v)
    }

    /// Iterate entries from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the weights of all stored entries.
    pub fn weight_bytes(&self) -> usize {
        self.weight_bytes
    }

    pub fn max_weight_bytes(&self) -> usize {
        self.max_weight_bytes
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.weight_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded_weight(ring: &WeightedRing<usize>) -> usize {
        // entries store their own weight as the value
        ring.iter().sum()
    }

    #[test]
    fn test_weight_invariant_holds_after_every_push() {
        let mut ring = WeightedRing::new(100);
        let weights = [30, 30, 30, 5, 60, 1, 99, 100, 7, 0, 42, 42, 42];
        for w in weights {
            ring.push(w, w);
            assert!(ring.weight_bytes() <= ring.max_weight_bytes());
            assert_eq!(ring.weight_bytes(), recorded_weight(&ring));
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut ring = WeightedRing::new(10);
        assert_eq!(ring.push(4, 4), PushOutcome::Stored { evicted: 0 });
        assert_eq!(ring.push(4, 4), PushOutcome::Stored { evicted: 0 });
        ring.push(2, 2);
        assert_eq!(ring.push(3, 3), PushOutcome::Stored { evicted: 1 });
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![4, 2, 3]);
        assert_eq!(ring.weight_bytes(), 9);
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let mut ring = WeightedRing::new(10);
        ring.push(5, 5);
        assert_eq!(ring.push(11, 11), PushOutcome::Rejected);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.weight_bytes(), 5);

        // exactly the budget fits after evicting everything
        assert_eq!(ring.push(10, 10), PushOutcome::Stored { evicted: 1 });
        assert_eq!(ring.weight_bytes(), 10);
    }

    #[test]
    fn test_pop_and_clear() {
        let mut ring = WeightedRing::new(10);
        ring.push(3, 3);
        ring.push(4, 4);
        assert_eq!(ring.pop_front(), Some(3));
        assert_eq!(ring.weight_bytes(), 4);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.weight_bytes(), 0);
        assert_eq!(ring.pop_front(), None);
    }
}
