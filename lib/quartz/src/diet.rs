//! Discrete interval set ("diet"): a sparse set of 62-bit numbers stored as disjoint inclusive
//! ranges. Backs ACK generation, duplicate detection and the closed-stream record.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct Diet {
    // lo -> hi, inclusive, disjoint and non-adjacent
    ivals: BTreeMap<u64, u64>,
}

impl Diet {
    #[inline]
    pub fn new() -> Diet {
        Diet {
            ivals: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ivals.is_empty()
    }

    /// Number of disjoint intervals.
    #[inline]
    pub fn cnt(&self) -> usize {
        self.ivals.len()
    }

    pub fn contains(&self, n: u64) -> bool {
        match self.ivals.range(..=n).next_back() {
            Some((_, &hi)) => n <= hi,
            None => false,
        }
    }

    /// Insert a single number, merging with adjacent or overlapping intervals.
    pub fn insert(&mut self, n: u64) {
        if self.contains(n) {
            return;
        }

        let mut lo = n;
        let mut hi = n;

        // merge with the interval ending right before n
        if let Some((&plo, &phi)) = self.ivals.range(..n).next_back() {
            if phi + 1 == n {
                lo = plo;
                self.ivals.remove(&plo);
            }
        }

        // merge with the interval starting right after n
        if let Some((&nlo, &nhi)) = self.ivals.range(n + 1..).next() {
            if n + 1 == nlo {
                hi = nhi;
                self.ivals.remove(&nlo);
            }
        }

        self.ivals.insert(lo, hi);
    }

    /// Remove a single number, splitting its interval if needed.
    pub fn remove(&mut self, n: u64) {
        let (lo, hi) = match self.ivals.range(..=n).next_back() {
            Some((&lo, &hi)) if n <= hi => (lo, hi),
            _ => return,
        };

        self.ivals.remove(&lo);
        if lo < n {
            self.ivals.insert(lo, n - 1);
        }
        if n < hi {
            self.ivals.insert(n + 1, hi);
        }
    }

    #[inline]
    pub fn min(&self) -> Option<u64> {
        self.ivals.iter().next().map(|(&lo, _)| lo)
    }

    #[inline]
    pub fn max(&self) -> Option<u64> {
        self.ivals.iter().next_back().map(|(_, &hi)| hi)
    }

    /// Iterate intervals as `(lo, hi)` pairs in ascending order.
    #[inline]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, u64)> + '_ {
        self.ivals.iter().map(|(&lo, &hi)| (lo, hi))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.ivals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_adjacent() {
        let mut d = Diet::new();
        d.insert(1);
        d.insert(3);
        assert_eq!(d.cnt(), 2);

        d.insert(2);
        assert_eq!(d.cnt(), 1);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![(1, 3)]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut d = Diet::new();
        d.insert(5);
        d.insert(5);
        assert_eq!(d.cnt(), 1);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![(5, 5)]);
    }

    #[test]
    fn test_contains() {
        let mut d = Diet::new();
        for n in &[1u64, 2, 3, 10, 11, 20] {
            d.insert(*n);
        }
        assert!(d.contains(2));
        assert!(d.contains(11));
        assert!(d.contains(20));
        assert!(!d.contains(4));
        assert!(!d.contains(0));
        assert!(!d.contains(21));
    }

    #[test]
    fn test_remove_splits() {
        let mut d = Diet::new();
        for n in 1..=5 {
            d.insert(n);
        }
        d.remove(3);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![(1, 2), (4, 5)]);

        d.remove(1);
        d.remove(5);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![(2, 2), (4, 4)]);

        d.remove(7); // not present, no-op
        assert_eq!(d.cnt(), 2);
    }

    #[test]
    fn test_min_max() {
        let mut d = Diet::new();
        assert_eq!(d.min(), None);
        assert_eq!(d.max(), None);

        d.insert(7);
        d.insert(3);
        d.insert(12);
        assert_eq!(d.min(), Some(3));
        assert_eq!(d.max(), Some(12));
    }

    #[test]
    fn test_randomized_against_reference() {
        use std::collections::BTreeSet;

        let mut d = Diet::new();
        let mut reference = BTreeSet::new();

        for _ in 0..2000 {
            let n = u64::from(rand::random::<u8>());
            if rand::random::<bool>() {
                d.insert(n);
                reference.insert(n);
            } else {
                d.remove(n);
                reference.remove(&n);
            }
        }

        for n in 0u64..=255 {
            assert_eq!(d.contains(n), reference.contains(&n), "mismatch at {}", n);
        }
    }
}
