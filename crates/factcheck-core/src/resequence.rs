//! Bounded resequencing buffer.
//!
//! Items carry a contiguous sequence number starting at 1. Items are released
//! strictly in sequence order; a gap is held open until the buffer exceeds its
//! capacity, at which point the lowest held item is force-released and the
//! gap is skipped. A periodic [`Resequencer::flush_stale`] also gives up on
//! gaps whose waiting item has been held past a cutoff. Anything arriving
//! behind the release cursor is late.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

#[derive(Debug, PartialEq)]
pub enum Offer<T> {
    /// Items now released, in sequence order. Empty while a gap is held.
    Ready(Vec<T>),
    /// Sequence already released or duplicated; the item is handed back.
    Late(T),
}

#[derive(Debug)]
pub struct Resequencer<T> {
    next: u64,
    capacity: usize,
    /// Held items with their arrival time.
    pending: BTreeMap<u64, (DateTime<Utc>, T)>,
    skipped: u64,
}

impl<T> Resequencer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 1,
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
            skipped: 0,
        }
    }

    pub fn offer(&mut self, sequence: u64, item: T, arrived_at: DateTime<Utc>) -> Offer<T> {
        if sequence < self.next || self.pending.contains_key(&sequence) {
            return Offer::Late(item);
        }
        self.pending.insert(sequence, (arrived_at, item));

        let mut ready = self.drain_contiguous();
        while self.pending.len() > self.capacity {
            if let Some((seq, (_, item))) = self.pending.pop_first() {
                self.skipped += seq - self.next;
                self.next = seq + 1;
                ready.push(item);
                ready.extend(self.drain_contiguous());
            }
        }
        Offer::Ready(ready)
    }

    /// Give up on gaps whose lowest waiting item arrived at or before
    /// `cutoff`. Younger gaps stay open.
    pub fn flush_stale(&mut self, cutoff: DateTime<Utc>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.get().0 > cutoff {
                break;
            }
            let (seq, (_, item)) = entry.remove_entry();
            self.skipped += seq - self.next;
            self.next = seq + 1;
            out.push(item);
            out.extend(self.drain_contiguous());
        }
        out
    }

    fn drain_contiguous(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some((_, item)) = self.pending.remove(&self.next) {
            out.push(item);
            self.next += 1;
        }
        out
    }

    pub fn held(&self) -> usize {
        self.pending.len()
    }

    /// Sequence numbers given up on because of forced releases or flushes.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn ready<T: std::fmt::Debug>(o: Offer<T>) -> Vec<T> {
        match o {
            Offer::Ready(v) => v,
            Offer::Late(item) => panic!("unexpected late item {item:?}"),
        }
    }

    #[test]
    fn test_in_order_passes_through() {
        let mut r = Resequencer::new(4);
        assert_eq!(ready(r.offer(1, 'a', t(0))), vec!['a']);
        assert_eq!(ready(r.offer(2, 'b', t(0))), vec!['b']);
        assert_eq!(r.held(), 0);
    }

    #[test]
    fn test_gap_is_held_then_filled() {
        let mut r = Resequencer::new(4);
        assert!(ready(r.offer(2, 'b', t(0))).is_empty());
        assert!(ready(r.offer(3, 'c', t(0))).is_empty());
        assert_eq!(ready(r.offer(1, 'a', t(0))), vec!['a', 'b', 'c']);
        assert_eq!(r.next_expected(), 4);
    }

    #[test]
    fn test_overflow_forces_release_and_late_arrival_is_rejected() {
        let mut r = Resequencer::new(2);
        assert!(ready(r.offer(2, 'b', t(0))).is_empty());
        assert!(ready(r.offer(3, 'c', t(0))).is_empty());
        assert_eq!(ready(r.offer(4, 'd', t(0))), vec!['b', 'c', 'd']);
        assert_eq!(r.skipped(), 1);
        assert_eq!(r.offer(1, 'a', t(0)), Offer::Late('a'));
    }

    #[test]
    fn test_duplicate_is_late() {
        let mut r = Resequencer::new(4);
        ready(r.offer(1, 'a', t(0)));
        assert_eq!(r.offer(1, 'x', t(0)), Offer::Late('x'));
        ready(r.offer(3, 'c', t(0)));
        assert_eq!(r.offer(3, 'y', t(0)), Offer::Late('y'));
    }

    #[test]
    fn test_flush_stale_skips_only_old_gaps() {
        let mut r = Resequencer::new(10);
        ready(r.offer(3, 'c', t(0)));
        ready(r.offer(4, 'd', t(50)));
        ready(r.offer(6, 'f', t(60)));

        assert!(r.flush_stale(t(-1)).is_empty());
        assert_eq!(r.held(), 3);

        // 'c' waited long enough; 'd' follows it without a gap
        assert_eq!(r.flush_stale(t(30)), vec!['c', 'd']);
        assert_eq!(r.skipped(), 2);
        assert_eq!(r.next_expected(), 5);

        assert_eq!(r.flush_stale(t(60)), vec!['f']);
        assert_eq!(r.skipped(), 3);
        assert_eq!(r.next_expected(), 7);
    }

    fn incremental_mean(scores: &[f64]) -> f64 {
        let mut mean = 0.0;
        for (i, s) in scores.iter().enumerate() {
            mean += (s - mean) / (i as f64 + 1.0);
        }
        mean
    }

    proptest! {
        #[test]
        fn prop_permutation_within_capacity_is_deterministic(
            (scores, order) in prop::collection::vec(-1.0f64..1.0, 1..50)
                .prop_flat_map(|scores| {
                    let order: Vec<usize> = (0..scores.len()).collect();
                    (Just(scores), Just(order).prop_shuffle())
                })
        ) {
            let mut r = Resequencer::new(50);
            let mut released = Vec::new();
            for i in order {
                match r.offer(i as u64 + 1, scores[i], t(0)) {
                    Offer::Ready(v) => released.extend(v),
                    Offer::Late(_) => prop_assert!(false, "nothing should be late"),
                }
            }
            prop_assert_eq!(&released, &scores);
            prop_assert_eq!(
                incremental_mean(&released).to_bits(),
                incremental_mean(&scores).to_bits()
            );
        }
    }
}
