//! The engine's single "what fires next" timer queue.
//!
//! Entries are lazily invalidated: re-arming or cancelling a timer bumps its generation, and
//! stale heap entries are skipped when they surface. Firing is therefore idempotent with respect
//! to state.

use crate::pn::Space;
use hashbrown::HashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

pub type ConnId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Idle(ConnId),
    Closing(ConnId),
    Ack(ConnId, Space),
    Migration(ConnId),
    LossDetection(ConnId),
    TxWakeup(ConnId),
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    at: Instant,
    gen: u64,
    kind: TimerKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the earliest deadline on top
        other.at.cmp(&self.at)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    gens: HashMap<TimerKind, u64>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            gens: HashMap::new(),
        }
    }

    /// Arm (or re-arm) a timer. A later `set` supersedes any earlier deadline for the kind.
    pub fn set(&mut self, kind: TimerKind, at: Instant) {
        let gen = self.gens.entry(kind).or_insert(0);
        *gen += 1;
        self.heap.push(Entry { at, gen: *gen, kind });
    }

    /// Cancel a timer if armed.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(gen) = self.gens.get_mut(&kind) {
            *gen += 1;
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        let gen = match self.gens.get(&kind) {
            Some(g) => *g,
            None => return false,
        };
        self.heap.iter().any(|e| e.kind == kind && e.gen == gen)
    }

    /// Earliest live deadline, skimming stale entries off the top.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let stale = match self.heap.peek() {
                Some(e) => self.gens.get(&e.kind) != Some(&e.gen),
                None => return None,
            };
            if stale {
                self.heap.pop();
            } else {
                return self.heap.peek().map(|e| e.at);
            }
        }
    }

    /// Pop one expired timer, if any. Firing consumes the timer.
    pub fn expire_one(&mut self, now: Instant) -> Option<TimerKind> {
        loop {
            {
                let e = self.heap.peek()?;
                if e.at > now {
                    return None;
                }
            }
            let e = self.heap.pop()?;
            if self.gens.get(&e.kind) == Some(&e.gen) {
                self.cancel(e.kind);
                return Some(e.kind);
            }
        }
    }

    /// Drop every timer belonging to a connection. Used when the connection is freed.
    pub fn cancel_conn(&mut self, conn: ConnId) {
        let kinds: Vec<TimerKind> = self
            .gens
            .keys()
            .filter(|k| match **k {
                TimerKind::Idle(c)
                | TimerKind::Closing(c)
                | TimerKind::Ack(c, _)
                | TimerKind::Migration(c)
                | TimerKind::LossDetection(c)
                | TimerKind::TxWakeup(c) => c == conn,
            })
            .copied()
            .collect();
        for kind in kinds {
            self.cancel(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut tq = TimerQueue::new();
        let now = Instant::now();

        tq.set(TimerKind::Idle(1), now + Duration::from_millis(20));
        tq.set(TimerKind::Closing(1), now + Duration::from_millis(10));

        let later = now + Duration::from_millis(30);
        assert_eq!(tq.expire_one(later), Some(TimerKind::Closing(1)));
        assert_eq!(tq.expire_one(later), Some(TimerKind::Idle(1)));
        assert_eq!(tq.expire_one(later), None);
    }

    #[test]
    fn test_rearm_supersedes() {
        let mut tq = TimerQueue::new();
        let now = Instant::now();

        tq.set(TimerKind::Idle(1), now + Duration::from_millis(10));
        tq.set(TimerKind::Idle(1), now + Duration::from_millis(50));

        // only the re-armed deadline is live
        assert_eq!(tq.expire_one(now + Duration::from_millis(20)), None);
        assert_eq!(
            tq.expire_one(now + Duration::from_millis(60)),
            Some(TimerKind::Idle(1))
        );
    }

    #[test]
    fn test_cancel() {
        let mut tq = TimerQueue::new();
        let now = Instant::now();

        tq.set(TimerKind::Migration(2), now);
        assert!(tq.is_armed(TimerKind::Migration(2)));

        tq.cancel(TimerKind::Migration(2));
        assert!(!tq.is_armed(TimerKind::Migration(2)));
        assert_eq!(tq.expire_one(now + Duration::from_millis(1)), None);
        assert_eq!(tq.next_deadline(), None);
    }

    #[test]
    fn test_next_deadline_skips_stale() {
        let mut tq = TimerQueue::new();
        let now = Instant::now();

        tq.set(TimerKind::Idle(1), now + Duration::from_millis(5));
        tq.set(TimerKind::Ack(1, Space::Data), now + Duration::from_millis(15));
        tq.cancel(TimerKind::Idle(1));

        assert_eq!(tq.next_deadline(), Some(now + Duration::from_millis(15)));
    }

    #[test]
    fn test_cancel_conn_drops_all_kinds() {
        let mut tq = TimerQueue::new();
        let now = Instant::now();

        tq.set(TimerKind::Idle(3), now);
        tq.set(TimerKind::Ack(3, Space::Init), now);
        tq.set(TimerKind::Idle(4), now);

        tq.cancel_conn(3);

        let later = now + Duration::from_millis(1);
        assert_eq!(tq.expire_one(later), Some(TimerKind::Idle(4)));
        assert_eq!(tq.expire_one(later), None);
    }
}
