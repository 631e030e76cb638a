//! Timer ordering.
//!
//! Timers are kept in a `BTreeSet` ordered by `(deadline, insertion sequence,
//! id)` rather than a binary heap, so removing an arbitrary timer (`stop`,
//! re-arming on `again`) is an `O(log n)` tree operation instead of the
//! linear scan a `BinaryHeap` would force. The insertion sequence breaks ties
//! between timers that share a deadline in FIFO order, matching the
//! teacher's `TimerPool` queue discipline (`event/mod.rs` /
//! `timer/mod.rs` in the crate this one is grounded on) even though the
//! underlying data structure differs.
//!
//! `now` is sampled once per loop iteration by the caller and passed in; the
//! heap itself never reads the clock, which is what keeps a timer callback
//! that starts another short timer from starving the rest of the iteration
//! (`SPEC_FULL.md` §4.2, "now is sampled once per iteration").

use std::collections::{BTreeMap, BTreeSet};

use crate::handle::HandleId;

/// Configuration for a timer at start time.
#[derive(Copy, Clone, Debug)]
pub struct TimerOptions {
    /// Milliseconds from `now` until the first fire.
    pub timeout: u64,
    /// Milliseconds between subsequent fires. Zero means one-shot.
    pub repeat: u64,
}

impl Default for TimerOptions {
    fn default() -> Self {
        TimerOptions {
            timeout: 0,
            repeat: 0,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Entry {
    deadline: u64,
    repeat: u64,
    seq: u64,
}

/// The set of armed timers belonging to one loop.
#[derive(Default)]
pub(crate) struct TimerHeap {
    entries: BTreeMap<HandleId, Entry>,
    order: BTreeSet<(u64, u64, HandleId)>,
    seq: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        TimerHeap {
            entries: BTreeMap::new(),
            order: BTreeSet::new(),
            seq: 0,
        }
    }

    pub(crate) fn start(&mut self, id: HandleId, now: u64, opts: TimerOptions) {
        self.remove(id);
        let seq = self.next_seq();
        let deadline = now.saturating_add(opts.timeout);
        self.entries.insert(
            id,
            Entry {
                deadline,
                repeat: opts.repeat,
                seq,
            },
        );
        self.order.insert((deadline, seq, id));
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> bool {
        if let Some(entry) = self.entries.remove(&id) {
            self.order.remove(&(entry.deadline, entry.seq, id));
            true
        } else {
            false
        }
    }

    pub(crate) fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Re-arm a repeating timer to fire `repeat` milliseconds from now,
    /// ignoring how late the current callback ran.
    pub(crate) fn again(&mut self, id: HandleId, now: u64) -> bool {
        let Some(entry) = self.entries.get(&id).copied() else {
            return false;
        };
        if entry.repeat == 0 {
            return false;
        }
        self.order.remove(&(entry.deadline, entry.seq, id));
        let seq = self.next_seq();
        let deadline = now.saturating_add(entry.repeat);
        self.order.insert((deadline, seq, id));
        self.entries.insert(
            id,
            Entry {
                deadline,
                repeat: entry.repeat,
                seq,
            },
        );
        true
    }

    /// Milliseconds until the next timer fires, `0` if one is already due,
    /// `None` if no timers are armed.
    pub(crate) fn timeout(&self, now: u64) -> Option<u64> {
        self.order
            .iter()
            .next()
            .map(|(deadline, _, _)| deadline.saturating_sub(now))
    }

    /// Drain every timer due at or before `now`, in fire order. Repeating
    /// timers are re-armed to `max(now, prev_deadline + period)`, but the
    /// rearmed entry is only inserted back into `order` once the whole scan
    /// is done — otherwise a timer so far behind that its rearmed deadline
    /// still lands at or before `now` would get picked right back up by the
    /// same pass and fire twice in one `expire` call.
    pub(crate) fn expire(&mut self, now: u64) -> Vec<HandleId> {
        let mut due = Vec::new();
        let mut rearm = Vec::new();
        loop {
            let Some(&(deadline, seq, id)) = self.order.iter().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.order.remove(&(deadline, seq, id));
            due.push(id);

            let entry = self.entries.get(&id).copied().expect("entry/order desync");
            if entry.repeat > 0 {
                let next_deadline = std::cmp::max(now, entry.deadline + entry.repeat);
                rearm.push((id, next_deadline, entry.repeat));
            } else {
                self.entries.remove(&id);
            }
        }
        for (id, deadline, repeat) in rearm {
            let seq = self.next_seq();
            self.order.insert((deadline, seq, id));
            self.entries.insert(id, Entry { deadline, repeat, seq });
        }
        due
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> HandleId {
        HandleId(n)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        heap.start(id(1), 0, TimerOptions { timeout: 50, repeat: 0 });
        heap.start(id(2), 0, TimerOptions { timeout: 10, repeat: 0 });
        heap.start(id(3), 0, TimerOptions { timeout: 30, repeat: 0 });

        assert_eq!(heap.expire(100), vec![id(2), id(3), id(1)]);
        assert!(heap.timeout(100).is_none());
    }

    #[test]
    fn ties_break_fifo() {
        let mut heap = TimerHeap::new();
        heap.start(id(1), 0, TimerOptions { timeout: 10, repeat: 0 });
        heap.start(id(2), 0, TimerOptions { timeout: 10, repeat: 0 });

        assert_eq!(heap.expire(10), vec![id(1), id(2)]);
    }

    #[test]
    fn repeat_rearms_without_pileup() {
        let mut heap = TimerHeap::new();
        heap.start(id(1), 0, TimerOptions { timeout: 10, repeat: 10 });

        // Loop iteration didn't get back to this timer until well after its
        // deadline; the next fire should be relative to `now`, not stacked
        // deadlines from the missed period.
        assert_eq!(heap.expire(100), vec![id(1)]);
        assert_eq!(heap.timeout(100), Some(10));
    }

    #[test]
    fn repeat_catching_up_past_a_full_period_fires_once() {
        let mut heap = TimerHeap::new();
        heap.start(id(1), 0, TimerOptions { timeout: 10, repeat: 10 });

        // `now` has jumped 90ms past the deadline, more than a full period,
        // so the naive rearm (`prev_deadline + period` = 20) would still be
        // `<= now` and risk firing again within this same call.
        assert_eq!(heap.expire(100), vec![id(1)]);
        assert_eq!(heap.timeout(100), Some(0));
    }

    #[test]
    fn stop_removes_pending_timer() {
        let mut heap = TimerHeap::new();
        heap.start(id(1), 0, TimerOptions { timeout: 10, repeat: 0 });
        assert!(heap.remove(id(1)));
        assert_eq!(heap.expire(100), Vec::<HandleId>::new());
    }

    #[test]
    fn again_reschedules_from_now() {
        let mut heap = TimerHeap::new();
        heap.start(id(1), 0, TimerOptions { timeout: 10, repeat: 20 });
        assert!(heap.again(id(1), 5));
        assert_eq!(heap.timeout(5), Some(20));
    }
}
