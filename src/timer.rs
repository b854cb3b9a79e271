//! Deadline bookkeeping for timed operations and scheduled tasks.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::device::DevId;

/// What to do when an entry expires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TimerTag {
    /// A read deadline armed by `timed_read`; expiry halts the device.
    ReadDeadline(DevId),
    /// A write (or connect) deadline; expiry halts the device.
    WriteDeadline(DevId),
    /// A scheduled reactor task; the payload indexes the task table.
    Task(u32),
}

/// Identifies one armed entry. Stale ids (cancelled, fired, or re-armed
/// slots) are rejected by every operation, which is what makes
/// cancel-and-reinsert atomic with respect to expiry: an entry can never
/// fire twice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerId {
    idx: u32,
    seq: u64,
}

#[derive(Copy, Clone, PartialEq, Eq)]
struct HeapNode {
    at: Instant,
    // Global arming order; breaks deadline ties and pairs a heap node with
    // the entry incarnation it was pushed for.
    seq: u64,
    idx: u32,
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    seq: u64,
    armed: bool,
    at: Instant,
    tag: TimerTag,
}

/// Min-heap of absolute deadlines with O(log n) arming and cancellation.
///
/// Cancellation leaves the heap node in place and invalidates the entry; the
/// node is discarded lazily when it surfaces. Entry slots are recycled
/// through a free list, with `seq` telling incarnations apart.
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<HeapNode>>,
    entries: Vec<Entry>,
    free: Vec<u32>,
    next_seq: u64,
    armed: usize,
}

impl TimerHeap {
    pub(crate) fn new() -> TimerHeap {
        TimerHeap {
            heap: BinaryHeap::new(),
            entries: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
            armed: 0,
        }
    }

    pub(crate) fn insert(&mut self, at: Instant, tag: TimerTag) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let idx = match self.free.pop() {
            Some(idx) => {
                self.entries[idx as usize] = Entry { seq, armed: true, at, tag };
                idx
            }
            None => {
                self.entries.push(Entry { seq, armed: true, at, tag });
                (self.entries.len() - 1) as u32
            }
        };

        self.heap.push(Reverse(HeapNode { at, seq, idx }));
        self.armed += 1;
        TimerId { idx, seq }
    }

    /// Disarms `id`, returning its tag if it was still armed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> Option<TimerTag> {
        match self.entries.get_mut(id.idx as usize) {
            Some(entry) if entry.seq == id.seq && entry.armed => {
                entry.armed = false;
                self.free.push(id.idx);
                self.armed -= 1;
                Some(entry.tag)
            }
            _ => None,
        }
    }

    /// Earliest armed deadline, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(node)) = self.heap.peek().copied() {
            if self.node_is_live(&node) {
                return Some(node.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Drains every entry due at `now` into `out`, earliest first, ties in
    /// arming order. Entries armed while the caller processes `out` are not
    /// observed until the next drain.
    pub(crate) fn pop_expired(&mut self, now: Instant, out: &mut Vec<TimerTag>) {
        while let Some(Reverse(node)) = self.heap.peek().copied() {
            if !self.node_is_live(&node) {
                self.heap.pop();
                continue;
            }
            if node.at > now {
                break;
            }
            self.heap.pop();
            let entry = &mut self.entries[node.idx as usize];
            entry.armed = false;
            self.free.push(node.idx);
            self.armed -= 1;
            out.push(entry.tag);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.armed == 0
    }

    fn node_is_live(&self, node: &HeapNode) -> bool {
        self.entries
            .get(node.idx as usize)
            .map_or(false, |e| e.seq == node.seq && e.armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dev(n: u32) -> TimerTag {
        TimerTag::Task(n)
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        heap.insert(base + Duration::from_millis(30), dev(3));
        heap.insert(base + Duration::from_millis(10), dev(1));
        heap.insert(base + Duration::from_millis(20), dev(2));

        let mut out = Vec::new();
        heap.pop_expired(base + Duration::from_millis(25), &mut out);
        assert_eq!(out, vec![dev(1), dev(2)]);

        out.clear();
        heap.pop_expired(base + Duration::from_millis(35), &mut out);
        assert_eq!(out, vec![dev(3)]);
        assert!(heap.is_empty());
    }

    #[test]
    fn ties_break_by_arming_order() {
        let mut heap = TimerHeap::new();
        let at = Instant::now();

        heap.insert(at, dev(1));
        heap.insert(at, dev(2));
        heap.insert(at, dev(3));

        let mut out = Vec::new();
        heap.pop_expired(at, &mut out);
        assert_eq!(out, vec![dev(1), dev(2), dev(3)]);
    }

    #[test]
    fn cancelled_entry_never_fires() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let id = heap.insert(base, dev(1));
        heap.insert(base, dev(2));
        assert_eq!(heap.cancel(id), Some(dev(1)));
        assert_eq!(heap.cancel(id), None);

        let mut out = Vec::new();
        heap.pop_expired(base + Duration::from_millis(1), &mut out);
        assert_eq!(out, vec![dev(2)]);
    }

    #[test]
    fn rearming_a_recycled_slot_does_not_double_fire() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let id = heap.insert(base, dev(1));
        assert!(heap.cancel(id).is_some());
        // Recycles the same slot with a newer seq and a later deadline.
        let id2 = heap.insert(base + Duration::from_secs(60), dev(9));
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_secs(60)));

        let mut out = Vec::new();
        heap.pop_expired(base + Duration::from_millis(1), &mut out);
        assert!(out.is_empty(), "stale incarnation fired");
        assert!(heap.cancel(id2).is_some());
        assert!(heap.is_empty());
    }

    #[test]
    fn next_deadline_skips_dead_heads() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let early = heap.insert(base, dev(1));
        heap.insert(base + Duration::from_secs(1), dev(2));
        heap.cancel(early);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_secs(1)));
    }
}
