use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Timer behavior bits. A timer without [`TimerFlags::SINGLE_SHOT`]
    /// repeats at its interval until unregistered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerFlags: u32 {
        const SINGLE_SHOT = 0x1;
    }
}

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut(u32)>>;

/// One timer popped out of the queue for firing.
pub(crate) struct DueTimer {
    pub(crate) when: Instant,
    pub(crate) id: u32,
    pub(crate) flags: TimerFlags,
    pub(crate) interval: Duration,
    pub(crate) callback: TimerCallback,
}

struct TimerRecord {
    id: u32,
    flags: TimerFlags,
    interval: Duration,
    callback: TimerCallback,
}

/// Time-ordered timer set with an id index for O(log n) cancellation.
///
/// Records are keyed by `(deadline, sequence)`; the sequence breaks deadline
/// ties in insertion order and fences re-inserted repeating timers out of the
/// drain pass that re-inserted them.
pub(crate) struct TimerQueue {
    by_time: BTreeMap<(Instant, u64), TimerRecord>,
    by_id: HashMap<u32, (Instant, u64)>,
    next_id: u32,
    next_seq: u64,
    firing: Option<u32>,
    firing_cancelled: bool,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            by_time: BTreeMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            next_seq: 0,
            firing: None,
            firing_cancelled: false,
        }
    }

    /// Allocates the next free timer id, skipping 0 and any id still live.
    fn allocate_id(&mut self) -> u32 {
        let mut id = self.next_id;
        while id == 0 || self.by_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        id
    }

    pub(crate) fn register(
        &mut self,
        timeout: Duration,
        flags: TimerFlags,
        callback: TimerCallback,
        now: Instant,
    ) -> u32 {
        let id = self.allocate_id();
        self.insert(
            now + timeout,
            TimerRecord {
                id,
                flags,
                interval: timeout,
                callback,
            },
        );
        id
    }

    fn insert(&mut self, when: Instant, record: TimerRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(record.id, (when, seq));
        self.by_time.insert((when, seq), record);
    }

    /// Safe to call from within the firing timer's own callback: the record
    /// is tombstoned so a repeating timer is not re-inserted afterwards.
    pub(crate) fn unregister(&mut self, id: u32) {
        if self.firing == Some(id) {
            self.firing_cancelled = true;
            return;
        }
        if let Some(key) = self.by_id.remove(&id) {
            self.by_time.remove(&key);
        }
    }

    pub(crate) fn next_when(&self) -> Option<Instant> {
        self.by_time.keys().next().map(|&(when, _)| when)
    }

    /// Current sequence watermark; records inserted at or after it are not
    /// returned by [`TimerQueue::take_due`] for that watermark.
    pub(crate) fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Removes and returns the earliest timer due at `now`, ignoring records
    /// inserted at or after `seq_limit`.
    pub(crate) fn take_due(&mut self, now: Instant, seq_limit: u64) -> Option<DueTimer> {
        let &(when, seq) = self.by_time.keys().next()?;
        if when > now || seq >= seq_limit {
            return None;
        }

        let record = self.by_time.remove(&(when, seq))?;
        self.by_id.remove(&record.id);
        self.firing = Some(record.id);
        self.firing_cancelled = false;

        Some(DueTimer {
            when,
            id: record.id,
            flags: record.flags,
            interval: record.interval,
            callback: record.callback,
        })
    }

    /// Ends the current fire and reports whether the callback cancelled its
    /// own timer.
    pub(crate) fn end_fire(&mut self) -> bool {
        let cancelled = self.firing_cancelled;
        self.firing = None;
        self.firing_cancelled = false;
        cancelled
    }

    /// Re-inserts a repeating timer one interval after its last deadline.
    /// A deadline already in the past is pulled up to `now` so a slow
    /// callback does not cause a burst of catch-up firings.
    pub(crate) fn reschedule(&mut self, due: DueTimer, now: Instant) {
        let mut when = due.when + due.interval;
        if when < now {
            when = now;
        }
        self.insert(
            when,
            TimerRecord {
                id: due.id,
                flags: due.flags,
                interval: due.interval,
                callback: due.callback,
            },
        );
    }
}
