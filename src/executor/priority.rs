use std::cmp::Ordering;

/// Priority used when the caller does not ask for one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// A queued payload with its urgency and submission sequence number.
///
/// Larger priorities are more urgent. Among equal priorities the entry that
/// was submitted first (lower sequence) wins, so a `BinaryHeap` of entries
/// pops in strict priority-then-FIFO order.
#[derive(Debug)]
pub struct PriorityEntry<T> {
    payload: T,
    priority: i32,
    sequence: u64,
}

impl<T> PriorityEntry<T> {
    pub fn new(payload: T, priority: i32, sequence: u64) -> Self {
        Self {
            payload,
            priority,
            sequence,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> PartialEq for PriorityEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for PriorityEntry<T> {}

impl<T> PartialOrd for PriorityEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PriorityEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // Older submissions sort "greater" so the max-heap yields them first
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
