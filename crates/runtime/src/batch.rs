use std::collections::BTreeSet;

use foundation::time::Millis;

/// Default coalescing window for visibility reconciliation.
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 250;

/// Pending batch of keys with an explicit coalescing window.
///
/// Key properties:
/// - The window opens at the first `schedule` of an empty batch; later
///   requests join the batch without pushing the deadline out, so a steady
///   stream of triggers still flushes at least once per window.
/// - Keys are deduplicated and flushed in ascending order.
/// - `take_due` is the debounced path, `take_now` the immediate one. Both
///   leave the batch empty.
#[derive(Debug, Clone)]
pub struct DebouncedBatch<K> {
    window_ms: u64,
    pending: BTreeSet<K>,
    deadline: Option<Millis>,
    flushes: u64,
}

impl<K: Ord> Default for DebouncedBatch<K> {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW_MS)
    }
}

impl<K: Ord> DebouncedBatch<K> {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            pending: BTreeSet::new(),
            deadline: None,
            flushes: 0,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains(key)
    }

    /// When the current batch becomes due, if any.
    pub fn deadline(&self) -> Option<Millis> {
        self.deadline
    }

    /// Number of batches handed out so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn schedule(&mut self, key: K, now: Millis) {
        if self.deadline.is_none() {
            self.deadline = Some(now.after(self.window_ms));
        }
        self.pending.insert(key);
    }

    pub fn schedule_all(&mut self, keys: impl IntoIterator<Item = K>, now: Millis) {
        for key in keys {
            self.schedule(key, now);
        }
    }

    pub fn is_due(&self, now: Millis) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Hands out the batch if its window has elapsed.
    pub fn take_due(&mut self, now: Millis) -> Option<Vec<K>> {
        if !self.is_due(now) {
            return None;
        }
        Some(self.take_now())
    }

    /// Hands out whatever is pending, regardless of the window.
    pub fn take_now(&mut self) -> Vec<K> {
        self.deadline = None;
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.flushes += 1;
        let batch = std::mem::take(&mut self.pending);
        tracing::trace!(keys = batch.len(), "batch flushed");
        batch.into_iter().collect()
    }

    /// Drops pending keys that fail `keep`. Closes the window if nothing is left.
    pub fn retain(&mut self, keep: impl FnMut(&K) -> bool) {
        self.pending.retain(keep);
        if self.pending.is_empty() {
            self.deadline = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DebouncedBatch;
    use foundation::time::Millis;

    #[test]
    fn coalesces_requests_inside_window() {
        let mut b = DebouncedBatch::new(250);
        b.schedule("a", Millis(0));
        b.schedule("b", Millis(100));
        b.schedule("a", Millis(200));

        assert!(b.take_due(Millis(249)).is_none());
        assert_eq!(b.take_due(Millis(250)), Some(vec!["a", "b"]));
        assert!(b.is_empty());
        assert_eq!(b.flushes(), 1);
    }

    #[test]
    fn later_requests_do_not_extend_deadline() {
        let mut b = DebouncedBatch::new(100);
        b.schedule(1, Millis(0));
        b.schedule(2, Millis(90));
        assert_eq!(b.deadline(), Some(Millis(100)));
    }

    #[test]
    fn immediate_flush_bypasses_window() {
        let mut b = DebouncedBatch::new(250);
        b.schedule(3, Millis(10));
        assert_eq!(b.take_now(), vec![3]);
        assert_eq!(b.deadline(), None);
        assert!(b.take_due(Millis(1_000)).is_none());
    }

    #[test]
    fn new_window_opens_after_flush() {
        let mut b = DebouncedBatch::new(50);
        b.schedule(1, Millis(0));
        let _ = b.take_due(Millis(60));
        b.schedule(2, Millis(70));
        assert_eq!(b.deadline(), Some(Millis(120)));
    }

    #[test]
    fn retain_closes_empty_window() {
        let mut b = DebouncedBatch::new(50);
        b.schedule(1, Millis(0));
        b.retain(|k| *k != 1);
        assert!(b.deadline().is_none());
    }
}
