use std::collections::HashMap;
use std::hash::Hash;

pub const GC_PERIOD_MS: u64 = 5 * 60 * 1000;
pub const REGISTRY_GC_EVENT_COUNT: usize = 100;

/// Suppresses repeats of the same key within a timeout.
///
/// Entries are swept when either the GC period has elapsed or enough events
/// were allowed since the last sweep. A sweep drops entries older than the
/// retention window (the caller's timeout unless a fixed window is set).
#[derive(Debug)]
pub struct RepeatFilter<K> {
    last_sent: HashMap<K, u64>,
    gc_period_ms: u64,
    gc_event_count: usize,
    fixed_retention_ms: Option<u64>,
    last_gc_ms: u64,
    allowed_since_gc: usize,
}

impl<K: Eq + Hash> RepeatFilter<K> {
    pub fn new(gc_period_ms: u64, gc_event_count: usize) -> Self {
        Self {
            last_sent: HashMap::new(),
            gc_period_ms,
            gc_event_count,
            fixed_retention_ms: None,
            last_gc_ms: 0,
            allowed_since_gc: 0,
        }
    }

    pub fn with_fixed_retention(mut self, retention_ms: u64) -> Self {
        self.fixed_retention_ms = Some(retention_ms);
        self
    }

    /// True if `key` was not allowed within the last `timeout_ms`; records `now_ms` when it returns true.
    pub fn allow(&mut self, key: K, timeout_ms: u64, now_ms: u64) -> bool {
        if let Some(last) = self.last_sent.get(&key) {
            if now_ms.saturating_sub(*last) < timeout_ms {
                return false;
            }
        }
        self.last_sent.insert(key, now_ms);
        self.allowed_since_gc += 1;

        if now_ms.saturating_sub(self.last_gc_ms) >= self.gc_period_ms
            || self.allowed_since_gc >= self.gc_event_count
        {
            self.collect(self.fixed_retention_ms.unwrap_or(timeout_ms), now_ms);
        }
        true
    }

    pub fn collect(&mut self, retention_ms: u64, now_ms: u64) {
        self.last_sent
            .retain(|_, last| now_ms.saturating_sub(*last) < retention_ms);
        self.last_gc_ms = now_ms;
        self.allowed_since_gc = 0;
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}
