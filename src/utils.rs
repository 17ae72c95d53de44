use std::sync::atomic::{AtomicU64, Ordering};

pub fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Monotonic-per-process id generator: `{prefix}-{unix_ms}-{seq}`.
///
/// Ids only need to be unique within the scope of this service (the store keys
/// on them); the millisecond prefix keeps them roughly sortable for operators.
pub struct IdGen {
    seq: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
        }
    }

    pub fn next(&self, prefix: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", prefix, now_ms(), seq)
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
