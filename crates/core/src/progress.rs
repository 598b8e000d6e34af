use serde::{Deserialize, Serialize};

/// One observation about a single item. `phase` is `"start"` when work on
/// the item begins and `"done"` when its payload has been fully encoded or
/// replayed; the size and timing fields are only present on `"done"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemProgress {
    pub phase: String,
    pub path: String,
    pub raw_bytes: Option<u64>,
    pub stored_bytes: Option<u64>,
    pub duration_ms: Option<u64>,
}

/// Observational sink. Pipelines must behave identically whether or not a
/// sink is attached; under concurrency several `"start"` events may be
/// outstanding at once, but `"done"` fires exactly once per item.
pub trait ProgressSink: Send + Sync {
    fn on_item(&self, progress: ItemProgress);
}
