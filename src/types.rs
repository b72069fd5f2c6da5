use chrono::Utc;

/// Milliseconds since the Unix epoch; the LWW clock.
pub type Timestamp = u64;

/// A stored value together with the timestamp of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub value: String,
    pub timestamp: Timestamp,
}

impl ValueRecord {
    pub fn new(value: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

/// Current wall-clock time in milliseconds, used to stamp local writes.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis() as Timestamp
}

/// One row of a store snapshot: (key, value, timestamp).
pub type SnapshotEntry = (String, String, Timestamp);
