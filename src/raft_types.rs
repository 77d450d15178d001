use derive_more::Display;
use serde::Deserialize;
use serde::Serialize;

/// The identity of a log entry: the term in which it was created and its index.
///
/// Log ids order lexicographically by `(term, index)`, which is exactly the
/// "at least as up-to-date" comparison used by the election restriction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display(fmt = "{}-{}", term, index)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// The identity of a segment of a streaming snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display(fmt = "{}+{}", id, offset)]
pub struct SnapshotSegmentId {
    pub id: String,
    pub offset: u64,
}

impl<T: ToString> From<(T, u64)> for SnapshotSegmentId {
    fn from((id, offset): (T, u64)) -> Self {
        Self {
            id: id.to_string(),
            offset,
        }
    }
}
