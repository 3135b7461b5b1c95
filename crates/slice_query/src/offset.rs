use std::collections::BTreeMap;

use crate::types::{
    PersistenceId,
    SeqNr,
    Timestamp,
};

/// The resumable cursor of a by-slice stream.
///
/// `timestamp` is the largest `db_timestamp` observed so far and `seen` holds
/// the largest seq_nr per persistence id *at exactly that timestamp*. Commit
/// timestamps have microsecond resolution, so distinct writes can share one;
/// when a stream resumes with `db_timestamp >= timestamp` it will re-fetch
/// rows it already emitted at the cursor timestamp, and `seen` is precisely
/// the set needed to filter those out. Whenever `timestamp` advances, `seen`
/// is reset to the single triggering row.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimestampOffset {
    pub timestamp: Timestamp,
    /// The read-side clock at the moment the cursor row was fetched. Carried
    /// for diagnostics (lag between write and read), never for ordering.
    pub read_timestamp: Timestamp,
    pub seen: BTreeMap<PersistenceId, SeqNr>,
}

impl TimestampOffset {
    /// Start-of-stream cursor: the epoch, nothing seen.
    pub const ZERO: TimestampOffset = TimestampOffset {
        timestamp: Timestamp::MIN,
        read_timestamp: Timestamp::MIN,
        seen: BTreeMap::new(),
    };

    pub fn new(
        timestamp: Timestamp,
        read_timestamp: Timestamp,
        seen: BTreeMap<PersistenceId, SeqNr>,
    ) -> Self {
        Self {
            timestamp,
            read_timestamp,
            seen,
        }
    }
}

/// Offset as supplied by callers, which may not have a cursor yet.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Offset {
    NoOffset,
    Timestamp(TimestampOffset),
}

impl From<Offset> for TimestampOffset {
    fn from(offset: Offset) -> Self {
        match offset {
            Offset::NoOffset => TimestampOffset::ZERO,
            Offset::Timestamp(timestamp_offset) => timestamp_offset,
        }
    }
}

impl From<TimestampOffset> for Offset {
    fn from(offset: TimestampOffset) -> Self {
        Offset::Timestamp(offset)
    }
}
