use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::types::{
    EntityType,
    PersistenceId,
    SeqNr,
    Timestamp,
};

pub type RowStream<'a> = BoxStream<'a, anyhow::Result<SerializedRow>>;

/// One persisted row, as produced by the backing journal or durable-state
/// table. The payload is opaque to the query engine and passed through to
/// the envelope factory together with its serializer identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedRow {
    pub persistence_id: PersistenceId,
    pub seq_nr: SeqNr,
    /// Commit time assigned by the database. Within one stream returned by
    /// [`RowSource::rows_by_slices`] this is non-decreasing, with ties
    /// broken by ascending `seq_nr`.
    pub db_timestamp: Timestamp,
    /// The database clock at the moment this row was read back.
    pub read_db_timestamp: Timestamp,
    /// `None` when the source elided the payload, which it may do for
    /// backtracking scans.
    pub payload: Option<Bytes>,
    pub ser_id: u32,
    pub ser_manifest: String,
}

/// The row source backing the query engine, implemented against the actual
/// database. Implementations own SQL construction, connection pooling and
/// row decoding; connection resources for one returned stream must be
/// released when that stream completes or is dropped.
#[async_trait]
pub trait RowSource: Send + Sync + 'static {
    /// Rows with `entity_type`, slice within `[min_slice, max_slice]` and
    /// `db_timestamp >= from_timestamp`, ordered by `(db_timestamp, seq_nr)`
    /// ascending, limited to at most the configured buffer size per call.
    ///
    /// `to_timestamp`, when present, excludes rows at or after it.
    /// `behind_current_time > 0` excludes rows newer than
    /// `now - behind_current_time`, evaluated against the database clock, to
    /// tolerate in-flight commits from concurrent transactions.
    ///
    /// When `backtracking` is set the source may elide payload columns; the
    /// engine will not read them.
    fn rows_by_slices(
        &self,
        entity_type: &EntityType,
        min_slice: u16,
        max_slice: u16,
        from_timestamp: Timestamp,
        to_timestamp: Option<Timestamp>,
        behind_current_time: Duration,
        backtracking: bool,
    ) -> RowStream<'_>;

    /// The database's transaction-time clock. Used once per current-mode
    /// query to freeze the end of the scanned range.
    async fn current_db_timestamp(&self) -> anyhow::Result<Timestamp>;
}
