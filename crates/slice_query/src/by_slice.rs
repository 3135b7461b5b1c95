use std::{
    sync::Arc,
    time::Duration,
};

use futures::{
    stream::BoxStream,
    StreamExt,
    TryStreamExt,
};
use futures_async_stream::try_stream;

use crate::{
    continuous_query::{
        adjust_next_delay,
        continuous_query,
        SubQuery,
    },
    envelope::EnvelopeFactory,
    offset::{
        Offset,
        TimestampOffset,
    },
    row_source::{
        RowSource,
        RowStream,
    },
    settings::QuerySettings,
    types::{
        EntityType,
        Timestamp,
    },
};

pub type EnvelopeStream<'a, E> = BoxStream<'a, anyhow::Result<E>>;

/// Consecutive empty primary polls after which the live query revalidates
/// the older window with a backtracking query.
const SWITCH_TO_BACKTRACKING_IDLE_COUNT: u64 = 5;

/// Driver state, advanced between sub-queries and folded over emitted
/// envelopes. `latest` is the primary cursor; `latest_backtracking` trails
/// it by at most the backtracking window.
#[derive(Clone, Debug)]
struct QueryState {
    latest: TimestampOffset,
    latest_backtracking: TimestampOffset,
    /// Envelopes emitted by the current sub-query.
    row_count: usize,
    /// Sub-queries issued so far on this stream.
    query_count: u64,
    /// Consecutive sub-queries that emitted nothing.
    idle_count: u64,
    backtracking: bool,
}

impl QueryState {
    fn initial(latest: TimestampOffset) -> Self {
        Self {
            latest,
            latest_backtracking: TimestampOffset::ZERO,
            row_count: 0,
            query_count: 0,
            idle_count: 0,
            backtracking: false,
        }
    }

    fn current_offset(&self) -> &TimestampOffset {
        if self.backtracking {
            &self.latest_backtracking
        } else {
            &self.latest
        }
    }

    fn next_query_from_timestamp(&self) -> Timestamp {
        self.current_offset().timestamp
    }

    fn next_query_to_timestamp(&self) -> Option<Timestamp> {
        // Backtracking never looks past the primary cursor.
        self.backtracking.then_some(self.latest.timestamp)
    }
}

/// Per-timestamp deduplication and offset accumulation for one sub-query's
/// rows. The `(current_timestamp, current_seen)` state lives exclusively in
/// this stage and is reconstituted from the driver's offset at every
/// sub-query boundary.
#[allow(clippy::needless_lifetimes)]
#[try_stream(ok = F::Envelope, error = anyhow::Error)]
async fn deserialize_and_add_offset<'a, F: EnvelopeFactory>(
    envelope_factory: &'a F,
    log_prefix: &'a str,
    start_offset: TimestampOffset,
    mut rows: RowStream<'a>,
) {
    let mut current_timestamp = start_offset.timestamp;
    let mut current_seen = start_offset.seen;
    while let Some(row) = rows.try_next().await? {
        if row.db_timestamp == current_timestamp {
            // Rows at the cursor timestamp can be re-fetched by the next
            // page, or by the next incarnation of a restarted stream.
            let already_seen = current_seen
                .get(&row.persistence_id)
                .is_some_and(|&seen_seq_nr| seen_seq_nr >= row.seq_nr);
            if already_seen {
                tracing::debug!(
                    "{log_prefix} filtering out duplicate row for persistence id [{}], seq nr \
                     [{}]",
                    row.persistence_id,
                    row.seq_nr,
                );
                continue;
            }
            current_seen.insert(row.persistence_id.clone(), row.seq_nr);
        } else {
            // Source ordering guarantees this is a move forward in time.
            current_timestamp = row.db_timestamp;
            current_seen.clear();
            current_seen.insert(row.persistence_id.clone(), row.seq_nr);
        }
        let offset = TimestampOffset::new(
            current_timestamp,
            row.read_db_timestamp,
            current_seen.clone(),
        );
        yield envelope_factory.create_envelope(offset, row);
    }
}

/// Streaming queries over a contiguous range of slices, producing ordered,
/// deduplicated envelopes whose offsets make the stream resumable.
pub struct BySliceQuery<F> {
    row_source: Arc<dyn RowSource>,
    envelope_factory: F,
    settings: QuerySettings,
}

impl<F: EnvelopeFactory> BySliceQuery<F> {
    pub fn new(
        row_source: Arc<dyn RowSource>,
        envelope_factory: F,
        settings: QuerySettings,
    ) -> anyhow::Result<Self> {
        settings.validate()?;
        Ok(Self {
            row_source,
            envelope_factory,
            settings,
        })
    }

    /// Every row between the given offset and a snapshot of the database's
    /// "now" frozen before the first page, then completes.
    pub fn current_by_slices<'a>(
        &'a self,
        log_prefix: &'a str,
        entity_type: &'a EntityType,
        min_slice: u16,
        max_slice: u16,
        offset: Offset,
    ) -> EnvelopeStream<'a, F::Envelope> {
        self._current_by_slices(log_prefix, entity_type, min_slice, max_slice, offset)
            .boxed()
    }

    #[allow(clippy::needless_lifetimes)]
    #[try_stream(ok = F::Envelope, error = anyhow::Error)]
    async fn _current_by_slices<'a>(
        &'a self,
        log_prefix: &'a str,
        entity_type: &'a EntityType,
        min_slice: u16,
        max_slice: u16,
        offset: Offset,
    ) {
        let initial_offset = TimestampOffset::from(offset);
        let end_timestamp = self.row_source.current_db_timestamp().await?;
        tracing::debug!(
            "{log_prefix} query slices [{min_slice} - {max_slice}], from time [{}] until now \
             [{end_timestamp}]",
            initial_offset.timestamp,
        );
        let envelopes = continuous_query(
            QueryState::initial(initial_offset),
            |state: &QueryState, envelope: &F::Envelope| {
                Ok(QueryState {
                    latest: self.envelope_factory.extract_offset(envelope),
                    row_count: state.row_count + 1,
                    ..state.clone()
                })
            },
            |_: &QueryState| None,
            |state: &QueryState| {
                self.next_current_query(
                    log_prefix,
                    entity_type,
                    min_slice,
                    max_slice,
                    end_timestamp,
                    state,
                )
            },
        );
        futures::pin_mut!(envelopes);
        while let Some(envelope) = envelopes.try_next().await? {
            yield envelope;
        }
    }

    fn next_current_query<'a>(
        &'a self,
        log_prefix: &'a str,
        entity_type: &'a EntityType,
        min_slice: u16,
        max_slice: u16,
        end_timestamp: Timestamp,
        state: &QueryState,
    ) -> (QueryState, Option<SubQuery<'a, F::Envelope>>) {
        // Deduplication can drop a boundary row from an otherwise full page,
        // so "likely full" starts at buffer_size - 1 emitted rows.
        if state.query_count == 0 || state.row_count >= self.settings.buffer_size - 1 {
            let new_state = QueryState {
                row_count: 0,
                query_count: state.query_count + 1,
                ..state.clone()
            };
            if state.query_count != 0 {
                tracing::debug!(
                    "{log_prefix} query [{}] from slices [{min_slice} - {max_slice}], from time \
                     [{}] until now [{end_timestamp}]. Found [{}] rows in previous query.",
                    new_state.query_count,
                    state.latest.timestamp,
                    state.row_count,
                );
            }
            let rows = self.row_source.rows_by_slices(
                entity_type,
                min_slice,
                max_slice,
                state.latest.timestamp,
                Some(end_timestamp),
                Duration::ZERO,
                false,
            );
            let envelopes = deserialize_and_add_offset(
                &self.envelope_factory,
                log_prefix,
                state.latest.clone(),
                rows,
            )
            .boxed();
            (new_state, Some(envelopes))
        } else {
            tracing::debug!(
                "{log_prefix} query [{}] from slices [{min_slice} - {max_slice}] completed. \
                 Found [{}] rows in previous query.",
                state.query_count,
                state.row_count,
            );
            (state.clone(), None)
        }
    }

    /// Continuously tails new rows, interleaving backtracking re-reads of an
    /// older window to pick up rows whose commit timestamps landed below the
    /// primary cursor due to clock skew or delayed commits. Callers that
    /// persist offsets must track primary and backtracking offsets
    /// independently, since backtracking envelopes carry timestamps behind
    /// the primary cursor.
    pub fn live_by_slices<'a>(
        &'a self,
        log_prefix: &'a str,
        entity_type: &'a EntityType,
        min_slice: u16,
        max_slice: u16,
        offset: Offset,
    ) -> EnvelopeStream<'a, F::Envelope> {
        self._live_by_slices(log_prefix, entity_type, min_slice, max_slice, offset)
            .boxed()
    }

    #[allow(clippy::needless_lifetimes)]
    #[try_stream(ok = F::Envelope, error = anyhow::Error)]
    async fn _live_by_slices<'a>(
        &'a self,
        log_prefix: &'a str,
        entity_type: &'a EntityType,
        min_slice: u16,
        max_slice: u16,
        offset: Offset,
    ) {
        let initial_offset = TimestampOffset::from(offset);
        tracing::debug!(
            "{log_prefix} starting query from slices [{min_slice} - {max_slice}], from time [{}]",
            initial_offset.timestamp,
        );
        let envelopes = continuous_query(
            QueryState::initial(initial_offset),
            |state: &QueryState, envelope: &F::Envelope| self.next_live_offset(state, envelope),
            |state: &QueryState| {
                let delay = adjust_next_delay(
                    state.row_count,
                    self.settings.buffer_size,
                    self.settings.refresh_interval,
                );
                if let Some(delay) = delay {
                    tracing::debug!(
                        "{log_prefix} query [{}] delay next [{}] ms",
                        state.query_count,
                        delay.as_millis(),
                    );
                }
                delay
            },
            |state: &QueryState| {
                self.next_live_query(log_prefix, entity_type, min_slice, max_slice, state)
            },
        );
        futures::pin_mut!(envelopes);
        while let Some(envelope) = envelopes.try_next().await? {
            yield envelope;
        }
    }

    fn next_live_offset(
        &self,
        state: &QueryState,
        envelope: &F::Envelope,
    ) -> anyhow::Result<QueryState> {
        let offset = self.envelope_factory.extract_offset(envelope);
        if state.backtracking {
            anyhow::ensure!(
                offset.timestamp >= state.latest_backtracking.timestamp,
                "Unexpected offset [{offset:?}] before latest backtracking [{:?}]",
                state.latest_backtracking,
            );
            Ok(QueryState {
                latest_backtracking: offset,
                row_count: state.row_count + 1,
                ..state.clone()
            })
        } else {
            anyhow::ensure!(
                offset.timestamp >= state.latest.timestamp,
                "Unexpected offset [{offset:?}] before latest [{:?}]",
                state.latest,
            );
            Ok(QueryState {
                latest: offset,
                row_count: state.row_count + 1,
                ..state.clone()
            })
        }
    }

    fn next_live_query<'a>(
        &'a self,
        log_prefix: &'a str,
        entity_type: &'a EntityType,
        min_slice: u16,
        max_slice: u16,
        state: &QueryState,
    ) -> (QueryState, Option<SubQuery<'a, F::Envelope>>) {
        let settings = &self.settings;
        let new_idle_count = if state.row_count == 0 {
            state.idle_count + 1
        } else {
            0
        };

        let switch_to_backtracking = settings.backtracking_enabled
            && !state.backtracking
            && state.latest != TimestampOffset::ZERO
            && (new_idle_count >= SWITCH_TO_BACKTRACKING_IDLE_COUNT
                || state
                    .latest
                    .timestamp
                    .duration_since(state.latest_backtracking.timestamp)
                    > settings.half_backtracking_window());
        // An under-filled backtracking page means the older window is caught
        // up, return to the live tail.
        let switch_from_backtracking =
            state.backtracking && state.row_count < settings.buffer_size - 1;

        let new_state = if switch_to_backtracking {
            // Resume where the previous backtracking pass left off, or cover
            // the full window behind the primary cursor on the first pass.
            let latest_backtracking = if state.latest_backtracking == TimestampOffset::ZERO {
                TimestampOffset {
                    timestamp: state
                        .latest
                        .timestamp
                        .saturating_sub(settings.first_backtracking_query_window()),
                    ..TimestampOffset::ZERO
                }
            } else {
                state.latest_backtracking.clone()
            };
            tracing::debug!(
                "{log_prefix} query [{}] switching to backtracking mode, from time [{}]",
                state.query_count + 1,
                latest_backtracking.timestamp,
            );
            QueryState {
                latest_backtracking,
                row_count: 0,
                query_count: state.query_count + 1,
                idle_count: new_idle_count,
                backtracking: true,
                ..state.clone()
            }
        } else if switch_from_backtracking {
            tracing::debug!(
                "{log_prefix} query [{}] switching from backtracking mode, from time [{}]",
                state.query_count + 1,
                state.latest.timestamp,
            );
            QueryState {
                row_count: 0,
                query_count: state.query_count + 1,
                idle_count: new_idle_count,
                backtracking: false,
                ..state.clone()
            }
        } else {
            QueryState {
                row_count: 0,
                query_count: state.query_count + 1,
                idle_count: new_idle_count,
                ..state.clone()
            }
        };

        let behind_current_time = if new_state.backtracking {
            settings.backtracking_behind_current_time
        } else {
            settings.behind_current_time
        };

        tracing::debug!(
            "{log_prefix} query [{}]{} from slices [{min_slice} - {max_slice}], from time [{}]. \
             Found [{}] rows in previous query.",
            new_state.query_count,
            if new_state.backtracking {
                " in backtracking mode"
            } else {
                ""
            },
            new_state.next_query_from_timestamp(),
            state.row_count,
        );

        let rows = self.row_source.rows_by_slices(
            entity_type,
            min_slice,
            max_slice,
            new_state.next_query_from_timestamp(),
            new_state.next_query_to_timestamp(),
            behind_current_time,
            new_state.backtracking,
        );
        let envelopes = deserialize_and_add_offset(
            &self.envelope_factory,
            log_prefix,
            new_state.current_offset().clone(),
            rows,
        )
        .boxed();
        (new_state, Some(envelopes))
    }
}
