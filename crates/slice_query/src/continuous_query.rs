use std::time::Duration;

use futures::{
    stream::BoxStream,
    TryStreamExt,
};
use futures_async_stream::try_stream;

/// One page of results, produced by `next_query`.
pub(crate) type SubQuery<'a, E> = BoxStream<'a, anyhow::Result<E>>;

/// Concatenates successive query sub-streams into one long stream.
///
/// Starting from `initial_state`, repeatedly asks `next_query` for the next
/// sub-stream (or `None` to complete), splices it into the output while
/// folding every emitted element through `update_state`, and then waits for
/// whatever delay `delay_next_query` derives from the folded state before
/// asking again. The first query is issued without delay.
///
/// An error from a sub-stream or from `update_state` fails the whole stream.
/// A sub-stream simply ending means "page exhausted", not end-of-stream.
/// Dropping the stream cancels an in-flight page or pending delay.
#[allow(clippy::needless_lifetimes)]
#[try_stream(ok = E, error = anyhow::Error)]
pub(crate) async fn continuous_query<'a, S, E>(
    initial_state: S,
    mut update_state: impl FnMut(&S, &E) -> anyhow::Result<S> + 'a,
    mut delay_next_query: impl FnMut(&S) -> Option<Duration> + 'a,
    mut next_query: impl FnMut(&S) -> (S, Option<SubQuery<'a, E>>) + 'a,
) where
    S: 'a,
    E: 'a,
{
    let mut state = initial_state;
    loop {
        let (next_state, sub_query) = next_query(&state);
        state = next_state;
        let Some(mut sub_query) = sub_query else {
            break;
        };
        while let Some(envelope) = sub_query.try_next().await? {
            state = update_state(&state, &envelope)?;
            yield envelope;
        }
        // Source resources are scoped to the page, release before waiting.
        drop(sub_query);
        if let Some(delay) = delay_next_query(&state) {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Poll pacing from the yield of the previous query: a full buffer means
/// more rows are likely waiting, an empty result backs off for a full
/// refresh interval, and a partial page polls at half the interval.
pub(crate) fn adjust_next_delay(
    row_count: usize,
    buffer_size: usize,
    refresh_interval: Duration,
) -> Option<Duration> {
    if row_count >= buffer_size {
        None
    } else if row_count == 0 {
        Some(refresh_interval)
    } else {
        Some(refresh_interval / 2)
    }
}

#[cfg(test)]
mod tests {
    use futures::{
        stream,
        StreamExt,
    };
    use proptest::prelude::*;

    use super::*;

    fn page<'a>(rows: Vec<u64>) -> SubQuery<'a, u64> {
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_concatenates_pages_and_folds_state() -> anyhow::Result<()> {
        // State = (pages issued, elements seen in current page).
        let pages = vec![vec![1u64, 2, 3], vec![4, 5], vec![]];
        let results: Vec<u64> = continuous_query(
            (0usize, 0usize),
            |&(queries, count), _: &u64| Ok((queries, count + 1)),
            |_| None,
            |&(queries, _)| {
                let sub_query = pages.get(queries).cloned().map(page);
                ((queries + 1, 0), sub_query)
            },
        )
        .try_collect()
        .await?;
        assert_eq!(results, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_state_error_fails_stream() {
        let mut results = continuous_query(
            (),
            |_, element: &u64| {
                anyhow::ensure!(*element != 2, "boom on {element}");
                Ok(())
            },
            |_| None,
            |_| ((), Some(page(vec![1, 2, 3]))),
        )
        .boxed();
        assert_eq!(results.try_next().await.unwrap(), Some(1));
        let err = results.try_next().await.unwrap_err();
        assert!(err.to_string().contains("boom on 2"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_applies_between_queries_but_not_before_first() {
        let start = tokio::time::Instant::now();
        let delay = Duration::from_secs(3);
        let results: Vec<(u64, Duration)> = continuous_query(
            0usize,
            |&queries, _: &u64| Ok(queries),
            move |_| Some(delay),
            |&queries| {
                let sub_query = (queries < 2).then(|| page(vec![queries as u64]));
                (queries + 1, sub_query)
            },
        )
        .map_ok(|element| (element, start.elapsed()))
        .try_collect()
        .await
        .unwrap();
        // First page immediately, second after one delay; one more delay is
        // waited before discovering the end of the stream.
        assert_eq!(results, vec![
            (0, Duration::ZERO),
            (1, Duration::from_secs(3)),
        ]);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn test_adjust_next_delay_law(
            row_count in 0usize..2000,
            buffer_size in 1usize..2000,
            refresh_millis in 1u64..100_000,
        ) {
            let refresh_interval = Duration::from_millis(refresh_millis);
            let delay = adjust_next_delay(row_count, buffer_size, refresh_interval);
            if row_count >= buffer_size {
                prop_assert_eq!(delay, None);
            } else if row_count == 0 {
                prop_assert_eq!(delay, Some(refresh_interval));
            } else {
                prop_assert_eq!(delay, Some(refresh_interval / 2));
            }
        }
    }
}
