use std::{
    hash::Hasher,
    ops::RangeInclusive,
    time::Duration,
};

use fnv::FnvHasher;

/// Number of deterministic partitions a persistence id can hash into.
/// Consumers query a contiguous range of slices, so this also bounds how
/// finely a projection can be sharded.
pub const NUMBER_OF_SLICES: u16 = 1024;

/// Per-entity monotonic counter, incremented on every write. For
/// durable-state entities this is a revision number.
pub type SeqNr = i64;

/// Microsecond-resolution commit time assigned by the database. All ordering
/// decisions in the query engine are made against this clock, never a local
/// one.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
)]
pub struct Timestamp(
    #[cfg_attr(
        any(test, feature = "testing"),
        proptest(strategy = "0u64..=i64::MAX as u64")
    )]
    u64,
);

impl Timestamp {
    pub const MAX: Timestamp = Timestamp(i64::MAX as u64);
    /// The epoch. Also the timestamp of the zero offset.
    pub const MIN: Timestamp = Timestamp(0);

    pub fn succ(&self) -> anyhow::Result<Self> {
        anyhow::ensure!(*self < Self::MAX, "timestamp {self} at maximum");
        Ok(Self(self.0 + 1))
    }

    pub fn pred(&self) -> anyhow::Result<Self> {
        anyhow::ensure!(*self > Self::MIN, "timestamp {self} at minimum");
        Ok(Self(self.0 - 1))
    }

    pub fn add(&self, duration: Duration) -> anyhow::Result<Self> {
        let micros = u64::try_from(duration.as_micros())?;
        let sum = self
            .0
            .checked_add(micros)
            .filter(|sum| *sum <= i64::MAX as u64)
            .ok_or_else(|| anyhow::anyhow!("timestamp {self} + {duration:?} out of range"))?;
        Ok(Self(sum))
    }

    /// Subtraction clamped at the epoch. Backtracking windows anchored near
    /// the epoch must not underflow.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(micros))
    }

    /// Elapsed database time from `earlier` to `self`, zero if `earlier` is
    /// not actually earlier.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> u64 {
        ts.0
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> i64 {
        ts.0 as i64
    }
}

impl TryFrom<u64> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(micros: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            micros <= i64::MAX as u64,
            "timestamp {micros} out of range"
        );
        Ok(Self(micros))
    }
}

impl TryFrom<i64> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(micros: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(micros >= 0, "timestamp {micros} out of range");
        Ok(Self(micros as u64))
    }
}

/// Stable identifier of a single entity: an event-stream or durable-state
/// key.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Deref,
    derive_more::AsRef,
)]
#[from(forward)]
#[as_ref(forward)]
pub struct PersistenceId(String);

impl PersistenceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The deterministic partition this id hashes into. Must be stable
    /// across processes and releases since slice ranges are part of
    /// persisted projection identity, hence FNV-1a over the raw bytes
    /// rather than the std hasher.
    pub fn slice(&self) -> u16 {
        let mut hasher = FnvHasher::default();
        hasher.write(self.0.as_bytes());
        (hasher.finish() % NUMBER_OF_SLICES as u64) as u16
    }
}

/// Identifies a family of persistent entities sharing a table.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Deref,
    derive_more::AsRef,
)]
#[from(forward)]
#[as_ref(forward)]
pub struct EntityType(String);

impl EntityType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Splits the slice space into `number_of_ranges` equal contiguous ranges,
/// one per projection worker. `number_of_ranges` must divide
/// [`NUMBER_OF_SLICES`] evenly.
pub fn slice_ranges(number_of_ranges: u16) -> anyhow::Result<Vec<RangeInclusive<u16>>> {
    anyhow::ensure!(
        number_of_ranges > 0 && NUMBER_OF_SLICES % number_of_ranges == 0,
        "number_of_ranges [{number_of_ranges}] must evenly divide [{NUMBER_OF_SLICES}]"
    );
    let range_size = NUMBER_OF_SLICES / number_of_ranges;
    Ok((0..number_of_ranges)
        .map(|i| (i * range_size)..=((i + 1) * range_size - 1))
        .collect())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_slice_ranges() -> anyhow::Result<()> {
        let ranges = slice_ranges(4)?;
        assert_eq!(
            ranges,
            vec![0..=255, 256..=511, 512..=767, 768..=1023]
        );
        assert_eq!(slice_ranges(1)?, vec![0..=1023]);
        assert!(slice_ranges(0).is_err());
        assert!(slice_ranges(3).is_err());
        Ok(())
    }

    #[test]
    fn test_timestamp_bounds() -> anyhow::Result<()> {
        assert!(Timestamp::MIN.pred().is_err());
        assert!(Timestamp::MAX.succ().is_err());
        assert_eq!(Timestamp::MIN.succ()?.pred()?, Timestamp::MIN);
        assert_eq!(
            Timestamp::MIN.saturating_sub(Duration::from_secs(1)),
            Timestamp::MIN
        );
        assert!(Timestamp::MAX.add(Duration::from_micros(1)).is_err());
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn test_timestamp_i64_roundtrips(ts in any::<Timestamp>()) {
            let as_i64 = i64::from(ts);
            prop_assert_eq!(Timestamp::try_from(as_i64).unwrap(), ts);
            let as_u64 = u64::from(ts);
            prop_assert_eq!(Timestamp::try_from(as_u64).unwrap(), ts);
        }

        #[test]
        fn test_duration_since_inverts_add(
            ts in any::<Timestamp>(),
            micros in 0u64..1_000_000_000,
        ) {
            let duration = Duration::from_micros(micros);
            if let Ok(later) = ts.add(duration) {
                prop_assert_eq!(later.duration_since(ts), duration);
                prop_assert_eq!(later.saturating_sub(duration), ts);
            }
        }

        #[test]
        fn test_slice_in_range(pid in any::<PersistenceId>()) {
            prop_assert!(pid.slice() < NUMBER_OF_SLICES);
        }
    }
}
