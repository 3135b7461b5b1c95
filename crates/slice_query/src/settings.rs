use std::time::Duration;

/// Tuning for the by-slice query loops. The defaults are production
/// defaults; construct with `QuerySettings::default()` and override fields
/// as needed.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Maximum rows per sub-query. The row source must not return more than
    /// this many rows from a single `rows_by_slices` call.
    pub buffer_size: usize,
    /// Base poll interval when the live tail is idle.
    pub refresh_interval: Duration,
    /// Read horizon for primary live queries: rows newer than
    /// `now - behind_current_time` are left for the next poll, so that
    /// not-yet-committed concurrent writes with earlier commit timestamps
    /// cannot be skipped over.
    pub behind_current_time: Duration,
    pub backtracking_enabled: bool,
    /// Rolling temporal span re-scanned by backtracking queries.
    pub backtracking_window: Duration,
    /// Read horizon for backtracking queries, larger than the primary one.
    pub backtracking_behind_current_time: Duration,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            refresh_interval: Duration::from_secs(3),
            behind_current_time: Duration::from_millis(100),
            backtracking_enabled: true,
            backtracking_window: Duration::from_secs(120),
            backtracking_behind_current_time: Duration::from_secs(10),
        }
    }
}

impl QuerySettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.buffer_size > 0, "buffer_size must be positive");
        anyhow::ensure!(
            !self.backtracking_window.is_zero(),
            "backtracking_window must be positive"
        );
        Ok(())
    }

    pub(crate) fn half_backtracking_window(&self) -> Duration {
        self.backtracking_window / 2
    }

    /// The first backtracking query of a stream covers the whole window plus
    /// the backtracking horizon, so it reaches every row the primary
    /// pipeline could have passed over.
    pub(crate) fn first_backtracking_query_window(&self) -> Duration {
        self.backtracking_window + self.backtracking_behind_current_time
    }
}
