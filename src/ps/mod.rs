//! Process-wide aggregation of per-function statistics.
//!
//! [`ParameterServer`] is the store every rank merges into. It is reached
//! either directly through [`InProcess`] or over HTTP through
//! [`client::Client`], both behind the [`StatsAggregator`] seam.

pub mod client;
pub mod metrics;
pub mod server;
pub mod wire;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;

use crate::stats::RunStats;

/// Concurrency-safe function id to [`RunStats`] store.
///
/// Each key's merge runs under its shard's write lock, so concurrent
/// updates to different functions rarely contend and updates to the same
/// function serialize.
#[derive(Debug, Default)]
pub struct ParameterServer {
    stats: DashMap<u64, RunStats>,
}

/// Snapshot row: `[mean, stddev, s0, s1, s2]`.
pub type DumpRow = [f64; 5];

impl ParameterServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `partial` into the stored statistics and returns the result.
    ///
    /// Merging is additive: sending the same partial twice counts it twice.
    pub fn update(&self, func_id: u64, partial: RunStats) -> RunStats {
        let mut entry = self.stats.entry(func_id).or_default();
        *entry += partial;
        *entry
    }

    pub fn update_all(&self, partials: &HashMap<u64, RunStats>) -> HashMap<u64, RunStats> {
        partials
            .iter()
            .map(|(id, partial)| (*id, self.update(*id, *partial)))
            .collect()
    }

    /// Stored statistics, empty for an unknown function.
    pub fn get(&self, func_id: u64) -> RunStats {
        self.stats.get(&func_id).map(|s| *s).unwrap_or_default()
    }

    pub fn get_all(&self) -> HashMap<u64, RunStats> {
        self.stats.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// Adds `n` to the cumulative anomaly count and returns the new count.
    pub fn add_abnormal(&self, func_id: u64, n: u64) -> u64 {
        let mut entry = self.stats.entry(func_id).or_default();
        entry.add_abnormal(n);
        entry.n_abnormal()
    }

    pub fn add_abnormal_all(&self, counts: &HashMap<u64, u64>) -> HashMap<u64, u64> {
        counts
            .iter()
            .map(|(id, n)| (*id, self.add_abnormal(*id, *n)))
            .collect()
    }

    /// Resets every function to empty statistics.
    pub fn clear(&self) {
        for mut entry in self.stats.iter_mut() {
            entry.reset();
        }
    }

    /// Number of functions tracked.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Snapshot keyed by the decimal function id.
    pub fn dump_rows(&self) -> BTreeMap<String, DumpRow> {
        self.stats
            .iter()
            .map(|e| {
                let s = e.value();
                (
                    e.key().to_string(),
                    [s.mean(), s.stddev(), s.s0(), s.s1(), s.s2()],
                )
            })
            .collect()
    }

    /// Writes [`Self::dump_rows`] to `path` as pretty JSON and returns the row count.
    ///
    /// An empty function's stddev is infinite, which JSON cannot carry; it is
    /// written as `null`.
    pub fn dump(&self, path: &Path) -> Result<usize> {
        let rows = self.dump_rows();
        let json = serde_json::to_string_pretty(&rows).context("serializing statistics")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;

        Ok(rows.len())
    }
}

/// Client-side view of a parameter server.
pub trait StatsAggregator: Send + Sync {
    /// Merge one function's partial statistics; returns the merged value.
    fn update(
        &self,
        func_id: u64,
        partial: RunStats,
    ) -> impl Future<Output = Result<RunStats>> + Send;

    /// Merge several functions' partial statistics.
    fn update_all(
        &self,
        partials: HashMap<u64, RunStats>,
    ) -> impl Future<Output = Result<HashMap<u64, RunStats>>> + Send;

    fn get(&self, func_id: u64) -> impl Future<Output = Result<RunStats>> + Send;

    fn get_all(&self) -> impl Future<Output = Result<HashMap<u64, RunStats>>> + Send;

    /// Add to a function's cumulative anomaly count; returns the new count.
    fn add_abnormal(&self, func_id: u64, n: u64) -> impl Future<Output = Result<u64>> + Send;

    fn add_abnormal_all(
        &self,
        counts: HashMap<u64, u64>,
    ) -> impl Future<Output = Result<HashMap<u64, u64>>> + Send;

    fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<T: StatsAggregator> StatsAggregator for &T {
    fn update(
        &self,
        func_id: u64,
        partial: RunStats,
    ) -> impl Future<Output = Result<RunStats>> + Send {
        (**self).update(func_id, partial)
    }

    fn update_all(
        &self,
        partials: HashMap<u64, RunStats>,
    ) -> impl Future<Output = Result<HashMap<u64, RunStats>>> + Send {
        (**self).update_all(partials)
    }

    fn get(&self, func_id: u64) -> impl Future<Output = Result<RunStats>> + Send {
        (**self).get(func_id)
    }

    fn get_all(&self) -> impl Future<Output = Result<HashMap<u64, RunStats>>> + Send {
        (**self).get_all()
    }

    fn add_abnormal(&self, func_id: u64, n: u64) -> impl Future<Output = Result<u64>> + Send {
        (**self).add_abnormal(func_id, n)
    }

    fn add_abnormal_all(
        &self,
        counts: HashMap<u64, u64>,
    ) -> impl Future<Output = Result<HashMap<u64, u64>>> + Send {
        (**self).add_abnormal_all(counts)
    }

    fn clear(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).clear()
    }
}

/// Aggregator sharing the server's memory. Never fails.
#[derive(Debug, Clone)]
pub struct InProcess {
    server: Arc<ParameterServer>,
}

impl InProcess {
    pub fn new(server: Arc<ParameterServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<ParameterServer> {
        &self.server
    }
}

impl StatsAggregator for InProcess {
    async fn update(&self, func_id: u64, partial: RunStats) -> Result<RunStats> {
        Ok(self.server.update(func_id, partial))
    }

    async fn update_all(&self, partials: HashMap<u64, RunStats>) -> Result<HashMap<u64, RunStats>> {
        Ok(self.server.update_all(&partials))
    }

    async fn get(&self, func_id: u64) -> Result<RunStats> {
        Ok(self.server.get(func_id))
    }

    async fn get_all(&self) -> Result<HashMap<u64, RunStats>> {
        Ok(self.server.get_all())
    }

    async fn add_abnormal(&self, func_id: u64, n: u64) -> Result<u64> {
        Ok(self.server.add_abnormal(func_id, n))
    }

    async fn add_abnormal_all(&self, counts: HashMap<u64, u64>) -> Result<HashMap<u64, u64>> {
        Ok(self.server.add_abnormal_all(&counts))
    }

    async fn clear(&self) -> Result<()> {
        self.server.clear();
        Ok(())
    }
}
