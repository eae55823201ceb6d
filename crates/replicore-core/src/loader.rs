//! Snapshot population from catalog feeds.
//!
//! Per-site replica fetches are latency bound, so they fan out over a small
//! pool of scoped worker threads. Workers only fetch; every mutation of the
//! inventory happens on the calling thread after the pool has drained.

use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use replicore_error::{ReplicoreError, Result};
use replicore_types::{
    DatasetRecord, DatasetReplicaRecord, EmbedOutcome, GroupRecord, Inventory, SiteRecord,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SnapshotConfig;

/// One change to the replicas held at a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ReplicaUpdate {
    Upsert(DatasetReplicaRecord),
    Delete { dataset: String },
}

/// Remote catalog, queried incrementally with a "changed since" cursor.
///
/// `replicas_at` is called from worker threads.
pub trait CatalogFeed: Sync {
    fn sites(&self) -> Result<Vec<SiteRecord>>;

    fn groups(&self) -> Result<Vec<GroupRecord>>;

    /// Datasets changed since `since` (unix seconds), with their blocks.
    fn datasets(&self, since: i64) -> Result<Vec<DatasetRecord>>;

    /// Replica changes at `site` since `since`.
    fn replicas_at(&self, site: &str, since: i64) -> Result<Vec<ReplicaUpdate>>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds or the retries are spent.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    debug!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// What one refresh merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub sites: usize,
    pub groups: usize,
    pub datasets: usize,
    pub replicas_upserted: usize,
    pub replicas_deleted: usize,
    /// Entities the feed sent that could not be merged.
    pub rejected: usize,
    /// Sites whose replica fetch failed after retries.
    pub failed_sites: Vec<String>,
}

impl RefreshReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_sites.is_empty()
    }
}

/// Incremental inventory loader.
#[derive(Debug, Clone)]
pub struct InventoryLoader {
    workers: usize,
    retry: RetryPolicy,
    cursor: i64,
}

impl InventoryLoader {
    #[must_use]
    pub fn new(workers: usize, retry: RetryPolicy) -> Self {
        Self {
            workers: workers.max(1),
            retry,
            cursor: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self::new(
            config.workers,
            RetryPolicy {
                retries: config.retries,
                backoff: config.retry_backoff(),
            },
        )
    }

    /// Timestamp of the last refresh in which every fetch succeeded.
    #[must_use]
    pub const fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Pull changes from `feed` into `inventory`.
    ///
    /// A failure of the site, group or dataset listing aborts the refresh
    /// before anything is merged. Per-site replica failures are reported and
    /// leave the cursor where it was so the next refresh asks again.
    pub fn refresh(&mut self, inventory: &mut Inventory, feed: &dyn CatalogFeed, now: i64) -> Result<RefreshReport> {
        let since = self.cursor;
        let sites = self.retry.run("sites", || feed.sites())?;
        let groups = self.retry.run("groups", || feed.groups())?;
        let datasets = self.retry.run("datasets", || feed.datasets(since))?;

        inventory.set_clock(now);
        let mut report = RefreshReport::default();
        for record in &sites {
            count(inventory.embed_site(record).map(|(_, o)| o), &mut report.sites, &mut report.rejected, &record.name);
        }
        for record in &groups {
            count(inventory.embed_group(record).map(|(_, o)| o), &mut report.groups, &mut report.rejected, &record.name);
        }
        for record in &datasets {
            count(
                inventory.embed_dataset(record).map(|(_, o)| o),
                &mut report.datasets,
                &mut report.rejected,
                &record.name,
            );
        }

        let site_names: Vec<String> = inventory.sites().map(|(_, site)| site.name().to_owned()).collect();
        let fetched = self.fetch_replicas(feed, site_names, since);
        for (site, result) in fetched {
            match result {
                Ok(updates) => merge_site(inventory, &site, updates, &mut report),
                Err(err) => {
                    error!(site = %site, error = %err, "replica fetch failed");
                    report.failed_sites.push(site);
                }
            }
        }

        // time-gated partition conditions may have flipped since the last snapshot
        inventory.rebuild_partition_membership();
        if report.is_complete() {
            self.cursor = now;
        }
        info!(
            sites = report.sites,
            datasets = report.datasets,
            upserted = report.replicas_upserted,
            deleted = report.replicas_deleted,
            rejected = report.rejected,
            failed_sites = report.failed_sites.len(),
            cursor = self.cursor,
            "inventory refreshed"
        );
        Ok(report)
    }

    /// Fetch replica updates for every site over the worker pool.
    /// Results come back sorted by site name.
    fn fetch_replicas(
        &self,
        feed: &dyn CatalogFeed,
        sites: Vec<String>,
        since: i64,
    ) -> Vec<(String, Result<Vec<ReplicaUpdate>>)> {
        let workers = self.workers.min(sites.len());
        let queue = Mutex::new(sites);
        let results = Mutex::new(Vec::new());
        let retry = self.retry;
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(site) = queue.lock().pop() else {
                            break;
                        };
                        let result = retry.run(&site, || feed.replicas_at(&site, since));
                        results.lock().push((site, result));
                    }
                });
            }
        });
        let mut results = results.into_inner();
        results.sort_by(|(a, _), (b, _)| a.cmp(b));
        results
    }
}

fn merge_site(inventory: &mut Inventory, site: &str, updates: Vec<ReplicaUpdate>, report: &mut RefreshReport) {
    for update in updates {
        match update {
            ReplicaUpdate::Upsert(record) => {
                if record.site != site {
                    warn!(site, record_site = %record.site, dataset = %record.dataset, "replica for another site ignored");
                    report.rejected += 1;
                    continue;
                }
                let label = format!("{}@{}", record.dataset, record.site);
                count(
                    inventory.embed_dataset_replica(&record).map(|(_, o)| o),
                    &mut report.replicas_upserted,
                    &mut report.rejected,
                    &label,
                );
            }
            ReplicaUpdate::Delete { dataset } => match inventory.delete_dataset_replica(&dataset, site) {
                Ok(Some(_)) => report.replicas_deleted += 1,
                Ok(None) => debug!(site, dataset = %dataset, "deleted replica was not known"),
                Err(err) => {
                    warn!(site, dataset = %dataset, error = %err, "replica deletion rejected");
                    report.rejected += 1;
                }
            },
        }
    }
}

fn count(outcome: Result<EmbedOutcome>, changed: &mut usize, rejected: &mut usize, name: &str) {
    match outcome {
        Ok(EmbedOutcome::Created | EmbedOutcome::Updated) => *changed += 1,
        Ok(EmbedOutcome::Unchanged) => {}
        Err(err) => {
            warn!(name, error = %err, "feed record rejected");
            *rejected += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Tracks the age of the last good snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotGuard {
    max_staleness_secs: u64,
    last_success: Option<i64>,
}

impl SnapshotGuard {
    #[must_use]
    pub const fn new(max_staleness_secs: u64) -> Self {
        Self {
            max_staleness_secs,
            last_success: None,
        }
    }

    #[must_use]
    pub const fn last_success(&self) -> Option<i64> {
        self.last_success
    }

    pub fn record_success(&mut self, now: i64) {
        self.last_success = Some(now);
    }

    /// Age of the snapshot at `now`, or `StaleSnapshot` past the threshold.
    /// A snapshot that never loaded is infinitely stale.
    pub fn check(&self, now: i64) -> Result<u64> {
        let age = self
            .last_success
            .map_or(u64::MAX, |at| u64::try_from(now.saturating_sub(at)).unwrap_or(0));
        if age > self.max_staleness_secs {
            return Err(ReplicoreError::StaleSnapshot {
                age_secs: age,
                max_staleness_secs: self.max_staleness_secs,
            });
        }
        Ok(age)
    }

    /// Fold a refresh outcome into the guard.
    ///
    /// A complete refresh renews the snapshot. A failed or partial one is
    /// tolerated while the previous snapshot is fresh enough.
    pub fn observe(&mut self, outcome: Result<RefreshReport>, now: i64) -> Result<Option<RefreshReport>> {
        match outcome {
            Ok(report) if report.is_complete() => {
                self.record_success(now);
                Ok(Some(report))
            }
            Ok(report) => {
                let age = self.check(now)?;
                warn!(age_secs = age, failed_sites = report.failed_sites.len(), "partial refresh, using previous snapshot");
                Ok(Some(report))
            }
            Err(err) => {
                let age = self.check(now)?;
                warn!(age_secs = age, error = %err, "refresh failed, using previous snapshot");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use replicore_types::{BlockName, BlockRecord, BlockReplicaRecord};

    use super::*;

    #[derive(Default)]
    struct FakeFeed {
        sites: Vec<SiteRecord>,
        datasets: Vec<DatasetRecord>,
        replicas: HashMap<String, Vec<ReplicaUpdate>>,
        /// Failures to inject per site before succeeding.
        flaky: HashMap<String, u32>,
        calls: AtomicU32,
    }

    impl CatalogFeed for FakeFeed {
        fn sites(&self) -> Result<Vec<SiteRecord>> {
            Ok(self.sites.clone())
        }

        fn groups(&self) -> Result<Vec<GroupRecord>> {
            Ok(vec![GroupRecord {
                name: "AnalysisOps".to_owned(),
                olevel: replicore_types::OwnershipLevel::Block,
            }])
        }

        fn datasets(&self, _since: i64) -> Result<Vec<DatasetRecord>> {
            Ok(self.datasets.clone())
        }

        fn replicas_at(&self, site: &str, _since: i64) -> Result<Vec<ReplicaUpdate>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(failures) = self.flaky.get(site) {
                if call < *failures {
                    return Err(ReplicoreError::feed(format!("{site} timed out")));
                }
            }
            Ok(self.replicas.get(site).cloned().unwrap_or_default())
        }
    }

    fn site(name: &str) -> SiteRecord {
        toml::from_str(&format!("name = \"{name}\"")).unwrap()
    }

    fn dataset(name: &str, block: BlockName) -> DatasetRecord {
        let mut record: DatasetRecord = toml::from_str(&format!("name = \"{name}\"\nsize = 10")).unwrap();
        let block: BlockRecord = toml::from_str(&format!("name = \"{}\"\nsize = 10", block.to_hyphenated())).unwrap();
        record.blocks = Some(vec![block]);
        record
    }

    fn replica(dataset: &str, site: &str, block: BlockName) -> ReplicaUpdate {
        ReplicaUpdate::Upsert(DatasetReplicaRecord {
            dataset: dataset.to_owned(),
            site: site.to_owned(),
            is_complete: true,
            is_custodial: false,
            last_block_created: 0,
            block_replicas: vec![BlockReplicaRecord {
                block,
                group: Some("AnalysisOps".to_owned()),
                is_complete: true,
                is_custodial: false,
                size: 10,
                last_update: 0,
            }],
        })
    }

    fn feed() -> FakeFeed {
        let block = BlockName::from_bytes([1; 16]);
        let mut feed = FakeFeed {
            sites: vec![site("T2_US_MIT"), site("T2_DE_DESY"), site("T1_IT_CNAF_Disk")],
            datasets: vec![dataset("/A/B/RAW", block)],
            ..FakeFeed::default()
        };
        for name in ["T2_US_MIT", "T2_DE_DESY"] {
            feed.replicas
                .insert(name.to_owned(), vec![replica("/A/B/RAW", name, block)]);
        }
        feed
    }

    #[test]
    fn test_refresh_merges_all_sites() {
        let feed = feed();
        let mut inventory = Inventory::new();
        let mut loader = InventoryLoader::new(2, RetryPolicy::none());
        let report = loader.refresh(&mut inventory, &feed, 1_000).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.sites, 3);
        assert_eq!(report.groups, 1);
        assert_eq!(report.datasets, 1);
        assert_eq!(report.replicas_upserted, 2);
        assert_eq!(report.rejected, 0);
        assert_eq!(loader.cursor(), 1_000);
        let (_, _, _, dataset_replicas, block_replicas) = inventory.counts();
        assert_eq!((dataset_replicas, block_replicas), (2, 2));

        // Same content again: nothing changes.
        let again = loader.refresh(&mut inventory, &feed, 2_000).unwrap();
        assert_eq!(again.sites + again.datasets + again.replicas_upserted, 0);
    }

    #[test]
    fn test_failed_site_keeps_cursor_and_merges_others() {
        let mut feed = feed();
        feed.flaky.insert("T2_US_MIT".to_owned(), u32::MAX);
        let mut inventory = Inventory::new();
        let mut loader = InventoryLoader::new(4, RetryPolicy::none());
        let report = loader.refresh(&mut inventory, &feed, 1_000).unwrap();
        assert_eq!(report.failed_sites, vec!["T2_US_MIT".to_owned()]);
        assert_eq!(report.replicas_upserted, 1);
        assert_eq!(loader.cursor(), 0);
    }

    #[test]
    fn test_retry_recovers_transient_failure() {
        let mut feed = feed();
        feed.sites.truncate(1);
        feed.flaky.insert("T2_US_MIT".to_owned(), 2);
        let mut inventory = Inventory::new();
        let mut loader = InventoryLoader::new(
            1,
            RetryPolicy {
                retries: 3,
                backoff: Duration::from_millis(1),
            },
        );
        let report = loader.refresh(&mut inventory, &feed, 50).unwrap();
        assert!(report.is_complete());
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delete_update_and_misrouted_record() {
        let block = BlockName::from_bytes([1; 16]);
        let mut feed = feed();
        let mut inventory = Inventory::new();
        let mut loader = InventoryLoader::new(2, RetryPolicy::none());
        loader.refresh(&mut inventory, &feed, 10).unwrap();

        feed.replicas.insert(
            "T2_US_MIT".to_owned(),
            vec![
                ReplicaUpdate::Delete {
                    dataset: "/A/B/RAW".to_owned(),
                },
                replica("/A/B/RAW", "T2_DE_DESY", block),
            ],
        );
        feed.replicas.remove("T2_DE_DESY");
        let report = loader.refresh(&mut inventory, &feed, 20).unwrap();
        assert_eq!(report.replicas_deleted, 1);
        assert_eq!(report.rejected, 1);
        let mit = inventory.find_site("T2_US_MIT").unwrap();
        assert_eq!(inventory.require_site(mit).unwrap().num_block_replicas(), 0);
    }

    #[test]
    fn test_snapshot_guard() {
        let mut guard = SnapshotGuard::new(100);
        assert!(matches!(guard.check(0), Err(ReplicoreError::StaleSnapshot { .. })));
        guard.record_success(1_000);
        assert_eq!(guard.check(1_050).unwrap(), 50);

        let failed = guard.observe(Err(ReplicoreError::feed("down")), 1_080).unwrap();
        assert!(failed.is_none());
        assert_eq!(guard.last_success(), Some(1_000));

        let partial = RefreshReport {
            failed_sites: vec!["T2_US_MIT".to_owned()],
            ..RefreshReport::default()
        };
        assert!(matches!(
            guard.observe(Ok(partial), 1_200),
            Err(ReplicoreError::StaleSnapshot { age_secs: 200, max_staleness_secs: 100 })
        ));

        assert!(guard.observe(Ok(RefreshReport::default()), 1_300).unwrap().is_some());
        assert_eq!(guard.check(1_300).unwrap(), 0);
    }
}
