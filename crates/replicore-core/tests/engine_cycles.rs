//! End-to-end cycles through [`Engine`]: load a configuration, refresh from a
//! catalog feed, record demand, then run retention and placement.

use std::collections::HashMap;
use std::sync::Once;

use rand::SeedableRng;
use rand::rngs::StdRng;
use replicore_core::{
    CancelToken, CatalogFeed, Config, DropReason, Engine, MemorySink, QuotaAmount, QuotaConfig, QuotaSource,
    ReplicaUpdate,
};
use replicore_error::{ReplicoreError, Result};
use replicore_policy::{Decision, PlacementRequest, RequestItem, RequestProducer};
use replicore_rules::{REQUEST_WEIGHT_ATTR, VariableRegistry};
use replicore_types::{AttrValue, DatasetRecord, DatasetStatus, GroupRecord, Inventory, SiteRecord};
use serde_json::json;

const CONFIG: &str = r#"
[[partitions]]
name = "AnalysisOps"
condition = "blockreplica.owner == AnalysisOps"

[[partitions]]
name = "DataOps"
condition = "blockreplica.owner == DataOps"

[[partitions]]
name = "Physics"
subpartitions = ["AnalysisOps", "DataOps"]

[[quotas]]
site = "*"
partition = "AnalysisOps"
quota = 200

[[quotas]]
site = "T2_DE_DESY"
partition = "AnalysisOps"
quota = 10

[[quotas]]
site = "*"
partition = "DataOps"
quota = "1 kB"

[retention]
name = "analysis"
partition = "AnalysisOps"
order = ["decreasing dataset.size"]

[[retention.policies]]
name = "protect_incomplete"
condition = "not replica.is_complete"
decision = "protect"
reason = "transfer in progress"

[[retention.policies]]
name = "keep_requested"
condition = "dataset.request_weight > 5"
decision = "keep"
reason = "requested"

[[retention.policies]]
name = "delete_aod"
condition = "dataset.name == */AOD"
decision = "delete"
reason = "analysis cleanup"

[placement]
partition = "AnalysisOps"
occupancy_ceiling = 0.9

[[placement.producers]]
name = "wishlist"

[snapshot]
workers = 2
max_staleness_secs = 3600
retries = 0
retry_backoff_ms = 1
"#;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

fn block(n: u8) -> String {
    format!("{n:02x}{}", "0".repeat(30))
}

struct StaticFeed {
    sites: Vec<SiteRecord>,
    groups: Vec<GroupRecord>,
    datasets: Vec<DatasetRecord>,
    replicas: HashMap<String, Vec<ReplicaUpdate>>,
}

impl CatalogFeed for StaticFeed {
    fn sites(&self) -> Result<Vec<SiteRecord>> {
        Ok(self.sites.clone())
    }

    fn groups(&self) -> Result<Vec<GroupRecord>> {
        Ok(self.groups.clone())
    }

    fn datasets(&self, _since: i64) -> Result<Vec<DatasetRecord>> {
        Ok(self.datasets.clone())
    }

    fn replicas_at(&self, site: &str, _since: i64) -> Result<Vec<ReplicaUpdate>> {
        Ok(self.replicas.get(site).cloned().unwrap_or_default())
    }
}

struct DownFeed;

impl CatalogFeed for DownFeed {
    fn sites(&self) -> Result<Vec<SiteRecord>> {
        Err(ReplicoreError::feed("catalog unreachable"))
    }

    fn groups(&self) -> Result<Vec<GroupRecord>> {
        Err(ReplicoreError::feed("catalog unreachable"))
    }

    fn datasets(&self, _since: i64) -> Result<Vec<DatasetRecord>> {
        Err(ReplicoreError::feed("catalog unreachable"))
    }

    fn replicas_at(&self, _site: &str, _since: i64) -> Result<Vec<ReplicaUpdate>> {
        Err(ReplicoreError::feed("catalog unreachable"))
    }
}

fn dataset(name: &str, n: u8, size: u64) -> serde_json::Value {
    json!({
        "name": name,
        "size": size,
        "blocks": [{ "name": block(n), "size": size }],
    })
}

fn replica(dataset: &str, site: &str, n: u8, size: u64, group: &str, complete: bool) -> serde_json::Value {
    json!({
        "op": "upsert",
        "dataset": dataset,
        "site": site,
        "is_complete": complete,
        "block_replicas": [{
            "block": block(n),
            "group": group,
            "is_complete": complete,
            "size": size,
        }],
    })
}

fn feed() -> StaticFeed {
    let sites = json!([
        { "name": "T2_US_MIT", "status": "ready" },
        { "name": "T2_DE_DESY", "status": "ready" },
    ]);
    let groups = json!([{ "name": "AnalysisOps" }, { "name": "DataOps" }]);
    let datasets = json!([
        dataset("/A/x/AOD", 1, 10),
        dataset("/B/x/AOD", 2, 30),
        dataset("/C/x/RAW", 3, 40),
        dataset("/D/x/AOD", 4, 50),
    ]);
    let mit = json!([
        replica("/A/x/AOD", "T2_US_MIT", 1, 10, "AnalysisOps", true),
        replica("/B/x/AOD", "T2_US_MIT", 2, 30, "AnalysisOps", true),
        replica("/C/x/RAW", "T2_US_MIT", 3, 40, "DataOps", true),
        replica("/D/x/AOD", "T2_US_MIT", 4, 50, "AnalysisOps", true),
    ]);
    let desy = json!([replica("/A/x/AOD", "T2_DE_DESY", 1, 10, "AnalysisOps", false)]);

    let mut replicas = HashMap::new();
    replicas.insert("T2_US_MIT".to_owned(), serde_json::from_value(mit).unwrap());
    replicas.insert("T2_DE_DESY".to_owned(), serde_json::from_value(desy).unwrap());
    StaticFeed {
        sites: serde_json::from_value(sites).unwrap(),
        groups: serde_json::from_value(groups).unwrap(),
        datasets: serde_json::from_value(datasets).unwrap(),
        replicas,
    }
}

struct Wishlist;

impl RequestProducer for Wishlist {
    fn name(&self) -> &str {
        "wishlist"
    }

    fn requests(&mut self, _inventory: &Inventory) -> Result<Vec<PlacementRequest>> {
        Ok(["T2_US_MIT", "T2_DE_DESY", "T3_XX_Nowhere"]
            .into_iter()
            .map(|site| PlacementRequest::new(RequestItem::Dataset("/E/x/AOD".to_owned()), site))
            .collect())
    }
}

struct TightQuotas;

impl QuotaSource for TightQuotas {
    fn quotas(&self) -> Result<Vec<QuotaConfig>> {
        Ok(vec![QuotaConfig {
            site: "*".to_owned(),
            partition: "AnalysisOps".to_owned(),
            quota: QuotaAmount::Bytes(50),
        }])
    }
}

fn engine() -> Engine {
    init_tracing();
    let config = Config::from_toml_str(CONFIG).unwrap();
    Engine::new(config, &VariableRegistry::standard(), vec![Box::new(Wishlist)]).unwrap()
}

#[test]
fn test_cycles_refuse_to_run_before_first_refresh() {
    let mut engine = engine();
    let err = engine
        .run_retention(1_000, &CancelToken::new(), &mut MemorySink::default())
        .unwrap_err();
    assert!(matches!(err, ReplicoreError::StaleSnapshot { .. }));
    let err = engine
        .run_placement(1_000, &mut StdRng::seed_from_u64(1), &mut Vec::new())
        .unwrap_err();
    assert!(matches!(err, ReplicoreError::StaleSnapshot { .. }));
}

#[test]
fn test_refresh_installs_quotas_for_new_sites() {
    let mut engine = engine();
    let report = engine.refresh(&feed(), 1_000).unwrap().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.replicas_upserted, 5);

    let inventory = engine.inventory();
    let mit = inventory.find_site("T2_US_MIT").unwrap();
    let desy = inventory.find_site("T2_DE_DESY").unwrap();
    let analysis = inventory.find_partition("AnalysisOps").unwrap();
    let physics = inventory.find_partition("Physics").unwrap();
    assert_eq!(inventory.quota(mit, analysis).unwrap(), 200);
    assert_eq!(inventory.quota(desy, analysis).unwrap(), 10);
    assert_eq!(inventory.quota(mit, physics).unwrap(), 1_200);
    assert_eq!(inventory.occupied_bytes(mit, analysis, false).unwrap(), 90);
}

#[test]
fn test_retention_cycle_end_to_end() {
    let mut engine = engine();
    engine.refresh(&feed(), 1_000).unwrap();
    let requested = engine.inventory().find_dataset("/A/x/AOD").unwrap();
    engine
        .inventory_mut()
        .set_dataset_attr(requested, REQUEST_WEIGHT_ATTR, AttrValue::Number(10.0))
        .unwrap();

    let mut sink = MemorySink::default();
    let report = engine.run_retention(2_000, &CancelToken::new(), &mut sink).unwrap();
    assert!(report.failures.is_empty());

    // /C/x/RAW belongs to DataOps and is out of scope.
    assert_eq!(report.records.len(), 4);
    let decision_of = |label: &str| {
        report
            .records
            .iter()
            .find(|record| record.label == label)
            .map(|record| (record.decision, record.policy.clone()))
            .unwrap()
    };
    assert_eq!(
        decision_of("/A/x/AOD@T2_DE_DESY"),
        (Decision::Protect, Some("protect_incomplete".to_owned()))
    );
    assert_eq!(
        decision_of("/A/x/AOD@T2_US_MIT"),
        (Decision::Keep, Some("keep_requested".to_owned()))
    );
    let deletes: Vec<_> = report.deletion_candidates().map(|r| r.label.as_str()).collect();
    assert_eq!(deletes, ["/D/x/AOD@T2_US_MIT", "/B/x/AOD@T2_US_MIT"]);
    assert_eq!(sink.commits, vec![report.records.clone()]);
}

#[test]
fn test_placement_cycle_end_to_end() {
    let mut engine = engine();
    engine.refresh(&feed(), 1_000).unwrap();

    let mut submitted = Vec::new();
    let report = engine
        .run_placement(2_000, &mut StdRng::seed_from_u64(7), &mut submitted)
        .unwrap();
    let destinations: Vec<_> = submitted.iter().map(|r| r.destination.as_str()).collect();
    assert_eq!(destinations, ["T2_US_MIT"]);
    assert_eq!(report.dropped.len(), 2);
    assert!(report
        .dropped
        .iter()
        .any(|(request, reason)| request.destination == "T2_DE_DESY"
            && matches!(reason, DropReason::Full { occupancy } if *occupancy >= 1.0)));
    assert!(report
        .dropped
        .iter()
        .any(|(_, reason)| *reason == DropReason::UnknownSite));
}

#[test]
fn test_quota_source_replaces_static_quotas() {
    let mut engine = engine().with_quota_source(Box::new(TightQuotas));
    engine.refresh(&feed(), 1_000).unwrap();

    let mut submitted = Vec::new();
    engine
        .run_placement(2_000, &mut StdRng::seed_from_u64(7), &mut submitted)
        .unwrap();
    // MIT holds 90 bytes against 50; DESY's per-site override is gone.
    let destinations: Vec<_> = submitted.iter().map(|r| r.destination.as_str()).collect();
    assert_eq!(destinations, ["T2_DE_DESY"]);
}

#[test]
fn test_failed_refresh_tolerated_until_stale() {
    let mut engine = engine();
    engine.refresh(&feed(), 1_000).unwrap();

    assert_eq!(engine.refresh(&DownFeed, 2_000).unwrap(), None);
    assert_eq!(engine.snapshot().last_success(), Some(1_000));
    engine
        .run_retention(2_000, &CancelToken::new(), &mut MemorySink::default())
        .unwrap();

    let err = engine.refresh(&DownFeed, 1_000 + 3_601).unwrap_err();
    assert!(matches!(err, ReplicoreError::StaleSnapshot { .. }));
    let err = engine
        .run_retention(1_000 + 3_601, &CancelToken::new(), &mut MemorySink::default())
        .unwrap_err();
    assert!(matches!(err, ReplicoreError::StaleSnapshot { .. }));
}

#[test]
fn test_dataset_change_moves_partition_membership_across_refreshes() {
    init_tracing();
    let text = r#"
[[partitions]]
name = "Current"
condition = "dataset.status == valid"

[[quotas]]
site = "*"
partition = "Current"
quota = 1000
"#;
    let config = Config::from_toml_str(text).unwrap();
    let mut engine = Engine::new(config, &VariableRegistry::standard(), Vec::new()).unwrap();

    let mut catalog = feed();
    for record in &mut catalog.datasets {
        record.status = DatasetStatus::Valid;
    }
    engine.refresh(&catalog, 1_000).unwrap();
    let mit = engine.inventory().find_site("T2_US_MIT").unwrap();
    let current = engine.inventory().find_partition("Current").unwrap();
    assert_eq!(engine.inventory().occupied_bytes(mit, current, false).unwrap(), 130);
    assert_eq!(engine.inventory().clock(), Some(1_000));

    for record in &mut catalog.datasets {
        if record.name == "/D/x/AOD" {
            record.status = DatasetStatus::Deprecated;
        }
    }
    engine.refresh(&catalog, 2_000).unwrap();
    assert_eq!(engine.inventory().occupied_bytes(mit, current, false).unwrap(), 80);
    assert_eq!(engine.inventory().clock(), Some(2_000));
}

#[test]
fn test_rejected_quota_source_fails_the_refresh() {
    struct BadQuotas;

    impl QuotaSource for BadQuotas {
        fn quotas(&self) -> Result<Vec<QuotaConfig>> {
            Ok(vec![QuotaConfig {
                site: "*".to_owned(),
                partition: "Physics".to_owned(),
                quota: QuotaAmount::Bytes(50),
            }])
        }
    }

    let mut engine = engine().with_quota_source(Box::new(BadQuotas));
    let err = engine.refresh(&feed(), 1_000).unwrap_err();
    assert!(matches!(err, ReplicoreError::StaleSnapshot { .. }), "{err}");
    assert_eq!(engine.snapshot().last_success(), None);
}
