//! Command runners driven with scripted harvests and temporary stores.

use std::time::Duration;

use super::helpers::{Workspace, geometries, wfs_entry};
use super::*;
use crate::commands::{run_analyse, run_rebuild_with, run_summary, runtime};
use geoharvest_core::{SpatialStore, SqliteFeatureStore};
use geoharvest_data::test_support::StubHarvester;
use geoharvest_data::{FetchError, HarvestError};
use rstest::rstest;
use serde_json::{Value, json};

const PARK_A: &str = "POLYGON((10 53.5,10.001 53.5,10.001 53.501,10 53.501,10 53.5))";
const PARK_B: &str = "POLYGON((10.0012 53.5,10.0022 53.5,10.0022 53.501,10.0012 53.501,10.0012 53.5))";
const PARK_C: &str = "POLYGON((10.1 53.5,10.101 53.5,10.101 53.501,10.1 53.501,10.1 53.5))";

fn gateway_failure(id: u64) -> HarvestError {
    HarvestError::Fetch(FetchError::Network {
        url: format!("https://geo.example.org/geoserver/wfs?layer={id}"),
        message: "connection reset".to_owned(),
    })
}

fn rebuild_config(workspace: &Workspace, catalogue: Utf8PathBuf) -> RebuildConfig {
    RebuildConfig::try_from(RebuildArgs {
        database: Some(workspace.database()),
        catalogue: Some(catalogue),
        batch_size: Some(1),
        ..RebuildArgs::default()
    })
    .expect("config should build")
}

#[rstest]
fn rebuild_reports_each_source_and_isolates_failures() {
    let workspace = Workspace::new();
    let catalogue = workspace.write_catalogue(&json!([wfs_entry(1), wfs_entry(2)]));
    let harvester = StubHarvester::default()
        .with_features(SourceId(1), geometries(&["POINT(10 53.5)", "POINT(10.1 53.5)"]))
        .with_failure(SourceId(2), gateway_failure(2));
    let mut stdout = Vec::new();

    let report = run_rebuild_with(&rebuild_config(&workspace, catalogue), harvester, &mut stdout)
        .expect("rebuild should succeed");

    assert_eq!(report.feature_total(), 2);
    assert_eq!(report.failed().count(), 1);
    let output: Value = serde_json::from_slice(&stdout).expect("output should be JSON");
    assert_eq!(output["sources"][0]["status"], "harvested");
    assert_eq!(output["sources"][0]["features"], 2);
    assert_eq!(output["sources"][1]["source_id"], 2);
    assert_eq!(output["sources"][1]["status"], "failed");

    let store = SqliteFeatureStore::open(&workspace.database()).expect("reopen store");
    assert_eq!(
        store.features_for_source(SourceId(1)).expect("read").len(),
        2
    );
    assert!(store.features_for_source(SourceId(2)).expect("read").is_empty());
}

#[rstest]
fn rebuild_rejects_a_missing_catalogue_before_touching_the_store() {
    let workspace = Workspace::new();
    let config = rebuild_config(&workspace, workspace.path("absent.json"));
    let mut stdout = Vec::new();

    let err = run_rebuild_with(&config, StubHarvester::default(), &mut stdout)
        .expect_err("catalogue missing");

    assert!(matches!(err, CliError::ReadCatalogue { .. }), "got {err:?}");
    assert!(stdout.is_empty());
    assert!(!workspace.database().exists());
}

#[rstest]
#[case::text(OutputFormat::Text)]
#[case::json(OutputFormat::Json)]
fn summary_lists_failed_sources(#[case] format: OutputFormat) {
    let workspace = Workspace::new();
    let catalogue = workspace.write_catalogue(&json!([wfs_entry(1), wfs_entry(2)]));
    let harvester = StubHarvester::default()
        .with_features(SourceId(1), geometries(&["POINT(10 53.5)"]))
        .with_failure(SourceId(2), gateway_failure(2));
    run_rebuild_with(
        &rebuild_config(&workspace, catalogue),
        harvester,
        &mut Vec::new(),
    )
    .expect("rebuild should succeed");
    let config = SummaryConfig {
        database: workspace.database(),
        format,
    };
    let mut stdout = Vec::new();

    run_summary(&config, &mut stdout).expect("summary should succeed");

    let rendered = String::from_utf8(stdout).expect("stdout utf-8");
    match format {
        OutputFormat::Text => {
            assert!(rendered.starts_with("1 source(s) with unresolved harvest errors:"));
            assert!(rendered.contains("source 2"));
            assert!(rendered.contains("connection reset"));
        }
        OutputFormat::Json => {
            let output: Value = serde_json::from_str(&rendered).expect("output should be JSON");
            assert_eq!(output["unresolved"][0]["source_id"], 2);
        }
    }
}

#[rstest]
fn summary_of_a_clean_store() {
    let workspace = Workspace::new();
    let config = SummaryConfig {
        database: workspace.database(),
        format: OutputFormat::Text,
    };
    let mut stdout = Vec::new();

    run_summary(&config, &mut stdout).expect("summary should succeed");

    assert_eq!(
        String::from_utf8(stdout).expect("stdout utf-8"),
        "No unresolved harvest errors.\n"
    );
}

fn seed_parks(workspace: &Workspace) {
    let mut store = SqliteFeatureStore::open(&workspace.database()).expect("open store");
    store
        .insert_features(SourceId(5), &geometries(&[PARK_A, PARK_B, PARK_C]))
        .expect("seed parks");
}

#[rstest]
fn analyse_clusters_nearby_features() {
    let workspace = Workspace::new();
    seed_parks(&workspace);
    let config = AnalyseConfig {
        database: workspace.database(),
        catalogue: None,
        source_id: SourceId(5),
        threshold: 50.0,
    };
    let mut stdout = Vec::new();

    let report = run_analyse(&config, &mut stdout).expect("analysis should succeed");

    let memberships: Vec<Vec<usize>> = report
        .groups
        .iter()
        .map(|group| group.members.clone())
        .collect();
    assert_eq!(memberships, vec![vec![0, 1], vec![2]]);
    assert_eq!(report.features, 3);
    let coverage = report.coverage.expect("coverage defined");
    assert!(coverage > 0.0 && coverage < 1.0, "coverage {coverage}");
    assert_eq!(report.bbox_coverage, None);
    let output: Value = serde_json::from_slice(&stdout).expect("output should be JSON");
    assert_eq!(output["groups"][0]["members"], json!([0, 1]));
}

#[rstest]
fn analyse_measures_declared_bounding_box() {
    let workspace = Workspace::new();
    seed_parks(&workspace);
    let catalogue = workspace.write_catalogue(&json!([{
        "id": 5,
        "url": "https://geo.example.org/geoserver/wfs",
        "layer": "parks:areas",
        "bbox": {"min": {"x": 9.99, "y": 53.49}, "max": {"x": 10.11, "y": 53.51}}
    }]));
    let config = AnalyseConfig {
        database: workspace.database(),
        catalogue: Some(catalogue),
        source_id: SourceId(5),
        threshold: 50.0,
    };

    let report = run_analyse(&config, &mut Vec::new()).expect("analysis should succeed");

    let declared = report.bbox_coverage.expect("bbox coverage defined");
    let overall = report.coverage.expect("coverage defined");
    assert!(declared > 0.0 && declared < overall, "declared {declared}, overall {overall}");
}

#[rstest]
fn analyse_of_an_empty_source_has_no_coverage() {
    let workspace = Workspace::new();
    let config = AnalyseConfig {
        database: workspace.database(),
        catalogue: None,
        source_id: SourceId(8),
        threshold: 10.0,
    };

    let report = run_analyse(&config, &mut Vec::new()).expect("analysis should succeed");

    assert!(report.groups.is_empty());
    assert_eq!(report.coverage, None);
}

#[rstest]
fn command_runtime_drives_timers() {
    let elapsed = runtime().expect("runtime should build").block_on(async {
        let start = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        start.elapsed()
    });
    assert!(elapsed >= Duration::from_millis(5));
}
