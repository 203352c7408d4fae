//! Behaviour-driven step definitions driving the incremental command.

use super::helpers::{Workspace, geometries, wfs_entry};
use super::*;
use crate::commands::{IncrementalOutcome, run_incremental_with, run_rebuild_with};
use geoharvest_core::{CanonicalGeometry, SpatialStore, SqliteFeatureStore};
use geoharvest_data::test_support::StubHarvester;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::{Value, json};
use std::cell::RefCell;

fn original(id: u64) -> Vec<CanonicalGeometry> {
    geometries(&[
        format!("POINT({id} 50)").as_str(),
        format!("POINT({id} 51)").as_str(),
    ])
}

fn refreshed() -> Vec<CanonicalGeometry> {
    geometries(&["POINT(20 60)"])
}

#[derive(Debug)]
struct IncrementalWorld {
    workspace: Workspace,
    catalogue: RefCell<Option<Utf8PathBuf>>,
    stdout: RefCell<Vec<u8>>,
    outcomes: RefCell<Vec<Result<IncrementalOutcome, CliError>>>,
}

impl IncrementalWorld {
    fn new() -> Self {
        Self {
            workspace: Workspace::new(),
            catalogue: RefCell::new(None),
            stdout: RefCell::new(Vec::new()),
            outcomes: RefCell::new(Vec::new()),
        }
    }

    fn catalogue(&self) -> Utf8PathBuf {
        self.catalogue
            .borrow()
            .clone()
            .expect("catalogue written")
    }

    fn run_phase(&self, phase: &str, source: Option<u64>, harvester: StubHarvester) {
        let mut argv = vec![
            "geoharvest".to_owned(),
            "incremental".to_owned(),
            phase.to_owned(),
            format!("--{ARG_DATABASE}"),
            self.workspace.database().into_string(),
        ];
        if let Some(id) = source {
            argv.extend([
                format!("--{ARG_CATALOGUE}"),
                self.catalogue().into_string(),
                format!("--{ARG_SOURCE_ID}"),
                id.to_string(),
            ]);
        }
        let parsed = Cli::try_parse_from(argv).map_err(CliError::from);
        let outcome = parsed.and_then(|cli| match cli.command {
            Command::Incremental(args) => {
                let config = args.into_config()?;
                let mut buffer = self.stdout.borrow_mut();
                buffer.clear();
                run_incremental_with(&config, harvester, &mut *buffer)
            }
            other => panic!("expected incremental command, found {other:?}"),
        });
        self.outcomes.borrow_mut().push(outcome);
    }

    fn features(&self, id: u64) -> Vec<CanonicalGeometry> {
        SqliteFeatureStore::open(&self.workspace.database())
            .expect("open store")
            .features_for_source(SourceId(id))
            .expect("read features")
    }
}

#[fixture]
fn world() -> IncrementalWorld {
    IncrementalWorld::new()
}

#[given("a catalogue listing sources 1 and 2")]
fn catalogue_lists_sources(#[from(world)] world: &IncrementalWorld) {
    let path = world
        .workspace
        .write_catalogue(&json!([wfs_entry(1), wfs_entry(2)]));
    world.catalogue.replace(Some(path));
}

#[given("a full rebuild has loaded both sources")]
fn full_rebuild_loaded(#[from(world)] world: &IncrementalWorld) {
    let config = RebuildConfig::try_from(RebuildArgs {
        database: Some(world.workspace.database()),
        catalogue: Some(world.catalogue()),
        ..RebuildArgs::default()
    })
    .expect("config should build");
    let harvester = StubHarvester::default()
        .with_features(SourceId(1), original(1))
        .with_features(SourceId(2), original(2));
    run_rebuild_with(&config, harvester, &mut Vec::new()).expect("rebuild should succeed");
}

#[when("I run the incremental start, harvest and finish phases for source 2")]
fn run_full_cycle(#[from(world)] world: &IncrementalWorld) {
    world.run_phase("start", None, StubHarvester::default());
    world.run_phase(
        "harvest",
        Some(2),
        StubHarvester::default().with_features(SourceId(2), refreshed()),
    );
    world.run_phase("finish", None, StubHarvester::default());
}

#[when("I run the incremental harvest phase for source 9")]
fn run_unknown_harvest(#[from(world)] world: &IncrementalWorld) {
    world.run_phase("harvest", Some(9), StubHarvester::default());
}

#[then("source 1 keeps its original features")]
fn source_one_untouched(#[from(world)] world: &IncrementalWorld) {
    for outcome in world.outcomes.borrow().iter() {
        if let Err(err) = outcome {
            panic!("phase failed: {err}");
        }
    }
    assert_eq!(world.features(1), original(1));
}

#[then("source 2 holds the refreshed features")]
fn source_two_refreshed(#[from(world)] world: &IncrementalWorld) {
    assert_eq!(world.features(2), refreshed());
}

#[then("the finish output names source 2")]
fn finish_output_names_source(#[from(world)] world: &IncrementalWorld) {
    let stdout = world.stdout.borrow();
    let output: Value = serde_json::from_slice(&stdout).expect("output should be JSON");
    assert_eq!(output["sources"], json!([2]));
    assert_eq!(output["copied"], 1);
    match world.outcomes.borrow().last() {
        Some(Ok(IncrementalOutcome::Merged(summary))) => {
            assert_eq!(summary.sources, vec![SourceId(2)]);
        }
        other => panic!("expected merge summary, found {other:?}"),
    }
}

#[then("the command fails because the source is unknown")]
fn fails_on_unknown_source(#[from(world)] world: &IncrementalWorld) {
    let outcomes = world.outcomes.borrow();
    match outcomes.last() {
        Some(Err(CliError::UnknownSource { id, .. })) => assert_eq!(*id, SourceId(9)),
        other => panic!("expected UnknownSource, found {other:?}"),
    }
    assert!(world.stdout.borrow().is_empty());
}

#[scenario(
    path = "tests/features/incremental_command.feature",
    name = "refreshing one source leaves the others untouched"
)]
fn incremental_refresh(#[from(world)] world: IncrementalWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/incremental_command.feature",
    name = "harvesting a source missing from the catalogue"
)]
fn incremental_unknown_source(#[from(world)] world: IncrementalWorld) {
    let _ = world;
}
