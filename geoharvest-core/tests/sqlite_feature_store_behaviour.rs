//! Behavioural tests for the SQLite feature store and its spatial index.

use std::cell::RefCell;

use geo::{Coord, Rect};
use geoharvest_core::{
    CanonicalGeometry, IndexState, SourceId, SpatialIndexGuard, SpatialStore, SqliteFeatureStore,
};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

fn geometry(wkt: &str) -> CanonicalGeometry {
    CanonicalGeometry::from_wkt(wkt).expect("valid WKT")
}

#[fixture]
fn store() -> RefCell<SqliteFeatureStore> {
    RefCell::new(SqliteFeatureStore::open_in_memory().expect("open in-memory store"))
}

#[given("a feature store holding two parks for source 1")]
fn given_two_parks(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    store
        .borrow_mut()
        .insert_features(
            SourceId(1),
            &[
                geometry("POLYGON((10 52,10.01 52,10.01 52.01,10 52.01,10 52))"),
                geometry("POLYGON((11 53,11.01 53,11.01 53.01,11 53.01,11 53))"),
            ],
        )
        .expect("insert parks");
}

#[given("a feature store holding five features for source 3")]
fn given_five_features(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let points: Vec<_> = (0..5)
        .map(|offset| geometry(&format!("POINT({offset} 0)")))
        .collect();
    store
        .borrow_mut()
        .insert_features(SourceId(3), &points)
        .expect("insert source 3");
}

#[given("two staged features for source 4")]
fn given_two_staged(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let mut store = store.borrow_mut();
    store.truncate_staging().expect("truncate staging");
    store
        .stage_features(SourceId(4), &[geometry("POINT(7 7)"), geometry("POINT(8 8)")])
        .expect("stage source 4");
}

#[when("the spatial index is disabled")]
fn when_disabled(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    store
        .borrow_mut()
        .disable_spatial_index()
        .expect("disable index");
}

#[when("the spatial index is rebuilt")]
fn when_rebuilt(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    store
        .borrow_mut()
        .rebuild_spatial_index()
        .expect("rebuild index");
}

#[when("the staging area is prepared and merged under a disabled index")]
fn when_merged(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let mut store = store.borrow_mut();
    let discarded = store.prepare_staging().expect("prepare staging");
    assert_eq!(discarded, 0, "staged points are valid");
    let mut guard = SpatialIndexGuard::disable(&mut *store).expect("disable index");
    guard.merge_staging().expect("merge staging");
    guard.rebuild().expect("rebuild index");
}

#[then("envelope queries are refused")]
fn then_refused(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let bbox = Rect::new(Coord { x: 9.0, y: 51.0 }, Coord { x: 12.0, y: 54.0 });
    assert!(store.borrow().features_in_envelope(&bbox).is_err());
}

#[then("an envelope query around the first park returns one feature")]
fn then_one_feature(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let bbox = Rect::new(Coord { x: 9.99, y: 51.99 }, Coord { x: 10.02, y: 52.02 });
    let found = store
        .borrow()
        .features_in_envelope(&bbox)
        .expect("query envelope");
    assert_eq!(found.len(), 1, "expected only the first park");
    assert_eq!(found[0].source_id, SourceId(1));
}

#[then("source 3 still has five features")]
fn then_source_three(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let counts = store.borrow().feature_counts().expect("count features");
    assert_eq!(counts.get(&SourceId(3)), Some(&5));
}

#[then("source 4 has two features")]
fn then_source_four(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    let features = store
        .borrow()
        .features_for_source(SourceId(4))
        .expect("read source 4");
    assert_eq!(features, vec![geometry("POINT(7 7)"), geometry("POINT(8 8)")]);
}

#[then("the spatial index is enabled")]
fn then_enabled(#[from(store)] store: &RefCell<SqliteFeatureStore>) {
    assert_eq!(
        store.borrow().index_state().expect("read index state"),
        IndexState::Enabled
    );
}

#[scenario(path = "tests/features/sqlite_feature_store.feature", index = 0)]
fn scenario_index_lifecycle(store: RefCell<SqliteFeatureStore>) {
    let _ = store;
}

#[scenario(path = "tests/features/sqlite_feature_store.feature", index = 1)]
fn scenario_merge_preserves_sources(store: RefCell<SqliteFeatureStore>) {
    let _ = store;
}
