//! Test helpers for temporary stores and catalogues.

use camino::{Utf8Path, Utf8PathBuf};
use geoharvest_core::CanonicalGeometry;
use serde_json::Value;
use tempfile::TempDir;

pub(super) fn write_utf8(path: &Utf8Path, contents: &[u8]) {
    std::fs::write(path, contents).expect("write file");
}

/// Temporary directory holding a store and a catalogue.
#[derive(Debug)]
pub(super) struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 workspace");
        Self { _tmp: tmp, root }
    }

    pub(super) fn database(&self) -> Utf8PathBuf {
        self.root.join("features.db")
    }

    pub(super) fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    pub(super) fn write_catalogue(&self, entries: &Value) -> Utf8PathBuf {
        let path = self.root.join("catalogue.json");
        let payload = serde_json::to_vec_pretty(entries).expect("serialize catalogue");
        write_utf8(&path, &payload);
        path
    }
}

/// Catalogue entry for a WFS source.
pub(super) fn wfs_entry(id: u64) -> Value {
    serde_json::json!({
        "id": id,
        "url": format!("https://geo.example.org/geoserver/wfs?layer={id}"),
        "layer": format!("parks:layer{id}")
    })
}

pub(super) fn geometries(wkt: &[&str]) -> Vec<CanonicalGeometry> {
    wkt.iter()
        .map(|text| CanonicalGeometry::from_wkt(text).expect("wkt"))
        .collect()
}
