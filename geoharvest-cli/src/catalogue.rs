//! Source catalogue loading.
//!
//! A catalogue is a JSON array of sources:
//!
//! ```json
//! [
//!   {"id": 1, "url": "https://maps.example.org/arcgis/rest/services/Parks/MapServer", "layer": "Parks"},
//!   {"id": 2, "url": "https://geo.example.org/geoserver/wfs", "layer": "parks:trees",
//!    "bbox": {"min": {"x": 9.9, "y": 53.5}, "max": {"x": 10.1, "y": 53.6}}}
//! ]
//! ```

use std::collections::BTreeSet;
use std::io::Read;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::File};
use geoharvest_core::{Source, SourceId};

use crate::CliError;

/// Read and validate the catalogue at `path`.
///
/// Entries keep their file order, which is the harvest order.
pub(crate) fn load_catalogue(path: &Utf8Path) -> Result<Vec<Source>, CliError> {
    let read_error = |source| CliError::ReadCatalogue {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open_ambient(path, ambient_authority()).map_err(read_error)?;
    let mut text = String::new();
    file.read_to_string(&mut text).map_err(read_error)?;
    let sources: Vec<Source> =
        serde_json::from_str(&text).map_err(|source| CliError::ParseCatalogue {
            path: path.to_path_buf(),
            source,
        })?;

    let mut seen = BTreeSet::new();
    for entry in &sources {
        Source::new(entry.id, entry.url.as_str(), entry.layer.as_str()).map_err(|source| {
            CliError::InvalidSource {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if !seen.insert(entry.id) {
            return Err(CliError::DuplicateSource {
                path: path.to_path_buf(),
                id: entry.id,
            });
        }
    }
    Ok(sources)
}

/// Find source `id` in a loaded catalogue.
pub(crate) fn find_source(
    sources: Vec<Source>,
    id: SourceId,
    path: &Utf8Path,
) -> Result<Source, CliError> {
    sources
        .into_iter()
        .find(|source| source.id == id)
        .ok_or_else(|| CliError::UnknownSource {
            path: path.to_path_buf(),
            id,
        })
}
