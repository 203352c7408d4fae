//! Conversion of raw GeoJSON geometries into [`CanonicalGeometry`].
//!
//! Records without a geometry, or whose coordinates are empty, normalise to
//! `None` and are dropped before storage. An unsupported geometry kind or a
//! malformed coordinate structure fails the whole harvest of the source.

use geo::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use geoharvest_core::{CanonicalGeometry, GeometryError, GeometryKind};
use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::service::RawGeometryRecord;

/// Offending payloads are kept up to this many bytes.
const MAX_PAYLOAD_BYTES: usize = 256;

/// Failure to decode a raw geometry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeometryDecodeError {
    /// The geometry declared a kind outside the supported set.
    #[error("unsupported geometry kind {kind:?} in {payload}")]
    Unsupported {
        /// Declared `type` member.
        kind: String,
        /// Offending geometry, truncated.
        payload: String,
    },
    /// The geometry structure could not be read.
    #[error("malformed geometry ({reason}) in {payload}")]
    Malformed {
        /// What was wrong.
        reason: String,
        /// Offending geometry, truncated.
        payload: String,
    },
}

/// Normalise one record.
///
/// Returns `Ok(None)` for a null or absent geometry and for geometries whose
/// coordinate arrays are empty. Positions keep their first two ordinates;
/// elevation and measure values are dropped.
///
/// # Examples
///
/// ```
/// use geoharvest_core::GeometryKind;
/// use geoharvest_data::normalize::normalize;
/// use geoharvest_data::service::RawGeometryRecord;
/// use serde_json::json;
///
/// let record = RawGeometryRecord {
///     geometry: Some(json!({"type": "Point", "coordinates": [10.0, 52.0, 35.5]})),
///     properties: None,
/// };
/// let geometry = normalize(&record).expect("decodes").expect("not null");
/// assert_eq!(geometry.kind(), GeometryKind::Point);
/// assert_eq!(geometry.to_wkt(), "POINT(10 52)");
/// ```
pub fn normalize(
    record: &RawGeometryRecord,
) -> Result<Option<CanonicalGeometry>, GeometryDecodeError> {
    match record.geometry.as_ref() {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(value).map_err(|failure| failure.into_error(value)),
    }
}

/// Normalise every record, dropping those without geometry.
///
/// Fails on the first record that cannot be decoded.
pub fn normalize_all(
    records: &[RawGeometryRecord],
) -> Result<Vec<CanonicalGeometry>, GeometryDecodeError> {
    let mut geometries = Vec::with_capacity(records.len());
    for record in records {
        if let Some(geometry) = normalize(record)? {
            geometries.push(geometry);
        }
    }
    let dropped = records.len() - geometries.len();
    if dropped > 0 {
        debug!("dropped {dropped} records without geometry");
    }
    Ok(geometries)
}

enum Failure {
    Unsupported(String),
    Malformed(String),
}

impl Failure {
    fn into_error(self, value: &Value) -> GeometryDecodeError {
        let payload = payload_excerpt(value);
        match self {
            Self::Unsupported(kind) => GeometryDecodeError::Unsupported { kind, payload },
            Self::Malformed(reason) => GeometryDecodeError::Malformed { reason, payload },
        }
    }
}

fn malformed(reason: impl Into<String>) -> Failure {
    Failure::Malformed(reason.into())
}

fn decode(value: &Value) -> Result<Option<CanonicalGeometry>, Failure> {
    let object = value
        .as_object()
        .ok_or_else(|| malformed("geometry is not an object"))?;
    let name = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing type"))?;
    let kind = GeometryKind::from_name(name).ok_or_else(|| Failure::Unsupported(name.to_owned()))?;
    let coordinates = match object.get("coordinates") {
        None => return Err(malformed("missing coordinates")),
        Some(Value::Null) => return Ok(None),
        Some(coordinates) => coordinates,
    };

    let geometry = match kind {
        GeometryKind::Point => {
            if array(coordinates)?.is_empty() {
                return Ok(None);
            }
            Geometry::Point(Point(position(coordinates)?))
        }
        GeometryKind::MultiPoint => Geometry::MultiPoint(MultiPoint(
            positions(coordinates)?.into_iter().map(Point).collect(),
        )),
        GeometryKind::LineString => Geometry::LineString(LineString(positions(coordinates)?)),
        GeometryKind::MultiLineString => Geometry::MultiLineString(MultiLineString(
            array(coordinates)?
                .iter()
                .map(|line| positions(line).map(LineString))
                .filter(|line| !matches!(line, Ok(line) if line.0.is_empty()))
                .collect::<Result<_, _>>()?,
        )),
        GeometryKind::Polygon => match polygon(coordinates)? {
            Some(polygon) => Geometry::Polygon(polygon),
            None => return Ok(None),
        },
        GeometryKind::MultiPolygon => {
            let mut polygons = Vec::new();
            for member in array(coordinates)? {
                if let Some(polygon) = polygon(member)? {
                    polygons.push(polygon);
                }
            }
            Geometry::MultiPolygon(MultiPolygon(polygons))
        }
    };

    match CanonicalGeometry::new(geometry) {
        Ok(geometry) => Ok(Some(geometry)),
        Err(GeometryError::Empty) => Ok(None),
        Err(err) => Err(malformed(err.to_string())),
    }
}

fn array(value: &Value) -> Result<&[Value], Failure> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| malformed("expected an array"))
}

fn position(value: &Value) -> Result<Coord<f64>, Failure> {
    match array(value)? {
        [x, y, ..] => {
            let ordinate = |v: &Value| {
                v.as_f64()
                    .ok_or_else(|| malformed(format!("non-numeric ordinate {v}")))
            };
            Ok(Coord {
                x: ordinate(x)?,
                y: ordinate(y)?,
            })
        }
        short => Err(malformed(format!(
            "position has {} ordinates; at least 2 are required",
            short.len()
        ))),
    }
}

fn positions(value: &Value) -> Result<Vec<Coord<f64>>, Failure> {
    array(value)?.iter().map(position).collect()
}

fn polygon(value: &Value) -> Result<Option<Polygon<f64>>, Failure> {
    let mut rings = array(value)?
        .iter()
        .map(|ring| positions(ring).map(LineString))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();
    let Some(exterior) = rings.next() else {
        return Ok(None);
    };
    if exterior.0.is_empty() {
        return Ok(None);
    }
    let interiors = rings.filter(|ring| !ring.0.is_empty()).collect();
    Ok(Some(Polygon::new(exterior, interiors)))
}

fn payload_excerpt(value: &Value) -> String {
    let text = value.to_string();
    if text.len() <= MAX_PAYLOAD_BYTES {
        return text;
    }
    let cut = (0..=MAX_PAYLOAD_BYTES)
        .rev()
        .find_map(|end| text.get(..end))
        .unwrap_or_default();
    format!("{cut}...")
}
