//! Canonical geometry form shared by storage, clustering and coverage.
//!
//! A [`CanonicalGeometry`] is a non-empty, finite, two-dimensional
//! `geo::Geometry` restricted to the kinds the harvester understands. Its
//! textual form is WKT, which is what the spatial store persists and what
//! analyses recompute from.

use std::fmt;

use geo::orient::{Direction, Orient};
use geo::{BoundingRect, CoordsIter, Geometry, Polygon, Rect, RemoveRepeatedPoints};
use thiserror::Error;
use wkt::{ToWkt, TryFromWkt};

/// Geometry kinds accepted into the canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    /// A single position.
    Point,
    /// A set of positions.
    MultiPoint,
    /// An open or closed line.
    LineString,
    /// A set of lines.
    MultiLineString,
    /// A polygon with optional holes.
    Polygon,
    /// A set of polygons.
    MultiPolygon,
}

impl GeometryKind {
    /// GeoJSON `type` name for this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Point => "Point",
            Self::MultiPoint => "MultiPoint",
            Self::LineString => "LineString",
            Self::MultiLineString => "MultiLineString",
            Self::Polygon => "Polygon",
            Self::MultiPolygon => "MultiPolygon",
        }
    }

    /// Resolve a GeoJSON `type` name, returning `None` for unsupported kinds.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Point" => Some(Self::Point),
            "MultiPoint" => Some(Self::MultiPoint),
            "LineString" => Some(Self::LineString),
            "MultiLineString" => Some(Self::MultiLineString),
            "Polygon" => Some(Self::Polygon),
            "MultiPolygon" => Some(Self::MultiPolygon),
            _ => None,
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised when constructing or repairing a [`CanonicalGeometry`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// The geometry kind has no canonical representation.
    #[error("unsupported geometry kind {kind}")]
    Unsupported {
        /// Name of the rejected kind.
        kind: String,
    },
    /// The geometry contained no positions.
    #[error("geometry has no coordinates")]
    Empty,
    /// A coordinate was NaN or infinite.
    #[error("geometry contains a non-finite coordinate")]
    NonFinite,
    /// The WKT text could not be parsed.
    #[error("failed to parse WKT geometry: {message}")]
    InvalidWkt {
        /// Parser diagnostic.
        message: String,
    },
    /// A ring or member line inside a non-empty geometry had no positions.
    #[error("{kind} contains an empty ring or member line")]
    EmptyComponent {
        /// Kind of the enclosing geometry.
        kind: GeometryKind,
    },
    /// A polygon ring had too few positions to enclose an area.
    #[error("polygon ring has {positions} positions; at least 4 are required")]
    DegenerateRing {
        /// Number of positions in the ring, closing position included.
        positions: usize,
    },
    /// A line collapsed to fewer than two distinct positions.
    #[error("line has {positions} distinct positions; at least 2 are required")]
    DegenerateLine {
        /// Number of distinct positions left.
        positions: usize,
    },
}

/// Normalised, storage-ready geometry.
///
/// # Examples
///
/// ```
/// use geoharvest_core::{CanonicalGeometry, GeometryKind};
///
/// # fn main() -> Result<(), geoharvest_core::GeometryError> {
/// let geometry = CanonicalGeometry::from_wkt("POLYGON((0 0,4 0,4 2,0 2,0 0))")?;
/// assert_eq!(geometry.kind(), GeometryKind::Polygon);
/// assert_eq!(geometry.envelope().width(), 4.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalGeometry {
    kind: GeometryKind,
    geometry: Geometry<f64>,
    envelope: Rect<f64>,
}

impl CanonicalGeometry {
    /// Validate a `geo` geometry and wrap it.
    pub fn new(geometry: Geometry<f64>) -> Result<Self, GeometryError> {
        let kind = kind_of(&geometry)?;
        if !geometry
            .coords_iter()
            .all(|coord| coord.x.is_finite() && coord.y.is_finite())
        {
            return Err(GeometryError::NonFinite);
        }
        let envelope = geometry.bounding_rect().ok_or(GeometryError::Empty)?;
        if has_empty_component(&geometry) {
            return Err(GeometryError::EmptyComponent { kind });
        }
        Ok(Self {
            kind,
            geometry,
            envelope,
        })
    }

    /// Parse the WKT form produced by [`CanonicalGeometry::to_wkt`].
    pub fn from_wkt(text: &str) -> Result<Self, GeometryError> {
        let geometry = Geometry::<f64>::try_from_wkt_str(text).map_err(|err| {
            GeometryError::InvalidWkt {
                message: err.to_string(),
            }
        })?;
        Self::new(geometry)
    }

    /// WKT serialization used for storage.
    #[must_use]
    pub fn to_wkt(&self) -> String {
        self.geometry.wkt_string()
    }

    /// Geometry kind.
    #[must_use]
    pub const fn kind(&self) -> GeometryKind {
        self.kind
    }

    /// Borrow the underlying `geo` geometry.
    #[must_use]
    pub const fn as_geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    /// Consume the wrapper and return the underlying `geo` geometry.
    #[must_use]
    pub fn into_geometry(self) -> Geometry<f64> {
        self.geometry
    }

    /// Axis-aligned bounding rectangle.
    #[must_use]
    pub const fn envelope(&self) -> Rect<f64> {
        self.envelope
    }

    /// Return a cleaned copy suitable for merging into the live table.
    ///
    /// Consecutive repeated positions are dropped, polygon rings are
    /// oriented (exterior counter-clockwise, holes clockwise), and shapes
    /// that cannot enclose an area or trace a line are rejected.
    pub fn repaired(&self) -> Result<Self, GeometryError> {
        let cleaned = match &self.geometry {
            Geometry::Point(point) => Geometry::Point(*point),
            Geometry::MultiPoint(points) => Geometry::MultiPoint(points.remove_repeated_points()),
            Geometry::LineString(line) => {
                let line = line.remove_repeated_points();
                ensure_line(line.0.len())?;
                Geometry::LineString(line)
            }
            Geometry::MultiLineString(lines) => {
                let lines = lines.remove_repeated_points();
                for line in &lines {
                    ensure_line(line.0.len())?;
                }
                Geometry::MultiLineString(lines)
            }
            Geometry::Polygon(polygon) => Geometry::Polygon(repair_polygon(polygon)?),
            Geometry::MultiPolygon(polygons) => {
                let repaired = polygons
                    .iter()
                    .map(repair_polygon)
                    .collect::<Result<Vec<_>, _>>()?;
                Geometry::MultiPolygon(repaired.into())
            }
            other => {
                return Err(GeometryError::Unsupported {
                    kind: geometry_name(other).to_owned(),
                });
            }
        };
        Self::new(cleaned)
    }
}

impl fmt::Display for CanonicalGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wkt())
    }
}

impl TryFrom<Geometry<f64>> for CanonicalGeometry {
    type Error = GeometryError;

    fn try_from(geometry: Geometry<f64>) -> Result<Self, Self::Error> {
        Self::new(geometry)
    }
}

fn kind_of(geometry: &Geometry<f64>) -> Result<GeometryKind, GeometryError> {
    match geometry {
        Geometry::Point(_) => Ok(GeometryKind::Point),
        Geometry::MultiPoint(_) => Ok(GeometryKind::MultiPoint),
        Geometry::LineString(_) => Ok(GeometryKind::LineString),
        Geometry::MultiLineString(_) => Ok(GeometryKind::MultiLineString),
        Geometry::Polygon(_) => Ok(GeometryKind::Polygon),
        Geometry::MultiPolygon(_) => Ok(GeometryKind::MultiPolygon),
        other => Err(GeometryError::Unsupported {
            kind: geometry_name(other).to_owned(),
        }),
    }
}

fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Empty rings and member lines have no WKT form that parses back.
fn has_empty_component(geometry: &Geometry<f64>) -> bool {
    match geometry {
        Geometry::MultiLineString(lines) => lines.iter().any(|line| line.0.is_empty()),
        Geometry::Polygon(polygon) => has_empty_ring(polygon),
        Geometry::MultiPolygon(polygons) => polygons.iter().any(has_empty_ring),
        _ => false,
    }
}

fn has_empty_ring(polygon: &Polygon<f64>) -> bool {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .any(|ring| ring.0.is_empty())
}

const fn ensure_line(positions: usize) -> Result<(), GeometryError> {
    if positions < 2 {
        return Err(GeometryError::DegenerateLine { positions });
    }
    Ok(())
}

fn repair_polygon(polygon: &Polygon<f64>) -> Result<Polygon<f64>, GeometryError> {
    let cleaned = polygon.remove_repeated_points();
    for ring in std::iter::once(cleaned.exterior()).chain(cleaned.interiors()) {
        let positions = ring.0.len();
        if positions < 4 {
            return Err(GeometryError::DegenerateRing { positions });
        }
    }
    Ok(cleaned.orient(Direction::Default))
}
