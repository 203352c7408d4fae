//! Projections from geographic coordinates into planar metric frames.
//!
//! Distances and areas are only meaningful in a projected frame. Clustering
//! and coverage project every geometry once through a [`Projection`] and
//! then work purely in planar units.

use geo::{Coord, MapCoords};
use thiserror::Error;

use crate::{CanonicalGeometry, GeometryError};

/// Authalic radius of the GRS80 ellipsoid in metres.
pub const AUTHALIC_RADIUS_M: f64 = 6_371_007.181;

/// Errors raised while projecting coordinates.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProjectionError {
    /// Latitude outside `[-90, 90]` or longitude outside `[-180, 180]`.
    #[error("coordinate ({x}, {y}) is outside the geographic range")]
    OutOfRange {
        /// Longitude in degrees.
        x: f64,
        /// Latitude in degrees.
        y: f64,
    },
    /// The point is the antipode of the projection centre.
    #[error("coordinate ({x}, {y}) is antipodal to the projection centre")]
    Antipodal {
        /// Longitude in degrees.
        x: f64,
        /// Latitude in degrees.
        y: f64,
    },
    /// The projected geometry failed canonical validation.
    #[error("projected geometry is invalid: {0}")]
    Geometry(#[from] GeometryError),
}

/// Maps geographic coordinates into a planar frame measured in metres.
pub trait Projection {
    /// Project a single coordinate (`x = longitude`, `y = latitude`).
    fn project_coord(&self, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError>;

    /// Project every coordinate of a geometry.
    fn project(&self, geometry: &CanonicalGeometry) -> Result<CanonicalGeometry, ProjectionError> {
        let projected = geometry
            .as_geometry()
            .try_map_coords(|coord| self.project_coord(coord))?;
        Ok(CanonicalGeometry::new(projected)?)
    }
}

impl<P: Projection + ?Sized> Projection for &P {
    fn project_coord(&self, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
        (**self).project_coord(coord)
    }
}

/// Identity projection for data that is already in a planar frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Planar;

impl Projection for Planar {
    fn project_coord(&self, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
        Ok(coord)
    }
}

/// Spherical Lambert azimuthal equal-area projection.
///
/// The defaults reproduce the ETRS89-LAEA grid used for pan-European
/// statistics: centre 52°N 10°E with false easting 4 321 000 m and false
/// northing 3 210 000 m.
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use geoharvest_core::{LambertAzimuthalEqualArea, Projection};
///
/// # fn main() -> Result<(), geoharvest_core::ProjectionError> {
/// let laea = LambertAzimuthalEqualArea::default();
/// let centre = laea.project_coord(Coord { x: 10.0, y: 52.0 })?;
/// assert!((centre.x - 4_321_000.0).abs() < 1e-6);
/// assert!((centre.y - 3_210_000.0).abs() < 1e-6);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LambertAzimuthalEqualArea {
    centre_lon: f64,
    sin_lat0: f64,
    cos_lat0: f64,
    false_easting: f64,
    false_northing: f64,
    radius: f64,
}

impl LambertAzimuthalEqualArea {
    /// Build a projection centred on `(lon, lat)` degrees.
    #[must_use]
    pub fn new(centre_lon: f64, centre_lat: f64) -> Self {
        let (sin_lat0, cos_lat0) = centre_lat.to_radians().sin_cos();
        Self {
            centre_lon: centre_lon.to_radians(),
            sin_lat0,
            cos_lat0,
            false_easting: 0.0,
            false_northing: 0.0,
            radius: AUTHALIC_RADIUS_M,
        }
    }

    /// Offset projected coordinates by a false origin.
    #[must_use]
    pub const fn with_false_origin(mut self, easting: f64, northing: f64) -> Self {
        self.false_easting = easting;
        self.false_northing = northing;
        self
    }

    /// Override the sphere radius.
    #[must_use]
    pub const fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }
}

impl Default for LambertAzimuthalEqualArea {
    fn default() -> Self {
        Self::new(10.0, 52.0).with_false_origin(4_321_000.0, 3_210_000.0)
    }
}

impl Projection for LambertAzimuthalEqualArea {
    fn project_coord(&self, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
        let Coord { x, y } = coord;
        if !(-180.0..=180.0).contains(&x) || !(-90.0..=90.0).contains(&y) {
            return Err(ProjectionError::OutOfRange { x, y });
        }
        let (sin_lat, cos_lat) = y.to_radians().sin_cos();
        let (sin_dlon, cos_dlon) = (x.to_radians() - self.centre_lon).sin_cos();
        let denominator = 1.0 + self.sin_lat0 * sin_lat + self.cos_lat0 * cos_lat * cos_dlon;
        if denominator <= f64::EPSILON {
            return Err(ProjectionError::Antipodal { x, y });
        }
        let k = (2.0 / denominator).sqrt();
        Ok(Coord {
            x: self.radius * k * cos_lat * sin_dlon + self.false_easting,
            y: self.radius * k * (self.cos_lat0 * sin_lat - self.sin_lat0 * cos_lat * cos_dlon)
                + self.false_northing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Geometry, LineString, Polygon};
    use rstest::rstest;

    fn densified_cell(west: f64, south: f64, east: f64, north: f64) -> CanonicalGeometry {
        const STEPS: u32 = 200;
        let mut ring = Vec::new();
        let edges = [
            ((west, south), (east, south)),
            ((east, south), (east, north)),
            ((east, north), (west, north)),
            ((west, north), (west, south)),
        ];
        for ((x0, y0), (x1, y1)) in edges {
            for step in 0..STEPS {
                let t = f64::from(step) / f64::from(STEPS);
                ring.push(Coord {
                    x: x0 + (x1 - x0) * t,
                    y: y0 + (y1 - y0) * t,
                });
            }
        }
        let polygon = Polygon::new(LineString::from(ring), Vec::new());
        CanonicalGeometry::new(Geometry::Polygon(polygon)).expect("valid cell")
    }

    #[rstest]
    #[case(10.0, 52.0, 11.0, 53.0)]
    #[case(-3.0, 40.0, -2.0, 41.0)]
    #[case(25.0, 60.0, 26.5, 61.0)]
    fn preserves_area_of_graticule_cells(
        #[case] west: f64,
        #[case] south: f64,
        #[case] east: f64,
        #[case] north: f64,
    ) {
        let cell = densified_cell(west, south, east, north);
        let projected = LambertAzimuthalEqualArea::default()
            .project(&cell)
            .expect("cell projects");

        let expected = AUTHALIC_RADIUS_M.powi(2)
            * (east - west).to_radians()
            * (north.to_radians().sin() - south.to_radians().sin());
        let actual = projected.as_geometry().unsigned_area();
        let relative = (actual - expected).abs() / expected;
        assert!(relative < 1e-4, "relative area error {relative}");
    }

    #[rstest]
    fn rejects_the_antipode() {
        let laea = LambertAzimuthalEqualArea::new(0.0, 0.0);
        let err = laea
            .project_coord(Coord { x: 180.0, y: 0.0 })
            .expect_err("antipode cannot be projected");
        assert!(matches!(err, ProjectionError::Antipodal { .. }));
    }

    #[rstest]
    #[case(Coord { x: 200.0, y: 0.0 })]
    #[case(Coord { x: 0.0, y: -91.0 })]
    fn rejects_out_of_range_coordinates(#[case] coord: Coord<f64>) {
        let err = LambertAzimuthalEqualArea::default()
            .project_coord(coord)
            .expect_err("out of range");
        assert!(matches!(err, ProjectionError::OutOfRange { .. }));
    }

    #[rstest]
    fn planar_is_identity() {
        let geometry = CanonicalGeometry::from_wkt("LINESTRING(0 0,100 0)").expect("line");
        assert_eq!(Planar.project(&geometry).expect("identity"), geometry);
    }
}
