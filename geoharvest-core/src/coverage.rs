//! Coverage estimation in an area-preserving frame.
//!
//! Coverage is the summed projected area of a geometry set divided by the
//! projected area of an envelope. Overlaps are counted once per geometry,
//! so ratios above one are expected for overlapping data.

use geo::{Area, Coord, Geometry, LineString, Polygon, Rect};

use crate::{CanonicalGeometry, Projection, ProjectionError};

/// Positions inserted along each envelope edge before projection so curved
/// parallels are followed closely.
const ENVELOPE_EDGE_STEPS: u32 = 64;

/// Coverage of `geometries` relative to their combined envelope.
///
/// The envelope is the union of the projected geometries' bounding
/// rectangles. Returns `Ok(None)` when there are no geometries or the
/// envelope has zero area (a single point or collinear data).
///
/// # Examples
///
/// ```
/// use geoharvest_core::{CanonicalGeometry, Planar, coverage};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let square = CanonicalGeometry::from_wkt("POLYGON((0 0,10 0,10 10,0 10,0 0))")?;
/// assert_eq!(coverage(&[square], &Planar)?, Some(1.0));
/// assert_eq!(coverage(&[], &Planar)?, None);
/// # Ok(())
/// # }
/// ```
pub fn coverage<P>(
    geometries: &[CanonicalGeometry],
    projection: &P,
) -> Result<Option<f64>, ProjectionError>
where
    P: Projection + ?Sized,
{
    let mut covered = 0.0;
    let mut envelope: Option<Rect<f64>> = None;
    for geometry in geometries {
        let projected = projection.project(geometry)?;
        covered += projected.as_geometry().unsigned_area();
        envelope = Some(match envelope {
            Some(existing) => include_bounds(existing, projected.envelope()),
            None => projected.envelope(),
        });
    }
    Ok(envelope.and_then(|rect| ratio(covered, rect.unsigned_area())))
}

/// Coverage of `geometries` relative to a caller-supplied envelope.
///
/// `envelope` is expressed in the same frame as the input geometries (for
/// example a source's declared WGS84 bounding box) and is projected with
/// its edges densified. Returns `Ok(None)` for empty input or a zero-area
/// envelope.
pub fn coverage_within<P>(
    geometries: &[CanonicalGeometry],
    envelope: Rect<f64>,
    projection: &P,
) -> Result<Option<f64>, ProjectionError>
where
    P: Projection + ?Sized,
{
    if geometries.is_empty() {
        return Ok(None);
    }
    let mut covered = 0.0;
    for geometry in geometries {
        covered += projection.project(geometry)?.as_geometry().unsigned_area();
    }
    let frame = projection.project(&CanonicalGeometry::new(Geometry::Polygon(densified(
        envelope,
    )))?)?;
    Ok(ratio(covered, frame.as_geometry().unsigned_area()))
}

fn include_bounds(existing: Rect<f64>, bounds: Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: existing.min().x.min(bounds.min().x),
            y: existing.min().y.min(bounds.min().y),
        },
        Coord {
            x: existing.max().x.max(bounds.max().x),
            y: existing.max().y.max(bounds.max().y),
        },
    )
}

fn ratio(covered: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0).then(|| covered / denominator)
}

fn densified(rect: Rect<f64>) -> Polygon<f64> {
    let (min, max) = (rect.min(), rect.max());
    let corners = [
        (min.x, min.y),
        (max.x, min.y),
        (max.x, max.y),
        (min.x, max.y),
        (min.x, min.y),
    ];
    let mut ring = Vec::new();
    for (&(x0, y0), &(x1, y1)) in corners.iter().zip(corners.iter().skip(1)) {
        for step in 0..ENVELOPE_EDGE_STEPS {
            let t = f64::from(step) / f64::from(ENVELOPE_EDGE_STEPS);
            ring.push(Coord {
                x: x0 + (x1 - x0) * t,
                y: y0 + (y1 - y0) * t,
            });
        }
    }
    Polygon::new(LineString::from(ring), Vec::new())
}
