//! Proximity clustering over a source's geometry set.
//!
//! Geometries are nodes of an undirected graph; two nodes are adjacent when
//! their projected distance is strictly below the threshold. Each connected
//! component becomes one [`ClusterGroup`].

use geo::{Distance, Euclidean, Geometry};
use log::debug;
use rstar::{AABB, RTree, primitives::GeomWithData, primitives::Rectangle};
use thiserror::Error;

use crate::{CanonicalGeometry, Projection, ProjectionError};

/// Indices of the input geometries forming one connected component.
///
/// Members are sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterGroup {
    /// Positions in the input sequence.
    pub members: Vec<usize>,
}

impl ClusterGroup {
    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members. Groups produced by [`cluster`] are
    /// never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Errors returned by [`cluster`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClusterError {
    /// Threshold was negative, NaN or infinite.
    #[error("clustering threshold must be finite and non-negative, got {threshold}")]
    InvalidThreshold {
        /// Rejected threshold.
        threshold: f64,
    },
    /// A geometry could not be projected.
    #[error("failed to project geometry {index}: {source}")]
    Projection {
        /// Position of the geometry in the input.
        index: usize,
        /// Underlying projection failure.
        #[source]
        source: ProjectionError,
    },
}

type Envelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Partition `geometries` into connected components under `threshold`.
///
/// Every geometry is projected once. An R\*-tree over the projected
/// envelopes, inflated by the threshold, prunes candidate pairs before the
/// exact distance check. Groups are ordered by their smallest member.
///
/// # Examples
///
/// ```
/// use geoharvest_core::{CanonicalGeometry, Planar, cluster};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let geometries = ["POINT(0 0)", "POINT(100 0)", "POINT(10000 0)"]
///     .into_iter()
///     .map(CanonicalGeometry::from_wkt)
///     .collect::<Result<Vec<_>, _>>()?;
/// let groups = cluster(&geometries, 400.0, &Planar)?;
/// assert_eq!(groups.len(), 2);
/// assert_eq!(groups[0].members, vec![0, 1]);
/// assert_eq!(groups[1].members, vec![2]);
/// # Ok(())
/// # }
/// ```
pub fn cluster<P>(
    geometries: &[CanonicalGeometry],
    threshold: f64,
    projection: &P,
) -> Result<Vec<ClusterGroup>, ClusterError>
where
    P: Projection + ?Sized,
{
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ClusterError::InvalidThreshold { threshold });
    }

    let projected = geometries
        .iter()
        .enumerate()
        .map(|(index, geometry)| {
            projection
                .project(geometry)
                .map_err(|source| ClusterError::Projection { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let tree = RTree::bulk_load(
        projected
            .iter()
            .enumerate()
            .map(|(index, geometry)| {
                let envelope = geometry.envelope();
                let rectangle = Rectangle::from_corners(
                    [envelope.min().x, envelope.min().y],
                    [envelope.max().x, envelope.max().y],
                );
                Envelope::new(rectangle, index)
            })
            .collect(),
    );

    let mut visited = vec![false; projected.len()];
    let mut groups = Vec::new();
    let mut stack = Vec::new();
    for start in 0..projected.len() {
        if seen(&visited, start) {
            continue;
        }
        mark(&mut visited, start);
        stack.push(start);
        let mut members = Vec::new();
        while let Some(node) = stack.pop() {
            members.push(node);
            let Some(origin) = projected.get(node) else {
                continue;
            };
            let search = inflated(origin, threshold);
            for candidate in tree.locate_in_envelope_intersecting(&search) {
                let other = candidate.data;
                let Some(target) = projected.get(other) else {
                    continue;
                };
                if seen(&visited, other)
                    || !within(origin.as_geometry(), target.as_geometry(), threshold)
                {
                    continue;
                }
                mark(&mut visited, other);
                stack.push(other);
            }
        }
        members.sort_unstable();
        groups.push(ClusterGroup { members });
    }

    debug!(
        "clustered {} geometries into {} groups at threshold {threshold}",
        geometries.len(),
        groups.len()
    );
    Ok(groups)
}

/// Out-of-range positions count as visited.
fn seen(visited: &[bool], index: usize) -> bool {
    visited.get(index).copied().unwrap_or(true)
}

fn mark(visited: &mut [bool], index: usize) {
    if let Some(flag) = visited.get_mut(index) {
        *flag = true;
    }
}

fn inflated(geometry: &CanonicalGeometry, threshold: f64) -> AABB<[f64; 2]> {
    let envelope = geometry.envelope();
    AABB::from_corners(
        [envelope.min().x - threshold, envelope.min().y - threshold],
        [envelope.max().x + threshold, envelope.max().y + threshold],
    )
}

fn within(a: &Geometry<f64>, b: &Geometry<f64>, threshold: f64) -> bool {
    Euclidean.distance(a, b) < threshold
}
