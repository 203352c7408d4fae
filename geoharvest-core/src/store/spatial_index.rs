//! Scoped disable/rebuild of the spatial index.

use std::ops::{Deref, DerefMut};

use log::{error, info};

use super::SpatialStore;

/// Holds a store whose spatial index has been disabled.
///
/// The guard dereferences to the store so bulk mutations run through it.
/// Call [`SpatialIndexGuard::rebuild`] to re-enable the index and observe
/// the result. A guard dropped without that call (early return, unwinding,
/// or a cancelled future) rebuilds on drop and logs any failure.
///
/// # Examples
///
/// ```rust
/// use geoharvest_core::{
///     CanonicalGeometry, IndexState, SourceId, SpatialIndexGuard, SpatialStore,
///     SqliteFeatureStore,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut store = SqliteFeatureStore::open_in_memory()?;
/// {
///     let mut guard = SpatialIndexGuard::disable(&mut store)?;
///     assert_eq!(guard.index_state()?, IndexState::Disabled);
///     guard.insert_features(SourceId(1), &[CanonicalGeometry::from_wkt("POINT(1 1)")?])?;
///     guard.rebuild()?;
/// }
/// assert_eq!(store.index_state()?, IndexState::Enabled);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SpatialIndexGuard<'a, S>
where
    S: SpatialStore,
{
    store: &'a mut S,
    armed: bool,
}

impl<'a, S> SpatialIndexGuard<'a, S>
where
    S: SpatialStore,
{
    /// Disable the index of `store` and hold it until rebuilt.
    pub fn disable(store: &'a mut S) -> Result<Self, S::Error> {
        store.disable_spatial_index()?;
        info!("spatial index disabled");
        Ok(Self { store, armed: true })
    }

    /// Rebuild the index and release the store.
    pub fn rebuild(mut self) -> Result<(), S::Error> {
        self.armed = false;
        self.store.rebuild_spatial_index()?;
        info!("spatial index rebuilt");
        Ok(())
    }
}

impl<S> Deref for SpatialIndexGuard<'_, S>
where
    S: SpatialStore,
{
    type Target = S;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

impl<S> DerefMut for SpatialIndexGuard<'_, S>
where
    S: SpatialStore,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store
    }
}

impl<S> Drop for SpatialIndexGuard<'_, S>
where
    S: SpatialStore,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!("spatial index guard released without rebuild; rebuilding now");
        match self.store.rebuild_spatial_index() {
            Ok(()) => info!("spatial index rebuilt"),
            Err(err) => error!("emergency spatial index rebuild failed: {err}"),
        }
    }
}
