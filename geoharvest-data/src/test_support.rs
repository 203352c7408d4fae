//! Test utilities for harvesting.
//!
//! [`StubHarvester`] is a deterministic [`SourceHarvester`] that returns
//! scripted results without any network traffic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use geoharvest_core::{CanonicalGeometry, Source, SourceId};

use crate::harvest::{HarvestError, SourceHarvester};
use crate::service::FetchError;

type Scripted = Result<Vec<CanonicalGeometry>, HarvestError>;

/// Stub `SourceHarvester` for testing.
///
/// Each source has a queue of responses. Responses are served in order and
/// the last one repeats once the queue is exhausted. Sources without a
/// script fail with a network error.
#[derive(Debug, Default)]
pub struct StubHarvester {
    scripts: Mutex<HashMap<SourceId, Vec<Scripted>>>,
    calls: Mutex<Vec<SourceId>>,
}

impl StubHarvester {
    /// Queue a successful harvest for `source`.
    #[must_use]
    pub fn with_features(self, source: SourceId, geometries: Vec<CanonicalGeometry>) -> Self {
        self.push(source, Ok(geometries))
    }

    /// Queue a failed harvest for `source`.
    #[must_use]
    pub fn with_failure(self, source: SourceId, error: HarvestError) -> Self {
        self.push(source, Err(error))
    }

    /// Sources harvested so far, in call order.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder of the call log panicked.
    #[must_use]
    pub fn calls(&self) -> Vec<SourceId> {
        self.calls.lock().expect("call log lock").clone()
    }

    fn push(self, source: SourceId, response: Scripted) -> Self {
        self.scripts
            .lock()
            .expect("script lock")
            .entry(source)
            .or_default()
            .push(response);
        self
    }
}

#[async_trait]
impl SourceHarvester for StubHarvester {
    async fn harvest(&self, source: &Source) -> Result<Vec<CanonicalGeometry>, HarvestError> {
        self.calls.lock().expect("call log lock").push(source.id);
        let mut scripts = self.scripts.lock().expect("script lock");
        let Some(queue) = scripts.get_mut(&source.id) else {
            return Err(HarvestError::Fetch(FetchError::Network {
                url: source.url.clone(),
                message: "no scripted response".to_owned(),
            }));
        };
        match queue.len() {
            0 => Err(HarvestError::Fetch(FetchError::Network {
                url: source.url.clone(),
                message: "no scripted response".to_owned(),
            })),
            1 => queue[0].clone(),
            _ => queue.remove(0),
        }
    }
}
