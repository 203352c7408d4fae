//! Operator-facing summary of unresolved harvest failures.

use std::fmt;

use geoharvest_core::{HarvestErrorLogEntry, SpatialStore, unix_now};
use serde::Serialize;

/// Sources whose latest harvest failed, with the failure that was logged.
///
/// An error is unresolved while no successful harvest of its source has
/// been recorded after it. The summary renders as plain text for operators
/// and serialises to JSON for notification tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    /// Seconds since the Unix epoch at which the summary was built.
    pub generated_at: i64,
    /// Latest unresolved error per source, ordered by source.
    pub unresolved: Vec<HarvestErrorLogEntry>,
}

impl HarvestSummary {
    /// Read the unresolved errors from `store`.
    ///
    /// # Errors
    ///
    /// Propagates the store's error if the log cannot be read.
    pub fn from_store<S>(store: &S) -> Result<Self, S::Error>
    where
        S: SpatialStore + ?Sized,
    {
        Ok(Self {
            generated_at: unix_now(),
            unresolved: store.unresolved_errors()?,
        })
    }

    /// Whether every source's latest harvest succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

impl fmt::Display for HarvestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return writeln!(f, "No unresolved harvest errors.");
        }
        writeln!(
            f,
            "{} source(s) with unresolved harvest errors:",
            self.unresolved.len()
        )?;
        for entry in &self.unresolved {
            writeln!(
                f,
                "  source {} (logged at {}): {}",
                entry.source_id, entry.logged_at, entry.message
            )?;
        }
        Ok(())
    }
}
