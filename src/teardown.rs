//! Removal of every realized shaping object on shutdown

use crate::backends::shaping::{Mutation, Outcome, ShapingBackend};
use crate::plan::{ObjectKey, ObjectSet, ShapingObject};

/// What a teardown managed to remove
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Objects deleted, including ones already gone
    pub removed: usize,
    /// Objects whose deletion failed, with the backend's diagnostic
    pub failures: Vec<(ObjectKey, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete every object in `realized`, deepest first
///
/// `realized` is always empty afterwards: an object whose deletion failed is
/// reported, not retried.
pub fn tear_down<B: ShapingBackend + ?Sized>(
    backend: &mut B,
    realized: &mut ObjectSet,
) -> TeardownReport {
    let mut objects: Vec<ShapingObject> = std::mem::take(realized).into_values().collect();
    // Stable: ties keep key order
    objects.sort_by_key(|object| std::cmp::Reverse(object.depth()));

    let mut report = TeardownReport::default();
    if objects.is_empty() {
        return report;
    }

    log::info!("Removing {} shaping object(s)...", objects.len());
    for object in objects {
        let key = object.key().clone();
        match backend.apply(&Mutation::delete(object)) {
            Ok(Outcome::Applied) => {
                log::debug!("Removed {}", key);
                report.removed += 1;
            }
            Ok(Outcome::NotFound) => {
                log::debug!("{} was already gone", key);
                report.removed += 1;
            }
            Err(e) => {
                log::warn!("Failed to remove {}: {}", key, e);
                report.failures.push((key, e.to_string()));
            }
        }
    }

    if report.is_clean() {
        log::info!("✅ Removed all {} shaping object(s)", report.removed);
    }
    report
}
