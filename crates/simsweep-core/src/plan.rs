use crate::consolidate::ConsolidatedStatusRegistry;
use crate::registry::{CaseId, SweepRegistry};
use crate::status::CaseState;

/// Cases that still need to run, in registry order.
///
/// A case is selected when its consolidated status is `pending` or
/// `failed`. Without a consolidated table every case is pending; a case the
/// table does not mention is pending as well.
pub fn plan(
    registry: &SweepRegistry,
    status: Option<&ConsolidatedStatusRegistry>,
) -> Vec<CaseId> {
    registry
        .case_ids()
        .filter(|id| {
            status
                .and_then(|s| s.get(*id))
                .map(|s| s.status)
                .unwrap_or(CaseState::Pending)
                .needs_run()
        })
        .collect()
}
