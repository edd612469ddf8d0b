// Multi-month recompute driver.
// Months are independent partitions of the store, so one bad month never
// blocks the rest; cancellation is honored between months, never mid-month.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

use crate::engine::{AllocationEngine, RunReport};
use crate::error::EngineError;
use crate::ledger::Month;
use crate::store::AllocationStore;

/// Outcome of one month within a batch run.
#[derive(Debug)]
pub enum MonthStatus {
    Completed(RunReport),
    Failed(EngineError),

    /// The batch was cancelled before this month started.
    Cancelled,
}

impl MonthStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, MonthStatus::Completed(_))
    }
}

#[derive(Debug)]
pub struct MonthOutcome {
    pub month: Month,
    pub status: MonthStatus,
}

/// Recompute a list of months sequentially, collecting per-month status.
///
/// A month that fails is recorded and the driver moves on. When `cancel`
/// flips, the month in flight finishes and every remaining month is
/// reported as cancelled rather than silently dropped.
pub fn recompute_months(
    engine: &AllocationEngine,
    store: &dyn AllocationStore,
    organization_id: &str,
    months: &[Month],
    cancel: &AtomicBool,
) -> Vec<MonthOutcome> {
    let mut outcomes = Vec::with_capacity(months.len());

    for (index, month) in months.iter().copied().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            info!(
                organization = organization_id,
                remaining = months.len() - index,
                "batch cancelled; remaining months not recomputed"
            );
            outcomes.extend(
                months[index..]
                    .iter()
                    .map(|m| MonthOutcome { month: *m, status: MonthStatus::Cancelled }),
            );
            break;
        }

        let status = match engine.recompute_month(store, organization_id, month) {
            Ok(report) => MonthStatus::Completed(report),
            Err(err) => {
                error!(
                    organization = organization_id,
                    month = %month,
                    error = %err,
                    "month recompute failed; continuing with remaining months"
                );
                MonthStatus::Failed(err)
            }
        };
        outcomes.push(MonthOutcome { month, status });
    }

    outcomes
}

/// Convenience wrapper over an inclusive month range.
pub fn recompute_month_range(
    engine: &AllocationEngine,
    store: &dyn AllocationStore,
    organization_id: &str,
    from: Month,
    to: Month,
    cancel: &AtomicBool,
) -> Vec<MonthOutcome> {
    recompute_months(engine, store, organization_id, &Month::range(from, to), cancel)
}

// ============================================================================
// TESTS
// ============================================================================
