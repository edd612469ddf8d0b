// Store seam - the data contracts the engine consumes and produces.
// The engine only ever talks to this trait; persistence technology lives
// behind it (SQLite in db.rs, in-memory doubles in tests).

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::engine::MonthlyAllocation;
use crate::error::Result;
use crate::ledger::{CategoryMapping, ExpenseTransaction, Month, Session};
use crate::rules::AllocationRule;

/// Read and write contracts for one organization's allocation data.
///
/// Read failures and write failures surface as `EngineError::Io` and are
/// retryable: the engine's computation is pure, so a whole-month recompute
/// can always be re-run from scratch.
pub trait AllocationStore {
    /// Expense transactions for the organization within [start, end],
    /// class tag already present on each record.
    fn load_expense_transactions(
        &self,
        organization_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpenseTransaction>>;

    fn load_category_mappings(&self, organization_id: &str) -> Result<Vec<CategoryMapping>>;

    fn load_allocation_rules(&self, organization_id: &str) -> Result<Vec<AllocationRule>>;

    fn load_sessions(
        &self,
        organization_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Session>>;

    /// Existing allocation rows for the month, for override preservation.
    fn load_existing_allocations(
        &self,
        organization_id: &str,
        month: Month,
    ) -> Result<Vec<MonthlyAllocation>>;

    /// Replace the month's rows: delete-then-insert, ordered, atomic from
    /// the caller's perspective. With `preserve_overrides` set, overridden
    /// rows are left untouched and their keys are not re-inserted; without
    /// it, the caller is explicitly discarding overrides.
    fn write_allocations(
        &self,
        organization_id: &str,
        month: Month,
        rows: &[MonthlyAllocation],
        preserve_overrides: bool,
    ) -> Result<()>;

    /// Freeze a manual amount over one stored row. The override bingo
    /// amount is derived from the row's already-stored bingo percentage.
    fn apply_override(
        &self,
        allocation_id: &str,
        amount: Decimal,
        notes: &str,
    ) -> Result<MonthlyAllocation>;
}
