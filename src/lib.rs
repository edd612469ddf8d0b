// Bingo P&L Allocation Engine - Core Library
// Allocates consolidated QuickBooks expense totals across the two tracked
// bingo locations by per-category rule, with override-safe recomputation.

pub mod error;
pub mod ledger;
pub mod rules;
pub mod bingo;
pub mod grouping;
pub mod engine;
pub mod overrides;
pub mod store;
pub mod db;
pub mod batch;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use ledger::{
    apply_percent, load_expense_csv, load_session_csv, round_cents,
    CategoryMapping, ExpenseTransaction, LocationPair, MappingTable, Month,
    Session, Side, TrackedLocation, TransactionSnapshot,
};
pub use rules::{AllocationMethod, AllocationRule, RuleSet};
pub use bingo::{compute_bingo_percentage, BingoRevenue};
pub use grouping::{group_by_category, GroupedCategory, GroupedLedger, UnmappedSpend};
pub use engine::{
    AllocationEngine, CategoryOutcome, MonthComputation, MonthInputs,
    MonthlyAllocation, RecomputeOptions, RunReport, SkipReason,
};
pub use overrides::{apply_override, clear_override, AllocationValue, OverrideSnapshot, RowKey};
pub use store::AllocationStore;
pub use db::SqliteStore;
pub use batch::{recompute_month_range, recompute_months, MonthOutcome, MonthStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
