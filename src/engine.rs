// Allocation engine - applies each category's rule to the month's grouped
// ledger and produces per-location allocation rows plus a structured run
// report. Pure and synchronous; all I/O happens at the store seam.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::bingo::{compute_bingo_percentage, BingoRevenue};
use crate::error::Result;
use crate::grouping::{group_by_category, GroupedCategory, UnmappedSpend};
use crate::ledger::{
    apply_percent, round_cents, ExpenseTransaction, LocationPair, MappingTable, Month, Session,
    Side, TransactionSnapshot,
};
use crate::overrides::{AllocationValue, OverrideSnapshot, RowKey};
use crate::rules::{AllocationMethod, AllocationRule, RuleSet};
use crate::store::AllocationStore;

// ============================================================================
// MONTHLY ALLOCATION ROW
// ============================================================================

/// Namespace for v5 allocation row ids.
const ALLOCATION_ID_NAMESPACE: uuid::Uuid =
    uuid::Uuid::from_u128(0x5b1e6f2a_9c41_4d8a_b7d3_0e2f84c6a913);

/// One organization x month x location x expense-category output row.
/// Replaced by every engine run unless frozen by an override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyAllocation {
    pub id: String,
    pub organization_id: String,
    pub month: Month,

    /// Tracked location code ("SC", "RWC").
    pub location: String,

    pub expense_category: String,

    /// Raw category total over both tracked locations, before qb_percentage.
    pub qb_total_amount: Decimal,

    pub qb_transaction_count: u32,

    pub allocation_method: AllocationMethod,

    /// This location's share of the category, 0-100.
    pub location_split_percent: Decimal,

    /// The bingo percentage this row's bingo amount was derived with. 100
    /// for methods whose location amount already is the bingo amount
    /// (QB_CLASS_SPLIT, FIXED_PERCENTAGES), so overrides reuse it safely.
    pub bingo_percentage: Decimal,

    /// Computed amounts, or a frozen manual override on top of them.
    pub value: AllocationValue,

    /// Contributing ledger lines for audit.
    pub source_transactions: Vec<TransactionSnapshot>,

    pub rules_applied_at: DateTime<Utc>,
}

impl MonthlyAllocation {
    pub fn key(&self) -> RowKey {
        (self.location.clone(), self.expense_category.clone())
    }

    /// Deterministic row id from the natural key. Recomputing a month with
    /// unchanged inputs yields the same ids, so an allocation id an operator
    /// noted for an override stays valid across recomputes.
    pub fn row_id(
        organization_id: &str,
        month: Month,
        location: &str,
        expense_category: &str,
    ) -> String {
        let key = format!("{}|{}|{}|{}", organization_id, month, location, expense_category);
        uuid::Uuid::new_v5(&ALLOCATION_ID_NAMESPACE, key.as_bytes()).to_string()
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// Why a category produced no allocation this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No allocation rule configured for the category.
    NoRule,

    /// Caller marked the category as derivative (computed elsewhere, e.g.
    /// payout-based COGS) and excluded it from this pass.
    ExcludedByCaller,

    /// The rule exists but failed validation.
    InvalidRule(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoRule => write!(f, "no allocation rule configured"),
            SkipReason::ExcludedByCaller => write!(f, "excluded by caller"),
            SkipReason::InvalidRule(msg) => write!(f, "invalid rule: {}", msg),
        }
    }
}

/// Per-category allocation summary for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryOutcome {
    pub expense_category: String,
    pub method: AllocationMethod,
    pub qb_total_amount: Decimal,
    pub total_allocated: Decimal,
}

/// Structured result of one month's run: everything an operator needs to
/// audit the run without reading logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub organization_id: String,
    pub month: Month,
    pub bingo: BingoRevenue,
    pub allocated: Vec<CategoryOutcome>,
    pub skipped: Vec<(String, SkipReason)>,
    pub unmapped: UnmappedSpend,
    pub overrides_preserved: Vec<RowKey>,
    pub rules_applied_at: DateTime<Utc>,
}

/// Rows plus report from one pure compute pass.
#[derive(Debug, Clone)]
pub struct MonthComputation {
    pub rows: Vec<MonthlyAllocation>,
    pub report: RunReport,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Caller knobs for a recompute run.
#[derive(Debug, Clone)]
pub struct RecomputeOptions {
    /// Keep existing overridden rows frozen (default). Setting this false
    /// explicitly discards user overrides for the month.
    pub preserve_overrides: bool,

    /// Derivative categories to exclude even when a rule exists.
    pub skip_categories: HashSet<String>,
}

impl Default for RecomputeOptions {
    fn default() -> Self {
        RecomputeOptions {
            preserve_overrides: true,
            skip_categories: HashSet::new(),
        }
    }
}

/// In-memory inputs for one month's pure computation.
#[derive(Debug, Clone)]
pub struct MonthInputs {
    pub organization_id: String,
    pub month: Month,
    pub transactions: Vec<ExpenseTransaction>,
    pub mappings: MappingTable,
    pub rules: RuleSet,
    pub sessions: Vec<Session>,
}

/// The allocation engine for one organization's tracked location pair.
/// No ambient state: every operation takes the organization id explicitly
/// through its inputs.
pub struct AllocationEngine {
    pair: LocationPair,
    options: RecomputeOptions,
}

impl AllocationEngine {
    pub fn new(pair: LocationPair) -> Self {
        AllocationEngine { pair, options: RecomputeOptions::default() }
    }

    pub fn with_options(pair: LocationPair, options: RecomputeOptions) -> Self {
        AllocationEngine { pair, options }
    }

    pub fn pair(&self) -> &LocationPair {
        &self.pair
    }

    /// Pure single-pass computation of one month's allocations.
    ///
    /// Category-level failures are isolated: a category with no rule or a
    /// bad rule lands in the report's skip list and the rest of the month
    /// still allocates.
    pub fn compute_month(&self, inputs: &MonthInputs) -> MonthComputation {
        let rules_applied_at = Utc::now();
        let bingo = compute_bingo_percentage(&inputs.sessions, &self.pair);
        let grouped = group_by_category(&inputs.transactions, &inputs.mappings, &self.pair);

        if grouped.unmapped.count > 0 {
            warn!(
                organization = %inputs.organization_id,
                month = %inputs.month,
                amount = %grouped.unmapped.amount,
                count = grouped.unmapped.count,
                "unmapped spend excluded from allocation"
            );
        }

        let mut rows: Vec<MonthlyAllocation> = Vec::new();
        let mut allocated: Vec<CategoryOutcome> = Vec::new();
        let mut skipped: Vec<(String, SkipReason)> = Vec::new();

        for name in grouped.category_names() {
            let category = &grouped.categories[name];

            if self.options.skip_categories.contains(name) {
                debug!(category = name, "category excluded by caller");
                skipped.push((name.to_string(), SkipReason::ExcludedByCaller));
                continue;
            }

            let Some(rule) = inputs.rules.get(name) else {
                warn!(
                    category = name,
                    month = %inputs.month,
                    "no allocation rule for category; skipping"
                );
                skipped.push((name.to_string(), SkipReason::NoRule));
                continue;
            };

            if let Err(err) = rule.validate() {
                warn!(category = name, error = %err, "allocation rule failed validation");
                skipped.push((name.to_string(), SkipReason::InvalidRule(err.to_string())));
                continue;
            }

            let category_rows =
                self.allocate_category(inputs, category, rule, &bingo, rules_applied_at);

            let total_allocated: Decimal =
                category_rows.iter().map(|r| r.value.allocated_amount()).sum();

            allocated.push(CategoryOutcome {
                expense_category: name.to_string(),
                method: rule.effective_method(),
                qb_total_amount: category.total,
                total_allocated,
            });
            rows.extend(category_rows);
        }

        let report = RunReport {
            organization_id: inputs.organization_id.clone(),
            month: inputs.month,
            bingo,
            allocated,
            skipped,
            unmapped: grouped.unmapped.clone(),
            overrides_preserved: Vec::new(),
            rules_applied_at,
        };

        MonthComputation { rows, report }
    }

    /// Apply one rule to one grouped category.
    fn allocate_category(
        &self,
        inputs: &MonthInputs,
        category: &GroupedCategory,
        rule: &AllocationRule,
        bingo: &BingoRevenue,
        rules_applied_at: DateTime<Utc>,
    ) -> Vec<MonthlyAllocation> {
        // A rule-level override substitutes for the month's percentage.
        let bingo_pct = rule
            .bingo_percentage_override
            .unwrap_or(bingo.bingo_percentage);

        let method = rule.effective_method();
        match method {
            AllocationMethod::QbClassSplit => {
                self.qb_class_split(inputs, category, rule, rules_applied_at)
            }
            AllocationMethod::FixedPercentages => {
                self.fixed_percentages(inputs, category, rule, rules_applied_at)
            }
            AllocationMethod::ScOnly => {
                self.sc_only(inputs, category, rule, bingo_pct, rules_applied_at)
            }
            AllocationMethod::RevenueSplit => {
                self.revenue_split(inputs, category, rule, bingo, bingo_pct, rules_applied_at)
            }
        }
    }

    /// QB_CLASS_SPLIT: trust the ledger's own class tagging. qb_percentage
    /// is a pre-filter on the raw class-split amounts; the optional
    /// adjustment multiplier layers on after it. The location amount
    /// already is the bingo-relevant amount, so the row's bingo percentage
    /// is 100.
    fn qb_class_split(
        &self,
        inputs: &MonthInputs,
        category: &GroupedCategory,
        rule: &AllocationRule,
        rules_applied_at: DateTime<Utc>,
    ) -> Vec<MonthlyAllocation> {
        let adjustment = rule.class_split_adjustment_percent.unwrap_or(dec!(100));

        Side::BOTH
            .into_iter()
            .map(|side| {
                let filtered = apply_percent(category.subtotal(side), rule.qb_percentage);
                let amount = round_cents(apply_percent(filtered, adjustment));

                let split_percent = if category.total.is_zero() {
                    Decimal::ZERO
                } else {
                    (amount / category.total * dec!(100)).round_dp(2)
                };

                self.row(
                    inputs,
                    category,
                    side,
                    AllocationMethod::QbClassSplit,
                    split_percent,
                    dec!(100),
                    amount,
                    amount,
                    rules_applied_at,
                )
            })
            .collect()
    }

    /// FIXED_PERCENTAGES: the configured split already is the final
    /// bingo-relevant split; neither qb_percentage nor the bingo percentage
    /// applies.
    fn fixed_percentages(
        &self,
        inputs: &MonthInputs,
        category: &GroupedCategory,
        rule: &AllocationRule,
        rules_applied_at: DateTime<Utc>,
    ) -> Vec<MonthlyAllocation> {
        let fixed = [
            (Side::Primary, rule.fixed_location_a_percent.unwrap_or(Decimal::ZERO)),
            (Side::Secondary, rule.fixed_location_b_percent.unwrap_or(Decimal::ZERO)),
        ];

        fixed
            .into_iter()
            .map(|(side, percent)| {
                let amount = round_cents(apply_percent(category.total, percent));
                self.row(
                    inputs,
                    category,
                    side,
                    AllocationMethod::FixedPercentages,
                    percent,
                    dec!(100),
                    amount,
                    amount,
                    rules_applied_at,
                )
            })
            .collect()
    }

    /// SC_ONLY: the whole adjusted, bingo-scaled total goes to the primary
    /// location; the secondary gets no row at all.
    fn sc_only(
        &self,
        inputs: &MonthInputs,
        category: &GroupedCategory,
        rule: &AllocationRule,
        bingo_pct: Decimal,
        rules_applied_at: DateTime<Utc>,
    ) -> Vec<MonthlyAllocation> {
        let adjusted = apply_percent(category.total, rule.qb_percentage);
        let amount = round_cents(apply_percent(adjusted, bingo_pct));

        vec![self.row(
            inputs,
            category,
            Side::Primary,
            AllocationMethod::ScOnly,
            dec!(100),
            bingo_pct,
            amount,
            amount,
            rules_applied_at,
        )]
    }

    /// REVENUE_SPLIT: pre-filter, scale by the bingo percentage, then split
    /// in proportion to each tracked location's session revenue. Both
    /// locations get zero when there was no tracked revenue.
    fn revenue_split(
        &self,
        inputs: &MonthInputs,
        category: &GroupedCategory,
        rule: &AllocationRule,
        bingo: &BingoRevenue,
        bingo_pct: Decimal,
        rules_applied_at: DateTime<Utc>,
    ) -> Vec<MonthlyAllocation> {
        let adjusted = apply_percent(category.total, rule.qb_percentage);
        let bingo_total = apply_percent(adjusted, bingo_pct);

        Side::BOTH
            .into_iter()
            .map(|side| {
                let amount = if bingo.tracked_revenue.is_zero() {
                    Decimal::ZERO
                } else {
                    let share = bingo.revenue_for(&self.pair, side) / bingo.tracked_revenue;
                    round_cents(bingo_total * share)
                };
                let split_percent = bingo.split_percent_for(&self.pair, side).round_dp(2);

                self.row(
                    inputs,
                    category,
                    side,
                    AllocationMethod::RevenueSplit,
                    split_percent,
                    bingo_pct,
                    amount,
                    amount,
                    rules_applied_at,
                )
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn row(
        &self,
        inputs: &MonthInputs,
        category: &GroupedCategory,
        side: Side,
        method: AllocationMethod,
        location_split_percent: Decimal,
        bingo_percentage: Decimal,
        allocated_amount: Decimal,
        bingo_amount: Decimal,
        rules_applied_at: DateTime<Utc>,
    ) -> MonthlyAllocation {
        let location = self.pair.code(side).to_string();
        MonthlyAllocation {
            id: MonthlyAllocation::row_id(
                &inputs.organization_id,
                inputs.month,
                &location,
                &category.expense_category,
            ),
            organization_id: inputs.organization_id.clone(),
            month: inputs.month,
            location,
            expense_category: category.expense_category.clone(),
            qb_total_amount: category.total,
            qb_transaction_count: category.transaction_count,
            allocation_method: method,
            location_split_percent,
            bingo_percentage,
            value: AllocationValue::computed(allocated_amount, bingo_amount),
            source_transactions: category.source_transactions.clone(),
            rules_applied_at,
        }
    }

    // ========================================================================
    // ORCHESTRATION (store-facing)
    // ========================================================================

    /// Recompute one month end to end: load inputs, snapshot overrides
    /// before anything is deleted, compute, merge preserved rows, write.
    ///
    /// Recomputation is a pure function of ledger + rules + preserved
    /// overrides, so a failed write is safe to retry wholesale.
    pub fn recompute_month(
        &self,
        store: &dyn AllocationStore,
        organization_id: &str,
        month: Month,
    ) -> Result<RunReport> {
        let start = month.first_day();
        let end = month.last_day();

        let transactions = store.load_expense_transactions(organization_id, start, end)?;
        let mappings = MappingTable::from_mappings(&store.load_category_mappings(organization_id)?);
        let rules = RuleSet::from_rules(store.load_allocation_rules(organization_id)?);
        let sessions = store.load_sessions(organization_id, start, end)?;

        // Snapshot override state before the delete step, so an override
        // landing between read and delete cannot be lost.
        let snapshot = if self.options.preserve_overrides {
            let existing = store.load_existing_allocations(organization_id, month)?;
            OverrideSnapshot::capture(&existing)
        } else {
            OverrideSnapshot::default()
        };

        let inputs = MonthInputs {
            organization_id: organization_id.to_string(),
            month,
            transactions,
            mappings,
            rules,
            sessions,
        };

        let MonthComputation { rows, mut report } = self.compute_month(&inputs);
        let (merged, preserved) = snapshot.merge_preserved(rows)?;

        store.write_allocations(
            organization_id,
            month,
            &merged,
            self.options.preserve_overrides,
        )?;

        report.overrides_preserved = preserved;
        info!(
            organization = organization_id,
            month = %month,
            allocated = report.allocated.len(),
            skipped = report.skipped.len(),
            overrides_preserved = report.overrides_preserved.len(),
            bingo_percentage = %report.bingo.bingo_percentage,
            "month recomputed"
        );

        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
