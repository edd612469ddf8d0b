// Category grouper - aggregate tracked-location expense transactions by
// mapped expense category, preserving per-location subtotals and
// per-transaction provenance for audit.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::ledger::{ExpenseTransaction, LocationPair, MappingTable, Side, TransactionSnapshot};

// ============================================================================
// GROUPED OUTPUT
// ============================================================================

/// One expense category's aggregated ledger activity for the month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedCategory {
    pub expense_category: String,

    /// Sum over both tracked locations.
    pub total: Decimal,

    /// Subtotal per tracked side, from each transaction's own class tag.
    /// Feeds QB_CLASS_SPLIT.
    pub per_location: HashMap<Side, Decimal>,

    pub transaction_count: u32,

    /// Contributing ledger lines, serialized onto allocation rows.
    pub source_transactions: Vec<TransactionSnapshot>,
}

impl GroupedCategory {
    fn new(expense_category: &str) -> Self {
        GroupedCategory {
            expense_category: expense_category.to_string(),
            total: Decimal::ZERO,
            per_location: HashMap::new(),
            transaction_count: 0,
            source_transactions: Vec::new(),
        }
    }

    pub fn subtotal(&self, side: Side) -> Decimal {
        self.per_location.get(&side).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Spend that never reaches allocation, tallied for audit. Unmapped spend
/// must not silently enter allocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnmappedSpend {
    pub amount: Decimal,
    pub count: u32,

    /// Distinct raw QB names seen without a mapping, for the operator to
    /// extend the mapping table.
    pub qb_category_names: BTreeSet<String>,
}

/// Full grouping result for one month's tracked-location ledger.
#[derive(Debug, Clone, Default)]
pub struct GroupedLedger {
    pub categories: HashMap<String, GroupedCategory>,
    pub unmapped: UnmappedSpend,

    /// Transactions whose class tag matched neither tracked location; they
    /// never participate in allocation.
    pub untracked_count: u32,
}

impl GroupedLedger {
    pub fn get(&self, expense_category: &str) -> Option<&GroupedCategory> {
        self.categories.get(expense_category)
    }

    /// Category names in deterministic order, for stable reports and rows.
    pub fn category_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.categories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// GROUPING
// ============================================================================

/// Group tracked-location transactions by mapped expense category.
///
/// A transaction whose raw QB name has no mapping entry is excluded from the
/// grouped output and tallied in `unmapped`; one whose class tag is not a
/// tracked location is dropped from grouping entirely (counted only).
pub fn group_by_category(
    transactions: &[ExpenseTransaction],
    mappings: &MappingTable,
    pair: &LocationPair,
) -> GroupedLedger {
    let mut grouped = GroupedLedger::default();

    for tx in transactions {
        let Some(side) = pair.side_for_class(&tx.qb_class_name) else {
            debug!(
                class = %tx.qb_class_name,
                tx = %tx.id,
                "skipping transaction outside tracked classes"
            );
            grouped.untracked_count += 1;
            continue;
        };

        let Some(expense_category) = mappings.expense_category(&tx.qb_category_name) else {
            grouped.unmapped.amount += tx.amount;
            grouped.unmapped.count += 1;
            grouped
                .unmapped
                .qb_category_names
                .insert(tx.qb_category_name.clone());
            continue;
        };

        let entry = grouped
            .categories
            .entry(expense_category.to_string())
            .or_insert_with(|| GroupedCategory::new(expense_category));

        entry.total += tx.amount;
        *entry.per_location.entry(side).or_insert(Decimal::ZERO) += tx.amount;
        entry.transaction_count += 1;
        entry.source_transactions.push(TransactionSnapshot::from(tx));
    }

    // A month where every transaction missed both tracked classes almost
    // always means the configured class names are wrong, not an empty ledger.
    if !transactions.is_empty() && grouped.untracked_count as usize == transactions.len() {
        warn!(
            untracked = grouped.untracked_count,
            primary_class = %pair.primary.class_name,
            secondary_class = %pair.secondary.class_name,
            "no transaction matched either tracked class; check location configuration"
        );
    }

    grouped
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CategoryMapping, TrackedLocation};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn pair() -> LocationPair {
        LocationPair::new(
            TrackedLocation::new("SC", "SC Hall", Some("loc-sc")),
            TrackedLocation::new("RWC", "RWC Hall", Some("loc-rwc")),
        )
    }

    fn mappings() -> MappingTable {
        let rows = vec![
            mapping("PG&E", "Utilities"),
            mapping("Water District", "Utilities"),
            mapping("State Farm", "Insurance"),
        ];
        MappingTable::from_mappings(&rows)
    }

    fn mapping(qb: &str, category: &str) -> CategoryMapping {
        CategoryMapping {
            organization_id: "org-1".to_string(),
            qb_category_name: qb.to_string(),
            expense_category: category.to_string(),
        }
    }

    fn tx(qb_category: &str, class: &str, amount: Decimal) -> ExpenseTransaction {
        ExpenseTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: "org-1".to_string(),
            expense_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            qb_category_name: qb_category.to_string(),
            qb_class_name: class.to_string(),
            amount,
            vendor: "vendor".to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_many_to_one_mapping_merges_categories() {
        let transactions = vec![
            tx("PG&E", "SC Hall", dec!(600)),
            tx("Water District", "SC Hall", dec!(150)),
            tx("PG&E", "RWC Hall", dec!(250)),
        ];
        let grouped = group_by_category(&transactions, &mappings(), &pair());

        let utilities = grouped.get("Utilities").unwrap();
        assert_eq!(utilities.total, dec!(1000));
        assert_eq!(utilities.transaction_count, 3);
        assert_eq!(utilities.subtotal(Side::Primary), dec!(750));
        assert_eq!(utilities.subtotal(Side::Secondary), dec!(250));
        assert_eq!(utilities.source_transactions.len(), 3);
    }

    #[test]
    fn test_unmapped_spend_is_isolated() {
        let transactions = vec![
            tx("PG&E", "SC Hall", dec!(600)),
            tx("Mystery Account", "SC Hall", dec!(9999)),
            tx("Mystery Account", "RWC Hall", dec!(1)),
        ];
        let grouped = group_by_category(&transactions, &mappings(), &pair());

        assert_eq!(grouped.categories.len(), 1);
        assert_eq!(grouped.unmapped.amount, dec!(10000));
        assert_eq!(grouped.unmapped.count, 2);
        assert!(grouped.unmapped.qb_category_names.contains("Mystery Account"));

        // The unmapped amount never leaks into a grouped category.
        let utilities = grouped.get("Utilities").unwrap();
        assert_eq!(utilities.total, dec!(600));
        assert_eq!(utilities.transaction_count, 1);
    }

    #[test]
    fn test_untracked_class_is_dropped() {
        let transactions = vec![
            tx("PG&E", "SC Hall", dec!(600)),
            tx("PG&E", "Warehouse", dec!(400)),
            tx("PG&E", "", dec!(50)),
        ];
        let grouped = group_by_category(&transactions, &mappings(), &pair());

        assert_eq!(grouped.get("Utilities").unwrap().total, dec!(600));
        assert_eq!(grouped.untracked_count, 2);
        assert_eq!(grouped.unmapped.count, 0, "untracked is not unmapped");
    }

    #[test]
    fn test_location_code_does_not_match_as_class() {
        // Class tags resolve against the configured class names ("SC Hall"),
        // never the short codes ("SC"); a code-for-class mix-up must surface
        // as fully untracked instead of partially grouping.
        let transactions = vec![tx("PG&E", "SC", dec!(600)), tx("PG&E", "RWC", dec!(400))];
        let grouped = group_by_category(&transactions, &mappings(), &pair());

        assert!(grouped.categories.is_empty());
        assert_eq!(grouped.untracked_count, 2);
        assert_eq!(grouped.unmapped.count, 0);
    }

    #[test]
    fn test_negative_amounts_flow_through() {
        // A refund posts as a credit and reduces the category total.
        let transactions = vec![
            tx("PG&E", "SC Hall", dec!(600)),
            tx("PG&E", "SC Hall", dec!(-100)),
        ];
        let grouped = group_by_category(&transactions, &mappings(), &pair());

        let utilities = grouped.get("Utilities").unwrap();
        assert_eq!(utilities.total, dec!(500));
        assert_eq!(utilities.subtotal(Side::Primary), dec!(500));
    }

    #[test]
    fn test_category_names_are_sorted() {
        let transactions = vec![
            tx("State Farm", "SC Hall", dec!(100)),
            tx("PG&E", "SC Hall", dec!(100)),
        ];
        let grouped = group_by_category(&transactions, &mappings(), &pair());
        assert_eq!(grouped.category_names(), vec!["Insurance", "Utilities"]);
    }
}
