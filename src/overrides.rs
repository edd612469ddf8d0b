// Manual overrides - frozen allocation amounts that survive recomputation
// Modeled as a tagged value, not nullable columns beside computed ones, so
// "overrides are never silently recomputed" holds structurally.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::MonthlyAllocation;
use crate::error::{EngineError, Result};
use crate::ledger::{apply_percent, round_cents};

// ============================================================================
// ALLOCATION VALUE
// ============================================================================

/// The money carried by one allocation row: either the engine's computed
/// amounts, or a manual override frozen over them. An overridden row keeps
/// the pre-override computed pair so the delta is always auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AllocationValue {
    Computed {
        allocated_amount: Decimal,
        bingo_amount: Decimal,
    },
    Overridden {
        allocated_amount: Decimal,
        bingo_amount: Decimal,
        computed_allocated_amount: Decimal,
        computed_bingo_amount: Decimal,
        notes: String,
    },
}

impl AllocationValue {
    pub fn computed(allocated_amount: Decimal, bingo_amount: Decimal) -> Self {
        AllocationValue::Computed { allocated_amount, bingo_amount }
    }

    /// Amount surfaced to callers: the override when present.
    pub fn allocated_amount(&self) -> Decimal {
        match self {
            AllocationValue::Computed { allocated_amount, .. }
            | AllocationValue::Overridden { allocated_amount, .. } => *allocated_amount,
        }
    }

    pub fn bingo_amount(&self) -> Decimal {
        match self {
            AllocationValue::Computed { bingo_amount, .. }
            | AllocationValue::Overridden { bingo_amount, .. } => *bingo_amount,
        }
    }

    pub fn is_overridden(&self) -> bool {
        matches!(self, AllocationValue::Overridden { .. })
    }

    /// The engine-computed pair, whether or not an override sits on top.
    pub fn computed_pair(&self) -> (Decimal, Decimal) {
        match self {
            AllocationValue::Computed { allocated_amount, bingo_amount } => {
                (*allocated_amount, *bingo_amount)
            }
            AllocationValue::Overridden {
                computed_allocated_amount,
                computed_bingo_amount,
                ..
            } => (*computed_allocated_amount, *computed_bingo_amount),
        }
    }

    pub fn override_notes(&self) -> Option<&str> {
        match self {
            AllocationValue::Computed { .. } => None,
            AllocationValue::Overridden { notes, .. } => Some(notes.as_str()),
        }
    }
}

// ============================================================================
// APPLY / CLEAR
// ============================================================================

/// Freeze a manual amount over a row. The override bingo amount is derived
/// from the row's already-stored bingo percentage, not a recomputed one.
/// Re-overriding keeps the original computed pair for audit.
pub fn apply_override(row: &mut MonthlyAllocation, amount: Decimal, notes: &str) {
    let (computed_allocated, computed_bingo) = row.value.computed_pair();
    let override_bingo = round_cents(apply_percent(amount, row.bingo_percentage));

    row.value = AllocationValue::Overridden {
        allocated_amount: amount,
        bingo_amount: override_bingo,
        computed_allocated_amount: computed_allocated,
        computed_bingo_amount: computed_bingo,
        notes: notes.to_string(),
    };
}

/// Unfreeze a row: the audited computed pair becomes current again. The
/// next recompute is then free to replace the row.
pub fn clear_override(row: &mut MonthlyAllocation) {
    let (allocated, bingo) = row.value.computed_pair();
    row.value = AllocationValue::computed(allocated, bingo);
}

// ============================================================================
// OVERRIDE SNAPSHOT
// ============================================================================

/// Key identifying one allocation row within a month.
pub type RowKey = (String, String); // (location code, expense category)

/// Overridden rows captured *before* the month's delete step, so a user
/// override landing between read and delete can never be lost.
#[derive(Debug, Clone, Default)]
pub struct OverrideSnapshot {
    rows: HashMap<RowKey, MonthlyAllocation>,
}

impl OverrideSnapshot {
    /// Capture every overridden row from the month's existing allocations.
    pub fn capture(existing: &[MonthlyAllocation]) -> Self {
        let rows = existing
            .iter()
            .filter(|row| row.value.is_overridden())
            .map(|row| (row.key(), row.clone()))
            .collect();
        OverrideSnapshot { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    /// Merge freshly computed rows with the snapshot: a preserved row
    /// replaces its computed twin wholesale (all-or-nothing per row), and
    /// preserved rows with no computed twin are carried through unchanged.
    ///
    /// Returns the merged row set and the keys that were preserved. Errors
    /// if a snapshotted row somehow fails to appear in the merge output -
    /// that would mean an override was about to be dropped.
    pub fn merge_preserved(
        &self,
        computed: Vec<MonthlyAllocation>,
    ) -> Result<(Vec<MonthlyAllocation>, Vec<RowKey>)> {
        let mut preserved: Vec<RowKey> = Vec::new();
        let mut merged: Vec<MonthlyAllocation> = Vec::with_capacity(computed.len());
        let mut seen: HashMap<RowKey, ()> = HashMap::new();

        for row in computed {
            let key = row.key();
            if let Some(frozen) = self.rows.get(&key) {
                merged.push(frozen.clone());
                preserved.push(key.clone());
            } else {
                merged.push(row);
            }
            seen.insert(key, ());
        }

        // Overridden rows whose category/location produced no computed row
        // this run (rule removed, ledger empty) still survive.
        for (key, frozen) in &self.rows {
            if !seen.contains_key(key) {
                merged.push(frozen.clone());
                preserved.push(key.clone());
                seen.insert(key.clone(), ());
            }
        }

        for key in self.rows.keys() {
            if !merged.iter().any(|row| &row.key() == key) {
                return Err(EngineError::OverrideConflict(format!(
                    "overridden row {}/{} missing from merged output",
                    key.0, key.1
                )));
            }
        }

        Ok((merged, preserved))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::computed_row;
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_override_keeps_computed_pair() {
        // Row computed at 283.33 with a 50% bingo percentage.
        let mut row = computed_row("SC", "Utilities", dec!(283.33), dec!(283.33), dec!(50));

        apply_override(&mut row, dec!(300), "landlord invoice correction");

        assert!(row.value.is_overridden());
        assert_eq!(row.value.allocated_amount(), dec!(300));
        // Override bingo uses the row's stored percentage: 300 * 50%.
        assert_eq!(row.value.bingo_amount(), dec!(150.00));
        assert_eq!(row.value.computed_pair(), (dec!(283.33), dec!(283.33)));
        assert_eq!(row.value.override_notes(), Some("landlord invoice correction"));
    }

    #[test]
    fn test_reoverride_preserves_original_computed_audit() {
        let mut row = computed_row("SC", "Utilities", dec!(283.33), dec!(141.67), dec!(50));

        apply_override(&mut row, dec!(300), "first");
        apply_override(&mut row, dec!(310), "second");

        assert_eq!(row.value.allocated_amount(), dec!(310));
        assert_eq!(row.value.computed_pair(), (dec!(283.33), dec!(141.67)));
    }

    #[test]
    fn test_clear_override_restores_computed() {
        let mut row = computed_row("SC", "Utilities", dec!(283.33), dec!(141.67), dec!(50));
        apply_override(&mut row, dec!(300), "oops");
        clear_override(&mut row);

        assert!(!row.value.is_overridden());
        assert_eq!(row.value.allocated_amount(), dec!(283.33));
        assert_eq!(row.value.bingo_amount(), dec!(141.67));
    }

    #[test]
    fn test_snapshot_captures_only_overridden_rows() {
        let mut frozen = computed_row("SC", "Rent", dec!(1000), dec!(500), dec!(50));
        apply_override(&mut frozen, dec!(900), "");
        let plain = computed_row("RWC", "Rent", dec!(400), dec!(200), dec!(50));

        let snapshot = OverrideSnapshot::capture(&[frozen, plain]);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&("SC".to_string(), "Rent".to_string())));
    }

    #[test]
    fn test_merge_replaces_computed_twin_wholesale() {
        let mut frozen = computed_row("SC", "Rent", dec!(1000), dec!(500), dec!(50));
        apply_override(&mut frozen, dec!(900), "negotiated");
        let snapshot = OverrideSnapshot::capture(std::slice::from_ref(&frozen));

        // Recompute produced a different number for the same key.
        let recomputed = computed_row("SC", "Rent", dec!(1100), dec!(550), dec!(50));
        let other = computed_row("RWC", "Rent", dec!(400), dec!(200), dec!(50));

        let (merged, preserved) = snapshot.merge_preserved(vec![recomputed, other]).unwrap();

        assert_eq!(merged.len(), 2);
        let sc_row = merged.iter().find(|r| r.location == "SC").unwrap();
        assert!(sc_row.value.is_overridden());
        assert_eq!(sc_row.value.allocated_amount(), dec!(900));
        assert_eq!(preserved, vec![("SC".to_string(), "Rent".to_string())]);
    }

    #[test]
    fn test_merge_carries_orphan_overrides() {
        // Rule was removed, so recompute produced nothing for this key.
        let mut frozen = computed_row("SC", "Defunct", dec!(50), dec!(25), dec!(50));
        apply_override(&mut frozen, dec!(60), "keep");
        let snapshot = OverrideSnapshot::capture(std::slice::from_ref(&frozen));

        let (merged, preserved) = snapshot.merge_preserved(vec![]).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(merged[0].value.is_overridden());
        assert_eq!(preserved.len(), 1);
    }
}
