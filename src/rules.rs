// Allocation rules - rules as data
// One rule per expense category per organization. Exactly one of four
// mutually exclusive allocation methods governs a category at a time.

use anyhow::Context;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{EngineError, Result};

// ============================================================================
// ALLOCATION METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    /// Trust the ledger's own class tagging: split by per-location subtotals.
    QbClassSplit,

    /// Fixed percentage per location, no bingo percentage applied.
    FixedPercentages,

    /// Everything to the designated (primary) location.
    ScOnly,

    /// Split proportionally to each location's session revenue. Default.
    RevenueSplit,
}

impl AllocationMethod {
    /// Stable string for storage and reports.
    pub fn code(&self) -> &'static str {
        match self {
            AllocationMethod::QbClassSplit => "qb_class_split",
            AllocationMethod::FixedPercentages => "fixed_percentages",
            AllocationMethod::ScOnly => "sc_only",
            AllocationMethod::RevenueSplit => "revenue_split",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "qb_class_split" => Ok(AllocationMethod::QbClassSplit),
            "fixed_percentages" => Ok(AllocationMethod::FixedPercentages),
            "sc_only" => Ok(AllocationMethod::ScOnly),
            "revenue_split" => Ok(AllocationMethod::RevenueSplit),
            other => Err(EngineError::validation(
                "allocation_method",
                format!("unrecognized method {:?}", other),
            )),
        }
    }
}

// ============================================================================
// ALLOCATION RULE
// ============================================================================

fn default_qb_percentage() -> Decimal {
    dec!(100)
}

/// Per-category allocation policy.
///
/// Older rule rows carry indicator fields instead of an explicit method;
/// `effective_method` resolves those with a fixed precedence so rule
/// selection is never ambiguous at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRule {
    pub organization_id: String,

    /// Normalized expense category this rule governs.
    pub expense_category: String,

    /// Explicit method. Wins over all indicator fields when present.
    #[serde(default)]
    pub method: Option<AllocationMethod>,

    /// Pre-filter: share of the raw category total that is bingo-related,
    /// applied before any location splitting. 0-100, default 100.
    #[serde(default = "default_qb_percentage")]
    pub qb_percentage: Decimal,

    /// Legacy indicator for QbClassSplit.
    #[serde(default)]
    pub use_qb_class_split: bool,

    /// Legacy indicator for ScOnly.
    #[serde(default)]
    pub sc_only: bool,

    /// FixedPercentages parameters; setting either is also the legacy
    /// indicator for that method. Must sum to <= 100.
    #[serde(default)]
    pub fixed_location_a_percent: Option<Decimal>,

    #[serde(default)]
    pub fixed_location_b_percent: Option<Decimal>,

    /// When present, substitutes for the month's computed bingo percentage
    /// for this category only.
    #[serde(default)]
    pub bingo_percentage_override: Option<Decimal>,

    /// Extra multiplier layered on top of a class split (0-100). Replaces
    /// the old hard-coded "this category counts at 50%" special case.
    #[serde(default)]
    pub class_split_adjustment_percent: Option<Decimal>,
}

impl AllocationRule {
    /// Minimal rule: revenue split at 100%.
    pub fn revenue_split(organization_id: &str, expense_category: &str) -> Self {
        AllocationRule {
            organization_id: organization_id.to_string(),
            expense_category: expense_category.to_string(),
            method: Some(AllocationMethod::RevenueSplit),
            qb_percentage: default_qb_percentage(),
            use_qb_class_split: false,
            sc_only: false,
            fixed_location_a_percent: None,
            fixed_location_b_percent: None,
            bingo_percentage_override: None,
            class_split_adjustment_percent: None,
        }
    }

    /// Resolve which method governs this rule.
    ///
    /// Explicit `method` wins. For legacy rows the indicator fields resolve
    /// with precedence QB_CLASS_SPLIT > FIXED_PERCENTAGES > SC_ONLY >
    /// REVENUE_SPLIT; REVENUE_SPLIT is the fallback when nothing is set.
    pub fn effective_method(&self) -> AllocationMethod {
        if let Some(method) = self.method {
            return method;
        }
        if self.use_qb_class_split {
            AllocationMethod::QbClassSplit
        } else if self.fixed_location_a_percent.is_some() || self.fixed_location_b_percent.is_some()
        {
            AllocationMethod::FixedPercentages
        } else if self.sc_only {
            AllocationMethod::ScOnly
        } else {
            AllocationMethod::RevenueSplit
        }
    }

    /// Validate parameters for the resolved method. A bad rule fails its
    /// own category only; sibling categories still allocate.
    pub fn validate(&self) -> Result<()> {
        check_percent("qb_percentage", self.qb_percentage)?;

        if let Some(pct) = self.bingo_percentage_override {
            check_percent("bingo_percentage_override", pct)?;
        }
        if let Some(pct) = self.class_split_adjustment_percent {
            check_percent("class_split_adjustment_percent", pct)?;
        }

        if self.effective_method() == AllocationMethod::FixedPercentages {
            let a = self.fixed_location_a_percent.unwrap_or(Decimal::ZERO);
            let b = self.fixed_location_b_percent.unwrap_or(Decimal::ZERO);
            check_percent("fixed_location_a_percent", a)?;
            check_percent("fixed_location_b_percent", b)?;
            if a + b > dec!(100) {
                return Err(EngineError::validation(
                    "fixed_location_percents",
                    format!("must sum to <= 100, got {} + {}", a, b),
                ));
            }
            if self.fixed_location_a_percent.is_none() && self.fixed_location_b_percent.is_none() {
                return Err(EngineError::validation(
                    "fixed_location_percents",
                    "fixed_percentages rule has neither percentage set",
                ));
            }
        }

        Ok(())
    }
}

fn check_percent(field: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO || value > dec!(100) {
        return Err(EngineError::validation(
            field,
            format!("must be within 0-100, got {}", value),
        ));
    }
    Ok(())
}

// ============================================================================
// RULE SET
// ============================================================================

/// All rules for one organization, keyed by expense category.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    by_category: HashMap<String, AllocationRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet { by_category: HashMap::new() }
    }

    /// Build from a list; a later rule for the same category wins.
    pub fn from_rules(rules: Vec<AllocationRule>) -> Self {
        let mut set = RuleSet::new();
        for rule in rules {
            set.insert(rule);
        }
        set
    }

    /// Load rules from a JSON file (array of AllocationRule).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read rules file {:?}", path.as_ref()))
            .map_err(EngineError::Io)?;

        let rules: Vec<AllocationRule> = serde_json::from_str(&content).map_err(|e| {
            EngineError::validation("rules_file", format!("failed to parse rules JSON: {}", e))
        })?;

        Ok(RuleSet::from_rules(rules))
    }

    pub fn get(&self, expense_category: &str) -> Option<&AllocationRule> {
        self.by_category.get(expense_category)
    }

    pub fn insert(&mut self, rule: AllocationRule) {
        self.by_category.insert(rule.expense_category.clone(), rule);
    }

    pub fn len(&self) -> usize {
        self.by_category.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_category.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationRule> {
        self.by_category.values()
    }
}

// ============================================================================
// TESTS
// ============================================================================
