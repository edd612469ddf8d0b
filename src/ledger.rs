// Ledger inputs - expense transactions, sessions, category mappings
// Normalized, read-only inputs to the allocation engine. CSV ingest lives
// here too; the engine itself never touches files.

use anyhow::Context;
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{EngineError, Result};

// ============================================================================
// MONEY HELPERS
// ============================================================================

/// Round a money amount to cents, midpoint away from zero.
pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Apply a 0-100 percentage to an amount. Percentages are 0-100 throughout
/// the rule schema and outputs, never 0-1 fractions.
pub fn apply_percent(amount: Decimal, percent: Decimal) -> Decimal {
    amount * percent / dec!(100)
}

// ============================================================================
// CALENDAR MONTH
// ============================================================================

/// One calendar month, the unit of every engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(EngineError::validation(
                "month",
                format!("month number must be 1-12, got {}", month),
            ));
        }
        Ok(Month { year, month })
    }

    /// First day of the month.
    pub fn first_day(&self) -> NaiveDate {
        // Month is validated at construction, so this cannot fail.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    /// Last day of the month (handles leap years via chrono).
    pub fn last_day(&self) -> NaiveDate {
        let next = self.next();
        next.first_day().pred_opt().unwrap_or_default()
    }

    pub fn next(&self) -> Month {
        if self.month == 12 {
            Month { year: self.year + 1, month: 1 }
        } else {
            Month { year: self.year, month: self.month + 1 }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.first_day() && date <= self.last_day()
    }

    /// Inclusive range of months, for the batch driver.
    pub fn range(from: Month, to: Month) -> Vec<Month> {
        let mut months = Vec::new();
        let mut cur = from;
        while cur <= to {
            months.push(cur);
            cur = cur.next();
        }
        months
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = EngineError;

    /// Parse "YYYY-MM". Anything else is a validation error.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || EngineError::validation("month", format!("expected YYYY-MM, got {:?}", s));

        let (year_str, month_str) = s.split_once('-').ok_or_else(bad)?;
        if year_str.len() != 4 || month_str.len() != 2 {
            return Err(bad());
        }
        let year: i32 = year_str.parse().map_err(|_| bad())?;
        let month: u32 = month_str.parse().map_err(|_| bad())?;
        Month::new(year, month)
    }
}

// ============================================================================
// TRACKED LOCATIONS
// ============================================================================

/// Which of the two tracked locations a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Primary,
    Secondary,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Primary, Side::Secondary];
}

/// One tracked location: the QB class tag its expenses carry, the session
/// ledger id its revenue carries, and a short display code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedLocation {
    /// Short code used in outputs and reports (e.g. "SC").
    pub code: String,

    /// QB class name on expense transactions for this location.
    pub class_name: String,

    /// Session ledger location id. None when lookup failed to resolve it;
    /// the month still computes, with this location contributing nothing.
    pub location_id: Option<String>,
}

impl TrackedLocation {
    pub fn new(code: &str, class_name: &str, location_id: Option<&str>) -> Self {
        TrackedLocation {
            code: code.to_string(),
            class_name: class_name.to_string(),
            location_id: location_id.map(str::to_string),
        }
    }
}

/// The two locations participating in allocation. SC_ONLY rules designate
/// the primary side; swapping the pair redirects them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationPair {
    pub primary: TrackedLocation,
    pub secondary: TrackedLocation,
}

impl LocationPair {
    pub fn new(primary: TrackedLocation, secondary: TrackedLocation) -> Self {
        LocationPair { primary, secondary }
    }

    pub fn get(&self, side: Side) -> &TrackedLocation {
        match side {
            Side::Primary => &self.primary,
            Side::Secondary => &self.secondary,
        }
    }

    pub fn code(&self, side: Side) -> &str {
        &self.get(side).code
    }

    /// Resolve an expense class tag to a tracked side. Anything that is not
    /// one of the two tracked class names is unclassified and stays out of
    /// allocation.
    pub fn side_for_class(&self, class_name: &str) -> Option<Side> {
        if class_name.eq_ignore_ascii_case(&self.primary.class_name) {
            Some(Side::Primary)
        } else if class_name.eq_ignore_ascii_case(&self.secondary.class_name) {
            Some(Side::Secondary)
        } else {
            None
        }
    }

    /// Resolve a session location id to a tracked side. Sides whose id
    /// never resolved match nothing.
    pub fn side_for_location_id(&self, location_id: &str) -> Option<Side> {
        for side in Side::BOTH {
            if let Some(id) = &self.get(side).location_id {
                if id == location_id {
                    return Some(side);
                }
            }
        }
        None
    }
}

// ============================================================================
// EXPENSE TRANSACTIONS
// ============================================================================

/// One categorized P&L expense line, immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseTransaction {
    pub id: String,
    pub organization_id: String,
    pub expense_date: NaiveDate,

    /// Raw QB account/category name, mapped to an expense category by
    /// CategoryMapping before allocation.
    pub qb_category_name: String,

    /// QB class tag: one of the two tracked location classes, or anything
    /// else (treated as unclassified).
    pub qb_class_name: String,

    /// Signed amount; credits/refunds come through negative.
    pub amount: Decimal,

    pub vendor: String,
    pub description: String,
}

impl ExpenseTransaction {
    /// Hash for duplicate detection on re-import. Deduplication key, not
    /// identity - `id` is the identity.
    pub fn idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}",
            self.organization_id, self.expense_date, self.qb_category_name, self.amount, self.vendor
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// Per-transaction audit snapshot carried on every allocation row, so a
/// computed amount can always be traced back to its ledger lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub expense_date: NaiveDate,
    pub qb_category_name: String,
    pub qb_class_name: String,
    pub amount: Decimal,
    pub vendor: String,
    pub source_id: String,
}

impl From<&ExpenseTransaction> for TransactionSnapshot {
    fn from(tx: &ExpenseTransaction) -> Self {
        TransactionSnapshot {
            expense_date: tx.expense_date,
            qb_category_name: tx.qb_category_name.clone(),
            qb_class_name: tx.qb_class_name.clone(),
            amount: tx.amount,
            vendor: tx.vendor.clone(),
            source_id: tx.id.clone(),
        }
    }
}

// ============================================================================
// SESSIONS
// ============================================================================

/// One revenue-generating event. Revenue driver for REVENUE_SPLIT and the
/// bingo-percentage calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub organization_id: String,
    pub session_date: NaiveDate,
    pub location_id: String,
    pub total_sales: Decimal,
    pub session_type: String,
}

impl Session {
    pub fn idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}",
            self.organization_id, self.session_date, self.location_id, self.total_sales, self.session_type
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Sessions with negative sales are ledger corruption, not input.
    pub fn validate(&self) -> Result<()> {
        if self.total_sales < Decimal::ZERO {
            return Err(EngineError::validation(
                "total_sales",
                format!("session {} has negative sales {}", self.id, self.total_sales),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CATEGORY MAPPINGS
// ============================================================================

/// Raw QB category name -> normalized expense category. Many-to-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryMapping {
    pub organization_id: String,
    pub qb_category_name: String,
    pub expense_category: String,
}

/// Lookup table built from the mapping rows. Case-insensitive on the raw
/// QB name, matching how QB exports vary capitalization.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    by_qb_name: HashMap<String, String>,
}

impl MappingTable {
    pub fn from_mappings(mappings: &[CategoryMapping]) -> Self {
        let by_qb_name = mappings
            .iter()
            .map(|m| (m.qb_category_name.to_lowercase(), m.expense_category.clone()))
            .collect();
        MappingTable { by_qb_name }
    }

    pub fn expense_category(&self, qb_category_name: &str) -> Option<&str> {
        self.by_qb_name
            .get(&qb_category_name.to_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_qb_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_qb_name.is_empty()
    }
}

// ============================================================================
// CSV INGEST (plumbing - import collaborator contract only)
// ============================================================================

/// Expense row as exported to CSV. Headers follow the QB P&L detail export.
#[derive(Debug, Deserialize)]
struct RawExpenseRow {
    #[serde(rename = "Date")]
    date: String,

    #[serde(rename = "Account")]
    account: String,

    #[serde(rename = "Class", default)]
    class: String,

    #[serde(rename = "Amount")]
    amount: Decimal,

    #[serde(rename = "Vendor", default)]
    vendor: String,

    #[serde(rename = "Description", default)]
    description: String,
}

/// Session row as exported from the session tracker.
#[derive(Debug, Deserialize)]
struct RawSessionRow {
    #[serde(rename = "Date")]
    date: String,

    #[serde(rename = "Location")]
    location: String,

    #[serde(rename = "Total Sales")]
    total_sales: Decimal,

    #[serde(rename = "Session Type", default)]
    session_type: String,
}

/// Parse a ledger date: ISO first, then US-style from older QB exports.
fn parse_ledger_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .map_err(|_| EngineError::validation("date", format!("unparseable date {:?}", raw)))
}

/// Load expense transactions from CSV for one organization.
pub fn load_expense_csv(csv_path: &Path, organization_id: &str) -> Result<Vec<ExpenseTransaction>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open expense CSV {:?}", csv_path))
        .map_err(EngineError::Io)?;

    let mut transactions = Vec::new();
    for row in rdr.deserialize() {
        let raw: RawExpenseRow = row
            .context("failed to deserialize expense row")
            .map_err(EngineError::Io)?;

        transactions.push(ExpenseTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            expense_date: parse_ledger_date(&raw.date)?,
            qb_category_name: raw.account,
            qb_class_name: raw.class,
            amount: raw.amount,
            vendor: raw.vendor,
            description: raw.description,
        });
    }

    Ok(transactions)
}

/// Load sessions from CSV for one organization. Rows with negative sales
/// fail the whole import; a corrupt session ledger poisons every split.
pub fn load_session_csv(csv_path: &Path, organization_id: &str) -> Result<Vec<Session>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open session CSV {:?}", csv_path))
        .map_err(EngineError::Io)?;

    let mut sessions = Vec::new();
    for row in rdr.deserialize() {
        let raw: RawSessionRow = row
            .context("failed to deserialize session row")
            .map_err(EngineError::Io)?;

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            session_date: parse_ledger_date(&raw.date)?,
            location_id: raw.location,
            total_sales: raw.total_sales,
            session_type: raw.session_type,
        };
        session.validate()?;
        sessions.push(session);
    }

    Ok(sessions)
}

// ============================================================================
// TESTS
// ============================================================================
