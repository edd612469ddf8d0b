// SQLite store - schema, idempotent ingest, and the month writer.
// Decimals are stored as TEXT to keep them exact; dates are ISO strings.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use crate::engine::MonthlyAllocation;
use crate::error::{EngineError, Result};
use crate::ledger::{CategoryMapping, ExpenseTransaction, Month, Session, TransactionSnapshot};
use crate::overrides::AllocationValue;
use crate::rules::{AllocationMethod, AllocationRule};
use crate::store::AllocationStore;

// ============================================================================
// SQL VALUE HELPERS
// ============================================================================

fn decimal_column(idx: usize, raw: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn date_column(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn datetime_column(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed allocation store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) an on-disk store with WAL mode for crash recovery.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = SqliteStore { conn };
        store.setup_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore { conn };
        store.setup_schema()?;
        Ok(store)
    }

    pub fn setup_schema(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS expense_transactions (
                id TEXT PRIMARY KEY,
                idempotency_hash TEXT UNIQUE NOT NULL,
                organization_id TEXT NOT NULL,
                expense_date TEXT NOT NULL,
                qb_category_name TEXT NOT NULL,
                qb_class_name TEXT NOT NULL,
                amount TEXT NOT NULL,
                vendor TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                idempotency_hash TEXT UNIQUE NOT NULL,
                organization_id TEXT NOT NULL,
                session_date TEXT NOT NULL,
                location_id TEXT NOT NULL,
                total_sales TEXT NOT NULL,
                session_type TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS category_mappings (
                organization_id TEXT NOT NULL,
                qb_category_name TEXT NOT NULL,
                expense_category TEXT NOT NULL,
                PRIMARY KEY (organization_id, qb_category_name)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS allocation_rules (
                organization_id TEXT NOT NULL,
                expense_category TEXT NOT NULL,
                method TEXT,
                qb_percentage TEXT NOT NULL,
                use_qb_class_split INTEGER NOT NULL DEFAULT 0,
                sc_only INTEGER NOT NULL DEFAULT 0,
                fixed_location_a_percent TEXT,
                fixed_location_b_percent TEXT,
                bingo_percentage_override TEXT,
                class_split_adjustment_percent TEXT,
                PRIMARY KEY (organization_id, expense_category)
            )",
            [],
        )?;

        // Override columns are a flattened view of AllocationValue: for a
        // computed row the allocated/bingo columns hold the computed pair
        // and the override columns are NULL; for an overridden row the
        // computed pair stays for audit and the override pair sits beside.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS monthly_allocations (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                month TEXT NOT NULL,
                location TEXT NOT NULL,
                expense_category TEXT NOT NULL,
                qb_total_amount TEXT NOT NULL,
                qb_transaction_count INTEGER NOT NULL,
                allocation_method TEXT NOT NULL,
                location_split_percent TEXT NOT NULL,
                bingo_percentage TEXT NOT NULL,
                allocated_amount TEXT NOT NULL,
                bingo_amount TEXT NOT NULL,
                is_overridden INTEGER NOT NULL DEFAULT 0,
                override_allocated_amount TEXT,
                override_bingo_amount TEXT,
                override_notes TEXT,
                source_transactions TEXT NOT NULL,
                rules_applied_at TEXT NOT NULL,
                UNIQUE (organization_id, month, location, expense_category)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_expense_org_date
             ON expense_transactions(organization_id, expense_date)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_org_date
             ON sessions(organization_id, session_date)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_allocations_org_month
             ON monthly_allocations(organization_id, month)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // INGEST (import collaborator side)
    // ========================================================================

    /// Insert expense transactions, skipping duplicates by idempotency
    /// hash. Returns (inserted, duplicates).
    pub fn insert_expense_transactions(
        &self,
        transactions: &[ExpenseTransaction],
    ) -> Result<(usize, usize)> {
        let mut inserted = 0;
        let mut duplicates = 0;

        for tx in transactions {
            let result = self.conn.execute(
                "INSERT INTO expense_transactions (
                    id, idempotency_hash, organization_id, expense_date,
                    qb_category_name, qb_class_name, amount, vendor, description
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    tx.id,
                    tx.idempotency_hash(),
                    tx.organization_id,
                    tx.expense_date.format("%Y-%m-%d").to_string(),
                    tx.qb_category_name,
                    tx.qb_class_name,
                    tx.amount.to_string(),
                    tx.vendor,
                    tx.description,
                ],
            );

            match result {
                Ok(_) => inserted += 1,
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok((inserted, duplicates))
    }

    /// Insert sessions, skipping duplicates. Returns (inserted, duplicates).
    pub fn insert_sessions(&self, sessions: &[Session]) -> Result<(usize, usize)> {
        let mut inserted = 0;
        let mut duplicates = 0;

        for session in sessions {
            session.validate()?;
            let result = self.conn.execute(
                "INSERT INTO sessions (
                    id, idempotency_hash, organization_id, session_date,
                    location_id, total_sales, session_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.idempotency_hash(),
                    session.organization_id,
                    session.session_date.format("%Y-%m-%d").to_string(),
                    session.location_id,
                    session.total_sales.to_string(),
                    session.session_type,
                ],
            );

            match result {
                Ok(_) => inserted += 1,
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok((inserted, duplicates))
    }

    pub fn upsert_category_mapping(&self, mapping: &CategoryMapping) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO category_mappings
                (organization_id, qb_category_name, expense_category)
             VALUES (?1, ?2, ?3)",
            params![
                mapping.organization_id,
                mapping.qb_category_name,
                mapping.expense_category,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_allocation_rule(&self, rule: &AllocationRule) -> Result<()> {
        rule.validate()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO allocation_rules (
                organization_id, expense_category, method, qb_percentage,
                use_qb_class_split, sc_only,
                fixed_location_a_percent, fixed_location_b_percent,
                bingo_percentage_override, class_split_adjustment_percent
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rule.organization_id,
                rule.expense_category,
                rule.method.map(|m| m.code()),
                rule.qb_percentage.to_string(),
                rule.use_qb_class_split as i64,
                rule.sc_only as i64,
                rule.fixed_location_a_percent.map(|d| d.to_string()),
                rule.fixed_location_b_percent.map(|d| d.to_string()),
                rule.bingo_percentage_override.map(|d| d.to_string()),
                rule.class_split_adjustment_percent.map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Clear a manual override: the audited computed pair becomes current
    /// again and the next recompute is free to replace the row.
    pub fn clear_override(&self, allocation_id: &str) -> Result<MonthlyAllocation> {
        let mut row = self.load_allocation_by_id(allocation_id)?;
        crate::overrides::clear_override(&mut row);

        self.conn.execute(
            "UPDATE monthly_allocations
             SET is_overridden = 0,
                 override_allocated_amount = NULL,
                 override_bingo_amount = NULL,
                 override_notes = NULL
             WHERE id = ?1",
            params![allocation_id],
        )?;

        Ok(row)
    }

    pub fn load_allocation_by_id(&self, allocation_id: &str) -> Result<MonthlyAllocation> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM monthly_allocations WHERE id = ?1",
            ALLOCATION_COLUMNS
        ))?;

        let mut rows = stmt
            .query_map(params![allocation_id], map_allocation_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.pop().ok_or_else(|| {
            EngineError::Configuration(format!("no allocation row with id {}", allocation_id))
        })
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const ALLOCATION_COLUMNS: &str = "id, organization_id, month, location, expense_category, \
     qb_total_amount, qb_transaction_count, allocation_method, \
     location_split_percent, bingo_percentage, allocated_amount, bingo_amount, \
     is_overridden, override_allocated_amount, override_bingo_amount, \
     override_notes, source_transactions, rules_applied_at";

fn map_allocation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MonthlyAllocation> {
    let month_str: String = row.get(2)?;
    let month = Month::from_str(&month_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let method_code: String = row.get(7)?;
    let allocation_method = AllocationMethod::from_code(&method_code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let allocated_amount = decimal_column(10, row.get(10)?)?;
    let bingo_amount = decimal_column(11, row.get(11)?)?;
    let is_overridden: bool = row.get(12)?;

    let value = if is_overridden {
        let override_allocated: Option<String> = row.get(13)?;
        let override_bingo: Option<String> = row.get(14)?;
        let notes: Option<String> = row.get(15)?;

        // An overridden row without override amounts is corrupt.
        let (Some(override_allocated), Some(override_bingo)) = (override_allocated, override_bingo)
        else {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                13,
                rusqlite::types::Type::Null,
                "overridden row missing override amounts".into(),
            ));
        };

        AllocationValue::Overridden {
            allocated_amount: decimal_column(13, override_allocated)?,
            bingo_amount: decimal_column(14, override_bingo)?,
            computed_allocated_amount: allocated_amount,
            computed_bingo_amount: bingo_amount,
            notes: notes.unwrap_or_default(),
        }
    } else {
        AllocationValue::computed(allocated_amount, bingo_amount)
    };

    let snapshots_json: String = row.get(16)?;
    let source_transactions: Vec<TransactionSnapshot> = serde_json::from_str(&snapshots_json)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(MonthlyAllocation {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        month,
        location: row.get(3)?,
        expense_category: row.get(4)?,
        qb_total_amount: decimal_column(5, row.get(5)?)?,
        qb_transaction_count: row.get(6)?,
        allocation_method,
        location_split_percent: decimal_column(8, row.get(8)?)?,
        bingo_percentage: decimal_column(9, row.get(9)?)?,
        value,
        source_transactions,
        rules_applied_at: datetime_column(17, row.get(17)?)?,
    })
}

fn insert_allocation_row(conn: &Connection, row: &MonthlyAllocation) -> Result<()> {
    let (computed_allocated, computed_bingo) = row.value.computed_pair();
    let (override_allocated, override_bingo, notes) = match &row.value {
        AllocationValue::Computed { .. } => (None, None, None),
        AllocationValue::Overridden { allocated_amount, bingo_amount, notes, .. } => (
            Some(allocated_amount.to_string()),
            Some(bingo_amount.to_string()),
            Some(notes.clone()),
        ),
    };

    let snapshots_json = serde_json::to_string(&row.source_transactions)
        .map_err(|e| EngineError::Io(anyhow::Error::new(e).context("serializing snapshots")))?;

    conn.execute(
        "INSERT INTO monthly_allocations (
            id, organization_id, month, location, expense_category,
            qb_total_amount, qb_transaction_count, allocation_method,
            location_split_percent, bingo_percentage, allocated_amount,
            bingo_amount, is_overridden, override_allocated_amount,
            override_bingo_amount, override_notes, source_transactions,
            rules_applied_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            row.id,
            row.organization_id,
            row.month.to_string(),
            row.location,
            row.expense_category,
            row.qb_total_amount.to_string(),
            row.qb_transaction_count,
            row.allocation_method.code(),
            row.location_split_percent.to_string(),
            row.bingo_percentage.to_string(),
            computed_allocated.to_string(),
            computed_bingo.to_string(),
            row.value.is_overridden() as i64,
            override_allocated,
            override_bingo,
            notes,
            snapshots_json,
            row.rules_applied_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

// ============================================================================
// TRAIT IMPLEMENTATION
// ============================================================================

impl AllocationStore for SqliteStore {
    fn load_expense_transactions(
        &self,
        organization_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpenseTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, organization_id, expense_date, qb_category_name,
                    qb_class_name, amount, vendor, description
             FROM expense_transactions
             WHERE organization_id = ?1 AND expense_date >= ?2 AND expense_date <= ?3
             ORDER BY expense_date, id",
        )?;

        let rows = stmt
            .query_map(
                params![
                    organization_id,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                ],
                |row| {
                    Ok(ExpenseTransaction {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        expense_date: date_column(2, row.get(2)?)?,
                        qb_category_name: row.get(3)?,
                        qb_class_name: row.get(4)?,
                        amount: decimal_column(5, row.get(5)?)?,
                        vendor: row.get(6)?,
                        description: row.get(7)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn load_category_mappings(&self, organization_id: &str) -> Result<Vec<CategoryMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT organization_id, qb_category_name, expense_category
             FROM category_mappings
             WHERE organization_id = ?1
             ORDER BY qb_category_name",
        )?;

        let rows = stmt
            .query_map(params![organization_id], |row| {
                Ok(CategoryMapping {
                    organization_id: row.get(0)?,
                    qb_category_name: row.get(1)?,
                    expense_category: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn load_allocation_rules(&self, organization_id: &str) -> Result<Vec<AllocationRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT organization_id, expense_category, method, qb_percentage,
                    use_qb_class_split, sc_only,
                    fixed_location_a_percent, fixed_location_b_percent,
                    bingo_percentage_override, class_split_adjustment_percent
             FROM allocation_rules
             WHERE organization_id = ?1
             ORDER BY expense_category",
        )?;

        let rows = stmt
            .query_map(params![organization_id], |row| {
                let method_code: Option<String> = row.get(2)?;
                let method = match method_code {
                    Some(code) => Some(AllocationMethod::from_code(&code).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?),
                    None => None,
                };

                let optional_decimal = |idx: usize,
                                        raw: Option<String>|
                 -> rusqlite::Result<Option<Decimal>> {
                    raw.map(|s| decimal_column(idx, s)).transpose()
                };

                Ok(AllocationRule {
                    organization_id: row.get(0)?,
                    expense_category: row.get(1)?,
                    method,
                    qb_percentage: decimal_column(3, row.get(3)?)?,
                    use_qb_class_split: row.get(4)?,
                    sc_only: row.get(5)?,
                    fixed_location_a_percent: optional_decimal(6, row.get(6)?)?,
                    fixed_location_b_percent: optional_decimal(7, row.get(7)?)?,
                    bingo_percentage_override: optional_decimal(8, row.get(8)?)?,
                    class_split_adjustment_percent: optional_decimal(9, row.get(9)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn load_sessions(
        &self,
        organization_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, organization_id, session_date, location_id, total_sales, session_type
             FROM sessions
             WHERE organization_id = ?1 AND session_date >= ?2 AND session_date <= ?3
             ORDER BY session_date, id",
        )?;

        let rows = stmt
            .query_map(
                params![
                    organization_id,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                ],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        session_date: date_column(2, row.get(2)?)?,
                        location_id: row.get(3)?,
                        total_sales: decimal_column(4, row.get(4)?)?,
                        session_type: row.get(5)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn load_existing_allocations(
        &self,
        organization_id: &str,
        month: Month,
    ) -> Result<Vec<MonthlyAllocation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM monthly_allocations
             WHERE organization_id = ?1 AND month = ?2
             ORDER BY expense_category, location",
            ALLOCATION_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![organization_id, month.to_string()], map_allocation_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn write_allocations(
        &self,
        organization_id: &str,
        month: Month,
        rows: &[MonthlyAllocation],
        preserve_overrides: bool,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let frozen_keys: HashSet<(String, String)> = if preserve_overrides {
            let mut stmt = tx.prepare(
                "SELECT location, expense_category FROM monthly_allocations
                 WHERE organization_id = ?1 AND month = ?2 AND is_overridden = 1",
            )?;
            let keys = stmt
                .query_map(params![organization_id, month.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            keys
        } else {
            HashSet::new()
        };

        // Delete before insert, so replaced keys never conflict.
        if preserve_overrides {
            tx.execute(
                "DELETE FROM monthly_allocations
                 WHERE organization_id = ?1 AND month = ?2 AND is_overridden = 0",
                params![organization_id, month.to_string()],
            )?;
        } else {
            tx.execute(
                "DELETE FROM monthly_allocations
                 WHERE organization_id = ?1 AND month = ?2",
                params![organization_id, month.to_string()],
            )?;
        }

        for row in rows {
            // Frozen rows are still in the table; re-inserting their key
            // would conflict with the untouched original.
            if preserve_overrides && frozen_keys.contains(&row.key()) {
                continue;
            }
            insert_allocation_row(&tx, row)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn apply_override(
        &self,
        allocation_id: &str,
        amount: Decimal,
        notes: &str,
    ) -> Result<MonthlyAllocation> {
        let mut row = self.load_allocation_by_id(allocation_id)?;
        crate::overrides::apply_override(&mut row, amount, notes);

        let AllocationValue::Overridden {
            allocated_amount, bingo_amount, notes: stored_notes, ..
        } = &row.value
        else {
            unreachable!("apply_override always produces an overridden value");
        };

        self.conn.execute(
            "UPDATE monthly_allocations
             SET is_overridden = 1,
                 override_allocated_amount = ?1,
                 override_bingo_amount = ?2,
                 override_notes = ?3
             WHERE id = ?4",
            params![
                allocated_amount.to_string(),
                bingo_amount.to_string(),
                stored_notes,
                allocation_id,
            ],
        )?;

        Ok(row)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AllocationEngine, RecomputeOptions};
    use crate::ledger::{LocationPair, TrackedLocation};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn pair() -> LocationPair {
        LocationPair::new(
            TrackedLocation::new("SC", "SC Hall", Some("loc-sc")),
            TrackedLocation::new("RWC", "RWC Hall", Some("loc-rwc")),
        )
    }

    fn tx(date: NaiveDate, qb_category: &str, class: &str, amount: Decimal) -> ExpenseTransaction {
        ExpenseTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: "org-1".to_string(),
            expense_date: date,
            qb_category_name: qb_category.to_string(),
            qb_class_name: class.to_string(),
            amount,
            vendor: "vendor".to_string(),
            description: "desc".to_string(),
        }
    }

    fn session(date: NaiveDate, location_id: &str, sales: Decimal) -> Session {
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: "org-1".to_string(),
            session_date: date,
            location_id: location_id.to_string(),
            total_sales: sales,
            session_type: "evening".to_string(),
        }
    }

    fn jan(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    /// Seed a store with the worked-example month.
    fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();

        store
            .insert_expense_transactions(&[
                tx(jan(10), "PG&E", "SC Hall", dec!(600)),
                tx(jan(12), "PG&E", "RWC Hall", dec!(400)),
                tx(jan(15), "State Farm", "SC Hall", dec!(2000)),
            ])
            .unwrap();

        store
            .insert_sessions(&[
                session(jan(4), "loc-sc", dec!(10000)),
                session(jan(5), "loc-rwc", dec!(5000)),
                session(jan(6), "loc-other", dec!(15000)),
            ])
            .unwrap();

        for (qb, category) in [("PG&E", "Utilities"), ("State Farm", "Insurance")] {
            store
                .upsert_category_mapping(&CategoryMapping {
                    organization_id: "org-1".to_string(),
                    qb_category_name: qb.to_string(),
                    expense_category: category.to_string(),
                })
                .unwrap();
        }

        let mut utilities = AllocationRule::revenue_split("org-1", "Utilities");
        utilities.qb_percentage = dec!(85);
        store.upsert_allocation_rule(&utilities).unwrap();

        let mut insurance = AllocationRule::revenue_split("org-1", "Insurance");
        insurance.method = Some(crate::rules::AllocationMethod::FixedPercentages);
        insurance.fixed_location_a_percent = Some(dec!(60));
        insurance.fixed_location_b_percent = Some(dec!(40));
        store.upsert_allocation_rule(&insurance).unwrap();

        store
    }

    #[test]
    fn test_expense_round_trip_filters_by_month() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_expense_transactions(&[
                tx(jan(10), "PG&E", "SC Hall", dec!(600)),
                tx(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(), "PG&E", "SC Hall", dec!(999)),
            ])
            .unwrap();

        let january = store
            .load_expense_transactions("org-1", jan(1), jan(31))
            .unwrap();
        assert_eq!(january.len(), 1);
        assert_eq!(january[0].amount, dec!(600));
        assert_eq!(january[0].expense_date, jan(10));
    }

    #[test]
    fn test_idempotent_reimport() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = vec![tx(jan(10), "PG&E", "SC Hall", dec!(600))];

        // Re-importing the same ledger line (same date/category/amount/
        // vendor) is a duplicate even with a fresh row id.
        let (inserted, duplicates) = store.insert_expense_transactions(&batch).unwrap();
        assert_eq!((inserted, duplicates), (1, 0));

        let again = vec![tx(jan(10), "PG&E", "SC Hall", dec!(600))];
        let (inserted, duplicates) = store.insert_expense_transactions(&again).unwrap();
        assert_eq!((inserted, duplicates), (0, 1));
    }

    #[test]
    fn test_rule_round_trip_including_legacy_row() {
        let store = SqliteStore::open_in_memory().unwrap();

        let mut explicit = AllocationRule::revenue_split("org-1", "Utilities");
        explicit.qb_percentage = dec!(85);
        store.upsert_allocation_rule(&explicit).unwrap();

        // Legacy row: no explicit method, indicator fields only.
        let mut legacy = AllocationRule::revenue_split("org-1", "Payroll");
        legacy.method = None;
        legacy.use_qb_class_split = true;
        legacy.class_split_adjustment_percent = Some(dec!(50));
        store.upsert_allocation_rule(&legacy).unwrap();

        let rules = store.load_allocation_rules("org-1").unwrap();
        assert_eq!(rules.len(), 2);

        let payroll = rules.iter().find(|r| r.expense_category == "Payroll").unwrap();
        assert_eq!(payroll.method, None);
        assert!(payroll.use_qb_class_split);
        assert_eq!(payroll.class_split_adjustment_percent, Some(dec!(50)));
        assert_eq!(
            payroll.effective_method(),
            crate::rules::AllocationMethod::QbClassSplit
        );
    }

    #[test]
    fn test_upsert_rejects_invalid_rule() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut bad = AllocationRule::revenue_split("org-1", "Utilities");
        bad.qb_percentage = dec!(150);
        assert!(store.upsert_allocation_rule(&bad).is_err());
    }

    #[test]
    fn test_recompute_writes_rows_and_round_trips() {
        let store = seeded_store();
        let engine = AllocationEngine::new(pair());
        let month: Month = "2025-01".parse().unwrap();

        let report = engine.recompute_month(&store, "org-1", month).unwrap();
        assert_eq!(report.bingo.bingo_percentage, dec!(50));
        assert_eq!(report.allocated.len(), 2);

        let rows = store.load_existing_allocations("org-1", month).unwrap();
        assert_eq!(rows.len(), 4);

        let sc_util = rows
            .iter()
            .find(|r| r.location == "SC" && r.expense_category == "Utilities")
            .unwrap();
        assert_eq!(sc_util.value.allocated_amount(), dec!(283.33));
        assert_eq!(sc_util.qb_transaction_count, 2);
        assert_eq!(sc_util.source_transactions.len(), 2);
    }

    #[test]
    fn test_override_survives_recompute() {
        let store = seeded_store();
        let engine = AllocationEngine::new(pair());
        let month: Month = "2025-01".parse().unwrap();

        engine.recompute_month(&store, "org-1", month).unwrap();

        let rows = store.load_existing_allocations("org-1", month).unwrap();
        let target = rows
            .iter()
            .find(|r| r.location == "SC" && r.expense_category == "Utilities")
            .unwrap();

        let overridden = store
            .apply_override(&target.id, dec!(300), "manual correction")
            .unwrap();
        assert!(overridden.value.is_overridden());
        assert_eq!(overridden.value.allocated_amount(), dec!(300));
        // Override bingo from the row's stored 50%.
        assert_eq!(overridden.value.bingo_amount(), dec!(150.00));

        // Recompute twice; the override must survive both runs untouched.
        let report = engine.recompute_month(&store, "org-1", month).unwrap();
        assert_eq!(
            report.overrides_preserved,
            vec![("SC".to_string(), "Utilities".to_string())]
        );
        engine.recompute_month(&store, "org-1", month).unwrap();

        let rows = store.load_existing_allocations("org-1", month).unwrap();
        let frozen = rows
            .iter()
            .find(|r| r.location == "SC" && r.expense_category == "Utilities")
            .unwrap();
        assert!(frozen.value.is_overridden());
        assert_eq!(frozen.value.allocated_amount(), dec!(300));
        assert_eq!(frozen.value.computed_pair().0, dec!(283.33));
        assert_eq!(frozen.id, overridden.id, "frozen row is the original row, not a rewrite");

        // Non-overridden siblings were replaced as usual.
        let rwc = rows
            .iter()
            .find(|r| r.location == "RWC" && r.expense_category == "Utilities")
            .unwrap();
        assert_eq!(rwc.value.allocated_amount(), dec!(141.67));
    }

    #[test]
    fn test_override_idempotence_across_identical_runs() {
        let store = seeded_store();
        let engine = AllocationEngine::new(pair());
        let month: Month = "2025-01".parse().unwrap();

        engine.recompute_month(&store, "org-1", month).unwrap();
        let rows = store.load_existing_allocations("org-1", month).unwrap();
        store.apply_override(&rows[0].id, dec!(99), "frozen").unwrap();

        engine.recompute_month(&store, "org-1", month).unwrap();
        let first = store.load_existing_allocations("org-1", month).unwrap();
        engine.recompute_month(&store, "org-1", month).unwrap();
        let second = store.load_existing_allocations("org-1", month).unwrap();

        // Identical runs yield identical rows except rules_applied_at;
        // in particular an allocation id noted for an override stays valid.
        let normalize = |row: &MonthlyAllocation| {
            let mut row = row.clone();
            row.rules_applied_at = chrono::DateTime::UNIX_EPOCH;
            serde_json::to_value(&row).unwrap()
        };

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id, "row id survives an identical recompute");
            assert_eq!(normalize(a), normalize(b));
        }
    }

    #[test]
    fn test_explicit_discard_removes_override() {
        let store = seeded_store();
        let month: Month = "2025-01".parse().unwrap();

        let engine = AllocationEngine::new(pair());
        engine.recompute_month(&store, "org-1", month).unwrap();
        let rows = store.load_existing_allocations("org-1", month).unwrap();
        store.apply_override(&rows[0].id, dec!(99), "frozen").unwrap();

        // preserve_overrides = false is the explicit discard path.
        let mut options = RecomputeOptions::default();
        options.preserve_overrides = false;
        let discarding = AllocationEngine::with_options(pair(), options);
        discarding.recompute_month(&store, "org-1", month).unwrap();

        let rows = store.load_existing_allocations("org-1", month).unwrap();
        assert!(rows.iter().all(|r| !r.value.is_overridden()));
    }

    #[test]
    fn test_clear_override_unfreezes_row() {
        let store = seeded_store();
        let engine = AllocationEngine::new(pair());
        let month: Month = "2025-01".parse().unwrap();

        engine.recompute_month(&store, "org-1", month).unwrap();
        let rows = store.load_existing_allocations("org-1", month).unwrap();
        let target = rows
            .iter()
            .find(|r| r.location == "SC" && r.expense_category == "Utilities")
            .unwrap();

        store.apply_override(&target.id, dec!(300), "oops").unwrap();
        let cleared = store.clear_override(&target.id).unwrap();
        assert!(!cleared.value.is_overridden());
        assert_eq!(cleared.value.allocated_amount(), dec!(283.33));

        let reloaded = store.load_allocation_by_id(&target.id).unwrap();
        assert!(!reloaded.value.is_overridden());
    }

    #[test]
    fn test_apply_override_unknown_id_is_configuration_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.apply_override("nope", dec!(1), "").unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("allocations.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            store
                .insert_expense_transactions(&[tx(jan(10), "PG&E", "SC Hall", dec!(600))])
                .unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        let rows = store
            .load_expense_transactions("org-1", jan(1), jan(31))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
