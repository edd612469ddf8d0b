use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use tracing_subscriber::EnvFilter;

use bingo_allocator::{
    load_expense_csv, load_session_csv, recompute_month_range, AllocationEngine, CategoryMapping,
    LocationPair, Month, MonthStatus, RuleSet, RunReport, SqliteStore, TrackedLocation,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "import-expenses" => run_import_expenses(&args[2..]),
        "import-sessions" => run_import_sessions(&args[2..]),
        "import-rules" => run_import_rules(&args[2..]),
        "import-mappings" => run_import_mappings(&args[2..]),
        "recompute" => run_recompute(&args[2..]),
        "recompute-all" => run_recompute_all(&args[2..]),
        "override" => run_override(&args[2..]),
        "clear-override" => run_clear_override(&args[2..]),
        other => {
            print_usage();
            bail!("unknown command: {}", other);
        }
    }
}

fn print_usage() {
    println!("bingo-allocator {}", bingo_allocator::VERSION);
    println!();
    println!("Usage:");
    println!("  bingo-allocator import-expenses <org-id> <csv>");
    println!("  bingo-allocator import-sessions <org-id> <csv>");
    println!("  bingo-allocator import-rules <org-id> <json>");
    println!("  bingo-allocator import-mappings <org-id> <json>");
    println!("  bingo-allocator recompute <org-id> <YYYY-MM>");
    println!("  bingo-allocator recompute-all <org-id> <from YYYY-MM> <to YYYY-MM>");
    println!("  bingo-allocator override <allocation-id> <amount> [notes]");
    println!("  bingo-allocator clear-override <allocation-id>");
    println!();
    println!("Environment:");
    println!("  BINGO_ALLOCATOR_DB   database path (default: allocations.db)");
}

fn open_store() -> Result<SqliteStore> {
    let db_path = env::var("BINGO_ALLOCATOR_DB").unwrap_or_else(|_| "allocations.db".to_string());
    let store = SqliteStore::open(&PathBuf::from(&db_path))
        .with_context(|| format!("failed to open store at {}", db_path))?;
    Ok(store)
}

/// The two tracked locations, overridable through the environment for
/// organizations whose QB class names differ from the defaults.
fn location_pair() -> LocationPair {
    let var = |key: &str, default: &str| env::var(key).unwrap_or_else(|_| default.to_string());

    LocationPair::new(
        TrackedLocation::new(
            &var("BINGO_LOC_A_CODE", "SC"),
            &var("BINGO_LOC_A_CLASS", "SC Hall"),
            Some(&var("BINGO_LOC_A_ID", "SC")),
        ),
        TrackedLocation::new(
            &var("BINGO_LOC_B_CODE", "RWC"),
            &var("BINGO_LOC_B_CLASS", "RWC Hall"),
            Some(&var("BINGO_LOC_B_ID", "RWC")),
        ),
    )
}

fn run_import_expenses(args: &[String]) -> Result<()> {
    let [org_id, csv_path] = args else {
        bail!("usage: import-expenses <org-id> <csv>");
    };

    let transactions = load_expense_csv(csv_path.as_ref(), org_id)?;
    println!("Loaded {} expense transactions from CSV", transactions.len());

    let store = open_store()?;
    let (inserted, duplicates) = store.insert_expense_transactions(&transactions)?;
    println!("✓ Inserted: {} transactions", inserted);
    println!("✓ Skipped duplicates: {}", duplicates);

    Ok(())
}

fn run_import_sessions(args: &[String]) -> Result<()> {
    let [org_id, csv_path] = args else {
        bail!("usage: import-sessions <org-id> <csv>");
    };

    let sessions = load_session_csv(csv_path.as_ref(), org_id)?;
    println!("Loaded {} sessions from CSV", sessions.len());

    let store = open_store()?;
    let (inserted, duplicates) = store.insert_sessions(&sessions)?;
    println!("✓ Inserted: {} sessions", inserted);
    println!("✓ Skipped duplicates: {}", duplicates);

    Ok(())
}

fn run_import_rules(args: &[String]) -> Result<()> {
    let [org_id, json_path] = args else {
        bail!("usage: import-rules <org-id> <json>");
    };

    let rules = RuleSet::from_file(json_path)?;
    println!("Loaded {} allocation rules from JSON", rules.len());

    let store = open_store()?;
    for rule in rules.iter() {
        let mut rule = rule.clone();
        rule.organization_id = org_id.clone();
        store
            .upsert_allocation_rule(&rule)
            .with_context(|| format!("rule for category {:?} rejected", rule.expense_category))?;
    }
    println!("✓ Upserted: {} rules", rules.len());

    Ok(())
}

fn run_import_mappings(args: &[String]) -> Result<()> {
    let [org_id, json_path] = args else {
        bail!("usage: import-mappings <org-id> <json>");
    };

    let content = std::fs::read_to_string(json_path)
        .with_context(|| format!("failed to read mappings file {}", json_path))?;
    let mappings: Vec<CategoryMapping> =
        serde_json::from_str(&content).context("failed to parse mappings JSON")?;
    println!("Loaded {} category mappings from JSON", mappings.len());

    let store = open_store()?;
    for mapping in &mappings {
        let mut mapping = mapping.clone();
        mapping.organization_id = org_id.clone();
        store.upsert_category_mapping(&mapping)?;
    }
    println!("✓ Upserted: {} mappings", mappings.len());

    Ok(())
}

fn run_recompute(args: &[String]) -> Result<()> {
    let [org_id, month_str] = args else {
        bail!("usage: recompute <org-id> <YYYY-MM>");
    };
    let month = Month::from_str(month_str)?;

    let store = open_store()?;
    let engine = AllocationEngine::new(location_pair());
    let report = engine.recompute_month(&store, org_id, month)?;

    print_report(&report);
    Ok(())
}

fn run_recompute_all(args: &[String]) -> Result<()> {
    let [org_id, from_str, to_str] = args else {
        bail!("usage: recompute-all <org-id> <from YYYY-MM> <to YYYY-MM>");
    };
    let from = Month::from_str(from_str)?;
    let to = Month::from_str(to_str)?;

    let store = open_store()?;
    let engine = AllocationEngine::new(location_pair());
    let cancel = AtomicBool::new(false);
    let outcomes = recompute_month_range(&engine, &store, org_id, from, to, &cancel);

    let mut completed = 0;
    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.status {
            MonthStatus::Completed(report) => {
                completed += 1;
                println!(
                    "✓ {}: {} categories allocated, {} skipped, bingo {}%",
                    outcome.month,
                    report.allocated.len(),
                    report.skipped.len(),
                    report.bingo.bingo_percentage.round_dp(2),
                );
            }
            MonthStatus::Failed(err) => {
                failed += 1;
                println!("✗ {}: {}", outcome.month, err);
            }
            MonthStatus::Cancelled => println!("- {}: cancelled", outcome.month),
        }
    }

    println!();
    println!("{} months completed, {} failed", completed, failed);
    if failed > 0 {
        bail!("{} month(s) failed; rerun after fixing the cause", failed);
    }
    Ok(())
}

fn run_override(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!("usage: override <allocation-id> <amount> [notes]");
    }
    let allocation_id = &args[0];
    let amount = Decimal::from_str(&args[1])
        .with_context(|| format!("invalid override amount {:?}", args[1]))?;
    let notes = args.get(2).map(String::as_str).unwrap_or("");

    let store = open_store()?;
    let row = bingo_allocator::AllocationStore::apply_override(&store, allocation_id, amount, notes)?;

    println!(
        "✓ Override applied to {}/{} for {}: {} (computed was {})",
        row.location,
        row.expense_category,
        row.month,
        row.value.allocated_amount(),
        row.value.computed_pair().0,
    );
    Ok(())
}

fn run_clear_override(args: &[String]) -> Result<()> {
    let [allocation_id] = args else {
        bail!("usage: clear-override <allocation-id>");
    };

    let store = open_store()?;
    let row = store.clear_override(allocation_id)?;
    println!(
        "✓ Override cleared on {}/{} for {}; computed {} is current again",
        row.location,
        row.expense_category,
        row.month,
        row.value.allocated_amount(),
    );
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "Recomputed {} for {} (bingo {}%)",
        report.month,
        report.organization_id,
        report.bingo.bingo_percentage.round_dp(2),
    );
    println!(
        "  revenue: tracked {} of {} total",
        report.bingo.tracked_revenue, report.bingo.organization_total,
    );

    for outcome in &report.allocated {
        println!(
            "  ✓ {} [{}]: {} of {} allocated",
            outcome.expense_category,
            outcome.method.code(),
            outcome.total_allocated,
            outcome.qb_total_amount,
        );
    }
    for (category, reason) in &report.skipped {
        println!("  - {} skipped: {}", category, reason);
    }
    if report.unmapped.count > 0 {
        println!(
            "  ! unmapped spend excluded: {} across {} transactions ({:?})",
            report.unmapped.amount,
            report.unmapped.count,
            report.unmapped.qb_category_names,
        );
    }
    for (location, category) in &report.overrides_preserved {
        println!("  * override preserved: {}/{}", location, category);
    }
}
