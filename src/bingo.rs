// Bingo percentage - share of organization revenue earned at the two
// tracked locations in a month. Drives REVENUE_SPLIT and SC_ONLY math.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::ledger::{LocationPair, Session, Side};

/// Month revenue breakdown for one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BingoRevenue {
    /// tracked revenue / organization revenue * 100, 0-100. Defined as 0
    /// when the organization had no revenue at all (never NaN).
    pub bingo_percentage: Decimal,

    /// Combined session revenue of the two tracked locations.
    pub tracked_revenue: Decimal,

    /// Tracked revenue by location code.
    pub per_location_revenue: HashMap<String, Decimal>,

    /// All session revenue, tracked locations included.
    pub organization_total: Decimal,
}

impl BingoRevenue {
    /// Revenue for one tracked side, 0 when it had no sessions.
    pub fn revenue_for(&self, pair: &LocationPair, side: Side) -> Decimal {
        self.per_location_revenue
            .get(pair.code(side))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// A tracked side's share of tracked revenue as a 0-100 percent.
    /// 0 for both sides when there was no tracked revenue.
    pub fn split_percent_for(&self, pair: &LocationPair, side: Side) -> Decimal {
        if self.tracked_revenue.is_zero() {
            return Decimal::ZERO;
        }
        self.revenue_for(pair, side) / self.tracked_revenue * dec!(100)
    }
}

/// Sum session revenue for a month, partitioned into tracked vs other
/// locations.
///
/// A tracked location whose session-ledger id never resolved contributes
/// nothing; the computation proceeds with whatever resolved, and the gap is
/// logged because downstream splits for that location silently become zero.
pub fn compute_bingo_percentage(sessions: &[Session], pair: &LocationPair) -> BingoRevenue {
    for side in Side::BOTH {
        let loc = pair.get(side);
        if loc.location_id.is_none() {
            warn!(
                location = %loc.code,
                "tracked location has no resolved session-ledger id; \
                 its revenue will read as zero this month"
            );
        }
    }

    let mut per_location_revenue: HashMap<String, Decimal> = HashMap::new();
    let mut tracked_revenue = Decimal::ZERO;
    let mut organization_total = Decimal::ZERO;

    for session in sessions {
        organization_total += session.total_sales;

        if let Some(side) = pair.side_for_location_id(&session.location_id) {
            tracked_revenue += session.total_sales;
            *per_location_revenue
                .entry(pair.code(side).to_string())
                .or_insert(Decimal::ZERO) += session.total_sales;
        }
    }

    let bingo_percentage = if organization_total.is_zero() {
        Decimal::ZERO
    } else {
        tracked_revenue / organization_total * dec!(100)
    };

    BingoRevenue {
        bingo_percentage,
        tracked_revenue,
        per_location_revenue,
        organization_total,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TrackedLocation;
    use chrono::NaiveDate;

    fn pair() -> LocationPair {
        LocationPair::new(
            TrackedLocation::new("SC", "SC Hall", Some("loc-sc")),
            TrackedLocation::new("RWC", "RWC Hall", Some("loc-rwc")),
        )
    }

    fn session(location_id: &str, sales: Decimal) -> Session {
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: "org-1".to_string(),
            session_date: NaiveDate::from_ymd_opt(2025, 1, 4).unwrap(),
            location_id: location_id.to_string(),
            total_sales: sales,
            session_type: "evening".to_string(),
        }
    }

    #[test]
    fn test_fifty_percent_with_other_location() {
        // SC 10k + RWC 5k tracked; an untracked hall earns 15k.
        let sessions = vec![
            session("loc-sc", dec!(10000)),
            session("loc-rwc", dec!(5000)),
            session("loc-other", dec!(15000)),
        ];
        let revenue = compute_bingo_percentage(&sessions, &pair());

        assert_eq!(revenue.bingo_percentage, dec!(50));
        assert_eq!(revenue.tracked_revenue, dec!(15000));
        assert_eq!(revenue.organization_total, dec!(30000));
        assert_eq!(revenue.revenue_for(&pair(), Side::Primary), dec!(10000));
        assert_eq!(revenue.revenue_for(&pair(), Side::Secondary), dec!(5000));
    }

    #[test]
    fn test_zero_revenue_is_zero_percent_not_nan() {
        let revenue = compute_bingo_percentage(&[], &pair());
        assert_eq!(revenue.bingo_percentage, Decimal::ZERO);
        assert_eq!(revenue.tracked_revenue, Decimal::ZERO);
        assert_eq!(revenue.split_percent_for(&pair(), Side::Primary), Decimal::ZERO);

        // Sessions exist but every one sold nothing.
        let sessions = vec![session("loc-sc", dec!(0)), session("loc-other", dec!(0))];
        let revenue = compute_bingo_percentage(&sessions, &pair());
        assert_eq!(revenue.bingo_percentage, Decimal::ZERO);
    }

    #[test]
    fn test_unresolved_location_contributes_nothing() {
        let partial = LocationPair::new(
            TrackedLocation::new("SC", "SC Hall", None),
            TrackedLocation::new("RWC", "RWC Hall", Some("loc-rwc")),
        );
        let sessions = vec![
            session("loc-sc", dec!(10000)),
            session("loc-rwc", dec!(5000)),
        ];
        let revenue = compute_bingo_percentage(&sessions, &partial);

        // SC's sessions still count toward the organization total, but are
        // not recognized as tracked.
        assert_eq!(revenue.organization_total, dec!(15000));
        assert_eq!(revenue.tracked_revenue, dec!(5000));
        assert_eq!(revenue.revenue_for(&partial, Side::Primary), Decimal::ZERO);
    }

    #[test]
    fn test_split_percent_shares() {
        let sessions = vec![
            session("loc-sc", dec!(10000)),
            session("loc-rwc", dec!(5000)),
        ];
        let revenue = compute_bingo_percentage(&sessions, &pair());

        let a = revenue.split_percent_for(&pair(), Side::Primary);
        let b = revenue.split_percent_for(&pair(), Side::Secondary);
        assert_eq!(a.round_dp(2), dec!(66.67));
        assert_eq!(b.round_dp(2), dec!(33.33));
    }

    #[test]
    fn test_all_revenue_tracked_is_one_hundred_percent() {
        let sessions = vec![session("loc-sc", dec!(2500))];
        let revenue = compute_bingo_percentage(&sessions, &pair());
        assert_eq!(revenue.bingo_percentage, dec!(100));
    }
}
