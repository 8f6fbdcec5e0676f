/// Priority of a search-results target. Discovery pages always jump ahead of
/// detail targets so new listings are found before old ones are refreshed.
pub const DISCOVERY_PRIORITY: i64 = 5_000;

/// Bonus for a target whose listing has never been stored.
pub const NEVER_SEEN_BONUS: i64 = 1_000;

/// Bonus for every data category the stored listing is still missing.
pub const MISSING_CATEGORY_BONUS: i64 = 100;

/// Inputs to [`compute_priority`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioritySignals {
    pub never_seen: bool,
    pub source_weight: i64,
    pub missing_categories: usize,
}

/// Additive priority heuristic for detail targets. Higher runs sooner.
pub fn compute_priority(signals: PrioritySignals) -> i64 {
    let mut priority = signals.source_weight;
    if signals.never_seen {
        priority += NEVER_SEEN_BONUS;
    }
    priority + MISSING_CATEGORY_BONUS * signals.missing_categories as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, 0, 0, 0)]
    #[case(true, 0, 0, 1_000)]
    #[case(false, 25, 0, 25)]
    #[case(false, 0, 3, 300)]
    #[case(true, 10, 6, 1_610)]
    #[case(false, -50, 1, 50)]
    fn test_compute_priority(
        #[case] never_seen: bool,
        #[case] source_weight: i64,
        #[case] missing_categories: usize,
        #[case] expected: i64,
    ) {
        let signals = PrioritySignals {
            never_seen,
            source_weight,
            missing_categories,
        };
        assert_eq!(compute_priority(signals), expected);
    }

    #[test]
    fn test_never_seen_outranks_any_missing_data() {
        let fresh = compute_priority(PrioritySignals {
            never_seen: true,
            ..Default::default()
        });
        let incomplete = compute_priority(PrioritySignals {
            missing_categories: 6,
            ..Default::default()
        });
        assert!(fresh > incomplete);
        assert!(DISCOVERY_PRIORITY > fresh + MISSING_CATEGORY_BONUS * 6);
    }
}
