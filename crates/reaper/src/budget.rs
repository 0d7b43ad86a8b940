//! Deletion budget computation (§4.7.1).

use grid_catalog::{RseCounter, RseUsage};
use grid_models::RseLimits;

/// `None` in either field means "no budget constraint on this axis"; the
/// Reaper falls back to its list-with-defaults path (catalog default cap of
/// 10000 replicas, no byte target).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub max_being_deleted_files: Option<i64>,
    pub needed_free_space: Option<i64>,
}

/// Computes the byte/count budget for one RSE. Returns all-`None` if any
/// required input (`limits.min_free_space`, `limits.max_being_deleted_files`,
/// usage, or counter) is missing — never an error, since a partially
/// configured RSE is still reapable with defaults.
pub fn compute_budget(
    limits: RseLimits,
    usage: Option<RseUsage>,
    counter: Option<RseCounter>,
) -> Budget {
    let (Some(min_free_space), Some(max_being_deleted_files), Some(usage), Some(counter)) =
        (limits.min_free_space, limits.max_being_deleted_files, usage, counter)
    else {
        return Budget::default();
    };

    let free = usage.total - counter.bytes;
    let needed_free = min_free_space - free;

    Budget {
        max_being_deleted_files: Some(max_being_deleted_files),
        needed_free_space: Some(needed_free),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_limits_yields_all_nulls() {
        let budget = compute_budget(RseLimits::default(), None, None);
        assert_eq!(budget, Budget::default());
    }

    #[test]
    fn full_inputs_compute_needed_free_space() {
        let limits = RseLimits {
            min_free_space: Some(1_000_000),
            max_being_deleted_files: Some(10),
        };
        let usage = RseUsage {
            total: 10_000_000,
            used: 0,
        };
        let counter = RseCounter { bytes: 9_500_000 };
        let budget = compute_budget(limits, Some(usage), Some(counter));
        assert_eq!(budget.needed_free_space, Some(500_000));
        assert_eq!(budget.max_being_deleted_files, Some(10));
    }

    #[test]
    fn negative_needed_free_is_passed_through_unchanged() {
        let limits = RseLimits {
            min_free_space: Some(1_000_000),
            max_being_deleted_files: Some(10),
        };
        let usage = RseUsage {
            total: 10_000_000,
            used: 0,
        };
        let counter = RseCounter { bytes: 500_000 };
        let budget = compute_budget(limits, Some(usage), Some(counter));
        assert_eq!(budget.needed_free_space, Some(-8_500_000));
    }

    #[test]
    fn missing_counter_alone_still_falls_back_to_nulls() {
        let limits = RseLimits {
            min_free_space: Some(1_000_000),
            max_being_deleted_files: Some(10),
        };
        let usage = RseUsage {
            total: 10_000_000,
            used: 0,
        };
        let budget = compute_budget(limits, Some(usage), None);
        assert_eq!(budget, Budget::default());
    }
}
