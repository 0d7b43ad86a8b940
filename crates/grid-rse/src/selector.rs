//! RSE Selector (§4.3): deterministic weighted sampling without replacement.

use grid_models::Rse;
use rand::SeedableRng;
use rand::rngs::SmallRng;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("insufficient target RSEs: need {needed}, have {available}")]
    InsufficientTargetRSEs { needed: u32, available: u32 },
    #[error("insufficient account limit for account {account}")]
    InsufficientAccountLimit { account: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RseStatus {
    New,
    Existing,
}

/// Selects RSEs to place new replica copies on. The seed is exposed so
/// tests can assert specific draws (§9 "RNG determinism in the RSE
/// selector"); production callers pass a time-varying seed.
pub struct RseSelector {
    seed: u64,
}

impl RseSelector {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// `quota_fn` reports whether `account` has enough remaining quota on
    /// `rse` for the bytes this placement would add.
    pub fn select(
        &self,
        candidates: &[Rse],
        copies: u32,
        preferred_rse_ids: &[uuid::Uuid],
        account: &str,
        quota_fn: impl Fn(&Rse, &str) -> bool,
    ) -> Result<Vec<(uuid::Uuid, RseStatus)>, SelectorError> {
        if copies == 0 {
            return Ok(Vec::new());
        }

        let mut existing: Vec<(uuid::Uuid, RseStatus)> = candidates
            .iter()
            .filter(|rse| preferred_rse_ids.contains(&rse.id))
            .map(|rse| (rse.id, RseStatus::Existing))
            .collect();
        existing.truncate(copies as usize);

        let needed = copies.saturating_sub(existing.len() as u32);
        if needed == 0 {
            return Ok(existing);
        }

        let pool: Vec<&Rse> = candidates
            .iter()
            .filter(|rse| !preferred_rse_ids.contains(&rse.id))
            .collect();

        let target_eligible: Vec<&Rse> = pool
            .iter()
            .copied()
            .filter(|rse| {
                effective_weight(rse) > 0.0 && rse.availability_write && !rse.blacklisted
            })
            .collect();

        if (target_eligible.len() as u32) < needed {
            return Err(SelectorError::InsufficientTargetRSEs {
                needed,
                available: target_eligible.len() as u32,
            });
        }

        let quota_eligible: Vec<&Rse> = target_eligible
            .into_iter()
            .filter(|rse| quota_fn(rse, account))
            .collect();

        if (quota_eligible.len() as u32) < needed {
            return Err(SelectorError::InsufficientAccountLimit {
                account: account.to_string(),
            });
        }

        let drawn = weighted_sample_without_replacement(&quota_eligible, needed, self.seed);
        existing.extend(drawn.into_iter().map(|rse| (rse.id, RseStatus::New)));
        Ok(existing)
    }
}

fn effective_weight(rse: &Rse) -> f64 {
    rse.weight.unwrap_or(1.0)
}

fn weighted_sample_without_replacement<'a>(
    pool: &[&'a Rse],
    n: u32,
    seed: u64,
) -> Vec<&'a Rse> {
    use rand::Rng;

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut remaining: Vec<&Rse> = pool.to_vec();
    let mut picked = Vec::with_capacity(n as usize);

    for _ in 0..n {
        if remaining.is_empty() {
            break;
        }
        let total: f64 = remaining.iter().map(|r| effective_weight(r)).sum();
        let mut draw = rng.gen_range(0.0..total);
        let mut index = remaining.len() - 1;
        for (i, rse) in remaining.iter().enumerate() {
            let w = effective_weight(rse);
            if draw < w {
                index = i;
                break;
            }
            draw -= w;
        }
        picked.push(remaining.remove(index));
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_models::{Protocol, RseLimits};
    use std::collections::HashMap;

    fn rse(name: &str, weight: Option<f64>) -> Rse {
        Rse {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            attributes: HashMap::new(),
            protocols: vec![Protocol {
                scheme: "gsiftp".into(),
                r#impl: "gfal.Default".into(),
                hostname: format!("{name}.example.org"),
                port: 0,
                prefix: "/data".into(),
                extended_attributes: Default::default(),
            }],
            limits: RseLimits::default(),
            usage: Default::default(),
            availability_delete: true,
            availability_write: true,
            blacklisted: false,
            weight,
        }
    }

    #[test]
    fn zero_copies_returns_empty() {
        let rses = vec![rse("A", None)];
        let selector = RseSelector::new(7);
        let out = selector.select(&rses, 0, &[], "acct", |_, _| true).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn insufficient_target_rses_when_pool_too_small() {
        let rses = vec![rse("A", None)];
        let selector = RseSelector::new(7);
        let err = selector
            .select(&rses, 2, &[], "acct", |_, _| true)
            .unwrap_err();
        assert_eq!(
            err,
            SelectorError::InsufficientTargetRSEs {
                needed: 2,
                available: 1
            }
        );
    }

    #[test]
    fn insufficient_account_limit_when_quota_fails_all() {
        let rses = vec![rse("A", None), rse("B", None)];
        let selector = RseSelector::new(7);
        let err = selector
            .select(&rses, 2, &[], "acct", |_, _| false)
            .unwrap_err();
        assert_eq!(
            err,
            SelectorError::InsufficientAccountLimit {
                account: "acct".into()
            }
        );
    }

    #[test]
    fn preferred_rses_are_reused_not_redrawn() {
        let a = rse("A", None);
        let b = rse("B", None);
        let preferred = vec![a.id];
        let rses = vec![a.clone(), b.clone()];
        let selector = RseSelector::new(7);
        let out = selector
            .select(&rses, 2, &preferred, "acct", |_, _| true)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.contains(&(a.id, RseStatus::Existing)));
        assert!(out.contains(&(b.id, RseStatus::New)));
    }

    #[test]
    fn selection_is_deterministic_for_a_fixed_seed() {
        let rses: Vec<Rse> = (0..5).map(|i| rse(&format!("RSE_{i}"), Some((i + 1) as f64))).collect();
        let selector = RseSelector::new(42);
        let first = selector.select(&rses, 3, &[], "acct", |_, _| true).unwrap();
        let second = selector.select(&rses, 3, &[], "acct", |_, _| true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn weight_zero_excludes_candidate() {
        let rses = vec![rse("A", Some(0.0)), rse("B", Some(1.0))];
        let selector = RseSelector::new(1);
        let out = selector.select(&rses, 1, &[], "acct", |_, _| true).unwrap();
        assert_eq!(out[0].0, rses[1].id);
    }
}
