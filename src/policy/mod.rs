//! Witness policy engine.
//!
//! Decides whether a set of witness proofs satisfies the configured policy
//! ([`WitnessPolicy::evaluate`]) and picks a minimum set of witnesses to
//! solicit ([`WitnessPolicy::select`]). The policy itself is a small
//! boolean expression over per-role thresholds, parsed by [`parser`] and
//! cached with a TTL by [`cache`] so that updates made through the REST
//! configurator propagate to every node within one cache period.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

mod cache;
pub mod parser;
mod proof;
pub mod resthandler;
pub mod store;

use cache::{Cache, TtlPolicyCache};
use parser::{ParseError, PolicyExpr, PolicyRule, WitnessPolicyConfig};
pub use proof::{Witness, WitnessProof, WitnessType};
use store::PolicyStore;

/// Policy engine errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to retrieve policy from policy cache: {0}")]
    CacheRetrieval(String),

    #[error("failed to retrieve policy from policy cache (nil value)")]
    EmptyCache,

    #[error("unable to select {required} witnesses from witness array of length {available}")]
    Selection { required: usize, available: usize },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("policy store: {0}")]
    Store(String),
}

/// Evaluates and selects witnesses against the configured policy.
pub struct WitnessPolicy {
    cache: Box<dyn Cache>,
}

impl WitnessPolicy {
    /// Create a policy engine whose policy is loaded from `store` and
    /// cached for `cache_expiry`.
    ///
    /// Fails if the initial load fails.
    pub async fn new(
        store: Arc<dyn PolicyStore>,
        cache_expiry: Duration,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            cache: Box::new(TtlPolicyCache::new(store, cache_expiry).await?),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_cache(cache: Box<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Whether the given proofs satisfy the policy.
    pub async fn evaluate(&self, proofs: &[WitnessProof]) -> Result<bool, PolicyError> {
        let cfg = self.config().await?;

        Ok(eval_expr(&cfg.expr, proofs, cfg.log_required))
    }

    /// Select the smallest set of witnesses that would satisfy the policy
    /// if each supplied a proof.
    ///
    /// Witnesses in `exclude` (matched by URI and role) are not selected,
    /// but still count toward per-role requirements: a policy asking for
    /// all of a role is not weakened by excluding one of its members.
    pub async fn select(
        &self,
        witnesses: &[Witness],
        exclude: &[Witness],
    ) -> Result<Vec<Witness>, PolicyError> {
        let cfg = self.config().await?;

        let batch_pool = role_pool(witnesses, WitnessType::Batch, cfg.log_required);
        let system_pool = role_pool(witnesses, WitnessType::System, cfg.log_required);

        let is_excluded = |w: &Witness| {
            exclude
                .iter()
                .any(|e| e.uri == w.uri && e.witness_type == w.witness_type)
        };

        let batch_eligible: Vec<&Witness> = batch_pool
            .iter()
            .copied()
            .filter(|w| !is_excluded(w))
            .collect();
        let system_eligible: Vec<&Witness> = system_pool
            .iter()
            .copied()
            .filter(|w| !is_excluded(w))
            .collect();

        let pools = RoleCounts {
            batch: batch_pool.len(),
            system: system_pool.len(),
        };
        let eligible = RoleCounts {
            batch: batch_eligible.len(),
            system: system_eligible.len(),
        };

        let required = requirements(&cfg.expr, pools, eligible);

        // Witnesses serving both roles are preferred so one party can cover
        // both requirements.
        let common: HashSet<&str> = batch_pool
            .iter()
            .filter(|b| system_pool.iter().any(|s| s.uri == b.uri))
            .map(|w| w.uri.as_str())
            .collect();

        let mut selected = pick(&batch_eligible, required.batch, &common)?;
        selected.extend(pick(&system_eligible, required.system, &common)?);

        Ok(selected.into_iter().cloned().collect())
    }

    async fn config(&self) -> Result<Arc<WitnessPolicyConfig>, PolicyError> {
        match self.cache.get().await {
            Ok(Some(cfg)) => Ok(cfg),
            Ok(None) => Err(PolicyError::EmptyCache),
            Err(e @ (PolicyError::Parse(_) | PolicyError::CacheRetrieval(_))) => Err(e),
            Err(e) => Err(PolicyError::CacheRetrieval(e.to_string())),
        }
    }
}

/// Witnesses of one role, restricted to logged witnesses when the policy
/// demands it.
fn role_pool(witnesses: &[Witness], role: WitnessType, log_required: bool) -> Vec<&Witness> {
    witnesses
        .iter()
        .filter(|w| w.witness_type == role && (!log_required || w.has_log))
        .collect()
}

fn eval_expr(expr: &PolicyExpr, proofs: &[WitnessProof], log_required: bool) -> bool {
    match expr {
        PolicyExpr::Rule(rule) => eval_rule(rule, proofs, log_required),
        PolicyExpr::And(a, b) => {
            eval_expr(a, proofs, log_required) && eval_expr(b, proofs, log_required)
        }
        PolicyExpr::Or(a, b) => {
            eval_expr(a, proofs, log_required) || eval_expr(b, proofs, log_required)
        }
    }
}

/// Evaluate one threshold rule.
///
/// The denominator is every witness of the role; the log modifier only
/// stops unlogged witnesses from contributing proofs. A `MinPercent` over
/// an empty role is vacuously satisfied.
fn eval_rule(rule: &PolicyRule, proofs: &[WitnessProof], log_required: bool) -> bool {
    let role = match rule {
        PolicyRule::MinPercent { role, .. } | PolicyRule::OutOf { role, .. } => *role,
    };

    let total = proofs
        .iter()
        .filter(|p| p.witness.witness_type == role)
        .count();

    let proven = proofs
        .iter()
        .filter(|p| {
            p.witness.witness_type == role
                && p.has_proof()
                && (!log_required || p.witness.has_log)
        })
        .count();

    match rule {
        PolicyRule::MinPercent { percent, .. } => {
            total == 0 || proven * 100 >= *percent as usize * total
        }
        PolicyRule::OutOf { count, .. } => proven >= *count,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RoleCounts {
    batch: usize,
    system: usize,
}

impl RoleCounts {
    fn total(&self) -> usize {
        self.batch + self.system
    }

    fn satisfiable_with(&self, eligible: RoleCounts) -> bool {
        self.batch <= eligible.batch && self.system <= eligible.system
    }
}

/// Per-role selection requirements for an expression.
///
/// Requirements are sized from the pre-exclusion pools; `eligible` (the
/// post-exclusion counts) only steers which OR branch is chosen. A branch
/// requiring zero witnesses loses to a non-empty satisfiable alternative —
/// selecting nobody witnesses nothing.
fn requirements(expr: &PolicyExpr, pools: RoleCounts, eligible: RoleCounts) -> RoleCounts {
    match expr {
        PolicyExpr::Rule(rule) => match *rule {
            PolicyRule::OutOf { count, role } => by_role(role, count),
            PolicyRule::MinPercent { percent, role } => {
                let pool = match role {
                    WitnessType::Batch => pools.batch,
                    WitnessType::System => pools.system,
                };
                by_role(role, min_count(percent, pool))
            }
        },
        PolicyExpr::And(a, b) => {
            let ra = requirements(a, pools, eligible);
            let rb = requirements(b, pools, eligible);
            RoleCounts {
                batch: ra.batch.max(rb.batch),
                system: ra.system.max(rb.system),
            }
        }
        PolicyExpr::Or(a, b) => {
            let ra = requirements(a, pools, eligible);
            let rb = requirements(b, pools, eligible);

            let a_ok = ra.satisfiable_with(eligible) && ra.total() > 0;
            let b_ok = rb.satisfiable_with(eligible) && rb.total() > 0;

            match (a_ok, b_ok) {
                (true, true) => {
                    if rb.total() < ra.total() {
                        rb
                    } else {
                        ra
                    }
                }
                (true, false) => ra,
                (false, true) => rb,
                (false, false) => {
                    // Neither branch is both satisfiable and non-empty;
                    // fall back to a vacuous branch if one exists,
                    // otherwise let selection report the shortfall.
                    if ra.satisfiable_with(eligible) {
                        ra
                    } else if rb.satisfiable_with(eligible) {
                        rb
                    } else if ra.total() <= rb.total() {
                        ra
                    } else {
                        rb
                    }
                }
            }
        }
    }
}

fn by_role(role: WitnessType, count: usize) -> RoleCounts {
    match role {
        WitnessType::Batch => RoleCounts {
            batch: count,
            system: 0,
        },
        WitnessType::System => RoleCounts {
            batch: 0,
            system: count,
        },
    }
}

/// ceil(percent% of pool).
fn min_count(percent: u32, pool: usize) -> usize {
    (percent as usize * pool).div_ceil(100)
}

/// Choose `required` witnesses from `eligible` in input order, preferring
/// witnesses whose URI serves both roles.
fn pick<'a>(
    eligible: &[&'a Witness],
    required: usize,
    common: &HashSet<&str>,
) -> Result<Vec<&'a Witness>, PolicyError> {
    if eligible.len() < required {
        return Err(PolicyError::Selection {
            required,
            available: eligible.len(),
        });
    }

    let preferred = eligible.iter().filter(|w| common.contains(w.uri.as_str()));
    let rest = eligible.iter().filter(|w| !common.contains(w.uri.as_str()));

    Ok(preferred.chain(rest).take(required).copied().collect())
}

/// Witnesses from `a` whose URI also occurs in `b`, deduplicated,
/// preserving the order of `a`.
pub fn intersection<'a>(a: &'a [Witness], b: &[Witness]) -> Vec<&'a Witness> {
    let mut seen = HashSet::new();

    a.iter()
        .filter(|w| b.iter().any(|other| other.uri == w.uri))
        .filter(|w| seen.insert(w.uri.as_str()))
        .collect()
}

/// Witnesses from `eligible` whose URI does not occur in `preferred`,
/// deduplicated, preserving the order of `eligible`.
pub fn difference<'a>(eligible: &'a [Witness], preferred: &[Witness]) -> Vec<&'a Witness> {
    let mut seen = HashSet::new();

    eligible
        .iter()
        .filter(|w| !preferred.iter().any(|other| other.uri == w.uri))
        .filter(|w| seen.insert(w.uri.as_str()))
        .collect()
}
