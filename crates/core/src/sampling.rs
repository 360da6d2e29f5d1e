//! Per-rater deterministic item sampling.
//!
//! A rater sees a fixed-size subset of the item pool, in an order derived
//! from their identifier alone. Reloading a session with the same
//! identifier shows the same items in the same order.
//!
//! Where the identifier comes from is an explicit choice
//! ([`RaterIdSource`]): a user-supplied id is reproducible across sessions,
//! a session-random id only within the session that generated it.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::CoreError;
use crate::hashing::seed_from_str;
use crate::types::{ItemKey, RaterId};

/// Number of items each rater is asked to judge.
pub const DEFAULT_SAMPLE_SIZE: usize = 3;

/// Maximum length of a rater identifier.
const MAX_RATER_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Rater identifiers
// ---------------------------------------------------------------------------

/// Where a rater identifier comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaterIdSource {
    /// Chosen by the rater; sampling is reproducible across sessions.
    UserSupplied(String),
    /// Generated per session as `rater_NNNN`; sampling is reproducible only
    /// while the session keeps its id.
    SessionRandom,
}

impl RaterIdSource {
    pub fn resolve(&self) -> Result<RaterId, CoreError> {
        self.resolve_with_rng(&mut rand::rng())
    }

    pub fn resolve_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<RaterId, CoreError> {
        match self {
            Self::UserSupplied(id) => {
                validate_rater_id(id)?;
                Ok(id.trim().to_string())
            }
            Self::SessionRandom => Ok(format!("rater_{}", rng.random_range(1000..=9999))),
        }
    }
}

/// Validate a rater identifier: non-empty, bounded, no control characters.
pub fn validate_rater_id(id: &str) -> Result<(), CoreError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(CoreError::Validation(
            "Rater id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_RATER_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Rater id must not exceed {MAX_RATER_ID_LEN} characters"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(CoreError::Validation(
            "Rater id must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Draws a rater's items from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaterSampler {
    sample_size: usize,
}

impl Default for RaterSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

impl RaterSampler {
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Deterministic sample of `pool` for `rater_id`.
    ///
    /// The pool is canonicalized (sorted, de-duplicated) before the seeded
    /// shuffle, so its in-memory order does not matter.
    pub fn sample<T: Ord + Clone>(&self, rater_id: &str, pool: &[T]) -> Vec<T> {
        let mut canonical = pool.to_vec();
        canonical.sort();
        canonical.dedup();

        let mut rng = StdRng::seed_from_u64(seed_from_str(rater_id));
        canonical.shuffle(&mut rng);
        canonical.truncate(self.sample_size);
        canonical
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A rater's sampled items and how far they have got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaterSession {
    rater_id: RaterId,
    items: Vec<ItemKey>,
    progress: usize,
}

impl RaterSession {
    /// Start a fresh session over `pool`.
    pub fn start(sampler: &RaterSampler, rater_id: RaterId, pool: &[ItemKey]) -> Self {
        let items = sampler.sample(&rater_id, pool);
        Self {
            rater_id,
            items,
            progress: 0,
        }
    }

    /// Rebuild a session, skipping items this rater already judged.
    pub fn resume(
        sampler: &RaterSampler,
        rater_id: RaterId,
        pool: &[ItemKey],
        judged: &BTreeSet<ItemKey>,
    ) -> Self {
        let mut session = Self::start(sampler, rater_id, pool);
        session.progress = session
            .items
            .iter()
            .position(|item| !judged.contains(item))
            .unwrap_or(session.items.len());
        session
    }

    pub fn rater_id(&self) -> &str {
        &self.rater_id
    }

    pub fn items(&self) -> &[ItemKey] {
        &self.items
    }

    pub fn progress(&self) -> usize {
        self.progress
    }

    /// The item to show next, if any.
    pub fn current(&self) -> Option<&ItemKey> {
        self.items.get(self.progress)
    }

    /// Move to the next item. No-op once complete.
    pub fn advance(&mut self) {
        if self.progress < self.items.len() {
            self.progress += 1;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= self.items.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<ItemKey> {
        (1..=n).map(|i| format!("sample{i}")).collect()
    }

    // -- sample ---------------------------------------------------------------

    #[test]
    fn same_rater_same_sample() {
        let sampler = RaterSampler::default();
        let pool = items(10);
        assert_eq!(sampler.sample("rater_4821", &pool), sampler.sample("rater_4821", &pool));
    }

    #[test]
    fn pool_order_does_not_matter() {
        let sampler = RaterSampler::default();
        let pool = items(10);
        let mut reversed = pool.clone();
        reversed.reverse();
        assert_eq!(sampler.sample("alice", &pool), sampler.sample("alice", &reversed));
    }

    #[test]
    fn sample_has_fixed_size_and_no_repeats() {
        let sampler = RaterSampler::new(3);
        let sample = sampler.sample("bob", &items(10));
        assert_eq!(sample.len(), 3);
        let unique: BTreeSet<_> = sample.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn distinct_raters_usually_differ() {
        let sampler = RaterSampler::default();
        let pool = items(20);
        let samples: BTreeSet<Vec<ItemKey>> = (0..20)
            .map(|i| sampler.sample(&format!("rater_{i}"), &pool))
            .collect();
        // 20 raters over C(20,3)*3! orderings: collisions should be rare.
        assert!(samples.len() >= 15, "only {} distinct samples", samples.len());
    }

    #[test]
    fn small_pool_returns_all_items() {
        let sampler = RaterSampler::new(5);
        let mut sample = sampler.sample("carol", &items(2));
        sample.sort();
        assert_eq!(sample, items(2));
    }

    #[test]
    fn empty_pool_yields_empty_sample() {
        let sampler = RaterSampler::default();
        assert!(sampler.sample::<ItemKey>("dave", &[]).is_empty());
    }

    // -- RaterIdSource --------------------------------------------------------

    #[test]
    fn session_random_id_format() {
        let id = RaterIdSource::SessionRandom.resolve().unwrap();
        let digits = id.strip_prefix("rater_").unwrap();
        let n: u32 = digits.parse().unwrap();
        assert!((1000..=9999).contains(&n));
    }

    #[test]
    fn user_supplied_id_is_trimmed_and_validated() {
        assert_eq!(
            RaterIdSource::UserSupplied("  alice ".to_string()).resolve().unwrap(),
            "alice"
        );
        assert!(RaterIdSource::UserSupplied("   ".to_string()).resolve().is_err());
        assert!(RaterIdSource::UserSupplied("a\nb".to_string()).resolve().is_err());
    }

    // -- RaterSession ---------------------------------------------------------

    #[test]
    fn session_advances_to_completion() {
        let sampler = RaterSampler::default();
        let mut session = RaterSession::start(&sampler, "erin".to_string(), &items(10));
        assert_eq!(session.items().len(), 3);
        for _ in 0..3 {
            assert!(session.current().is_some());
            session.advance();
        }
        assert!(session.is_complete());
        assert!(session.current().is_none());
        session.advance();
        assert_eq!(session.progress(), 3);
    }

    #[test]
    fn resume_skips_judged_items() {
        let sampler = RaterSampler::default();
        let pool = items(10);
        let fresh = RaterSession::start(&sampler, "frank".to_string(), &pool);
        let judged: BTreeSet<ItemKey> = fresh.items()[..2].iter().cloned().collect();

        let resumed = RaterSession::resume(&sampler, "frank".to_string(), &pool, &judged);
        assert_eq!(resumed.items(), fresh.items());
        assert_eq!(resumed.progress(), 2);
        assert_eq!(resumed.current(), Some(&fresh.items()[2]));
    }
}
