//! Iterative diversity selection: N → exactly T.
//!
//! Each round rebuilds the weight table from the current pool, rescores every
//! record, and eliminates the weakest non-protected batch. Protected records
//! are never eliminated.

use std::collections::BTreeSet;

use scicurate_ingestion::models::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::quota::protected_set;
use crate::weights::WeightTable;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("protected quota ({protected}) exceeds target ({target})")]
    ProtectedQuotaExceedsTarget { protected: usize, target: usize },

    #[error("target ({target}) exceeds candidate pool ({pool})")]
    TargetExceedsPool { target: usize, pool: usize },

    #[error("target must be positive")]
    ZeroTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Final corpus size T.
    #[serde(default = "default_target")]
    pub target: usize,
    /// Records eliminated per round at most.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_protected_per_topic")]
    pub protected_per_topic: usize,
    #[serde(default = "default_protected_per_pair")]
    pub protected_per_pair: usize,
}

fn default_target()              -> usize { 5_000 }
fn default_batch_size()          -> usize { 100 }
fn default_protected_per_topic() -> usize { 10 }
fn default_protected_per_pair()  -> usize { 2 }

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            batch_size: default_batch_size(),
            protected_per_topic: default_protected_per_topic(),
            protected_per_pair: default_protected_per_pair(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: usize,
    pub pool_before: usize,
    pub pool_after: usize,
    pub eliminated: usize,
    pub min_composite: f64,
    pub max_composite: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Running,
    Terminal,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub records: Vec<Record>,
    pub protected: BTreeSet<String>,
    pub rounds: Vec<RoundReport>,
}

pub struct DiversitySelector {
    pool: Vec<Record>,
    protected: BTreeSet<String>,
    target: usize,
    batch_size: usize,
    round: usize,
    state: SelectorState,
}

impl DiversitySelector {
    /// Validates the configuration against the pool and computes the
    /// protected set. No round runs yet.
    pub fn new(pool: Vec<Record>, config: &SelectionConfig) -> Result<Self, SelectionError> {
        if config.target == 0 {
            return Err(SelectionError::ZeroTarget);
        }
        if config.target > pool.len() {
            return Err(SelectionError::TargetExceedsPool { target: config.target, pool: pool.len() });
        }
        let protected = protected_set(&pool, config.protected_per_topic, config.protected_per_pair);
        if protected.len() > config.target {
            return Err(SelectionError::ProtectedQuotaExceedsTarget {
                protected: protected.len(),
                target: config.target,
            });
        }

        info!(pool = pool.len(), target = config.target, protected = protected.len(), "Selector initialised");
        let mut selector = Self {
            pool,
            protected,
            target: config.target,
            batch_size: config.batch_size.max(1),
            round: 0,
            state: SelectorState::Running,
        };
        if selector.pool.len() == selector.target {
            selector.score_round();
            selector.state = SelectorState::Terminal;
        }
        Ok(selector)
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state == SelectorState::Terminal
    }

    pub fn pool(&self) -> &[Record] {
        &self.pool
    }

    pub fn protected(&self) -> &BTreeSet<String> {
        &self.protected
    }

    pub fn round(&self) -> usize {
        self.round
    }

    /// Fresh weights from the current pool; every record gets its combination
    /// score for this round.
    fn score_round(&mut self) -> WeightTable {
        let table = WeightTable::build(&self.pool);
        for r in self.pool.iter_mut() {
            r.combination_score = table.combination_score(r);
        }
        table
    }

    /// Runs one round. Returns `None` once terminal.
    pub fn step(&mut self) -> Option<RoundReport> {
        if self.is_terminal() {
            return None;
        }
        self.round += 1;
        let pool_before = self.pool.len();
        let table = self.score_round();

        let (min_composite, max_composite) = self
            .pool
            .iter()
            .map(Record::composite)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| (lo.min(c), hi.max(c)));

        let n = self.batch_size.min(pool_before - self.target);
        let mut candidates: Vec<usize> = (0..self.pool.len())
            .filter(|&i| !self.protected.contains(&self.pool[i].id))
            .collect();
        candidates.sort_by(|&a, &b| {
            let (ra, rb) = (&self.pool[a], &self.pool[b]);
            ra.composite()
                .total_cmp(&rb.composite())
                .then_with(|| ra.year.unwrap_or(i32::MIN).cmp(&rb.year.unwrap_or(i32::MIN)))
                .then_with(|| ra.id.cmp(&rb.id))
        });

        let doomed: BTreeSet<String> = candidates.into_iter().take(n).map(|i| self.pool[i].id.clone()).collect();
        self.pool.retain(|r| !doomed.contains(&r.id));

        debug!(
            round = self.round,
            pool_before,
            eliminated = doomed.len(),
            weights = table.len(),
            "Selection round"
        );

        if self.pool.len() <= self.target {
            self.state = SelectorState::Terminal;
            info!(rounds = self.round, selected = self.pool.len(), "Selection complete");
        }

        Some(RoundReport {
            round: self.round,
            pool_before,
            pool_after: self.pool.len(),
            eliminated: doomed.len(),
            min_composite,
            max_composite,
        })
    }

    /// Steps to terminal.
    pub fn run(mut self) -> Selection {
        let mut rounds = Vec::new();
        while let Some(report) = self.step() {
            rounds.push(report);
        }
        Selection { records: self.pool, protected: self.protected, rounds }
    }
}

/// Convenience wrapper: validate, then run every round.
pub fn select(pool: Vec<Record>, config: &SelectionConfig) -> Result<Selection, SelectionError> {
    Ok(DiversitySelector::new(pool, config)?.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record;

    fn config(target: usize, batch: usize) -> SelectionConfig {
        SelectionConfig { target, batch_size: batch, protected_per_topic: 1, protected_per_pair: 0 }
    }

    #[test]
    fn test_rejects_target_above_pool() {
        let pool = vec![record("1", "a", 6.0, 2020)];
        let err = DiversitySelector::new(pool, &config(2, 1)).err();
        assert_eq!(err, Some(SelectionError::TargetExceedsPool { target: 2, pool: 1 }));
    }

    #[test]
    fn test_rejects_protected_above_target() {
        let pool = vec![
            record("1", "a", 6.0, 2020),
            record("2", "b", 6.0, 2020),
            record("3", "c", 6.0, 2020),
        ];
        let err = DiversitySelector::new(pool, &config(2, 1)).err();
        assert_eq!(err, Some(SelectionError::ProtectedQuotaExceedsTarget { protected: 3, target: 2 }));
    }

    #[test]
    fn test_pool_equal_to_target_is_terminal_and_scored() {
        let pool = vec![record("1", "a", 6.0, 2020), record("2", "b", 6.0, 2020)];
        let sel = DiversitySelector::new(pool, &config(2, 1)).unwrap();
        assert!(sel.is_terminal());
        assert!(sel.pool().iter().all(|r| r.combination_score != 0.0));
        assert_eq!(sel.run().rounds.len(), 0);
    }

    #[test]
    fn test_ties_eliminate_older_first() {
        let pool = vec![
            record("keep", "a", 9.0, 2020),
            record("old", "a", 6.0, 2001),
            record("new", "a", 6.0, 2021),
        ];
        let sel = select(pool, &config(2, 1)).unwrap();
        let ids: BTreeSet<_> = sel.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, BTreeSet::from(["keep", "new"]));
    }

    #[test]
    fn test_last_batch_is_trimmed_to_hit_target() {
        let pool: Vec<_> = (0..23).map(|i| record(&format!("{i:02}"), "a", 6.0, 2000 + i)).collect();
        let sel = select(pool, &config(10, 5)).unwrap();
        assert_eq!(sel.records.len(), 10);
        let eliminated: Vec<_> = sel.rounds.iter().map(|r| r.eliminated).collect();
        assert_eq!(eliminated, vec![5, 5, 3]);
    }
}
