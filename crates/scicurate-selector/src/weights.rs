//! Per-round representation weights.
//!
//! For each dimension the target count of a key is `pool / distinct keys in
//! that dimension`; the key's weight comes from the observed/target ratio.

use std::collections::{BTreeMap, HashMap};

use scicurate_ingestion::models::Record;
use serde::{Deserialize, Serialize};

use crate::combination::{keys_for, CombinationKey, Dimension};

/// (ratio strictly above, weight), checked top to bottom.
const OVER_BANDS: &[(f64, f64)] = &[
    (3.0, -2.0),
    (2.0, -1.0),
    (1.0,  0.0),
];
const NEAR_TARGET_FLOOR: f64 = 0.5;
const NEAR_TARGET_WEIGHT: f64 = 1.5;
const UNDER_WEIGHT: f64 = 3.0;

/// Reliability below which a positive combination score is capped.
pub const LOW_RELIABILITY: f64 = 5.0;
/// Cap as a fraction of reliability.
pub const LOW_RELIABILITY_CAP: f64 = 0.3;

/// Weight of a key from its observed/target ratio.
///
/// Bands are checked in order, so a key exactly on target (ratio 1.0) falls
/// into the `>= 0.5` band and gets +1.5, the same as a slightly
/// under-represented key. Only keys strictly above target are neutral or
/// penalised.
pub fn weight_for_ratio(ratio: f64) -> f64 {
    for &(above, w) in OVER_BANDS {
        if ratio > above {
            return w;
        }
    }
    if ratio >= NEAR_TARGET_FLOOR { NEAR_TARGET_WEIGHT } else { UNDER_WEIGHT }
}

/// Caps diversity bonuses for weak evidence.
pub fn cap_combination(combination: f64, reliability: f64) -> f64 {
    if reliability < LOW_RELIABILITY && combination > 0.0 {
        combination.min(LOW_RELIABILITY_CAP * reliability)
    } else {
        combination
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyStats {
    pub observed: usize,
    pub target: f64,
    pub weight: f64,
}

impl KeyStats {
    pub fn ratio(&self) -> f64 {
        if self.target > 0.0 { self.observed as f64 / self.target } else { 0.0 }
    }
}

/// Weights for one round. Built fresh from the current pool every round.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    stats: HashMap<CombinationKey, KeyStats>,
    pool_size: usize,
}

impl WeightTable {
    pub fn build(pool: &[Record]) -> Self {
        let mut observed: HashMap<CombinationKey, usize> = HashMap::new();
        for r in pool {
            for key in keys_for(r) {
                *observed.entry(key).or_default() += 1;
            }
        }

        let mut distinct: BTreeMap<Dimension, usize> = BTreeMap::new();
        for key in observed.keys() {
            *distinct.entry(key.dimension).or_default() += 1;
        }

        let stats = observed
            .into_iter()
            .map(|(key, n)| {
                let target = pool.len() as f64 / distinct[&key.dimension] as f64;
                let mut s = KeyStats { observed: n, target, weight: 0.0 };
                s.weight = weight_for_ratio(s.ratio());
                (key, s)
            })
            .collect();

        Self { stats, pool_size: pool.len() }
    }

    pub fn get(&self, key: &CombinationKey) -> Option<&KeyStats> {
        self.stats.get(key)
    }

    pub fn weight(&self, key: &CombinationKey) -> f64 {
        self.stats.get(key).map(|s| s.weight).unwrap_or(0.0)
    }

    /// Fraction of the pool carrying `key`.
    pub fn share(&self, key: &CombinationKey) -> f64 {
        if self.pool_size == 0 {
            return 0.0;
        }
        self.stats.get(key).map(|s| s.observed as f64 / self.pool_size as f64).unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CombinationKey, &KeyStats)> {
        self.stats.iter()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Sum of the record's key weights, capped for low reliability.
    pub fn combination_score(&self, record: &Record) -> f64 {
        let raw: f64 = keys_for(record).iter().map(|k| self.weight(k)).sum();
        cap_combination(raw, record.reliability.base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record;

    #[test]
    fn test_weight_bands() {
        assert_eq!(weight_for_ratio(3.5), -2.0);
        assert_eq!(weight_for_ratio(3.0), -1.0);
        assert_eq!(weight_for_ratio(2.5), -1.0);
        assert_eq!(weight_for_ratio(1.5), 0.0);
        assert_eq!(weight_for_ratio(1.0 + 1e-9), 0.0);
        // On target counts as the near-target band.
        assert_eq!(weight_for_ratio(1.0), 1.5);
        assert_eq!(weight_for_ratio(0.5), 1.5);
        assert_eq!(weight_for_ratio(0.49), 3.0);
    }

    #[test]
    fn test_cap_applies_only_to_weak_positive() {
        assert!((cap_combination(6.0, 4.0) - 1.2).abs() < 1e-9);
        assert_eq!(cap_combination(-2.0, 4.0), -2.0);
        assert_eq!(cap_combination(6.0, 5.0), 6.0);
    }

    #[test]
    fn test_dominant_key_is_penalised() {
        // 8 records on one venue×topic key, 1 each on two others.
        let mut pool: Vec<_> = (0..8).map(|i| record(&format!("a{i}"), "creatine", 8.0, 2020)).collect();
        let mut b = record("b", "caffeine", 8.0, 2020);
        b.venue = Some("Other Journal".into());
        let mut c = record("c", "nitrate", 8.0, 2020);
        c.venue = Some("Third Journal".into());
        pool.push(b);
        pool.push(c);

        let table = WeightTable::build(&pool);
        let dominant = CombinationKey::new(Dimension::VenueTopic, "journal", "creatine");
        let rare = CombinationKey::new(Dimension::VenueTopic, "other journal", "caffeine");
        // target = 10 / 3; 8 / 3.33 = 2.4 → −1; 1 / 3.33 = 0.3 → +3
        assert_eq!(table.weight(&dominant), -1.0);
        assert_eq!(table.weight(&rare), 3.0);
        assert!((table.share(&dominant) - 0.8).abs() < 1e-9);
        assert!(table.combination_score(&pool[0]) < table.combination_score(&pool[8]));
    }
}
