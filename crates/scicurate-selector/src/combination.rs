//! Combination keys: the attribute pairs the selector balances.

use std::collections::BTreeSet;
use std::fmt;

use scicurate_ingestion::models::Record;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    TopicGoal,
    TopicPopulation,
    GoalPopulation,
    DesignGoal,
    VenueTopic,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::TopicGoal,
        Dimension::TopicPopulation,
        Dimension::GoalPopulation,
        Dimension::DesignGoal,
        Dimension::VenueTopic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::TopicGoal       => "topic_goal",
            Dimension::TopicPopulation => "topic_population",
            Dimension::GoalPopulation  => "goal_population",
            Dimension::DesignGoal      => "design_goal",
            Dimension::VenueTopic      => "venue_topic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CombinationKey {
    pub dimension: Dimension,
    pub left: String,
    pub right: String,
}

impl CombinationKey {
    pub fn new(dimension: Dimension, left: impl Into<String>, right: impl Into<String>) -> Self {
        Self { dimension, left: left.into(), right: right.into() }
    }
}

impl fmt::Display for CombinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}×{}", self.dimension.as_str(), self.left, self.right)
    }
}

fn pairs<'a>(
    dimension: Dimension,
    left: impl IntoIterator<Item = &'a str> + Clone,
    right: impl IntoIterator<Item = &'a str> + Clone,
    out: &mut BTreeSet<CombinationKey>,
) {
    for l in left {
        for r in right.clone() {
            out.insert(CombinationKey::new(dimension, l, r));
        }
    }
}

/// Every distinct combination key a record contributes, across all five
/// dimensions. Multi-valued tags expand to their cross product.
pub fn keys_for(record: &Record) -> BTreeSet<CombinationKey> {
    let topic = [record.primary_topic.as_str()];
    let goals: Vec<&str> = record.goals.iter().map(String::as_str).collect();
    let populations: Vec<&str> = record.populations.iter().map(String::as_str).collect();
    let design = [record.design.as_str()];
    let venue = record.venue_key();

    let mut keys = BTreeSet::new();
    pairs(Dimension::TopicGoal, topic, goals.iter().copied(), &mut keys);
    pairs(Dimension::TopicPopulation, topic, populations.iter().copied(), &mut keys);
    pairs(Dimension::GoalPopulation, goals.iter().copied(), populations.iter().copied(), &mut keys);
    pairs(Dimension::DesignGoal, design, goals.iter().copied(), &mut keys);
    pairs(Dimension::VenueTopic, [venue.as_str()], topic, &mut keys);
    keys
}
