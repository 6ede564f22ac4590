//! scicurate-ingestion: harvesting, scoring and full-text enrichment.
//! - Windowed literature harvesting (PubMed E-utilities)
//! - Record parsing, classification and heuristic reliability scoring
//! - Deduplication
//! - Full-text resolution (PMC, Europe PMC, Unpaywall) into a sharded store

pub mod dedup;
pub mod fulltext;
pub mod harvester;
pub mod journal;
pub mod models;
pub mod parser;
pub mod scoring;
pub mod sources;
pub mod workers;

pub use harvester::{HarvestGap, HarvestStage, Harvester, HarvesterConfig, TopicHarvest, TopicQuery};
pub use models::{DateRange, FulltextPointer, FulltextStatus, RawRecord, Record, StudyDesign};
pub use scoring::{HeuristicScorer, ReliabilityScore, ScoringConfig};
