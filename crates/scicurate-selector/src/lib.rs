//! scicurate-selector: diversity-balanced corpus selection.
//! Reduces a quality-floored candidate pool to an exact target size while
//! protecting each topic's strongest evidence and flattening over-represented
//! attribute combinations.

pub mod combination;
pub mod quota;
pub mod selector;
pub mod weights;

pub use combination::{keys_for, CombinationKey, Dimension};
pub use selector::{select, DiversitySelector, RoundReport, Selection, SelectionConfig, SelectionError, SelectorState};
pub use weights::WeightTable;
