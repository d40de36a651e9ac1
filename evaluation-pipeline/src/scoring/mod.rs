//! Field-level scoring of extraction output against ground truth.

pub mod compare;
pub mod exclusion;
pub mod flatten;
pub mod metrics;
pub mod normalize;

pub use compare::{compare, Comparison};
pub use exclusion::{remove_fields, select_extraction_types};
pub use flatten::{flatten, ArrayKeys, FlatMap};
pub use metrics::{aggregate, field_metrics};
pub use normalize::normalize;
