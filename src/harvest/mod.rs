//! Harvest module - watermark-driven scan and copy.
//!
//! - **Scan**: depth-first source walk via [`scan::find_candidates`]
//! - **Naming**: collision-resistant output names via [`naming::NameGenerator`]
//! - **Pipeline**: the stateful [`pipeline::Harvester`]

pub mod naming;
pub mod pipeline;
pub mod scan;

pub use naming::{extension_of, NameGenerator};
pub use pipeline::{HarvestError, Harvester};
pub use scan::{find_candidates, Candidate, WalkOutcome, SKIPPED_DIR};
