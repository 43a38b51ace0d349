//! # In-Memory Data Representations
//!
//! - `variant`: reference/target site records and sentinel values
//! - `block`: unique-haplotype blocks and the reduced reference panel
//! - `genetic_map`: cM interpolation and recombination conversions

pub mod block;
pub mod genetic_map;
pub mod variant;

pub use block::{PanelCursor, ReducedHaplotypes, UniqueHaplotypeBlock, UNIQUE_EOV};
pub use variant::{
    dosage_eov, is_dosage_eov, ReferenceSiteInfo, ReferenceVariant, TargetVariant, GT_EOV,
    GT_MISSING,
};
