//! # File Reading/Writing
//!
//! Target VCF input, block-compressed reference panels, dosage output.

pub mod dosage_writer;
pub mod reference;
pub mod target;

pub use dosage_writer::DosageWriter;
pub use reference::ReferenceBlockReader;
