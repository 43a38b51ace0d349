//! # Statistical Models
//!
//! The Li-Stephens imputation HMM and its result storage.

pub mod hmm;
pub mod results;

pub use hmm::HiddenMarkovModel;
pub use results::{DosageResults, HaplotypeDosages};
