//! # High-Level Workflow Orchestration

pub mod imputation;

pub use imputation::ImputationPipeline;
