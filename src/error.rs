//! # Error Handling
//!
//! Failures are grouped the way the orchestrator reacts to them: a path
//! that will not open, a record that will not parse, inputs that do not
//! describe the same data, a panel that contradicts its own declarations,
//! arguments that cannot be honored, and the typed-site ratio gate. All of
//! them propagate to `main` and surface on stderr; nothing below the chunk
//! level recovers.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemacError {
    /// Operating-system failure while reading or writing an open stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A path that could not be opened, keeping the underlying cause.
    #[error("cannot open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line that does not parse as the format its file claims to be.
    #[error("malformed record at line {line}: {context}")]
    Record { line: usize, context: String },

    /// Target, reference, region, and map must describe the same data;
    /// they do not (chromosome mismatch, no shared sites or samples).
    #[error("inputs do not align: {0}")]
    Alignment(String),

    /// A panel violating its own declarations (ploidy change mid-file,
    /// haplotype-count drift, unphased genotypes, missing annotations).
    #[error("unusable panel: {0}")]
    Panel(String),

    /// Arguments that cannot be honored as given.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// Too few typed sites to anchor the HMM, with
    /// `--min-ratio-behavior fail`.
    #[error(
        "only {typed} of {imputed} reference sites are typed; lower \
         --min-ratio or alter --chunk/--region"
    )]
    MinRatio { typed: usize, imputed: usize },
}

pub type Result<T> = std::result::Result<T, RemacError>;

impl RemacError {
    pub fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Open {
            path: path.into(),
            source,
        }
    }

    pub fn record(line: usize, context: impl Into<String>) -> Self {
        Self::Record {
            line,
            context: context.into(),
        }
    }

    pub fn alignment(reason: impl Into<String>) -> Self {
        Self::Alignment(reason.into())
    }

    pub fn panel(reason: impl Into<String>) -> Self {
        Self::Panel(reason.into())
    }

    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage(reason.into())
    }
}
