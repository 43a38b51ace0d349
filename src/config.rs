//! # Configuration Logic
//!
//! CLI argument parsing and validation using clap derive.

use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{RemacError, Result};

/// What to do when a chunk's typed:imputed ratio falls below `--min-ratio`.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinRatioBehavior {
    /// Skip the chunk with a warning; the run still succeeds.
    Skip,
    /// Fail the whole run.
    Fail,
}

/// Output file format for ambiguous output filenames.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Vcf,
    #[value(name = "vcf.gz")]
    VcfGz,
}

/// remac: genotype imputation from block-compressed reference panels
#[derive(Parser, Debug, Clone)]
#[command(name = "remac")]
#[command(version)]
#[command(about = "Genotype imputation from block-compressed reference panels")]
#[command(
    override_usage = "remac [OPTIONS] <reference.msav> <target.vcf[.gz]>\n       \
                      remac [OPTIONS] --update-m3vcf <reference.m3vcf.gz>\n       \
                      remac [OPTIONS] --compress-reference <reference.vcf[.gz]>"
)]
pub struct Config {
    /// Input files: reference panel and target VCF (one input file with
    /// --compress-reference or --update-m3vcf)
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    // ============ Input/Output ============
    /// Output path
    #[arg(long, short = 'o', value_name = "PATH", default_value = "/dev/stdout")]
    pub output: PathBuf,

    /// Default output file format used for ambiguous filenames
    #[arg(long = "output-format", short = 'O', value_enum, default_value = "vcf.gz")]
    pub output_format: OutputFormat,

    /// Comma-separated list of FORMAT fields to generate (GT, HDS, DS, GP, or SD)
    #[arg(long, short = 'f', value_name = "LIST", default_value = "HDS")]
    pub format: String,

    /// Include in the output sites that exist only in the target VCF
    #[arg(long = "all-typed-sites", short = 'a')]
    pub all_typed_sites: bool,

    /// Minimum estimated r-square for output variants
    #[arg(long = "min-r2", value_name = "FLOAT", allow_hyphen_values = true, default_value_t = -1.0)]
    pub min_r2: f32,

    // ============ Region Control ============
    /// Genomic region to impute ([chrom] or [chrom]:[start]-[end])
    #[arg(long, short = 'r', value_name = "REGION")]
    pub region: Option<String>,

    /// Maximum chunk length in base pairs to impute at once
    #[arg(long, short = 'c', value_name = "BP", default_value_t = 20_000_000)]
    pub chunk: u64,

    /// Size (in base pairs) of overlap before and after the impute region
    /// to use as input to the HMM
    #[arg(long, short = 'w', value_name = "BP", default_value_t = 3_000_000)]
    pub overlap: u64,

    /// Genetic map file
    #[arg(long, short = 'm', value_name = "FILE")]
    pub map: Option<PathBuf>,

    /// Comma-separated list of sample IDs to subset from the reference panel
    #[arg(long = "sample-ids", value_name = "LIST")]
    pub sample_ids: Option<String>,

    /// Text file containing sample IDs to subset from the reference panel
    /// (one ID per line)
    #[arg(long = "sample-ids-file", value_name = "FILE")]
    pub sample_ids_file: Option<PathBuf>,

    // ============ Performance ============
    /// Number of threads
    #[arg(long, short = 't', value_name = "INT", default_value_t = 1)]
    pub threads: usize,

    /// Number of samples to impute before writing to temporary files
    #[arg(long = "temp-buffer", short = 'b', value_name = "INT", default_value_t = 200)]
    pub temp_buffer: usize,

    /// Prefix path for temporary output files (default: ${TMPDIR}/m4_)
    #[arg(long = "temp-prefix", value_name = "PATH")]
    pub temp_prefix: Option<String>,

    // ============ HMM Parameters ============
    /// Minimum ratio of number of target sites to reference sites
    #[arg(long = "min-ratio", value_name = "FLOAT", default_value_t = 1e-4)]
    pub min_ratio: f32,

    /// Behavior for when --min-ratio is not met
    #[arg(long = "min-ratio-behavior", value_enum, default_value = "fail")]
    pub min_ratio_behavior: MinRatioBehavior,

    /// Error parameter for HMM match probabilities
    #[arg(long = "match-error", value_name = "FLOAT", default_value_t = 0.01)]
    pub match_error: f32,

    /// Minimum recombination probability
    #[arg(long = "min-recom", value_name = "FLOAT", default_value_t = 1e-5)]
    pub min_recom: f32,

    /// Probability threshold used for template selection
    #[arg(long = "prob-threshold", value_name = "FLOAT", default_value_t = 0.01)]
    pub prob_threshold: f32,

    /// Probability threshold used for template selection in the original
    /// state space (negative: keep every haplotype of the selected templates)
    #[arg(long = "prob-threshold-s1", value_name = "FLOAT", allow_hyphen_values = true, default_value_t = -1.0)]
    pub prob_threshold_s1: f32,

    /// Probability diff threshold used in template selection
    #[arg(long = "diff-threshold", value_name = "FLOAT", default_value_t = 0.01)]
    pub diff_threshold: f32,

    /// Decay rate for dosages in flanking regions (0 disables decay)
    #[arg(long, value_name = "FLOAT", default_value_t = 0.0)]
    pub decay: f64,

    // ============ Reference Compression / Conversion ============
    /// Convert an M3VCF reference panel to the block-compressed format
    #[arg(long = "update-m3vcf")]
    pub update_m3vcf: bool,

    /// Compress a phased VCF reference panel into the block-compressed format
    #[arg(long = "compress-reference")]
    pub compress_reference: bool,

    /// Minimum block size for unique haplotype compression
    #[arg(long = "min-block-size", value_name = "INT", default_value_t = 10)]
    pub min_block_size: usize,

    /// Maximum block size for unique haplotype compression
    #[arg(long = "max-block-size", value_name = "INT", default_value_t = 0xFFFF)]
    pub max_block_size: usize,

    /// Interval of variants at which the compression heuristic checks the
    /// compression-ratio slope
    #[arg(long = "slope-unit", value_name = "INT", default_value_t = 10)]
    pub slope_unit: usize,
}

impl Config {
    /// Parse command line arguments and validate
    pub fn parse_and_validate() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let expected_inputs = if self.update_m3vcf || self.compress_reference {
            1
        } else {
            2
        };
        if self.files.len() != expected_inputs {
            return Err(RemacError::usage(format!(
                "expected {} input file(s), got {}",
                expected_inputs,
                self.files.len()
            )));
        }
        for path in &self.files {
            if !path.exists() {
                return Err(RemacError::usage(format!(
                    "input file does not exist: {}",
                    path.display()
                )));
            }
        }
        if let Some(ref map_path) = self.map {
            if !map_path.exists() {
                return Err(RemacError::usage(format!(
                    "genetic map file does not exist: {}",
                    map_path.display()
                )));
            }
        }
        if self.update_m3vcf && self.compress_reference {
            return Err(RemacError::usage(
                "--update-m3vcf and --compress-reference are mutually exclusive",
            ));
        }
        if self.threads == 0 {
            return Err(RemacError::usage("--threads must be at least 1"));
        }
        if self.temp_buffer == 0 {
            return Err(RemacError::usage("--temp-buffer must be at least 1"));
        }
        if self.chunk == 0 {
            return Err(RemacError::usage("--chunk must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_ratio) {
            return Err(RemacError::usage("--min-ratio must be in [0, 1]"));
        }
        if !(0.0..=0.5).contains(&self.min_recom) {
            return Err(RemacError::usage("--min-recom must be in [0, 0.5]"));
        }
        if !(0.0..=1.0).contains(&self.match_error) {
            return Err(RemacError::usage("--match-error must be in [0, 1]"));
        }
        self.format_fields()?;
        Ok(())
    }

    /// Reference panel path (first positional input).
    pub fn ref_path(&self) -> &PathBuf {
        &self.files[0]
    }

    /// Target panel path (second positional input, impute mode only).
    pub fn tar_path(&self) -> &PathBuf {
        &self.files[1]
    }

    /// FORMAT fields requested via `--format`, validated.
    pub fn format_fields(&self) -> Result<Vec<String>> {
        let mut fields = Vec::new();
        for raw in self.format.split(',') {
            let field = raw.trim().to_ascii_uppercase();
            match field.as_str() {
                "GT" | "HDS" | "DS" | "GP" | "SD" => {
                    if !fields.contains(&field) {
                        fields.push(field);
                    }
                }
                other => {
                    return Err(RemacError::usage(format!(
                        "unsupported FORMAT field '{}' (expected GT, HDS, DS, GP, or SD)",
                        other
                    )))
                }
            }
        }
        if fields.is_empty() {
            return Err(RemacError::usage("--format must name at least one field"));
        }
        Ok(fields)
    }

    /// Reference sample subset from `--sample-ids` / `--sample-ids-file`.
    /// Empty set means "keep all samples".
    pub fn load_sample_ids(&self) -> Result<HashSet<String>> {
        use std::io::{BufRead, BufReader};

        let mut ids = HashSet::new();
        if let Some(ref list) = self.sample_ids {
            for id in list.split(',') {
                let id = id.trim();
                if !id.is_empty() {
                    ids.insert(id.to_string());
                }
            }
        }
        if let Some(ref path) = self.sample_ids_file {
            let reader = BufReader::new(std::fs::File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                let id = line.trim();
                if !id.is_empty() && !id.starts_with('#') {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Prefix for temporary spool files.
    pub fn temp_prefix_or_default(&self) -> String {
        self.temp_prefix.clone().unwrap_or_else(|| {
            let tmpdir = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
            format!("{}/m4_", tmpdir.trim_end_matches('/'))
        })
    }

    /// True when the output should be bgzf-compressed.
    pub fn output_is_compressed(&self) -> bool {
        match self.output.extension().and_then(|e| e.to_str()) {
            Some("gz") | Some("bgz") => true,
            Some("vcf") => false,
            _ => self.output_format == OutputFormat::VcfGz,
        }
    }
}

/// A genomic query region, 1-based inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenomicRegion {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl GenomicRegion {
    pub fn new(chrom: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            chrom: chrom.into(),
            start,
            end,
        }
    }

    /// Parse `[chrom]` or `[chrom]:[start]-[end]`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(':') {
            None => {
                if text.trim().is_empty() {
                    return Err(RemacError::usage(format!("malformed region '{}'", text)));
                }
                Ok(Self::new(text, 1, u64::MAX))
            }
            Some((chrom, range)) => {
                let (start, end) = range.split_once('-').ok_or_else(|| {
                    RemacError::usage(format!(
                        "malformed region '{}' (expected chrom:start-end)",
                        text
                    ))
                })?;
                let start: u64 = start
                    .parse()
                    .map_err(|_| RemacError::usage(format!("bad region start in '{}'", text)))?;
                let end: u64 = end
                    .parse()
                    .map_err(|_| RemacError::usage(format!("bad region end in '{}'", text)))?;
                if start == 0 || end < start || chrom.is_empty() {
                    return Err(RemacError::usage(format!("malformed region '{}'", text)));
                }
                Ok(Self::new(chrom, start, end))
            }
        }
    }

    /// Extend by `flank` base pairs on both sides (clamped at 1).
    pub fn extended(&self, flank: u64) -> Self {
        Self {
            chrom: self.chrom.clone(),
            start: self.start.saturating_sub(flank).max(1),
            end: self.end.saturating_add(flank),
        }
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos <= self.end
    }
}
