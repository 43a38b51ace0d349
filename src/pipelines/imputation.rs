//! # Imputation Pipeline
//!
//! Orchestrates an imputation run:
//! 1. Resolve the query region and split it into chunks
//! 2. Per chunk: load target sites and the compressed reference (typed-only
//!    panel over the extended region, full panel over the impute region)
//! 3. Gate on the typed:imputed ratio
//! 4. Fan per-haplotype HMM traversals out over the rayon pool, one engine
//!    per worker, each writing its own dosage column
//! 5. Spool batches to temp files when the cohort exceeds the temp buffer,
//!    then merge and write output records

use std::cell::RefCell;
use std::collections::HashSet;
use std::time::Instant;

use rayon::prelude::*;
use thread_local::ThreadLocal;
use tracing::{info, warn};

use crate::config::{Config, GenomicRegion, MinRatioBehavior};
use crate::data::genetic_map::GeneticMapFile;
use crate::data::block::ReducedHaplotypes;
use crate::data::variant::GT_EOV;
use crate::error::{RemacError, Result};
use crate::io::dosage_writer::{DosageWriter, ResultsRows, SpoolRows, TempSpool};
use crate::io::reference::{
    generate_reverse_maps, load_reference_haplotypes, stat_ref_panel,
};
use crate::io::target::{load_target_haplotypes, separate_target_only_variants, stat_tar_panel};
use crate::model::hmm::HiddenMarkovModel;
use crate::model::results::DosageResults;

/// Typed-only panels are recompressed into blocks of this size range.
const TYPED_MIN_BLOCK: usize = 16;
const TYPED_MAX_BLOCK: usize = 512;

/// Error parameter fallback for sites with no usable annotation.
const BACKGROUND_ERROR: f32 = 1e-5;

/// Imputation pipeline
pub struct ImputationPipeline {
    config: Config,
    fmt_fields: Vec<String>,
}

impl ImputationPipeline {
    pub fn new(config: Config) -> Result<Self> {
        let fmt_fields = config.format_fields()?;
        Ok(Self { config, fmt_fields })
    }

    /// Run the imputation pipeline over every chunk of the query region.
    pub fn run(&self) -> Result<()> {
        let subset_ids = self.config.load_sample_ids()?;
        let sample_ids = stat_tar_panel(self.config.tar_path())?;
        if sample_ids.is_empty() {
            return Err(RemacError::panel("target file declares no samples"));
        }

        let region = self.resolve_region()?;
        info!(
            "query region {}:{}-{} in chunks of {} bp",
            region.chrom, region.start, region.end, self.config.chunk
        );

        let mut writer: Option<DosageWriter> = None;
        let mut chunk_start = region.start;
        while chunk_start <= region.end {
            let chunk_end = chunk_start
                .saturating_add(self.config.chunk - 1)
                .min(region.end);
            let chunk_region = GenomicRegion::new(region.chrom.clone(), chunk_start, chunk_end);
            self.impute_chunk(&chunk_region, &subset_ids, &sample_ids, &mut writer)?;
            if chunk_end == region.end {
                break;
            }
            chunk_start = chunk_end + 1;
        }

        // A run that never produced records still gets a valid header.
        let mut writer = match writer {
            Some(writer) => writer,
            None => self.create_writer(&region.chrom, sample_ids, 2)?,
        };
        writer.flush()?;
        Ok(())
    }

    /// Query region from `--region`, completed against the reference panel
    /// when open-ended.
    fn resolve_region(&self) -> Result<GenomicRegion> {
        match &self.config.region {
            Some(text) => {
                let region = GenomicRegion::parse(text)?;
                if region.end != u64::MAX {
                    return Ok(region);
                }
                let (ref_chrom, max_pos) = stat_ref_panel(self.config.ref_path())?;
                if ref_chrom != region.chrom {
                    return Err(RemacError::alignment(format!(
                        "region chromosome {} not present in reference panel (found {})",
                        region.chrom, ref_chrom
                    )));
                }
                Ok(GenomicRegion::new(region.chrom.clone(), region.start, max_pos))
            }
            None => {
                let (chrom, max_pos) = stat_ref_panel(self.config.ref_path())?;
                Ok(GenomicRegion::new(chrom, 1, max_pos))
            }
        }
    }

    fn create_writer(
        &self,
        chrom: &str,
        sample_ids: Vec<String>,
        ploidy: usize,
    ) -> Result<DosageWriter> {
        DosageWriter::create(
            &self.config.output,
            self.config.output_is_compressed(),
            sample_ids,
            ploidy,
            self.fmt_fields.clone(),
            chrom,
            self.config.min_r2,
        )
    }

    /// Impute one genomic chunk and stream its records to the writer.
    fn impute_chunk(
        &self,
        impute_region: &GenomicRegion,
        subset_ids: &HashSet<String>,
        sample_ids: &[String],
        writer: &mut Option<DosageWriter>,
    ) -> Result<()> {
        let extended_region = impute_region.extended(self.config.overlap);
        info!(
            "imputing {}:{}-{} ...",
            impute_region.chrom, impute_region.start, impute_region.end
        );

        let start_time = Instant::now();
        let (mut target_sites, tar_sample_ids) =
            load_target_haplotypes(self.config.tar_path(), &extended_region)?;
        info!(
            "loading target haplotypes took {:.1}s",
            start_time.elapsed().as_secs_f64()
        );
        if tar_sample_ids.as_slice() != sample_ids {
            return Err(RemacError::panel("target sample list changed mid-run"));
        }

        let start_time = Instant::now();
        let mut typed_only_reference_data = ReducedHaplotypes::new(TYPED_MIN_BLOCK, TYPED_MAX_BLOCK);
        let mut full_reference_data = ReducedHaplotypes::default();
        let mut map_file = match &self.config.map {
            Some(path) => Some(GeneticMapFile::new(path, &impute_region.chrom)?),
            None => None,
        };
        load_reference_haplotypes(
            self.config.ref_path(),
            &extended_region,
            impute_region,
            subset_ids,
            &mut target_sites,
            &mut typed_only_reference_data,
            &mut full_reference_data,
            &mut map_file,
            self.config.min_recom,
            self.config.match_error,
        )?;
        info!(
            "loading reference haplotypes took {:.1}s",
            start_time.elapsed().as_secs_f64()
        );

        let mut target_only_sites = separate_target_only_variants(&mut target_sites);

        if full_reference_data.variant_size() == 0 {
            info!(
                "skipping empty region in reference ({}:{}-{})",
                impute_region.chrom, impute_region.start, impute_region.end
            );
            return Ok(());
        }

        let ratio =
            typed_only_reference_data.variant_size() as f32 / full_reference_data.variant_size() as f32;
        info!(
            "typed sites to imputed sites ratio: {} ({}/{})",
            ratio,
            typed_only_reference_data.variant_size(),
            full_reference_data.variant_size()
        );
        if ratio < self.config.min_ratio {
            if self.config.min_ratio_behavior == MinRatioBehavior::Fail {
                return Err(RemacError::MinRatio {
                    typed: typed_only_reference_data.variant_size(),
                    imputed: full_reference_data.variant_size(),
                });
            }
            warn!(
                "skipping chunk {}:{}-{}: not enough target variants to impute it \
                 (--min-ratio, --chunk, or --region may need to be altered)",
                impute_region.chrom, impute_region.start, impute_region.end
            );
            return Ok(());
        }

        if !target_only_sites.is_empty() {
            let in_region = target_only_sites
                .iter()
                .filter(|v| impute_region.contains(v.pos as u64))
                .count();
            if self.config.all_typed_sites {
                info!("{} variants are exclusive to the target file and will be included in output", in_region);
            } else {
                info!("{} variants are exclusive to the target file and will be excluded from output", in_region);
                target_only_sites.clear();
            }
        }
        if target_sites.is_empty() {
            return Err(RemacError::alignment("no target variants overlap the reference"));
        }

        let reverse_maps = generate_reverse_maps(&typed_only_reference_data);

        let n_target_haps = target_sites[0].gt.len();
        let ploidy = n_target_haps / sample_ids.len();
        debug_assert!(ploidy >= 1 && n_target_haps % sample_ids.len() == 0);
        if writer.is_none() {
            *writer = Some(self.create_writer(&impute_region.chrom, sample_ids.to_vec(), ploidy)?);
        }

        info!("running HMM with {} threads ...", self.config.threads);
        let impute_start = Instant::now();
        let haplotype_buffer_size = self.config.temp_buffer * ploidy;
        let multi_batch = n_target_haps > haplotype_buffer_size;

        let mut hmm_results = DosageResults::default();
        hmm_results.resize(
            full_reference_data.variant_size(),
            target_sites.len(),
            haplotype_buffer_size.min(n_target_haps),
        );

        let engines: ThreadLocal<RefCell<HiddenMarkovModel>> = ThreadLocal::new();
        let mut temp_files: Vec<TempSpool> = Vec::new();
        let temp_prefix = self.config.temp_prefix_or_default();

        let mut batch_start = 0usize;
        let mut batch_idx = 0usize;
        while batch_start < n_target_haps {
            let group_size = (n_target_haps - batch_start).min(haplotype_buffer_size);
            if group_size < hmm_results.dimensions().1 {
                hmm_results.truncate_columns(group_size);
            }
            if batch_start > 0 {
                hmm_results.fill_eov();
            }

            let typed_blocks = typed_only_reference_data.blocks();
            let sites = &target_sites;
            let maps = &reverse_maps;
            let full = &full_reference_data;
            let engines_ref = &engines;
            let config = &self.config;
            hmm_results
                .columns_mut()
                .par_iter_mut()
                .enumerate()
                .for_each(|(k, column)| {
                    let hap_idx = batch_start + k;
                    if sites[0].gt[hap_idx] == GT_EOV {
                        return; // sample has fewer haplotypes
                    }
                    let engine = engines_ref.get_or(|| {
                        RefCell::new(HiddenMarkovModel::new(
                            config.prob_threshold,
                            config.prob_threshold_s1,
                            config.diff_threshold,
                            BACKGROUND_ERROR,
                            config.decay,
                        ))
                    });
                    let mut engine = engine.borrow_mut();
                    engine.traverse_forward(typed_blocks, sites, hap_idx);
                    engine.traverse_backward(typed_blocks, sites, hap_idx, maps, full, column);
                });

            if multi_batch {
                let mut spool = TempSpool::create(&temp_prefix, batch_idx)?;
                spool.write_batch(&hmm_results)?;
                temp_files.push(spool);
                info!(
                    "completed {} of {} samples",
                    (batch_start + group_size) / ploidy,
                    sample_ids.len()
                );
            }
            batch_start += group_size;
            batch_idx += 1;
        }
        info!(
            "running HMM took {:.1}s",
            impute_start.elapsed().as_secs_f64()
        );

        let writer = writer.as_mut().expect("writer created above");
        let write_start = Instant::now();
        if multi_batch {
            info!("merging {} temp files ...", temp_files.len());
            let mut rows = SpoolRows::new(temp_files)?;
            writer.write_dosages(
                &mut rows,
                &target_sites,
                &target_only_sites,
                &full_reference_data,
                impute_region,
            )?;
        } else {
            let mut rows = ResultsRows::new(&hmm_results);
            writer.write_dosages(
                &mut rows,
                &target_sites,
                &target_only_sites,
                &full_reference_data,
                impute_region,
            )?;
        }
        info!("writing output took {:.1}s", write_start.elapsed().as_secs_f64());

        Ok(())
    }
}
