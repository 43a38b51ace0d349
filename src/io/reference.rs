//! # Compressed Reference Panel I/O
//!
//! The reference panel lives on disk as a VCF-style stream of blocks: a
//! sentinel record with ALT `<BLOCK>` opens each block and carries the
//! expanded→unique map in its sample columns (one `a|b` entry per sample,
//! `.` for absent haplotype slots); each following record is one block
//! variant with `AC`, `AN`, `ERR`, `RECOM`, `CM` and the per-unique-template
//! genotype vector `UHA` in INFO.
//!
//! This module also builds the per-chunk panels (typed-only + full) aligned
//! against the target sites, compresses phased VCFs into this format
//! (`--compress-reference`), and converts legacy M3VCF files
//! (`--update-m3vcf`).

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::GenomicRegion;
use crate::data::block::{ReducedHaplotypes, UniqueHaplotypeBlock, UNIQUE_EOV};
use crate::data::genetic_map::{haldane, GeneticMapFile};
use crate::data::variant::{ReferenceSiteInfo, ReferenceVariant, TargetVariant, GT_EOV};
use crate::error::{RemacError, Result};
use crate::io::target::{open_text, read_header, split_record};

/// Sentinel ALT allele that opens a block on disk.
const BLOCK_SENTINEL: &str = "<BLOCK>";

/// Streaming reader for block-compressed reference panels.
pub struct ReferenceBlockReader {
    reader: Box<dyn BufRead>,
    sample_ids: Vec<String>,
    /// Haplotype slots per sample, fixed by the first block.
    ploidy: usize,
    pending: Option<String>,
    line_number: usize,
}

impl ReferenceBlockReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = open_text(path)?;
        let header = read_header(reader.as_mut())?;
        let sample_ids = header.sample_names().iter().map(|s| s.to_string()).collect();
        Ok(Self {
            reader,
            sample_ids,
            ploidy: 0,
            pending: None,
            line_number: 0,
        })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Haplotype slots per sample (0 until the first block was read).
    pub fn ploidy(&self) -> usize {
        self.ploidy
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Ok(Some(trimmed.to_string()));
        }
    }

    /// Read the next block, or `None` at end of input.
    pub fn next_block(&mut self) -> Result<Option<UniqueHaplotypeBlock>> {
        let Some(sentinel_line) = self.next_line()? else {
            return Ok(None);
        };
        let fields: Vec<&str> = sentinel_line.split('\t').collect();
        let record = split_record(&fields, self.line_number)?;
        if record.alt_alleles != [BLOCK_SENTINEL] {
            return Err(RemacError::record(
                self.line_number,
                format!("expected {} sentinel record, found {}", BLOCK_SENTINEL, fields[4]),
            ));
        }
        if record.samples.len() != self.sample_ids.len() {
            return Err(RemacError::record(
                self.line_number,
                "sentinel record sample count does not match header",
            ));
        }

        // Expanded → unique map from the sentinel's sample columns.
        let mut per_sample: Vec<Vec<i32>> = Vec::with_capacity(record.samples.len());
        for column in record.samples {
            let mut entries = Vec::new();
            for part in column.split(['|', '/']) {
                if part == "." || part.is_empty() {
                    entries.push(UNIQUE_EOV);
                } else {
                    entries.push(part.parse().map_err(|_| {
                        RemacError::record(self.line_number, format!("bad unique index '{}'", part))
                    })?);
                }
            }
            per_sample.push(entries);
        }
        let block_ploidy = per_sample.iter().map(|e| e.len()).max().unwrap_or(0);
        if self.ploidy == 0 {
            self.ploidy = block_ploidy;
        } else if block_ploidy > self.ploidy {
            return Err(RemacError::record(
                self.line_number,
                "reference block ploidy exceeds earlier blocks",
            ));
        }
        let mut unique_map = Vec::with_capacity(per_sample.len() * self.ploidy);
        for entries in &per_sample {
            for k in 0..self.ploidy {
                unique_map.push(entries.get(k).copied().unwrap_or(UNIQUE_EOV));
            }
        }

        // Variant records until the next sentinel (pushed back) or EOF.
        let chrom: Arc<str> = Arc::from(record.chrom);
        let mut variants: Vec<ReferenceVariant> = Vec::new();
        while let Some(line) = self.next_line()? {
            if line.split('\t').nth(4) == Some(BLOCK_SENTINEL) {
                self.pending = Some(line);
                break;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let record = split_record(&fields, self.line_number)?;
            if record.alt_alleles.len() != 1 {
                return Err(RemacError::record(
                    self.line_number,
                    "reference block variants must be biallelic",
                ));
            }

            let mut site = ReferenceSiteInfo::new(
                chrom.clone(),
                record.pos,
                record.id.to_string(),
                record.ref_allele.to_string(),
                record.alt_alleles[0].to_string(),
            );
            let mut gt: Vec<i8> = Vec::new();
            for entry in record.info.split(';') {
                let Some((key, value)) = entry.split_once('=') else {
                    continue;
                };
                match key {
                    "ERR" => site.err = value.parse().unwrap_or(f32::NAN),
                    "RECOM" => site.recom = value.parse().unwrap_or(f32::NAN),
                    "CM" => site.cm = value.parse().unwrap_or(f64::NAN),
                    "UHA" => {
                        gt = value
                            .bytes()
                            .map(|b| match b {
                                b'0' => Ok(0i8),
                                b'1' => Ok(1i8),
                                _ => Err(RemacError::record(
                                    self.line_number,
                                    "UHA must be a string of 0/1",
                                )),
                            })
                            .collect::<Result<_>>()?;
                    }
                    _ => {}
                }
            }
            if gt.is_empty() {
                return Err(RemacError::record(self.line_number, "missing UHA field"));
            }
            variants.push(ReferenceVariant::new(site, 0, gt));
        }

        if variants.is_empty() {
            return Err(RemacError::record(self.line_number, "empty reference block"));
        }
        Ok(Some(UniqueHaplotypeBlock::from_parts(unique_map, variants)))
    }
}

/// Determine the chromosome and maximum position of a reference panel.
pub fn stat_ref_panel(ref_file_path: &Path) -> Result<(String, u64)> {
    let mut reader = open_text(ref_file_path)?;
    let _ = read_header(reader.as_mut())?;
    let mut chrom: Option<String> = None;
    let mut max_pos = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut cols = trimmed.split('\t');
        let (Some(c), Some(p)) = (cols.next(), cols.next()) else {
            continue;
        };
        match &chrom {
            None => chrom = Some(c.to_string()),
            Some(existing) if existing != c => {
                return Err(RemacError::alignment(
                    "reference panel contains multiple chromosomes; use --region",
                ));
            }
            _ => {}
        }
        if let Ok(pos) = p.parse::<u64>() {
            max_pos = max_pos.max(pos);
        }
    }
    let chrom = chrom
        .ok_or_else(|| RemacError::panel("reference panel contains no variants"))?;
    Ok((chrom, max_pos))
}

/// Load the reference for one chunk: build the typed-only panel over the
/// extended region and the full panel over the impute region, and update
/// the aligned target sites with allele frequency, error, and centimorgan
/// annotations.
#[allow(clippy::too_many_arguments)]
pub fn load_reference_haplotypes(
    file_path: &Path,
    extended_reg: &GenomicRegion,
    impute_reg: &GenomicRegion,
    subset_ids: &HashSet<String>,
    target_sites: &mut [TargetVariant],
    typed_only_reference_data: &mut ReducedHaplotypes,
    full_reference_data: &mut ReducedHaplotypes,
    map_file: &mut Option<GeneticMapFile>,
    min_recom: f32,
    default_match_error: f32,
) -> Result<()> {
    let mut reader = ReferenceBlockReader::open(file_path)?;

    // Resolve the sample subset to haplotype slot indices lazily (the slot
    // width is only known after the first block).
    let subset_samples: Option<Vec<usize>> = if subset_ids.is_empty() {
        None
    } else {
        let keep: Vec<usize> = reader
            .sample_ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| subset_ids.contains(id.as_str()))
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(RemacError::alignment(
                "none of the requested --sample-ids exist in the reference panel",
            ));
        }
        info!(
            "subsetting reference to {} of {} samples",
            keep.len(),
            reader.sample_ids().len()
        );
        Some(keep)
    };

    let mut tar_idx = 0usize;
    let mut running_cm = 0.0f64;
    let mut expanded: Vec<i8> = Vec::new();

    while let Some(mut block) = reader.next_block()? {
        if block.variants()[0].site.chrom.as_ref() != extended_reg.chrom {
            continue;
        }

        if let Some(keep_samples) = &subset_samples {
            let ploidy = reader.ploidy();
            let slots: Vec<usize> = keep_samples
                .iter()
                .flat_map(|&s| (s * ploidy..(s + 1) * ploidy))
                .collect();
            block.subset_haplotypes(&slots);
        }

        // Centimorgan positions come from the genetic map when present,
        // else from the panel's own annotations. The accumulator runs over
        // untrimmed variants so trimming cannot shift the scale.
        match map_file {
            Some(map) => block.fill_cm(map),
            None => block.fill_cm_from_recom(&mut running_cm),
        }

        let last_pos = block.variants().last().map(|v| v.site.pos).unwrap_or(0);
        let first_pos = block.variants().first().map(|v| v.site.pos).unwrap_or(0);
        if (last_pos as u64) < extended_reg.start || first_pos as u64 > extended_reg.end {
            continue;
        }
        block.trim(
            extended_reg.start.min(u32::MAX as u64) as u32,
            extended_reg.end.min(u32::MAX as u64) as u32,
        );
        if block.is_empty() {
            continue;
        }

        let an = block.total_cardinality();
        for v in block.variants() {
            while tar_idx < target_sites.len() && target_sites[tar_idx].pos < v.site.pos {
                tar_idx += 1;
            }
            let mut j = tar_idx;
            while j < target_sites.len() && target_sites[j].pos == v.site.pos {
                if target_sites[j].same_site(&v.site) && !target_sites[j].in_ref {
                    let tv = &mut target_sites[j];
                    tv.in_ref = true;
                    tv.af = if an > 0 { v.ac as f32 / an as f32 } else { 0.0 };
                    tv.err = if v.site.err.is_nan() {
                        default_match_error
                    } else {
                        v.site.err
                    };
                    tv.cm = v.site.cm;

                    expanded.clear();
                    expanded.extend(block.unique_map().iter().map(|&u| {
                        if u < 0 {
                            GT_EOV
                        } else {
                            v.gt[u as usize]
                        }
                    }));
                    if !typed_only_reference_data.compress_variant(&v.site, &expanded, false) {
                        return Err(RemacError::panel(format!(
                            "inconsistent haplotype count at {}:{}",
                            v.site.chrom, v.site.pos
                        )));
                    }
                }
                j += 1;
            }
        }

        let mut full_block = block;
        full_block.trim(
            impute_reg.start.min(u32::MAX as u64) as u32,
            impute_reg.end.min(u32::MAX as u64) as u32,
        );
        if !full_block.is_empty() {
            full_reference_data.append_block(full_block);
        }
    }

    assign_typed_hmm_params(target_sites, min_recom)?;
    Ok(())
}

/// Assign the recombination chain over the typed (in-reference) sites from
/// their centimorgan positions; the last typed site gets 0.
fn assign_typed_hmm_params(target_sites: &mut [TargetVariant], min_recom: f32) -> Result<()> {
    let typed: Vec<usize> = (0..target_sites.len())
        .filter(|&i| target_sites[i].in_ref)
        .collect();
    if typed.is_empty() {
        return Ok(());
    }
    for window in typed.windows(2) {
        let (cur, next) = (window[0], window[1]);
        let (cm_cur, cm_next) = (target_sites[cur].cm, target_sites[next].cm);
        if cm_cur.is_nan() || cm_next.is_nan() {
            return Err(RemacError::panel(
                "reference panel carries neither CM annotations nor RECOM rates; \
                 a genetic map (--map) is required",
            ));
        }
        let delta = (cm_next - cm_cur).max(0.0);
        target_sites[cur].recom = (haldane(delta) as f32).max(min_recom);
    }
    target_sites[*typed.last().expect("nonempty")].recom = 0.0;
    Ok(())
}

/// Build the per-block reverse maps: `reverse_maps[b][u]` lists the
/// expanded haplotype indices mapping to unique template `u` of block `b`.
pub fn generate_reverse_maps(panel: &ReducedHaplotypes) -> Vec<Vec<Vec<u32>>> {
    panel
        .blocks()
        .iter()
        .map(|block| {
            let mut maps = vec![Vec::new(); block.unique_haplotype_size()];
            for (h, &u) in block.unique_map().iter().enumerate() {
                if u >= 0 {
                    maps[u as usize].push(h as u32);
                }
            }
            debug_assert_eq!(
                maps.iter().map(|m| m.len() as u64).sum::<u64>(),
                block.total_cardinality()
            );
            maps
        })
        .collect()
}

/// Serialize a compressed panel in the on-disk block format.
pub fn write_reference_panel(
    output_path: &Path,
    panel: &ReducedHaplotypes,
    sample_ids: &[String],
    ploidy: usize,
) -> Result<()> {
    let file = File::create(output_path)?;
    let compressed = output_path
        .extension()
        .map(|e| e == "gz" || e == "bgz" || e == "msav")
        .unwrap_or(false);
    let mut writer: Box<dyn Write> = if compressed {
        Box::new(BufWriter::new(noodles::bgzf::Writer::new(file)))
    } else {
        Box::new(BufWriter::new(file))
    };

    let chrom = panel
        .blocks()
        .first()
        .and_then(|b| b.variants().first())
        .map(|v| v.site.chrom.to_string())
        .unwrap_or_default();

    writeln!(writer, "##fileformat=VCFv4.2")?;
    writeln!(writer, "##phasing=full")?;
    if !chrom.is_empty() {
        writeln!(writer, "##contig=<ID={}>", chrom)?;
    }
    writeln!(
        writer,
        "##INFO=<ID=VARIANTS,Number=1,Type=Integer,Description=\"Number of variants in block\">"
    )?;
    writeln!(
        writer,
        "##INFO=<ID=REPS,Number=1,Type=Integer,Description=\"Number of unique haplotype templates in block\">"
    )?;
    writeln!(writer, "##INFO=<ID=AC,Number=1,Type=Integer,Description=\"Alternate allele count\">")?;
    writeln!(writer, "##INFO=<ID=AN,Number=1,Type=Integer,Description=\"Total allele number\">")?;
    writeln!(writer, "##INFO=<ID=ERR,Number=1,Type=Float,Description=\"Error parameter\">")?;
    writeln!(
        writer,
        "##INFO=<ID=RECOM,Number=1,Type=Float,Description=\"Recombination probability to next site\">"
    )?;
    writeln!(writer, "##INFO=<ID=CM,Number=1,Type=Float,Description=\"Centimorgan position\">")?;
    writeln!(
        writer,
        "##INFO=<ID=UHA,Number=1,Type=String,Description=\"Per-unique-template alleles\">"
    )?;
    writeln!(
        writer,
        "##FORMAT=<ID=UHM,Number=.,Type=String,Description=\"Expanded to unique haplotype mapping\">"
    )?;
    write!(writer, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT")?;
    for id in sample_ids {
        write!(writer, "\t{}", id)?;
    }
    writeln!(writer)?;

    let mut line = String::new();
    for block in panel.blocks() {
        let first = &block.variants()[0];
        line.clear();
        line.push_str(&format!(
            "{}\t{}\t.\t{}\t{}\t.\tPASS\tVARIANTS={};REPS={}\tUHM",
            first.site.chrom,
            first.site.pos,
            first.site.ref_allele,
            BLOCK_SENTINEL,
            block.variant_size(),
            block.unique_haplotype_size(),
        ));
        let map = block.unique_map();
        debug_assert_eq!(map.len(), sample_ids.len() * ploidy);
        for s in 0..sample_ids.len() {
            line.push('\t');
            for k in 0..ploidy {
                if k > 0 {
                    line.push('|');
                }
                let u = map[s * ploidy + k];
                if u < 0 {
                    line.push('.');
                } else {
                    line.push_str(&u.to_string());
                }
            }
        }
        writeln!(writer, "{}", line)?;

        for v in block.variants() {
            line.clear();
            line.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t.\tPASS\tAC={};AN={}",
                v.site.chrom,
                v.site.pos,
                if v.site.id.is_empty() { "." } else { &v.site.id },
                v.site.ref_allele,
                v.site.alt_allele,
                v.ac,
                block.total_cardinality(),
            ));
            if v.site.err.is_finite() {
                line.push_str(&format!(";ERR={}", v.site.err));
            }
            if v.site.recom.is_finite() {
                line.push_str(&format!(";RECOM={}", v.site.recom));
            }
            if v.site.cm.is_finite() {
                line.push_str(&format!(";CM={}", v.site.cm));
            }
            line.push_str(";UHA=");
            for &g in &v.gt {
                line.push(if g == 1 { '1' } else { '0' });
            }
            writeln!(writer, "{}", line)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Compress a phased reference VCF into haplotype blocks
/// (`--compress-reference`).
///
/// A new block opens whenever the running block hits `max_block_size` or
/// the compression-ratio slope turns unfavorable: every `slope_unit`
/// variants the tail block's ratio is compared against its previous
/// checkpoint, and the block is flushed once adding variants stops
/// improving it (respecting `min_block_size`).
pub fn compress_reference_panel(
    input_path: &Path,
    output_path: &Path,
    min_block_size: usize,
    max_block_size: usize,
    slope_unit: usize,
    map_file_path: Option<&Path>,
) -> Result<()> {
    let mut reader = open_text(input_path)?;
    let header = read_header(reader.as_mut())?;
    let sample_ids: Vec<String> = header.sample_names().iter().map(|s| s.to_string()).collect();
    if sample_ids.is_empty() {
        return Err(RemacError::panel("reference input declares no samples"));
    }

    let mut panel = ReducedHaplotypes::new(min_block_size, max_block_size);
    let mut ploidy = 0usize;
    let mut chrom_seen: Option<String> = None;
    let mut checkpoint_ratio = f32::MAX;
    let mut since_checkpoint = 0usize;

    let mut line = String::new();
    let mut line_number = 0usize;
    let mut alleles: Vec<i8> = Vec::new();
    let mut split: Vec<i8> = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_number += 1;
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        let record = split_record(&fields, line_number)?;
        match &chrom_seen {
            None => chrom_seen = Some(record.chrom.to_string()),
            Some(c) if c != record.chrom => {
                return Err(RemacError::alignment(
                    "reference input spans multiple chromosomes; compress one at a time",
                ));
            }
            _ => {}
        }

        // Phased haplotype alleles across all samples.
        alleles.clear();
        for column in record.samples {
            let gt = column.split(':').next().unwrap_or(".");
            if gt.contains('/') {
                return Err(RemacError::panel(format!(
                    "unphased genotype at {}:{}; the reference must be fully phased",
                    record.chrom, record.pos
                )));
            }
            for allele in gt.split('|') {
                if allele == "." || allele.is_empty() {
                    alleles.push(GT_EOV);
                } else {
                    alleles.push(allele.parse().map_err(|_| {
                        RemacError::record(line_number, format!("bad GT allele '{}'", allele))
                    })?);
                }
            }
        }
        if ploidy == 0 {
            ploidy = alleles.len().div_ceil(sample_ids.len());
        }
        if alleles.len() != sample_ids.len() * ploidy {
            return Err(RemacError::panel(format!(
                "sample ploidy changed at {}:{}",
                record.chrom, record.pos
            )));
        }

        let chrom: Arc<str> = Arc::from(record.chrom);
        for (alt_idx, alt) in record.alt_alleles.iter().enumerate() {
            if *alt == "." || alt.is_empty() {
                continue;
            }
            let alt_code = (alt_idx + 1) as i8;
            split.clear();
            split.extend(alleles.iter().map(|&a| {
                if a == GT_EOV {
                    GT_EOV
                } else if a == alt_code {
                    1
                } else {
                    0
                }
            }));

            let site = ReferenceSiteInfo::new(
                chrom.clone(),
                record.pos,
                record.id.to_string(),
                record.ref_allele.to_string(),
                alt.to_string(),
            );
            if !panel.compress_variant(&site, &split, false) {
                return Err(RemacError::panel(format!(
                    "haplotype count changed at {}:{}",
                    record.chrom, record.pos
                )));
            }

            // Ratio-slope flush heuristic over the tail block.
            since_checkpoint += 1;
            let tail = panel.blocks().last().expect("tail block");
            if tail.variant_size() <= 1 {
                checkpoint_ratio = f32::MAX;
                since_checkpoint = 1;
            }
            if since_checkpoint >= slope_unit {
                let e = tail.expanded_haplotype_size() as f32;
                let ratio = (e + (tail.unique_haplotype_size() * tail.variant_size()) as f32)
                    / (e * tail.variant_size() as f32);
                if ratio > checkpoint_ratio && tail.variant_size() >= min_block_size {
                    panel.flush_block();
                }
                checkpoint_ratio = ratio;
                since_checkpoint = 0;
            }
        }
    }

    if panel.variant_size() == 0 {
        return Err(RemacError::panel("reference input contains no variants"));
    }

    if let Some(map_path) = map_file_path {
        let chrom = chrom_seen.clone().unwrap_or_default();
        let mut map = GeneticMapFile::new(map_path, &chrom)?;
        panel.fill_cm(&mut map);
    }

    info!(
        "compressed {} variants into {} blocks (ratio {:.4})",
        panel.variant_size(),
        panel.blocks().len(),
        panel.compression_ratio()
    );
    write_reference_panel(output_path, &panel, &sample_ids, ploidy)
}

/// Convert a legacy M3VCF (v1) reference panel to the block format
/// (`--update-m3vcf`).
pub fn convert_old_m3vcf(
    input_path: &Path,
    output_path: &Path,
    map_file_path: Option<&Path>,
) -> Result<()> {
    let mut reader = open_text(input_path)?;

    // M3VCF headers are hash-prefixed like VCF; only the column line
    // matters here.
    let mut sample_ids: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut line_number = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(RemacError::panel("M3VCF input has no records"));
        }
        line_number += 1;
        let trimmed = line.trim_end();
        if trimmed.starts_with("#CHROM") {
            sample_ids = trimmed.split('\t').skip(9).map(|s| s.to_string()).collect();
            break;
        }
        if !trimmed.starts_with('#') {
            return Err(RemacError::record(line_number, "missing #CHROM header line"));
        }
    }
    if sample_ids.is_empty() {
        return Err(RemacError::panel("M3VCF input declares no samples"));
    }

    let mut panel = ReducedHaplotypes::default();
    let mut ploidy = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_number += 1;
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // Block header: INFO carries VARIANTS=<n>;REPS=<m>, genotype
        // columns carry the expanded→unique map.
        let fields: Vec<&str> = trimmed.split('\t').collect();
        let record = split_record(&fields, line_number)?;
        let mut n_variants = 0usize;
        let mut n_reps = 0usize;
        for entry in record.info.split(';') {
            if let Some((key, value)) = entry.split_once('=') {
                match key {
                    "VARIANTS" => n_variants = value.parse().unwrap_or(0),
                    "REPS" => n_reps = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
        if n_variants == 0 || n_reps == 0 {
            return Err(RemacError::record(
                line_number,
                "expected an M3VCF block header with VARIANTS= and REPS=",
            ));
        }

        let mut per_sample: Vec<Vec<i32>> = Vec::with_capacity(record.samples.len());
        for column in record.samples {
            let mut entries = Vec::new();
            for part in column.split('|') {
                if part == "." || part.is_empty() {
                    entries.push(UNIQUE_EOV);
                } else {
                    entries.push(part.parse().map_err(|_| {
                        RemacError::record(line_number, format!("bad haplotype index '{}'", part))
                    })?);
                }
            }
            per_sample.push(entries);
        }
        let block_ploidy = per_sample.iter().map(|e| e.len()).max().unwrap_or(1);
        if ploidy == 0 {
            ploidy = block_ploidy;
        }
        let mut unique_map = Vec::with_capacity(per_sample.len() * ploidy);
        for entries in &per_sample {
            for k in 0..ploidy {
                unique_map.push(entries.get(k).copied().unwrap_or(UNIQUE_EOV));
            }
        }

        let chrom: Arc<str> = Arc::from(record.chrom);
        let mut variants = Vec::with_capacity(n_variants);
        for _ in 0..n_variants {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(RemacError::record(line_number, "truncated M3VCF block"));
            }
            line_number += 1;
            let trimmed = line.trim_end();
            let fields: Vec<&str> = trimmed.split('\t').collect();
            if fields.len() < 9 {
                return Err(RemacError::record(line_number, "short M3VCF variant line"));
            }
            let record = split_record(&fields, line_number)?;
            let mut site = ReferenceSiteInfo::new(
                chrom.clone(),
                record.pos,
                record.id.to_string(),
                record.ref_allele.to_string(),
                record.alt_alleles[0].to_string(),
            );
            for entry in record.info.split(';') {
                if let Some((key, value)) = entry.split_once('=') {
                    match key {
                        "Err" | "ERR" => site.err = value.parse().unwrap_or(f32::NAN),
                        "Recom" | "RECOM" => site.recom = value.parse().unwrap_or(f32::NAN),
                        _ => {}
                    }
                }
            }
            let gt_text = fields[8];
            let mut gt = Vec::with_capacity(n_reps);
            for b in gt_text.bytes() {
                match b {
                    b'0' => gt.push(0i8),
                    b'1' => gt.push(1i8),
                    _ => {
                        return Err(RemacError::record(
                            line_number,
                            "only M3VCF v1 genotype strings are supported; \
                             re-export v2 files with the original tooling first",
                        ))
                    }
                }
            }
            if gt.len() != n_reps {
                return Err(RemacError::record(
                    line_number,
                    format!("expected {} template alleles, found {}", n_reps, gt.len()),
                ));
            }
            variants.push(ReferenceVariant::new(site, 0, gt));
        }

        panel.append_block(UniqueHaplotypeBlock::from_parts(unique_map, variants));
    }

    if panel.variant_size() == 0 {
        return Err(RemacError::panel("M3VCF input contains no blocks"));
    }

    if let Some(map_path) = map_file_path {
        let chrom = panel
            .blocks()
            .first()
            .and_then(|b| b.variants().first())
            .map(|v| v.site.chrom.to_string())
            .unwrap_or_default();
        let mut map = GeneticMapFile::new(map_path, &chrom)?;
        panel.fill_cm(&mut map);
    } else {
        panel.fill_cm_from_recom();
    }

    warn!(
        "converted {} variants in {} blocks from legacy M3VCF",
        panel.variant_size(),
        panel.blocks().len()
    );
    write_reference_panel(output_path, &panel, &sample_ids, ploidy.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("remac_reference_tests");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn write_file(name: &str, body: &str) -> std::path::PathBuf {
        let path = temp_path(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const REF_VCF: &str = "##fileformat=VCFv4.2\n##phasing=full\n##contig=<ID=chr1>\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tR1\tR2\n\
chr1\t100\t.\tA\tC\t.\tPASS\t.\tGT\t0|0\t1|1\n\
chr1\t200\t.\tA\tG\t.\tPASS\t.\tGT\t0|0\t1|1\n\
chr1\t300\t.\tA\tT\t.\tPASS\t.\tGT\t0|1\t1|0\n";

    #[test]
    fn test_compress_then_read_roundtrip() {
        let input = write_file("roundtrip_in.vcf", REF_VCF);
        let output = temp_path("roundtrip_out.vcf");
        compress_reference_panel(&input, &output, 1, 100, 10, None).unwrap();

        let mut reader = ReferenceBlockReader::open(&output).unwrap();
        assert_eq!(reader.sample_ids(), &["R1", "R2"]);
        let block = reader.next_block().unwrap().unwrap();
        assert_eq!(reader.ploidy(), 2);
        assert_eq!(block.expanded_haplotype_size(), 4);
        assert_eq!(block.variant_size(), 3);
        // Haplotypes 0,1 carry ref at the first two sites, 2,3 carry alt;
        // site 3 splits them into four templates.
        assert_eq!(block.variants()[0].ac, 2);
        assert_eq!(block.variants()[2].ac, 2);
        assert_eq!(block.unique_haplotype_size(), 4);
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn test_unphased_reference_rejected() {
        let body = REF_VCF.replace("0|1", "0/1");
        let input = write_file("unphased.vcf", &body);
        let output = temp_path("unphased_out.vcf");
        let err = compress_reference_panel(&input, &output, 1, 100, 10, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_stat_ref_panel() {
        let input = write_file("stat_in.vcf", REF_VCF);
        let output = temp_path("stat_out.vcf");
        compress_reference_panel(&input, &output, 1, 100, 10, None).unwrap();
        let (chrom, max_pos) = stat_ref_panel(&output).unwrap();
        assert_eq!(chrom, "chr1");
        assert_eq!(max_pos, 300);
    }

    #[test]
    fn test_load_reference_aligns_target_sites() {
        let input = write_file("align_in.vcf", REF_VCF);
        let output = temp_path("align_out.vcf");
        compress_reference_panel(&input, &output, 1, 100, 10, None).unwrap();

        let chrom: Arc<str> = Arc::from("chr1");
        let mut target_sites = vec![
            TargetVariant {
                chrom: chrom.clone(),
                pos: 200,
                id: ".".into(),
                ref_allele: "A".into(),
                alt_allele: "G".into(),
                in_tar: true,
                in_ref: false,
                af: f32::NAN,
                err: f32::NAN,
                recom: f32::NAN,
                cm: f64::NAN,
                gt: vec![1, 1],
            },
            TargetVariant {
                chrom: chrom.clone(),
                pos: 250,
                id: ".".into(),
                ref_allele: "A".into(),
                alt_allele: "C".into(),
                in_tar: true,
                in_ref: false,
                af: f32::NAN,
                err: f32::NAN,
                recom: f32::NAN,
                cm: f64::NAN,
                gt: vec![0, 0],
            },
            TargetVariant {
                chrom,
                pos: 300,
                id: ".".into(),
                ref_allele: "A".into(),
                alt_allele: "T".into(),
                in_tar: true,
                in_ref: false,
                af: f32::NAN,
                err: f32::NAN,
                recom: f32::NAN,
                cm: f64::NAN,
                gt: vec![0, 1],
            },
        ];

        let region = GenomicRegion::new("chr1", 1, 1000);
        let mut typed = ReducedHaplotypes::new(16, 512);
        let mut full = ReducedHaplotypes::default();
        // No CM/RECOM annotations in the compressed panel: provide a map.
        let map_path = write_file(
            "align_map.txt",
            "#chrom\tpos\tcM\nchr1\t100\t0.0\nchr1\t300\t0.2\n",
        );
        let mut map = Some(GeneticMapFile::new(&map_path, "chr1").unwrap());

        load_reference_haplotypes(
            &output,
            &region,
            &region,
            &HashSet::new(),
            &mut target_sites,
            &mut typed,
            &mut full,
            &mut map,
            1e-5,
            0.01,
        )
        .unwrap();

        assert!(target_sites[0].in_ref);
        assert!(!target_sites[1].in_ref, "site absent from reference");
        assert!(target_sites[2].in_ref);
        assert_eq!(typed.variant_size(), 2);
        assert_eq!(full.variant_size(), 3);
        assert!((target_sites[0].af - 0.5).abs() < 1e-6);
        // Recombination chain: positive at the first typed site, zero at
        // the last.
        assert!(target_sites[0].recom > 0.0);
        assert_eq!(target_sites[2].recom, 0.0);
    }

    #[test]
    fn test_subset_requires_overlap() {
        let input = write_file("subset_in.vcf", REF_VCF);
        let output = temp_path("subset_out.vcf");
        compress_reference_panel(&input, &output, 1, 100, 10, None).unwrap();

        let region = GenomicRegion::new("chr1", 1, 1000);
        let mut typed = ReducedHaplotypes::new(16, 512);
        let mut full = ReducedHaplotypes::default();
        let mut subset = HashSet::new();
        subset.insert("NOPE".to_string());
        let err = load_reference_haplotypes(
            &output,
            &region,
            &region,
            &subset,
            &mut [],
            &mut typed,
            &mut full,
            &mut None,
            1e-5,
            0.01,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_convert_m3vcf_v1() {
        let m3vcf = "##fileformat=M3VCF\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n\
chr2\t100\t.\tA\t<BLOCK>\t.\tPASS\tVARIANTS=2;REPS=2\t.\t0|1\t1|0\n\
chr2\t100\trs1\tA\tC\t.\tPASS\tRecom=0.001\t01\n\
chr2\t180\trs2\tG\tT\t.\tPASS\t.\t10\n";
        let input = write_file("legacy.m3vcf", m3vcf);
        let output = temp_path("legacy_out.vcf");
        convert_old_m3vcf(&input, &output, None).unwrap();

        let mut reader = ReferenceBlockReader::open(&output).unwrap();
        let block = reader.next_block().unwrap().unwrap();
        assert_eq!(block.variant_size(), 2);
        assert_eq!(block.unique_map(), &[0, 1, 1, 0]);
        assert_eq!(block.variants()[0].ac, 2);
        assert!(reader.next_block().unwrap().is_none());
    }
}
