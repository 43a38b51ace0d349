//! # Target Panel Reading
//!
//! Streams a VCF/VCF.gz target panel into [`TargetVariant`] rows. Header
//! parsing goes through `noodles`; record bodies are tab-split by hand.
//!
//! Multi-allelic sites are split into one row per ALT allele, with the
//! genotype vector recoded to presence/absence of that allele. Per-sample
//! ploidy must be stable across the file; a change is a fatal error.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use noodles::vcf::Header;

use crate::config::GenomicRegion;
use crate::data::variant::{TargetVariant, GT_EOV, GT_MISSING};
use crate::error::{RemacError, Result};

/// Open a plain or bgzf-compressed text file for buffered reading.
pub(crate) fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| RemacError::open(path, e))?;
    let is_gzipped = path
        .extension()
        .map(|e| e == "gz" || e == "bgz" || e == "msav")
        .unwrap_or(false);
    let inner: Box<dyn Read> = if is_gzipped {
        Box::new(noodles::bgzf::Reader::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(inner)))
}

/// Read VCF header lines off `reader` and return the parsed header.
/// Leaves the reader positioned at the first record line.
pub(crate) fn read_header(reader: &mut dyn BufRead) -> Result<Header> {
    let mut header_text = String::new();
    let mut line_number = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_number += 1;
        if !line.starts_with('#') {
            return Err(RemacError::record(
                line_number,
                "record line before #CHROM header",
            ));
        }
        let is_chrom_line = line.starts_with("#CHROM");
        header_text.push_str(&line);
        if is_chrom_line {
            break;
        }
    }
    header_text
        .parse::<Header>()
        .map_err(|e| RemacError::record(line_number, format!("bad VCF header: {}", e)))
}

/// One biallelic-or-split record as it appears on disk.
pub(crate) struct RawRecord<'a> {
    pub chrom: &'a str,
    pub pos: u32,
    pub id: &'a str,
    pub ref_allele: &'a str,
    pub alt_alleles: Vec<&'a str>,
    pub info: &'a str,
    /// FORMAT + sample columns, untouched.
    pub samples: &'a [&'a str],
}

/// Split one record line into fields (at least 8 columns).
pub(crate) fn split_record<'a>(
    fields: &'a [&'a str],
    line_number: usize,
) -> Result<RawRecord<'a>> {
    if fields.len() < 8 {
        return Err(RemacError::record(line_number, "record has fewer than 8 columns"));
    }
    let pos: u32 = fields[1]
        .parse()
        .map_err(|_| RemacError::record(line_number, "bad POS column"))?;
    Ok(RawRecord {
        chrom: fields[0],
        pos,
        id: fields[2],
        ref_allele: fields[3],
        alt_alleles: fields[4].split(',').collect(),
        info: fields[7],
        samples: if fields.len() > 9 { &fields[9..] } else { &[] },
    })
}

/// Extract sample IDs from a target panel file.
pub fn stat_tar_panel(tar_file_path: &Path) -> Result<Vec<String>> {
    let mut reader = open_text(tar_file_path)?;
    let header = read_header(reader.as_mut())?;
    Ok(header.sample_names().iter().map(|s| s.to_string()).collect())
}

/// Parse one sample's GT column into allele codes, appending into `out`.
/// Returns the sample's ploidy.
fn parse_gt(column: &str, out: &mut Vec<i8>, line_number: usize) -> Result<usize> {
    // GT is the first colon-separated field.
    let gt = column.split(':').next().unwrap_or(".");
    let mut ploidy = 0;
    for allele in gt.split(['|', '/']) {
        ploidy += 1;
        if allele == "." || allele.is_empty() {
            out.push(GT_MISSING);
        } else {
            let code: i8 = allele
                .parse()
                .map_err(|_| RemacError::record(line_number, format!("bad GT allele '{}'", allele)))?;
            out.push(code);
        }
    }
    Ok(ploidy)
}

/// Load target haplotypes for a genomic region.
///
/// Returns the per-site rows (one per ALT allele) and the sample IDs. Every
/// sample occupies `max_ploidy` haplotype slots; samples with lower ploidy
/// carry the end-of-vector sentinel in their trailing slots.
pub fn load_target_haplotypes(
    file_path: &Path,
    region: &GenomicRegion,
) -> Result<(Vec<TargetVariant>, Vec<String>)> {
    let mut reader = open_text(file_path)?;
    let header = read_header(reader.as_mut())?;
    let sample_ids: Vec<String> = header.sample_names().iter().map(|s| s.to_string()).collect();
    if sample_ids.is_empty() {
        return Err(RemacError::panel("target file declares no samples"));
    }

    let mut target_sites: Vec<TargetVariant> = Vec::new();
    let mut ploidies: Option<Vec<usize>> = None;
    let mut max_ploidy = 0usize;
    let mut chrom_cache: Option<Arc<str>> = None;

    let mut line = String::new();
    let mut line_number = 0usize;
    let mut alleles: Vec<i8> = Vec::new();
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

        if record.chrom != region.chrom {
            continue;
        }
        if !region.contains(record.pos as u64) {
            continue;
        }
        if record.samples.len() != sample_ids.len() {
            return Err(RemacError::record(
                line_number,
                format!(
                    "expected {} sample columns, found {}",
                    sample_ids.len(),
                    record.samples.len()
                ),
            ));
        }

        // Parse genotypes and enforce stable per-sample ploidy.
        alleles.clear();
        let mut site_ploidies = Vec::with_capacity(sample_ids.len());
        for column in record.samples {
            site_ploidies.push(parse_gt(column, &mut alleles, line_number)?);
        }
        if let Some(expected) = &ploidies {
            if expected != &site_ploidies {
                return Err(RemacError::panel(format!(
                    "sample ploidy changed at {}:{}",
                    record.chrom, record.pos
                )));
            }
        } else {
            max_ploidy = site_ploidies.iter().copied().max().unwrap_or(0);
            if region.chrom == "X" || region.chrom == "chrX" {
                tracing::warn!(
                    "chromosome X detected; PAR and non-PAR regions should be imputed separately"
                );
            }
            ploidies = Some(site_ploidies.clone());
        }

        let chrom: Arc<str> = match &chrom_cache {
            Some(c) if c.as_ref() == record.chrom => c.clone(),
            _ => {
                let c: Arc<str> = Arc::from(record.chrom);
                chrom_cache = Some(c.clone());
                c
            }
        };

        // One row per ALT allele, recoded to presence of that allele and
        // padded to max_ploidy slots.
        for (alt_idx, alt) in record.alt_alleles.iter().enumerate() {
            if *alt == "." || alt.is_empty() {
                continue;
            }
            let alt_code = (alt_idx + 1) as i8;
            let mut gt = Vec::with_capacity(sample_ids.len() * max_ploidy);
            let mut cursor = 0usize;
            for &ploidy in site_ploidies.iter() {
                for k in 0..max_ploidy {
                    if k < ploidy {
                        let a = alleles[cursor + k];
                        gt.push(if a == GT_MISSING {
                            GT_MISSING
                        } else if a == alt_code {
                            1
                        } else {
                            0
                        });
                    } else {
                        gt.push(GT_EOV);
                    }
                }
                cursor += ploidy;
            }

            target_sites.push(TargetVariant {
                chrom: chrom.clone(),
                pos: record.pos,
                id: record.id.to_string(),
                ref_allele: record.ref_allele.to_string(),
                alt_allele: alt.to_string(),
                in_tar: true,
                in_ref: false,
                af: f32::NAN,
                err: f32::NAN,
                recom: f32::NAN,
                cm: f64::NAN,
                gt,
            });
        }
    }

    Ok((target_sites, sample_ids))
}

/// Move the target-only sites (absent from the reference) out of
/// `target_sites`, preserving order in both partitions.
pub fn separate_target_only_variants(target_sites: &mut Vec<TargetVariant>) -> Vec<TargetVariant> {
    let mut target_only = Vec::new();
    let mut keep = Vec::with_capacity(target_sites.len());
    for site in target_sites.drain(..) {
        if site.in_ref {
            keep.push(site);
        } else {
            target_only.push(site);
        }
    }
    *target_sites = keep;
    target_only
}
