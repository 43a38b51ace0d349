//! # Dosage Output
//!
//! Writes imputed records as VCF (plain or bgzf): per reference variant one
//! record carrying any subset of `GT,DS,HDS,GP,SD` FORMAT fields, with
//! `AF`, `MAF`, `R2` (and `ER2` plus `TYPED` at typed sites, `IMPUTED`
//! elsewhere, `TYPED_ONLY` for passthrough sites) in INFO.
//!
//! When a cohort spans several haplotype batches, each batch's matrices
//! spool to unlinked temporary files of raw little-endian `f32` rows and
//! are merged here in batch order, one row at a time.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::GenomicRegion;
use crate::data::block::ReducedHaplotypes;
use crate::data::variant::{is_dosage_eov, TargetVariant, GT_EOV, GT_MISSING};
use crate::error::{RemacError, Result};
use crate::model::results::DosageResults;

/// Format a dosage with at most four digits after the decimal point.
fn format_dosage(value: f32, buffer: &mut ryu::Buffer) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    let s = buffer.format(value);
    match s.find('.') {
        Some(dot) => s[..(dot + 5).min(s.len())].trim_end_matches('0').trim_end_matches('.').to_string(),
        None => s.to_string(),
    }
}

/// Streaming access to the dosage matrices, row by row: full-panel rows in
/// variant order, leave-one-out rows in typed-site order. Implementations
/// only guarantee sequential access.
pub trait DosageRowSource {
    fn next_dosage_row(&mut self, out: &mut Vec<f32>) -> Result<()>;
    fn next_loo_row(&mut self, out: &mut Vec<f32>) -> Result<()>;
}

/// Row source over one in-memory batch.
pub struct ResultsRows<'a> {
    results: &'a DosageResults,
    variant_cursor: usize,
    loo_cursor: usize,
}

impl<'a> ResultsRows<'a> {
    pub fn new(results: &'a DosageResults) -> Self {
        Self {
            results,
            variant_cursor: 0,
            loo_cursor: 0,
        }
    }
}

impl DosageRowSource for ResultsRows<'_> {
    fn next_dosage_row(&mut self, out: &mut Vec<f32>) -> Result<()> {
        out.clear();
        out.extend(self.results.dosage_row(self.variant_cursor));
        self.variant_cursor += 1;
        Ok(())
    }

    fn next_loo_row(&mut self, out: &mut Vec<f32>) -> Result<()> {
        out.clear();
        out.extend(self.results.loo_row(self.loo_cursor));
        self.loo_cursor += 1;
        Ok(())
    }
}

/// One batch's spooled matrices. The files are unlinked right after
/// creation; the open handles retain the storage until dropped.
pub struct TempSpool {
    dosages: File,
    loo: File,
    /// Haplotype columns in this batch.
    width: usize,
}

impl TempSpool {
    /// Create the two spool files under `prefix` and unlink them.
    pub fn create(prefix: &str, batch_idx: usize) -> Result<Self> {
        let make = |suffix: &str| -> Result<File> {
            let path = PathBuf::from(format!(
                "{}{}_{}_{}",
                prefix,
                std::process::id(),
                batch_idx,
                suffix
            ));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| RemacError::open(&path, e))?;
            std::fs::remove_file(&path)?;
            Ok(file)
        };
        Ok(Self {
            dosages: make("hds")?,
            loo: make("loo")?,
            width: 0,
        })
    }

    /// Spool one batch: every full-panel row, then every leave-one-out row.
    pub fn write_batch(&mut self, results: &DosageResults) -> Result<()> {
        self.width = results.dimensions().1;
        let mut writer = BufWriter::new(&mut self.dosages);
        for v in 0..results.dimensions().0 {
            for value in results.dosage_row(v) {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()?;
        drop(writer);

        let mut writer = BufWriter::new(&mut self.loo);
        for v in 0..results.dimensions_loo().0 {
            for value in results.loo_row(v) {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.dosages.seek(SeekFrom::Start(0))?;
        self.loo.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

/// Row source concatenating several spooled batches in batch order.
pub struct SpoolRows {
    spools: Vec<(BufReader<File>, BufReader<File>, usize)>,
    buffer: Vec<u8>,
}

impl SpoolRows {
    pub fn new(mut spools: Vec<TempSpool>) -> Result<Self> {
        for spool in &mut spools {
            spool.rewind()?;
        }
        Ok(Self {
            spools: spools
                .into_iter()
                .map(|s| (BufReader::new(s.dosages), BufReader::new(s.loo), s.width))
                .collect(),
            buffer: Vec::new(),
        })
    }

    fn read_row(
        reader: &mut BufReader<File>,
        width: usize,
        buffer: &mut Vec<u8>,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        buffer.resize(width * 4, 0);
        reader.read_exact(buffer)?;
        for chunk in buffer.chunks_exact(4) {
            out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(())
    }
}

impl DosageRowSource for SpoolRows {
    fn next_dosage_row(&mut self, out: &mut Vec<f32>) -> Result<()> {
        out.clear();
        let mut buffer = std::mem::take(&mut self.buffer);
        for (dosages, _, width) in &mut self.spools {
            Self::read_row(dosages, *width, &mut buffer, out)?;
        }
        self.buffer = buffer;
        Ok(())
    }

    fn next_loo_row(&mut self, out: &mut Vec<f32>) -> Result<()> {
        out.clear();
        let mut buffer = std::mem::take(&mut self.buffer);
        for (_, loo, width) in &mut self.spools {
            Self::read_row(loo, *width, &mut buffer, out)?;
        }
        self.buffer = buffer;
        Ok(())
    }
}

/// Imputed-record writer.
pub struct DosageWriter {
    writer: Box<dyn Write>,
    sample_ids: Vec<String>,
    ploidy: usize,
    fmt_fields: Vec<String>,
    min_r2: f32,
    ryu_buffer: ryu::Buffer,
    line: String,
}

impl DosageWriter {
    pub fn create(
        path: &Path,
        compressed: bool,
        sample_ids: Vec<String>,
        ploidy: usize,
        fmt_fields: Vec<String>,
        chrom: &str,
        min_r2: f32,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let writer: Box<dyn Write> = if compressed {
            Box::new(BufWriter::new(noodles::bgzf::Writer::new(file)))
        } else {
            Box::new(BufWriter::new(file))
        };
        let mut out = Self {
            writer,
            sample_ids,
            ploidy,
            fmt_fields,
            min_r2,
            ryu_buffer: ryu::Buffer::new(),
            line: String::new(),
        };
        out.write_header(chrom)?;
        Ok(out)
    }

    fn write_header(&mut self, chrom: &str) -> Result<()> {
        writeln!(self.writer, "##fileformat=VCFv4.2")?;
        if !chrom.is_empty() {
            writeln!(self.writer, "##contig=<ID={}>", chrom)?;
        }
        writeln!(
            self.writer,
            "##INFO=<ID=AF,Number=1,Type=Float,Description=\"Estimated alternate allele frequency\">"
        )?;
        writeln!(
            self.writer,
            "##INFO=<ID=MAF,Number=1,Type=Float,Description=\"Estimated minor allele frequency\">"
        )?;
        writeln!(
            self.writer,
            "##INFO=<ID=R2,Number=1,Type=Float,Description=\"Estimated imputation accuracy (r-square)\">"
        )?;
        writeln!(
            self.writer,
            "##INFO=<ID=ER2,Number=1,Type=Float,Description=\"Empirical (leave-one-out) r-square\">"
        )?;
        writeln!(
            self.writer,
            "##INFO=<ID=IMPUTED,Number=0,Type=Flag,Description=\"Marker was imputed\">"
        )?;
        writeln!(
            self.writer,
            "##INFO=<ID=TYPED,Number=0,Type=Flag,Description=\"Marker was genotyped\">"
        )?;
        writeln!(
            self.writer,
            "##INFO=<ID=TYPED_ONLY,Number=0,Type=Flag,Description=\"Marker was genotyped but is not in the reference\">"
        )?;
        for field in &self.fmt_fields {
            let line = match field.as_str() {
                "GT" => "##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">",
                "DS" => "##FORMAT=<ID=DS,Number=1,Type=Float,Description=\"Estimated alternate allele dosage\">",
                "HDS" => "##FORMAT=<ID=HDS,Number=.,Type=Float,Description=\"Estimated haploid alternate allele dosage\">",
                "GP" => "##FORMAT=<ID=GP,Number=G,Type=Float,Description=\"Estimated posterior genotype probabilities\">",
                "SD" => "##FORMAT=<ID=SD,Number=1,Type=Float,Description=\"Estimated dose standard deviation\">",
                _ => continue,
            };
            writeln!(self.writer, "{}", line)?;
        }
        write!(self.writer, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT")?;
        for id in &self.sample_ids {
            write!(self.writer, "\t{}", id)?;
        }
        writeln!(self.writer)?;
        Ok(())
    }

    /// Write every record of one chunk: imputed full-panel variants merged
    /// by position with target-only passthrough sites.
    pub fn write_dosages(
        &mut self,
        rows: &mut dyn DosageRowSource,
        target_sites: &[TargetVariant],
        target_only_sites: &[TargetVariant],
        full_panel: &ReducedHaplotypes,
        impute_region: &GenomicRegion,
    ) -> Result<()> {
        let mut hds_row: Vec<f32> = Vec::new();
        let mut loo_row: Vec<f32> = Vec::new();
        let mut typed_idx = 0usize;
        let mut loo_consumed = 0usize;
        let mut only_idx = 0usize;
        let mut written = 0usize;

        let mut cursor = full_panel.cursor_at_first();
        while !cursor.is_done() {
            let variant = cursor.variant();

            // Interleave passthrough sites that precede this variant.
            while only_idx < target_only_sites.len()
                && target_only_sites[only_idx].pos < variant.site.pos
            {
                self.write_target_only(&target_only_sites[only_idx], impute_region)?;
                only_idx += 1;
            }

            rows.next_dosage_row(&mut hds_row)?;

            // A typed site matching this variant contributes its
            // leave-one-out row for the ER2 estimate.
            let mut typed: Option<&TargetVariant> = None;
            while typed_idx < target_sites.len() && target_sites[typed_idx].pos < variant.site.pos {
                typed_idx += 1;
            }
            let mut j = typed_idx;
            while j < target_sites.len() && target_sites[j].pos == variant.site.pos {
                if target_sites[j].same_site(&variant.site) {
                    // Discard unconsumed rows of flanking typed sites.
                    loo_row.clear();
                    while loo_consumed <= j {
                        rows.next_loo_row(&mut loo_row)?;
                        loo_consumed += 1;
                    }
                    typed = Some(&target_sites[j]);
                    break;
                }
                j += 1;
            }

            if self.write_site(variant, typed, &hds_row, &loo_row)? {
                written += 1;
            }
            cursor.advance();
        }

        while only_idx < target_only_sites.len() {
            self.write_target_only(&target_only_sites[only_idx], impute_region)?;
            only_idx += 1;
        }

        info!("wrote {} imputed records", written);
        self.writer.flush()?;
        Ok(())
    }

    /// Write one imputed record. Returns false when the r-square filter
    /// dropped it.
    fn write_site(
        &mut self,
        variant: &crate::data::variant::ReferenceVariant,
        typed: Option<&TargetVariant>,
        hds_row: &[f32],
        loo_row: &[f32],
    ) -> Result<bool> {
        // Frequency and r2 from the haploid dosages.
        let mut n = 0usize;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for &d in hds_row {
            if is_dosage_eov(d) || !d.is_finite() {
                continue;
            }
            n += 1;
            sum += d as f64;
            sum_sq += (d * d) as f64;
        }
        let af = if n > 0 { (sum / n as f64) as f32 } else { 0.0 };
        let maf = af.min(1.0 - af);
        let r2 = if n > 0 && sum > 0.0 {
            let mean_term = sum * sum / n as f64;
            let num = sum_sq - mean_term;
            let den = sum - mean_term;
            if num <= 0.0 || den <= 0.0 {
                0.0
            } else {
                (num / den).clamp(0.0, 1.0) as f32
            }
        } else {
            0.0
        };
        if self.min_r2 >= 0.0 && r2 < self.min_r2 {
            return Ok(false);
        }

        self.line.clear();
        {
            use std::fmt::Write as _;
            write!(
                self.line,
                "{}\t{}\t{}\t{}\t{}\t.\tPASS\t",
                variant.site.chrom,
                variant.site.pos,
                if variant.site.id.is_empty() { "." } else { &variant.site.id },
                variant.site.ref_allele,
                variant.site.alt_allele
            )
            .expect("write to string");
        }
        let mut ryu_buffer = std::mem::replace(&mut self.ryu_buffer, ryu::Buffer::new());
        self.line.push_str("AF=");
        self.line.push_str(&format_dosage(af, &mut ryu_buffer));
        self.line.push_str(";MAF=");
        self.line.push_str(&format_dosage(maf, &mut ryu_buffer));
        self.line.push_str(";R2=");
        self.line.push_str(&format_dosage(r2, &mut ryu_buffer));
        match typed {
            Some(tv) => {
                if let Some(er2) = empirical_r2(tv, loo_row) {
                    self.line.push_str(";ER2=");
                    self.line.push_str(&format_dosage(er2, &mut ryu_buffer));
                }
                self.line.push_str(";TYPED");
            }
            None => self.line.push_str(";IMPUTED"),
        }

        self.line.push('\t');
        self.line.push_str(&self.fmt_fields.join(":"));

        for s in 0..self.sample_ids.len() {
            self.line.push('\t');
            let slots = &hds_row[s * self.ploidy..(s + 1) * self.ploidy];
            let doses: Vec<f32> = slots
                .iter()
                .copied()
                .filter(|&d| !is_dosage_eov(d))
                .collect();
            let fields_text = self.format_sample(&doses, &mut ryu_buffer);
            self.line.push_str(&fields_text);
        }
        self.line.push('\n');
        self.ryu_buffer = ryu_buffer;
        self.writer.write_all(self.line.as_bytes())?;
        Ok(true)
    }

    fn format_sample(&self, doses: &[f32], ryu_buffer: &mut ryu::Buffer) -> String {
        let mut text = String::new();
        for (k, field) in self.fmt_fields.iter().enumerate() {
            if k > 0 {
                text.push(':');
            }
            match field.as_str() {
                "GT" => {
                    if doses.is_empty() {
                        text.push('.');
                    }
                    for (i, &d) in doses.iter().enumerate() {
                        if i > 0 {
                            text.push('|');
                        }
                        text.push(if d >= 0.5 { '1' } else { '0' });
                    }
                }
                "DS" => {
                    let ds: f32 = doses.iter().sum();
                    text.push_str(&format_dosage(ds, ryu_buffer));
                }
                "HDS" => {
                    if doses.is_empty() {
                        text.push('.');
                    }
                    for (i, &d) in doses.iter().enumerate() {
                        if i > 0 {
                            text.push(',');
                        }
                        text.push_str(&format_dosage(d, ryu_buffer));
                    }
                }
                "GP" => match doses {
                    [d] => {
                        text.push_str(&format_dosage(1.0 - d, ryu_buffer));
                        text.push(',');
                        text.push_str(&format_dosage(*d, ryu_buffer));
                    }
                    [d1, d2] => {
                        let p11 = d1 * d2;
                        let p01 = d1 * (1.0 - d2) + d2 * (1.0 - d1);
                        let p00 = (1.0 - d1) * (1.0 - d2);
                        text.push_str(&format_dosage(p00, ryu_buffer));
                        text.push(',');
                        text.push_str(&format_dosage(p01, ryu_buffer));
                        text.push(',');
                        text.push_str(&format_dosage(p11, ryu_buffer));
                    }
                    _ => text.push('.'),
                },
                "SD" => {
                    let var: f32 = doses.iter().map(|&d| d * (1.0 - d)).sum();
                    text.push_str(&format_dosage(var.max(0.0).sqrt(), ryu_buffer));
                }
                _ => text.push('.'),
            }
        }
        text
    }

    /// Emit a target-only site unchanged (GT from the observed alleles).
    fn write_target_only(
        &mut self,
        site: &TargetVariant,
        impute_region: &GenomicRegion,
    ) -> Result<()> {
        if !impute_region.contains(site.pos as u64) {
            return Ok(());
        }
        self.line.clear();
        {
            use std::fmt::Write as _;
            write!(
                self.line,
                "{}\t{}\t{}\t{}\t{}\t.\tPASS\tTYPED_ONLY\tGT",
                site.chrom,
                site.pos,
                if site.id.is_empty() { "." } else { &site.id },
                site.ref_allele,
                site.alt_allele
            )
            .expect("write to string");
        }
        let ploidy = site.gt.len() / self.sample_ids.len();
        for s in 0..self.sample_ids.len() {
            self.line.push('\t');
            let mut any = false;
            for k in 0..ploidy {
                let g = site.gt[s * ploidy + k];
                if g == GT_EOV {
                    continue;
                }
                if any {
                    self.line.push('|');
                }
                any = true;
                match g {
                    GT_MISSING => self.line.push('.'),
                    1 => self.line.push('1'),
                    _ => self.line.push('0'),
                }
            }
            if !any {
                self.line.push('.');
            }
        }
        self.line.push('\n');
        self.writer.write_all(self.line.as_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Squared Pearson correlation between observed alleles and leave-one-out
/// dosages at a typed site; `None` when degenerate.
fn empirical_r2(site: &TargetVariant, loo_row: &[f32]) -> Option<f32> {
    let mut n = 0.0f64;
    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f64, 0.0, 0.0, 0.0, 0.0);
    for (h, &d) in loo_row.iter().enumerate() {
        let observed = *site.gt.get(h)?;
        if observed < 0 || is_dosage_eov(d) || !d.is_finite() {
            continue;
        }
        let x = observed as f64;
        let y = d as f64;
        n += 1.0;
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
    }
    if n < 2.0 {
        return None;
    }
    let cov = sxy - sx * sy / n;
    let var_x = sxx - sx * sx / n;
    let var_y = syy - sy * sy / n;
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some(((cov * cov) / (var_x * var_y)).clamp(0.0, 1.0) as f32)
}
