//! # Genetic Map Interpolation
//!
//! Convert physical positions (base pairs) to genetic distances
//! (centiMorgans) and genetic distances to recombination / switch
//! probabilities for the HMM transition model.
//!
//! Two map file schemas are supported, selected on header presence:
//! - New: tab-separated `chrom  pos  cM`, `#`-prefixed header lines.
//! - Legacy (PLINK-style): four columns `chrom  <discard>  cM  pos`.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::data::variant::TargetVariant;
use crate::error::{RemacError, Result};

/// Haldane's mapping function: genetic distance (cM) to recombination
/// probability, `r = (1 - e^(-d/50)) / 2`.
#[inline]
pub fn haldane(cm: f64) -> f64 {
    (1.0 - (-cm / 50.0).exp()) / 2.0
}

/// Inverse of [`haldane`]: `d = 50 · ln(1 / (1 - 2r))`.
#[inline]
pub fn haldane_inverse(recom_prob: f64) -> f64 {
    50.0 * (1.0 / (1.0 - 2.0 * recom_prob)).ln()
}

/// Genetic distance (cM) to switch probability, `p = 1 - e^(-d/100)`.
#[inline]
pub fn cm_to_switch_prob(cm: f64) -> f64 {
    1.0 - (-cm / 100.0).exp()
}

/// Decay-scaled variant of [`cm_to_switch_prob`], `p = 1 - e^(-λd/100)`;
/// used for dosage decay in flanking overlap regions.
#[inline]
pub fn cm_to_switch_prob_decay(cm: f64, decay_rate: f64) -> f64 {
    1.0 - (-decay_rate * cm / 100.0).exp()
}

/// Inverse of [`cm_to_switch_prob`]: `d = 100 · ln(1 / (1 - p))`.
#[inline]
pub fn switch_prob_to_cm(switch_prob: f64) -> f64 {
    100.0 * (1.0 / (1.0 - switch_prob)).ln()
}

/// A single anchor from a genetic map file.
#[derive(Clone, Debug, Default)]
struct MapRecord {
    chrom: String,
    pos: u64,
    map_value: f64,
}

/// A streaming reader/interpolator for genetic map files.
///
/// Records for the target chromosome are consumed lazily as queries advance;
/// queries must therefore come in non-decreasing position order (which the
/// sorted panels guarantee).
pub struct GeneticMapFile {
    lines: std::io::Lines<BufReader<Box<dyn Read>>>,
    target_chrom: String,
    prev_rec: MapRecord,
    cur_rec: MapRecord,
    new_format: bool,
    good: bool,
}

impl GeneticMapFile {
    /// Open a map file and position it at the first record of `chrom`.
    pub fn new(path: &Path, chrom: &str) -> Result<Self> {
        let file = File::open(path).map_err(|e| RemacError::open(path, e))?;
        let inner: Box<dyn Read> = if path
            .extension()
            .map(|e| e == "gz" || e == "bgz")
            .unwrap_or(false)
        {
            Box::new(noodles::bgzf::Reader::new(file))
        } else {
            Box::new(file)
        };
        let mut lines = BufReader::new(inner).lines();

        // Sniff the schema: header lines start with '#'; their presence
        // selects the new three-column format.
        let mut new_format = false;
        let mut first_data: Option<String> = None;
        for line in lines.by_ref() {
            let line = line?;
            if line.starts_with('#') {
                new_format = true;
                continue;
            }
            if !line.trim().is_empty() {
                first_data = Some(line);
                break;
            }
        }

        let mut map = Self {
            lines,
            target_chrom: chrom.to_string(),
            prev_rec: MapRecord::default(),
            cur_rec: MapRecord::default(),
            new_format,
            good: false,
        };

        // Seek to the first two records of the target chromosome.
        let mut first: Option<MapRecord> = first_data
            .as_deref()
            .and_then(|l| parse_map_line(l, new_format))
            .filter(|r| r.chrom == map.target_chrom);
        while first.is_none() {
            match map.read_record()? {
                Some(rec) if rec.chrom == map.target_chrom => first = Some(rec),
                Some(_) => continue,
                None => break,
            }
        }
        if let Some(first) = first {
            if let Some(second) = map.read_record()? {
                if second.chrom == map.target_chrom {
                    map.prev_rec = first;
                    map.cur_rec = second;
                    map.good = true;
                }
            }
        }

        if !map.good {
            return Err(RemacError::alignment(format!(
                "genetic map has fewer than two records for chromosome {}",
                chrom
            )));
        }
        Ok(map)
    }

    fn read_record(&mut self) -> Result<Option<MapRecord>> {
        let new_format = self.new_format;
        for line in self.lines.by_ref() {
            let line = line?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            return Ok(parse_map_line(&line, new_format));
        }
        Ok(None)
    }

    /// Interpolate the centimorgan value at `variant_pos`.
    ///
    /// Before the first anchor, extrapolates from the origin with the first
    /// anchor's slope; between anchors, interpolates linearly; past the last
    /// anchor, extrapolates with the last known slope.
    pub fn interpolate_centimorgan(&mut self, variant_pos: u64) -> f64 {
        if !self.good {
            return f64::NAN;
        }

        if variant_pos <= self.prev_rec.pos {
            let slope = self.prev_rec.map_value / self.prev_rec.pos.max(1) as f64;
            return slope * variant_pos as f64;
        }

        // Advance the window until the query falls inside it or the
        // chromosome runs out.
        while variant_pos > self.cur_rec.pos {
            match self.read_record() {
                Ok(Some(rec)) if rec.chrom == self.target_chrom => {
                    debug_assert!(rec.pos > self.cur_rec.pos);
                    self.prev_rec = std::mem::replace(&mut self.cur_rec, rec);
                }
                _ => {
                    // Past the last anchor: constant per-basepair rate from
                    // the final interval.
                    let basepair_cm = (self.cur_rec.map_value - self.prev_rec.map_value)
                        / (self.cur_rec.pos - self.prev_rec.pos) as f64;
                    return self.cur_rec.map_value
                        + basepair_cm * (variant_pos - self.cur_rec.pos) as f64;
                }
            }
        }

        let span = (self.cur_rec.pos - self.prev_rec.pos) as f64;
        let fraction = (variant_pos - self.prev_rec.pos) as f64 / span;
        self.prev_rec.map_value + fraction * (self.cur_rec.map_value - self.prev_rec.map_value)
    }
}

/// Parse one map line in either schema: new `chrom pos cM`, legacy
/// `chrom <discard> cM pos`.
fn parse_map_line(line: &str, new_format: bool) -> Option<MapRecord> {
    let mut fields = line.split_whitespace();
    if new_format {
        let chrom = fields.next()?.to_string();
        let pos = fields.next()?.parse().ok()?;
        let map_value = fields.next()?.parse().ok()?;
        Some(MapRecord {
            chrom,
            pos,
            map_value,
        })
    } else {
        let chrom = fields.next()?.to_string();
        let _discard = fields.next()?;
        let map_value = fields.next()?.parse().ok()?;
        let pos = fields.next()?.parse().ok()?;
        Some(MapRecord {
            chrom,
            pos,
            map_value,
        })
    }
}

/// Assign per-interval recombination probabilities to aligned target sites
/// from their centimorgan positions:
/// `recom[i] = max(min_recom, haldane(cm[i+1] - cm[i]))`, last site 0.
pub fn assign_recom_from_cm(sites: &mut [TargetVariant], recom_min: f32) {
    let n = sites.len();
    if n == 0 {
        return;
    }
    for i in 0..n - 1 {
        let delta = (sites[i + 1].cm - sites[i].cm).max(0.0);
        sites[i].recom = (haldane(delta) as f32).max(recom_min);
    }
    sites[n - 1].recom = 0.0;
}

/// Parse a genetic map and assign switch probabilities to `sites` in one
/// pass (sites must be sorted by position and share one chromosome).
pub fn parse_map_file(path: &Path, sites: &mut [TargetVariant], recom_min: f32) -> Result<()> {
    if sites.is_empty() {
        return Ok(());
    }
    let chrom = sites[0].chrom.to_string();
    let mut map = GeneticMapFile::new(path, &chrom)?;
    for site in sites.iter_mut() {
        site.cm = map.interpolate_centimorgan(site.pos as u64);
    }
    assign_recom_from_cm(sites, recom_min);
    Ok(())
}
