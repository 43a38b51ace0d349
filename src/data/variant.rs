//! # Variant Records
//!
//! Site metadata and per-site genotype rows for the reference and target
//! panels. The reference side is a flat product type (`ReferenceVariant` is
//! `ReferenceSiteInfo` plus genotype data) rather than a class hierarchy;
//! all cross-references elsewhere in the crate are index-based.

use std::sync::Arc;

/// Genotype value for a missing observation in a target haplotype.
pub const GT_MISSING: i8 = -1;

/// Genotype value marking a haplotype slot that does not exist for a sample
/// (lower ploidy). Mirrors the typed-value "end of vector" convention of the
/// reference file format.
pub const GT_EOV: i8 = i8::MIN;

/// Bit pattern of the `f32` end-of-vector sentinel used in dosage matrices.
/// A quiet NaN with a reserved payload so it can be told apart from ordinary
/// missing values by bit comparison.
const DOSAGE_EOV_BITS: u32 = 0x7FC0_0002;

/// The end-of-vector sentinel for dosage matrices.
#[inline]
pub fn dosage_eov() -> f32 {
    f32::from_bits(DOSAGE_EOV_BITS)
}

/// True if `value` is the end-of-vector sentinel (bitwise test; `==` would
/// fail since the sentinel is a NaN).
#[inline]
pub fn is_dosage_eov(value: f32) -> bool {
    value.to_bits() == DOSAGE_EOV_BITS
}

/// Immutable metadata for one reference site.
#[derive(Clone, Debug)]
pub struct ReferenceSiteInfo {
    pub chrom: Arc<str>,
    /// 1-based position
    pub pos: u32,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    /// Error parameter used by the HMM condition step; NaN if the reference
    /// file carried no ERR annotation.
    pub err: f32,
    /// Recombination probability to the *next* site; NaN until assigned.
    /// The final site of a panel always carries 0.
    pub recom: f32,
    /// Centimorgan position; NaN until filled from a genetic map or from
    /// accumulated recombination probabilities.
    pub cm: f64,
}

impl ReferenceSiteInfo {
    pub fn new(
        chrom: Arc<str>,
        pos: u32,
        id: String,
        ref_allele: String,
        alt_allele: String,
    ) -> Self {
        Self {
            chrom,
            pos,
            id,
            ref_allele,
            alt_allele,
            err: f32::NAN,
            recom: f32::NAN,
            cm: f64::NAN,
        }
    }
}

/// One variant of a unique-haplotype block: site metadata plus the allele
/// each unique template carries and the expanded allele count.
#[derive(Clone, Debug)]
pub struct ReferenceVariant {
    pub site: ReferenceSiteInfo,
    /// Allele count over expanded haplotypes: `Σ_u cardinalities[u] · gt[u]`
    pub ac: u64,
    /// Per-unique-template alleles, length = unique haplotype count
    pub gt: Vec<i8>,
}

impl ReferenceVariant {
    pub fn new(site: ReferenceSiteInfo, ac: u64, gt: Vec<i8>) -> Self {
        Self { site, ac, gt }
    }
}

/// One observed target site across all target haplotypes.
#[derive(Clone, Debug)]
pub struct TargetVariant {
    pub chrom: Arc<str>,
    pub pos: u32,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    /// Site exists in the target file
    pub in_tar: bool,
    /// Site exists in the reference panel
    pub in_ref: bool,
    /// Alternate allele frequency from the reference panel
    pub af: f32,
    /// Error parameter for the HMM condition step
    pub err: f32,
    /// Recombination probability to the next typed site (0 at the last site)
    pub recom: f32,
    /// Centimorgan position (from the aligned reference site)
    pub cm: f64,
    /// Per-haplotype observed alleles: 0, 1, [`GT_MISSING`], or [`GT_EOV`]
    /// for haplotype slots beyond a sample's ploidy.
    pub gt: Vec<i8>,
}

impl TargetVariant {
    /// True if both records name the same site (position and alleles).
    pub fn same_site(&self, site: &ReferenceSiteInfo) -> bool {
        self.pos == site.pos
            && self.ref_allele == site.ref_allele
            && self.alt_allele == site.alt_allele
    }
}
