//! # Li-Stephens Imputation HMM
//!
//! Forward/backward traversal over a block-compressed reference panel for a
//! single target haplotype, producing posterior alt-allele dosages at every
//! full-panel variant and leave-one-out dosages at typed sites.
//!
//! ## Key Concepts
//! - The state space at any typed variant is the set of *unique templates*
//!   of the covering block, weighted by template cardinality; the forward
//!   and backward vectors are template-aggregated probability masses.
//! - A parallel "no recombination" vector per direction carries the mass
//!   that has never switched templates; its within-template distribution
//!   over physical haplotypes is tracked by per-block junction proportions.
//! - Between typed sites, posteriors are restricted to a few dominant
//!   templates (S3), expanded to physical haplotypes (S1), and folded into
//!   the untyped-covering block's templates (S2) for dosage computation.
//!
//! ## Reference
//! Li N, Stephens M. Genetics 2003 Dec;165(4):2213-33

use bitvec::prelude::*;

use crate::data::block::{PanelCursor, ReducedHaplotypes, UniqueHaplotypeBlock};
use crate::data::genetic_map::cm_to_switch_prob_decay;
use crate::data::variant::TargetVariant;
use crate::model::results::HaplotypeDosages;

/// Rescaling factor applied when probability mass underflows.
const JUMP_FIX: f64 = 1e15;

/// Probability-mass threshold below which a precision jump fires.
const JUMP_THRESHOLD: f64 = 1e-10;

/// Dosages are discretized to 1/BIN_SCALAR resolution for reproducibility
/// across floating-point environments.
const BIN_SCALAR: f32 = 1000.0;

#[inline]
fn bin_dosage(dose: f32) -> f32 {
    ((dose.clamp(0.0, 1.0)) * BIN_SCALAR).round() / BIN_SCALAR
}

/// Tuning parameters of the HMM engine.
#[derive(Clone, Debug)]
struct HmmParams {
    /// Minimum normalized posterior for a template to enter S3.
    prob_threshold: f32,
    /// Minimum probability for an expanded haplotype to enter S1;
    /// negative means "accept every haplotype of every S3 survivor".
    s1_prob_threshold: f32,
    /// Maximum posterior drift for the confident-template fast path.
    diff_threshold: f32,
    /// Error parameter used when a site carries no ERR annotation.
    background_error: f32,
    /// Decay rate for dosages in flanking regions (0 disables).
    decay: f64,
}

/// Buffers for the S3 → S1 → S2 posterior reduction, reused across typed
/// sites and across haplotypes.
#[derive(Debug, Default)]
struct ReductionScratch {
    best_s3_haps: Vec<u32>,
    best_s3_probs: Vec<f32>,
    best_s1_haps: Vec<u32>,
    best_s1_probs: Vec<f32>,
    s2_probs: Vec<f32>,
    s2_cardinalities: Vec<u32>,
    best_s2_haps: Vec<u32>,
    best_s2_probs: Vec<f32>,
    /// Expanded-haplotype representative and posterior of the last
    /// confidently-called template.
    prev_best: Option<(u32, f32)>,
    /// Full-panel block index the S2 fold is currently valid for.
    s2_block: Option<usize>,
}

/// Forward/backward state and per-site posterior vectors shared at a typed
/// site (everything the impute kernel reads).
struct SiteProbs<'a> {
    fwd: &'a [f32],
    bwd: &'a [f32],
    /// `fwd_norecom[u] · bwd_norecom[u]`, the non-recombinant pass-through
    /// mass per template.
    constants: &'a [f32],
    /// Forward junction proportions of the covering typed block.
    jp_left: &'a [f32],
    /// Backward junction proportions, expressed for the same block.
    jp_right: &'a [f32],
    reverse_map: &'a [Vec<u32>],
    template_gt: &'a [i8],
    cardinalities: &'a [u64],
}

/// Per-worker HMM engine. Allocated once per thread and reused across
/// target haplotypes; [`Self::traverse_forward`] must complete for a
/// haplotype before [`Self::traverse_backward`] runs for the same one.
pub struct HiddenMarkovModel {
    params: HmmParams,
    /// `[block][variant in block][unique template]`, post-condition values.
    forward_probs: Vec<Vec<Vec<f32>>>,
    forward_norecom_probs: Vec<Vec<Vec<f32>>>,
    /// Per block, the within-template distribution of non-recombinant mass
    /// over expanded haplotype slots at block entry (sums to 1 per
    /// template).
    junction_proportions: Vec<Vec<f32>>,
    /// One bit per typed variant: an underflow rescale fired on the
    /// transition into it.
    precision_jumps: BitVec,
    scratch: ReductionScratch,
}

impl HiddenMarkovModel {
    pub fn new(
        prob_threshold: f32,
        s1_prob_threshold: f32,
        diff_threshold: f32,
        background_error: f32,
        decay: f64,
    ) -> Self {
        Self {
            params: HmmParams {
                prob_threshold,
                s1_prob_threshold,
                diff_threshold,
                background_error,
                decay,
            },
            forward_probs: Vec::new(),
            forward_norecom_probs: Vec::new(),
            junction_proportions: Vec::new(),
            precision_jumps: BitVec::new(),
            scratch: ReductionScratch::default(),
        }
    }

    /// Positions where the forward pass rescaled against underflow.
    pub fn precision_jumps(&self) -> &BitSlice {
        &self.precision_jumps
    }

    /// Forward pass over the typed-only panel for target haplotype
    /// `hap_idx`, filling the per-block forward vectors, the junction
    /// proportions, and the precision-jump bits.
    pub fn traverse_forward(
        &mut self,
        ref_blocks: &[UniqueHaplotypeBlock],
        tar_variants: &[TargetVariant],
        hap_idx: usize,
    ) {
        debug_assert!(!ref_blocks.is_empty());
        debug_assert_eq!(
            tar_variants.len(),
            ref_blocks.iter().map(|b| b.variant_size()).sum::<usize>(),
            "target sites must align 1:1 with typed-panel variants"
        );

        let n_expanded = ref_blocks[0].total_cardinality();

        self.forward_probs.resize_with(ref_blocks.len(), Vec::new);
        self.forward_norecom_probs
            .resize_with(ref_blocks.len(), Vec::new);
        self.junction_proportions
            .resize_with(ref_blocks.len(), Vec::new);
        self.precision_jumps.clear();
        self.precision_jumps.resize(tar_variants.len(), false);

        let mut global_idx = 0usize;
        let mut last_recom = 0.0f64;

        for (block_idx, block) in ref_blocks.iter().enumerate() {
            debug_assert_eq!(block.total_cardinality(), n_expanded);
            let n_uniq = block.unique_haplotype_size();
            let n_variants = block.variant_size();

            for probs in [
                &mut self.forward_probs[block_idx],
                &mut self.forward_norecom_probs[block_idx],
            ] {
                probs.resize_with(n_variants, Vec::new);
                for row in probs.iter_mut() {
                    row.clear();
                    row.resize(n_uniq, 0.0);
                }
            }

            if block_idx == 0 {
                initialize_likelihoods(
                    &mut self.forward_probs[0][0],
                    &mut self.forward_norecom_probs[0][0],
                    &mut self.junction_proportions[0],
                    block,
                );
            } else {
                self.cross_junction_forward(&ref_blocks[block_idx - 1], block, block_idx);
                let first = &mut self.forward_probs[block_idx][0];
                let first_norecom = &mut self.forward_norecom_probs[block_idx][0];
                if transpose_in_place(
                    first,
                    first_norecom,
                    block.cardinalities(),
                    last_recom,
                    n_expanded,
                ) {
                    self.precision_jumps.set(global_idx, true);
                }
            }

            for i in 0..n_variants {
                let tv = &tar_variants[global_idx];
                let observed = tv.gt[hap_idx];
                let err = if tv.err.is_nan() {
                    self.params.background_error
                } else {
                    tv.err
                };
                condition(
                    &mut self.forward_probs[block_idx][i],
                    &mut self.forward_norecom_probs[block_idx][i],
                    &block.variants()[i].gt,
                    observed,
                    err,
                    tv.af,
                );

                if i + 1 < n_variants {
                    let (head, tail) = self.forward_probs[block_idx].split_at_mut(i + 1);
                    let (head_nr, tail_nr) =
                        self.forward_norecom_probs[block_idx].split_at_mut(i + 1);
                    if transpose(
                        &head[i],
                        &mut tail[0],
                        &head_nr[i],
                        &mut tail_nr[0],
                        block.cardinalities(),
                        tv.recom as f64,
                        n_expanded,
                    ) {
                        self.precision_jumps.set(global_idx + 1, true);
                    }
                } else {
                    last_recom = tv.recom as f64;
                }
                global_idx += 1;
            }
        }
    }

    /// Backward pass for the same haplotype, writing dosages for every
    /// full-panel variant and leave-one-out dosages for every typed site
    /// into `output`.
    ///
    /// Requires a completed [`Self::traverse_forward`] for `hap_idx`.
    pub fn traverse_backward(
        &mut self,
        ref_blocks: &[UniqueHaplotypeBlock],
        tar_variants: &[TargetVariant],
        hap_idx: usize,
        reverse_maps: &[Vec<Vec<u32>>],
        full_ref: &ReducedHaplotypes,
        output: &mut HaplotypeDosages,
    ) {
        debug_assert_eq!(ref_blocks.len(), self.forward_probs.len());
        debug_assert_eq!(output.loo_dosages.len(), tar_variants.len());
        debug_assert_eq!(output.dosages.len(), full_ref.variant_size());

        let n_expanded = ref_blocks[0].total_cardinality();
        let n_blocks = ref_blocks.len();

        // Typed-panel block offsets, so the row index is explicit.
        let mut offsets = Vec::with_capacity(n_blocks);
        let mut total = 0usize;
        for block in ref_blocks {
            offsets.push(total);
            total += block.variant_size();
        }

        let mut backward: Vec<f32> = Vec::new();
        let mut backward_norecom: Vec<f32> = Vec::new();
        let mut junction_proportions_backward: Vec<f32> = Vec::new();
        let mut constants: Vec<f32> = Vec::new();
        self.scratch.prev_best = None;
        self.scratch.s2_block = None;
        self.scratch.best_s1_haps.clear();
        self.scratch.best_s1_probs.clear();

        let mut cursor = full_ref.cursor_at_last();

        for block_idx in (0..n_blocks).rev() {
            let block = &ref_blocks[block_idx];
            let n_variants = block.variant_size();

            if block_idx == n_blocks - 1 {
                initialize_likelihoods(
                    &mut backward,
                    &mut backward_norecom,
                    &mut junction_proportions_backward,
                    block,
                );
            } else {
                cross_junction_backward(
                    &ref_blocks[block_idx + 1],
                    block,
                    &mut backward,
                    &mut backward_norecom,
                    &mut junction_proportions_backward,
                );
                // Recombination interval between this block's last variant
                // and the next block's first.
                let recom = tar_variants[offsets[block_idx] + n_variants - 1].recom;
                transpose_in_place(
                    &mut backward,
                    &mut backward_norecom,
                    block.cardinalities(),
                    recom as f64,
                    n_expanded,
                );
            }

            for i in (0..n_variants).rev() {
                let row = offsets[block_idx] + i;
                let fwd = &self.forward_probs[block_idx][i];
                let fwd_norecom = &self.forward_norecom_probs[block_idx][i];

                constants.clear();
                constants.extend(
                    fwd_norecom
                        .iter()
                        .zip(backward_norecom.iter())
                        .map(|(&f, &b)| f * b),
                );

                let probs = SiteProbs {
                    fwd,
                    bwd: &backward,
                    constants: &constants,
                    jp_left: &self.junction_proportions[block_idx],
                    jp_right: &junction_proportions_backward,
                    reverse_map: &reverse_maps[block_idx],
                    template_gt: &block.variants()[i].gt,
                    cardinalities: block.cardinalities(),
                };
                impute(
                    &mut self.scratch,
                    &self.params,
                    row,
                    tar_variants,
                    hap_idx,
                    &probs,
                    &mut cursor,
                    output,
                );

                let tv = &tar_variants[row];
                let observed = tv.gt[hap_idx];
                let err = if tv.err.is_nan() {
                    self.params.background_error
                } else {
                    tv.err
                };
                condition(
                    &mut backward,
                    &mut backward_norecom,
                    &block.variants()[i].gt,
                    observed,
                    err,
                    tv.af,
                );

                if i > 0 {
                    transpose_in_place(
                        &mut backward,
                        &mut backward_norecom,
                        block.cardinalities(),
                        tar_variants[row - 1].recom as f64,
                        n_expanded,
                    );
                }
            }
        }

        // The full-panel walk must have consumed every variant.
        debug_assert!(cursor.is_done());
    }

    /// Re-express the forward state across the boundary into `block_idx`:
    /// expand the previous block's template masses to physical haplotypes
    /// (uniformly for recombinant mass, by junction proportion for
    /// non-recombinant mass), regroup them under the new block's map, and
    /// renormalize the proportions within each new template.
    fn cross_junction_forward(
        &mut self,
        prev_block: &UniqueHaplotypeBlock,
        block: &UniqueHaplotypeBlock,
        block_idx: usize,
    ) {
        let prev_probs = self.forward_probs[block_idx - 1]
            .last()
            .expect("previous block traversed");
        let prev_norecom = self.forward_norecom_probs[block_idx - 1]
            .last()
            .expect("previous block traversed");

        let prev_map = prev_block.unique_map();
        let map = block.unique_map();
        debug_assert_eq!(prev_map.len(), map.len());
        let prev_card = prev_block.cardinalities();
        let card = block.cardinalities();
        let n_uniq = block.unique_haplotype_size();

        let mut next = vec![0.0f32; n_uniq];
        let mut next_norecom = vec![0.0f32; n_uniq];
        let (head_jp, tail_jp) = self.junction_proportions.split_at_mut(block_idx);
        let prev_jp = &head_jp[block_idx - 1];
        let jp = &mut tail_jp[0];
        jp.clear();
        jp.resize(map.len(), 0.0);

        for h in 0..map.len() {
            let (pu, u) = (prev_map[h], map[h]);
            if pu < 0 || u < 0 {
                debug_assert_eq!(pu < 0, u < 0, "end-of-vector slots are panel-wide");
                continue;
            }
            let (pu, u) = (pu as usize, u as usize);
            next[u] += prev_probs[pu] / prev_card[pu] as f32;
            let mass = prev_norecom[pu] * prev_jp[h];
            next_norecom[u] += mass;
            jp[h] = mass;
        }
        normalize_proportions(jp, map, &next_norecom, card);

        self.forward_probs[block_idx][0] = next;
        self.forward_norecom_probs[block_idx][0] = next_norecom;
    }
}

/// Uniform initialization over unique templates, weighted by cardinality,
/// with uniform within-template junction proportions.
fn initialize_likelihoods(
    probs: &mut Vec<f32>,
    probs_norecom: &mut Vec<f32>,
    proportions: &mut Vec<f32>,
    block: &UniqueHaplotypeBlock,
) {
    let n_expanded = block.total_cardinality() as f32;
    let card = block.cardinalities();

    probs.clear();
    probs.extend(card.iter().map(|&c| c as f32 / n_expanded));
    probs_norecom.clear();
    probs_norecom.extend_from_slice(probs);

    let map = block.unique_map();
    proportions.clear();
    proportions.extend(map.iter().map(|&u| {
        if u >= 0 {
            1.0 / card[u as usize] as f32
        } else {
            0.0
        }
    }));
}

/// Multiply each template's mass by the emission probability of the
/// observed target allele. Missing observations leave the vectors
/// unchanged.
fn condition(
    probs: &mut [f32],
    probs_norecom: &mut [f32],
    template_gt: &[i8],
    observed: i8,
    err: f32,
    af: f32,
) {
    if observed < 0 {
        return;
    }
    let p_random = err * if observed == 1 { af } else { 1.0 - af };
    let p_match = (1.0 - err) + p_random;

    for u in 0..probs.len() {
        let factor = if template_gt[u] == observed {
            p_match
        } else {
            p_random
        };
        probs[u] *= factor;
        probs_norecom[u] *= factor;
        debug_assert!(probs[u] >= 0.0);
    }
}

/// The recombination transition in unique-template space: each chain stays
/// put with probability `1 - recom` or resamples uniformly over the
/// `n_templates` physical haplotypes. Returns true when an underflow
/// rescale ("precision jump") fired.
fn transpose(
    from: &[f32],
    to: &mut [f32],
    from_norecom: &[f32],
    to_norecom: &mut [f32],
    cardinalities: &[u64],
    recom: f64,
    n_templates: u64,
) -> bool {
    let mut sum: f64 = from.iter().map(|&p| p as f64).sum();
    let mut fix = 1.0f64;
    let jumped = sum < JUMP_THRESHOLD;
    if jumped {
        fix = JUMP_FIX;
        sum *= fix;
    }

    let complement = (1.0 - recom) * fix;
    let background = sum * recom / n_templates as f64;
    for u in 0..from.len() {
        to[u] = (from[u] as f64 * complement + background * cardinalities[u] as f64) as f32;
        to_norecom[u] = (from_norecom[u] as f64 * complement) as f32;
        debug_assert!(to[u] >= 0.0 && to[u].is_finite());
    }
    jumped
}

/// In-place variant of [`transpose`] for the backward vectors and block
/// junctions.
fn transpose_in_place(
    probs: &mut [f32],
    probs_norecom: &mut [f32],
    cardinalities: &[u64],
    recom: f64,
    n_templates: u64,
) -> bool {
    let mut sum: f64 = probs.iter().map(|&p| p as f64).sum();
    let mut fix = 1.0f64;
    let jumped = sum < JUMP_THRESHOLD;
    if jumped {
        fix = JUMP_FIX;
        sum *= fix;
    }

    let complement = (1.0 - recom) * fix;
    let background = sum * recom / n_templates as f64;
    for u in 0..probs.len() {
        probs[u] = (probs[u] as f64 * complement + background * cardinalities[u] as f64) as f32;
        probs_norecom[u] = (probs_norecom[u] as f64 * complement) as f32;
        debug_assert!(probs[u] >= 0.0 && probs[u].is_finite());
    }
    jumped
}

/// Mirror of [`HiddenMarkovModel::cross_junction_forward`] for the
/// backward state.
fn cross_junction_backward(
    src_block: &UniqueHaplotypeBlock,
    dst_block: &UniqueHaplotypeBlock,
    backward: &mut Vec<f32>,
    backward_norecom: &mut Vec<f32>,
    proportions: &mut [f32],
) {
    let src_map = src_block.unique_map();
    let dst_map = dst_block.unique_map();
    debug_assert_eq!(src_map.len(), dst_map.len());
    let src_card = src_block.cardinalities();
    let dst_card = dst_block.cardinalities();
    let n_dst = dst_block.unique_haplotype_size();

    let mut next = vec![0.0f32; n_dst];
    let mut next_norecom = vec![0.0f32; n_dst];
    for h in 0..src_map.len() {
        let (su, du) = (src_map[h], dst_map[h]);
        if su < 0 || du < 0 {
            continue;
        }
        let (su, du) = (su as usize, du as usize);
        next[du] += backward[su] / src_card[su] as f32;
        let mass = backward_norecom[su] * proportions[h];
        next_norecom[du] += mass;
        proportions[h] = mass;
    }
    normalize_proportions(proportions, dst_map, &next_norecom, dst_card);

    *backward = next;
    *backward_norecom = next_norecom;
}

/// Normalize junction proportions so they sum to 1 within each unique
/// template (guards against cumulative drift; falls back to uniform when a
/// template's non-recombinant mass underflowed to zero).
fn normalize_proportions(
    proportions: &mut [f32],
    map: &[i32],
    norecom: &[f32],
    cardinalities: &[u64],
) {
    for h in 0..map.len() {
        let u = map[h];
        if u < 0 {
            proportions[h] = 0.0;
            continue;
        }
        let u = u as usize;
        proportions[h] = if norecom[u] > 0.0 {
            proportions[h] / norecom[u]
        } else {
            1.0 / cardinalities[u] as f32
        };
    }
}

/// Posterior computation at typed site `row` plus dosage imputation of
/// every full-panel variant between this typed site and the previous one
/// (walking the cursor right-to-left).
#[allow(clippy::too_many_arguments)]
fn impute(
    scratch: &mut ReductionScratch,
    params: &HmmParams,
    row: usize,
    tar_variants: &[TargetVariant],
    hap_idx: usize,
    probs: &SiteProbs<'_>,
    cursor: &mut PanelCursor<'_>,
    output: &mut HaplotypeDosages,
) {
    let tv = &tar_variants[row];
    let observed = tv.gt[hap_idx];
    let err = if tv.err.is_nan() {
        params.background_error
    } else {
        tv.err
    };
    let af = tv.af;

    // Template posterior: forward times backward in expanded space. Both
    // vectors are template-aggregated masses, so the per-template product
    // carries one cardinality division.
    let mut prob_sum = 0.0f64;
    let mut p_alt = 0.0f64;
    for u in 0..probs.fwd.len() {
        if probs.cardinalities[u] == 0 {
            continue;
        }
        let p = probs.fwd[u] as f64 * probs.bwd[u] as f64 / probs.cardinalities[u] as f64;
        debug_assert!(p >= 0.0);
        prob_sum += p;
        if probs.template_gt[u] == 1 {
            p_alt += p;
        }
    }

    let (typed_dose, loo_dose) = if prob_sum > 0.0 {
        let dose = (p_alt / prob_sum) as f32;
        let loo = if observed >= 0 {
            // Undo this site's condition step: divide each template's mass
            // by the emission factor it received, then renormalize.
            let p_random = (err * if observed == 1 { af } else { 1.0 - af }) as f64;
            let p_match = (1.0 - err) as f64 + p_random;
            let mut loo_sum = 0.0f64;
            let mut loo_alt = 0.0f64;
            for u in 0..probs.fwd.len() {
                if probs.cardinalities[u] == 0 {
                    continue;
                }
                let emission = if probs.template_gt[u] == observed {
                    p_match
                } else {
                    p_random
                };
                if emission <= 0.0 {
                    continue;
                }
                let p = probs.fwd[u] as f64 * probs.bwd[u] as f64
                    / probs.cardinalities[u] as f64
                    / emission;
                loo_sum += p;
                if probs.template_gt[u] == 1 {
                    loo_alt += p;
                }
            }
            if loo_sum > 0.0 {
                (loo_alt / loo_sum) as f32
            } else {
                af
            }
        } else {
            dose
        };
        (dose, loo)
    } else {
        (af, af)
    };
    output.loo_dosages[row] = bin_dosage(loo_dose);

    // S3: templates whose normalized posterior clears the threshold.
    scratch.best_s3_haps.clear();
    scratch.best_s3_probs.clear();
    let mut argmax = (0u32, -1.0f32);
    for u in 0..probs.fwd.len() {
        if probs.cardinalities[u] == 0 || prob_sum <= 0.0 {
            continue;
        }
        let p = (probs.fwd[u] as f64 * probs.bwd[u] as f64
            / probs.cardinalities[u] as f64
            / prob_sum) as f32;
        if p > argmax.1 {
            argmax = (u as u32, p);
        }
        if p >= params.prob_threshold {
            scratch.best_s3_haps.push(u as u32);
            scratch.best_s3_probs.push(p);
        }
    }
    if scratch.best_s3_haps.is_empty() && argmax.1 >= 0.0 {
        scratch.best_s3_haps.push(argmax.0);
        scratch.best_s3_probs.push(argmax.1);
    }

    // Confident-template fast path: a single survivor that also dominated
    // the previous typed site keeps the prior expanded state.
    let mut refresh = true;
    if scratch.best_s3_haps.len() == 1 {
        let u = scratch.best_s3_haps[0] as usize;
        let p = scratch.best_s3_probs[0];
        let rep = probs.reverse_map[u].first().copied();
        if let (Some(rep), Some((prev_rep, prev_p))) = (rep, scratch.prev_best) {
            if rep == prev_rep && (p - prev_p).abs() < params.diff_threshold {
                refresh = false;
            }
        }
        scratch.prev_best = rep.map(|r| (r, p));
    } else {
        scratch.prev_best = None;
    }

    if refresh || scratch.best_s1_haps.is_empty() {
        s3_to_s1_probs(scratch, params, probs, prob_sum);
        scratch.s2_block = None;
    }
    let s1_sum: f64 = scratch.best_s1_probs.iter().map(|&p| p as f64).sum();

    // Walk the full panel right-to-left down to (and through) this typed
    // site; everything at or below the previous typed position waits for
    // the next call.
    let stop_pos = if row > 0 {
        Some(tar_variants[row - 1].pos)
    } else {
        None
    };
    let last_typed = tar_variants.last().expect("nonempty target");
    let first_typed = &tar_variants[0];

    while !cursor.is_done() {
        let variant = cursor.variant();
        if let Some(stop) = stop_pos {
            if variant.site.pos <= stop {
                break;
            }
        }

        if tv.same_site(&variant.site) {
            output.dosages[cursor.global_idx()] = bin_dosage(typed_dose);
            cursor.retreat();
            continue;
        }

        let block = cursor.block();
        if scratch.s2_block != Some(cursor.block_idx()) {
            s1_to_s2_probs(scratch, block.unique_map(), block.unique_haplotype_size());
            scratch.s2_block = Some(cursor.block_idx());
        }

        let total = block.total_cardinality();
        let af_here = if total > 0 {
            variant.ac as f32 / total as f32
        } else {
            0.0
        };

        let mut dose = if s1_sum > 0.0 {
            let mut alt_mass = 0.0f64;
            for (k, &u) in scratch.best_s2_haps.iter().enumerate() {
                if variant.gt[u as usize] == 1 {
                    alt_mass += scratch.best_s2_probs[k] as f64;
                }
            }
            (alt_mass / s1_sum) as f32
        } else {
            af_here
        };

        // Outside the typed span, confidence decays with genetic distance
        // to the nearest typed anchor and the dosage is pulled toward the
        // panel allele frequency.
        if params.decay > 0.0 {
            let distance = if variant.site.pos > last_typed.pos {
                variant.site.cm - last_typed.cm
            } else if variant.site.pos < first_typed.pos {
                first_typed.cm - variant.site.cm
            } else {
                0.0
            };
            if distance.is_finite() && distance > 0.0 {
                let weight = cm_to_switch_prob_decay(distance, params.decay) as f32;
                dose = dose * (1.0 - weight) + af_here * weight;
            }
        }

        debug_assert!((0.0f32..=1.0 + 1e-5).contains(&dose));
        output.dosages[cursor.global_idx()] = bin_dosage(dose);
        cursor.retreat();
    }
}

/// Expand the S3 survivors to physical haplotypes. Recombinant mass
/// spreads uniformly within a template; non-recombinant mass follows the
/// product of forward and backward junction proportions.
fn s3_to_s1_probs(
    scratch: &mut ReductionScratch,
    params: &HmmParams,
    probs: &SiteProbs<'_>,
    prob_sum: f64,
) {
    scratch.best_s1_haps.clear();
    scratch.best_s1_probs.clear();
    if prob_sum <= 0.0 {
        return;
    }

    let threshold = params.s1_prob_threshold;
    for &u in &scratch.best_s3_haps {
        let u = u as usize;
        let cardinality = probs.cardinalities[u] as f64;
        let fb = probs.fwd[u] as f64 * probs.bwd[u] as f64;
        let fb_norecom = probs.constants[u] as f64;
        let uniform = (fb - fb_norecom).max(0.0) / (cardinality * cardinality);

        for &h in &probs.reverse_map[u] {
            let jp = probs.jp_left[h as usize] as f64 * probs.jp_right[h as usize] as f64;
            let p = ((uniform + fb_norecom * jp) / prob_sum) as f32;
            if threshold < 0.0 || p >= threshold {
                scratch.best_s1_haps.push(h);
                scratch.best_s1_probs.push(p);
            }
        }
    }

    // Thresholding must never leave the dosage kernel empty-handed.
    if scratch.best_s1_haps.is_empty() {
        let u = scratch.best_s3_haps[0] as usize;
        let p = scratch.best_s3_probs[0] / probs.reverse_map[u].len().max(1) as f32;
        for &h in &probs.reverse_map[u] {
            scratch.best_s1_haps.push(h);
            scratch.best_s1_probs.push(p);
        }
    }
}

/// Fold the selected physical haplotypes into the unique templates of the
/// full-panel block covering the untyped sites.
fn s1_to_s2_probs(scratch: &mut ReductionScratch, unique_map: &[i32], s2_size: usize) {
    scratch.s2_probs.clear();
    scratch.s2_probs.resize(s2_size, 0.0);
    scratch.s2_cardinalities.clear();
    scratch.s2_cardinalities.resize(s2_size, 0);
    scratch.best_s2_haps.clear();
    scratch.best_s2_probs.clear();

    for (k, &h) in scratch.best_s1_haps.iter().enumerate() {
        let u = unique_map[h as usize];
        if u < 0 {
            continue;
        }
        scratch.s2_probs[u as usize] += scratch.best_s1_probs[k];
        scratch.s2_cardinalities[u as usize] += 1;
    }
    for u in 0..s2_size {
        if scratch.s2_cardinalities[u] > 0 {
            scratch.best_s2_haps.push(u as u32);
            scratch.best_s2_probs.push(scratch.s2_probs[u]);
        }
    }
    debug_assert_eq!(
        scratch.s2_cardinalities.iter().map(|&c| c as usize).sum::<usize>(),
        scratch
            .best_s1_haps
            .iter()
            .filter(|&&h| unique_map[h as usize] >= 0)
            .count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variant::{ReferenceSiteInfo, GT_MISSING};
    use std::sync::Arc;

    fn site(pos: u32) -> ReferenceSiteInfo {
        let mut s = ReferenceSiteInfo::new(
            Arc::from("chr1"),
            pos,
            format!("v{}", pos),
            "A".into(),
            "C".into(),
        );
        s.err = 1e-5;
        s.recom = 0.0;
        s.cm = pos as f64 * 1e-6;
        s
    }

    /// Panel with one block over `rows[v][h]` alleles.
    fn build_panel(rows: &[Vec<i8>]) -> ReducedHaplotypes {
        let mut block = UniqueHaplotypeBlock::default();
        for (i, alleles) in rows.iter().enumerate() {
            assert!(block.compress_variant(&site((i as u32 + 1) * 100), alleles));
        }
        let mut panel = ReducedHaplotypes::default();
        panel.append_block(block);
        panel
    }

    fn target_sites_for(panel: &ReducedHaplotypes, gts: &[Vec<i8>], recoms: &[f32]) -> Vec<TargetVariant> {
        let mut out = Vec::new();
        let mut i = 0;
        for block in panel.blocks() {
            for v in block.variants() {
                let total = block.total_cardinality();
                out.push(TargetVariant {
                    chrom: v.site.chrom.clone(),
                    pos: v.site.pos,
                    id: v.site.id.clone(),
                    ref_allele: v.site.ref_allele.clone(),
                    alt_allele: v.site.alt_allele.clone(),
                    in_tar: true,
                    in_ref: true,
                    af: v.ac as f32 / total as f32,
                    err: 1e-5,
                    recom: recoms[i],
                    cm: v.site.cm,
                    gt: gts[i].clone(),
                });
                i += 1;
            }
        }
        out
    }

    fn reverse_maps_for(panel: &ReducedHaplotypes) -> Vec<Vec<Vec<u32>>> {
        panel
            .blocks()
            .iter()
            .map(|b| {
                let mut maps = vec![Vec::new(); b.unique_haplotype_size()];
                for (h, &u) in b.unique_map().iter().enumerate() {
                    if u >= 0 {
                        maps[u as usize].push(h as u32);
                    }
                }
                maps
            })
            .collect()
    }

    fn run_haplotype(panel: &ReducedHaplotypes, sites: &[TargetVariant], hap: usize) -> HaplotypeDosages {
        let mut hmm = HiddenMarkovModel::new(0.01, -1.0, 0.01, 1e-5, 0.0);
        let mut out = HaplotypeDosages {
            dosages: vec![0.0; panel.variant_size()],
            loo_dosages: vec![0.0; sites.len()],
        };
        let reverse_maps = reverse_maps_for(panel);
        hmm.traverse_forward(panel.blocks(), sites, hap);
        hmm.traverse_backward(panel.blocks(), sites, hap, &reverse_maps, panel, &mut out);
        out
    }

    #[test]
    fn test_condition_keeps_probs_nonnegative() {
        let mut probs = vec![0.3, 0.7];
        let mut norecom = vec![0.3, 0.7];
        condition(&mut probs, &mut norecom, &[0, 1], 1, 1e-5, 0.25);
        assert!(probs.iter().all(|&p| p >= 0.0));
        assert!(probs[1] > probs[0]);

        // Missing observation leaves the vectors untouched.
        let before = probs.clone();
        condition(&mut probs, &mut norecom, &[0, 1], GT_MISSING, 1e-5, 0.25);
        assert_eq!(probs, before);
    }

    #[test]
    fn test_transpose_preserves_mass() {
        let from = vec![0.2f32, 0.6, 0.2];
        let mut to = vec![0.0f32; 3];
        let from_nr = from.clone();
        let mut to_nr = vec![0.0f32; 3];
        let cards = vec![2u64, 1, 1];
        let jumped = transpose(&from, &mut to, &from_nr, &mut to_nr, &cards, 0.3, 4);
        assert!(!jumped);
        let before: f32 = from.iter().sum();
        let after: f32 = to.iter().sum();
        assert!((before - after).abs() < 1e-6);
        // No-recombination mass only shrinks.
        assert!(to_nr.iter().zip(&from_nr).all(|(&a, &b)| a <= b));
    }

    #[test]
    fn test_transpose_jump_rescales() {
        let from = vec![1e-12f32, 1e-12];
        let mut to = vec![0.0f32; 2];
        let from_nr = from.clone();
        let mut to_nr = vec![0.0f32; 2];
        let jumped = transpose(&from, &mut to, &from_nr, &mut to_nr, &[1, 1], 0.01, 2);
        assert!(jumped);
        let after: f64 = to.iter().map(|&p| p as f64).sum();
        let scaled: f64 = 2e-12 * JUMP_FIX;
        assert!((after - scaled).abs() / scaled < 1e-5);
    }

    #[test]
    fn test_degenerate_single_template() {
        // One unique haplotype carrying alt everywhere: dosage 1.0 at every
        // variant; leave-one-out with a single template is 1.0.
        let rows = vec![vec![1, 1]; 5];
        let panel = build_panel(&rows);
        let gts: Vec<Vec<i8>> = (0..5)
            .map(|i| if i == 2 { vec![1, 1] } else { vec![GT_MISSING, GT_MISSING] })
            .collect();
        let sites = target_sites_for(&panel, &gts, &[0.01, 0.01, 0.01, 0.01, 0.0]);
        let out = run_haplotype(&panel, &sites, 0);
        for &d in &out.dosages {
            assert_eq!(d, 1.0);
        }
        assert_eq!(out.loo_dosages[2], 1.0);
    }

    #[test]
    fn test_no_recom_limit_matches_observed_template() {
        // Two opposite templates, no recombination, observations at the
        // ends pick the all-alt template everywhere.
        let rows = vec![vec![0, 1]; 5];
        let panel = build_panel(&rows);
        let gts: Vec<Vec<i8>> = (0..5)
            .map(|i| {
                if i == 0 || i == 4 {
                    vec![1]
                } else {
                    vec![GT_MISSING]
                }
            })
            .collect();
        let sites = target_sites_for(&panel, &gts, &[0.0; 5]);
        let out = run_haplotype(&panel, &sites, 0);
        for &d in &out.dosages {
            assert!((d - 1.0).abs() <= 1e-4, "dose {} not ~1", d);
        }
    }

    #[test]
    fn test_full_recombination_splits_mass() {
        // Opposite observations at the ends with free recombination on
        // both sides of the midpoint: the midpoint is undecided while the
        // ends follow their observations.
        let rows = vec![vec![0, 1]; 5];
        let panel = build_panel(&rows);
        let gts = vec![
            vec![1],
            vec![GT_MISSING],
            vec![GT_MISSING],
            vec![GT_MISSING],
            vec![0],
        ];
        let sites = target_sites_for(&panel, &gts, &[0.0, 0.5, 0.5, 0.0, 0.0]);
        let out = run_haplotype(&panel, &sites, 0);
        assert!((out.dosages[2] - 0.5).abs() <= 0.1, "dose {}", out.dosages[2]);
        assert!(out.dosages[0] > 0.9);
        assert!(out.dosages[4] < 0.1);
    }

    #[test]
    fn test_single_break_keeps_downstream_linkage() {
        // With only one free-recombination interval, the midpoint stays
        // linked to the observation on its own side of the break.
        let rows = vec![vec![0, 1]; 5];
        let panel = build_panel(&rows);
        let gts = vec![
            vec![1],
            vec![GT_MISSING],
            vec![GT_MISSING],
            vec![GT_MISSING],
            vec![0],
        ];
        let sites = target_sites_for(&panel, &gts, &[0.0, 0.5, 0.0, 0.0, 0.0]);
        let out = run_haplotype(&panel, &sites, 0);
        assert!(out.dosages[2] < 0.1, "dose {}", out.dosages[2]);
    }

    #[test]
    fn test_leave_one_out_excludes_own_observation() {
        // Reference: two copies of the target allele plus one unrelated
        // haplotype, one typed site. With its own observation divided out,
        // the LOO dosage falls back to the panel posterior (2/3) while the
        // full dosage stays driven by the observation.
        let rows = vec![vec![1, 1, 0]];
        let panel = build_panel(&rows);
        let gts = vec![vec![1]];
        let sites = target_sites_for(&panel, &gts, &[0.0]);
        let out = run_haplotype(&panel, &sites, 0);
        let loo = out.loo_dosages[0];
        assert!((0.5..1.0).contains(&loo), "loo {}", loo);
        assert!((loo - 2.0 / 3.0).abs() < 1e-3);
        assert!(out.dosages[0] > loo);
    }

    #[test]
    fn test_full_panel_blocking_does_not_change_dosages() {
        // Cutting the *full* reference panel into blocks at different
        // points must not change any dosage: the S2 fold regroups the same
        // selected haplotypes whichever way the untyped blocks are cut.
        let full_rows: Vec<Vec<i8>> = vec![
            vec![0, 1, 1, 0],
            vec![0, 1, 0, 0],
            vec![1, 1, 0, 1],
            vec![0, 0, 0, 1],
            vec![0, 1, 1, 1],
            vec![1, 1, 0, 0],
        ];
        // Typed sites are variants 0, 2, 5; the typed panel is compressed
        // independently of the full panel's blocking.
        let typed_idx = [0usize, 2, 5];
        let mut typed = ReducedHaplotypes::default();
        let mut typed_block = UniqueHaplotypeBlock::default();
        for &i in &typed_idx {
            typed_block.compress_variant(&site((i as u32 + 1) * 100), &full_rows[i]);
        }
        typed.append_block(typed_block);

        let gts = vec![vec![0], vec![1], vec![1]];
        let sites = target_sites_for(&typed, &gts, &[0.02, 0.03, 0.0]);
        let reverse_maps = reverse_maps_for(&typed);

        let mut outputs = Vec::new();
        for split in [2usize, 3] {
            let mut full = ReducedHaplotypes::default();
            let mut first = UniqueHaplotypeBlock::default();
            for (i, r) in full_rows[..split].iter().enumerate() {
                first.compress_variant(&site((i as u32 + 1) * 100), r);
            }
            let mut second = UniqueHaplotypeBlock::default();
            for (i, r) in full_rows[split..].iter().enumerate() {
                second.compress_variant(&site((split as u32 + i as u32 + 1) * 100), r);
            }
            full.append_block(first);
            full.append_block(second);

            let mut hmm = HiddenMarkovModel::new(0.01, -1.0, 0.01, 1e-5, 0.0);
            let mut out = HaplotypeDosages {
                dosages: vec![0.0; full.variant_size()],
                loo_dosages: vec![0.0; sites.len()],
            };
            hmm.traverse_forward(typed.blocks(), &sites, 0);
            hmm.traverse_backward(typed.blocks(), &sites, 0, &reverse_maps, &full, &mut out);
            outputs.push(out);
        }

        for (a, b) in outputs[0].dosages.iter().zip(&outputs[1].dosages) {
            assert!((a - b).abs() <= 1e-6, "split mismatch {} vs {}", a, b);
        }
    }

    #[test]
    fn test_precision_jumps_recover_underflow() {
        // Alternating observations against two complementary templates
        // force a template switch at every site, draining probability mass
        // under the jump threshold; the rescale is recorded and the
        // dosages stay finite.
        let n = 10usize;
        let rows = vec![vec![0, 1]; n];
        let panel = build_panel(&rows);
        let gts: Vec<Vec<i8>> = (0..n).map(|i| vec![(i % 2) as i8]).collect();
        let mut recoms = vec![0.01f32; n];
        recoms[n - 1] = 0.0;
        let sites = target_sites_for(&panel, &gts, &recoms);

        let mut hmm = HiddenMarkovModel::new(0.01, -1.0, 0.01, 1e-5, 0.0);
        hmm.traverse_forward(panel.blocks(), &sites, 0);
        assert!(
            hmm.precision_jumps().any(),
            "expected at least one underflow rescale"
        );

        let mut out = HaplotypeDosages {
            dosages: vec![0.0; panel.variant_size()],
            loo_dosages: vec![0.0; sites.len()],
        };
        let reverse_maps = reverse_maps_for(&panel);
        hmm.traverse_backward(panel.blocks(), &sites, 0, &reverse_maps, &panel, &mut out);
        for &d in &out.dosages {
            assert!(d.is_finite() && (0.0..=1.0).contains(&d));
        }
    }

    #[test]
    fn test_permuting_reference_haplotypes_preserves_dosages() {
        let rows: Vec<Vec<i8>> = vec![
            vec![0, 1, 1, 0],
            vec![0, 1, 0, 1],
            vec![1, 1, 0, 0],
            vec![0, 0, 1, 1],
        ];
        let permutation = [2usize, 0, 3, 1];
        let permuted: Vec<Vec<i8>> = rows
            .iter()
            .map(|r| permutation.iter().map(|&h| r[h]).collect())
            .collect();

        let gts = vec![vec![0], vec![1], vec![GT_MISSING], vec![1]];
        let recoms = [0.02, 0.05, 0.01, 0.0];

        let mut outputs = Vec::new();
        for rows in [&rows, &permuted] {
            let panel = build_panel(rows);
            let sites = target_sites_for(&panel, &gts, &recoms);
            outputs.push(run_haplotype(&panel, &sites, 0));
        }
        for (a, b) in outputs[0].dosages.iter().zip(&outputs[1].dosages) {
            assert!((a - b).abs() <= 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_vanishing_thresholds_reach_exact_posterior() {
        // Full panel of 4 variants; variant 2 is untyped, so its dosage
        // goes through the S3 → S1 → S2 reduction where the thresholds
        // actually bite.
        let full_rows: Vec<Vec<i8>> = vec![
            vec![0, 1, 1, 0],
            vec![0, 1, 0, 1],
            vec![1, 1, 0, 0],
            vec![0, 0, 1, 1],
        ];
        let full = build_panel(&full_rows);
        let typed_idx = [0usize, 1, 3];
        let mut typed_block = UniqueHaplotypeBlock::default();
        for &i in &typed_idx {
            typed_block.compress_variant(&site((i as u32 + 1) * 100), &full_rows[i]);
        }
        let mut typed = ReducedHaplotypes::default();
        typed.append_block(typed_block);

        let gts = vec![vec![0], vec![1], vec![1]];
        let sites = target_sites_for(&typed, &gts, &[0.1, 0.1, 0.0]);
        let reverse_maps = reverse_maps_for(&typed);

        let run_with = |threshold: f32| {
            let mut hmm = HiddenMarkovModel::new(threshold, -1.0, 0.0, 1e-5, 0.0);
            let mut out = HaplotypeDosages {
                dosages: vec![0.0; full.variant_size()],
                loo_dosages: vec![0.0; sites.len()],
            };
            hmm.traverse_forward(typed.blocks(), &sites, 0);
            hmm.traverse_backward(typed.blocks(), &sites, 0, &reverse_maps, &full, &mut out);
            out
        };

        // A tiny threshold can only drop templates of negligible mass, so
        // the untyped dosage converges onto the exact (threshold 0)
        // computation; a coarse threshold is allowed to deviate.
        let exact = run_with(0.0);
        let tiny = run_with(1e-4);
        for (a, b) in exact.dosages.iter().zip(&tiny.dosages) {
            assert!((a - b).abs() <= 2e-3, "{} vs {}", a, b);
        }
        let coarse = run_with(0.45);
        assert!(coarse.dosages.iter().all(|d| (0.0..=1.0).contains(d)));
    }

    #[test]
    fn test_untyped_sites_imputed_between_typed() {
        // Typed panel covers variants 0 and 2 of a 3-variant full panel;
        // the middle untyped site follows the matched template.
        let full_rows = vec![vec![0, 1], vec![0, 1], vec![0, 1]];
        let full = build_panel(&full_rows);
        let typed_rows = vec![vec![0, 1], vec![0, 1]];
        let mut typed_block = UniqueHaplotypeBlock::default();
        typed_block.compress_variant(&site(100), &typed_rows[0]);
        typed_block.compress_variant(&site(300), &typed_rows[1]);
        let mut typed = ReducedHaplotypes::default();
        typed.append_block(typed_block);

        let gts = vec![vec![1], vec![1]];
        let sites = target_sites_for(&typed, &gts, &[0.01, 0.0]);

        let mut hmm = HiddenMarkovModel::new(0.01, -1.0, 0.01, 1e-5, 0.0);
        let mut out = HaplotypeDosages {
            dosages: vec![0.0; full.variant_size()],
            loo_dosages: vec![0.0; sites.len()],
        };
        let reverse_maps = reverse_maps_for(&typed);
        hmm.traverse_forward(typed.blocks(), &sites, 0);
        hmm.traverse_backward(typed.blocks(), &sites, 0, &reverse_maps, &full, &mut out);

        assert!(out.dosages[0] > 0.99);
        assert!(out.dosages[1] > 0.99, "untyped dose {}", out.dosages[1]);
        assert!(out.dosages[2] > 0.99);
    }
}
