//! # Unique-Haplotype Blocks
//!
//! The block-compressed representation of a phased reference panel. A block
//! covers a run of consecutive variants over which many haplotypes carry
//! identical allele substrings; identical haplotypes collapse into a single
//! "unique template" column and a per-block `expanded → unique` map.
//!
//! [`ReducedHaplotypes`] strings blocks together with cumulative offsets and
//! provides a bidirectional cursor over the concatenated variants.

use std::collections::HashMap;

use crate::data::genetic_map::{switch_prob_to_cm, GeneticMapFile};
use crate::data::variant::{ReferenceSiteInfo, ReferenceVariant, GT_EOV};

/// Sentinel in the expanded→unique map for haplotype slots that do not
/// exist (uneven ploidy across reference samples).
pub const UNIQUE_EOV: i32 = -1;

/// A block of consecutive variants sharing one expanded→unique map.
#[derive(Clone, Debug, Default)]
pub struct UniqueHaplotypeBlock {
    /// For each expanded haplotype, the unique template column it belongs
    /// to, or [`UNIQUE_EOV`].
    unique_map: Vec<i32>,
    /// Number of expanded haplotypes per unique template column.
    cardinalities: Vec<u64>,
    variants: Vec<ReferenceVariant>,
}

impl UniqueHaplotypeBlock {
    pub fn variants(&self) -> &[ReferenceVariant] {
        &self.variants
    }

    pub fn unique_map(&self) -> &[i32] {
        &self.unique_map
    }

    pub fn cardinalities(&self) -> &[u64] {
        &self.cardinalities
    }

    /// Number of expanded haplotype slots (including end-of-vector slots).
    pub fn expanded_haplotype_size(&self) -> usize {
        self.unique_map.len()
    }

    /// Number of expanded haplotypes that actually exist
    /// (`Σ cardinalities[u]`; constant across all blocks of a panel).
    pub fn total_cardinality(&self) -> u64 {
        self.cardinalities.iter().sum()
    }

    /// Number of unique template columns.
    pub fn unique_haplotype_size(&self) -> usize {
        self.cardinalities.len()
    }

    pub fn variant_size(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn clear(&mut self) {
        self.unique_map.clear();
        self.cardinalities.clear();
        self.variants.clear();
    }

    /// Construct a block directly from its parts (used by the reference
    /// reader, which gets the map and template genotypes off disk).
    pub fn from_parts(unique_map: Vec<i32>, variants: Vec<ReferenceVariant>) -> Self {
        let mut block = Self {
            unique_map,
            cardinalities: Vec::new(),
            variants,
        };
        block.rebuild_cardinalities();
        for v in &mut block.variants {
            v.ac = allele_count(&v.gt, &block.cardinalities);
        }
        block
    }

    fn rebuild_cardinalities(&mut self) {
        let n_cols = self
            .unique_map
            .iter()
            .filter(|&&u| u >= 0)
            .map(|&u| u as usize + 1)
            .max()
            .unwrap_or(0);
        self.cardinalities = vec![0; n_cols];
        for &u in &self.unique_map {
            if u >= 0 {
                self.cardinalities[u as usize] += 1;
            }
        }
    }

    /// Fold one more variant into the block, splitting template columns
    /// where previously-identical haplotypes now differ.
    ///
    /// The first call seeds the columns from the distinct alleles observed;
    /// later calls keep each haplotype in its column while the alleles
    /// agree, and move it to a (possibly fresh) column on disagreement. The
    /// new column replays the old column's alleles for every earlier
    /// variant, so the block stays consistent.
    ///
    /// Returns false on ploidy mismatches or a changed haplotype count;
    /// the block is left untouched in that case.
    pub fn compress_variant(&mut self, site: &ReferenceSiteInfo, alleles: &[i8]) -> bool {
        if alleles.is_empty() {
            return false;
        }

        if self.unique_map.is_empty() {
            let mut allele_to_col: HashMap<i8, i32> = HashMap::new();
            let mut gt = Vec::new();
            self.unique_map = Vec::with_capacity(alleles.len());
            for &a in alleles {
                if a == GT_EOV {
                    self.unique_map.push(UNIQUE_EOV);
                    continue;
                }
                let next = gt.len() as i32;
                let col = *allele_to_col.entry(a).or_insert_with(|| {
                    gt.push(a);
                    next
                });
                self.unique_map.push(col);
            }
            self.rebuild_cardinalities();
            let ac = allele_count(&gt, &self.cardinalities);
            self.variants
                .push(ReferenceVariant::new(site.clone(), ac, gt));
            return true;
        }

        if alleles.len() != self.unique_map.len() {
            return false;
        }

        let n_cols = self.unique_haplotype_size();
        let mut this_gt: Vec<i8> = vec![0; n_cols];
        let mut seeded = vec![false; n_cols];
        // (old column, allele) -> column carrying that allele at this variant
        let mut split_cols: HashMap<(usize, i8), usize> = HashMap::new();

        for h in 0..alleles.len() {
            let mapped = self.unique_map[h];
            let a = alleles[h];
            if mapped == UNIQUE_EOV {
                if a != GT_EOV {
                    return false; // sample ploidy changed mid-panel
                }
                continue;
            }
            if a == GT_EOV {
                return false;
            }
            let u = mapped as usize;
            if !seeded[u] {
                seeded[u] = true;
                this_gt[u] = a;
            } else if this_gt[u] != a {
                let col = match split_cols.get(&(u, a)) {
                    Some(&col) => col,
                    None => {
                        for v in &mut self.variants {
                            let g = v.gt[u];
                            v.gt.push(g);
                        }
                        this_gt.push(a);
                        let col = this_gt.len() - 1;
                        split_cols.insert((u, a), col);
                        col
                    }
                };
                self.unique_map[h] = col as i32;
            }
        }

        self.rebuild_cardinalities();
        // Splitting a column never changes earlier allele counts: the clone
        // replays the source column's alleles, so prior `ac` values stand.
        let ac = allele_count(&this_gt, &self.cardinalities);
        self.variants
            .push(ReferenceVariant::new(site.clone(), ac, this_gt));
        true
    }

    /// Drop variants outside `[min_pos, max_pos]`. Only `variants` shrinks;
    /// the map and cardinalities are unchanged.
    pub fn trim(&mut self, min_pos: u32, max_pos: u32) {
        self.variants
            .retain(|v| v.site.pos >= min_pos && v.site.pos <= max_pos);
        if self.variants.is_empty() {
            self.clear();
        }
    }

    /// Remove the most recently added variant.
    pub fn pop_variant(&mut self) {
        self.variants.pop();
    }

    /// Fill each variant's centimorgan position from a genetic map.
    pub fn fill_cm(&mut self, map_file: &mut GeneticMapFile) {
        for v in &mut self.variants {
            v.site.cm = map_file.interpolate_centimorgan(v.site.pos as u64);
        }
    }

    /// Fill missing centimorgan values by accumulating the per-site
    /// recombination annotations, starting at `start_cm`.
    pub fn fill_cm_from_recom(&mut self, start_cm: &mut f64) {
        for v in &mut self.variants {
            if v.site.cm.is_nan() {
                v.site.cm = *start_cm;
            } else {
                *start_cm = v.site.cm;
            }
            if v.site.recom.is_finite() && v.site.recom > 0.0 {
                *start_cm += switch_prob_to_cm(v.site.recom as f64);
            }
        }
    }

    /// Drop end-of-vector slots from the expanded map.
    pub fn remove_eov(&mut self) {
        self.unique_map.retain(|&u| u != UNIQUE_EOV);
    }

    /// Restrict the block to the expanded haplotypes in `keep` (indices into
    /// the current expanded map), recomputing cardinalities and allele
    /// counts. Template columns may drop to cardinality zero.
    pub fn subset_haplotypes(&mut self, keep: &[usize]) {
        self.unique_map = keep.iter().map(|&h| self.unique_map[h]).collect();
        self.rebuild_cardinalities();
        for v in &mut self.variants {
            v.gt.truncate(self.cardinalities.len());
            v.ac = allele_count(&v.gt, &self.cardinalities);
        }
    }
}

fn allele_count(gt: &[i8], cardinalities: &[u64]) -> u64 {
    gt.iter()
        .zip(cardinalities)
        .map(|(&g, &c)| if g == 1 { c } else { 0 })
        .sum()
}

/// An ordered sequence of blocks with cumulative variant offsets.
#[derive(Clone, Debug)]
pub struct ReducedHaplotypes {
    block_offsets: Vec<usize>,
    blocks: Vec<UniqueHaplotypeBlock>,
    variant_count: usize,
    min_block_size: usize,
    max_block_size: usize,
    flush_block: bool,
}

impl Default for ReducedHaplotypes {
    fn default() -> Self {
        Self::new(1, usize::MAX)
    }
}

impl ReducedHaplotypes {
    pub fn new(min_block_size: usize, max_block_size: usize) -> Self {
        Self {
            block_offsets: Vec::new(),
            blocks: Vec::new(),
            variant_count: 0,
            min_block_size: min_block_size.max(1),
            max_block_size: max_block_size.max(1),
            flush_block: true,
        }
    }

    pub fn blocks(&self) -> &[UniqueHaplotypeBlock] {
        &self.blocks
    }

    pub fn block_offsets(&self) -> &[usize] {
        &self.block_offsets
    }

    pub fn variant_size(&self) -> usize {
        self.variant_count
    }

    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Compress a variant into the current tail block, opening a new block
    /// when requested (or forced by the size cap). Returns false when the
    /// tail block rejects the variant.
    pub fn compress_variant(
        &mut self,
        site: &ReferenceSiteInfo,
        alleles: &[i8],
        flush_block: bool,
    ) -> bool {
        if flush_block || self.flush_block {
            self.flush_block = false;
            self.block_offsets.push(self.variant_count);
            self.blocks.push(UniqueHaplotypeBlock::default());
        } else if let Some(last) = self.blocks.last() {
            if last.variant_size() >= self.max_block_size {
                self.block_offsets.push(self.variant_count);
                self.blocks.push(UniqueHaplotypeBlock::default());
            }
        }

        let block = self.blocks.last_mut().expect("tail block exists");
        if !block.compress_variant(site, alleles) {
            return false;
        }
        self.variant_count += 1;
        true
    }

    /// Request that the next compressed variant opens a new block (honored
    /// only once the current block holds `min_block_size` variants).
    pub fn flush_block(&mut self) {
        if self
            .blocks
            .last()
            .map(|b| b.variant_size() >= self.min_block_size)
            .unwrap_or(true)
        {
            self.flush_block = true;
        }
    }

    /// Append a pre-built block. If its first variant repeats the previous
    /// block's last variant (blocks on disk overlap by one), the duplicate
    /// is dropped from the previous block.
    pub fn append_block(&mut self, block: UniqueHaplotypeBlock) {
        if block.is_empty() {
            return;
        }
        if let Some(prev) = self.blocks.last_mut() {
            if let (Some(last), Some(first)) = (prev.variants().last(), block.variants().first()) {
                if last.site.pos == first.site.pos
                    && last.site.ref_allele == first.site.ref_allele
                    && last.site.alt_allele == first.site.alt_allele
                {
                    prev.pop_variant();
                    self.variant_count -= 1;
                    if prev.is_empty() {
                        self.blocks.pop();
                        self.block_offsets.pop();
                    }
                }
            }
        }
        self.block_offsets.push(self.variant_count);
        self.variant_count += block.variant_size();
        self.blocks.push(block);
    }

    /// Fill centimorgan positions across all blocks from a genetic map.
    pub fn fill_cm(&mut self, map_file: &mut GeneticMapFile) {
        for block in &mut self.blocks {
            block.fill_cm(map_file);
        }
    }

    /// Fill missing centimorgan positions from recombination annotations.
    pub fn fill_cm_from_recom(&mut self) {
        let mut start_cm = 0.0;
        for block in &mut self.blocks {
            block.fill_cm_from_recom(&mut start_cm);
        }
    }

    /// `(Σ expanded + Σ unique·variants) / (Σ expanded·variants)`
    pub fn compression_ratio(&self) -> f32 {
        let mut numerator = 0usize;
        let mut denominator = 0usize;
        for b in &self.blocks {
            numerator += b.expanded_haplotype_size() + b.unique_haplotype_size() * b.variant_size();
            denominator += b.expanded_haplotype_size() * b.variant_size();
        }
        if denominator == 0 {
            0.0
        } else {
            numerator as f32 / denominator as f32
        }
    }

    /// The variant at a global index.
    pub fn variant(&self, global_idx: usize) -> &ReferenceVariant {
        let block_idx = self.block_offsets.partition_point(|&o| o <= global_idx) - 1;
        &self.blocks[block_idx].variants()[global_idx - self.block_offsets[block_idx]]
    }

    /// Cursor positioned on the last variant (for reverse traversal).
    pub fn cursor_at_last(&self) -> PanelCursor<'_> {
        let done = self.variant_count == 0;
        let block_idx = self.blocks.len().saturating_sub(1);
        let local_idx = self
            .blocks
            .last()
            .map(|b| b.variant_size().saturating_sub(1))
            .unwrap_or(0);
        PanelCursor {
            panel: self,
            block_idx,
            local_idx,
            done,
        }
    }

    /// Cursor positioned on the first variant (for forward traversal).
    pub fn cursor_at_first(&self) -> PanelCursor<'_> {
        PanelCursor {
            panel: self,
            block_idx: 0,
            local_idx: 0,
            done: self.variant_count == 0,
        }
    }
}

/// Bidirectional cursor over the variants of a [`ReducedHaplotypes`],
/// addressed as `(block_idx, local_idx)` and yielding a global index.
pub struct PanelCursor<'a> {
    panel: &'a ReducedHaplotypes,
    block_idx: usize,
    local_idx: usize,
    done: bool,
}

impl<'a> PanelCursor<'a> {
    /// True once the cursor has moved past either end of the panel.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn block_idx(&self) -> usize {
        self.block_idx
    }

    pub fn local_idx(&self) -> usize {
        self.local_idx
    }

    pub fn global_idx(&self) -> usize {
        self.panel.block_offsets[self.block_idx] + self.local_idx
    }

    pub fn block(&self) -> &'a UniqueHaplotypeBlock {
        &self.panel.blocks[self.block_idx]
    }

    pub fn variant(&self) -> &'a ReferenceVariant {
        &self.block().variants()[self.local_idx]
    }

    /// Step one variant toward the panel start, crossing block boundaries.
    pub fn retreat(&mut self) {
        if self.done {
            return;
        }
        if self.local_idx > 0 {
            self.local_idx -= 1;
        } else if self.block_idx > 0 {
            self.block_idx -= 1;
            self.local_idx = self.panel.blocks[self.block_idx].variant_size() - 1;
        } else {
            self.done = true;
        }
    }

    /// Step one variant toward the panel end, crossing block boundaries.
    pub fn advance(&mut self) {
        if self.done {
            return;
        }
        if self.local_idx + 1 < self.panel.blocks[self.block_idx].variant_size() {
            self.local_idx += 1;
        } else if self.block_idx + 1 < self.panel.blocks.len() {
            self.block_idx += 1;
            self.local_idx = 0;
        } else {
            self.done = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn site(pos: u32) -> ReferenceSiteInfo {
        ReferenceSiteInfo::new(
            Arc::from("chr1"),
            pos,
            format!("v{}", pos),
            "A".into(),
            "C".into(),
        )
    }

    #[test]
    fn test_compress_collapses_identical_haplotypes() {
        let mut block = UniqueHaplotypeBlock::default();
        assert!(block.compress_variant(&site(100), &[0, 0, 1, 1, 0, 1]));
        assert_eq!(block.unique_haplotype_size(), 2);
        assert_eq!(block.cardinalities(), &[3, 3]);
        assert_eq!(block.unique_map(), &[0, 0, 1, 1, 0, 1]);
        assert_eq!(block.variants()[0].ac, 3);
    }

    #[test]
    fn test_compress_splits_columns_on_divergence() {
        let mut block = UniqueHaplotypeBlock::default();
        assert!(block.compress_variant(&site(100), &[0, 0, 1, 1]));
        // Haplotype 1 diverges from haplotype 0 at the second variant.
        assert!(block.compress_variant(&site(200), &[0, 1, 1, 1]));
        assert_eq!(block.unique_haplotype_size(), 3);
        assert_eq!(block.total_cardinality(), 4);
        // Earlier variant alleles were replayed into the new column.
        assert_eq!(block.variants()[0].gt.len(), 3);
        assert_eq!(block.variants()[0].gt[block.unique_map()[1] as usize], 0);
        assert_eq!(block.variants()[1].gt[block.unique_map()[1] as usize], 1);
        // Σ cardinalities is preserved across the split.
        assert_eq!(block.cardinalities().iter().sum::<u64>(), 4);
    }

    #[test]
    fn test_compress_rejects_ploidy_change() {
        let mut block = UniqueHaplotypeBlock::default();
        assert!(block.compress_variant(&site(100), &[0, 1, GT_EOV]));
        assert_eq!(block.total_cardinality(), 2);
        assert!(!block.compress_variant(&site(200), &[0, 1, 0]));
    }

    #[test]
    fn test_append_block_drops_boundary_duplicate() {
        let mut panel = ReducedHaplotypes::default();
        let mut a = UniqueHaplotypeBlock::default();
        a.compress_variant(&site(100), &[0, 1]);
        a.compress_variant(&site(200), &[1, 1]);
        let mut b = UniqueHaplotypeBlock::default();
        b.compress_variant(&site(200), &[1, 1]);
        b.compress_variant(&site(300), &[0, 0]);

        panel.append_block(a);
        panel.append_block(b);
        assert_eq!(panel.variant_size(), 3);
        assert_eq!(panel.blocks()[0].variant_size(), 1);
        assert_eq!(panel.block_offsets(), &[0, 1]);
        assert_eq!(panel.variant(1).site.pos, 200);
        assert_eq!(panel.variant(2).site.pos, 300);
    }

    #[test]
    fn test_cursor_walks_backward_across_blocks() {
        let mut panel = ReducedHaplotypes::default();
        for chunk in [&[100u32, 200][..], &[300, 400, 500][..]] {
            let mut block = UniqueHaplotypeBlock::default();
            for &pos in chunk {
                block.compress_variant(&site(pos), &[0, 1]);
            }
            panel.append_block(block);
        }

        let mut cursor = panel.cursor_at_last();
        let mut seen = Vec::new();
        while !cursor.is_done() {
            seen.push((cursor.global_idx(), cursor.variant().site.pos));
            cursor.retreat();
        }
        assert_eq!(
            seen,
            vec![(4, 500), (3, 400), (2, 300), (1, 200), (0, 100)]
        );
    }

    #[test]
    fn test_recompression_is_idempotent_up_to_relabeling() {
        // Decoding a block and recompressing its expanded alleles yields
        // the same haplotype partition (unique indices may be relabeled).
        let mut original = UniqueHaplotypeBlock::default();
        original.compress_variant(&site(100), &[0, 1, 1, 0, 1]);
        original.compress_variant(&site(200), &[0, 1, 0, 0, 1]);
        original.compress_variant(&site(300), &[1, 1, 0, 1, 1]);

        let mut rebuilt = UniqueHaplotypeBlock::default();
        for v in original.variants() {
            let expanded: Vec<i8> = original
                .unique_map()
                .iter()
                .map(|&u| v.gt[u as usize])
                .collect();
            let site = v.site.clone();
            assert!(rebuilt.compress_variant(&site, &expanded));
        }

        assert_eq!(
            rebuilt.unique_haplotype_size(),
            original.unique_haplotype_size()
        );
        let n = original.expanded_haplotype_size();
        for a in 0..n {
            for b in 0..n {
                let together_before = original.unique_map()[a] == original.unique_map()[b];
                let together_after = rebuilt.unique_map()[a] == rebuilt.unique_map()[b];
                assert_eq!(together_before, together_after, "haps {} and {}", a, b);
            }
        }
        for (a, b) in original.variants().iter().zip(rebuilt.variants()) {
            assert_eq!(a.ac, b.ac);
        }
    }

    #[test]
    fn test_compression_ratio() {
        let mut panel = ReducedHaplotypes::default();
        let mut block = UniqueHaplotypeBlock::default();
        for pos in [100, 200, 300, 400] {
            block.compress_variant(&site(pos), &[0, 0, 0, 1]);
        }
        panel.append_block(block);
        // 4 expanded + 2 unique * 4 variants = 12 over 16 cells.
        assert!((panel.compression_ratio() - 12.0 / 16.0).abs() < 1e-6);
    }
}
