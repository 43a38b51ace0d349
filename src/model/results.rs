//! # Dosage Result Matrices
//!
//! Dense storage for the posterior dosages of one haplotype batch: a
//! `variants × haplotypes` matrix plus a parallel leave-one-out matrix over
//! typed sites only. Storage is column-major (one pair of vectors per
//! target haplotype) so a batch can be handed to rayon as disjoint
//! `&mut` columns: each worker writes its own haplotype, no locks.
//!
//! Both matrices initialize to the end-of-vector sentinel; a column that is
//! never written (a sample with fewer haplotypes than the column's ploidy
//! slot) keeps the sentinel all the way into the output writer.

use crate::data::variant::dosage_eov;

/// The dosages produced for a single target haplotype.
#[derive(Clone, Debug, Default)]
pub struct HaplotypeDosages {
    /// One entry per full-panel variant.
    pub dosages: Vec<f32>,
    /// One entry per typed site.
    pub loo_dosages: Vec<f32>,
}

/// Full and leave-one-out dosages for one haplotype batch.
#[derive(Clone, Debug, Default)]
pub struct DosageResults {
    n_variants: usize,
    n_loo_variants: usize,
    columns: Vec<HaplotypeDosages>,
}

impl DosageResults {
    /// Resize to `n_variants × n_columns` (and `n_loo_variants × n_columns`
    /// for the leave-one-out side), filling everything with the sentinel.
    pub fn resize(&mut self, n_variants: usize, n_loo_variants: usize, n_columns: usize) {
        self.n_variants = n_variants;
        self.n_loo_variants = n_loo_variants;
        self.columns.resize_with(n_columns, HaplotypeDosages::default);
        for col in &mut self.columns {
            col.dosages.resize(n_variants, dosage_eov());
            col.loo_dosages.resize(n_loo_variants, dosage_eov());
        }
        self.fill_eov();
    }

    /// Reset every entry to the end-of-vector sentinel.
    pub fn fill_eov(&mut self) {
        for col in &mut self.columns {
            col.dosages.fill(dosage_eov());
            col.loo_dosages.fill(dosage_eov());
        }
    }

    /// Drop trailing columns (the final sample batch may be narrower than
    /// the temp buffer).
    pub fn truncate_columns(&mut self, n_columns: usize) {
        self.columns.truncate(n_columns);
    }

    /// `(rows, columns)` of the full-panel matrix.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.n_variants, self.columns.len())
    }

    /// `(rows, columns)` of the leave-one-out matrix.
    pub fn dimensions_loo(&self) -> (usize, usize) {
        (self.n_loo_variants, self.columns.len())
    }

    pub fn dosage(&self, variant: usize, column: usize) -> f32 {
        self.columns[column].dosages[variant]
    }

    pub fn loo_dosage(&self, variant: usize, column: usize) -> f32 {
        self.columns[column].loo_dosages[variant]
    }

    /// Row of full-panel dosages across the batch, in column order.
    pub fn dosage_row(&self, variant: usize) -> impl Iterator<Item = f32> + '_ {
        self.columns.iter().map(move |c| c.dosages[variant])
    }

    /// Row of leave-one-out dosages across the batch, in column order.
    pub fn loo_row(&self, variant: usize) -> impl Iterator<Item = f32> + '_ {
        self.columns.iter().map(move |c| c.loo_dosages[variant])
    }

    /// Exclusive access to every column, for parallel dispatch.
    pub fn columns_mut(&mut self) -> &mut [HaplotypeDosages] {
        &mut self.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variant::is_dosage_eov;

    #[test]
    fn test_resize_fills_sentinel() {
        let mut results = DosageResults::default();
        results.resize(4, 2, 3);
        assert_eq!(results.dimensions(), (4, 3));
        assert_eq!(results.dimensions_loo(), (2, 3));
        for v in 0..4 {
            for h in 0..3 {
                assert!(is_dosage_eov(results.dosage(v, h)));
            }
        }
    }

    #[test]
    fn test_written_columns_survive_rows() {
        let mut results = DosageResults::default();
        results.resize(3, 1, 2);
        results.columns_mut()[1].dosages[2] = 0.25;
        let row: Vec<f32> = results.dosage_row(2).collect();
        assert!(is_dosage_eov(row[0]));
        assert_eq!(row[1], 0.25);
    }

    #[test]
    fn test_truncate_and_refill() {
        let mut results = DosageResults::default();
        results.resize(2, 2, 4);
        results.truncate_columns(3);
        assert_eq!(results.dimensions().1, 3);
        results.columns_mut()[0].loo_dosages[0] = 1.0;
        results.fill_eov();
        assert!(is_dosage_eov(results.loo_dosage(0, 0)));
    }
}
