//! Contiguous k-fold splits.

use std::ops::Range;

/// One cross-validation split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Validation range of fold `index` out of `n_folds` over `n_rows` rows.
///
/// The first `n_rows % n_folds` folds get one extra row, like an unshuffled
/// `KFold`.
pub fn validation_range(n_rows: usize, n_folds: usize, index: usize) -> Range<usize> {
    let n_folds = n_folds.max(1);
    let base = n_rows / n_folds;
    let extra = n_rows % n_folds;
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    start..(start + len).min(n_rows)
}

/// Fold `index` with train indices in ascending order.
pub fn fold(n_rows: usize, n_folds: usize, index: usize) -> Fold {
    let validation = validation_range(n_rows, n_folds, index);
    Fold {
        index,
        train: (0..n_rows).filter(|i| !validation.contains(i)).collect(),
        validation: validation.collect(),
    }
}

/// All folds, in order.
pub fn kfold(n_rows: usize, n_folds: usize) -> Vec<Fold> {
    (0..n_folds.max(1)).map(|index| fold(n_rows, n_folds, index)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_partition_rows() {
        let folds = kfold(10, 3);
        assert_eq!(folds[0].validation, vec![0, 1, 2, 3]);
        assert_eq!(folds[1].validation, vec![4, 5, 6]);
        assert_eq!(folds[2].validation, vec![7, 8, 9]);
        let mut all: Vec<usize> = folds.iter().flat_map(|f| f.validation.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(folds[1].train, vec![0, 1, 2, 3, 7, 8, 9]);
    }
}
