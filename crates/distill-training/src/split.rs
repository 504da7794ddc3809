use crate::error::{TrainingError, TrainingResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Train/validation partition of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split<T> {
    pub train: Vec<T>,
    pub val: Vec<T>,
}

/// Shuffled index partition: `floor(train_ratio * n)` train indices, the rest validation.
///
/// The same `seed`, `n` and ratio always give the same partition.
pub fn split_indices(
    n: usize,
    train_ratio: f64,
    seed: u64,
) -> TrainingResult<(Vec<usize>, Vec<usize>)> {
    if !(train_ratio > 0.0 && train_ratio < 1.0) {
        return Err(TrainingError::Config(format!(
            "train_ratio must be in (0, 1), got {train_ratio}"
        )));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let cut = (train_ratio * n as f64).floor() as usize;
    let val = indices.split_off(cut);
    Ok((indices, val))
}

/// Partitions `items` by [`split_indices`], preserving shuffled order within each side.
pub fn split_dataset<T: Clone>(
    items: &[T],
    train_ratio: f64,
    seed: u64,
) -> TrainingResult<Split<T>> {
    let (train_idx, val_idx) = split_indices(items.len(), train_ratio, seed)?;
    Ok(Split {
        train: train_idx.into_iter().map(|i| items[i].clone()).collect(),
        val: val_idx.into_iter().map(|i| items[i].clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_is_deterministic() {
        let items: Vec<u32> = (0..100).collect();
        let a = split_dataset(&items, 0.9, 42).unwrap();
        let b = split_dataset(&items, 0.9, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.train.len(), 90);
        assert_eq!(a.val.len(), 10);
    }

    #[test]
    fn test_split_covers_every_item_once() {
        let (mut train, val) = split_indices(37, 0.8, 7).unwrap();
        assert_eq!(train.len(), 29);
        train.extend(val);
        train.sort_unstable();
        assert_eq!(train, (0..37).collect::<Vec<_>>());
    }

    #[test]
    fn test_different_seed_changes_order() {
        let items: Vec<u32> = (0..50).collect();
        let a = split_dataset(&items, 0.5, 1).unwrap();
        let b = split_dataset(&items, 0.5, 2).unwrap();
        assert_ne!(a.train, b.train);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        assert!(split_indices(10, 1.0, 42).is_err());
        assert!(split_indices(10, 0.0, 42).is_err());
    }
}
