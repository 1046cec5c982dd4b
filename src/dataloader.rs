//! Data loader

use std::collections::HashSet;

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::var::Var;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Labels must have the same length as the data: {label_len} labels, {data_len} samples")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be nonzero")]
    ZeroBatchSize,
}

/// Data loader, returns batches of inputs and integer class labels,
/// optionally shuffled. Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
///
/// Inputs are wrapped as untracked constants: gradients are never needed
/// with respect to the data, and untracked inputs keep evaluation-mode
/// forward passes graph-free.
pub struct DataLoader {
    data: Vec<Vec<Var>>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        let input_dims = data.iter().map(|d| d.len()).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        let data = data
            .iter()
            .map(|d| d.iter().map(|v| Var::constant(*v)).collect())
            .collect();
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
        })
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iteration order fixed by an explicit seed, for reproducible runs.
    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_> {
        use rand::SeedableRng;
        use rand_pcg::Pcg64Mcg;

        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        indices.shuffle(&mut rng);
        DataLoaderIterator {
            data: &self.data,
            labels: &self.labels,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(&mut rand::rng());
        }
        DataLoaderIterator {
            data: &self.data,
            labels: &self.labels,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of inputs and labels until the end
/// of the dataset. The final batch may be shorter than `batch_size`.
pub struct DataLoaderIterator<'a> {
    data: &'a [Vec<Var>],
    labels: &'a [usize],
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl<'a> Iterator for DataLoaderIterator<'a> {
    type Item = (Vec<&'a [Var]>, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.data.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.data.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        let batch_data = batch_indices
            .iter()
            .map(|&i| self.data[i].as_slice())
            .collect::<Vec<_>>();
        let batch_labels = batch_indices
            .iter()
            .map(|&i| self.labels[i])
            .collect::<Vec<_>>();
        self.curr_iter = end;
        Some((batch_data, batch_labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataloader() {
        let data = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let labels = vec![0, 1];
        let dataloader = DataLoader::new(data, labels, 2, false).unwrap();
        assert_eq!(dataloader.len(), 2);
        let mut iter = dataloader.iter();
        assert_eq!(
            iter.next(),
            Some((
                vec![
                    [Var::new(1.0), Var::new(2.0), Var::new(3.0)].as_slice(),
                    [Var::new(4.0), Var::new(5.0), Var::new(6.0)].as_slice(),
                ],
                vec![0, 1],
            ))
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_dataloader_short_final_batch() {
        let data = vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0], vec![5.0]];
        let labels = vec![0, 1, 0, 1, 0];
        let dataloader = DataLoader::new(data, labels, 2, false).unwrap();
        let batch_sizes: Vec<usize> = dataloader.iter().map(|(batch, _)| batch.len()).collect();
        assert_eq!(batch_sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_dataloader_iteration_restarts() {
        let data = vec![vec![1.0], vec![2.0]];
        let labels = vec![0, 1];
        let dataloader = DataLoader::new(data, labels, 1, false).unwrap();
        assert_eq!(dataloader.iter().count(), 2);
        // a fresh iterator walks the dataset again from the start
        assert_eq!(dataloader.iter().count(), 2);
    }

    #[test]
    fn test_dataloader_shuffle() {
        let seed = 42;
        let data = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let labels = vec![0, 1];
        let dataloader = DataLoader::new(data, labels, 2, true).unwrap();
        let (batch, batch_labels) = dataloader.seeded_iter(seed).next().unwrap();
        // the permutation pairs every sample with its own label
        for (sample, label) in batch.iter().zip(&batch_labels) {
            match sample[0].data() as usize {
                1 => assert_eq!(*label, 0),
                4 => assert_eq!(*label, 1),
                other => panic!("unexpected sample start {other}"),
            }
        }
    }

    #[test]
    fn test_dataloader_inputs_are_untracked() {
        let data = vec![vec![1.0, 2.0]];
        let labels = vec![0];
        let dataloader = DataLoader::new(data, labels, 1, false).unwrap();
        let (batch, _) = dataloader.iter().next().unwrap();
        assert!(batch[0].iter().all(|v| !v.requires_grad()));
    }

    #[test]
    fn test_dataloader_errors() {
        // different length data and labels
        let data = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let labels = vec![0, 1, 0];
        let expected_label_len = labels.len();
        let expected_data_len = data.len();
        let dataloader = DataLoader::new(data, labels, 2, false);
        assert!(matches!(
            dataloader,
            Err(DataLoaderError::LabelLengthMismatch {
                label_len,
                data_len,
            }) if label_len == expected_label_len && data_len == expected_data_len
        ));

        // ragged inputs
        let data = vec![vec![1.0, 2.0], vec![3.0]];
        let labels = vec![0, 1];
        assert!(matches!(
            DataLoader::new(data, labels, 2, false),
            Err(DataLoaderError::InputDimensionMismatch { .. })
        ));

        // zero batch size
        assert!(matches!(
            DataLoader::new(vec![vec![1.0]], vec![0], 0, false),
            Err(DataLoaderError::ZeroBatchSize)
        ));
    }
}
