//! Keeps the frozen rows of a partially trainable embedding matrix fixed.
//!
//! The optimizer updates the matrix as one tensor, so weight decay and
//! momentum also move rows that should stay frozen. After every step the
//! guard copies those rows back from the snapshot taken at setup.

use crate::error::{Result, SetupError};
use crate::model::parts::TokenEmbeddings;
use burn::prelude::*;
use std::ops::Range;
use tracing::debug;

/// Snapshot of the original matrix plus the rows to hold fixed
#[derive(Debug, Clone)]
pub struct EmbeddingGuard<B: Backend> {
    original: Tensor<B, 2>,
    /// True for rows that must not change
    frozen_mask: Vec<bool>,
    /// Contiguous runs of frozen rows
    frozen_ranges: Vec<Range<usize>>,
}

impl<B: Backend> EmbeddingGuard<B> {
    /// Copy `matrix` and freeze every row not listed in `trainable_ids`
    pub fn snapshot(matrix: &Tensor<B, 2>, trainable_ids: &[u32]) -> Self {
        let num_rows = matrix.dims()[0];
        let mut frozen_mask = vec![true; num_rows];
        for &id in trainable_ids {
            if let Some(frozen) = frozen_mask.get_mut(id as usize) {
                *frozen = false;
            }
        }
        let frozen_ranges = contiguous_runs(&frozen_mask);

        debug!(
            "Embedding snapshot: {} rows, {} trainable, {} frozen runs",
            num_rows,
            num_rows - frozen_mask.iter().filter(|f| **f).count(),
            frozen_ranges.len()
        );

        Self {
            original: matrix.clone(),
            frozen_mask,
            frozen_ranges,
        }
    }

    pub fn frozen_mask(&self) -> &[bool] {
        &self.frozen_mask
    }

    /// Ids of rows the optimizer may change
    pub fn trainable_ids(&self) -> Vec<u32> {
        self.frozen_mask
            .iter()
            .enumerate()
            .filter(|(_, frozen)| !**frozen)
            .map(|(id, _)| id as u32)
            .collect()
    }

    pub fn num_rows(&self) -> usize {
        self.frozen_mask.len()
    }

    /// Overwrite every frozen row of `matrix` with its original value
    pub fn restore_tensor(&self, matrix: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        self.check_shape(&matrix)?;
        let dim = self.original.dims()[1];
        let restored = self.frozen_ranges.iter().fold(matrix, |matrix, rows| {
            let original = self.original.clone().slice([rows.clone(), 0..dim]);
            matrix.slice_assign([rows.clone(), 0..dim], original)
        });
        Ok(restored)
    }

    /// Restore the frozen rows of the text encoder's embedding table
    pub fn restore(&self, embeddings: &mut TokenEmbeddings<B>) -> Result<()> {
        let restored = self.restore_tensor(embeddings.weight().clone())?;
        embeddings.set_weight(restored);
        Ok(())
    }

    /// Whether every frozen row of `matrix` is bit-identical to the snapshot
    pub fn frozen_rows_intact(&self, matrix: &Tensor<B, 2>) -> Result<bool> {
        self.check_shape(matrix)?;
        let dim = self.original.dims()[1];
        let original = read_values(&self.original)?;
        let current = read_values(matrix)?;

        let intact = self.frozen_ranges.iter().all(|rows| {
            let span = rows.start * dim..rows.end * dim;
            original[span.clone()]
                .iter()
                .zip(&current[span])
                .all(|(a, b)| a.to_bits() == b.to_bits())
        });
        Ok(intact)
    }

    /// Move the snapshot alongside the text encoder
    pub fn to_device(&mut self, device: &B::Device) {
        self.original = self.original.clone().to_device(device);
    }

    fn check_shape(&self, matrix: &Tensor<B, 2>) -> Result<()> {
        let expected = self.original.dims();
        let actual = matrix.dims();
        if expected != actual {
            return Err(SetupError::StateMismatch {
                kind: "embedding",
                message: format!("snapshot has shape {:?}, matrix has shape {:?}", expected, actual),
            });
        }
        Ok(())
    }
}

fn contiguous_runs(mask: &[bool]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &frozen) in mask.iter().enumerate() {
        match (frozen, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..mask.len());
    }
    runs
}

fn read_values<B: Backend>(tensor: &Tensor<B, 2>) -> Result<Vec<f32>> {
    tensor
        .to_data()
        .to_vec::<f32>()
        .map_err(|e| SetupError::TensorData(format!("{:?}", e)))
}
