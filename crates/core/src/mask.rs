//! # Masking
//!
//! Raw inputs may mark excluded entries with a sentinel value. The first
//! kernel construction turns the sentinel into a boolean mask, zeroes those
//! entries, and keeps a *position* mask: a position is masked when every one
//! of its channels is. Kernels store position masks as `(batch, positions)`;
//! finite-network tensors store them in tensor layout with a size-1 channel
//! axis.

use ndarray::{Array, Array2, Array3, ArrayD, Axis, Dimension, Zip};

use crate::error::{KernelError, Result};
use crate::layout::{from_canonical, to_canonical, Block};
use crate::shape::Shape;

/// Whether `value` is the sentinel (NaN matches NaN).
pub fn is_sentinel(value: f64, sentinel: f64) -> bool {
    value == sentinel || (value.is_nan() && sentinel.is_nan())
}

/// Canonicalize `x` to `(batch, positions, channel)`, zeroing sentinel entries
/// and returning the position mask when a sentinel is given.
pub fn mask_input(
    x: &ArrayD<f64>,
    batch: usize,
    channel: usize,
    sentinel: Option<f64>,
) -> Result<(Array3<f64>, Option<Array2<bool>>)> {
    let mut canonical = to_canonical(x, batch, channel)?;
    let Some(sentinel) = sentinel else {
        return Ok((canonical, None));
    };
    let hits = canonical.mapv(|v| is_sentinel(v, sentinel));
    Zip::from(&mut canonical)
        .and(&hits)
        .for_each(|v, &hit| {
            if hit {
                *v = 0.0;
            }
        });
    let positions = hits.map_axis(Axis(2), |channels| channels.iter().all(|&h| h));
    Ok((canonical, Some(positions)))
}

/// Element-wise OR (`any`) or AND (`all`) of optional masks; absent masks
/// count as all-unmasked.
pub fn combine<D: Dimension>(masks: &[Option<&Array<bool, D>>], all: bool) -> Option<Array<bool, D>> {
    let present: Vec<&Array<bool, D>> = masks.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    if all && present.len() < masks.len() {
        // Some branch has no mask, so nothing is masked in all of them.
        return None;
    }
    let mut out = present[0].clone();
    for mask in &present[1..] {
        Zip::from(&mut out).and(*mask).for_each(|o, &m| {
            *o = if all { *o && m } else { *o || m };
        });
    }
    Some(out)
}

/// Zero the entries of a block that touch a masked position.
pub fn mask_block(block: Block, left: Option<&[bool]>, right: Option<&[bool]>) -> Block {
    let masked = |mask: Option<&[bool]>, i: usize| mask.map_or(false, |m| m[i]);
    match block {
        Block::Full(mut m) => {
            for ((i, j), v) in m.indexed_iter_mut() {
                if masked(left, i) || masked(right, j) {
                    *v = 0.0;
                }
            }
            Block::Full(m)
        }
        Block::Diagonal(mut d) => {
            for (i, v) in d.iter_mut().enumerate() {
                if masked(left, i) || masked(right, i) {
                    *v = 0.0;
                }
            }
            Block::Diagonal(d)
        }
    }
}

/// A finite-network tensor with an optional mask (channel axis of size 1).
#[derive(Debug, Clone, PartialEq)]
pub struct Masked {
    pub value: ArrayD<f64>,
    pub mask: Option<ArrayD<bool>>,
}

impl Masked {
    pub fn new(value: ArrayD<f64>) -> Self {
        Self { value, mask: None }
    }

    pub fn with_mask(value: ArrayD<f64>, mask: Option<ArrayD<bool>>) -> Self {
        Self { value, mask }
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.value.shape().to_vec())
    }

    /// Mask sentinel entries of a raw input.
    pub fn from_sentinel(
        x: &ArrayD<f64>,
        batch: usize,
        channel: usize,
        sentinel: Option<f64>,
    ) -> Result<Self> {
        let shape = Shape::new(x.shape().to_vec());
        let (canonical, positions) = mask_input(x, batch, channel, sentinel)?;
        let value = from_canonical(&canonical, &shape, batch, channel)?;
        let mask = positions
            .map(|p| positions_to_tensor(&p, &shape, batch, channel))
            .transpose()?;
        Ok(Self { value, mask })
    }

    /// `(batch, positions)` view of the mask.
    pub fn positions(&self, batch: usize, channel: usize) -> Result<Option<Array2<bool>>> {
        self.mask
            .as_ref()
            .map(|m| tensor_to_positions(m, batch, channel))
            .transpose()
    }

    /// Zero masked entries by broadcasting the mask over the channel axis.
    pub fn zeroed(mut self) -> Result<Self> {
        let Some(mask) = &self.mask else {
            return Ok(self);
        };
        let Some(mask) = mask.broadcast(self.value.raw_dim()) else {
            return Err(KernelError::Tensor {
                reason: format!(
                    "mask of shape {:?} does not broadcast to {:?}",
                    mask.shape(),
                    self.value.shape()
                ),
            });
        };
        Zip::from(&mut self.value).and(&mask).for_each(|v, &m| {
            if m {
                *v = 0.0;
            }
        });
        Ok(self)
    }

    /// Zero every masked position of the value.
    pub fn zero_masked(mut self, batch: usize, channel: usize) -> Result<Self> {
        let Some(positions) = self.positions(batch, channel)? else {
            return Ok(self);
        };
        let shape = self.shape();
        let mut canonical = to_canonical(&self.value, batch, channel)?;
        for ((n, p, _), v) in canonical.indexed_iter_mut() {
            if positions[[n, p]] {
                *v = 0.0;
            }
        }
        self.value = from_canonical(&canonical, &shape, batch, channel)?;
        Ok(self)
    }
}

/// Convert a tensor-layout mask (channel axis of size 1) to `(batch, positions)`.
pub fn tensor_to_positions(mask: &ArrayD<bool>, batch: usize, channel: usize) -> Result<Array2<bool>> {
    if mask.shape().get(channel) != Some(&1) {
        return Err(KernelError::Tensor {
            reason: format!("mask of shape {:?} must have a size-1 channel axis", mask.shape()),
        });
    }
    let canonical = to_canonical(mask, batch, channel)?;
    Ok(canonical.index_axis_move(Axis(2), 0))
}

/// Expand a `(batch, positions)` mask to tensor layout for a tensor of `shape`.
pub fn positions_to_tensor(
    positions: &Array2<bool>,
    shape: &Shape,
    batch: usize,
    channel: usize,
) -> Result<ArrayD<bool>> {
    let mask_shape = shape.with_dim(channel, 1);
    if positions.dim() != (mask_shape.dim(batch)?, mask_shape.positions(batch, channel)) {
        return Err(KernelError::shape_mismatch(
            &[mask_shape.dim(batch)?, mask_shape.positions(batch, channel)],
            positions.shape(),
        ));
    }
    let canonical = positions.clone().insert_axis(Axis(2));
    from_canonical(&canonical, &mask_shape, batch, channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    #[test]
    fn test_sentinel_nan_matches_nan() {
        assert!(is_sentinel(f64::NAN, f64::NAN));
        assert!(is_sentinel(10.0, 10.0));
        assert!(!is_sentinel(1.0, 10.0));
    }

    #[test]
    fn test_mask_input_requires_all_channels() {
        // (batch=1, positions=2, channels=2)
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![10.0, 10.0, 10.0, 3.0]).unwrap();
        let (canonical, mask) = mask_input(&x, 0, 2, Some(10.0)).unwrap();
        assert_eq!(mask.unwrap(), array![[true, false]]);
        assert_eq!(canonical[[0, 1, 0]], 0.0);
        assert_eq!(canonical[[0, 1, 1]], 3.0);
    }

    #[test]
    fn test_combine_masks() {
        let a = array![[true, false], [true, true]];
        let b = array![[true, true], [false, true]];
        assert_eq!(
            combine(&[Some(&a), Some(&b)], true).unwrap(),
            array![[true, false], [false, true]]
        );
        assert_eq!(
            combine(&[Some(&a), Some(&b)], false).unwrap(),
            array![[true, true], [true, true]]
        );
        assert!(combine(&[Some(&a), None], true).is_none());
        assert_eq!(combine(&[Some(&a), None], false).unwrap(), a);
    }

    #[test]
    fn test_mask_block() {
        let block = Block::Full(array![[1.0, 2.0], [3.0, 4.0]]);
        let masked = mask_block(block, Some(&[false, true]), None);
        assert_eq!(masked, Block::Full(array![[1.0, 2.0], [0.0, 0.0]]));
    }

    #[test]
    fn test_masked_round_trip() {
        let x = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 10.0, 2.0, 10.0, 10.0, 10.0])
            .unwrap();
        let masked = Masked::from_sentinel(&x, 0, 1, Some(10.0)).unwrap();
        assert_eq!(masked.value.as_slice().unwrap(), &[1.0, 0.0, 2.0, 0.0, 0.0, 0.0]);
        let positions = masked.positions(0, 1).unwrap().unwrap();
        assert_eq!(positions, array![[false], [true]]);
    }
}
