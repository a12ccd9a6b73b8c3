//! # Shapes - Tensor Layouts
//!
//! A [`Shape`] is the dimension list of a tensor flowing through a network.
//! Kernels carry the shapes the finite-width evaluator would produce
//! (`shape1`, `shape2`) so composition can be validated without running it.
//!
//! Every tensor has one batch axis and one channel axis; all remaining axes
//! are *spatial* and keep their relative order:
//!
//! ```text
//!   NHWC   batch=0  channel=3  spatial=[1, 2]
//!   NCHW   batch=0  channel=1  spatial=[2, 3]
//!   CN     batch=1  channel=0  spatial=[]
//! ```

use std::fmt;

use crate::error::{KernelError, Result};

/// Dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    /// Dimension sizes (empty = scalar).
    pub dims: Vec<usize>,
}

impl Shape {
    /// Create a new shape from its dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Check if this shape is compatible with another for composition.
    pub fn is_compatible(&self, other: &Shape) -> bool {
        self == other
    }

    /// Size of `axis`, which must already be normalized.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.dims.get(axis).copied().ok_or_else(|| KernelError::Tensor {
            reason: format!("axis {axis} out of range for shape {self}"),
        })
    }

    /// Resolve a possibly negative axis against this shape's rank.
    pub fn axis(&self, axis: isize) -> Result<usize> {
        normalize_axis(axis, self.rank())
    }

    /// Axes that are neither the batch nor the channel axis, in order.
    pub fn spatial_axes(&self, batch: usize, channel: usize) -> Vec<usize> {
        (0..self.rank())
            .filter(|&a| a != batch && a != channel)
            .collect()
    }

    /// Sizes of the spatial axes, in order.
    pub fn spatial_dims(&self, batch: usize, channel: usize) -> Vec<usize> {
        self.spatial_axes(batch, channel)
            .into_iter()
            .map(|a| self.dims[a])
            .collect()
    }

    /// Number of spatial positions (1 when there are no spatial axes).
    pub fn positions(&self, batch: usize, channel: usize) -> usize {
        self.spatial_dims(batch, channel).iter().product()
    }

    /// Same shape with `axis` resized.
    pub fn with_dim(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.dims.clone();
        if let Some(d) = dims.get_mut(axis) {
            *d = size;
        }
        Shape { dims }
    }

    /// Whether two shapes agree everywhere except on `axis`.
    pub fn agrees_except(&self, other: &Shape, axis: usize) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(&other.dims)
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b)
    }
}

/// Resolve a possibly negative axis index against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved >= rank as isize {
        return Err(KernelError::Tensor {
            reason: format!("axis {axis} out of range for rank {rank}"),
        });
    }
    Ok(resolved as usize)
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({})",
            self.dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::new(vec![]);
        assert_eq!(s.rank(), 0);
        assert_eq!(s.numel(), 1);
        assert_eq!(s.to_string(), "()");
    }

    #[test]
    fn test_matrix_shape() {
        let m = Shape::new(vec![3, 4]);
        assert_eq!(m.rank(), 2);
        assert_eq!(m.numel(), 12);
        assert_eq!(m.to_string(), "(3, 4)");
    }

    #[test]
    fn test_negative_axis() {
        let s = Shape::new(vec![8, 4, 3, 2]);
        assert_eq!(s.axis(-1).unwrap(), 3);
        assert_eq!(s.axis(0).unwrap(), 0);
        assert!(s.axis(4).is_err());
        assert!(s.axis(-5).is_err());
    }

    #[test]
    fn test_spatial_dims() {
        let nhwc = Shape::new(vec![8, 4, 3, 2]);
        assert_eq!(nhwc.spatial_axes(0, 3), vec![1, 2]);
        assert_eq!(nhwc.spatial_dims(0, 3), vec![4, 3]);
        assert_eq!(nhwc.positions(0, 3), 12);

        let cn = Shape::new(vec![5, 7]);
        assert_eq!(cn.spatial_dims(1, 0), Vec::<usize>::new());
        assert_eq!(cn.positions(1, 0), 1);
    }

    #[test]
    fn test_agrees_except() {
        let a = Shape::new(vec![2, 5, 3]);
        let b = Shape::new(vec![4, 5, 3]);
        assert!(a.agrees_except(&b, 0));
        assert!(!a.agrees_except(&b, 1));
    }
}
