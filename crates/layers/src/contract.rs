//! Contraction of one axis with a constant matrix, or scaling by a constant.
//!
//! | target  | finite width            | kernel |
//! |---------|-------------------------|--------|
//! | scalar  | `c x`                   | `c² K` |
//! | channel | `x Mᵀ` over channels    | `‖M‖²_F / C_out · K` |
//! | spatial | `M` along one axis      | `P K Pᵀ`, `P = I ⊗ M ⊗ I` |
//! | batch   | `M` along the batch     | `M K Mᵀ` on the example axes |
//!
//! Batch contractions mix examples, so they need the full batch covariance.

use ndarray::{Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::mask::positions_to_tensor;
use widenet_core::shape::normalize_axis;
use widenet_core::{
    ApplyArgs, AxisSpec, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked, Nested, Params, PositionMap,
    PositionMaps, Result, Shape,
};

use crate::positions::{check_masks, kron_all, mix_masked, resized};

/// What a [`Contract`] layer acts on. Matrices are `(out, in)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Contraction {
    Scalar(f64),
    Channel(Array2<f64>),
    Batch(Array2<f64>),
    /// `axis` is a tensor axis and must be spatial.
    Spatial { axis: isize, matrix: Array2<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub op: Contraction,
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Contract {
    fn with_op(op: Contraction) -> Self {
        Self {
            op,
            batch_axis: 0,
            channel_axis: -1,
        }
    }

    pub fn scalar(c: f64) -> Self {
        Self::with_op(Contraction::Scalar(c))
    }

    pub fn channel(matrix: Array2<f64>) -> Self {
        Self::with_op(Contraction::Channel(matrix))
    }

    pub fn batch(matrix: Array2<f64>) -> Self {
        Self::with_op(Contraction::Batch(matrix))
    }

    pub fn spatial(axis: isize, matrix: Array2<f64>) -> Self {
        Self::with_op(Contraction::Spatial { axis, matrix })
    }

    pub fn with_axes(mut self, batch_axis: isize, channel_axis: isize) -> Self {
        self.batch_axis = batch_axis;
        self.channel_axis = channel_axis;
        self
    }

    fn name(&self) -> &'static str {
        match self.op {
            Contraction::Scalar(_) => "ScalarContract",
            Contraction::Channel(_) => "ChannelContract",
            Contraction::Batch(_) => "BatchContract",
            Contraction::Spatial { .. } => "SpatialContract",
        }
    }

    fn invalid(&self, reason: String) -> KernelError {
        KernelError::InvalidConfig {
            layer: self.name().to_string(),
            reason,
        }
    }

    /// Index of the contracted axis among the spatial axes.
    fn spatial_index(&self, axis: isize, shape: &Shape, batch: usize, channel: usize) -> Result<usize> {
        let axis = normalize_axis(axis, shape.rank())?;
        shape
            .spatial_axes(batch, channel)
            .iter()
            .position(|&a| a == axis)
            .ok_or_else(|| self.invalid(format!("axis {axis} is not spatial")))
    }

    /// `I ⊗ M ⊗ I` over the spatial positions, and the new spatial sizes.
    fn position_matrix(&self, matrix: &Array2<f64>, index: usize, spatial: &[usize]) -> Result<(Array2<f64>, Vec<usize>)> {
        if matrix.ncols() != spatial[index] {
            return Err(KernelError::shape_mismatch(&[matrix.nrows(), spatial[index]], matrix.shape()));
        }
        let factors: Vec<Array2<f64>> = spatial
            .iter()
            .enumerate()
            .map(|(d, &n)| if d == index { matrix.clone() } else { Array2::eye(n) })
            .collect();
        let mut out = spatial.to_vec();
        out[index] = matrix.nrows();
        Ok((kron_all(&factors), out))
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        match &self.op {
            Contraction::Scalar(c) => Ok(kernel.map_values(|_, v| c * c * v)),
            Contraction::Channel(m) => {
                let channels = kernel.shape1.dim(kernel.channel_axis)?;
                if m.ncols() != channels {
                    return Err(KernelError::shape_mismatch(&[m.nrows(), channels], m.shape()));
                }
                let scale = m.iter().map(|v| v * v).sum::<f64>() / m.nrows().max(1) as f64;
                let channel = kernel.channel_axis;
                let out = kernel.map_values(|_, v| scale * v);
                Ok(Kernel {
                    shape1: out.shape1.with_dim(channel, m.nrows()),
                    shape2: out.shape2.with_dim(channel, m.nrows()),
                    ..out
                })
            }
            Contraction::Spatial { axis, matrix } => {
                let spatial = kernel.spatial();
                check_masks(&kernel, spatial.iter().product())?;
                let index = self.spatial_index(*axis, &kernel.shape1, kernel.batch_axis, kernel.channel_axis)?;
                let (p, out) = self.position_matrix(matrix, index, &spatial)?;
                let layout = resized(&kernel, &out, None)?;
                kernel.map_positions(layout, &PositionMaps::Shared(PositionMap::single(p)))
            }
            Contraction::Batch(m) => self.contract_batch(kernel, m),
        }
    }

    fn contract_batch(&self, kernel: Kernel, m: &Array2<f64>) -> Result<Kernel> {
        if kernel.diagonal_batch {
            return Err(KernelError::BatchContraction {
                layer: self.name().to_string(),
            });
        }
        for n in [kernel.shape1.dim(kernel.batch_axis)?, kernel.shape2.dim(kernel.batch_axis)?] {
            if m.ncols() != n {
                return Err(KernelError::shape_mismatch(&[m.nrows(), n], m.shape()));
            }
        }
        let both = |t: &ArrayD<f64>| -> Result<ArrayD<f64>> { contract_axis(&contract_axis(t, m, 0)?, m, 1) };
        let batch = kernel.batch_axis;
        Ok(Kernel {
            nngp: both(&kernel.nngp)?,
            ntk: kernel.ntk.as_ref().map(both).transpose()?,
            cov1: both(&kernel.cov1)?,
            cov2: kernel.cov2.as_ref().map(both).transpose()?,
            mask1: kernel.mask1.as_ref().map(|mask| mix_examples(mask, m)),
            mask2: kernel.mask2.as_ref().map(|mask| mix_examples(mask, m)),
            shape1: kernel.shape1.with_dim(batch, m.nrows()),
            shape2: kernel.shape2.with_dim(batch, m.nrows()),
            ..kernel
        })
    }

    fn axes(&self, shape: &Shape) -> Result<(usize, usize)> {
        AxisSpec::new(self.batch_axis, self.channel_axis).resolve(shape.rank())
    }
}

/// `M` applied along `axis` of `t`.
fn contract_axis(t: &ArrayD<f64>, m: &Array2<f64>, axis: usize) -> Result<ArrayD<f64>> {
    let moved = t.view().permuted_axes(front(t.ndim(), axis));
    let mut shape = moved.shape().to_vec();
    let rest: usize = shape[1..].iter().product();
    let flat = moved.as_standard_layout().into_owned().into_shape((shape[0], rest))?;
    shape[0] = m.nrows();
    let out = m.dot(&flat).into_shape(IxDyn(&shape))?;
    Ok(out.permuted_axes(back(t.ndim(), axis)).as_standard_layout().into_owned())
}

/// Axis order that brings `axis` to the front.
fn front(rank: usize, axis: usize) -> Vec<usize> {
    let mut order = vec![axis];
    order.extend((0..rank).filter(|&a| a != axis));
    order
}

/// Inverse of [`front`].
fn back(rank: usize, axis: usize) -> Vec<usize> {
    (0..rank)
        .map(|a| match a.cmp(&axis) {
            std::cmp::Ordering::Less => a + 1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => a,
        })
        .collect()
}

/// Output example `a` is masked at a position iff every example it reads is.
fn mix_examples(mask: &Array2<bool>, m: &Array2<f64>) -> Array2<bool> {
    Array2::from_shape_fn((m.nrows(), mask.ncols()), |(a, p)| {
        m.row(a)
            .iter()
            .zip(mask.column(p).iter())
            .all(|(&w, &masked)| w == 0.0 || masked)
    })
}

impl Layer for Contract {
    fn meta(&self) -> LayerMeta {
        let diagonal = match self.op {
            Contraction::Scalar(_) | Contraction::Channel(_) => DiagonalReqs::IDENTITY,
            Contraction::Spatial { .. } => DiagonalReqs::spatial(Diagonal::new(Tristate::Maybe, Tristate::No)),
            Contraction::Batch(_) => DiagonalReqs::new(Diagonal::FULL, Diagonal::IDENTITY),
        };
        let meta = LayerMeta::new(self.name()).with_diagonal(diagonal);
        match self.op {
            Contraction::Scalar(_) => meta,
            _ => meta.with_axes(AxisSpec::new(self.batch_axis, self.channel_axis)),
        }
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let out = input.try_map_ref(&mut |shape: &Shape| {
            let (batch, channel) = self.axes(shape)?;
            Ok(match &self.op {
                Contraction::Scalar(_) => shape.clone(),
                Contraction::Channel(m) => shape.with_dim(channel, m.nrows()),
                Contraction::Batch(m) => shape.with_dim(batch, m.nrows()),
                Contraction::Spatial { axis, matrix } => {
                    shape.with_dim(normalize_axis(*axis, shape.rank())?, matrix.nrows())
                }
            })
        })?;
        Ok((out, Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = self.axes(&shape)?;
            match &self.op {
                Contraction::Scalar(c) => Masked::with_mask(x.value * *c, x.mask).zeroed(),
                Contraction::Channel(m) => {
                    let value = contract_axis(&x.value, m, channel)?;
                    Masked::with_mask(value, x.mask).zeroed()
                }
                Contraction::Batch(m) => {
                    let value = contract_axis(&x.value, m, batch)?;
                    let mask = match x.positions(batch, channel)? {
                        Some(p) => {
                            let out = shape.with_dim(batch, m.nrows());
                            Some(positions_to_tensor(&mix_examples(&p, m), &out, batch, channel)?)
                        }
                        None => None,
                    };
                    Masked::with_mask(value, mask).zeroed()
                }
                Contraction::Spatial { axis, matrix } => {
                    let spatial = shape.spatial_dims(batch, channel);
                    let index = self.spatial_index(*axis, &shape, batch, channel)?;
                    let (p, _) = self.position_matrix(matrix, index, &spatial)?;
                    let out = shape.with_dim(normalize_axis(*axis, shape.rank())?, matrix.nrows());
                    mix_masked(&x, batch, channel, &[PositionMap::single(p)], &out)
                }
            }
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k))
    }
}
