//! # Kernel Values
//!
//! A [`Kernel`] holds the second moments of pre-activations for one or two
//! input batches, as the network width goes to infinity:
//!
//! ```text
//!   nngp   E[f(x1) f(x2)]              [N1, N2, spatial]
//!   ntk    tangent kernel (optional)   same shape as nngp
//!   cov1   E[f(x1) f(x1)]              [N1, (N1,) spatial]
//!   cov2   E[f(x2) f(x2)]              absent when x1 is x2
//! ```
//!
//! Each layer consumes a kernel and returns a new one; nothing is mutated in
//! place. See [`crate::layout`] for the tensor layout and the block helpers.

use ndarray::{stack, Array1, Array2, Array3, ArrayD, ArrayView2, Axis, IxDyn};

use crate::error::{KernelError, Result};
use crate::layout::{
    assemble, blocks, map_field, Block, Example, Operand, Pairing, PositionMap, PositionMaps,
};
use crate::mask::{mask_block, mask_input};
use crate::shape::Shape;

/// The four tensor fields of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Nngp,
    Ntk,
    Cov1,
    Cov2,
}

/// Field tensors produced by a transform, before they are put back into a
/// [`Kernel`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fields {
    pub nngp: ArrayD<f64>,
    pub ntk: Option<ArrayD<f64>>,
    pub cov1: ArrayD<f64>,
    pub cov2: Option<ArrayD<f64>>,
}

/// Tensor shapes and axis roles after a transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub shape1: Shape,
    pub shape2: Shape,
    pub batch_axis: usize,
    pub channel_axis: usize,
}

impl Layout {
    /// Spatial sizes of this layout.
    pub fn spatial(&self) -> Vec<usize> {
        self.shape1.spatial_dims(self.batch_axis, self.channel_axis)
    }
}

/// How the raw input kernel is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub batch_axis: usize,
    pub channel_axis: usize,
    pub diagonal_batch: bool,
    pub diagonal_spatial: bool,
    pub compute_ntk: bool,
    pub mask_constant: Option<f64>,
}

/// Infinite-width NNGP / NTK statistics of one or two input batches.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub nngp: ArrayD<f64>,
    pub ntk: Option<ArrayD<f64>>,
    pub cov1: ArrayD<f64>,
    pub cov2: Option<ArrayD<f64>>,
    /// `x2` was not given; `cov2` is absent and all second-operand data is
    /// read from the first operand.
    pub x1_is_x2: bool,
    /// Pre-activations are exactly jointly Gaussian.
    pub is_gaussian: bool,
    pub diagonal_batch: bool,
    pub diagonal_spatial: bool,
    pub batch_axis: usize,
    pub channel_axis: usize,
    /// Position masks, `(N1, S)` and `(N2, S)`.
    pub mask1: Option<Array2<bool>>,
    pub mask2: Option<Array2<bool>>,
    pub shape1: Shape,
    pub shape2: Shape,
}

impl Kernel {
    /// Literal correlations of raw inputs, `(1/C) sum_c x1[a,p,c] x2[b,q,c]`.
    pub fn from_inputs(x1: &ArrayD<f64>, x2: Option<&ArrayD<f64>>, spec: &InputSpec) -> Result<Kernel> {
        let shape1 = Shape::new(x1.shape().to_vec());
        let shape2 = x2.map_or_else(|| shape1.clone(), |x| Shape::new(x.shape().to_vec()));
        if !shape1.agrees_except(&shape2, spec.batch_axis) {
            return Err(KernelError::ShapeMismatch {
                expected: shape1,
                got: shape2,
            });
        }

        let (c1, mask1) = mask_input(x1, spec.batch_axis, spec.channel_axis, spec.mask_constant)?;
        let (c2, mask2) = match x2 {
            Some(x) => {
                let (c, m) = mask_input(x, spec.batch_axis, spec.channel_axis, spec.mask_constant)?;
                (Some(c), m)
            }
            None => (None, None),
        };

        let spatial = shape1.spatial_dims(spec.batch_axis, spec.channel_axis);
        let channels = shape1.dim(spec.channel_axis)?.max(1) as f64;
        let diag_s = spec.diagonal_spatial;

        let right = c2.as_ref().unwrap_or(&c1);
        let nngp = gram(&c1, right, false, &spatial, diag_s, channels)?;
        let cov1 = gram(&c1, &c1, spec.diagonal_batch, &spatial, diag_s, channels)?;
        let cov2 = c2
            .as_ref()
            .map(|c| gram(c, c, spec.diagonal_batch, &spatial, diag_s, channels))
            .transpose()?;
        let ntk = spec.compute_ntk.then(|| ArrayD::zeros(nngp.raw_dim()));

        let kernel = Kernel {
            nngp,
            ntk,
            cov1,
            cov2,
            x1_is_x2: x2.is_none(),
            is_gaussian: false,
            diagonal_batch: spec.diagonal_batch,
            diagonal_spatial: spec.diagonal_spatial,
            batch_axis: spec.batch_axis,
            channel_axis: spec.channel_axis,
            mask1,
            mask2,
            shape1,
            shape2,
        };
        kernel.check_invariants()?;
        Ok(kernel)
    }

    /// Spatial sizes, in tensor order.
    pub fn spatial(&self) -> Vec<usize> {
        self.shape1.spatial_dims(self.batch_axis, self.channel_axis)
    }

    /// Number of spatial positions.
    pub fn positions(&self) -> usize {
        self.spatial().iter().product()
    }

    pub fn layout(&self) -> Layout {
        Layout {
            shape1: self.shape1.clone(),
            shape2: self.shape2.clone(),
            batch_axis: self.batch_axis,
            channel_axis: self.channel_axis,
        }
    }

    /// Operand that holds the data of `operand` (the first one when x1 is x2).
    pub fn resolve(&self, operand: Operand) -> Operand {
        if self.x1_is_x2 {
            Operand::First
        } else {
            operand
        }
    }

    pub fn shape(&self, operand: Operand) -> &Shape {
        match self.resolve(operand) {
            Operand::First => &self.shape1,
            Operand::Second => &self.shape2,
        }
    }

    pub fn batch_size(&self, operand: Operand) -> usize {
        self.shape(operand).dims.get(self.batch_axis).copied().unwrap_or(0)
    }

    pub fn mask(&self, operand: Operand) -> Option<&Array2<bool>> {
        match self.resolve(operand) {
            Operand::First => self.mask1.as_ref(),
            Operand::Second => self.mask2.as_ref(),
        }
    }

    /// Self-covariance tensor of `operand`.
    pub fn cov(&self, operand: Operand) -> &ArrayD<f64> {
        match (self.resolve(operand), &self.cov2) {
            (Operand::Second, Some(cov2)) => cov2,
            _ => &self.cov1,
        }
    }

    pub fn field(&self, field: Field) -> Option<&ArrayD<f64>> {
        match field {
            Field::Nngp => Some(&self.nngp),
            Field::Ntk => self.ntk.as_ref(),
            Field::Cov1 => Some(&self.cov1),
            Field::Cov2 => self.cov2.as_ref(),
        }
    }

    /// Which examples each lead index of `field` correlates.
    pub fn pairing(&self, field: Field) -> Pairing {
        let n1 = self.batch_size(Operand::First);
        let n2 = self.batch_size(Operand::Second);
        let second = self.resolve(Operand::Second);
        match field {
            Field::Nngp | Field::Ntk => Pairing {
                lead: vec![n1, n2],
                left: Operand::First,
                right: second,
            },
            Field::Cov1 | Field::Cov2 => {
                let (operand, n) = if field == Field::Cov1 {
                    (Operand::First, n1)
                } else {
                    (second, n2)
                };
                let lead = if self.diagonal_batch { vec![n] } else { vec![n, n] };
                Pairing {
                    lead,
                    left: operand,
                    right: operand,
                }
            }
        }
    }

    /// Covariance block of one example with itself.
    pub fn self_block(&self, example: Example) -> Result<Block> {
        let cov = self.cov(example.operand);
        let n = self.batch_size(example.operand);
        if example.index >= n {
            return Err(KernelError::Tensor {
                reason: format!("example {} out of range for batch of {n}", example.index),
            });
        }
        let row = cov.index_axis(Axis(0), example.index);
        let own = if self.diagonal_batch {
            row
        } else {
            row.index_axis_move(Axis(0), example.index)
        };
        let data: Vec<f64> = own.iter().copied().collect();
        let s = self.positions();
        if self.diagonal_spatial {
            Ok(Block::Diagonal(Array1::from(data)))
        } else {
            Ok(Block::Full(Array2::from_shape_vec((s, s), data)?))
        }
    }

    /// Per-position variances of one example.
    pub fn variances(&self, example: Example) -> Result<Array1<f64>> {
        Ok(self.self_block(example)?.diagonal())
    }

    /// Map every block of one field, keeping the lead layout.
    pub fn map_field<F>(
        &self,
        field: Field,
        out_spatial: &[usize],
        out_diagonal: bool,
        f: F,
    ) -> Result<Option<ArrayD<f64>>>
    where
        F: FnMut(Example, Example, Block) -> Result<Block>,
    {
        let Some(tensor) = self.field(field) else {
            return Ok(None);
        };
        let pairing = self.pairing(field);
        map_field(tensor, &pairing, self.diagonal_spatial, out_spatial, out_diagonal, f).map(Some)
    }

    /// Map the blocks of every present field.
    pub fn map_all<F>(&self, out_spatial: &[usize], out_diagonal: bool, mut f: F) -> Result<Fields>
    where
        F: FnMut(Field, Example, Example, Block) -> Result<Block>,
    {
        let mut run = |field: Field| {
            self.map_field(field, out_spatial, out_diagonal, |l, r, b| f(field, l, r, b))
        };
        let nngp = run(Field::Nngp)?;
        let ntk = run(Field::Ntk)?;
        let cov1 = run(Field::Cov1)?;
        let cov2 = run(Field::Cov2)?;
        match (nngp, cov1) {
            (Some(nngp), Some(cov1)) => Ok(Fields { nngp, ntk, cov1, cov2 }),
            _ => Err(KernelError::Invariant {
                reason: "nngp and cov1 must always be present".to_string(),
            }),
        }
    }

    /// Elementwise map of every present field's values.
    pub fn map_values(self, f: impl Fn(Field, f64) -> f64) -> Kernel {
        Kernel {
            nngp: self.nngp.mapv(|v| f(Field::Nngp, v)),
            ntk: self.ntk.map(|t| t.mapv(|v| f(Field::Ntk, v))),
            cov1: self.cov1.mapv(|v| f(Field::Cov1, v)),
            cov2: self.cov2.map(|t| t.mapv(|v| f(Field::Cov2, v))),
            ..self
        }
    }

    pub fn with_fields(self, fields: Fields) -> Kernel {
        Kernel {
            nngp: fields.nngp,
            ntk: fields.ntk,
            cov1: fields.cov1,
            cov2: fields.cov2,
            ..self
        }
    }

    pub fn with_layout(self, layout: Layout) -> Kernel {
        Kernel {
            shape1: layout.shape1,
            shape2: layout.shape2,
            batch_axis: layout.batch_axis,
            channel_axis: layout.channel_axis,
            ..self
        }
    }

    /// Apply a linear map over positions to every field and propagate masks.
    pub fn map_positions(self, layout: Layout, maps: &PositionMaps) -> Result<Kernel> {
        let out_spatial = layout.spatial();
        let diagonal = self.diagonal_spatial;
        let fields = self.map_all(&out_spatial, diagonal, |_, left, right, block| {
            PositionMap::apply_pair(maps.get(left)?, maps.get(right)?, block)
        })?;
        let mask1 = propagate(self.mask1.as_ref(), maps, Operand::First)?;
        let mask2 = propagate(self.mask2.as_ref(), maps, Operand::Second)?;
        Ok(Kernel {
            mask1,
            mask2,
            ..self.with_fields(fields).with_layout(layout)
        })
    }

    /// Zero every entry that touches a masked position.
    pub fn remask(self) -> Result<Kernel> {
        if self.mask1.is_none() && self.mask2.is_none() {
            return Ok(self);
        }
        let spatial = self.spatial();
        let diagonal = self.diagonal_spatial;
        let fields = self.map_all(&spatial, diagonal, |_, left, right, block| {
            let l = self.mask(left.operand).map(|m| m.row(left.index).to_vec());
            let r = self.mask(right.operand).map(|m| m.row(right.index).to_vec());
            Ok(mask_block(block, l.as_deref(), r.as_deref()))
        })?;
        Ok(self.with_fields(fields))
    }

    /// Compress batch and/or spatial dimensions to their diagonals.
    pub fn to_diagonal(self, batch: bool, spatial: bool) -> Result<Kernel> {
        let mut kernel = self;
        if spatial && !kernel.diagonal_spatial {
            let dims = kernel.spatial();
            let fields = kernel.map_all(&dims, true, |_, _, _, block| {
                Ok(Block::Diagonal(block.diagonal()))
            })?;
            kernel = Kernel {
                diagonal_spatial: true,
                ..kernel.with_fields(fields)
            };
        }
        if batch && !kernel.diagonal_batch {
            let cov1 = batch_diagonal(&kernel.cov1)?;
            let cov2 = kernel.cov2.as_ref().map(batch_diagonal).transpose()?;
            kernel = Kernel {
                cov1,
                cov2,
                diagonal_batch: true,
                ..kernel
            };
        }
        Ok(kernel)
    }

    /// Expected tensor shape of `field` under the current layout.
    pub fn expected_shape(&self, field: Field) -> Vec<usize> {
        let mut shape = self.pairing(field).lead;
        let spatial = self.spatial();
        shape.extend_from_slice(&spatial);
        if !self.diagonal_spatial {
            shape.extend_from_slice(&spatial);
        }
        shape
    }

    /// Check the structural invariants of a kernel value.
    pub fn check_invariants(&self) -> Result<()> {
        if self.x1_is_x2 == self.cov2.is_some() {
            return Err(KernelError::Invariant {
                reason: format!(
                    "cov2 must be present iff x1 is not x2 (x1_is_x2 = {})",
                    self.x1_is_x2
                ),
            });
        }
        let rank = self.shape1.rank();
        if self.batch_axis == self.channel_axis || self.batch_axis >= rank || self.channel_axis >= rank {
            return Err(KernelError::Invariant {
                reason: format!(
                    "axes ({}, {}) invalid for shape {}",
                    self.batch_axis, self.channel_axis, self.shape1
                ),
            });
        }
        if !self.shape1.agrees_except(&self.shape2, self.batch_axis) {
            return Err(KernelError::ShapeMismatch {
                expected: self.shape1.clone(),
                got: self.shape2.clone(),
            });
        }
        for field in [Field::Nngp, Field::Ntk, Field::Cov1, Field::Cov2] {
            if let Some(tensor) = self.field(field) {
                let expected = self.expected_shape(field);
                if tensor.shape() != expected.as_slice() {
                    return Err(KernelError::shape_mismatch(&expected, tensor.shape()));
                }
            }
        }
        let s = self.positions();
        for operand in [Operand::First, Operand::Second] {
            if let Some(mask) = self.mask(operand) {
                let expected = [self.batch_size(operand), s];
                if mask.shape() != &expected[..] {
                    return Err(KernelError::shape_mismatch(&expected, mask.shape()));
                }
            }
        }
        Ok(())
    }
}

fn propagate(mask: Option<&Array2<bool>>, maps: &PositionMaps, operand: Operand) -> Result<Option<Array2<bool>>> {
    let Some(mask) = mask else {
        return Ok(None);
    };
    let rows = mask
        .outer_iter()
        .enumerate()
        .map(|(n, row)| -> Result<Array1<bool>> {
            Ok(maps.get(Example::new(operand, n))?.propagate_mask(row))
        })
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    if views.is_empty() {
        return Ok(Some(mask.clone()));
    }
    Ok(Some(stack(Axis(0), &views)?))
}

/// Keep `cov[n, n, ...]` of a full-batch covariance.
fn batch_diagonal(cov: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let n = cov.shape().first().copied().unwrap_or(0);
    let rows: Vec<_> = (0..n)
        .map(|i| cov.index_axis(Axis(0), i).index_axis_move(Axis(0), i))
        .collect();
    if rows.is_empty() {
        let mut shape = cov.shape().to_vec();
        shape.remove(0);
        return Ok(ArrayD::zeros(IxDyn(&shape)));
    }
    Ok(stack(Axis(0), &rows)?)
}

/// Correlations between canonical `(batch, positions, channel)` inputs.
fn gram(
    left: &Array3<f64>,
    right: &Array3<f64>,
    batch_diagonal: bool,
    spatial: &[usize],
    spatial_diagonal: bool,
    channels: f64,
) -> Result<ArrayD<f64>> {
    let pair = |a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>| -> Block {
        if spatial_diagonal {
            Block::Diagonal((&a * &b).sum_axis(Axis(1)) / channels)
        } else {
            Block::Full(a.dot(&b.t()) / channels)
        }
    };
    let n1 = left.shape()[0];
    let n2 = right.shape()[0];
    let (lead, out): (Vec<usize>, Vec<Block>) = if batch_diagonal {
        (
            vec![n1],
            left.outer_iter()
                .zip(right.outer_iter())
                .map(|(a, b)| pair(a, b))
                .collect(),
        )
    } else {
        let mut out = Vec::with_capacity(n1 * n2);
        for a in left.outer_iter() {
            for b in right.outer_iter() {
                out.push(pair(a, b));
            }
        }
        (vec![n1, n2], out)
    };
    assemble(out, &lead, spatial, spatial_diagonal)
}

/// Blocks of a kernel field, exposed for transforms that merge several
/// kernels block by block.
pub fn field_blocks(kernel: &Kernel, field: Field) -> Result<Option<Vec<Block>>> {
    kernel
        .field(field)
        .map(|t| blocks(t, kernel.pairing(field).lead.len(), kernel.diagonal_spatial))
        .transpose()
}
