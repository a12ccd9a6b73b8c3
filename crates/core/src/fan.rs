//! # Fan-Out and Fan-In
//!
//! `FanOut` copies one value into a tuple; the fan-in layers merge a tuple
//! back into one value.
//!
//! | Layer | Merge | Branches must be |
//! |-------|-------|------------------|
//! | [`FanInSum`] | `K = Σ K_i` | Gaussian (when more than one) |
//! | [`FanInProd`] | `K = K_a ⊙ K_b` | exactly two, of any distribution |
//! | [`FanInConcat`] | channel: `Σ (C_i / C) K_i`; batch, spatial: block diagonal | Gaussian unless channel |
//!
//! All branches must agree on shapes (except along a concatenated axis),
//! diagonal storage, axis roles and the presence of the tangent kernel.

use ndarray::{concatenate, Array1, Array2, ArrayD, Axis, IxDyn, Slice};
use rand::rngs::StdRng;

use crate::diagonal::DiagonalReqs;
use crate::error::{KernelError, Result};
use crate::kernel::{field_blocks, Field, Kernel};
use crate::layer::{ApplyArgs, Layer, LayerArgs, LayerMeta, Params};
use crate::layout::{assemble, Block};
use crate::mask::{combine, Masked};
use crate::nested::Nested;
use crate::shape::{normalize_axis, Shape};

/// Replicate the input `n` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub n: usize,
}

impl FanOut {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl Layer for FanOut {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new(format!("FanOut({})", self.n)).with_diagonal(DiagonalReqs::IDENTITY)
    }

    fn init(&self, _rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        Ok((Nested::Tuple(vec![input.clone(); self.n]), Params::None))
    }

    fn apply(&self, _params: &Params, inputs: Nested<Masked>, _args: &ApplyArgs) -> Result<Nested<Masked>> {
        Ok(Nested::Tuple(vec![inputs; self.n]))
    }

    fn kernel(&self, inputs: Nested<Kernel>, _args: &LayerArgs) -> Result<Nested<Kernel>> {
        Ok(Nested::Tuple(vec![inputs; self.n]))
    }
}

/// Sum of the branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanInSum;

/// Elementwise (Hadamard) product of exactly two branches.
///
/// The product rule holds for branches that are independent in the wide
/// limit, e.g. each starting with its own affine layer. Branches need not be
/// Gaussian; the output never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanInProd;

/// Concatenation of the branches along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanInConcat {
    pub axis: isize,
    /// Channel axis of the finite-width tensors, used to merge their masks.
    pub channel_axis: isize,
}

impl FanInConcat {
    pub fn new(axis: isize) -> Self {
        Self {
            axis,
            channel_axis: -1,
        }
    }

    pub fn with_channel_axis(mut self, channel_axis: isize) -> Self {
        self.channel_axis = channel_axis;
        self
    }
}

/// Common preconditions of every fan-in.
fn check_branches(layer: &str, kernels: &[Kernel], gaussian: bool) -> Result<()> {
    let Some(first) = kernels.first() else {
        return Err(KernelError::BranchCount {
            layer: layer.to_string(),
            expected: "at least 1".to_string(),
            got: 0,
        });
    };
    for (index, kernel) in kernels.iter().enumerate() {
        if gaussian && kernels.len() > 1 && !kernel.is_gaussian {
            return Err(KernelError::NonGaussianFanIn {
                layer: layer.to_string(),
                index,
            });
        }
        if kernel.diagonal_batch != first.diagonal_batch
            || kernel.diagonal_spatial != first.diagonal_spatial
        {
            return Err(KernelError::DiagonalMismatch {
                layer: layer.to_string(),
                reason: format!("branch {index} is stored differently from branch 0"),
            });
        }
        if kernel.x1_is_x2 != first.x1_is_x2 {
            return Err(KernelError::Structure {
                reason: format!("{layer}: branch {index} disagrees on whether x1 is x2"),
            });
        }
        if kernel.ntk.is_some() != first.ntk.is_some() {
            return Err(KernelError::Invariant {
                reason: format!("{layer}: branch {index} disagrees on the presence of ntk"),
            });
        }
        for (role, expected, got) in [
            ("batch", first.batch_axis, kernel.batch_axis),
            ("channel", first.channel_axis, kernel.channel_axis),
        ] {
            if expected != got {
                return Err(KernelError::AxisMismatch {
                    layer: layer.to_string(),
                    role: role.to_string(),
                    expected,
                    got,
                });
            }
        }
    }
    Ok(())
}

fn same_shapes(kernels: &[Kernel]) -> Result<()> {
    let Some(first) = kernels.first() else {
        return Ok(());
    };
    for kernel in &kernels[1..] {
        for (expected, got) in [(&first.shape1, &kernel.shape1), (&first.shape2, &kernel.shape2)] {
            if expected != got {
                return Err(KernelError::ShapeMismatch {
                    expected: expected.clone(),
                    got: got.clone(),
                });
            }
        }
    }
    Ok(())
}

fn same_values(layer: &str, values: &[Masked]) -> Result<()> {
    if values.is_empty() {
        return Err(KernelError::BranchCount {
            layer: layer.to_string(),
            expected: "at least 1".to_string(),
            got: 0,
        });
    }
    let first = values[0].shape();
    for value in &values[1..] {
        if value.shape() != first {
            return Err(KernelError::ShapeMismatch {
                expected: first,
                got: value.shape(),
            });
        }
    }
    Ok(())
}

fn split_first(layer: &str, kernels: Vec<Kernel>) -> Result<(Kernel, Vec<Kernel>)> {
    let mut iter = kernels.into_iter();
    let first = iter.next().ok_or_else(|| KernelError::BranchCount {
        layer: layer.to_string(),
        expected: "at least 1".to_string(),
        got: 0,
    })?;
    Ok((first, iter.collect()))
}

fn add_optional(acc: Option<ArrayD<f64>>, next: Option<&ArrayD<f64>>) -> Option<ArrayD<f64>> {
    match (acc, next) {
        (Some(a), Some(b)) => Some(a + b),
        (a, _) => a,
    }
}

fn tensor_masks(values: &[Masked], all: bool) -> Option<ArrayD<bool>> {
    let masks: Vec<Option<&ArrayD<bool>>> = values.iter().map(|v| v.mask.as_ref()).collect();
    combine(&masks, all)
}

fn kernel_masks(kernels: &[Kernel], all: bool) -> (Option<Array2<bool>>, Option<Array2<bool>>) {
    let m1: Vec<_> = kernels.iter().map(|k| k.mask1.as_ref()).collect();
    let m2: Vec<_> = kernels.iter().map(|k| k.mask2.as_ref()).collect();
    (combine(&m1, all), combine(&m2, all))
}

impl Layer for FanInSum {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new("FanInSum").with_diagonal(DiagonalReqs::IDENTITY)
    }

    fn init(&self, _rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let shapes = input.clone().into_leaves()?;
        let first = shapes.first().cloned().ok_or_else(|| KernelError::BranchCount {
            layer: "FanInSum".to_string(),
            expected: "at least 1".to_string(),
            got: 0,
        })?;
        if let Some(other) = shapes.iter().find(|s| **s != first) {
            return Err(KernelError::ShapeMismatch {
                expected: first,
                got: other.clone(),
            });
        }
        Ok((Nested::Leaf(first), Params::None))
    }

    fn apply(&self, _params: &Params, inputs: Nested<Masked>, _args: &ApplyArgs) -> Result<Nested<Masked>> {
        let values = inputs.into_leaves()?;
        same_values("FanInSum", &values)?;
        let mask = tensor_masks(&values, true);
        let mut sum = values[0].value.clone();
        for value in &values[1..] {
            sum = sum + &value.value;
        }
        Ok(Nested::Leaf(Masked::with_mask(sum, mask)))
    }

    fn kernel(&self, inputs: Nested<Kernel>, _args: &LayerArgs) -> Result<Nested<Kernel>> {
        let kernels = inputs.into_leaves()?;
        check_branches("FanInSum", &kernels, true)?;
        same_shapes(&kernels)?;
        let (mask1, mask2) = kernel_masks(&kernels, true);
        let is_gaussian = kernels.iter().all(|k| k.is_gaussian);

        let (first, rest) = split_first("FanInSum", kernels)?;
        let mut out = first;
        for kernel in &rest {
            out.nngp = out.nngp + &kernel.nngp;
            out.cov1 = out.cov1 + &kernel.cov1;
            out.ntk = add_optional(out.ntk, kernel.ntk.as_ref());
            out.cov2 = add_optional(out.cov2, kernel.cov2.as_ref());
        }
        Ok(Nested::Leaf(Kernel {
            is_gaussian,
            mask1,
            mask2,
            ..out
        }))
    }
}

impl Layer for FanInProd {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new("FanInProd").with_diagonal(DiagonalReqs::IDENTITY)
    }

    fn init(&self, _rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let shapes = input.clone().into_leaves()?;
        match shapes.as_slice() {
            [a, b] if a == b => Ok((Nested::Leaf(a.clone()), Params::None)),
            [a, b] => Err(KernelError::ShapeMismatch {
                expected: a.clone(),
                got: b.clone(),
            }),
            _ => Err(two_branches(shapes.len())),
        }
    }

    fn apply(&self, _params: &Params, inputs: Nested<Masked>, _args: &ApplyArgs) -> Result<Nested<Masked>> {
        let values = inputs.into_leaves()?;
        if values.len() != 2 {
            return Err(two_branches(values.len()));
        }
        same_values("FanInProd", &values)?;
        let mask = tensor_masks(&values, false);
        let product = &values[0].value * &values[1].value;
        Ok(Nested::Leaf(Masked::with_mask(product, mask)))
    }

    fn kernel(&self, inputs: Nested<Kernel>, _args: &LayerArgs) -> Result<Nested<Kernel>> {
        let kernels = inputs.into_leaves()?;
        if kernels.len() != 2 {
            return Err(two_branches(kernels.len()));
        }
        check_branches("FanInProd", &kernels, false)?;
        same_shapes(&kernels)?;
        let (mask1, mask2) = kernel_masks(&kernels, false);
        let (a, b) = (&kernels[0], &kernels[1]);

        let ntk = match (&a.ntk, &b.ntk) {
            (Some(ta), Some(tb)) => Some(ta * &b.nngp + &a.nngp * tb),
            _ => None,
        };
        let cov2 = match (&a.cov2, &b.cov2) {
            (Some(ca), Some(cb)) => Some(ca * cb),
            _ => None,
        };
        Ok(Nested::Leaf(Kernel {
            nngp: &a.nngp * &b.nngp,
            ntk,
            cov1: &a.cov1 * &b.cov1,
            cov2,
            is_gaussian: false,
            mask1,
            mask2,
            ..a.clone()
        }))
    }
}

fn two_branches(got: usize) -> KernelError {
    KernelError::BranchCount {
        layer: "FanInProd".to_string(),
        expected: "2".to_string(),
        got,
    }
}

/// Shape of shapes concatenated along `axis`.
fn concat_shape(shapes: &[&Shape], axis: usize) -> Result<Shape> {
    let Some(first) = shapes.first() else {
        return Err(KernelError::BranchCount {
            layer: "FanInConcat".to_string(),
            expected: "at least 1".to_string(),
            got: 0,
        });
    };
    let mut total = 0;
    for shape in shapes {
        if shape.rank() != first.rank() || !shape.agrees_except(first, axis) {
            return Err(KernelError::ShapeMismatch {
                expected: (*first).clone(),
                got: (*shape).clone(),
            });
        }
        total += shape.dim(axis)?;
    }
    Ok(first.with_dim(axis, total))
}

/// Block-diagonal placement of tensors along their two leading axes.
fn block_diagonal(tensors: &[&ArrayD<f64>]) -> ArrayD<f64> {
    let rows: usize = tensors.iter().map(|t| t.shape()[0]).sum();
    let cols: usize = tensors.iter().map(|t| t.shape()[1]).sum();
    let mut shape = vec![rows, cols];
    if let Some(t) = tensors.first() {
        shape.extend_from_slice(&t.shape()[2..]);
    }
    let mut out = ArrayD::zeros(IxDyn(&shape));
    let (mut r, mut c) = (0, 0);
    for t in tensors {
        let (n, m) = (t.shape()[0], t.shape()[1]);
        out.slice_each_axis_mut(|ax| match ax.axis.index() {
            0 => Slice::from(r..r + n),
            1 => Slice::from(c..c + m),
            _ => Slice::from(..),
        })
        .assign(*t);
        r += n;
        c += m;
    }
    out
}

/// For each branch, where its flat positions land in the concatenated grid.
fn position_offsets(spatial: &[Vec<usize>], along: usize) -> (Vec<usize>, Vec<Vec<usize>>) {
    let mut out_spatial = spatial.first().cloned().unwrap_or_default();
    out_spatial[along] = spatial.iter().map(|s| s[along]).sum();

    let mut offset = 0;
    let maps = spatial
        .iter()
        .map(|dims| {
            let count: usize = dims.iter().product();
            let map = (0..count)
                .map(|flat| {
                    let mut rest = flat;
                    let mut index = vec![0; dims.len()];
                    for (d, size) in dims.iter().enumerate().rev() {
                        index[d] = rest % size;
                        rest /= size;
                    }
                    index[along] += offset;
                    index
                        .iter()
                        .zip(&out_spatial)
                        .fold(0, |acc, (i, size)| acc * size + i)
                })
                .collect();
            offset += dims[along];
            map
        })
        .collect();
    (out_spatial, maps)
}

impl FanInConcat {
    fn label(&self) -> String {
        format!("FanInConcat({})", self.axis)
    }

    fn required(&self, value: Option<ArrayD<f64>>, field: &str) -> Result<ArrayD<f64>> {
        value.ok_or_else(|| KernelError::Invariant {
            reason: format!("{}: {field} is missing", self.label()),
        })
    }

    fn concat_channels(&self, kernels: Vec<Kernel>, channel: usize) -> Result<Kernel> {
        let total: usize = kernels
            .iter()
            .map(|k| k.shape1.dim(channel))
            .sum::<Result<usize>>()?;
        let weight = |k: &Kernel| -> Result<f64> {
            Ok(k.shape1.dim(channel)? as f64 / total.max(1) as f64)
        };
        let shape1 = concat_shape(&kernels.iter().map(|k| &k.shape1).collect::<Vec<_>>(), channel)?;
        let shape2 = concat_shape(&kernels.iter().map(|k| &k.shape2).collect::<Vec<_>>(), channel)?;
        let (mask1, mask2) = kernel_masks(&kernels, true);
        let is_gaussian = kernels.iter().all(|k| k.is_gaussian);

        let weights = kernels.iter().map(weight).collect::<Result<Vec<f64>>>()?;
        let (first, rest) = split_first(&self.label(), kernels)?;
        let w0 = weights[0];
        let mut out = first.map_values(|_, v| w0 * v);
        for (kernel, w) in rest.iter().zip(&weights[1..]) {
            out.nngp = out.nngp + &kernel.nngp * *w;
            out.cov1 = out.cov1 + &kernel.cov1 * *w;
            out.ntk = add_optional(out.ntk, kernel.ntk.as_ref().map(|t| t * *w).as_ref());
            out.cov2 = add_optional(out.cov2, kernel.cov2.as_ref().map(|t| t * *w).as_ref());
        }
        Ok(Kernel {
            shape1,
            shape2,
            is_gaussian,
            mask1,
            mask2,
            ..out
        })
    }

    fn concat_batch(&self, kernels: Vec<Kernel>, batch: usize) -> Result<Kernel> {
        let shape1 = concat_shape(&kernels.iter().map(|k| &k.shape1).collect::<Vec<_>>(), batch)?;
        let shape2 = concat_shape(&kernels.iter().map(|k| &k.shape2).collect::<Vec<_>>(), batch)?;
        let positions = kernels[0].positions();

        let cov = |select: fn(&Kernel) -> Option<&ArrayD<f64>>| -> Result<Option<ArrayD<f64>>> {
            let parts: Option<Vec<&ArrayD<f64>>> = kernels.iter().map(select).collect();
            let Some(parts) = parts else { return Ok(None) };
            if kernels[0].diagonal_batch {
                let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
                Ok(Some(concatenate(Axis(0), &views)?))
            } else {
                Ok(Some(block_diagonal(&parts)))
            }
        };
        let cov1 = self.required(cov(|k| Some(&k.cov1))?, "cov1")?;
        let cov2 = cov(|k| k.cov2.as_ref())?;

        let nngp = block_diagonal(&kernels.iter().map(|k| &k.nngp).collect::<Vec<_>>());
        let ntks: Option<Vec<&ArrayD<f64>>> = kernels.iter().map(|k| k.ntk.as_ref()).collect();
        let ntk = ntks.map(|t| block_diagonal(&t));

        let stack_masks = |select: fn(&Kernel) -> Option<&Array2<bool>>, n: fn(&Kernel) -> usize| {
            if kernels.iter().all(|k| select(k).is_none()) {
                return Ok(None);
            }
            let filled: Vec<Array2<bool>> = kernels
                .iter()
                .map(|k| {
                    select(k)
                        .cloned()
                        .unwrap_or_else(|| Array2::from_elem((n(k), positions), false))
                })
                .collect();
            let views: Vec<_> = filled.iter().map(|m| m.view()).collect();
            concatenate(Axis(0), &views).map(Some)
        };
        let mask1 = stack_masks(|k| k.mask1.as_ref(), |k| k.shape1.dims[k.batch_axis])?;
        let mask2 = stack_masks(|k| k.mask2.as_ref(), |k| k.shape2.dims[k.batch_axis])?;

        let (first, _) = split_first(&self.label(), kernels)?;
        Ok(Kernel {
            nngp,
            ntk,
            cov1,
            cov2,
            mask1,
            mask2,
            shape1,
            shape2,
            ..first
        })
    }

    fn concat_spatial(&self, kernels: Vec<Kernel>, axis: usize) -> Result<Kernel> {
        let first = &kernels[0];
        let spatial_axes = first.shape1.spatial_axes(first.batch_axis, first.channel_axis);
        let along = spatial_axes
            .iter()
            .position(|&a| a == axis)
            .ok_or_else(|| KernelError::InvalidConfig {
                layer: self.label(),
                reason: format!("axis {axis} is not a spatial axis"),
            })?;
        let shape1 = concat_shape(&kernels.iter().map(|k| &k.shape1).collect::<Vec<_>>(), axis)?;
        let shape2 = concat_shape(&kernels.iter().map(|k| &k.shape2).collect::<Vec<_>>(), axis)?;
        let spatial: Vec<Vec<usize>> = kernels.iter().map(|k| k.spatial()).collect();
        let (out_spatial, maps) = position_offsets(&spatial, along);
        let out_positions: usize = out_spatial.iter().product();
        let diagonal = first.diagonal_spatial;

        let merge = |field: Field| -> Result<Option<ArrayD<f64>>> {
            let mut per_branch = Vec::with_capacity(kernels.len());
            for kernel in &kernels {
                match field_blocks(kernel, field)? {
                    Some(blocks) => per_branch.push(blocks),
                    None => return Ok(None),
                }
            }
            let lead = kernels[0].pairing(field).lead;
            let count = per_branch.first().map_or(0, |b| b.len());
            let mut out = Vec::with_capacity(count);
            for l in 0..count {
                let mut full = Array2::zeros((out_positions, out_positions));
                let mut diag = Array1::zeros(out_positions);
                for (blocks, map) in per_branch.iter().zip(&maps) {
                    match &blocks[l] {
                        Block::Full(m) => {
                            for ((p, q), v) in m.indexed_iter() {
                                full[[map[p], map[q]]] = *v;
                            }
                        }
                        Block::Diagonal(d) => {
                            for (p, v) in d.iter().enumerate() {
                                diag[map[p]] = *v;
                            }
                        }
                    }
                }
                out.push(if diagonal {
                    Block::Diagonal(diag)
                } else {
                    Block::Full(full)
                });
            }
            assemble(out, &lead, &out_spatial, diagonal).map(Some)
        };

        let nngp = self.required(merge(Field::Nngp)?, "nngp")?;
        let ntk = merge(Field::Ntk)?;
        let cov1 = self.required(merge(Field::Cov1)?, "cov1")?;
        let cov2 = merge(Field::Cov2)?;

        let place_masks = |select: fn(&Kernel) -> Option<&Array2<bool>>| -> Option<Array2<bool>> {
            let rows = kernels.iter().find_map(|k| select(k).map(|m| m.nrows()))?;
            let mut out = Array2::from_elem((rows, out_positions), false);
            for (kernel, map) in kernels.iter().zip(&maps) {
                if let Some(mask) = select(kernel) {
                    for ((n, p), &m) in mask.indexed_iter() {
                        out[[n, map[p]]] = m;
                    }
                }
            }
            Some(out)
        };
        let mask1 = place_masks(|k| k.mask1.as_ref());
        let mask2 = place_masks(|k| k.mask2.as_ref());

        let (first, _) = split_first(&self.label(), kernels)?;
        Ok(Kernel {
            nngp,
            ntk,
            cov1,
            cov2,
            mask1,
            mask2,
            shape1,
            shape2,
            ..first
        })
    }
}

impl Layer for FanInConcat {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new(self.label()).with_diagonal(DiagonalReqs::IDENTITY)
    }

    fn init(&self, _rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let shapes = input.clone().into_leaves()?;
        let rank = shapes.first().map_or(0, Shape::rank);
        let axis = normalize_axis(self.axis, rank)?;
        let refs: Vec<&Shape> = shapes.iter().collect();
        Ok((Nested::Leaf(concat_shape(&refs, axis)?), Params::None))
    }

    fn apply(&self, _params: &Params, inputs: Nested<Masked>, _args: &ApplyArgs) -> Result<Nested<Masked>> {
        let values = inputs.into_leaves()?;
        let rank = values.first().map_or(0, |v| v.value.ndim());
        let axis = normalize_axis(self.axis, rank)?;
        let channel = normalize_axis(self.channel_axis, rank)?;
        let shapes: Vec<Shape> = values.iter().map(Masked::shape).collect();
        concat_shape(&shapes.iter().collect::<Vec<_>>(), axis)?;

        let views: Vec<_> = values.iter().map(|v| v.value.view()).collect();
        let value = concatenate(Axis(axis), &views)?;

        let mask = if axis == channel {
            tensor_masks(&values, true)
        } else if values.iter().all(|v| v.mask.is_none()) {
            None
        } else {
            let filled: Vec<ArrayD<bool>> = values
                .iter()
                .map(|v| {
                    v.mask.clone().unwrap_or_else(|| {
                        ArrayD::from_elem(IxDyn(&v.shape().with_dim(channel, 1).dims), false)
                    })
                })
                .collect();
            let views: Vec<_> = filled.iter().map(|m| m.view()).collect();
            Some(concatenate(Axis(axis), &views)?)
        };
        Ok(Nested::Leaf(Masked::with_mask(value, mask)))
    }

    fn kernel(&self, inputs: Nested<Kernel>, _args: &LayerArgs) -> Result<Nested<Kernel>> {
        let kernels = inputs.into_leaves()?;
        let Some(first) = kernels.first() else {
            return Err(KernelError::BranchCount {
                layer: self.label(),
                expected: "at least 1".to_string(),
                got: 0,
            });
        };
        let axis = normalize_axis(self.axis, first.shape1.rank())?;
        let (batch, channel) = (first.batch_axis, first.channel_axis);

        let out = if axis == channel {
            check_branches(&self.label(), &kernels, false)?;
            self.concat_channels(kernels, channel)?
        } else if axis == batch {
            check_branches(&self.label(), &kernels, true)?;
            self.concat_batch(kernels, batch)?
        } else {
            check_branches(&self.label(), &kernels, true)?;
            self.concat_spatial(kernels, axis)?
        };
        Ok(Nested::Leaf(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::InputSpec;
    use approx::assert_relative_eq;

    fn input(batch: usize, positions: usize, channels: usize, offset: f64) -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(&[batch, positions, channels]), |ix| {
            offset + (ix[0] * 7 + ix[1] * 3 + ix[2]) as f64 * 0.25
        })
    }

    fn kernel(x: &ArrayD<f64>, diagonal_batch: bool, diagonal_spatial: bool) -> Kernel {
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: 2,
            diagonal_batch,
            diagonal_spatial,
            compute_ntk: true,
            mask_constant: None,
        };
        let mut k = Kernel::from_inputs(x, None, &spec).unwrap();
        k.is_gaussian = true;
        k
    }

    fn pair(a: Kernel, b: Kernel) -> Nested<Kernel> {
        Nested::Tuple(vec![Nested::Leaf(a), Nested::Leaf(b)])
    }

    #[test]
    fn test_fan_out_replicates() {
        let k = kernel(&input(2, 3, 2, 0.0), true, false);
        let out = FanOut::new(3)
            .kernel(Nested::Leaf(k.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaves()
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|o| *o == k));
    }

    #[test]
    fn test_sum_adds_fields() {
        let a = kernel(&input(2, 3, 2, 0.0), true, false);
        let b = kernel(&input(2, 3, 2, 1.0), true, false);
        let out = FanInSum
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.nngp, &a.nngp + &b.nngp);
        assert_eq!(out.cov1, &a.cov1 + &b.cov1);
        assert!(out.is_gaussian);
    }

    #[test]
    fn test_sum_rejects_non_gaussian_branch() {
        let a = kernel(&input(2, 3, 2, 0.0), true, false);
        let mut b = a.clone();
        b.is_gaussian = false;
        let err = FanInSum.kernel(pair(a, b), &LayerArgs::default()).unwrap_err();
        assert_eq!(
            err,
            KernelError::NonGaussianFanIn {
                layer: "FanInSum".into(),
                index: 1
            }
        );
    }

    #[test]
    fn test_sum_rejects_mixed_storage() {
        let x = input(2, 3, 2, 0.0);
        let err = FanInSum
            .kernel(pair(kernel(&x, true, false), kernel(&x, true, true)), &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::DiagonalMismatch { .. }));
    }

    #[test]
    fn test_sum_masks_and() {
        let mut a = kernel(&input(1, 2, 2, 0.0), true, false);
        let mut b = a.clone();
        a.mask1 = Some(ndarray::array![[true, true]]);
        b.mask1 = Some(ndarray::array![[true, false]]);
        let out = FanInSum
            .kernel(pair(a, b), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.mask1.unwrap(), ndarray::array![[true, false]]);
    }

    #[test]
    fn test_prod_tangent_rule() {
        let mut a = kernel(&input(2, 2, 2, 0.0), true, false);
        let mut b = kernel(&input(2, 2, 2, 1.0), true, false);
        a.ntk = Some(a.nngp.mapv(|v| v + 1.0));
        b.ntk = Some(b.nngp.mapv(|v| 2.0 * v));
        let out = FanInProd
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        let expected = a.ntk.as_ref().unwrap() * &b.nngp + &a.nngp * b.ntk.as_ref().unwrap();
        assert_eq!(out.ntk.unwrap(), expected);
        assert_eq!(out.nngp, &a.nngp * &b.nngp);
        assert!(!out.is_gaussian);
    }

    #[test]
    fn test_prod_accepts_non_gaussian_branches() {
        let mut a = kernel(&input(2, 2, 2, 0.0), true, false);
        let b = kernel(&input(2, 2, 2, 1.0), true, false);
        a.is_gaussian = false;
        let out = FanInProd
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.nngp, &a.nngp * &b.nngp);
        assert_eq!(out.cov1, &a.cov1 * &b.cov1);
        assert!(!out.is_gaussian);
    }

    #[test]
    fn test_prod_needs_two_branches() {
        let a = kernel(&input(2, 2, 2, 0.0), true, false);
        let three = Nested::Tuple(vec![Nested::Leaf(a.clone()); 3]);
        let err = FanInProd.kernel(three, &LayerArgs::default()).unwrap_err();
        assert!(matches!(err, KernelError::BranchCount { got: 3, .. }));
    }

    #[test]
    fn test_concat_channels_weighted() {
        let x = input(2, 3, 1, 0.0);
        let y = input(2, 3, 3, 2.0);
        let (a, b) = (kernel(&x, true, false), kernel(&y, true, false));
        let out = FanInConcat::new(-1)
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.shape1.dims, vec![2, 3, 4]);
        let joined = concatenate(Axis(2), &[x.view(), y.view()]).unwrap();
        let direct = kernel(&joined, true, false);
        for (got, want) in out.nngp.iter().zip(direct.nngp.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_concat_batch_block_diagonal() {
        let a = kernel(&input(2, 2, 2, 0.0), false, false);
        let b = kernel(&input(1, 2, 2, 1.0), false, false);
        let out = FanInConcat::new(0)
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.nngp.shape(), &[3, 3, 2, 2]);
        assert_eq!(out.cov1.shape(), &[3, 3, 2, 2]);
        assert_eq!(out.nngp[[0, 2, 0, 0]], 0.0);
        assert_eq!(out.nngp[[2, 2, 1, 1]], b.nngp[[0, 0, 1, 1]]);
        out.check_invariants().unwrap();
    }

    #[test]
    fn test_concat_batch_diagonal_stacks() {
        let a = kernel(&input(2, 2, 2, 0.0), true, true);
        let b = kernel(&input(1, 2, 2, 1.0), true, true);
        let out = FanInConcat::new(0)
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.cov1.shape(), &[3, 2]);
        assert_eq!(out.cov1[[2, 1]], b.cov1[[0, 1]]);
    }

    #[test]
    fn test_concat_spatial_places_blocks() {
        let a = kernel(&input(1, 2, 2, 0.0), true, false);
        let b = kernel(&input(1, 1, 2, 1.0), true, false);
        let out = FanInConcat::new(1)
            .kernel(pair(a.clone(), b.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.nngp.shape(), &[1, 1, 3, 3]);
        assert_eq!(out.nngp[[0, 0, 1, 0]], a.nngp[[0, 0, 1, 0]]);
        assert_eq!(out.nngp[[0, 0, 2, 2]], b.nngp[[0, 0, 0, 0]]);
        assert_eq!(out.nngp[[0, 0, 0, 2]], 0.0);
    }

    #[test]
    fn test_concat_apply_masks() {
        let x = Masked::with_mask(
            ArrayD::zeros(IxDyn(&[1, 2, 2])),
            Some(ArrayD::from_elem(IxDyn(&[1, 2, 1]), true)),
        );
        let y = Masked::new(ArrayD::zeros(IxDyn(&[1, 1, 2])));
        let out = FanInConcat::new(1)
            .apply(
                &Params::None,
                Nested::Tuple(vec![Nested::Leaf(x), Nested::Leaf(y)]),
                &ApplyArgs::default(),
            )
            .unwrap()
            .into_leaf()
            .unwrap();
        let mask = out.mask.unwrap();
        assert_eq!(mask.shape(), &[1, 3, 1]);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![true, true, false]);
    }
}
