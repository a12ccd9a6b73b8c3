//! Helpers for layers that act on spatial positions: building per-example
//! position maps, replacing spatial sizes in a kernel layout, and applying
//! position matrices to finite-width values.

use ndarray::{Array1, Array2, Array3, ArrayD, Axis};

use widenet_core::layout::{from_canonical, to_canonical};
use widenet_core::mask::{positions_to_tensor, tensor_to_positions};
use widenet_core::{Example, KernelError, Kernel, Layout, Masked, Operand, PositionMap, PositionMaps, Result, Shape};

/// One map per example of each operand of `kernel`.
pub fn per_example<F>(kernel: &Kernel, mut f: F) -> Result<PositionMaps>
where
    F: FnMut(Example) -> Result<PositionMap>,
{
    let mut build = |operand: Operand| -> Result<Vec<PositionMap>> {
        let operand = kernel.resolve(operand);
        (0..kernel.batch_size(operand))
            .map(|n| f(Example::new(operand, n)))
            .collect()
    };
    let first = build(Operand::First)?;
    let second = build(Operand::Second)?;
    Ok(PositionMaps::PerExample { first, second })
}

/// Kernel layout with the spatial axes resized (tensor order) and,
/// optionally, a new channel count.
pub fn resized(kernel: &Kernel, spatial: &[usize], channels: Option<usize>) -> Result<Layout> {
    let resize = |shape: &Shape| -> Result<Shape> {
        let axes = shape.spatial_axes(kernel.batch_axis, kernel.channel_axis);
        if axes.len() != spatial.len() {
            return Err(KernelError::shape_mismatch(spatial, &shape.spatial_dims(kernel.batch_axis, kernel.channel_axis)));
        }
        let mut out = shape.clone();
        for (&axis, &size) in axes.iter().zip(spatial) {
            out = out.with_dim(axis, size);
        }
        if let Some(c) = channels {
            out = out.with_dim(kernel.channel_axis, c);
        }
        Ok(out)
    };
    Ok(Layout {
        shape1: resize(&kernel.shape1)?,
        shape2: resize(&kernel.shape2)?,
        batch_axis: kernel.batch_axis,
        channel_axis: kernel.channel_axis,
    })
}

/// Fail unless every mask has one entry per input position.
pub fn check_masks(kernel: &Kernel, positions: usize) -> Result<()> {
    for operand in [Operand::First, Operand::Second] {
        if let Some(mask) = kernel.mask(operand) {
            if mask.ncols() != positions {
                return Err(KernelError::shape_mismatch(
                    &[kernel.batch_size(operand), positions],
                    mask.shape(),
                ));
            }
        }
    }
    Ok(())
}

/// Kronecker product.
pub fn kron(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    Array2::from_shape_fn((ar * br, ac * bc), |(i, j)| a[[i / br, j / bc]] * b[[i % br, j % bc]])
}

/// Kronecker product of a list, `I_1` for an empty one.
pub fn kron_all(factors: &[Array2<f64>]) -> Array2<f64> {
    factors
        .iter()
        .fold(Array2::eye(1), |acc, m| kron(&acc, m))
}

/// `y_n = P_n x_n` on canonical `(batch, positions, channel)` values. A single
/// matrix is shared by every example.
pub fn mix(x: &Array3<f64>, matrices: &[Array2<f64>]) -> Result<Array3<f64>> {
    let (n, s, c) = x.dim();
    let out_positions = match matrices.first() {
        Some(m) => m.nrows(),
        None => s,
    };
    let mut out = Array3::zeros((n, out_positions, c));
    for (i, example) in x.outer_iter().enumerate() {
        out.index_axis_mut(Axis(0), i).assign(&pick(matrices, i, s)?.dot(&example));
    }
    Ok(out)
}

fn pick(matrices: &[Array2<f64>], i: usize, positions: usize) -> Result<&Array2<f64>> {
    let m = if matrices.len() == 1 {
        matrices.first()
    } else {
        matrices.get(i)
    };
    let m = m.ok_or_else(|| KernelError::Tensor {
        reason: format!("no position matrix for example {i}"),
    })?;
    if m.ncols() != positions {
        return Err(KernelError::shape_mismatch(&[m.nrows(), positions], m.shape()));
    }
    Ok(m)
}

/// Finite-width counterpart of [`Kernel::map_positions`]: mix positions of a
/// masked tensor and propagate its mask to a tensor of shape `out`.
pub fn mix_masked(
    x: &Masked,
    batch: usize,
    channel: usize,
    maps: &[PositionMap],
    out: &Shape,
) -> Result<Masked> {
    let canonical = to_canonical(&x.value, batch, channel)?;
    let matrices: Vec<Array2<f64>> = maps
        .iter()
        .map(|m| m.terms.iter().fold(Array2::zeros((m.out_positions(), m.in_positions())), |acc, t| acc + t))
        .collect();
    let mixed = mix(&canonical, &matrices)?;
    let value = from_canonical(&mixed, out, batch, channel)?;
    let mask = match &x.mask {
        Some(mask) => Some(propagate_tensor_mask(mask, (batch, channel), maps, out, (batch, channel))?),
        None => None,
    };
    Masked::with_mask(value, mask).zeroed()
}

/// Propagate a tensor-layout mask through per-example (or shared) maps to a
/// tensor of shape `out`. Axes are `(batch, channel)` pairs.
pub fn propagate_tensor_mask(
    mask: &ArrayD<bool>,
    axes: (usize, usize),
    maps: &[PositionMap],
    out: &Shape,
    out_axes: (usize, usize),
) -> Result<ArrayD<bool>> {
    let positions = tensor_to_positions(mask, axes.0, axes.1)?;
    let rows = positions
        .outer_iter()
        .enumerate()
        .map(|(n, row)| {
            let map = if maps.len() == 1 { maps.first() } else { maps.get(n) };
            map.map(|m| m.propagate_mask(row))
                .ok_or_else(|| KernelError::Tensor {
                    reason: format!("no position map for example {n}"),
                })
        })
        .collect::<Result<Vec<Array1<bool>>>>()?;
    let (batch, channel) = out_axes;
    let width = out.positions(batch, channel);
    let flat: Vec<bool> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    let stacked = Array2::from_shape_vec((rows.len(), width), flat)?;
    positions_to_tensor(&stacked, out, batch, channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    #[test]
    fn test_kron() {
        let a = array![[1.0, 2.0]];
        let b = array![[1.0], [3.0]];
        assert_eq!(kron(&a, &b), array![[1.0, 2.0], [3.0, 6.0]]);
        assert_eq!(kron_all(&[]), Array2::<f64>::eye(1));
    }

    #[test]
    fn test_mix_shared_and_per_example() {
        let x = Array3::from_shape_fn((2, 3, 1), |(n, p, _)| (n * 3 + p) as f64);
        let sum = array![[1.0, 1.0, 1.0]];
        let shared = mix(&x, &[sum.clone()]).unwrap();
        assert_eq!(shared.into_raw_vec(), vec![3.0, 12.0]);

        let first = array![[1.0, 0.0, 0.0]];
        let per = mix(&x, &[first, sum]).unwrap();
        assert_eq!(per.into_raw_vec(), vec![0.0, 12.0]);
    }

    #[test]
    fn test_mix_masked_propagates() {
        let value = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1]), vec![0.0, 4.0]).unwrap();
        let mask = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1]), vec![true, false]).unwrap();
        let x = Masked::with_mask(value, Some(mask));
        let map = PositionMap::single(array![[1.0, 0.0], [0.5, 0.5]]);
        let out = mix_masked(&x, 0, 2, &[map], &Shape::new(vec![1, 2, 1])).unwrap();
        assert_eq!(out.mask.unwrap().into_raw_vec(), vec![true, false]);
        assert_eq!(out.value.into_raw_vec(), vec![0.0, 2.0]);
    }
}
