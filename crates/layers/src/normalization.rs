//! Layer normalization over the channel axis and, optionally, spatial axes.
//!
//! Channels are independent in the wide limit, so the empirical mean over
//! channels vanishes and the empirical variance at a position converges to
//! its kernel variance `v(p)`. Normalizing therefore rescales each position:
//!
//! ```text
//!   n(p)     = eps + mean of v over the unmasked positions of p's group
//!   K'[p, q] = K[p, q] / sqrt(n₁(p) n₂(q))
//! ```
//!
//! A group collects the positions that differ only along normalized spatial
//! axes. The tangent kernel is rescaled the same way.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use widenet_core::diagonal::DiagonalReqs;
use widenet_core::layout::{from_canonical, to_canonical};
use widenet_core::shape::normalize_axis;
use widenet_core::{
    ApplyArgs, AxisSpec, Block, Example, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked, Nested, Operand,
    Params, Result, Shape,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNorm {
    /// Normalized axes; must include the channel axis and exclude the batch axis.
    pub axes: Vec<isize>,
    pub eps: f64,
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Default for LayerNorm {
    fn default() -> Self {
        Self {
            axes: vec![-1],
            eps: 1e-12,
            batch_axis: 0,
            channel_axis: -1,
        }
    }
}

impl LayerNorm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn over(axes: Vec<isize>) -> Self {
        Self {
            axes,
            ..Self::default()
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_axes(mut self, batch_axis: isize, channel_axis: isize) -> Self {
        self.batch_axis = batch_axis;
        self.channel_axis = channel_axis;
        self
    }

    fn invalid(&self, reason: String) -> KernelError {
        KernelError::InvalidConfig {
            layer: "LayerNorm".to_string(),
            reason,
        }
    }

    fn grouping(&self, shape: &Shape, batch: usize, channel: usize) -> Result<Grouping> {
        let axes = self
            .axes
            .iter()
            .map(|&a| normalize_axis(a, shape.rank()))
            .collect::<Result<Vec<_>>>()?;
        if axes.contains(&batch) {
            return Err(self.invalid(format!("cannot normalize over the batch axis {batch}")));
        }
        if !axes.contains(&channel) {
            return Err(self.invalid(format!("normalizing over the channel axis {channel} is required")));
        }
        let normalized: Vec<bool> = shape
            .spatial_axes(batch, channel)
            .iter()
            .map(|a| axes.contains(a))
            .collect();
        Ok(Grouping::new(&shape.spatial_dims(batch, channel), &normalized))
    }

    /// `1 / sqrt(n(p))` for every example of `operand`.
    fn scales(&self, kernel: &Kernel, operand: Operand, grouping: &Grouping) -> Result<Vec<Array1<f64>>> {
        let operand = kernel.resolve(operand);
        (0..kernel.batch_size(operand))
            .map(|i| {
                let variances = kernel.variances(Example::new(operand, i))?;
                let mask = kernel.mask(operand).map(|m| m.row(i));
                let mean = grouping.mean(&variances, mask);
                Ok(mean.mapv(|m| inverse_std(m + self.eps)))
            })
            .collect()
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        if !kernel.is_gaussian {
            return Err(KernelError::GaussianRequired {
                layer: "LayerNorm".to_string(),
            });
        }
        let grouping = self.grouping(&kernel.shape1, kernel.batch_axis, kernel.channel_axis)?;
        let first = self.scales(&kernel, Operand::First, &grouping)?;
        let second = self.scales(&kernel, Operand::Second, &grouping)?;
        let scale = |e: Example| match kernel.resolve(e.operand) {
            Operand::First => &first[e.index],
            Operand::Second => &second[e.index],
        };
        debug!(groups = grouping.groups, eps = self.eps, "layer norm kernel");

        let spatial = kernel.spatial();
        let fields = kernel.map_all(&spatial, kernel.diagonal_spatial, |_, left, right, block| {
            Ok(rescale(block, scale(left), scale(right)))
        })?;
        Ok(kernel.with_fields(fields))
    }
}

fn inverse_std(variance: f64) -> f64 {
    if variance > 0.0 {
        1.0 / variance.sqrt()
    } else {
        0.0
    }
}

fn rescale(block: Block, left: &Array1<f64>, right: &Array1<f64>) -> Block {
    match block {
        Block::Full(m) => Block::Full(Array2::from_shape_fn(m.dim(), |(p, q)| m[[p, q]] * left[p] * right[q])),
        Block::Diagonal(d) => Block::Diagonal(Array1::from_shape_fn(d.len(), |p| d[p] * left[p] * right[p])),
    }
}

/// Group index of every position, row-major over the spatial axes that are
/// not normalized.
struct Grouping {
    ids: Vec<usize>,
    groups: usize,
}

impl Grouping {
    fn new(dims: &[usize], normalized: &[bool]) -> Self {
        let positions: usize = dims.iter().product();
        let groups = dims
            .iter()
            .zip(normalized)
            .filter(|(_, &n)| !n)
            .map(|(&d, _)| d)
            .product();
        let ids = (0..positions)
            .map(|p| {
                let (mut rest, mut id, mut stride) = (p, 0, 1);
                for (&size, &n) in dims.iter().zip(normalized).rev() {
                    let index = rest % size;
                    rest /= size;
                    if !n {
                        id += index * stride;
                        stride *= size;
                    }
                }
                id
            })
            .collect();
        Self { ids, groups }
    }

    /// Mean of `values` over the unmasked positions of each group, read back
    /// at every position.
    fn mean(&self, values: &Array1<f64>, mask: Option<ArrayView1<'_, bool>>) -> Array1<f64> {
        let mut sums = vec![0.0; self.groups];
        let mut counts = vec![0usize; self.groups];
        for (p, &g) in self.ids.iter().enumerate() {
            if mask.as_ref().map_or(false, |m| m[p]) {
                continue;
            }
            sums[g] += values[p];
            counts[g] += 1;
        }
        Array1::from_shape_fn(self.ids.len(), |p| {
            let g = self.ids[p];
            if counts[g] == 0 {
                0.0
            } else {
                sums[g] / counts[g] as f64
            }
        })
    }
}

impl Layer for LayerNorm {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new("LayerNorm")
            .with_diagonal(DiagonalReqs::IDENTITY)
            .with_axes(AxisSpec::new(self.batch_axis, self.channel_axis))
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let out = input.try_map_ref(&mut |shape: &Shape| {
            let (batch, channel) = self.meta().axes.resolve(shape.rank())?;
            self.grouping(shape, batch, channel)?;
            Ok(shape.clone())
        })?;
        Ok((out, Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = self.meta().axes.resolve(shape.rank())?;
            let grouping = self.grouping(&shape, batch, channel)?;
            let positions = x.positions(batch, channel)?;
            let mut canonical = to_canonical(&x.value, batch, channel)?;

            for (n, mut example) in canonical.outer_iter_mut().enumerate() {
                let masked = |p: usize| positions.as_ref().map_or(false, |m| m[[n, p]]);
                let mut sums = vec![0.0; grouping.groups];
                let mut squares = vec![0.0; grouping.groups];
                let mut counts = vec![0usize; grouping.groups];
                for (p, row) in example.outer_iter().enumerate() {
                    if masked(p) {
                        continue;
                    }
                    let g = grouping.ids[p];
                    sums[g] += row.sum();
                    squares[g] += row.iter().map(|v| v * v).sum::<f64>();
                    counts[g] += row.len();
                }
                for (p, mut row) in example.outer_iter_mut().enumerate() {
                    let g = grouping.ids[p];
                    let count = counts[g].max(1) as f64;
                    let mean = sums[g] / count;
                    let variance = (squares[g] / count - mean * mean).max(0.0);
                    let inverse = inverse_std(variance + self.eps);
                    row.mapv_inplace(|v| (v - mean) * inverse);
                }
            }

            let value = from_canonical(&canonical, &shape, batch, channel)?;
            Masked::with_mask(value, x.mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Dense;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};
    use widenet_core::{InputSpec, LayerExt};

    fn gaussian(x: &ArrayD<f64>, diagonal_spatial: bool, mask_constant: Option<f64>) -> Kernel {
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: x.ndim() - 1,
            diagonal_batch: false,
            diagonal_spatial,
            compute_ntk: true,
            mask_constant,
        };
        let k = Kernel::from_inputs(x, None, &spec).unwrap();
        Dense::new(6)
            .with_std(1.4, 0.3)
            .kernel(Nested::Leaf(k), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap()
            .remask()
            .unwrap()
    }

    fn input() -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |ix| ((ix[0] * 5 + ix[1] * 3 + ix[2]) as f64 * 0.8).sin())
    }

    fn run(layer: &LayerNorm, k: Kernel) -> Result<Kernel> {
        layer.kernel(Nested::Leaf(k), &LayerArgs::default())?.into_leaf()
    }

    #[test]
    fn test_channel_norm_divides_by_variances() {
        let k = gaussian(&input(), false, None);
        let out = run(&LayerNorm::new(), k.clone()).unwrap();
        let v = |n: usize, p: usize| k.cov1[[n, n, p, p]] + 1e-12;
        assert_relative_eq!(out.cov1[[1, 1, 2, 2]], k.cov1[[1, 1, 2, 2]] / v(1, 2), epsilon = 1e-12);
        assert_relative_eq!(
            out.nngp[[0, 1, 0, 2]],
            k.nngp[[0, 1, 0, 2]] / (v(0, 0) * v(1, 2)).sqrt(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            out.ntk.unwrap()[[0, 1, 0, 2]],
            k.ntk.unwrap()[[0, 1, 0, 2]] / (v(0, 0) * v(1, 2)).sqrt(),
            epsilon = 1e-12
        );
        assert!(out.is_gaussian);
    }

    #[test]
    fn test_spatial_axes_share_one_normalizer() {
        let k = gaussian(&input(), true, None);
        let out = run(&LayerNorm::over(vec![1, -1]), k.clone()).unwrap();
        let mean = |n: usize| (0..3).map(|p| k.cov1[[n, n, p]]).sum::<f64>() / 3.0 + 1e-12;
        for p in 0..3 {
            assert_relative_eq!(
                out.nngp[[0, 1, p]],
                k.nngp[[0, 1, p]] / (mean(0) * mean(1)).sqrt(),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_masked_positions_leave_the_mean() {
        let mut x = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2]), |ix| 1.0 + ix[1] as f64 + 0.5 * ix[2] as f64);
        x[[0, 1, 0]] = -9.0;
        x[[0, 1, 1]] = -9.0;
        let k = gaussian(&x, true, Some(-9.0));
        let out = run(&LayerNorm::over(vec![1, 2]), k.clone()).unwrap();
        let mean = (k.cov1[[0, 0, 0]] + k.cov1[[0, 0, 2]]) / 2.0 + 1e-12;
        assert_relative_eq!(out.cov1[[0, 0, 2]], k.cov1[[0, 0, 2]] / mean, epsilon = 1e-12);
        assert_eq!(out.cov1[[0, 0, 1]], 0.0);
    }

    #[test]
    fn test_axis_rules() {
        let k = gaussian(&input(), false, None);
        assert!(matches!(
            run(&LayerNorm::over(vec![0, -1]), k.clone()),
            Err(KernelError::InvalidConfig { .. })
        ));
        assert!(matches!(
            run(&LayerNorm::over(vec![1]), k.clone()),
            Err(KernelError::InvalidConfig { .. })
        ));
        let raw = Kernel { is_gaussian: false, ..k };
        assert!(matches!(
            run(&LayerNorm::new(), raw),
            Err(KernelError::GaussianRequired { .. })
        ));
    }

    #[test]
    fn test_apply_standardizes_each_position() {
        let layer = LayerNorm::new();
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 3, 5]), |ix| (ix[0] * 15 + ix[1] * 5 + ix[2] * ix[2]) as f64);
        let (_, params) = layer.init_with_seed(0, &Nested::Leaf(Shape::new(vec![2, 3, 5]))).unwrap();
        let y = layer
            .apply(&params, Nested::Leaf(Masked::new(x)), &ApplyArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        for n in 0..2 {
            for p in 0..3 {
                let row: Vec<f64> = (0..5).map(|c| y.value[[n, p, c]]).collect();
                let mean = row.iter().sum::<f64>() / 5.0;
                let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 5.0;
                assert_relative_eq!(mean, 0.0, epsilon = 1e-9);
                assert_relative_eq!(var, 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_init_checks_axes() {
        let err = LayerNorm::over(vec![0, 2])
            .init_with_seed(0, &Nested::Leaf(Shape::new(vec![2, 3, 5])))
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig { .. }));
    }
}
