//! Graph aggregation: every position becomes a weighted sum of positions,
//! with per-example weights supplied at call time.
//!
//! For a pattern `P_n` (`S x S` after flattening the spatial axes),
//! `y_n = P_n x_n` and `K'[a, b] = P_a K[a, b] P_bᵀ`. Masked positions are
//! never read from; their own rows are left for the caller's mask to zero.

use ndarray::{Array2, ArrayD, ArrayView1, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::layout::{from_canonical, to_canonical};
use widenet_core::{
    ApplyArgs, AxisSpec, Example, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked, Nested, Operand,
    Params, PositionMap, Result, Shape,
};

use crate::positions::{check_masks, mix, per_example};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aggregate {
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self {
            batch_axis: 0,
            channel_axis: -1,
        }
    }
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing() -> KernelError {
        KernelError::MissingArgument {
            layer: "Aggregate".to_string(),
            name: "pattern".to_string(),
        }
    }

    /// `(N, S, S)` matrices from a `(N, s.., s..)` pattern.
    fn matrices(pattern: &ArrayD<f64>, batch: usize, spatial: &[usize]) -> Result<Vec<Array2<f64>>> {
        let s: usize = spatial.iter().product();
        let mut expected = vec![batch];
        expected.extend_from_slice(spatial);
        expected.extend_from_slice(spatial);
        if pattern.shape() != expected.as_slice() {
            return Err(KernelError::shape_mismatch(&expected, pattern.shape()));
        }
        let flat = pattern
            .as_standard_layout()
            .into_owned()
            .into_shape((batch, s, s))?;
        Ok(flat.outer_iter().map(|m| m.to_owned()).collect())
    }

    /// Drop the columns of masked positions.
    fn without_masked(mut p: Array2<f64>, mask: Option<ArrayView1<'_, bool>>) -> Array2<f64> {
        if let Some(mask) = mask {
            for (mut column, &masked) in p.axis_iter_mut(Axis(1)).zip(mask.iter()) {
                if masked {
                    column.fill(0.0);
                }
            }
        }
        p
    }

    fn transform(&self, kernel: Kernel, args: &LayerArgs) -> Result<Kernel> {
        let spatial = kernel.spatial();
        check_masks(&kernel, spatial.iter().product())?;

        let mut patterns = Vec::with_capacity(2);
        for operand in [Operand::First, Operand::Second] {
            let operand = kernel.resolve(operand);
            let pattern = args.pattern(operand).ok_or_else(Self::missing)?;
            patterns.push((operand, Self::matrices(pattern, kernel.batch_size(operand), &spatial)?));
        }

        let maps = per_example(&kernel, |e: Example| {
            let p = patterns
                .iter()
                .find(|(operand, _)| *operand == e.operand)
                .and_then(|(_, list)| list.get(e.index))
                .ok_or_else(Self::missing)?;
            let mask = kernel.mask(e.operand).map(|m| m.row(e.index));
            Ok(PositionMap::single(Self::without_masked(p.clone(), mask)))
        })?;
        debug!(positions = spatial.iter().product::<usize>(), "aggregate kernel");

        let (mask1, mask2) = (kernel.mask1.clone(), kernel.mask2.clone());
        let layout = kernel.layout();
        let out = kernel.map_positions(layout, &maps)?;
        Ok(Kernel { mask1, mask2, ..out })
    }
}

impl Layer for Aggregate {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new("Aggregate")
            .with_diagonal(DiagonalReqs::spatial(Diagonal::new(Tristate::Maybe, Tristate::No)))
            .with_axes(AxisSpec::new(self.batch_axis, self.channel_axis))
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        Ok((input.clone(), Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>> {
        let pattern = args.pattern.as_ref().ok_or_else(Self::missing)?;
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = AxisSpec::new(self.batch_axis, self.channel_axis).resolve(shape.rank())?;
            let spatial = shape.spatial_dims(batch, channel);
            let masks = x.positions(batch, channel)?;
            let matrices: Vec<Array2<f64>> = Self::matrices(pattern, shape.dim(batch)?, &spatial)?
                .into_iter()
                .enumerate()
                .map(|(n, p)| Self::without_masked(p, masks.as_ref().map(|m| m.row(n))))
                .collect();
            let y = mix(&to_canonical(&x.value, batch, channel)?, &matrices)?;
            let value = from_canonical(&y, &shape, batch, channel)?;
            Masked::with_mask(value, x.mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, args: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, IxDyn};
    use widenet_core::InputSpec;

    fn kernel(x2: bool) -> Kernel {
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 3, 2]), |ix| ((ix[0] * 6 + ix[1] * 2 + ix[2]) as f64).sin());
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: 2,
            diagonal_batch: true,
            diagonal_spatial: false,
            compute_ntk: false,
            mask_constant: None,
        };
        let other = x.mapv(|v| v + 0.5);
        Kernel::from_inputs(&x, x2.then_some(&other), &spec).unwrap()
    }

    fn chain() -> ArrayD<f64> {
        // example 0: position p reads p and p + 1; example 1: identity
        let p0 = array![[1.0, 1.0, 0.0], [0.0, 1.0, 1.0], [0.0, 0.0, 1.0]];
        let p1 = Array2::<f64>::eye(3);
        ndarray::stack(Axis(0), &[p0.view(), p1.view()]).unwrap().into_dyn()
    }

    #[test]
    fn test_pattern_applied_per_example() {
        let k = kernel(false);
        let args = LayerArgs::with_patterns(chain(), None);
        let out = Aggregate::new()
            .kernel(Nested::Leaf(k.clone()), &args)
            .unwrap()
            .into_leaf()
            .unwrap();
        let expected = k.nngp[[0, 1, 0, 2]] + k.nngp[[0, 1, 1, 2]];
        assert_relative_eq!(out.nngp[[0, 1, 0, 2]], expected, epsilon = 1e-12);
        assert_relative_eq!(out.cov1[[1, 0, 1]], k.cov1[[1, 0, 1]], epsilon = 1e-12);
    }

    #[test]
    fn test_missing_pattern() {
        let err = Aggregate::new()
            .kernel(Nested::Leaf(kernel(false)), &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::MissingArgument { .. }));
    }

    #[test]
    fn test_second_pattern_defaults_to_first() {
        let args = LayerArgs::with_patterns(chain(), None);
        let out = Aggregate::new().kernel(Nested::Leaf(kernel(true)), &args);
        assert!(out.is_ok());
    }

    #[test]
    fn test_wrong_batch_size_is_shape_error() {
        let bad = ArrayD::zeros(IxDyn(&[3, 3, 3]));
        let err = Aggregate::new()
            .kernel(Nested::Leaf(kernel(false)), &LayerArgs::with_patterns(bad, None))
            .unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_apply_skips_masked_sources() {
        let value = ArrayD::from_shape_vec(IxDyn(&[1, 3, 1]), vec![1.0, 10.0, 100.0]).unwrap();
        let mask = ArrayD::from_shape_vec(IxDyn(&[1, 3, 1]), vec![false, true, false]).unwrap();
        let pattern = array![[[1.0, 1.0, 1.0], [1.0, 1.0, 0.0], [0.0, 1.0, 1.0]]].into_dyn();
        let y = Aggregate::new()
            .apply(
                &Params::None,
                Nested::Leaf(Masked::with_mask(value, Some(mask))),
                &ApplyArgs {
                    pattern: Some(pattern),
                    ..ApplyArgs::default()
                },
            )
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(y.value.into_raw_vec(), vec![101.0, 0.0, 100.0]);
    }
}
