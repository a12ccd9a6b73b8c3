//! Flattening every non-batch axis into channels.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::shape::normalize_axis;
use widenet_core::{
    ApplyArgs, AxisSpec, Block, Kernel, Layer, LayerArgs, LayerMeta, Layout, Masked, Nested, Params, Result,
    Shape,
};

/// `(N, ...)` to `(N, prod(...))`.
///
/// In the wide limit every flattened channel is an independent draw, so the
/// kernel is the mean over the spatial diagonal, `K'[a, b] = (1/S) Σ_p K[a, b, p, p]`.
/// With more than one position the result is a mixture and no longer Gaussian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flatten {
    pub batch_axis: isize,
}

impl Default for Flatten {
    fn default() -> Self {
        Self { batch_axis: 0 }
    }
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }

    fn out_shape(shape: &Shape, batch: usize) -> Result<Shape> {
        let n = shape.dim(batch)?;
        Ok(Shape::new(vec![n, shape.numel() / n.max(1)]))
    }
}

impl Layer for Flatten {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new("Flatten")
            .with_diagonal(DiagonalReqs::spatial(Diagonal::new(Tristate::Yes, Tristate::Yes)))
            .with_axes(AxisSpec {
                batch: Some(self.batch_axis),
                channel: None,
            })
            .changes_layout()
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let out = input.try_map_ref(&mut |shape: &Shape| {
            Self::out_shape(shape, normalize_axis(self.batch_axis, shape.rank())?)
        })?;
        Ok((out, Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let batch = normalize_axis(self.batch_axis, shape.rank())?;
            let out = Self::out_shape(&shape, batch)?;
            let n = out.dims[0];

            let mut order = vec![batch];
            order.extend((0..shape.rank()).filter(|&a| a != batch));
            let value = x
                .value
                .view()
                .permuted_axes(order.clone())
                .as_standard_layout()
                .into_owned()
                .into_shape(out.dims.clone())?;

            let mask = match &x.mask {
                Some(mask) => {
                    let rows = mask.view().permuted_axes(order).as_standard_layout().into_owned();
                    let width = rows.len() / n.max(1);
                    let rows: Array2<bool> = rows.into_shape((n, width))?;
                    Some(rows.map_axis(Axis(1), |r| r.iter().all(|&m| m)).insert_axis(Axis(1)).into_dyn())
                }
                None => None,
            };
            Masked::with_mask(value, mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| {
            let s = k.positions();
            let layout = Layout {
                shape1: Self::out_shape(&k.shape1, k.batch_axis)?,
                shape2: Self::out_shape(&k.shape2, k.batch_axis)?,
                batch_axis: 0,
                channel_axis: 1,
            };
            let fields = k.map_all(&[], k.diagonal_spatial, |_, _, _, block| Ok(diagonal_mean(block, s)))?;
            let mask1 = k.mask1.as_ref().map(all_positions);
            let mask2 = k.mask2.as_ref().map(all_positions);
            let is_gaussian = k.is_gaussian && s <= 1;
            Ok(Kernel {
                is_gaussian,
                mask1,
                mask2,
                ..k.with_fields(fields).with_layout(layout)
            })
        })
    }
}

/// `(1/S) Σ_p K[p, p]` as a one-position block of the same kind.
fn diagonal_mean(block: Block, positions: usize) -> Block {
    let mean = block.diagonal().sum() / positions.max(1) as f64;
    match block {
        Block::Full(_) => Block::Full(Array2::from_elem((1, 1), mean)),
        Block::Diagonal(_) => Block::Diagonal(Array1::from_elem(1, mean)),
    }
}

/// An example is masked once every one of its positions is.
fn all_positions(mask: &Array2<bool>) -> Array2<bool> {
    mask.map_axis(Axis(1), |row| row.iter().all(|&m| m)).insert_axis(Axis(1))
}
