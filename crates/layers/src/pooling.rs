//! Average and sum pooling, windowed and global.
//!
//! Pooling is a fixed linear map over positions, `y_n = P_n x_n`, so the
//! kernel transforms as `K' = P₁ K P₂ᵀ` and Gaussian inputs stay Gaussian.
//! `P` is the window coverage matrix with each row scaled:
//!
//! | kind | row scale |
//! |------|-----------|
//! | sum  | 1 |
//! | avg  | 1 / unmasked positions in the window (masked input) |
//! | avg  | 1 / in-bounds positions (`normalize_edges`) |
//! | avg  | 1 / window size (otherwise) |

use ndarray::{Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::layout::to_canonical;
use widenet_core::{
    ApplyArgs, AxisSpec, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Layout, Masked, Nested, Params,
    PositionMap, PositionMaps, Result, Shape,
};

use crate::conv::geometry::{Padding, Window};
use crate::positions::{check_masks, mix, mix_masked, per_example, resized};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    #[default]
    Avg,
    Sum,
}

impl PoolKind {
    fn label(self, global: bool) -> &'static str {
        match (self, global) {
            (PoolKind::Avg, false) => "AvgPool",
            (PoolKind::Sum, false) => "SumPool",
            (PoolKind::Avg, true) => "GlobalAvgPool",
            (PoolKind::Sum, true) => "GlobalSumPool",
        }
    }

    /// Scale every row of `coverage` for one example. Masked input columns
    /// are dropped and do not count towards the average.
    fn scale_rows(self, coverage: &Array2<f64>, mask: Option<ArrayView1<'_, bool>>, fixed: Option<f64>) -> Array2<f64> {
        let mut p = coverage.clone();
        if let Some(mask) = mask {
            for (mut column, &masked) in p.axis_iter_mut(Axis(1)).zip(mask.iter()) {
                if masked {
                    column.fill(0.0);
                }
            }
        }
        if self == PoolKind::Sum {
            return p;
        }
        for mut row in p.axis_iter_mut(Axis(0)) {
            let count = match (mask, fixed) {
                (None, Some(size)) => size,
                _ => row.sum(),
            };
            let scale = if count > 0.0 { 1.0 / count } else { 0.0 };
            row.mapv_inplace(|v| v * scale);
        }
        p
    }
}

/// Windowed pooling over every spatial axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pool {
    pub kind: PoolKind,
    pub window: Vec<usize>,
    /// Defaults to 1 along every axis.
    pub strides: Option<Vec<usize>>,
    pub padding: Padding,
    pub normalize_edges: bool,
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            kind: PoolKind::Avg,
            window: vec![2, 2],
            strides: None,
            padding: Padding::Valid,
            normalize_edges: false,
            batch_axis: 0,
            channel_axis: -1,
        }
    }
}

impl Pool {
    pub fn avg(window: Vec<usize>) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    pub fn sum(window: Vec<usize>) -> Self {
        Self {
            kind: PoolKind::Sum,
            window,
            ..Self::default()
        }
    }

    pub fn with_strides(mut self, strides: Vec<usize>) -> Self {
        self.strides = Some(strides);
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn normalize_edges(mut self, normalize: bool) -> Self {
        self.normalize_edges = normalize;
        self
    }

    fn name(&self) -> &'static str {
        self.kind.label(false)
    }

    fn geometry(&self) -> Window {
        let strides = self
            .strides
            .clone()
            .unwrap_or_else(|| vec![1; self.window.len()]);
        Window::new(self.window.clone(), strides, self.padding)
    }

    /// Output spatial sizes and the unscaled coverage matrix.
    fn coverage(&self, spatial: &[usize]) -> Result<(Vec<usize>, Array2<f64>)> {
        self.geometry().coverage(spatial, self.name())
    }

    /// Row normaliser used when no mask is present.
    fn fixed_count(&self) -> Option<f64> {
        (!self.normalize_edges).then(|| self.window.iter().product::<usize>() as f64)
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let spatial = kernel.spatial();
        check_masks(&kernel, spatial.iter().product())?;
        let (out, coverage) = self.coverage(&spatial)?;
        debug!(layer = self.name(), ?spatial, ?out, "pooling kernel");

        let masked = kernel.mask1.is_some() || kernel.mask2.is_some();
        let maps = if masked {
            per_example(&kernel, |e| {
                let mask = kernel.mask(e.operand).map(|m| m.row(e.index));
                Ok(PositionMap::single(self.kind.scale_rows(&coverage, mask, self.fixed_count())))
            })?
        } else {
            PositionMaps::Shared(PositionMap::single(self.kind.scale_rows(&coverage, None, self.fixed_count())))
        };
        let layout = resized(&kernel, &out, None)?;
        kernel.map_positions(layout, &maps)
    }
}

impl Layer for Pool {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new(self.name())
            .with_diagonal(DiagonalReqs::spatial(Diagonal::new(Tristate::Maybe, Tristate::No)))
            .with_axes(AxisSpec::new(self.batch_axis, self.channel_axis))
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let out = input.try_map_ref(&mut |shape: &Shape| {
            let (batch, channel) = self.meta().axes.resolve(shape.rank())?;
            let axes = shape.spatial_axes(batch, channel);
            let dims = self.geometry().output_dims(&shape.spatial_dims(batch, channel), self.name())?;
            Ok(axes
                .iter()
                .zip(dims)
                .fold(shape.clone(), |s, (&axis, size)| s.with_dim(axis, size)))
        })?;
        Ok((out, Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = self.meta().axes.resolve(shape.rank())?;
            let spatial = shape.spatial_dims(batch, channel);
            let (out, coverage) = self.coverage(&spatial)?;
            let maps: Vec<PositionMap> = match x.positions(batch, channel)? {
                Some(mask) => mask
                    .outer_iter()
                    .map(|row| PositionMap::single(self.kind.scale_rows(&coverage, Some(row), self.fixed_count())))
                    .collect(),
                None => vec![PositionMap::single(self.kind.scale_rows(&coverage, None, self.fixed_count()))],
            };
            let out_shape = shape
                .spatial_axes(batch, channel)
                .iter()
                .zip(out)
                .fold(shape.clone(), |s, (&axis, size)| s.with_dim(axis, size));
            mix_masked(&x, batch, channel, &maps, &out_shape)
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k))
    }
}

/// Pooling over all spatial positions; the output is `(N, C)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalPool {
    pub kind: PoolKind,
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Default for GlobalPool {
    fn default() -> Self {
        Self {
            kind: PoolKind::Avg,
            batch_axis: 0,
            channel_axis: -1,
        }
    }
}

impl GlobalPool {
    pub fn avg() -> Self {
        Self::default()
    }

    pub fn sum() -> Self {
        Self {
            kind: PoolKind::Sum,
            ..Self::default()
        }
    }

    fn name(&self) -> &'static str {
        self.kind.label(true)
    }

    fn row(&self, positions: usize, mask: Option<ArrayView1<'_, bool>>) -> Array2<f64> {
        let ones = Array2::ones((1, positions));
        self.kind.scale_rows(&ones, mask, None)
    }

    fn out_shape(shape: &Shape, batch: usize, channel: usize) -> Result<Shape> {
        Ok(Shape::new(vec![shape.dim(batch)?, shape.dim(channel)?]))
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let s = kernel.positions();
        check_masks(&kernel, s)?;
        let (batch, channel) = (kernel.batch_axis, kernel.channel_axis);
        let maps = if kernel.mask1.is_some() || kernel.mask2.is_some() {
            per_example(&kernel, |e| {
                let mask = kernel.mask(e.operand).map(|m| m.row(e.index));
                Ok(PositionMap::single(self.row(s, mask)))
            })?
        } else {
            PositionMaps::Shared(PositionMap::single(self.row(s, None)))
        };
        let layout = Layout {
            shape1: Self::out_shape(&kernel.shape1, batch, channel)?,
            shape2: Self::out_shape(&kernel.shape2, batch, channel)?,
            batch_axis: 0,
            channel_axis: 1,
        };
        debug!(layer = self.name(), positions = s, "global pooling kernel");
        kernel.map_positions(layout, &maps)
    }
}

impl Layer for GlobalPool {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new(self.name())
            .with_diagonal(DiagonalReqs::spatial(Diagonal::new(Tristate::Maybe, Tristate::Yes)))
            .with_axes(AxisSpec::new(self.batch_axis, self.channel_axis))
            .changes_layout()
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let out = input.try_map_ref(&mut |shape: &Shape| {
            let (batch, channel) = self.meta().axes.resolve(shape.rank())?;
            Self::out_shape(shape, batch, channel)
        })?;
        Ok((out, Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = self.meta().axes.resolve(shape.rank())?;
            let s = shape.positions(batch, channel);
            let positions = x.positions(batch, channel)?;
            let rows: Vec<Array2<f64>> = match &positions {
                Some(mask) => mask.outer_iter().map(|m| self.row(s, Some(m))).collect(),
                None => vec![self.row(s, None)],
            };
            let pooled = mix(&to_canonical(&x.value, batch, channel)?, &rows)?;
            let (n, _, c) = pooled.dim();
            let value = pooled.into_shape((n, c))?.into_dyn();
            let mask = positions.map(|m| {
                m.map_axis(Axis(1), |row| row.iter().all(|&v| v))
                    .insert_axis(Axis(1))
                    .into_dyn()
            });
            Masked::with_mask(value, mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| {
            if k.shape1.rank() < 2 {
                return Err(KernelError::InvalidConfig {
                    layer: self.name().to_string(),
                    reason: format!("input of shape {} has no batch and channel axes", k.shape1),
                });
            }
            self.transform(k)
        })
    }
}
