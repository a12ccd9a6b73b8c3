//! # Convolutions
//!
//! Regular, transposed and locally connected N-d convolutions. All three
//! share one kernel rule: with `M_f` the selection (or, transposed, scatter)
//! matrix of filter offset `f`,
//!
//! ```text
//!   K' = σw² / |F| Σ_f M_f K M_fᵀ + σb²
//! ```
//!
//! A locally connected layer has independent weights per output position, so
//! only the position diagonal of `K'` survives and its bias reaches only the
//! diagonal.

pub mod dims;
pub mod geometry;

use ndarray::{indices, Array2, Array3, ArrayD, Axis, Ix4, IxDyn};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::layout::{from_canonical, to_canonical};
use widenet_core::{
    ApplyArgs, AxisSpec, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Layout, Masked, Nested, Operand,
    Params, PositionMap, PositionMaps, Result, Shape,
};

use crate::affine::{Affine, Parameterization};
use crate::positions::{check_masks, propagate_tensor_mask};

pub use dims::{ConvAxes, DimensionNumbers};
pub use geometry::{Padding, Window};

/// Which convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvKind {
    #[default]
    Regular,
    Transpose,
    /// Unshared weights per output position.
    Local,
}

/// An N-d convolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv {
    #[serde(default)]
    pub kind: ConvKind,
    pub out_chan: usize,
    /// Filter sizes, in the spatial order of the `rhs` layout.
    pub filter: Vec<usize>,
    /// Strides in the same order; all ones when absent.
    #[serde(default)]
    pub strides: Option<Vec<usize>>,
    #[serde(default)]
    pub padding: Padding,
    /// Channels-last layout when absent.
    #[serde(default)]
    pub dimension_numbers: Option<DimensionNumbers>,
    #[serde(flatten)]
    pub affine: Affine,
}

/// Geometry of one convolution call.
struct Plan {
    axes: ConvAxes,
    /// Output spatial sizes in `out` tensor order.
    out_spatial: Vec<usize>,
    /// One matrix per filter offset, rows in `out` position order.
    selections: Vec<Array2<f64>>,
    filter_size: usize,
}

impl Conv {
    fn with_kind(kind: ConvKind, out_chan: usize, filter: Vec<usize>) -> Self {
        Self {
            kind,
            out_chan,
            filter,
            strides: None,
            padding: Padding::Valid,
            dimension_numbers: None,
            affine: Affine::default(),
        }
    }

    pub fn new(out_chan: usize, filter: Vec<usize>) -> Self {
        Self::with_kind(ConvKind::Regular, out_chan, filter)
    }

    pub fn transpose(out_chan: usize, filter: Vec<usize>) -> Self {
        Self::with_kind(ConvKind::Transpose, out_chan, filter)
    }

    pub fn local(out_chan: usize, filter: Vec<usize>) -> Self {
        Self::with_kind(ConvKind::Local, out_chan, filter)
    }

    pub fn with_strides(mut self, strides: Vec<usize>) -> Self {
        self.strides = Some(strides);
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Layouts are validated when the layer is used.
    pub fn with_dimension_numbers(mut self, dimension_numbers: DimensionNumbers) -> Self {
        self.dimension_numbers = Some(dimension_numbers);
        self
    }

    pub fn with_std(mut self, w_std: f64, b_std: f64) -> Self {
        self.affine.w_std = w_std;
        self.affine.b_std = b_std;
        self
    }

    pub fn with_parameterization(mut self, parameterization: Parameterization) -> Self {
        self.affine.parameterization = parameterization;
        self
    }

    fn label(&self) -> &'static str {
        match self.kind {
            ConvKind::Regular => "Conv",
            ConvKind::Transpose => "ConvTranspose",
            ConvKind::Local => "ConvLocal",
        }
    }

    pub fn dimension_numbers(&self) -> DimensionNumbers {
        self.dimension_numbers
            .clone()
            .unwrap_or_else(|| DimensionNumbers::default_for(self.filter.len()))
    }

    fn strides(&self) -> Vec<usize> {
        self.strides.clone().unwrap_or_else(|| vec![1; self.filter.len()])
    }

    /// Resolve axes and check them against a tensor of `shape` whose batch and
    /// channel axes are `(batch, channel)`.
    fn axes_for(&self, shape: &Shape, batch: usize, channel: usize) -> Result<ConvAxes> {
        let dims = self.dimension_numbers();
        let axes = dims.axes()?;
        if dims.lhs.chars().count() != shape.rank() {
            return Err(KernelError::DimensionNumbers {
                spec: dims.lhs.clone(),
                reason: format!("input has rank {}", shape.rank()),
            });
        }
        if self.filter.len() != axes.spatial_rank() {
            return Err(KernelError::DimensionNumbers {
                spec: dims.rhs.clone(),
                reason: format!(
                    "filter {:?} does not match {} spatial axes",
                    self.filter,
                    axes.spatial_rank()
                ),
            });
        }
        if self.strides().len() != axes.spatial_rank() {
            return Err(KernelError::InvalidConfig {
                layer: self.label().to_string(),
                reason: format!("strides {:?} for {} spatial axes", self.strides(), axes.spatial_rank()),
            });
        }
        for (role, expected, got) in [
            ("batch", axes.lhs_batch, batch),
            ("channel", axes.lhs_channel, channel),
        ] {
            if expected != got {
                return Err(KernelError::AxisMismatch {
                    layer: self.label().to_string(),
                    role: role.to_string(),
                    expected,
                    got,
                });
            }
        }
        Ok(axes)
    }

    fn window(&self, axes: &ConvAxes) -> Window {
        let window = Window::new(
            axes.to_lhs_order(&self.filter),
            axes.to_lhs_order(&self.strides()),
            self.padding,
        );
        if self.kind == ConvKind::Transpose {
            window.transposed()
        } else {
            window
        }
    }

    fn plan(&self, axes: ConvAxes, input_spatial: &[usize]) -> Result<Plan> {
        let window = self.window(&axes);
        let (out_lhs, selections) = window.selections(input_spatial, self.label())?;
        let out_spatial: Vec<usize> = axes.out_order.iter().map(|&d| out_lhs[d]).collect();

        // Rows of the selection matrices follow lhs axis order; reorder them
        // to the output's.
        let identity = axes.out_order.iter().enumerate().all(|(j, &d)| j == d);
        let selections = if identity {
            selections
        } else {
            let rows: Vec<usize> = indices(IxDyn(&out_spatial))
                .into_iter()
                .map(|idx| {
                    let mut lhs_index = vec![0; out_lhs.len()];
                    for (j, &d) in axes.out_order.iter().enumerate() {
                        lhs_index[d] = idx[j];
                    }
                    lhs_index
                        .iter()
                        .zip(&out_lhs)
                        .fold(0, |flat, (&i, &n)| flat * n + i)
                })
                .collect();
            selections.iter().map(|m| m.select(Axis(0), &rows)).collect()
        };
        Ok(Plan {
            axes,
            out_spatial,
            filter_size: window.size(),
            selections,
        })
    }

    /// Output shape for `batch` examples with `channels` channels.
    fn out_shape(&self, plan: &Plan, batch: usize, channels: usize) -> Shape {
        let mut spatial = plan.out_spatial.iter();
        let dims = self
            .dimension_numbers()
            .out
            .chars()
            .map(|c| match c {
                'N' => batch,
                'C' => channels,
                _ => spatial.next().copied().unwrap_or(1),
            })
            .collect();
        Shape::new(dims)
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let axes = self.axes_for(&kernel.shape1, kernel.batch_axis, kernel.channel_axis)?;
        let plan = self.plan(axes, &kernel.spatial())?;
        check_masks(&kernel, kernel.positions())?;

        let scale = 1.0 / (plan.filter_size as f64).sqrt();
        let map = PositionMap::new(plan.selections.iter().map(|m| m * scale).collect());
        let map = if self.kind == ConvKind::Local { map.local() } else { map };

        let c_in = kernel.shape1.dim(kernel.channel_axis)?;
        let layout = Layout {
            shape1: self.out_shape(&plan, kernel.batch_size(Operand::First), self.out_chan),
            shape2: self.out_shape(&plan, kernel.shape2.dim(kernel.batch_axis)?, self.out_chan),
            batch_axis: plan.axes.out_batch,
            channel_axis: plan.axes.out_channel,
        };
        debug!(
            layer = self.label(),
            input = %kernel.shape1,
            output = %layout.shape1,
            offsets = plan.filter_size,
            "convolution kernel"
        );
        let mapped = kernel.map_positions(layout, &PositionMaps::Shared(map))?;
        self.affine
            .finish(mapped, c_in * plan.filter_size, self.kind == ConvKind::Local)
    }

    /// Filter tensor as `(offsets, C_in, C_out)`, offsets in lhs order.
    fn shared_filter(&self, w: &ArrayD<f64>, axes: &ConvAxes, c_in: usize) -> Result<Array3<f64>> {
        let mut order: Vec<usize> = axes.rhs_order.iter().map(|&r| axes.rhs_spatial[r]).collect();
        order.push(axes.rhs_in);
        order.push(axes.rhs_out);
        let permuted = w.view().permuted_axes(IxDyn(&order));
        let data: Vec<f64> = permuted.iter().copied().collect();
        let offsets = self.filter.iter().product();
        Ok(Array3::from_shape_vec((offsets, c_in, self.out_chan), data)?)
    }
}

impl Layer for Conv {
    fn meta(&self) -> LayerMeta {
        let spatial = match self.kind {
            ConvKind::Local => Diagonal::new(Tristate::Yes, Tristate::Yes),
            _ => self.affine.diagonal(),
        };
        let dims = self.dimension_numbers();
        let axes = dims
            .axes()
            .map(|a| AxisSpec::new(a.lhs_batch as isize, a.lhs_channel as isize))
            .unwrap_or(AxisSpec::ANY);
        let meta = LayerMeta::new(self.label())
            .with_diagonal(DiagonalReqs::new(self.affine.diagonal(), spatial))
            .with_axes(axes);
        if dims.preserves_layout() {
            meta
        } else {
            meta.changes_layout()
        }
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let shape = input.as_leaf().ok_or_else(|| KernelError::Structure {
            reason: format!("{} takes a single input", self.label()),
        })?;
        let axes = self.dimension_numbers().axes()?;
        let axes = self.axes_for(shape, axes.lhs_batch, axes.lhs_channel)?;
        let (batch, channel) = (axes.lhs_batch, axes.lhs_channel);
        let c_in = shape.dim(channel)?;
        let plan = self.plan(axes, &shape.spatial_dims(batch, channel))?;
        let fan_in = c_in * plan.filter_size;

        let (w_shape, b_shape) = match self.kind {
            ConvKind::Local => {
                let s_out: usize = plan.out_spatial.iter().product();
                (vec![s_out, plan.filter_size, c_in, self.out_chan], vec![s_out, self.out_chan])
            }
            _ => {
                let mut rhs_spatial = self.filter.iter();
                let w = self
                    .dimension_numbers()
                    .rhs
                    .chars()
                    .map(|c| match c {
                        'I' => c_in,
                        'O' => self.out_chan,
                        _ => rhs_spatial.next().copied().unwrap_or(1),
                    })
                    .collect();
                (w, vec![self.out_chan])
            }
        };
        let (w, b) = self.affine.sample(rng, &w_shape, &b_shape, fan_in);
        let out = self.out_shape(&plan, shape.dim(batch)?, self.out_chan);
        Ok((Nested::Leaf(out), Params::Tensors(vec![w, b])))
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        let (w, b) = (params.tensor(0)?, params.tensor(1)?);
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let axes = self.dimension_numbers().axes()?;
            let axes = self.axes_for(&shape, axes.lhs_batch, axes.lhs_channel)?;
            let (batch, channel) = (axes.lhs_batch, axes.lhs_channel);
            let c_in = shape.dim(channel)?;
            let plan = self.plan(axes, &shape.spatial_dims(batch, channel))?;
            let (w_scale, b_scale) = self.affine.forward_scales(c_in * plan.filter_size);

            let canonical = to_canonical(&x.value, batch, channel)?;
            let n = canonical.dim().0;
            let s_out: usize = plan.out_spatial.iter().product();
            let mut y: Array3<f64> = Array3::zeros((n, s_out, self.out_chan));

            match self.kind {
                ConvKind::Local => {
                    let w = w.view().into_dimensionality::<Ix4>()?;
                    for (example, mut out) in canonical.outer_iter().zip(y.outer_iter_mut()) {
                        for (f, m) in plan.selections.iter().enumerate() {
                            let gathered = m.dot(&example);
                            for (o, row) in gathered.outer_iter().enumerate() {
                                let w_of = w.index_axis(Axis(0), o);
                                let contribution = row.dot(&w_of.index_axis(Axis(0), f));
                                out.row_mut(o).scaled_add(w_scale, &contribution);
                            }
                        }
                    }
                    let b = b.view().into_dimensionality::<ndarray::Ix2>()?;
                    for mut out in y.outer_iter_mut() {
                        out.scaled_add(b_scale, &b);
                    }
                }
                _ => {
                    let filters = self.shared_filter(w, &plan.axes, c_in)?;
                    for (example, mut out) in canonical.outer_iter().zip(y.outer_iter_mut()) {
                        for (m, w_f) in plan.selections.iter().zip(filters.outer_iter()) {
                            out.scaled_add(w_scale, &m.dot(&example).dot(&w_f));
                        }
                    }
                    let b = b.view().into_dimensionality::<ndarray::Ix1>()?;
                    for mut row in y.rows_mut() {
                        row.scaled_add(b_scale, &b);
                    }
                }
            }

            let out_shape = self.out_shape(&plan, n, self.out_chan);
            let out_axes = (plan.axes.out_batch, plan.axes.out_channel);
            let value = from_canonical(&y, &out_shape, out_axes.0, out_axes.1)?;
            let mask = match &x.mask {
                Some(mask) => {
                    let map = PositionMap::new(plan.selections.clone());
                    Some(propagate_tensor_mask(mask, (batch, channel), &[map], &out_shape, out_axes)?)
                }
                None => None,
            };
            Masked::with_mask(value, mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k))
    }
}
