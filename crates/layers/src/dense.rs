//! Fully connected layer: contracts the channel axis.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use widenet_core::layout::{from_canonical, to_canonical};
use widenet_core::{
    ApplyArgs, AxisSpec, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked, Nested, Params, Result, Shape,
};

use crate::affine::{Affine, Parameterization};

/// `y = σw / sqrt(C) x W + σb b` (NTK parameterization) over the channel axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dense {
    pub out_dim: usize,
    #[serde(flatten)]
    pub affine: Affine,
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Default for Dense {
    fn default() -> Self {
        Self {
            out_dim: 1,
            affine: Affine::default(),
            batch_axis: 0,
            channel_axis: -1,
        }
    }
}

impl Dense {
    pub fn new(out_dim: usize) -> Self {
        Self {
            out_dim,
            ..Self::default()
        }
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

    pub fn with_axes(mut self, batch_axis: isize, channel_axis: isize) -> Self {
        self.batch_axis = batch_axis;
        self.channel_axis = channel_axis;
        self
    }

    fn axes(&self, shape: &Shape) -> Result<(usize, usize)> {
        Ok((shape.axis(self.batch_axis)?, shape.axis(self.channel_axis)?))
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let fan_in = kernel.shape1.dim(kernel.channel_axis)?;
        let channel = kernel.channel_axis;
        let out = self.affine.finish(kernel, fan_in, false)?;
        Ok(Kernel {
            shape1: out.shape1.with_dim(channel, self.out_dim),
            shape2: out.shape2.with_dim(channel, self.out_dim),
            ..out
        })
    }
}

impl Layer for Dense {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new("Dense")
            .with_diagonal(self.affine.reqs())
            .with_axes(AxisSpec::new(self.batch_axis, self.channel_axis))
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let shape = input.as_leaf().ok_or_else(|| KernelError::Structure {
            reason: "Dense takes a single input".to_string(),
        })?;
        let (_, channel) = self.axes(shape)?;
        let fan_in = shape.dim(channel)?;
        let (w, b) = self
            .affine
            .sample(rng, &[fan_in, self.out_dim], &[self.out_dim], fan_in);
        Ok((
            Nested::Leaf(shape.with_dim(channel, self.out_dim)),
            Params::Tensors(vec![w, b]),
        ))
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        let w = params.tensor(0)?.view().into_dimensionality::<ndarray::Ix2>()?;
        let b = params.tensor(1)?;
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = self.axes(&shape)?;
            let fan_in = shape.dim(channel)?;
            let (w_scale, b_scale) = self.affine.forward_scales(fan_in);

            let canonical = to_canonical(&x.value, batch, channel)?;
            let (n, s, c) = canonical.dim();
            let flat = canonical.into_shape((n * s, c))?;
            let mut y: Array2<f64> = flat.dot(&w) * w_scale;
            for mut row in y.axis_iter_mut(Axis(0)) {
                row.zip_mut_with(b, |v, &bias| *v += b_scale * bias);
            }
            let y = y.into_shape((n, s, self.out_dim))?;
            let value = from_canonical(&y, &shape.with_dim(channel, self.out_dim), batch, channel)?;
            Masked::with_mask(value, x.mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| {
            debug!(out_dim = self.out_dim, fan_in = k.shape1.dims.get(k.channel_axis).copied(), "dense kernel");
            self.transform(k)
        })
    }
}
