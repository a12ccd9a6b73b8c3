//! Global self-attention over all spatial positions.
//!
//! In the infinite-width limit the query-key logits of example `e`
//! concentrate on `G_e = σqk² K_e`, with `K_e` the example's own position
//! covariance. The attention weights `A_e` are then constant and
//!
//! ```text
//!   nngp' = σv² σo² A₁ K A₂ᵀ
//!   ntk'  = 2 nngp' + σv² σo² A₁ Θ A₂ᵀ
//! ```
//!
//! `Linear` mode uses `A = G / S` directly (exact, Gaussian-preserving).
//! `Softmax` mode takes a row softmax of `G`; treating the logits as their
//! limit is an approximation and the output is not Gaussian.

use ndarray::{Array2, Array3, ArrayView1, Axis, Ix2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use widenet_core::diagonal::{Diagonal, DiagonalReqs};
use widenet_core::layout::{from_canonical, to_canonical};
use widenet_core::{
    ApplyArgs, AxisSpec, Block, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked, Nested, Params,
    PositionMap, Result, Shape,
};

use crate::affine::normal;
use crate::positions::{check_masks, per_example, resized};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionMode {
    #[default]
    Linear,
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSelfAttention {
    pub n_chan_out: usize,
    pub n_chan_val: usize,
    pub qk_std: f64,
    pub v_std: f64,
    pub o_std: f64,
    pub mode: AttentionMode,
    pub batch_axis: isize,
    pub channel_axis: isize,
}

impl Default for GlobalSelfAttention {
    fn default() -> Self {
        Self {
            n_chan_out: 1,
            n_chan_val: 1,
            qk_std: 1.0,
            v_std: 1.0,
            o_std: 1.0,
            mode: AttentionMode::Linear,
            batch_axis: 0,
            channel_axis: -1,
        }
    }
}

impl GlobalSelfAttention {
    pub fn new(n_chan_out: usize, n_chan_val: usize, mode: AttentionMode) -> Self {
        Self {
            n_chan_out,
            n_chan_val,
            mode,
            ..Self::default()
        }
    }

    pub fn with_std(mut self, qk_std: f64, v_std: f64, o_std: f64) -> Self {
        self.qk_std = qk_std;
        self.v_std = v_std;
        self.o_std = o_std;
        self
    }

    /// Attention weights from logits; masked keys get zero weight.
    fn weights(&self, logits: Array2<f64>, mask: Option<ArrayView1<'_, bool>>) -> Array2<f64> {
        let keys = logits.ncols();
        let open = |q: usize| mask.map_or(true, |m| !m[q]);
        let unmasked = (0..keys).filter(|&q| open(q)).count();
        let mut a = logits;
        for mut row in a.axis_iter_mut(Axis(0)) {
            match self.mode {
                AttentionMode::Linear => {
                    let scale = if unmasked > 0 { 1.0 / unmasked as f64 } else { 0.0 };
                    for (q, v) in row.iter_mut().enumerate() {
                        *v = if open(q) { *v * scale } else { 0.0 };
                    }
                }
                AttentionMode::Softmax => {
                    let max = row
                        .iter()
                        .enumerate()
                        .filter(|&(q, _)| open(q))
                        .map(|(_, &v)| v)
                        .fold(f64::NEG_INFINITY, f64::max);
                    for (q, v) in row.iter_mut().enumerate() {
                        *v = if open(q) { (*v - max).exp() } else { 0.0 };
                    }
                    let total = row.sum();
                    if total > 0.0 {
                        row.mapv_inplace(|v| v / total);
                    }
                }
            }
        }
        a
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let spatial = kernel.spatial();
        let s = kernel.positions();
        check_masks(&kernel, s)?;
        let scale = self.v_std * self.o_std;
        let qk = self.qk_std * self.qk_std;

        let maps = per_example(&kernel, |e| {
            let k = match kernel.self_block(e)? {
                Block::Full(m) => m,
                Block::Diagonal(d) => Array2::from_diag(&d),
            };
            let mask = kernel.mask(e.operand).map(|m| m.row(e.index));
            let a = self.weights(k * qk, mask);
            Ok(PositionMap::single(a * scale))
        })?;
        debug!(mode = ?self.mode, positions = s, "attention kernel");

        let (mask1, mask2) = (kernel.mask1.clone(), kernel.mask2.clone());
        let is_gaussian = kernel.is_gaussian && self.mode == AttentionMode::Linear;
        let layout = resized(&kernel, &spatial, Some(self.n_chan_out))?;
        let mapped = kernel.map_positions(layout, &maps)?;
        let ntk = mapped.ntk.as_ref().map(|theta| theta + &(&mapped.nngp * 2.0));
        Ok(Kernel {
            ntk,
            is_gaussian,
            mask1,
            mask2,
            ..mapped
        })
    }

    fn axes(&self, shape: &Shape) -> Result<(usize, usize)> {
        AxisSpec::new(self.batch_axis, self.channel_axis).resolve(shape.rank())
    }
}

impl Layer for GlobalSelfAttention {
    fn meta(&self) -> LayerMeta {
        let meta = LayerMeta::new("GlobalSelfAttention")
            .with_diagonal(DiagonalReqs::new(Diagonal::IDENTITY, Diagonal::FULL))
            .with_axes(AxisSpec::new(self.batch_axis, self.channel_axis));
        match self.mode {
            AttentionMode::Linear => meta,
            AttentionMode::Softmax => meta.approximate(),
        }
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let shape = input.as_leaf().ok_or_else(|| KernelError::Structure {
            reason: "GlobalSelfAttention takes a single input".to_string(),
        })?;
        let (_, channel) = self.axes(shape)?;
        let c = shape.dim(channel)?;
        let params = vec![
            normal(rng, &[c, c], 1.0),
            normal(rng, &[c, self.n_chan_val], 1.0),
            normal(rng, &[self.n_chan_val, self.n_chan_out], 1.0),
        ];
        Ok((
            Nested::Leaf(shape.with_dim(channel, self.n_chan_out)),
            Params::Tensors(params),
        ))
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        let w_qk = params.tensor(0)?.view().into_dimensionality::<Ix2>()?;
        let w_v = params.tensor(1)?.view().into_dimensionality::<Ix2>()?;
        let w_o = params.tensor(2)?.view().into_dimensionality::<Ix2>()?;
        inputs.try_map(&mut |x: Masked| {
            let shape = x.shape();
            let (batch, channel) = self.axes(&shape)?;
            let c = shape.dim(channel)? as f64;
            let positions = x.positions(batch, channel)?;
            let canonical = to_canonical(&x.value, batch, channel)?;
            let (n, s, _) = canonical.dim();

            let mut y = Array3::<f64>::zeros((n, s, self.n_chan_out));
            for (i, xn) in canonical.outer_iter().enumerate() {
                let q = xn.dot(&w_qk);
                let logits = q.dot(&q.t()) * (self.qk_std * self.qk_std / (c * c));
                let a = self.weights(logits, positions.as_ref().map(|m| m.row(i)));
                let v = xn.dot(&w_v) * (self.v_std / c.sqrt());
                let out = a.dot(&v).dot(&w_o) * (self.o_std / (self.n_chan_val.max(1) as f64).sqrt());
                y.index_axis_mut(Axis(0), i).assign(&out);
            }
            let value = from_canonical(&y, &shape.with_dim(channel, self.n_chan_out), batch, channel)?;
            Masked::with_mask(value, x.mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k))
    }
}
