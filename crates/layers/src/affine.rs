//! Weight / bias statistics shared by dense and convolutional layers.
//!
//! After a linear position map `op` has been applied to the incoming kernel,
//! the affine layer adds its own weight and bias variances:
//!
//! ```text
//!   nngp' = σw² op(K) + σb²
//!   ntk'  = nngp' + σw² op(Θ)                      (NTK parameterization)
//!   ntk'  = fan_in op(K) + [bias] + σw² op(Θ)      (standard parameterization)
//! ```

use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::{Block, Field, Kernel, Result};

/// How weights are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameterization {
    /// Unit-variance parameters, `1/sqrt(fan_in)` scaling in the forward pass.
    #[default]
    Ntk,
    /// Parameters drawn with variance `σw² / fan_in`.
    Standard,
}

/// Weight and bias standard deviations of an affine layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Affine {
    pub w_std: f64,
    pub b_std: f64,
    pub parameterization: Parameterization,
}

impl Default for Affine {
    fn default() -> Self {
        Self {
            w_std: 1.0,
            b_std: 0.0,
            parameterization: Parameterization::Ntk,
        }
    }
}

impl Affine {
    /// A bias shifts off-diagonal entries; without one zeros stay zeros.
    pub fn diagonal(&self) -> Diagonal {
        let output = if self.b_std == 0.0 {
            Tristate::Maybe
        } else {
            Tristate::No
        };
        Diagonal::new(Tristate::Yes, output)
    }

    pub fn reqs(&self) -> DiagonalReqs {
        DiagonalReqs::new(self.diagonal(), self.diagonal())
    }

    /// Draw `(weights, bias)` for the given shapes.
    pub fn sample(
        &self,
        rng: &mut StdRng,
        weights: &[usize],
        bias: &[usize],
        fan_in: usize,
    ) -> (ArrayD<f64>, ArrayD<f64>) {
        let (w_scale, b_scale) = match self.parameterization {
            Parameterization::Ntk => (1.0, 1.0),
            Parameterization::Standard => (self.w_std / (fan_in.max(1) as f64).sqrt(), self.b_std),
        };
        (normal(rng, weights, w_scale), normal(rng, bias, b_scale))
    }

    /// Multipliers applied to `(x W, b)` in the forward pass.
    pub fn forward_scales(&self, fan_in: usize) -> (f64, f64) {
        match self.parameterization {
            Parameterization::Ntk => (self.w_std / (fan_in.max(1) as f64).sqrt(), self.b_std),
            Parameterization::Standard => (1.0, 1.0),
        }
    }

    /// Add weight and bias statistics to a kernel whose fields already hold
    /// `op(K)` and `op(Θ)`. With `local_bias` the bias is independent per
    /// position and only reaches matching-position entries.
    pub fn finish(&self, kernel: Kernel, fan_in: usize, local_bias: bool) -> Result<Kernel> {
        let w2 = self.w_std * self.w_std;
        let b2 = self.b_std * self.b_std;
        let shift = |block: Block, scale: f64, bias: f64| {
            if local_bias {
                block.map(|v| scale * v).add_diagonal(bias)
            } else {
                block.map(|v| scale * v + bias)
            }
        };
        let spatial = kernel.spatial();
        let diagonal = kernel.diagonal_spatial;

        let fields = kernel.map_all(&spatial, diagonal, |field, _, _, block| {
            Ok(match field {
                Field::Ntk => block.map(|v| w2 * v),
                _ => shift(block, w2, b2),
            })
        })?;

        let ntk = match (fields.ntk, self.parameterization) {
            (Some(theta), Parameterization::Ntk) => Some(theta + &fields.nngp),
            (Some(theta), Parameterization::Standard) => {
                let bias_grad = if self.b_std == 0.0 { 0.0 } else { 1.0 };
                let grad = kernel.map_field(Field::Nngp, &spatial, diagonal, |_, _, block| {
                    Ok(shift(block, fan_in as f64, bias_grad))
                })?;
                grad.map(|g| theta + g)
            }
            (None, _) => None,
        };

        Ok(Kernel {
            nngp: fields.nngp,
            ntk,
            cov1: fields.cov1,
            cov2: fields.cov2,
            is_gaussian: true,
            ..kernel
        })
    }
}

/// `N(0, scale²)` samples of the given shape.
pub fn normal(rng: &mut StdRng, shape: &[usize], scale: f64) -> ArrayD<f64> {
    ArrayD::from_shape_simple_fn(shape, || scale * rng.sample::<f64, _>(StandardNormal))
}
