//! Empirical NNGP and NTK of a finite network.
//!
//! Each sample draws fresh parameters, runs the forward pass on both inputs
//! and records the output correlations `(1/C) Σ_c y1[.., c] y2[.., c]`. The
//! estimate is their mean over samples, which converges to the
//! infinite-width NNGP as width and sample count grow.
//!
//! The tangent kernel is sketched the same way. For a direction `δ` with
//! unit-normal entries in every parameter tensor, `E[(J1 δ)(J2 δ)ᵀ] = J1 J2ᵀ`,
//! so correlating the directional derivatives
//!
//! ```text
//!   dy = (f(θ + εδ) - f(θ - εδ)) / 2ε
//! ```
//!
//! of both inputs gives an unbiased estimate of the empirical NTK of each
//! draw. Seeded layers (dropout) keep their seed across the three passes.

use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{debug, trace};

use widenet_core::{
    AxisSpec, Get, InputSpec, Kernel, KernelError, KernelOptions, Layer, LayerArgs, Masked, Nested, Operand, Output,
    Params, Result, Shape,
};

/// Samples evaluated sequentially by one worker before its partial sum is
/// handed back.
const CHUNK: usize = 64;

/// Step of the central difference along a random parameter direction.
const EPSILON: f64 = 1e-4;

/// Monte-Carlo estimator over random draws of `layer`'s parameters.
#[derive(Debug, Clone)]
pub struct MonteCarlo<L> {
    layer: L,
    seed: u64,
    n_samples: usize,
    output_axes: AxisSpec,
}

impl<L: Layer> MonteCarlo<L> {
    pub fn new(layer: L, seed: u64, n_samples: usize) -> Self {
        Self {
            layer,
            seed,
            n_samples,
            output_axes: AxisSpec::new(0, -1),
        }
    }

    /// Batch and channel axes of the network's output.
    pub fn with_output_axes(mut self, batch: isize, channel: isize) -> Self {
        self.output_axes = AxisSpec::new(batch, channel);
        self
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Estimate the requested outputs; the tangent kernel is only sketched
    /// when `get` asks for it.
    ///
    /// Storage follows `options` with full covariances as the default.
    pub fn kernel(
        &self,
        x1: &Nested<ArrayD<f64>>,
        x2: Option<&Nested<ArrayD<f64>>>,
        get: &Get,
        options: &KernelOptions,
        args: &LayerArgs,
    ) -> Result<Output> {
        if self.n_samples == 0 {
            return Err(KernelError::InvalidConfig {
                layer: "MonteCarlo".to_string(),
                reason: "n_samples must be positive".to_string(),
            });
        }

        let axes = self.layer.meta().axes;
        let masked = |x: &Nested<ArrayD<f64>>| {
            x.try_map_ref(&mut |leaf: &ArrayD<f64>| {
                let (batch, channel) = axes.resolve(leaf.ndim())?;
                Masked::from_sentinel(leaf, batch, channel, options.mask_constant)
            })
        };
        let inputs = Inputs {
            shapes: x1.try_map_ref(&mut |leaf: &ArrayD<f64>| Ok(Shape::new(leaf.shape().to_vec())))?,
            x1: masked(x1)?,
            x2: x2.map(masked).transpose()?,
            diagonal_batch: options.diagonal_batch.unwrap_or(false),
            diagonal_spatial: options.diagonal_spatial.unwrap_or(false),
            compute_ntk: get.needs_ntk(),
        };

        let mut rng = StdRng::seed_from_u64(self.seed);
        let seeds: Vec<u64> = (0..self.n_samples).map(|_| rng.gen()).collect();
        debug!(samples = self.n_samples, seed = self.seed, ntk = inputs.compute_ntk, "monte carlo estimate");

        let partials = seeds
            .par_chunks(CHUNK)
            .map(|chunk| {
                let mut sum: Option<Nested<Kernel>> = None;
                for &seed in chunk {
                    let sample = self.sample(seed, &inputs, args)?;
                    sum = Some(match sum {
                        Some(acc) => add(acc, sample)?,
                        None => sample,
                    });
                }
                sum.ok_or_else(|| KernelError::Structure {
                    reason: "empty sample chunk".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut total: Option<Nested<Kernel>> = None;
        for partial in partials {
            total = Some(match total {
                Some(acc) => add(acc, partial)?,
                None => partial,
            });
        }
        let total = total.ok_or_else(|| KernelError::Structure {
            reason: "no samples were drawn".to_string(),
        })?;
        let n = self.n_samples as f64;
        let mean = total.try_map(&mut |k: Kernel| Ok(k.map_values(|_, v| v / n)))?;
        Output::from_kernels(mean, get)
    }

    fn sample(&self, seed: u64, inputs: &Inputs, args: &LayerArgs) -> Result<Nested<Kernel>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (_, params) = self.layer.init(&mut rng, &inputs.shapes)?;
        let (y1, y2) = self.forward(&params, inputs, args)?;
        trace!(seed, "monte carlo sample");
        let kernels = self.correlate_tree(y1, y2, inputs)?;
        if !inputs.compute_ntk {
            return Ok(kernels);
        }

        let direction = params.map_tensors(&mut |t| t.map(|_| rng.sample::<f64, _>(StandardNormal)));
        let (plus1, plus2) = self.forward(&params.axpy(EPSILON, &direction)?, inputs, args)?;
        let (minus1, minus2) = self.forward(&params.axpy(-EPSILON, &direction)?, inputs, args)?;
        let dy1 = difference(plus1, minus1)?;
        let dy2 = match (plus2, minus2) {
            (Some(p), Some(m)) => Some(difference(p, m)?),
            _ => None,
        };
        let tangents = self.correlate_tree(dy1, dy2, inputs)?;
        kernels.zip(tangents)?.try_map(&mut |(k, t): (Kernel, Kernel)| {
            Ok(Kernel {
                ntk: Some(t.nngp),
                ..k
            })
        })
    }

    fn forward(
        &self,
        params: &Params,
        inputs: &Inputs,
        args: &LayerArgs,
    ) -> Result<(Nested<Masked>, Option<Nested<Masked>>)> {
        let y1 = self.layer.apply(params, inputs.x1.clone(), &args.for_apply(Operand::First))?;
        let y2 = match &inputs.x2 {
            Some(x2) => Some(self.layer.apply(params, x2.clone(), &args.for_apply(Operand::Second))?),
            None => None,
        };
        Ok((y1, y2))
    }

    fn correlate_tree(
        &self,
        y1: Nested<Masked>,
        y2: Option<Nested<Masked>>,
        inputs: &Inputs,
    ) -> Result<Nested<Kernel>> {
        match y2 {
            None => y1.try_map(&mut |y: Masked| self.correlate(&y, None, inputs)),
            Some(y2) => y1
                .zip(y2)?
                .try_map(&mut |(a, b): (Masked, Masked)| self.correlate(&a, Some(&b), inputs)),
        }
    }

    fn correlate(&self, y1: &Masked, y2: Option<&Masked>, inputs: &Inputs) -> Result<Kernel> {
        let (batch_axis, channel_axis) = self.output_axes.resolve(y1.value.ndim())?;
        let spec = InputSpec {
            batch_axis,
            channel_axis,
            diagonal_batch: inputs.diagonal_batch,
            diagonal_spatial: inputs.diagonal_spatial,
            compute_ntk: false,
            mask_constant: None,
        };
        let kernel = Kernel::from_inputs(&y1.value, y2.map(|y| &y.value), &spec)?;
        Ok(Kernel {
            mask1: y1.positions(batch_axis, channel_axis)?,
            mask2: match y2 {
                Some(y) => y.positions(batch_axis, channel_axis)?,
                None => None,
            },
            ..kernel
        })
    }
}

/// Masked inputs and fixed storage shared by every sample.
struct Inputs {
    shapes: Nested<Shape>,
    x1: Nested<Masked>,
    x2: Option<Nested<Masked>>,
    diagonal_batch: bool,
    diagonal_spatial: bool,
    compute_ntk: bool,
}

/// Central difference of two forward passes; masks come from `plus`.
fn difference(plus: Nested<Masked>, minus: Nested<Masked>) -> Result<Nested<Masked>> {
    plus.zip(minus)?.try_map(&mut |(p, m): (Masked, Masked)| {
        if p.value.shape() != m.value.shape() {
            return Err(KernelError::shape_mismatch(p.value.shape(), m.value.shape()));
        }
        let value = (&p.value - &m.value) / (2.0 * EPSILON);
        Ok(Masked::with_mask(value, p.mask))
    })
}

/// Field-wise sum; masks, shapes and flags come from `a`.
fn add(a: Nested<Kernel>, b: Nested<Kernel>) -> Result<Nested<Kernel>> {
    a.zip(b)?.try_map(&mut |(a, b): (Kernel, Kernel)| {
        if a.nngp.shape() != b.nngp.shape() {
            return Err(KernelError::shape_mismatch(a.nngp.shape(), b.nngp.shape()));
        }
        Ok(Kernel {
            nngp: a.nngp + &b.nngp,
            ntk: match (a.ntk, b.ntk) {
                (Some(x), Some(y)) => Some(x + &y),
                _ => None,
            },
            cov1: a.cov1 + &b.cov1,
            cov2: match (a.cov2, b.cov2) {
                (Some(x), Some(y)) => Some(x + &y),
                _ => None,
            },
            ..a
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;
    use widenet_core::GetTag;
    use widenet_layers::Dense;

    fn x() -> Nested<ArrayD<f64>> {
        Nested::Leaf(ArrayD::from_shape_fn(IxDyn(&[3, 4]), |ix| ((ix[0] * 4 + ix[1]) as f64 * 0.7).sin()))
    }

    #[test]
    fn test_same_seed_same_estimate() {
        let mc = MonteCarlo::new(Dense::new(3), 11, 130);
        let get = Get::One(GetTag::Nngp);
        let run = || {
            mc.kernel(&x(), None, &get, &KernelOptions::new(), &LayerArgs::default())
                .unwrap()
                .into_array()
                .unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_ntk_needs_no_estimate_when_not_asked() {
        let mc = MonteCarlo::new(Dense::new(3), 0, 4);
        let k = mc
            .kernel(&x(), None, &Get::One(GetTag::Nngp), &KernelOptions::new(), &LayerArgs::default())
            .unwrap();
        assert!(k.into_array().is_ok());
        let both = mc
            .kernel(&x(), None, &Get::Kernel, &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_kernel()
            .unwrap();
        assert!(both.ntk.is_some());
    }

    #[test]
    fn test_dense_ntk_estimate_is_close() {
        // One dense layer is linear in its parameters, so every draw's
        // directional sketch is exact up to the direction's own noise.
        let layer = Dense::new(8).with_std(1.3, 0.4);
        let get = Get::One(GetTag::Ntk);
        let estimate = MonteCarlo::new(layer, 5, 3000)
            .kernel(&x(), None, &get, &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_array()
            .unwrap();
        let exact = widenet_core::kernel_fn(&layer, &x(), None, &get, &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_array()
            .unwrap();
        for (a, b) in estimate.iter().zip(exact.iter()) {
            assert_relative_eq!(a, b, epsilon = 0.06, max_relative = 0.05);
        }
    }

    #[test]
    fn test_zero_samples_rejected() {
        let mc = MonteCarlo::new(Dense::new(3), 0, 0);
        let err = mc
            .kernel(&x(), None, &Get::One(GetTag::Nngp), &KernelOptions::new(), &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig { .. }));
    }

    #[test]
    fn test_dense_estimate_is_close() {
        let layer = Dense::new(16).with_std(1.2, 0.5);
        let mc = MonteCarlo::new(layer, 3, 2000);
        let get = Get::One(GetTag::Nngp);
        let estimate = mc
            .kernel(&x(), None, &get, &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_array()
            .unwrap();
        let exact = widenet_core::kernel_fn(&layer, &x(), None, &get, &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_array()
            .unwrap();
        for (a, b) in estimate.iter().zip(exact.iter()) {
            assert_relative_eq!(a, b, epsilon = 0.05);
        }
    }

    #[test]
    fn test_shapes_are_reported() {
        let mc = MonteCarlo::new(Dense::new(5), 0, 2);
        let out = mc
            .kernel(&x(), None, &Get::Many(vec![GetTag::Shape1, GetTag::Cov1]), &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_arrays()
            .unwrap();
        assert_eq!(out[0], widenet_core::FieldValue::Shape(Shape::new(vec![3, 5])));
        assert_eq!(out[1].as_array().unwrap().shape(), &[3, 3]);
    }
}
