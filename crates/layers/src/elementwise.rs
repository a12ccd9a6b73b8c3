//! Layer wrapper that applies an [`Activation`] position by position.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use tracing::trace;

use widenet_core::diagonal::{Diagonal, DiagonalReqs, Tristate};
use widenet_core::kernel::field_blocks;
use widenet_core::{
    ApplyArgs, Block, Example, Exactness, Field, Fields, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked,
    Nested, Operand, Params, Result, Shape,
};

use crate::activation::{ABRelu, Activation, Erf, Gelu, Identity, Rbf, Relu, Sin};

/// `y = φ(x)` for every entry.
#[derive(Debug, Clone)]
pub struct Elementwise<A> {
    pub activation: A,
}

impl<A: Activation> Elementwise<A> {
    pub fn new(activation: A) -> Self {
        Self { activation }
    }

    fn diagonal(&self) -> Diagonal {
        let output = if self.activation.is_zero_mean() {
            Tristate::Maybe
        } else {
            Tristate::No
        };
        Diagonal::new(Tristate::Yes, output)
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let act = &self.activation;
        let linear = act.is_linear();
        if !linear && !kernel.is_gaussian {
            return Err(KernelError::GaussianRequired { layer: act.name() });
        }

        let first = variances(&kernel, Operand::First)?;
        let second = variances(&kernel, Operand::Second)?;
        let var = |e: Example| match kernel.resolve(e.operand) {
            Operand::First => &first,
            Operand::Second => &second,
        };
        let spatial = kernel.spatial();
        let diagonal = kernel.diagonal_spatial;
        trace!(activation = %act.name(), positions = spatial.iter().product::<usize>(), "elementwise kernel");

        let fields = kernel.map_all(&spatial, diagonal, |field, left, right, block| {
            if field == Field::Ntk {
                return Ok(block);
            }
            let (v1, v2) = (&var(left)[left.index], &var(right)[right.index]);
            Ok(pointwise(v1, v2, &block, |a, b, c| act.nngp(a, b, c)))
        })?;

        let ntk = match (&kernel.ntk, field_blocks(&kernel, Field::Nngp)?) {
            (Some(_), Some(nngp)) => {
                let mut next = nngp.into_iter();
                kernel.map_field(Field::Ntk, &spatial, diagonal, |left, right, theta| {
                    let k = next.next().ok_or_else(|| KernelError::Invariant {
                        reason: "ntk has more blocks than nngp".to_string(),
                    })?;
                    let (v1, v2) = (&var(left)[left.index], &var(right)[right.index]);
                    let factor = pointwise(v1, v2, &k, |a, b, c| act.ntk_factor(a, b, c));
                    hadamard(theta, factor)
                })?
            }
            _ => None,
        };

        let is_gaussian = linear && kernel.is_gaussian;
        Ok(Kernel {
            is_gaussian,
            ..kernel.with_fields(Fields { ntk, ..fields })
        })
    }
}

fn variances(kernel: &Kernel, operand: Operand) -> Result<Vec<Array1<f64>>> {
    let operand = kernel.resolve(operand);
    (0..kernel.batch_size(operand))
        .map(|i| kernel.variances(Example::new(operand, i)))
        .collect()
}

/// `f(v1[p], v2[q], K[p, q])` over a block.
fn pointwise(v1: &Array1<f64>, v2: &Array1<f64>, block: &Block, f: impl Fn(f64, f64, f64) -> f64) -> Block {
    match block {
        Block::Full(m) => Block::Full(Array2::from_shape_fn(m.dim(), |(p, q)| f(v1[p], v2[q], m[[p, q]]))),
        Block::Diagonal(d) => Block::Diagonal(Array1::from_shape_fn(d.len(), |p| f(v1[p], v2[p], d[p]))),
    }
}

fn hadamard(a: Block, b: Block) -> Result<Block> {
    match (a, b) {
        (Block::Full(a), Block::Full(b)) => Ok(Block::Full(a * b)),
        (Block::Diagonal(a), Block::Diagonal(b)) => Ok(Block::Diagonal(a * b)),
        _ => Err(KernelError::Invariant {
            reason: "ntk and nngp blocks differ in spatial storage".to_string(),
        }),
    }
}

impl<A: Activation> Layer for Elementwise<A> {
    fn meta(&self) -> LayerMeta {
        let meta = LayerMeta::new(self.activation.name())
            .with_diagonal(DiagonalReqs::new(self.diagonal(), self.diagonal()));
        match self.activation.exactness() {
            Exactness::Approximate => meta.approximate(),
            Exactness::Exact => meta,
        }
    }

    fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        Ok((input.clone(), Params::None))
    }

    fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
        inputs.try_map(&mut |x: Masked| {
            let value = x.value.mapv(|v| self.activation.apply(v));
            Masked::with_mask(value, x.mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        inputs.try_map(&mut |k: Kernel| self.transform(k))
    }
}

pub fn relu() -> Elementwise<Relu> {
    Elementwise::new(Relu)
}

pub fn ab_relu(a: f64, b: f64) -> Elementwise<ABRelu> {
    Elementwise::new(ABRelu::new(a, b))
}

pub fn leaky_relu(alpha: f64) -> Elementwise<ABRelu> {
    Elementwise::new(ABRelu::leaky(alpha))
}

pub fn abs() -> Elementwise<ABRelu> {
    Elementwise::new(ABRelu::abs())
}

pub fn erf(a: f64, b: f64, c: f64) -> Elementwise<Erf> {
    Elementwise::new(Erf::new(a, b, c))
}

pub fn identity() -> Elementwise<Identity> {
    Elementwise::new(Identity)
}

pub fn sin(a: f64, b: f64, c: f64) -> Elementwise<Sin> {
    Elementwise::new(Sin::new(a, b, c))
}

pub fn gelu() -> Elementwise<Gelu> {
    Elementwise::new(Gelu)
}

pub fn rbf(gamma: f64) -> Elementwise<Rbf> {
    Elementwise::new(Rbf::new(gamma))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Numerical;
    use crate::dense::Dense;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};
    use widenet_core::{InputSpec, LayerExt};

    fn gaussian(diagonal_spatial: bool) -> Kernel {
        let x = ArrayD::from_shape_fn(IxDyn(&[3, 4, 2]), |ix| ((ix[0] * 7 + ix[1] * 3 + ix[2]) as f64).sin());
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: 2,
            diagonal_batch: false,
            diagonal_spatial,
            compute_ntk: true,
            mask_constant: None,
        };
        let k = Kernel::from_inputs(&x, None, &spec).unwrap();
        Dense::new(5)
            .with_std(1.2, 0.1)
            .kernel(Nested::Leaf(k), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap()
    }

    fn run<A: Activation>(layer: &Elementwise<A>, k: Kernel) -> Result<Kernel> {
        layer.kernel(Nested::Leaf(k), &LayerArgs::default())?.into_leaf()
    }

    #[test]
    fn test_relu_kernel_entries() {
        let k = gaussian(false);
        let out = run(&relu(), k.clone()).unwrap();
        let (v1, v2, c) = (k.cov1[[0, 0, 1, 1]], k.cov1[[1, 1, 2, 2]], k.nngp[[0, 1, 1, 2]]);
        assert_relative_eq!(out.nngp[[0, 1, 1, 2]], Relu.nngp(v1, v2, c), epsilon = 1e-12);
        let theta = k.ntk.as_ref().unwrap()[[0, 1, 1, 2]];
        assert_relative_eq!(
            out.ntk.unwrap()[[0, 1, 1, 2]],
            theta * Relu.ntk_factor(v1, v2, c),
            epsilon = 1e-12
        );
        assert!(!out.is_gaussian);
    }

    #[test]
    fn test_linear_keeps_gaussian() {
        let out = run(&ab_relu(2.0, 2.0), gaussian(false)).unwrap();
        assert!(out.is_gaussian);
    }

    #[test]
    fn test_nonlinear_requires_gaussian_input() {
        let x = ArrayD::from_elem(IxDyn(&[2, 3]), 1.0);
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: 1,
            diagonal_batch: true,
            diagonal_spatial: false,
            compute_ntk: false,
            mask_constant: None,
        };
        let raw = Kernel::from_inputs(&x, None, &spec).unwrap();
        assert!(matches!(
            run(&erf(1.0, 1.0, 0.0), raw.clone()),
            Err(KernelError::GaussianRequired { .. })
        ));
        assert!(run(&identity(), raw).is_ok());
    }

    #[test]
    fn test_diagonal_matches_full() {
        let full = run(&leaky_relu(0.1), gaussian(false)).unwrap();
        let diag = run(&leaky_relu(0.1), gaussian(true)).unwrap();
        let compressed = full.to_diagonal(false, true).unwrap();
        for (a, b) in compressed.nngp.iter().zip(diag.nngp.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_mean_declares_maybe() {
        assert_eq!(erf(1.0, 1.0, 0.0).meta().diagonal.spatial.output, Tristate::Maybe);
        assert_eq!(relu().meta().diagonal.spatial.output, Tristate::No);
    }

    fn agrees_with_quadrature<A: Activation + Copy + 'static>(closed: Elementwise<A>, k: Kernel) {
        let act = closed.activation;
        let numeric = Elementwise::new(Numerical::new(act.name(), move |x| act.apply(x), 64).unwrap());
        let exact = run(&closed, k.clone()).unwrap();
        let approx = run(&numeric, k).unwrap();
        for (a, b) in exact.nngp.iter().zip(approx.nngp.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
        // Finite-difference slopes in the quadrature.
        for (a, b) in exact.ntk.unwrap().iter().zip(approx.ntk.unwrap().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_sin_gelu_rbf_layers_match_quadrature() {
        agrees_with_quadrature(sin(1.1, 0.9, 0.3), gaussian(false));
        agrees_with_quadrature(gelu(), gaussian(false));
        agrees_with_quadrature(rbf(0.4), gaussian(true));
        assert_eq!(sin(1.0, 1.0, 0.0).meta().diagonal.spatial.output, Tristate::Maybe);
        assert_eq!(gelu().meta().diagonal.spatial.output, Tristate::No);
    }

    #[test]
    fn test_numerical_meta_is_approximate() {
        let layer = Elementwise::new(Numerical::new("sin", f64::sin, 20).unwrap().zero_mean());
        assert_eq!(layer.meta().exactness, Exactness::Approximate);
        assert_eq!(layer.meta().name, "sin");
    }

    #[test]
    fn test_apply_zeroes_masked() {
        let layer = erf(1.0, 1.0, 0.5);
        let (_, params) = layer.init_with_seed(0, &Nested::Leaf(Shape::new(vec![1, 2, 1]))).unwrap();
        let value = ArrayD::from_elem(IxDyn(&[1, 2, 1]), 0.3);
        let mask = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1]), vec![false, true]).unwrap();
        let y = layer
            .apply(&params, Nested::Leaf(Masked::with_mask(value, Some(mask))), &ApplyArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_relative_eq!(y.value[[0, 0, 0]], Erf::new(1.0, 1.0, 0.5).apply(0.3));
        assert_eq!(y.value[[0, 1, 0]], 0.0);
    }
}
