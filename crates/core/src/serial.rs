//! # Serial Composition
//!
//! `Serial` chains layers: the output of each one feeds the next, on the
//! finite-width path and on the kernel path alike.
//!
//! ```text
//!   x ──▶ Dense ──▶ Relu ──▶ Dense ──▶ y
//!
//!   Serial::new().then(dense).then(relu).then(dense)
//! ```
//!
//! Before each step the composed diagonal requirements of everything before
//! it are checked against the incoming kernel, so a compressed kernel never
//! reaches a layer that needs the entries it dropped. After each step masked
//! positions are zeroed again and the kernel invariants are re-checked.

use rand::rngs::StdRng;
use tracing::debug;

use crate::diagonal::DiagonalReqs;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::layer::{ApplyArgs, AxisSpec, Exactness, Layer, LayerArgs, LayerMeta, Params};
use crate::mask::Masked;
use crate::nested::Nested;
use crate::shape::Shape;

/// Sequential composition of layers.
#[derive(Debug, Default)]
pub struct Serial {
    layers: Vec<Box<dyn Layer>>,
}

impl Serial {
    /// An empty chain; it behaves as the identity.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Append a layer.
    pub fn then(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Append an already boxed layer.
    pub fn then_boxed(mut self, layer: Box<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }
}

/// Zero masked entries and re-check invariants on every leaf.
pub(crate) fn settle(kernels: Nested<Kernel>) -> Result<Nested<Kernel>> {
    kernels.try_map(&mut |kernel: Kernel| {
        let kernel = kernel.remask()?;
        kernel.check_invariants()?;
        Ok(kernel)
    })
}

impl Layer for Serial {
    fn meta(&self) -> LayerMeta {
        let metas: Vec<LayerMeta> = self.layers.iter().map(|l| l.meta()).collect();
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();

        let diagonal = metas
            .iter()
            .fold(DiagonalReqs::IDENTITY, |acc, m| acc >> m.diagonal);

        // Axis roles are only visible to the input up to the first layer that
        // rearranges the tensor.
        let mut axes = AxisSpec::ANY;
        for m in &metas {
            axes = axes.or(m.axes);
            if !m.preserves_layout {
                break;
            }
        }

        let exactness = metas
            .iter()
            .fold(Exactness::Exact, |acc, m| acc.and(m.exactness));

        LayerMeta {
            name: format!("Serial[{}]", names.join(", ")),
            diagonal,
            axes,
            preserves_layout: metas.iter().all(|m| m.preserves_layout),
            exactness,
        }
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let mut shape = input.clone();
        let mut params = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, p) = layer.init(rng, &shape)?;
            shape = next;
            params.push(p);
        }
        Ok((shape, Params::Nested(params)))
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>> {
        let mut outputs = inputs;
        for (i, layer) in self.layers.iter().enumerate() {
            outputs = layer.apply(params.child(i)?, outputs, args)?;
        }
        Ok(outputs)
    }

    fn kernel(&self, inputs: Nested<Kernel>, args: &LayerArgs) -> Result<Nested<Kernel>> {
        let mut kernels = inputs;
        let mut prefix = DiagonalReqs::IDENTITY;
        for (step, layer) in self.layers.iter().enumerate() {
            let meta = layer.meta();
            for kernel in kernels.leaves() {
                meta.check_diagonal(kernel, &prefix)?;
                meta.check_axes(kernel)?;
            }
            kernels = settle(layer.kernel(kernels, args)?)?;
            prefix = prefix >> meta.diagonal;

            if let Some(kernel) = kernels.leaves().first() {
                debug!(
                    step,
                    layer = %meta.name,
                    shape = %kernel.shape1,
                    is_gaussian = kernel.is_gaussian,
                    diagonal_batch = kernel.diagonal_batch,
                    diagonal_spatial = kernel.diagonal_spatial,
                    "kernel step"
                );
            }
        }
        Ok(kernels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagonal::{Diagonal, Tristate};
    use crate::error::KernelError;
    use crate::kernel::InputSpec;
    use ndarray::{ArrayD, IxDyn};
    use rand::SeedableRng;

    /// Scales every field by a constant; requirements are configurable.
    #[derive(Debug)]
    struct Scale {
        factor: f64,
        diagonal: DiagonalReqs,
    }

    impl Layer for Scale {
        fn meta(&self) -> LayerMeta {
            LayerMeta::new(format!("Scale({})", self.factor)).with_diagonal(self.diagonal)
        }

        fn init(&self, _rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
            Ok((input.clone(), Params::None))
        }

        fn apply(&self, _params: &Params, inputs: Nested<Masked>, _args: &ApplyArgs) -> Result<Nested<Masked>> {
            inputs.try_map(&mut |m: Masked| {
                Ok(Masked::with_mask(m.value * self.factor.sqrt(), m.mask))
            })
        }

        fn kernel(&self, inputs: Nested<Kernel>, _args: &LayerArgs) -> Result<Nested<Kernel>> {
            inputs.try_map(&mut |k: Kernel| Ok(k.map_values(|_, v| v * self.factor)))
        }
    }

    fn scale(factor: f64) -> Scale {
        Scale {
            factor,
            diagonal: DiagonalReqs::IDENTITY,
        }
    }

    fn kernel(diagonal_spatial: bool) -> Kernel {
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 3, 2]), |ix| (ix[0] + 2 * ix[1] + ix[2]) as f64);
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: 2,
            diagonal_batch: true,
            diagonal_spatial,
            compute_ntk: false,
            mask_constant: None,
        };
        Kernel::from_inputs(&x, None, &spec).unwrap()
    }

    #[test]
    fn test_empty_serial_is_identity() {
        let k = kernel(false);
        let out = Serial::new()
            .kernel(Nested::Leaf(k.clone()), &LayerArgs::default())
            .unwrap();
        assert_eq!(out.into_leaf().unwrap(), k);
        assert_eq!(Serial::new().meta().diagonal, DiagonalReqs::IDENTITY);
    }

    #[test]
    fn test_serial_composes_in_order() {
        let net = Serial::new().then(scale(2.0)).then(scale(3.0));
        assert_eq!(net.name(), "Serial[Scale(2), Scale(3)]");
        let k = kernel(false);
        let out = net
            .kernel(Nested::Leaf(k.clone()), &LayerArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert_eq!(out.nngp, k.nngp * 6.0);
    }

    #[test]
    fn test_prefix_blocks_diagonal_kernel() {
        let biased = DiagonalReqs::spatial(Diagonal::new(Tristate::Yes, Tristate::No));
        let pool = DiagonalReqs::spatial(Diagonal::new(Tristate::Maybe, Tristate::No));
        let net = Serial::new()
            .then(Scale {
                factor: 1.0,
                diagonal: biased,
            })
            .then(Scale {
                factor: 1.0,
                diagonal: pool,
            });
        let err = net
            .kernel(Nested::Leaf(kernel(true)), &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::DiagonalMismatch { .. }));
        assert_eq!(net.meta().diagonal.spatial.input, Tristate::No);
    }

    #[test]
    fn test_meta_folds_exactness() {
        #[derive(Debug)]
        struct Rough;
        impl Layer for Rough {
            fn meta(&self) -> LayerMeta {
                LayerMeta::new("Rough").approximate()
            }
            fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
                Ok((input.clone(), Params::None))
            }
            fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
                Ok(inputs)
            }
            fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
                Ok(inputs)
            }
        }
        let net = Serial::new().then(scale(1.0)).then(Rough);
        assert_eq!(net.meta().exactness, Exactness::Approximate);
        assert_eq!(Serial::new().then(scale(1.0)).meta().exactness, Exactness::Exact);
    }

    #[test]
    fn test_apply_threads_params() {
        let net = Serial::new().then(scale(4.0)).then(scale(9.0));
        let (shape, params) = net
            .init(&mut StdRng::seed_from_u64(0), &Nested::Leaf(Shape::new(vec![1, 2])))
            .unwrap();
        assert_eq!(shape.into_leaf().unwrap().dims, vec![1, 2]);
        let x = ArrayD::from_elem(IxDyn(&[1, 2]), 1.0);
        let y = net
            .apply(&params, Nested::Leaf(Masked::new(x)), &ApplyArgs::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert!(y.value.iter().all(|&v| (v - 6.0).abs() < 1e-12));
    }
}
