//! # Kernel Calls
//!
//! [`kernel_fn`] is the caller-facing entry point: it resolves how the raw
//! input kernel is stored, builds it from the inputs, runs the network's
//! kernel transform and extracts the requested outputs.
//!
//! ```text
//!   x1, x2 ──▶ resolve diagonal storage ──▶ literal correlations
//!          ──▶ layer.kernel ──▶ remask ──▶ get
//! ```

use ndarray::ArrayD;
use tracing::debug;

use crate::error::Result;
use crate::kernel::{InputSpec, Kernel};
use crate::layer::{Layer, LayerArgs};
use crate::nested::Nested;
use crate::options::{Get, KernelOptions, Output};
use crate::serial::settle;

/// Infinite-width kernel of `layer` between `x1` and `x2` (or `x1` and
/// itself).
///
/// Tree inputs give tree outputs. Raw inputs are literal correlations
/// `(1/C) Σ_c x1[.., c] x2[.., c]`; the tangent kernel starts at zero and is
/// only propagated when `get` asks for it.
pub fn kernel_fn<L: Layer + ?Sized>(
    layer: &L,
    x1: &Nested<ArrayD<f64>>,
    x2: Option<&Nested<ArrayD<f64>>>,
    get: &Get,
    options: &KernelOptions,
    args: &LayerArgs,
) -> Result<Output> {
    Output::from_kernels(kernels(layer, x1, x2, get, options, args)?, get)
}

/// The settled output kernels of `layer`, before any `get` extraction.
pub fn kernels<L: Layer + ?Sized>(
    layer: &L,
    x1: &Nested<ArrayD<f64>>,
    x2: Option<&Nested<ArrayD<f64>>>,
    get: &Get,
    options: &KernelOptions,
    args: &LayerArgs,
) -> Result<Nested<Kernel>> {
    let inputs = input_kernels(layer, x1, x2, get, options)?;
    settle(layer.kernel(inputs, args)?)
}

/// The raw input kernels a call to [`kernel_fn`] starts from.
pub fn input_kernels<L: Layer + ?Sized>(
    layer: &L,
    x1: &Nested<ArrayD<f64>>,
    x2: Option<&Nested<ArrayD<f64>>>,
    get: &Get,
    options: &KernelOptions,
) -> Result<Nested<Kernel>> {
    let meta = layer.meta();
    let (diagonal_batch, diagonal_spatial) =
        meta.diagonal
            .resolve(options.diagonal_batch, options.diagonal_spatial, &meta.name)?;
    let compute_ntk = get.needs_ntk();
    debug!(
        layer = %meta.name,
        diagonal_batch,
        diagonal_spatial,
        compute_ntk,
        "resolved input kernel storage"
    );

    let pairs: Nested<(&ArrayD<f64>, Option<&ArrayD<f64>>)> = match x2 {
        None => x1.as_ref().try_map(&mut |x| Ok((x, None)))?,
        Some(x2) => x1.as_ref().zip(x2.as_ref().try_map(&mut |x| Ok(Some(x)))?)?,
    };

    pairs.try_map(&mut |(x1, x2)| {
        let (batch_axis, channel_axis) = meta.axes.resolve(x1.ndim())?;
        let spec = InputSpec {
            batch_axis,
            channel_axis,
            diagonal_batch,
            diagonal_spatial,
            compute_ntk,
            mask_constant: options.mask_constant,
        };
        Kernel::from_inputs(x1, x2, &spec)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagonal::{Diagonal, DiagonalReqs, Tristate};
    use crate::error::KernelError;
    use crate::fan::{FanInProd, FanInSum, FanOut};
    use crate::layer::{ApplyArgs, LayerMeta, Params};
    use crate::mask::Masked;
    use crate::options::GetTag;
    use crate::serial::Serial;
    use crate::shape::Shape;
    use ndarray::IxDyn;
    use rand::rngs::StdRng;

    #[derive(Debug)]
    struct Pass(DiagonalReqs);

    impl Layer for Pass {
        fn meta(&self) -> LayerMeta {
            LayerMeta::new("Pass").with_diagonal(self.0)
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

    fn x(batch: usize) -> Nested<ArrayD<f64>> {
        Nested::Leaf(ArrayD::from_shape_fn(IxDyn(&[batch, 4, 3]), |ix| {
            (ix[0] as f64 - ix[1] as f64 * 0.5 + ix[2] as f64).sin()
        }))
    }

    #[test]
    fn test_storage_follows_network() {
        let get = Get::Kernel;
        let opts = KernelOptions::default();
        let k = input_kernels(&Pass(DiagonalReqs::IDENTITY), &x(2), None, &get, &opts).unwrap();
        let k = k.into_leaf().unwrap();
        assert!(k.diagonal_batch);
        assert!(!k.diagonal_spatial);

        let flat = DiagonalReqs::spatial(Diagonal::new(Tristate::Yes, Tristate::Yes));
        let k = input_kernels(&Pass(flat), &x(2), None, &get, &opts).unwrap();
        assert!(k.into_leaf().unwrap().diagonal_spatial);
    }

    #[test]
    fn test_forbidden_diagonal_request() {
        let full = DiagonalReqs::spatial(Diagonal::FULL);
        let opts = KernelOptions::new().with_diagonal_spatial(true);
        let err = kernel_fn(&Pass(full), &x(2), None, &Get::Kernel, &opts, &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::DiagonalMismatch { .. }));
    }

    #[test]
    fn test_get_selects_fields() {
        let layer = Pass(DiagonalReqs::IDENTITY);
        let opts = KernelOptions::default();
        let args = LayerArgs::default();

        let nngp = kernel_fn(&layer, &x(2), Some(&x(3)), &GetTag::Nngp.into(), &opts, &args)
            .unwrap()
            .into_array()
            .unwrap();
        assert_eq!(nngp.shape(), &[2, 3, 4, 4]);

        let many = kernel_fn(&layer, &x(2), None, &Get::parse("ntk,cov2,shape1").unwrap(), &opts, &args)
            .unwrap()
            .into_arrays()
            .unwrap();
        assert!(many[0].as_array().is_some());
        assert!(many[1].is_absent());
        assert_eq!(many[2], crate::options::FieldValue::Shape(Shape::new(vec![2, 4, 3])));
    }

    #[test]
    fn test_ntk_only_when_asked() {
        let layer = Pass(DiagonalReqs::IDENTITY);
        let out = kernel_fn(
            &layer,
            &x(2),
            None,
            &Get::One(GetTag::Ntk),
            &KernelOptions::default(),
            &LayerArgs::default(),
        )
        .unwrap();
        assert!(out.into_array().is_ok());

        let k = input_kernels(&layer, &x(2), None, &GetTag::Nngp.into(), &KernelOptions::default())
            .unwrap()
            .into_leaf()
            .unwrap();
        assert!(k.ntk.is_none());
    }

    #[test]
    fn test_tree_inputs_give_tree_outputs() {
        let net = Serial::new().then(Pass(DiagonalReqs::IDENTITY));
        let tree = Nested::Tuple(vec![x(2), x(2)]);
        let out = kernel_fn(&net, &tree, None, &Get::Kernel, &KernelOptions::default(), &LayerArgs::default())
            .unwrap();
        match out {
            Output::Kernel(Nested::Tuple(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_fan_in_of_raw_inputs_needs_gaussian() {
        let net = Serial::new().then(FanOut::new(2)).then(FanInSum);
        let err = kernel_fn(&net, &x(2), None, &Get::Kernel, &KernelOptions::default(), &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::NonGaussianFanIn { index: 0, .. }));
    }

    #[test]
    fn test_fan_in_prod_of_raw_inputs() {
        let opts = KernelOptions::default();
        let args = LayerArgs::default();
        let get: Get = GetTag::Nngp.into();
        let net = Serial::new().then(FanOut::new(2)).then(FanInProd);
        let prod = kernel_fn(&net, &x(2), None, &get, &opts, &args)
            .unwrap()
            .into_array()
            .unwrap();
        let raw = kernel_fn(&Pass(DiagonalReqs::IDENTITY), &x(2), None, &get, &opts, &args)
            .unwrap()
            .into_array()
            .unwrap();
        assert_eq!(prod, raw.mapv(|v| v * v));
    }
}
