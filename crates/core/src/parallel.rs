//! # Parallel Composition
//!
//! `Parallel` applies one layer per branch of a tuple input. It is the
//! middle piece of every branching network:
//!
//! ```text
//!               ┌────────────┐
//!          ┌────│   Dense    │────┐
//!   x ─ FanOut  └────────────┘  FanInSum ─ y
//!          │    ┌────────────┐    │
//!          └────│ Erf, Dense │────┘
//!               └────────────┘
//!
//!   Serial::new()
//!       .then(FanOut::new(2))
//!       .then(Parallel::new().with(dense).with(erf_dense))
//!       .then(FanInSum)
//! ```

use rand::rngs::StdRng;

use crate::diagonal::DiagonalReqs;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::layer::{ApplyArgs, AxisSpec, Exactness, Layer, LayerArgs, LayerMeta, Params};
use crate::mask::Masked;
use crate::nested::Nested;
use crate::serial::settle;
use crate::shape::Shape;

/// Branch-wise application of layers to a tuple input.
#[derive(Debug, Default)]
pub struct Parallel {
    layers: Vec<Box<dyn Layer>>,
}

impl Parallel {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Add a branch.
    pub fn with(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn branches<T>(&self, inputs: Nested<T>) -> Result<Vec<Nested<T>>> {
        let items = inputs.into_tuple()?;
        if items.len() != self.layers.len() {
            return Err(KernelError::Structure {
                reason: format!(
                    "{} expects {} branches, got {}",
                    self.name(),
                    self.layers.len(),
                    items.len()
                ),
            });
        }
        Ok(items)
    }
}

/// Keep a role only when every branch that constrains it agrees.
fn agreed(roles: impl Iterator<Item = Option<isize>>) -> Option<isize> {
    let mut found: Option<isize> = None;
    for role in roles.flatten() {
        match found {
            None => found = Some(role),
            Some(existing) if existing != role => return None,
            Some(_) => {}
        }
    }
    found
}

impl Layer for Parallel {
    fn meta(&self) -> LayerMeta {
        let metas: Vec<LayerMeta> = self.layers.iter().map(|l| l.meta()).collect();
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();

        let diagonal = match metas.split_first() {
            None => DiagonalReqs::IDENTITY,
            Some((first, rest)) => rest.iter().fold(first.diagonal, |acc, m| acc & m.diagonal),
        };
        let axes = AxisSpec {
            batch: agreed(metas.iter().map(|m| m.axes.batch)),
            channel: agreed(metas.iter().map(|m| m.axes.channel)),
        };

        LayerMeta {
            name: format!("Parallel[{}]", names.join(", ")),
            diagonal,
            axes,
            preserves_layout: metas.iter().all(|m| m.preserves_layout),
            exactness: metas
                .iter()
                .fold(Exactness::Exact, |acc, m| acc.and(m.exactness)),
        }
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let items = self.branches(input.clone())?;
        let mut shapes = Vec::with_capacity(items.len());
        let mut params = Vec::with_capacity(items.len());
        for (layer, shape) in self.layers.iter().zip(&items) {
            let (out, p) = layer.init(rng, shape)?;
            shapes.push(out);
            params.push(p);
        }
        Ok((Nested::Tuple(shapes), Params::Nested(params)))
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>> {
        let items = self.branches(inputs)?;
        let outputs = self
            .layers
            .iter()
            .zip(items)
            .enumerate()
            .map(|(i, (layer, x))| layer.apply(params.child(i)?, x, args))
            .collect::<Result<Vec<_>>>()?;
        Ok(Nested::Tuple(outputs))
    }

    fn kernel(&self, inputs: Nested<Kernel>, args: &LayerArgs) -> Result<Nested<Kernel>> {
        let items = self.branches(inputs)?;
        let mut outputs = Vec::with_capacity(items.len());
        for (layer, branch) in self.layers.iter().zip(items) {
            let meta = layer.meta();
            for kernel in branch.leaves() {
                meta.check_axes(kernel)?;
            }
            outputs.push(settle(layer.kernel(branch, args)?)?);
        }
        Ok(Nested::Tuple(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagonal::{Diagonal, Tristate};
    use crate::kernel::InputSpec;
    use ndarray::{ArrayD, IxDyn};

    #[derive(Debug)]
    struct Tag {
        factor: f64,
        diagonal: DiagonalReqs,
        axes: AxisSpec,
    }

    impl Tag {
        fn new(factor: f64) -> Self {
            Self {
                factor,
                diagonal: DiagonalReqs::IDENTITY,
                axes: AxisSpec::ANY,
            }
        }
    }

    impl Layer for Tag {
        fn meta(&self) -> LayerMeta {
            LayerMeta::new("Tag")
                .with_diagonal(self.diagonal)
                .with_axes(self.axes)
        }
        fn init(&self, _: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
            Ok((input.clone(), Params::None))
        }
        fn apply(&self, _: &Params, inputs: Nested<Masked>, _: &ApplyArgs) -> Result<Nested<Masked>> {
            Ok(inputs)
        }
        fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
            inputs.try_map(&mut |k: Kernel| Ok(k.map_values(|_, v| v * self.factor)))
        }
    }

    fn kernel() -> Kernel {
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |ix| (ix[0] + ix[1]) as f64);
        let spec = InputSpec {
            batch_axis: 0,
            channel_axis: 1,
            diagonal_batch: true,
            diagonal_spatial: false,
            compute_ntk: false,
            mask_constant: None,
        };
        Kernel::from_inputs(&x, None, &spec).unwrap()
    }

    #[test]
    fn test_branch_count_must_match() {
        let par = Parallel::new().with(Tag::new(1.0)).with(Tag::new(2.0));
        let single = Nested::Tuple(vec![Nested::Leaf(kernel())]);
        let err = par.kernel(single, &LayerArgs::default()).unwrap_err();
        assert!(matches!(err, KernelError::Structure { .. }));
    }

    #[test]
    fn test_branches_are_independent() {
        let par = Parallel::new().with(Tag::new(2.0)).with(Tag::new(5.0));
        let k = kernel();
        let input = Nested::Tuple(vec![Nested::Leaf(k.clone()), Nested::Leaf(k.clone())]);
        let out = par.kernel(input, &LayerArgs::default()).unwrap().into_leaves().unwrap();
        assert_eq!(out[0].nngp, &k.nngp * 2.0);
        assert_eq!(out[1].nngp, &k.nngp * 5.0);
    }

    #[test]
    fn test_meta_meets_branch_requirements() {
        let mut full = Tag::new(1.0);
        full.diagonal = DiagonalReqs::spatial(Diagonal::FULL);
        let par = Parallel::new().with(Tag::new(1.0)).with(full);
        let meta = par.meta();
        assert_eq!(meta.diagonal.spatial.input, Tristate::No);
        assert_eq!(Parallel::new().meta().diagonal, DiagonalReqs::IDENTITY);
    }

    #[test]
    fn test_conflicting_axes_are_dropped() {
        let mut a = Tag::new(1.0);
        a.axes = AxisSpec::new(0, -1);
        let mut b = Tag::new(1.0);
        b.axes = AxisSpec::new(0, 1);
        let meta = Parallel::new().with(a).with(b).meta();
        assert_eq!(meta.axes.batch, Some(0));
        assert_eq!(meta.axes.channel, None);
    }
}
