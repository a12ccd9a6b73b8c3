//! # Layer Contract
//!
//! Every layer exposes the same three operations:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `init`    | sample finite-width parameters, report the output shape |
//! | `apply`   | finite-width forward pass |
//! | `kernel`  | infinite-width NNGP / NTK transform |
//!
//! plus static [`LayerMeta`]: diagonal requirements, expected axis roles,
//! whether the tensor layout changes, and whether the kernel transform is
//! exact. Composite layers (serial, parallel, fan-in / fan-out) implement the
//! same trait, so networks are just nested layer values.

use std::fmt;
use std::sync::Arc;

use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::diagonal::{DimClass, DiagonalReqs};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::layout::Operand;
use crate::mask::Masked;
use crate::nested::Nested;
use crate::shape::{normalize_axis, Shape};

/// Whether a kernel transform is closed-form exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exactness {
    #[default]
    Exact,
    /// The transform is a documented approximation of the infinite-width
    /// limit; results must not be compared bit-for-bit.
    Approximate,
}

impl Exactness {
    /// Approximate if either side is.
    pub fn and(self, other: Exactness) -> Exactness {
        if self == Exactness::Approximate || other == Exactness::Approximate {
            Exactness::Approximate
        } else {
            Exactness::Exact
        }
    }
}

/// Axis roles a layer expects on its input; `None` means unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisSpec {
    pub batch: Option<isize>,
    pub channel: Option<isize>,
}

impl AxisSpec {
    pub const ANY: AxisSpec = AxisSpec {
        batch: None,
        channel: None,
    };

    pub fn new(batch: isize, channel: isize) -> Self {
        Self {
            batch: Some(batch),
            channel: Some(channel),
        }
    }

    /// Fill unconstrained roles from `other`.
    pub fn or(self, other: AxisSpec) -> AxisSpec {
        AxisSpec {
            batch: self.batch.or(other.batch),
            channel: self.channel.or(other.channel),
        }
    }

    /// Batch and channel axes for a tensor of `rank`, defaulting to the
    /// leading and trailing axes.
    pub fn resolve(&self, rank: usize) -> Result<(usize, usize)> {
        let batch = normalize_axis(self.batch.unwrap_or(0), rank)?;
        let channel = normalize_axis(self.channel.unwrap_or(-1), rank)?;
        Ok((batch, channel))
    }
}

/// Static description of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerMeta {
    pub name: String,
    pub diagonal: DiagonalReqs,
    pub axes: AxisSpec,
    pub preserves_layout: bool,
    pub exactness: Exactness,
}

impl LayerMeta {
    /// Defaults: `(Yes, No)` in both classes, no axis constraints, layout
    /// preserved, exact.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            diagonal: DiagonalReqs::default(),
            axes: AxisSpec::ANY,
            preserves_layout: true,
            exactness: Exactness::Exact,
        }
    }

    pub fn with_diagonal(mut self, diagonal: DiagonalReqs) -> Self {
        self.diagonal = diagonal;
        self
    }

    pub fn with_axes(mut self, axes: AxisSpec) -> Self {
        self.axes = axes;
        self
    }

    pub fn changes_layout(mut self) -> Self {
        self.preserves_layout = false;
        self
    }

    pub fn approximate(mut self) -> Self {
        self.exactness = Exactness::Approximate;
        self
    }

    /// Fail unless the kernel carries the axis roles this layer expects.
    pub fn check_axes(&self, kernel: &Kernel) -> Result<()> {
        let rank = kernel.shape1.rank();
        let roles = [
            ("batch", self.axes.batch, kernel.batch_axis),
            ("channel", self.axes.channel, kernel.channel_axis),
        ];
        for (role, declared, actual) in roles {
            let Some(declared) = declared else { continue };
            let expected = normalize_axis(declared, rank)?;
            if expected != actual {
                return Err(KernelError::AxisMismatch {
                    layer: self.name.clone(),
                    role: role.to_string(),
                    expected,
                    got: actual,
                });
            }
        }
        Ok(())
    }

    /// Fail if a compressed kernel reaches a layer that needs the
    /// off-diagonal entries, given everything composed before it.
    pub fn check_diagonal(&self, kernel: &Kernel, prefix: &DiagonalReqs) -> Result<()> {
        let classes = [
            (DimClass::Batch, kernel.diagonal_batch),
            (DimClass::Spatial, kernel.diagonal_spatial),
        ];
        for (class, compressed) in classes {
            if compressed && !self.diagonal.get(class).accepts_diagonal(&prefix.get(class)) {
                return Err(KernelError::DiagonalMismatch {
                    layer: self.name.clone(),
                    reason: format!("needs full {class} covariances but got a diagonal kernel"),
                });
            }
        }
        Ok(())
    }
}

/// Finite-width parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    #[default]
    None,
    Tensors(Vec<ArrayD<f64>>),
    Nested(Vec<Params>),
    /// Seed of a layer that draws fresh randomness in `apply`.
    Seed(u64),
}

impl Params {
    pub fn tensor(&self, index: usize) -> Result<&ArrayD<f64>> {
        let found = match self {
            Params::Tensors(tensors) => tensors.get(index),
            _ => None,
        };
        found.ok_or_else(|| KernelError::Structure {
            reason: format!("missing parameter tensor {index}"),
        })
    }

    /// Same structure with every tensor replaced by `f(tensor)`; seeds are kept.
    pub fn map_tensors(&self, f: &mut impl FnMut(&ArrayD<f64>) -> ArrayD<f64>) -> Params {
        match self {
            Params::None => Params::None,
            Params::Seed(seed) => Params::Seed(*seed),
            Params::Tensors(tensors) => Params::Tensors(tensors.iter().map(|t| f(t)).collect()),
            Params::Nested(children) => Params::Nested(children.iter().map(|c| c.map_tensors(f)).collect()),
        }
    }

    /// `self + scale * direction`, for two parameter trees of the same structure.
    pub fn axpy(&self, scale: f64, direction: &Params) -> Result<Params> {
        match (self, direction) {
            (Params::None, Params::None) => Ok(Params::None),
            (Params::Seed(seed), Params::Seed(_)) => Ok(Params::Seed(*seed)),
            (Params::Tensors(a), Params::Tensors(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(a, b)| {
                    if a.shape() != b.shape() {
                        return Err(KernelError::shape_mismatch(a.shape(), b.shape()));
                    }
                    Ok(a + &(b * scale))
                })
                .collect::<Result<Vec<_>>>()
                .map(Params::Tensors),
            (Params::Nested(a), Params::Nested(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(a, b)| a.axpy(scale, b))
                .collect::<Result<Vec<_>>>()
                .map(Params::Nested),
            _ => Err(KernelError::Structure {
                reason: "parameter trees differ in structure".to_string(),
            }),
        }
    }

    pub fn child(&self, index: usize) -> Result<&Params> {
        let found = match self {
            Params::Nested(children) => children.get(index),
            _ => None,
        };
        found.ok_or_else(|| KernelError::Structure {
            reason: format!("missing parameters of sub-layer {index}"),
        })
    }
}

/// Per-call arguments for the kernel path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LayerArgs {
    /// Aggregation pattern for `x1`, `(N1, s.., s..)`.
    pub pattern1: Option<ArrayD<f64>>,
    /// Aggregation pattern for `x2`; defaults to `pattern1` when x1 is x2.
    pub pattern2: Option<ArrayD<f64>>,
}

impl LayerArgs {
    pub fn with_patterns(pattern1: ArrayD<f64>, pattern2: Option<ArrayD<f64>>) -> Self {
        Self {
            pattern1: Some(pattern1),
            pattern2,
        }
    }

    pub fn pattern(&self, operand: Operand) -> Option<&ArrayD<f64>> {
        match operand {
            Operand::First => self.pattern1.as_ref(),
            Operand::Second => self.pattern2.as_ref().or(self.pattern1.as_ref()),
        }
    }

    /// Arguments for running `apply` on one operand.
    pub fn for_apply(&self, operand: Operand) -> ApplyArgs {
        ApplyArgs {
            pattern: self.pattern(operand).cloned(),
            operand,
        }
    }
}

/// Per-call arguments for the finite-width path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyArgs {
    /// Aggregation pattern, `(N, s.., s..)`.
    pub pattern: Option<ArrayD<f64>>,
    /// Which input batch is being run.
    pub operand: Operand,
}

/// The layer contract.
pub trait Layer: Send + Sync + fmt::Debug {
    /// Static metadata.
    fn meta(&self) -> LayerMeta;

    /// Sample parameters for an input of the given shape.
    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)>;

    /// Finite-width forward pass.
    fn apply(&self, params: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>>;

    /// Infinite-width kernel transform.
    fn kernel(&self, inputs: Nested<Kernel>, args: &LayerArgs) -> Result<Nested<Kernel>>;

    fn name(&self) -> String {
        self.meta().name
    }
}

/// Conveniences available on every layer.
pub trait LayerExt: Layer {
    /// `init` with a fresh RNG seeded from `seed`.
    fn init_with_seed(&self, seed: u64, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.init(&mut rng, input)
    }
}

impl<L: Layer + ?Sized> LayerExt for L {}

impl<L: Layer + ?Sized> Layer for Box<L> {
    fn meta(&self) -> LayerMeta {
        (**self).meta()
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        (**self).init(rng, input)
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>> {
        (**self).apply(params, inputs, args)
    }

    fn kernel(&self, inputs: Nested<Kernel>, args: &LayerArgs) -> Result<Nested<Kernel>> {
        (**self).kernel(inputs, args)
    }
}

impl<L: Layer + ?Sized> Layer for Arc<L> {
    fn meta(&self) -> LayerMeta {
        (**self).meta()
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        (**self).init(rng, input)
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>> {
        (**self).apply(params, inputs, args)
    }

    fn kernel(&self, inputs: Nested<Kernel>, args: &LayerArgs) -> Result<Nested<Kernel>> {
        (**self).kernel(inputs, args)
    }
}
