//! # Error Types
//!
//! Kernel propagation either succeeds completely or fails with one of the
//! errors below. There is no partial result: a failing step anywhere inside a
//! composite aborts the whole computation, and nothing is retried (every
//! transform is a pure function of its inputs).
//!
//! Errors fall into two families, see [`ErrorKind`]:
//!
//! - **Configuration**: the network or the call options are inconsistent
//!   (diagonal states that cannot be reconciled, axis roles that disagree,
//!   non-Gaussian branches reaching a merge that needs Gaussian inputs).
//! - **Shape**: tensors or trees do not line up.

use thiserror::Error;

use crate::shape::Shape;

/// Errors raised while building or propagating kernels.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    /// Tensor shapes don't match at a composition boundary.
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// A tree of inputs has the wrong arity or nesting.
    #[error("Malformed input tree: {reason}")]
    Structure { reason: String },

    /// ndarray refused a reshape or construction.
    #[error("Tensor layout error: {reason}")]
    Tensor { reason: String },

    /// A kernel value violates one of its structural invariants.
    #[error("Kernel invariant violated: {reason}")]
    Invariant { reason: String },

    /// A layer received a kernel in a diagonal state it cannot consume, or the
    /// caller asked for a compression the network cannot provide.
    #[error("Diagonal state mismatch in {layer}: {reason}")]
    DiagonalMismatch { layer: String, reason: String },

    /// Declared axis roles disagree with the roles carried by the kernel.
    #[error("Axis mismatch in {layer}: {role} axis expected at {expected}, kernel has it at {got}")]
    AxisMismatch {
        layer: String,
        role: String,
        expected: usize,
        got: usize,
    },

    /// A fan-in that needs jointly Gaussian branches got a non-Gaussian one.
    #[error("{layer}: branch {index} is not Gaussian")]
    NonGaussianFanIn { layer: String, index: usize },

    /// A nonlinearity received a kernel whose pre-activations are not Gaussian.
    #[error("{layer} requires Gaussian inputs")]
    GaussianRequired { layer: String },

    /// Contraction over the batch axis with a batch-diagonal kernel.
    #[error("{layer} contracts the batch axis and needs diagonal_batch = false")]
    BatchContraction { layer: String },

    /// Unknown or unavailable field requested through `get`.
    #[error("Unsupported get tag `{tag}`")]
    UnsupportedGet { tag: String },

    /// Convolution dimension numbers are malformed or inconsistent.
    #[error("Invalid dimension numbers {spec}: {reason}")]
    DimensionNumbers { spec: String, reason: String },

    /// A fan-in received the wrong number of branches.
    #[error("{layer} expects {expected} branches, got {got}")]
    BranchCount {
        layer: String,
        expected: String,
        got: usize,
    },

    /// Layer parameters are invalid.
    #[error("Invalid configuration for {layer}: {reason}")]
    InvalidConfig { layer: String, reason: String },

    /// A layer needs a per-call argument that was not supplied.
    #[error("{layer} needs argument `{name}`")]
    MissingArgument { layer: String, name: String },
}

/// Coarse classification of a [`KernelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inconsistent network description or call options.
    Configuration,
    /// Tensors or input trees that do not line up.
    Shape,
}

impl KernelError {
    /// Which family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::ShapeMismatch { .. }
            | KernelError::Structure { .. }
            | KernelError::Tensor { .. }
            | KernelError::Invariant { .. } => ErrorKind::Shape,
            _ => ErrorKind::Configuration,
        }
    }

    /// Shorthand for [`KernelError::ShapeMismatch`] from raw dimension lists.
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        KernelError::ShapeMismatch {
            expected: Shape::new(expected.to_vec()),
            got: Shape::new(got.to_vec()),
        }
    }
}

impl From<ndarray::ShapeError> for KernelError {
    fn from(err: ndarray::ShapeError) -> Self {
        KernelError::Tensor {
            reason: err.to_string(),
        }
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, KernelError>;
