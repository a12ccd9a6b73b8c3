//! # widenet-core - Infinite-Width Kernel Algebra
//!
//! This crate provides the kernel-propagation core:
//!
//! - **Kernels**: NNGP / NTK statistics of one or two input batches, with
//!   optional diagonal storage along batch and spatial dimensions
//! - **Diagonal lattice**: what each layer needs from its input and
//!   guarantees about its output, composed like the layers themselves
//! - **Layers**: the `init` / `apply` / `kernel` contract every layer honours
//! - **Combinators**: serial and parallel composition, fan-out and fan-in
//! - **Masking**: sentinel-marked inputs and position masks
//! - **Kernel calls**: [`kernel_fn`], the caller-facing entry point
//!
//! ## Design Philosophy
//!
//! Networks are values. A network is a tree of layers, and its kernel is
//! obtained by threading one kernel value through that tree; nothing is
//! sampled and no finite network is built.
//!
//! ```text
//!   Serial[Dense, FanOut(2), Parallel[Dense, Serial[Erf, Dense]], FanInSum]
//!
//!   K(x1, x2) ──▶ Dense ──▶ (K, K) ──▶ (K', K'') ──▶ K' + K''
//! ```

pub mod compute;
pub mod diagonal;
pub mod error;
pub mod fan;
pub mod kernel;
pub mod layer;
pub mod layout;
pub mod mask;
pub mod nested;
pub mod options;
pub mod parallel;
pub mod serial;
pub mod shape;

// Re-export key types at crate root for convenience
pub use compute::{input_kernels, kernel_fn, kernels};
pub use diagonal::{DiagonalReqs, Diagonal, DimClass, Tristate};
pub use error::{ErrorKind, KernelError, Result};
pub use fan::{FanInConcat, FanInProd, FanInSum, FanOut};
pub use kernel::{Field, Fields, InputSpec, Kernel, Layout};
pub use layer::{ApplyArgs, AxisSpec, Exactness, Layer, LayerArgs, LayerExt, LayerMeta, Params};
pub use layout::{Block, Example, Operand, PositionMap, PositionMaps};
pub use mask::Masked;
pub use nested::Nested;
pub use options::{FieldValue, Get, GetTag, KernelOptions, Output, Tolerance};
pub use parallel::Parallel;
pub use serial::Serial;
pub use shape::Shape;
