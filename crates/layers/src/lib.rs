//! # widenet-layers - Layers with Closed-Form Kernels
//!
//! Every layer here implements [`widenet_core::Layer`]: a finite-width
//! forward pass (`init` / `apply`) and the exact (or quadrature) transform of
//! the NNGP / NTK statistics in the infinite-width limit (`kernel`).
//!
//! - **Affine**: [`Dense`], [`Conv`] (regular, transposed, unshared)
//! - **Nonlinearities**: [`Elementwise`] over an [`Activation`] with a
//!   closed-form or numerical kernel
//! - **Normalization and noise**: [`LayerNorm`], [`Dropout`]
//! - **Positions**: [`Pool`], [`GlobalPool`], [`Aggregate`],
//!   [`GlobalSelfAttention`], [`Flatten`]
//! - **Linear maps**: [`Contract`] over a scalar, the channel, batch or a
//!   spatial axis
//!
//! ## Example: a two-branch network
//!
//! ```rust
//! use ndarray::{ArrayD, IxDyn};
//! use widenet_core::{kernel_fn, FanInSum, FanOut, Get, GetTag, KernelOptions, LayerArgs, Nested, Parallel, Serial};
//! use widenet_layers::{elementwise, Dense};
//!
//! let net = Serial::new()
//!     .then(Dense::new(16).with_std(1.5, 0.1))
//!     .then(FanOut::new(2))
//!     .then(Parallel::new().with(Dense::new(16)).with(Serial::new().then(elementwise::erf(1.0, 1.0, 0.0)).then(Dense::new(16))))
//!     .then(FanInSum);
//!
//! let x = ArrayD::from_shape_fn(IxDyn(&[3, 4]), |ix| (ix[0] as f64 - ix[1] as f64) / 4.0);
//! let nngp = kernel_fn(
//!     &net,
//!     &Nested::Leaf(x),
//!     None,
//!     &Get::One(GetTag::Nngp),
//!     &KernelOptions::new(),
//!     &LayerArgs::default(),
//! )
//! .unwrap()
//! .into_array()
//! .unwrap();
//! assert_eq!(nngp.shape(), &[3, 3]);
//! ```

pub mod activation;
pub mod affine;
pub mod aggregate;
pub mod attention;
pub mod contract;
pub mod conv;
pub mod dense;
pub mod dropout;
pub mod elementwise;
pub mod normalization;
pub mod pooling;
pub mod positions;
pub mod quadrature;
pub mod reshape;

pub use activation::{ABRelu, Activation, Erf, Gelu, Identity, Numerical, Rbf, Relu, Sin};
pub use affine::{Affine, Parameterization};
pub use aggregate::Aggregate;
pub use attention::{AttentionMode, GlobalSelfAttention};
pub use contract::{Contract, Contraction};
pub use conv::{Conv, ConvKind, DimensionNumbers, Padding};
pub use dense::Dense;
pub use dropout::{Dropout, DropoutMode};
pub use elementwise::Elementwise;
pub use normalization::LayerNorm;
pub use pooling::{GlobalPool, Pool, PoolKind};
pub use quadrature::GaussHermite;
pub use reshape::Flatten;
