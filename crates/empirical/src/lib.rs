//! # widenet-empirical - Finite-Network Estimates and Tiling
//!
//! Two wrappers around a [`widenet_core::Layer`] network:
//!
//! - [`MonteCarlo`]: the empirical NNGP, averaged over random parameter draws
//!   of the finite network (`init` + `apply`)
//! - [`Batched`]: the analytic kernel computed tile by tile over batch
//!   slices, in parallel
//!
//! Both are deterministic: sample seeds derive from the caller's seed and
//! partial results are combined in a fixed order, whatever the thread count.

pub mod batch;
pub mod monte_carlo;

pub use batch::Batched;
pub use monte_carlo::MonteCarlo;
