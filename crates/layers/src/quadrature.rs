//! Gauss-Hermite quadrature for Gaussian expectations of arbitrary functions.
//!
//! Nodes and weights integrate against `exp(-x²)`:
//!
//! ```text
//!   ∫ f(x) exp(-x²) dx ≈ Σ_i w_i f(x_i)
//! ```
//!
//! so `E[f(u)]` for `u ~ N(0, v)` is `(1/sqrt(π)) Σ_i w_i f(sqrt(2v) x_i)`.

use std::f64::consts::PI;

use widenet_core::{KernelError, Result};

const PIM4: f64 = 0.751_125_544_464_942_5;
const EPS: f64 = 3.0e-14;
const MAX_ITERATIONS: usize = 10;

/// Nodes and weights of an `n`-point rule, nodes in descending order.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussHermite {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussHermite {
    /// Roots of the degree-`n` Hermite polynomial by Newton iteration on the
    /// normalized recurrence.
    pub fn new(n: usize) -> Result<Self> {
        let invalid = |reason: String| KernelError::InvalidConfig {
            layer: "GaussHermite".to_string(),
            reason,
        };
        if n == 0 {
            return Err(invalid("quadrature needs at least one node".to_string()));
        }
        let mut nodes = vec![0.0; n];
        let mut weights = vec![0.0; n];
        let nf = n as f64;
        let mut z = 0.0;

        for i in 0..(n + 1) / 2 {
            z = match i {
                0 => (2.0 * nf + 1.0).sqrt() - 1.85575 * (2.0 * nf + 1.0).powf(-0.16667),
                1 => z - 1.14 * nf.powf(0.426) / z,
                2 => 1.86 * z - 0.86 * nodes[0],
                3 => 1.91 * z - 0.91 * nodes[1],
                _ => 2.0 * z - nodes[i - 2],
            };

            let mut converged = false;
            let mut derivative = 0.0;
            for _ in 0..MAX_ITERATIONS {
                let (p1, p2) = hermite(n, z);
                derivative = (2.0 * nf).sqrt() * p2;
                let previous = z;
                z = previous - p1 / derivative;
                if (z - previous).abs() <= EPS {
                    converged = true;
                    break;
                }
            }
            if !converged {
                return Err(invalid(format!("node {i} of a {n}-point rule did not converge")));
            }

            nodes[i] = z;
            nodes[n - 1 - i] = -z;
            weights[i] = 2.0 / (derivative * derivative);
            weights[n - 1 - i] = weights[i];
        }
        Ok(Self { nodes, weights })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `E[f(u)]` for `u ~ N(0, var)`.
    pub fn expect(&self, var: f64, f: impl Fn(f64) -> f64) -> f64 {
        let scale = (2.0 * var.max(0.0)).sqrt();
        self.nodes
            .iter()
            .zip(&self.weights)
            .map(|(&x, &w)| w * f(scale * x))
            .sum::<f64>()
            / PI.sqrt()
    }

    /// `E[f(u) g(v)]` for `(u, v)` jointly Gaussian with variances
    /// `(var1, var2)` and covariance `cov`.
    pub fn expect_pair(
        &self,
        var1: f64,
        var2: f64,
        cov: f64,
        f: impl Fn(f64) -> f64,
        g: impl Fn(f64) -> f64,
    ) -> f64 {
        let (var1, var2) = (var1.max(0.0), var2.max(0.0));
        let denom = (var1 * var2).sqrt();
        let rho = if denom > 0.0 {
            (cov / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let rest = (1.0 - rho * rho).max(0.0).sqrt();
        let (s1, s2) = ((2.0 * var1).sqrt(), (2.0 * var2).sqrt());

        let mut total = 0.0;
        for (&xi, &wi) in self.nodes.iter().zip(&self.weights) {
            let fu = f(s1 * xi);
            if fu == 0.0 {
                continue;
            }
            let inner: f64 = self
                .nodes
                .iter()
                .zip(&self.weights)
                .map(|(&xj, &wj)| wj * g(s2 * (rho * xi + rest * xj)))
                .sum();
            total += wi * fu * inner;
        }
        total / PI
    }
}

/// Normalized Hermite values `(p_n(z), p_{n-1}(z))`.
fn hermite(n: usize, z: f64) -> (f64, f64) {
    let mut p1 = PIM4;
    let mut p2 = 0.0;
    for j in 1..=n {
        let p3 = p2;
        p2 = p1;
        let jf = j as f64;
        p1 = z * (2.0 / jf).sqrt() * p2 - ((jf - 1.0) / jf).sqrt() * p3;
    }
    (p1, p2)
}
