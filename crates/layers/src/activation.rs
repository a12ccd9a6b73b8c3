//! Pointwise nonlinearities and their Gaussian expectations.
//!
//! An [`Activation`] maps the second moments `(v1, v2, c)` of a centred
//! Gaussian pair `(u, v)` to
//!
//! ```text
//!   T(v1, v2, c) = E[φ(u) φ(v)]
//!   Ṫ(v1, v2, c) = E[φ'(u) φ'(v)]
//! ```
//!
//! Closed forms are given for the piecewise-linear family, `erf`, `sin`,
//! GELU, random Fourier features and the identity. [`Numerical`] covers
//! everything else with Gauss-Hermite quadrature.

use std::f64::consts::{FRAC_PI_4, PI};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use widenet_core::{Exactness, Result};

use crate::quadrature::GaussHermite;

/// The contract every nonlinearity implements.
pub trait Activation: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    /// Finite-width value `φ(x)`.
    fn apply(&self, x: f64) -> f64;

    /// `E[φ(u) φ(v)]` for variances `(v1, v2)` and covariance `cov`.
    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64;

    /// `E[φ'(u) φ'(v)]`, the factor applied to the incoming tangent kernel.
    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64;

    /// `φ` is linear, so Gaussian inputs stay Gaussian.
    fn is_linear(&self) -> bool {
        false
    }

    /// `E[φ(u) φ(v)] = 0` whenever `cov = 0`.
    fn is_zero_mean(&self) -> bool {
        false
    }

    fn exactness(&self) -> Exactness {
        Exactness::Exact
    }
}

/// Angle between two Gaussians; uncorrelated when either variance vanishes.
fn angle(v1: f64, v2: f64, cov: f64) -> (f64, f64) {
    let norm = (v1.max(0.0) * v2.max(0.0)).sqrt();
    let rho = if norm > 0.0 {
        (cov / norm).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    (rho.acos(), norm)
}

/// `φ(x) = a min(x, 0) + b max(x, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ABRelu {
    pub a: f64,
    pub b: f64,
}

impl ABRelu {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// Leaky ReLU with negative slope `alpha`.
    pub fn leaky(alpha: f64) -> Self {
        Self::new(alpha, 1.0)
    }

    /// `|x|`.
    pub fn abs() -> Self {
        Self::new(-1.0, 1.0)
    }
}

impl Activation for ABRelu {
    fn name(&self) -> String {
        format!("ABRelu({}, {})", self.a, self.b)
    }

    fn apply(&self, x: f64) -> f64 {
        self.a * x.min(0.0) + self.b * x.max(0.0)
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (theta, norm) = angle(v1, v2, cov);
        let spread = (self.a - self.b).powi(2) / (2.0 * PI);
        self.a * self.b * cov + spread * (norm * theta.sin() + (PI - theta) * cov)
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (theta, _) = angle(v1, v2, cov);
        self.a * self.b + (self.a - self.b).powi(2) * (PI - theta) / (2.0 * PI)
    }

    fn is_linear(&self) -> bool {
        self.a == self.b
    }

    fn is_zero_mean(&self) -> bool {
        self.a == self.b
    }
}

/// `max(x, 0)`, through the arc-cosine kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Relu;

impl Activation for Relu {
    fn name(&self) -> String {
        "Relu".to_string()
    }

    fn apply(&self, x: f64) -> f64 {
        x.max(0.0)
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (theta, norm) = angle(v1, v2, cov);
        norm / (2.0 * PI) * (theta.sin() + (PI - theta) * theta.cos())
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (theta, _) = angle(v1, v2, cov);
        (PI - theta) / (2.0 * PI)
    }
}

/// `φ(x) = a erf(b x) + c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Erf {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for Erf {
    fn default() -> Self {
        Self { a: 1.0, b: 1.0, c: 0.0 }
    }
}

impl Erf {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }
}

impl Activation for Erf {
    fn name(&self) -> String {
        format!("Erf({}, {}, {})", self.a, self.b, self.c)
    }

    fn apply(&self, x: f64) -> f64 {
        self.a * erf(self.b * x) + self.c
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let b2 = 2.0 * self.b * self.b;
        let denom = ((1.0 + b2 * v1) * (1.0 + b2 * v2)).sqrt();
        let arg = (b2 * cov / denom).clamp(-1.0, 1.0);
        self.a * self.a * (2.0 / PI) * arg.asin() + self.c * self.c
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let b2 = self.b * self.b;
        let det = (1.0 + 2.0 * b2 * v1) * (1.0 + 2.0 * b2 * v2) - 4.0 * b2 * b2 * cov * cov;
        4.0 * self.a * self.a * b2 / (PI * det.max(f64::MIN_POSITIVE).sqrt())
    }

    fn is_zero_mean(&self) -> bool {
        self.c == 0.0
    }
}

/// Error function, Abramowitz and Stegun 7.1.26 evaluated with Horner's
/// method. Absolute error below 1.5e-7.
pub fn erf(x: f64) -> f64 {
    let a1 = 0.254_829_592;
    let a2 = -0.284_496_736;
    let a3 = 1.421_413_741;
    let a4 = -1.453_152_027;
    let a5 = 1.061_405_429;
    let p = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let poly = (((a5 * t + a4) * t + a3) * t + a2) * t + a1;
    sign * (1.0 - poly * t * (-x * x).exp())
}

/// `φ(x) = a sin(b x + c)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sin {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for Sin {
    fn default() -> Self {
        Self { a: 1.0, b: 1.0, c: 0.0 }
    }
}

impl Sin {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    /// `(e^{b²(c - s/2)}, e^{-b²(c + s/2)} cos 2c)` with `s = v1 + v2`.
    fn terms(&self, v1: f64, v2: f64, cov: f64) -> (f64, f64) {
        let b2 = self.b * self.b;
        let half = (v1 + v2) / 2.0;
        let near = (b2 * (cov - half)).exp();
        let far = (-b2 * (half + cov)).exp() * (2.0 * self.c).cos();
        (near, far)
    }
}

impl Activation for Sin {
    fn name(&self) -> String {
        format!("Sin({}, {}, {})", self.a, self.b, self.c)
    }

    fn apply(&self, x: f64) -> f64 {
        self.a * (self.b * x + self.c).sin()
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (near, far) = self.terms(v1, v2, cov);
        self.a * self.a / 2.0 * (near - far)
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (near, far) = self.terms(v1, v2, cov);
        (self.a * self.b).powi(2) / 2.0 * (near + far)
    }

    fn is_zero_mean(&self) -> bool {
        self.c == 0.0
    }
}

/// `φ(x) = x Φ(x)`, Φ the standard normal distribution function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Gelu;

impl Gelu {
    /// `(δ, atan2(c, δ), v1 v2, (1 + v1)(1 + v2))`, `δ² = (1 + v1)(1 + v2) - c²`.
    fn terms(v1: f64, v2: f64, cov: f64) -> (f64, f64, f64, f64) {
        let p = v1 * v2;
        let q = (1.0 + v1) * (1.0 + v2);
        let delta = (q - cov * cov).max(f64::MIN_POSITIVE).sqrt();
        (delta, cov.atan2(delta), p, q)
    }
}

impl Activation for Gelu {
    fn name(&self) -> String {
        "Gelu".to_string()
    }

    fn apply(&self, x: f64) -> f64 {
        0.5 * x * (1.0 + erf(x / 2f64.sqrt()))
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (delta, angle, p, q) = Self::terms(v1, v2, cov);
        cov / 4.0 + (cov * angle + (cov * cov + p * delta * delta) / (q * delta)) / (2.0 * PI)
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        let (delta, angle, p, q) = Self::terms(v1, v2, cov);
        let curvature = 1.0 / (delta * delta) + (1.0 - p) / q + 1.0;
        0.25 + angle / (2.0 * PI) + cov / (2.0 * PI * delta) * curvature
    }
}

/// Random Fourier features of the RBF kernel,
/// `φ(x) = sqrt(2) sin(sqrt(2γ) x + π/4)`, so that
/// `E[φ(u) φ(v)] = exp(-γ (v1 + v2 - 2c))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rbf {
    pub gamma: f64,
}

impl Default for Rbf {
    fn default() -> Self {
        Self { gamma: 1.0 }
    }
}

impl Rbf {
    pub fn new(gamma: f64) -> Self {
        Self { gamma }
    }
}

impl Activation for Rbf {
    fn name(&self) -> String {
        format!("Rbf({})", self.gamma)
    }

    fn apply(&self, x: f64) -> f64 {
        2f64.sqrt() * ((2.0 * self.gamma).sqrt() * x + FRAC_PI_4).sin()
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        (-self.gamma * (v1 + v2 - 2.0 * cov)).exp()
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        2.0 * self.gamma * self.nngp(v1, v2, cov)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity;

impl Activation for Identity {
    fn name(&self) -> String {
        "Identity".to_string()
    }

    fn apply(&self, x: f64) -> f64 {
        x
    }

    fn nngp(&self, _: f64, _: f64, cov: f64) -> f64 {
        cov
    }

    fn ntk_factor(&self, _: f64, _: f64, _: f64) -> f64 {
        1.0
    }

    fn is_linear(&self) -> bool {
        true
    }

    fn is_zero_mean(&self) -> bool {
        true
    }
}

type Scalar = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

const DIFF_STEP: f64 = 1e-5;

/// Any scalar function, integrated with Gauss-Hermite quadrature.
///
/// The tangent factor uses the supplied derivative, or a central difference
/// of `φ` when none is given.
#[derive(Clone)]
pub struct Numerical {
    name: String,
    f: Scalar,
    derivative: Option<Scalar>,
    rule: GaussHermite,
    zero_mean: bool,
}

impl fmt::Debug for Numerical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Numerical")
            .field("name", &self.name)
            .field("degree", &self.rule.len())
            .field("has_derivative", &self.derivative.is_some())
            .field("zero_mean", &self.zero_mean)
            .finish()
    }
}

impl Numerical {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(f64) -> f64 + Send + Sync + 'static,
        degree: usize,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            f: Arc::new(f),
            derivative: None,
            rule: GaussHermite::new(degree)?,
            zero_mean: false,
        })
    }

    pub fn with_derivative(mut self, derivative: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.derivative = Some(Arc::new(derivative));
        self
    }

    /// Declare `φ` odd, so uncorrelated inputs stay uncorrelated.
    pub fn zero_mean(mut self) -> Self {
        self.zero_mean = true;
        self
    }

    fn slope(&self, x: f64) -> f64 {
        match &self.derivative {
            Some(d) => d(x),
            None => ((self.f)(x + DIFF_STEP) - (self.f)(x - DIFF_STEP)) / (2.0 * DIFF_STEP),
        }
    }
}

impl Activation for Numerical {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn apply(&self, x: f64) -> f64 {
        (self.f)(x)
    }

    fn nngp(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        self.rule.expect_pair(v1, v2, cov, |u| (self.f)(u), |v| (self.f)(v))
    }

    fn ntk_factor(&self, v1: f64, v2: f64, cov: f64) -> f64 {
        self.rule
            .expect_pair(v1, v2, cov, |u| self.slope(u), |v| self.slope(v))
    }

    fn is_zero_mean(&self) -> bool {
        self.zero_mean
    }

    fn exactness(&self) -> Exactness {
        Exactness::Approximate
    }
}
