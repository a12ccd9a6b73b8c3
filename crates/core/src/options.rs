//! # Caller Options
//!
//! What a kernel call returns ([`Get`]), how the raw input kernel is stored
//! ([`KernelOptions`]) and how results are compared ([`Tolerance`]). Option
//! and tolerance types are `serde` values, so they can be loaded from JSON:
//!
//! ```rust
//! use widenet_core::options::KernelOptions;
//!
//! let options = KernelOptions::from_json(r#"{"diagonal_spatial": false}"#).unwrap();
//! assert_eq!(options.diagonal_spatial, Some(false));
//! assert_eq!(options.diagonal_batch, None);
//! ```

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::nested::Nested;
use crate::shape::Shape;

/// One requested output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GetTag {
    Nngp,
    Ntk,
    Cov1,
    Cov2,
    Shape1,
    Shape2,
}

impl GetTag {
    pub const ALL: [GetTag; 6] = [
        GetTag::Nngp,
        GetTag::Ntk,
        GetTag::Cov1,
        GetTag::Cov2,
        GetTag::Shape1,
        GetTag::Shape2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GetTag::Nngp => "nngp",
            GetTag::Ntk => "ntk",
            GetTag::Cov1 => "cov1",
            GetTag::Cov2 => "cov2",
            GetTag::Shape1 => "shape1",
            GetTag::Shape2 => "shape2",
        }
    }
}

impl fmt::Display for GetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GetTag {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        GetTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| KernelError::UnsupportedGet { tag: s.to_string() })
    }
}

/// Which outputs a kernel call returns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Get {
    /// The whole kernel value.
    #[default]
    Kernel,
    One(GetTag),
    Many(Vec<GetTag>),
}

impl Get {
    /// Parse a comma separated list, `"kernel"` or a single tag.
    pub fn parse(s: &str) -> Result<Get> {
        let s = s.trim();
        if s.is_empty() || s == "kernel" {
            return Ok(Get::Kernel);
        }
        let tags = s
            .split(',')
            .map(|part| part.trim().parse())
            .collect::<Result<Vec<GetTag>>>()?;
        match tags.as_slice() {
            [tag] => Ok(Get::One(*tag)),
            _ => Ok(Get::Many(tags)),
        }
    }

    /// Whether the tangent kernel has to be propagated.
    pub fn needs_ntk(&self) -> bool {
        match self {
            Get::Kernel => true,
            Get::One(tag) => *tag == GetTag::Ntk,
            Get::Many(tags) => tags.contains(&GetTag::Ntk),
        }
    }

    pub fn tags(&self) -> Vec<GetTag> {
        match self {
            Get::Kernel => GetTag::ALL.to_vec(),
            Get::One(tag) => vec![*tag],
            Get::Many(tags) => tags.clone(),
        }
    }
}

impl From<GetTag> for Get {
    fn from(tag: GetTag) -> Self {
        Get::One(tag)
    }
}

impl From<Vec<GetTag>> for Get {
    fn from(tags: Vec<GetTag>) -> Self {
        Get::Many(tags)
    }
}

/// Storage of the raw input kernel and masking.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
    /// `None` lets the network decide.
    pub diagonal_batch: Option<bool>,
    pub diagonal_spatial: Option<bool>,
    /// Input entries equal to this value are masked out.
    pub mask_constant: Option<f64>,
}

impl KernelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagonal_batch(mut self, diagonal: bool) -> Self {
        self.diagonal_batch = Some(diagonal);
        self
    }

    pub fn with_diagonal_spatial(mut self, diagonal: bool) -> Self {
        self.diagonal_spatial = Some(diagonal);
        self
    }

    pub fn with_mask_constant(mut self, sentinel: f64) -> Self {
        self.mask_constant = Some(sentinel);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| KernelError::InvalidConfig {
            layer: "KernelOptions".to_string(),
            reason: e.to_string(),
        })
    }
}

/// One extracted output.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Array(ArrayD<f64>),
    Shape(Shape),
    /// `cov2` when x1 is x2, or `ntk` when it was not computed.
    Absent,
}

impl FieldValue {
    pub fn extract(kernel: &Kernel, tag: GetTag) -> FieldValue {
        let array = |a: Option<&ArrayD<f64>>| a.cloned().map_or(FieldValue::Absent, FieldValue::Array);
        match tag {
            GetTag::Nngp => FieldValue::Array(kernel.nngp.clone()),
            GetTag::Ntk => array(kernel.ntk.as_ref()),
            GetTag::Cov1 => FieldValue::Array(kernel.cov1.clone()),
            GetTag::Cov2 => array(kernel.cov2.as_ref()),
            GetTag::Shape1 => FieldValue::Shape(kernel.shape1.clone()),
            GetTag::Shape2 => FieldValue::Shape(kernel.shape2.clone()),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayD<f64>> {
        match self {
            FieldValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_array(self) -> Result<ArrayD<f64>> {
        match self {
            FieldValue::Array(a) => Ok(a),
            other => Err(KernelError::Structure {
                reason: format!("expected an array, got {other:?}"),
            }),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }
}

/// Result of a kernel call, following the shape of [`Get`].
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Kernel(Nested<Kernel>),
    One(Nested<FieldValue>),
    /// One tree per requested tag, in request order.
    Many(Vec<Nested<FieldValue>>),
}

impl Output {
    pub fn from_kernels(kernels: Nested<Kernel>, get: &Get) -> Result<Output> {
        match get {
            Get::Kernel => Ok(Output::Kernel(kernels)),
            Get::One(tag) => Ok(Output::One(extract(&kernels, *tag)?)),
            Get::Many(tags) => Ok(Output::Many(
                tags.iter()
                    .map(|tag| extract(&kernels, *tag))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    pub fn into_kernel(self) -> Result<Kernel> {
        match self {
            Output::Kernel(k) => k.into_leaf(),
            _ => Err(KernelError::Structure {
                reason: "output does not hold a kernel".to_string(),
            }),
        }
    }

    /// The single array of a `Get::One` call on a single input.
    pub fn into_array(self) -> Result<ArrayD<f64>> {
        match self {
            Output::One(value) => value.into_leaf()?.into_array(),
            _ => Err(KernelError::Structure {
                reason: "output does not hold a single field".to_string(),
            }),
        }
    }

    /// Arrays of a `Get::Many` call on a single input.
    pub fn into_arrays(self) -> Result<Vec<FieldValue>> {
        match self {
            Output::Many(values) => values.into_iter().map(Nested::into_leaf).collect(),
            _ => Err(KernelError::Structure {
                reason: "output does not hold several fields".to_string(),
            }),
        }
    }
}

fn extract(kernels: &Nested<Kernel>, tag: GetTag) -> Result<Nested<FieldValue>> {
    kernels.try_map_ref(&mut |k: &Kernel| Ok(FieldValue::extract(k, tag)))
}

/// Relative and absolute tolerance, `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
        }
    }
}

impl Tolerance {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    pub fn is_close(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.atol + self.rtol * b.abs()
    }

    /// Elementwise closeness of two arrays of equal shape.
    pub fn all_close(&self, a: &ArrayD<f64>, b: &ArrayD<f64>) -> bool {
        a.shape() == b.shape() && Zip::from(a).and(b).all(|&x, &y| self.is_close(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_get_tag_parsing() {
        assert_eq!("ntk".parse::<GetTag>().unwrap(), GetTag::Ntk);
        let err = "nttk".parse::<GetTag>().unwrap_err();
        assert_eq!(err, KernelError::UnsupportedGet { tag: "nttk".into() });
    }

    #[test]
    fn test_get_parse() {
        assert_eq!(Get::parse("kernel").unwrap(), Get::Kernel);
        assert_eq!(Get::parse("nngp").unwrap(), Get::One(GetTag::Nngp));
        assert_eq!(
            Get::parse("nngp, ntk").unwrap(),
            Get::Many(vec![GetTag::Nngp, GetTag::Ntk])
        );
        assert!(Get::parse("nngp,foo").is_err());
    }

    #[test]
    fn test_needs_ntk() {
        assert!(Get::Kernel.needs_ntk());
        assert!(!Get::One(GetTag::Nngp).needs_ntk());
        assert!(Get::Many(vec![GetTag::Cov1, GetTag::Ntk]).needs_ntk());
    }

    #[test]
    fn test_options_from_json() {
        let json = r#"{"diagonal_batch": true, "mask_constant": 10.0}"#;
        let options = KernelOptions::from_json(json).unwrap();
        assert_eq!(
            options,
            KernelOptions::new()
                .with_diagonal_batch(true)
                .with_mask_constant(10.0)
        );
        assert!(KernelOptions::from_json("{\"diagonal_batch\": 3}").is_err());
    }

    #[test]
    fn test_get_serde() {
        let get: Get = serde_json::from_str(r#"{"many": ["nngp", "cov2"]}"#).unwrap();
        assert_eq!(get, Get::Many(vec![GetTag::Nngp, GetTag::Cov2]));
        assert_eq!(serde_json::to_string(&GetTag::Shape1).unwrap(), "\"shape1\"");
    }

    #[test]
    fn test_tolerance() {
        let tol = Tolerance::new(0.05, 0.05);
        assert!(tol.is_close(1.04, 1.0));
        assert!(!tol.is_close(1.2, 1.0));
        let a = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0);
        let b = ArrayD::from_elem(IxDyn(&[2, 2]), 1.01);
        assert!(tol.all_close(&a, &b));
        assert!(!tol.all_close(&a, &ArrayD::zeros(IxDyn(&[2]))));
    }
}
