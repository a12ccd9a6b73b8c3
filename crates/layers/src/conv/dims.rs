//! Convolution dimension numbers.
//!
//! Three layout strings name the axes of the input (`lhs`), the filter
//! (`rhs`) and the output (`out`). `lhs` and `out` use `N` for the batch axis
//! and `C` for channels; `rhs` uses `I` / `O` for input / output channels.
//! Every other letter is a spatial axis, matched across the three strings by
//! letter:
//!
//! ```text
//!   ("NHWC", "HWIO", "NHWC")   default for two spatial axes
//!   ("NCHW", "OIHW", "NCHW")   channels-first
//! ```

use serde::{Deserialize, Serialize};

use widenet_core::{KernelError, Result};

const SPATIAL_LETTERS: &str = "HWDEFGJKL";

/// Layout strings of a convolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionNumbers {
    pub lhs: String,
    pub rhs: String,
    pub out: String,
}

/// Axis positions derived from valid [`DimensionNumbers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvAxes {
    pub lhs_batch: usize,
    pub lhs_channel: usize,
    pub rhs_in: usize,
    pub rhs_out: usize,
    pub out_batch: usize,
    pub out_channel: usize,
    /// For each spatial axis of `lhs` (tensor order), its index among the
    /// spatial axes of `rhs`, which is also the index into filter sizes and
    /// strides.
    pub rhs_order: Vec<usize>,
    /// For each spatial axis of `rhs` (tensor order), its tensor axis in `rhs`.
    pub rhs_spatial: Vec<usize>,
    /// For each spatial axis of `out` (tensor order), its index among the
    /// spatial axes of `lhs`.
    pub out_order: Vec<usize>,
}

impl ConvAxes {
    pub fn spatial_rank(&self) -> usize {
        self.rhs_order.len()
    }

    /// Tensor-order values from a list given in `rhs` spatial order.
    pub fn to_lhs_order(&self, values: &[usize]) -> Vec<usize> {
        self.rhs_order.iter().map(|&r| values[r]).collect()
    }
}

impl Default for DimensionNumbers {
    fn default() -> Self {
        Self::default_for(2)
    }
}

impl DimensionNumbers {
    pub fn new(lhs: impl Into<String>, rhs: impl Into<String>, out: impl Into<String>) -> Self {
        Self {
            lhs: lhs.into(),
            rhs: rhs.into(),
            out: out.into(),
        }
    }

    /// Channels-last layout for `spatial` spatial axes.
    pub fn default_for(spatial: usize) -> Self {
        let letters: String = SPATIAL_LETTERS.chars().take(spatial).collect();
        let lhs = format!("N{letters}C");
        Self {
            rhs: format!("{letters}IO"),
            out: lhs.clone(),
            lhs,
        }
    }

    fn error(&self, reason: impl Into<String>) -> KernelError {
        KernelError::DimensionNumbers {
            spec: format!("({}, {}, {})", self.lhs, self.rhs, self.out),
            reason: reason.into(),
        }
    }

    /// Validate and resolve axis positions.
    pub fn axes(&self) -> Result<ConvAxes> {
        let lhs: Vec<char> = self.lhs.chars().collect();
        let rhs: Vec<char> = self.rhs.chars().collect();
        let out: Vec<char> = self.out.chars().collect();
        if lhs.len() != rhs.len() || lhs.len() != out.len() {
            return Err(self.error("layout strings must have equal length"));
        }

        let unique = |name: &str, letters: &[char]| -> Result<()> {
            for (i, c) in letters.iter().enumerate() {
                if letters[..i].contains(c) {
                    return Err(self.error(format!("{name} repeats axis `{c}`")));
                }
            }
            Ok(())
        };
        unique("lhs", &lhs)?;
        unique("rhs", &rhs)?;
        unique("out", &out)?;

        let find = |name: &str, letters: &[char], c: char| -> Result<usize> {
            letters
                .iter()
                .position(|&l| l == c)
                .ok_or_else(|| self.error(format!("{name} has no `{c}` axis")))
        };
        let lhs_batch = find("lhs", &lhs, 'N')?;
        let lhs_channel = find("lhs", &lhs, 'C')?;
        let rhs_in = find("rhs", &rhs, 'I')?;
        let rhs_out = find("rhs", &rhs, 'O')?;
        let out_batch = find("out", &out, 'N')?;
        let out_channel = find("out", &out, 'C')?;

        let spatial = |letters: &[char], skip: [char; 2]| -> Vec<char> {
            letters.iter().copied().filter(|c| !skip.contains(c)).collect()
        };
        let lhs_s = spatial(&lhs, ['N', 'C']);
        let rhs_s = spatial(&rhs, ['I', 'O']);
        let out_s = spatial(&out, ['N', 'C']);

        let sorted = |mut v: Vec<char>| {
            v.sort_unstable();
            v
        };
        if sorted(lhs_s.clone()) != sorted(rhs_s.clone()) || sorted(lhs_s.clone()) != sorted(out_s.clone()) {
            return Err(self.error("spatial axes differ between layouts"));
        }

        let rhs_order = lhs_s
            .iter()
            .map(|c| find("rhs", &rhs_s, *c))
            .collect::<Result<Vec<_>>>()?;
        let rhs_spatial = rhs_s
            .iter()
            .map(|c| find("rhs", &rhs, *c))
            .collect::<Result<Vec<_>>>()?;
        let out_order = out_s
            .iter()
            .map(|c| find("lhs", &lhs_s, *c))
            .collect::<Result<Vec<_>>>()?;

        Ok(ConvAxes {
            lhs_batch,
            lhs_channel,
            rhs_in,
            rhs_out,
            out_batch,
            out_channel,
            rhs_order,
            rhs_spatial,
            out_order,
        })
    }

    /// Whether output tensors keep the input's axis order.
    pub fn preserves_layout(&self) -> bool {
        self.lhs == self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layouts() {
        let d = DimensionNumbers::default_for(2);
        assert_eq!(d, DimensionNumbers::new("NHWC", "HWIO", "NHWC"));
        assert_eq!(DimensionNumbers::default_for(0).lhs, "NC");
        assert_eq!(DimensionNumbers::default_for(3).rhs, "HWDIO");
    }

    #[test]
    fn test_channels_first_axes() {
        let axes = DimensionNumbers::new("NCHW", "OIWH", "NHWC").axes().unwrap();
        assert_eq!((axes.lhs_batch, axes.lhs_channel), (0, 1));
        assert_eq!((axes.rhs_in, axes.rhs_out), (1, 0));
        assert_eq!((axes.out_batch, axes.out_channel), (0, 3));
        // lhs H is the second rhs spatial axis
        assert_eq!(axes.rhs_order, vec![1, 0]);
        assert_eq!(axes.rhs_spatial, vec![2, 3]);
        assert_eq!(axes.out_order, vec![0, 1]);
        assert_eq!(axes.to_lhs_order(&[5, 3]), vec![3, 5]);
    }

    #[test]
    fn test_rejects_mismatched_letters() {
        let err = DimensionNumbers::new("NHWC", "HDIO", "NHWC").axes().unwrap_err();
        assert!(matches!(err, KernelError::DimensionNumbers { .. }));
    }

    #[test]
    fn test_rejects_missing_roles_and_repeats() {
        assert!(DimensionNumbers::new("NHWH", "HWIO", "NHWC").axes().is_err());
        assert!(DimensionNumbers::new("NHWC", "HWIC", "NHWC").axes().is_err());
        assert!(DimensionNumbers::new("NHW", "HWIO", "NHWC").axes().is_err());
    }

    #[test]
    fn test_layout_change() {
        assert!(DimensionNumbers::default().preserves_layout());
        assert!(!DimensionNumbers::new("NCHW", "OIHW", "NHWC").preserves_layout());
    }
}
