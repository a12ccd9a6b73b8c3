//! Sliding-window geometry shared by convolutions and pooling.
//!
//! A window over `d` spatial axes is described by its filter sizes, strides
//! and padding. For every filter offset `f` it yields a selection matrix
//! `M_f` (`S_out x S_in`) with `M_f[o, i] = 1` when output position `o` reads
//! input position `i` through offset `f`. Transposed windows scatter instead
//! of gathering.

use ndarray::{indices, Array2, IxDyn};
use serde::{Deserialize, Serialize};

use widenet_core::{KernelError, Result};

use crate::positions::kron_all;

/// Padding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// No padding; windows lie fully inside the input.
    #[default]
    Valid,
    /// Zero padding so that `out = ceil(in / stride)`.
    Same,
    /// Wrap-around padding with the `Same` output size.
    Circular,
}

/// Filter, strides and padding over the spatial axes (tensor order).
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub filter: Vec<usize>,
    pub strides: Vec<usize>,
    pub padding: Padding,
    pub transpose: bool,
}

/// Output size and low-side padding of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    out: usize,
    lo: usize,
}

impl Window {
    pub fn new(filter: Vec<usize>, strides: Vec<usize>, padding: Padding) -> Self {
        Self {
            filter,
            strides,
            padding,
            transpose: false,
        }
    }

    pub fn transposed(mut self) -> Self {
        self.transpose = true;
        self
    }

    /// Number of filter offsets.
    pub fn size(&self) -> usize {
        self.filter.iter().product()
    }

    fn check(&self, input: &[usize], layer: &str) -> Result<()> {
        let invalid = |reason: String| KernelError::InvalidConfig {
            layer: layer.to_string(),
            reason,
        };
        if self.filter.len() != input.len() || self.strides.len() != input.len() {
            return Err(invalid(format!(
                "window {:?} / strides {:?} for {} spatial axes",
                self.filter,
                self.strides,
                input.len()
            )));
        }
        if self.filter.contains(&0) || self.strides.contains(&0) || input.contains(&0) {
            return Err(invalid("window and spatial sizes must be positive".to_string()));
        }
        if self.transpose && self.padding == Padding::Circular {
            return Err(invalid("circular padding is not supported for transposed windows".to_string()));
        }
        Ok(())
    }

    fn extent(&self, n: usize, f: usize, s: usize, layer: &str) -> Result<Extent> {
        if self.transpose {
            return Ok(match self.padding {
                Padding::Valid => Extent {
                    out: (n.saturating_sub(1)) * s + f,
                    lo: 0,
                },
                _ => Extent {
                    out: n * s,
                    lo: f.saturating_sub(s) / 2,
                },
            });
        }
        match self.padding {
            Padding::Valid => {
                if n < f {
                    return Err(KernelError::InvalidConfig {
                        layer: layer.to_string(),
                        reason: format!("window of size {f} does not fit an axis of size {n}"),
                    });
                }
                Ok(Extent {
                    out: (n - f) / s + 1,
                    lo: 0,
                })
            }
            Padding::Same | Padding::Circular => {
                let out = (n + s - 1) / s;
                let total = ((out.saturating_sub(1)) * s + f).saturating_sub(n);
                Ok(Extent { out, lo: total / 2 })
            }
        }
    }

    /// Output spatial sizes for an input of the given spatial sizes.
    pub fn output_dims(&self, input: &[usize], layer: &str) -> Result<Vec<usize>> {
        self.check(input, layer)?;
        input
            .iter()
            .zip(self.filter.iter().zip(&self.strides))
            .map(|(&n, (&f, &s))| Ok(self.extent(n, f, s, layer)?.out))
            .collect()
    }

    /// `M[o, i]` for one axis and one filter offset `k`.
    fn axis_selection(&self, n: usize, k: usize, s: usize, extent: Extent) -> Array2<f64> {
        let mut m = Array2::zeros((extent.out, n));
        if self.transpose {
            for i in 0..n {
                let o = (i * s + k) as isize - extent.lo as isize;
                if o >= 0 && (o as usize) < extent.out {
                    m[[o as usize, i]] = 1.0;
                }
            }
            return m;
        }
        for o in 0..extent.out {
            let i = (o * s + k) as isize - extent.lo as isize;
            if self.padding == Padding::Circular {
                m[[o, i.rem_euclid(n as isize) as usize]] += 1.0;
            } else if i >= 0 && (i as usize) < n {
                m[[o, i as usize]] = 1.0;
            }
        }
        m
    }

    /// Output sizes and one selection matrix per filter offset, offsets in
    /// row-major order of the filter.
    pub fn selections(&self, input: &[usize], layer: &str) -> Result<(Vec<usize>, Vec<Array2<f64>>)> {
        self.check(input, layer)?;
        let extents = input
            .iter()
            .zip(self.filter.iter().zip(&self.strides))
            .map(|(&n, (&f, &s))| self.extent(n, f, s, layer))
            .collect::<Result<Vec<_>>>()?;

        let per_axis: Vec<Vec<Array2<f64>>> = (0..input.len())
            .map(|d| {
                (0..self.filter[d])
                    .map(|k| self.axis_selection(input[d], k, self.strides[d], extents[d]))
                    .collect()
            })
            .collect();

        let matrices = indices(IxDyn(&self.filter))
            .into_iter()
            .map(|offset| {
                let factors: Vec<Array2<f64>> = (0..input.len())
                    .map(|d| per_axis[d][offset[d]].clone())
                    .collect();
                kron_all(&factors)
            })
            .collect();
        Ok((extents.iter().map(|e| e.out).collect(), matrices))
    }

    /// Sum of all selection matrices: how often each output reads each input.
    pub fn coverage(&self, input: &[usize], layer: &str) -> Result<(Vec<usize>, Array2<f64>)> {
        let (out, matrices) = self.selections(input, layer)?;
        let rows: usize = out.iter().product();
        let cols: usize = input.iter().product();
        let total = matrices
            .into_iter()
            .fold(Array2::zeros((rows, cols)), |acc, m| acc + m);
        Ok((out, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_output_dims() {
        let valid = Window::new(vec![3], vec![1], Padding::Valid);
        assert_eq!(valid.output_dims(&[5], "Conv").unwrap(), vec![3]);

        let same = Window::new(vec![3, 2], vec![2, 1], Padding::Same);
        assert_eq!(same.output_dims(&[5, 4], "Conv").unwrap(), vec![3, 4]);

        let up = Window::new(vec![3], vec![2], Padding::Valid).transposed();
        assert_eq!(up.output_dims(&[4], "ConvTranspose").unwrap(), vec![9]);
        let up_same = Window::new(vec![3], vec![2], Padding::Same).transposed();
        assert_eq!(up_same.output_dims(&[4], "ConvTranspose").unwrap(), vec![8]);
    }

    #[test]
    fn test_valid_window_too_large() {
        let w = Window::new(vec![4], vec![1], Padding::Valid);
        assert!(matches!(
            w.output_dims(&[3], "Conv"),
            Err(KernelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_circular_transpose_rejected() {
        let w = Window::new(vec![2], vec![1], Padding::Circular).transposed();
        assert!(w.output_dims(&[3], "ConvTranspose").is_err());
    }

    #[test]
    fn test_same_selections() {
        let w = Window::new(vec![3], vec![1], Padding::Same);
        let (out, m) = w.selections(&[3], "Conv").unwrap();
        assert_eq!(out, vec![3]);
        assert_eq!(m.len(), 3);
        // offset 0 reads the left neighbour, zero at the border
        assert_eq!(m[0], array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(m[1], Array2::<f64>::eye(3));
    }

    #[test]
    fn test_circular_wraps() {
        let w = Window::new(vec![3], vec![1], Padding::Circular);
        let (_, m) = w.selections(&[3], "Conv").unwrap();
        assert_eq!(m[0][[0, 2]], 1.0);
    }

    #[test]
    fn test_two_dimensional_offsets_are_row_major() {
        let w = Window::new(vec![1, 2], vec![1, 1], Padding::Valid);
        let (out, m) = w.selections(&[2, 3], "Conv").unwrap();
        assert_eq!(out, vec![2, 2]);
        // offset (0, 1): output (r, c) reads input (r, c + 1)
        assert_eq!(m[1][[0, 1]], 1.0);
        assert_eq!(m[1][[3, 5]], 1.0);
    }

    #[test]
    fn test_transposed_scatter() {
        let w = Window::new(vec![2], vec![2], Padding::Valid).transposed();
        let (out, m) = w.selections(&[2], "ConvTranspose").unwrap();
        assert_eq!(out, vec![4]);
        assert_eq!(m[0].column(1).to_vec(), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(m[1].column(1).to_vec(), vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_coverage_counts() {
        let w = Window::new(vec![2], vec![1], Padding::Same);
        let (_, total) = w.coverage(&[3], "AvgPool").unwrap();
        assert_eq!(total.sum_axis(ndarray::Axis(1)).to_vec(), vec![2.0, 2.0, 1.0]);
    }
}
