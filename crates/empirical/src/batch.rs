//! Tiling kernel calls over batch slices.
//!
//! ```text
//!        x2[0..b]   x2[b..2b]  ...
//!   x1[0..b]   K00        K01
//!   x1[b..2b]  K10        K11
//! ```
//!
//! Tiles are evaluated in parallel and stitched back in row-major order. Any
//! network that never combines different batch entries gives the same result
//! as a single call.

use std::ops::Range;

use ndarray::{concatenate, ArrayD, Axis, Slice};
use rayon::prelude::*;
use tracing::debug;

use widenet_core::diagonal::Tristate;
use widenet_core::{
    kernels, AxisSpec, Get, Kernel, KernelError, KernelOptions, Layer, LayerArgs, Nested, Operand, Output, Result,
};

/// A kernel call split into tiles of at most `batch_size` examples per side.
#[derive(Debug, Clone)]
pub struct Batched<L> {
    layer: L,
    batch_size: usize,
}

/// One slice of the batch, for every leaf of the input tree.
struct Tile {
    x: Nested<ArrayD<f64>>,
    range: Range<usize>,
}

impl<L: Layer> Batched<L> {
    pub fn new(layer: L, batch_size: usize) -> Self {
        Self { layer, batch_size }
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    /// Same contract as [`widenet_core::kernel_fn`].
    pub fn kernel(
        &self,
        x1: &Nested<ArrayD<f64>>,
        x2: Option<&Nested<ArrayD<f64>>>,
        get: &Get,
        options: &KernelOptions,
        args: &LayerArgs,
    ) -> Result<Output> {
        let meta = self.layer.meta();
        if meta.diagonal.batch.input == Tristate::No {
            return Err(self.invalid(&meta.name, "the network mixes batch entries and cannot be tiled"));
        }
        if self.batch_size == 0 {
            return Err(self.invalid(&meta.name, "batch_size must be positive"));
        }

        // Every tile must use the same storage as the untiled call would.
        let (diagonal_batch, diagonal_spatial) =
            meta.diagonal
                .resolve(options.diagonal_batch, options.diagonal_spatial, &meta.name)?;
        let options = KernelOptions {
            diagonal_batch: Some(diagonal_batch),
            diagonal_spatial: Some(diagonal_spatial),
            ..*options
        };

        let rows = tiles(x1, meta.axes, self.batch_size)?;
        let cols = x2.map(|x| tiles(x, meta.axes, self.batch_size)).transpose()?;
        let second = args.pattern(Operand::Second);
        debug!(
            layer = %meta.name,
            rows = rows.len(),
            cols = cols.as_ref().map_or(rows.len(), Vec::len),
            "tiled kernel call"
        );

        let grid = Grid {
            layer: &self.layer,
            get,
            options: &options,
        };
        let cross = grid.evaluate(&rows, cols.as_deref(), args.pattern1.as_ref(), second)?;
        let out = match cols.as_deref() {
            None => cross.assemble(None, None, diagonal_batch)?,
            Some(cols) => {
                if diagonal_batch {
                    cross.assemble(None, None, true)?
                } else {
                    let own1 = grid.evaluate(&rows, None, args.pattern1.as_ref(), args.pattern1.as_ref())?;
                    let own2 = grid.evaluate(cols, None, second, second)?;
                    cross.assemble(Some(&own1), Some(&own2), false)?
                }
            }
        };
        Output::from_kernels(out, get)
    }

    fn invalid(&self, layer: &str, reason: &str) -> KernelError {
        KernelError::InvalidConfig {
            layer: format!("Batched({layer})"),
            reason: reason.to_string(),
        }
    }
}

/// Split every leaf of `x` along its batch axis.
fn tiles(x: &Nested<ArrayD<f64>>, axes: AxisSpec, size: usize) -> Result<Vec<Tile>> {
    let sizes = x
        .leaves()
        .iter()
        .map(|leaf| Ok(leaf.shape()[axes.resolve(leaf.ndim())?.0]))
        .collect::<Result<Vec<usize>>>()?;
    let n = sizes.first().copied().unwrap_or(0);
    if let Some(&other) = sizes.iter().find(|&&s| s != n) {
        return Err(KernelError::shape_mismatch(&[n], &[other]));
    }
    if n == 0 {
        return Err(KernelError::Structure {
            reason: "cannot tile an empty batch".to_string(),
        });
    }

    (0..n)
        .step_by(size)
        .map(|start| {
            let range = start..(start + size).min(n);
            let x = x.try_map_ref(&mut |leaf: &ArrayD<f64>| {
                let (batch, _) = axes.resolve(leaf.ndim())?;
                Ok(leaf.slice_axis(Axis(batch), Slice::from(range.clone())).to_owned())
            })?;
            Ok(Tile { x, range })
        })
        .collect()
}

fn slice_pattern(pattern: Option<&ArrayD<f64>>, range: &Range<usize>) -> Option<ArrayD<f64>> {
    pattern.map(|p| p.slice_axis(Axis(0), Slice::from(range.clone())).to_owned())
}

struct Grid<'a, L> {
    layer: &'a L,
    get: &'a Get,
    options: &'a KernelOptions,
}

/// Kernels of every tile pair, `blocks[i][j][leaf]`.
struct Blocks {
    blocks: Vec<Vec<Vec<Kernel>>>,
    structure: Nested<Kernel>,
    x1_is_x2: bool,
}

impl<L: Layer> Grid<'_, L> {
    /// `rows x cols` tiles, or `rows x rows` with the shared-input fast path on
    /// the diagonal when `cols` is absent.
    fn evaluate(
        &self,
        rows: &[Tile],
        cols: Option<&[Tile]>,
        pattern1: Option<&ArrayD<f64>>,
        pattern2: Option<&ArrayD<f64>>,
    ) -> Result<Blocks> {
        let right = cols.unwrap_or(rows);
        let pairs: Vec<(usize, usize)> = (0..rows.len())
            .flat_map(|i| (0..right.len()).map(move |j| (i, j)))
            .collect();

        let kernels_by_pair = pairs
            .par_iter()
            .map(|&(i, j)| {
                let (a, b) = (&rows[i], &right[j]);
                let shared = cols.is_none() && i == j;
                let args = LayerArgs {
                    pattern1: slice_pattern(pattern1, &a.range),
                    pattern2: if shared { None } else { slice_pattern(pattern2, &b.range) },
                };
                let x2 = if shared { None } else { Some(&b.x) };
                kernels(self.layer, &a.x, x2, self.get, self.options, &args)
            })
            .collect::<Result<Vec<Nested<Kernel>>>>()?;

        let structure = kernels_by_pair.first().cloned().ok_or_else(|| KernelError::Structure {
            reason: "no tiles to evaluate".to_string(),
        })?;
        let mut blocks: Vec<Vec<Vec<Kernel>>> = vec![Vec::with_capacity(right.len()); rows.len()];
        for ((i, _), k) in pairs.into_iter().zip(kernels_by_pair) {
            blocks[i].push(k.leaves().into_iter().cloned().collect());
        }
        Ok(Blocks {
            blocks,
            structure,
            x1_is_x2: cols.is_none(),
        })
    }
}

impl Blocks {
    fn leaf(&self, i: usize, j: usize, leaf: usize) -> Result<&Kernel> {
        self.blocks
            .get(i)
            .and_then(|row| row.get(j))
            .and_then(|ks| ks.get(leaf))
            .ok_or_else(|| KernelError::Structure {
                reason: format!("missing tile ({i}, {j}) for output {leaf}"),
            })
    }

    /// Stitch a field of every tile of one output leaf.
    fn stitch(&self, leaf: usize, field: impl Fn(&Kernel) -> Option<&ArrayD<f64>>) -> Result<Option<ArrayD<f64>>> {
        let mut rows = Vec::with_capacity(self.blocks.len());
        for i in 0..self.blocks.len() {
            let mut cols = Vec::with_capacity(self.blocks[i].len());
            for j in 0..self.blocks[i].len() {
                match field(self.leaf(i, j, leaf)?) {
                    Some(a) => cols.push(a.view()),
                    None => return Ok(None),
                }
            }
            rows.push(concatenate(Axis(1), &cols)?);
        }
        let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
        Ok(Some(concatenate(Axis(0), &views)?))
    }

    /// Concatenate a per-example quantity down the first column (`rows`) or
    /// along the first row.
    fn along<T: Clone>(
        &self,
        rows: bool,
        leaf: usize,
        field: impl Fn(&Kernel) -> Option<ArrayD<T>>,
    ) -> Result<Option<ArrayD<T>>> {
        let count = if rows {
            self.blocks.len()
        } else {
            self.blocks.first().map_or(0, Vec::len)
        };
        let mut parts = Vec::with_capacity(count);
        for t in 0..count {
            let (i, j) = if rows { (t, 0) } else { (0, t) };
            match field(self.leaf(i, j, leaf)?) {
                Some(a) => parts.push(a),
                None => return Ok(None),
            }
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        Ok(Some(concatenate(Axis(0), &views)?))
    }

    /// Whole kernels from the tiles. Full-batch covariances come from the
    /// `own` grids of each input against itself.
    fn assemble(&self, own1: Option<&Blocks>, own2: Option<&Blocks>, diagonal_batch: bool) -> Result<Nested<Kernel>> {
        let mut next = 0;
        self.structure.try_map_ref(&mut |_: &Kernel| {
            let leaf = next;
            next += 1;
            let template = self.leaf(0, 0, leaf)?;
            let missing = |name: &str| KernelError::Structure {
                reason: format!("tiles did not produce {name}"),
            };

            let nngp = self.stitch(leaf, |k| Some(&k.nngp))?.ok_or_else(|| missing("nngp"))?;
            let ntk = self.stitch(leaf, |k| k.ntk.as_ref())?;
            let (cov1, cov2) = if diagonal_batch {
                let cov1 = self.along(true, leaf, |k| Some(k.cov1.clone()))?;
                let cov2 = if self.x1_is_x2 {
                    None
                } else {
                    self.along(false, leaf, |k| k.cov2.clone())?
                };
                (cov1.ok_or_else(|| missing("cov1"))?, cov2)
            } else if self.x1_is_x2 {
                (nngp.clone(), None)
            } else {
                let own = |blocks: Option<&Blocks>, name: &str| -> Result<ArrayD<f64>> {
                    blocks
                        .ok_or_else(|| missing(name))?
                        .stitch(leaf, |k| Some(&k.nngp))?
                        .ok_or_else(|| missing(name))
                };
                (own(own1, "cov1")?, Some(own(own2, "cov2")?))
            };

            let mask1 = self.along(true, leaf, |k| k.mask1.clone().map(|m| m.into_dyn()))?;
            let mask2 = self.along(false, leaf, |k| k.mask(Operand::Second).map(|m| m.clone().into_dyn()))?;
            let n1 = nngp.shape()[0];
            let n2 = nngp.shape()[1];
            let batch = template.batch_axis;
            Ok(Kernel {
                nngp,
                ntk,
                cov1,
                cov2,
                x1_is_x2: self.x1_is_x2,
                mask1: mask1.map(|m| m.into_dimensionality()).transpose()?,
                mask2: if self.x1_is_x2 {
                    None
                } else {
                    mask2.map(|m| m.into_dimensionality()).transpose()?
                },
                shape1: template.shape1.with_dim(batch, n1),
                shape2: template.shape2.with_dim(batch, n2),
                ..template.clone()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;
    use widenet_core::{kernel_fn, GetTag};
    use widenet_layers::{elementwise, Contract, Dense};

    fn x(n: usize, shift: f64) -> Nested<ArrayD<f64>> {
        Nested::Leaf(ArrayD::from_shape_fn(IxDyn(&[n, 3, 2]), |ix| {
            ((ix[0] * 6 + ix[1] * 2 + ix[2]) as f64 * 0.3 + shift).cos()
        }))
    }

    fn net() -> widenet_core::Serial {
        widenet_core::Serial::new()
            .then(Dense::new(4).with_std(1.1, 0.3))
            .then(elementwise::relu())
            .then(Dense::new(2))
    }

    fn assert_same(a: &Kernel, b: &Kernel) {
        assert_eq!(a.nngp.shape(), b.nngp.shape());
        for (x, y) in a.nngp.iter().zip(b.nngp.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-12);
        }
        assert_eq!(a.cov1.shape(), b.cov1.shape());
        for (x, y) in a.cov1.iter().zip(b.cov1.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-12);
        }
        assert_eq!(a.shape1, b.shape1);
        assert_eq!(a.shape2, b.shape2);
    }

    fn whole(x1: &Nested<ArrayD<f64>>, x2: Option<&Nested<ArrayD<f64>>>, options: &KernelOptions) -> Kernel {
        kernel_fn(&net(), x1, x2, &Get::Kernel, options, &LayerArgs::default())
            .unwrap()
            .into_kernel()
            .unwrap()
    }

    fn tiled(x1: &Nested<ArrayD<f64>>, x2: Option<&Nested<ArrayD<f64>>>, options: &KernelOptions) -> Kernel {
        Batched::new(net(), 2)
            .kernel(x1, x2, &Get::Kernel, options, &LayerArgs::default())
            .unwrap()
            .into_kernel()
            .unwrap()
    }

    #[test]
    fn test_self_kernel_matches_untiled() {
        let x1 = x(5, 0.0);
        let opts = KernelOptions::new();
        assert_same(&tiled(&x1, None, &opts), &whole(&x1, None, &opts));
    }

    #[test]
    fn test_cross_kernel_full_batch() {
        let (x1, x2) = (x(3, 0.0), x(4, 1.0));
        let opts = KernelOptions::new().with_diagonal_batch(false);
        let (a, b) = (tiled(&x1, Some(&x2), &opts), whole(&x1, Some(&x2), &opts));
        assert_same(&a, &b);
        assert_eq!(a.cov2.as_ref().map(|c| c.shape().to_vec()), Some(vec![4, 4, 3, 3]));
    }

    #[test]
    fn test_cross_kernel_diagonal_batch() {
        let (x1, x2) = (x(5, 0.2), x(3, 0.4));
        let opts = KernelOptions::new().with_diagonal_batch(true);
        let (a, b) = (tiled(&x1, Some(&x2), &opts), whole(&x1, Some(&x2), &opts));
        assert_same(&a, &b);
        for (p, q) in a.cov2.unwrap().iter().zip(b.cov2.unwrap().iter()) {
            assert_relative_eq!(p, q, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_output_follows_get() {
        let x1 = x(4, 0.0);
        let out = Batched::new(net(), 3)
            .kernel(&x1, None, &Get::One(GetTag::Nngp), &KernelOptions::new(), &LayerArgs::default())
            .unwrap()
            .into_array()
            .unwrap();
        assert_eq!(out.shape(), &[4, 4, 3, 3]);
    }

    #[test]
    fn test_batch_mixing_network_rejected() {
        let layer = Contract::batch(ndarray::Array2::eye(4));
        let err = Batched::new(layer, 2)
            .kernel(&x(4, 0.0), None, &Get::Kernel, &KernelOptions::new(), &LayerArgs::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig { .. }));
    }
}
