//! # Kernel Layout
//!
//! Every kernel field is a *lead* part followed by a *spatial* part:
//!
//! ```text
//!   nngp, ntk          [N1, N2,  s.., s'..]   full spatial
//!                      [N1, N2,  s..]         diagonal spatial
//!   cov1 (full batch)  [N1, N1,  ...]
//!   cov1 (diag batch)  [N1,      ...]
//! ```
//!
//! Transforms mostly act on one *block* at a time: the `S x S` position
//! matrix (or length-`S` diagonal) belonging to one lead index. A
//! [`Pairing`] says which two examples a lead index correlates, so per-example
//! data (masks, attention weights, aggregation patterns) can be looked up.
//!
//! Linear maps over positions are [`PositionMap`]s: a list of `T x S`
//! matrices `M_t`, acting on a block as `K -> sum_t L_t K R_t^T`.

use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView1, IxDyn};

use crate::error::{KernelError, Result};
use crate::shape::Shape;

/// Which of the two input batches an example comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    #[default]
    First,
    Second,
}

/// One example of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Example {
    pub operand: Operand,
    pub index: usize,
}

impl Example {
    pub fn new(operand: Operand, index: usize) -> Self {
        Self { operand, index }
    }
}

/// The spatial part of one lead index of a kernel field.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Full(Array2<f64>),
    Diagonal(Array1<f64>),
}

impl Block {
    /// Number of positions on each side.
    pub fn positions(&self) -> usize {
        match self {
            Block::Full(m) => m.nrows(),
            Block::Diagonal(d) => d.len(),
        }
    }

    /// Elementwise map.
    pub fn map(self, f: impl Fn(f64) -> f64) -> Block {
        match self {
            Block::Full(m) => Block::Full(m.mapv(f)),
            Block::Diagonal(d) => Block::Diagonal(d.mapv(f)),
        }
    }

    /// Matching-position entries.
    pub fn diagonal(&self) -> Array1<f64> {
        match self {
            Block::Full(m) => m.diag().to_owned(),
            Block::Diagonal(d) => d.clone(),
        }
    }

    /// Add `value` to the matching-position entries only.
    pub fn add_diagonal(self, value: f64) -> Block {
        match self {
            Block::Full(mut m) => {
                m.diag_mut().mapv_inplace(|x| x + value);
                Block::Full(m)
            }
            Block::Diagonal(d) => Block::Diagonal(d.mapv(|x| x + value)),
        }
    }

    /// Multiply the matching-position entries only.
    pub fn scale_diagonal(self, factor: f64) -> Block {
        match self {
            Block::Full(mut m) => {
                m.diag_mut().mapv_inplace(|x| x * factor);
                Block::Full(m)
            }
            Block::Diagonal(d) => Block::Diagonal(d * factor),
        }
    }

    fn into_vec(self) -> Vec<f64> {
        match self {
            Block::Full(m) => m.iter().copied().collect(),
            Block::Diagonal(d) => d.to_vec(),
        }
    }
}

/// Which examples each lead index of a field correlates.
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    /// Lead dimensions: `[N_left, N_right]` or `[N]` for batch-diagonal fields.
    pub lead: Vec<usize>,
    pub left: Operand,
    pub right: Operand,
}

impl Pairing {
    /// Number of lead indices.
    pub fn len(&self) -> usize {
        self.lead.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `(left, right)` examples of lead index `l`.
    pub fn examples(&self, l: usize) -> (Example, Example) {
        match self.lead.as_slice() {
            [_, n] => (
                Example::new(self.left, l / n),
                Example::new(self.right, l % n),
            ),
            _ => (Example::new(self.left, l), Example::new(self.right, l)),
        }
    }
}

/// Split a kernel field into per-lead blocks.
pub fn blocks(field: &ArrayD<f64>, lead_rank: usize, diagonal: bool) -> Result<Vec<Block>> {
    if field.ndim() < lead_rank {
        return Err(KernelError::Tensor {
            reason: format!("field of rank {} has no room for {lead_rank} lead axes", field.ndim()),
        });
    }
    let spatial = &field.shape()[lead_rank..];
    let positions: usize = if diagonal {
        spatial.iter().product()
    } else {
        if spatial.len() % 2 != 0 {
            return Err(KernelError::Tensor {
                reason: format!("full spatial part {spatial:?} has odd rank"),
            });
        }
        spatial[..spatial.len() / 2].iter().product()
    };
    let block_len = if diagonal { positions } else { positions * positions };
    let data: Vec<f64> = field.iter().copied().collect();
    if block_len == 0 {
        return Ok(Vec::new());
    }
    data.chunks(block_len)
        .map(|chunk| -> Result<Block> {
            if diagonal {
                Ok(Block::Diagonal(Array1::from(chunk.to_vec())))
            } else {
                Ok(Block::Full(Array2::from_shape_vec(
                    (positions, positions),
                    chunk.to_vec(),
                )?))
            }
        })
        .collect()
}

/// Inverse of [`blocks`]: stack blocks back into a field.
pub fn assemble(
    blocks: Vec<Block>,
    lead: &[usize],
    spatial: &[usize],
    diagonal: bool,
) -> Result<ArrayD<f64>> {
    let mut shape = lead.to_vec();
    shape.extend_from_slice(spatial);
    if !diagonal {
        shape.extend_from_slice(spatial);
    }
    let positions: usize = spatial.iter().product();
    let mut data = Vec::with_capacity(shape.iter().product());
    for block in blocks {
        let matches_kind = matches!(
            (&block, diagonal),
            (Block::Diagonal(_), true) | (Block::Full(_), false)
        );
        if !matches_kind || block.positions() != positions {
            return Err(KernelError::Tensor {
                reason: format!(
                    "block with {} positions does not fit spatial shape {spatial:?}",
                    block.positions()
                ),
            });
        }
        data.extend(block.into_vec());
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

/// Transform every block of a field.
pub fn map_field<F>(
    field: &ArrayD<f64>,
    pairing: &Pairing,
    diagonal: bool,
    out_spatial: &[usize],
    out_diagonal: bool,
    mut f: F,
) -> Result<ArrayD<f64>>
where
    F: FnMut(Example, Example, Block) -> Result<Block>,
{
    let mapped = blocks(field, pairing.lead.len(), diagonal)?
        .into_iter()
        .enumerate()
        .map(|(l, block)| {
            let (left, right) = pairing.examples(l);
            f(left, right, block)
        })
        .collect::<Result<Vec<_>>>()?;
    assemble(mapped, &pairing.lead, out_spatial, out_diagonal)
}

/// A linear map over positions, `K -> sum_t L_t K R_t^T`.
///
/// `local` maps only keep the matching-position entries of the result.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionMap {
    pub terms: Vec<Array2<f64>>,
    pub local: bool,
}

impl PositionMap {
    pub fn new(terms: Vec<Array2<f64>>) -> Self {
        Self {
            terms,
            local: false,
        }
    }

    pub fn single(matrix: Array2<f64>) -> Self {
        Self::new(vec![matrix])
    }

    pub fn identity(positions: usize) -> Self {
        Self::single(Array2::eye(positions))
    }

    /// Keep only the matching-position entries.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn out_positions(&self) -> usize {
        self.terms.first().map_or(0, |m| m.nrows())
    }

    pub fn in_positions(&self) -> usize {
        self.terms.first().map_or(0, |m| m.ncols())
    }

    /// Apply to a block correlating an example mapped by `left` with one
    /// mapped by `right`.
    pub fn apply_pair(left: &PositionMap, right: &PositionMap, block: Block) -> Result<Block> {
        if left.terms.len() != right.terms.len() {
            return Err(KernelError::Tensor {
                reason: format!(
                    "position maps with {} and {} terms",
                    left.terms.len(),
                    right.terms.len()
                ),
            });
        }
        if block.positions() != left.in_positions() || block.positions() != right.in_positions()
        {
            return Err(KernelError::shape_mismatch(
                &[left.in_positions()],
                &[block.positions()],
            ));
        }
        match block {
            Block::Full(k) => {
                let mut out = Array2::zeros((left.out_positions(), right.out_positions()));
                for (l, r) in left.terms.iter().zip(&right.terms) {
                    out = out + l.dot(&k).dot(&r.t());
                }
                if left.local || right.local {
                    let diag = out.diag().to_owned();
                    out.fill(0.0);
                    out.diag_mut().assign(&diag);
                }
                Ok(Block::Full(out))
            }
            Block::Diagonal(d) => {
                if left.out_positions() != right.out_positions() {
                    return Err(KernelError::shape_mismatch(
                        &[left.out_positions()],
                        &[right.out_positions()],
                    ));
                }
                let mut out = Array1::zeros(left.out_positions());
                for (l, r) in left.terms.iter().zip(&right.terms) {
                    out = out + (l * r).dot(&d);
                }
                Ok(Block::Diagonal(out))
            }
        }
    }

    /// An output position is masked iff every input position it reads is
    /// masked (positions reading nothing count as masked).
    pub fn propagate_mask(&self, mask: ArrayView1<'_, bool>) -> Array1<bool> {
        Array1::from_shape_fn(self.out_positions(), |i| {
            self.terms.iter().all(|m| {
                m.row(i)
                    .iter()
                    .zip(mask.iter())
                    .all(|(&w, &masked)| w == 0.0 || masked)
            })
        })
    }
}

/// Maps for every example of a kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionMaps {
    /// One map for all examples.
    Shared(PositionMap),
    /// One map per example of each operand.
    PerExample {
        first: Vec<PositionMap>,
        second: Vec<PositionMap>,
    },
}

impl PositionMaps {
    pub fn get(&self, example: Example) -> Result<&PositionMap> {
        let list = match self {
            PositionMaps::Shared(map) => return Ok(map),
            PositionMaps::PerExample { first, second } => match example.operand {
                Operand::First => first,
                Operand::Second => second,
            },
        };
        list.get(example.index).ok_or_else(|| KernelError::Tensor {
            reason: format!("no position map for {example:?}"),
        })
    }
}

/// Reorder `x` to `(batch, positions, channel)`.
pub fn to_canonical<T: Clone>(x: &ArrayD<T>, batch: usize, channel: usize) -> Result<Array3<T>> {
    let shape = Shape::new(x.shape().to_vec());
    check_roles(&shape, batch, channel)?;
    let mut order = vec![batch];
    order.extend(shape.spatial_axes(batch, channel));
    order.push(channel);
    let data: Vec<T> = x.view().permuted_axes(IxDyn(&order)).iter().cloned().collect();
    Ok(Array3::from_shape_vec(
        (shape.dims[batch], shape.positions(batch, channel), shape.dims[channel]),
        data,
    )?)
}

/// Inverse of [`to_canonical`] for a tensor of the given `shape`.
pub fn from_canonical<T: Clone>(
    x: &Array3<T>,
    shape: &Shape,
    batch: usize,
    channel: usize,
) -> Result<ArrayD<T>> {
    check_roles(shape, batch, channel)?;
    let spatial_axes = shape.spatial_axes(batch, channel);
    let mut order = vec![batch];
    order.extend(&spatial_axes);
    order.push(channel);

    let canonical_dims: Vec<usize> = order.iter().map(|&a| shape.dims[a]).collect();
    let data: Vec<T> = x.iter().cloned().collect();
    if data.len() != shape.numel() {
        return Err(KernelError::shape_mismatch(&shape.dims, x.shape()));
    }
    let canonical = ArrayD::from_shape_vec(IxDyn(&canonical_dims), data)?;

    let mut inverse = vec![0; order.len()];
    for (k, &axis) in order.iter().enumerate() {
        inverse[axis] = k;
    }
    Ok(canonical
        .permuted_axes(IxDyn(&inverse))
        .as_standard_layout()
        .into_owned())
}

fn check_roles(shape: &Shape, batch: usize, channel: usize) -> Result<()> {
    if batch == channel || batch >= shape.rank() || channel >= shape.rank() {
        return Err(KernelError::Tensor {
            reason: format!("invalid batch/channel axes ({batch}, {channel}) for shape {shape}"),
        });
    }
    Ok(())
}
