//! # Diagonal-State Lattice
//!
//! Covariance tensors are stored either *full* (a matrix over pairs of
//! batch entries or positions) or *diagonal* (only matching pairs). Each
//! layer declares, per dimension class, what it needs from its input and
//! what it guarantees about its output:
//!
//! ```text
//!   input   Yes    a diagonal-only input is enough
//!           Maybe  enough iff the input's off-diagonal entries are zero
//!           No     the full matrix is required
//!
//!   output  Yes    off-diagonal entries of the output are zero
//!           Maybe  zero iff they were zero at the input
//!           No     may be non-zero
//! ```
//!
//! Sequential composition `a >> b` folds two declarations into the
//! declaration of the composite. It is associative with `(Yes, Maybe)` as a
//! two-sided identity, so a serial stack can be folded in any grouping.
//! Parallel branches combine with `&` (pointwise minimum).

use std::fmt;
use std::ops::{BitAnd, Shl, Shr};

use crate::error::{KernelError, Result};

/// Three-valued truth, ordered `No < Maybe < Yes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tristate {
    No,
    Maybe,
    Yes,
}

impl Tristate {
    /// All values, in ascending order.
    pub const ALL: [Tristate; 3] = [Tristate::No, Tristate::Maybe, Tristate::Yes];
}

impl BitAnd for Tristate {
    type Output = Tristate;

    fn bitand(self, rhs: Tristate) -> Tristate {
        self.min(rhs)
    }
}

/// Which dimensions a [`Diagonal`] descriptor talks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimClass {
    Batch,
    Spatial,
}

impl fmt::Display for DimClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimClass::Batch => write!(f, "batch"),
            DimClass::Spatial => write!(f, "spatial"),
        }
    }
}

/// Input requirement and output guarantee for one dimension class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Diagonal {
    pub input: Tristate,
    pub output: Tristate,
}

impl Diagonal {
    /// Neutral element of `>>`: accepts anything, changes nothing.
    pub const IDENTITY: Diagonal = Diagonal {
        input: Tristate::Yes,
        output: Tristate::Maybe,
    };

    /// Full input required, full output produced.
    pub const FULL: Diagonal = Diagonal {
        input: Tristate::No,
        output: Tristate::No,
    };

    pub fn new(input: Tristate, output: Tristate) -> Self {
        Self { input, output }
    }

    /// Declaration of `self` followed by `next`.
    pub fn then(self, next: Diagonal) -> Diagonal {
        use Tristate::*;

        let input = match next.input {
            Yes => self.input,
            No => No,
            Maybe => match self.output {
                Yes => self.input,
                Maybe => self.input.min(Maybe),
                No => No,
            },
        };
        let output = match next.output {
            Maybe => self.output,
            other => other,
        };
        Diagonal { input, output }
    }

    /// Whether a kernel already compressed along this class may enter a layer
    /// declaring `self`, given the guarantee of everything composed before it.
    pub fn accepts_diagonal(&self, prefix: &Diagonal) -> bool {
        match self.input {
            Tristate::Yes => true,
            Tristate::Maybe => prefix.output != Tristate::No,
            Tristate::No => false,
        }
    }

    /// Decide the storage of the raw input kernel for this class.
    ///
    /// Raw inputs have non-zero off-diagonal entries, so only `input == Yes`
    /// permits compression. With no request, spatial dimensions compress when
    /// nothing is lost at the output as well; batch dimensions whenever the
    /// network allows it.
    pub fn resolve(&self, requested: Option<bool>, class: DimClass, layer: &str) -> Result<bool> {
        let allowed = self.input == Tristate::Yes;
        match requested {
            Some(true) if !allowed => Err(KernelError::DiagonalMismatch {
                layer: layer.to_string(),
                reason: format!(
                    "diagonal_{class} = true requested, but the network needs full {class} covariances"
                ),
            }),
            Some(flag) => Ok(flag),
            None => Ok(match class {
                DimClass::Batch => allowed,
                DimClass::Spatial => allowed && self.output == Tristate::Yes,
            }),
        }
    }
}

impl Default for Diagonal {
    fn default() -> Self {
        Diagonal {
            input: Tristate::Yes,
            output: Tristate::No,
        }
    }
}

/// `a >> b`: `a` runs first.
impl Shr for Diagonal {
    type Output = Diagonal;

    fn shr(self, rhs: Diagonal) -> Diagonal {
        self.then(rhs)
    }
}

/// `b << a`: the same composition read right to left.
impl Shl for Diagonal {
    type Output = Diagonal;

    fn shl(self, rhs: Diagonal) -> Diagonal {
        rhs.then(self)
    }
}

/// Parallel branches: the weakest requirement and guarantee win.
impl BitAnd for Diagonal {
    type Output = Diagonal;

    fn bitand(self, rhs: Diagonal) -> Diagonal {
        Diagonal {
            input: self.input & rhs.input,
            output: self.output & rhs.output,
        }
    }
}

/// One [`Diagonal`] per dimension class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DiagonalReqs {
    pub batch: Diagonal,
    pub spatial: Diagonal,
}

impl DiagonalReqs {
    pub const IDENTITY: DiagonalReqs = DiagonalReqs {
        batch: Diagonal::IDENTITY,
        spatial: Diagonal::IDENTITY,
    };

    pub fn new(batch: Diagonal, spatial: Diagonal) -> Self {
        Self { batch, spatial }
    }

    /// Same spatial declaration, identity on the batch class.
    pub fn spatial(spatial: Diagonal) -> Self {
        Self {
            batch: Diagonal::IDENTITY,
            spatial,
        }
    }

    pub fn get(&self, class: DimClass) -> Diagonal {
        match class {
            DimClass::Batch => self.batch,
            DimClass::Spatial => self.spatial,
        }
    }

    /// Resolve `(diagonal_batch, diagonal_spatial)` for the raw input kernel.
    pub fn resolve(
        &self,
        batch: Option<bool>,
        spatial: Option<bool>,
        layer: &str,
    ) -> Result<(bool, bool)> {
        Ok((
            self.batch.resolve(batch, DimClass::Batch, layer)?,
            self.spatial.resolve(spatial, DimClass::Spatial, layer)?,
        ))
    }
}

impl Shr for DiagonalReqs {
    type Output = DiagonalReqs;

    fn shr(self, rhs: DiagonalReqs) -> DiagonalReqs {
        DiagonalReqs {
            batch: self.batch >> rhs.batch,
            spatial: self.spatial >> rhs.spatial,
        }
    }
}

impl Shl for DiagonalReqs {
    type Output = DiagonalReqs;

    fn shl(self, rhs: DiagonalReqs) -> DiagonalReqs {
        rhs >> self
    }
}

impl BitAnd for DiagonalReqs {
    type Output = DiagonalReqs;

    fn bitand(self, rhs: DiagonalReqs) -> DiagonalReqs {
        DiagonalReqs {
            batch: self.batch & rhs.batch,
            spatial: self.spatial & rhs.spatial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Tristate::*;

    fn all_diagonals() -> Vec<Diagonal> {
        let mut out = Vec::new();
        for input in Tristate::ALL {
            for output in Tristate::ALL {
                out.push(Diagonal::new(input, output));
            }
        }
        out
    }

    #[test]
    fn test_associativity_exhaustive() {
        for a in all_diagonals() {
            for b in all_diagonals() {
                for c in all_diagonals() {
                    let forward_left = (a >> b) >> c;
                    let forward_right = a >> (b >> c);
                    assert_eq!(forward_left, forward_right, "{a:?} {b:?} {c:?}");

                    let backward_left = (c << b) << a;
                    let backward_right = c << (b << a);
                    assert_eq!(backward_left, backward_right, "{a:?} {b:?} {c:?}");

                    assert_eq!(forward_left, backward_left);
                }
            }
        }
    }

    #[test]
    fn test_identity_is_two_sided() {
        for a in all_diagonals() {
            assert_eq!(a >> Diagonal::IDENTITY, a);
            assert_eq!(Diagonal::IDENTITY >> a, a);
        }
    }

    #[test]
    fn test_full_requirement_dominates() {
        let diag_ok = Diagonal::new(Yes, Yes);
        assert_eq!((diag_ok >> Diagonal::FULL).input, No);
        assert_eq!((Diagonal::FULL >> diag_ok).output, Yes);
    }

    #[test]
    fn test_maybe_input_after_zeroing_layer() {
        // A layer guaranteeing zero off-diagonals lets a Maybe-input layer
        // keep the upstream requirement.
        let zeroing = Diagonal::new(Yes, Yes);
        let pool = Diagonal::new(Maybe, No);
        assert_eq!((zeroing >> pool).input, Yes);

        let biased = Diagonal::new(Yes, No);
        assert_eq!((biased >> pool).input, No);
    }

    #[test]
    fn test_parallel_takes_minimum() {
        let a = Diagonal::new(Yes, Maybe);
        let b = Diagonal::new(Maybe, Yes);
        assert_eq!(a & b, Diagonal::new(Maybe, Maybe));
    }

    #[test]
    fn test_resolve_defaults() {
        let dense = Diagonal::new(Yes, No);
        assert!(!dense.resolve(None, DimClass::Spatial, "Dense").unwrap());
        assert!(dense.resolve(None, DimClass::Batch, "Dense").unwrap());

        let local = Diagonal::new(Yes, Yes);
        assert!(local.resolve(None, DimClass::Spatial, "ConvLocal").unwrap());
    }

    #[test]
    fn test_resolve_rejects_impossible_request() {
        let pool = Diagonal::new(Maybe, No);
        let err = pool
            .resolve(Some(true), DimClass::Spatial, "AvgPool")
            .unwrap_err();
        assert!(matches!(err, KernelError::DiagonalMismatch { .. }));
        assert!(!pool.resolve(Some(false), DimClass::Spatial, "AvgPool").unwrap());
    }

    #[test]
    fn test_accepts_diagonal() {
        let pool = Diagonal::new(Maybe, No);
        assert!(pool.accepts_diagonal(&Diagonal::new(Yes, Yes)));
        assert!(!pool.accepts_diagonal(&Diagonal::new(Yes, No)));
        assert!(!Diagonal::FULL.accepts_diagonal(&Diagonal::IDENTITY));
        assert!(Diagonal::IDENTITY.accepts_diagonal(&Diagonal::FULL));
    }
}
