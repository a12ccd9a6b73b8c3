//! # Nested Values
//!
//! Branching networks consume and produce trees: a fan-out turns one kernel
//! into a tuple, a parallel layer maps a tuple elementwise, a fan-in merges a
//! tuple back into one value. [`Nested`] is that tree.
//!
//! ```text
//!   Leaf(k)                       one value
//!   Tuple([Leaf(a), Leaf(b)])     two branches
//!   Tuple([Leaf(a), Tuple([..])]) arbitrary nesting
//! ```

use crate::error::{KernelError, Result};

/// A leaf value or a tuple of subtrees.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested<T> {
    Leaf(T),
    Tuple(Vec<Nested<T>>),
}

impl<T> Nested<T> {
    /// Unwrap a leaf; tuples are a structure error.
    pub fn into_leaf(self) -> Result<T> {
        match self {
            Nested::Leaf(value) => Ok(value),
            Nested::Tuple(items) => Err(KernelError::Structure {
                reason: format!("expected a single value, got a tuple of {}", items.len()),
            }),
        }
    }

    /// Unwrap a tuple; leaves are a structure error.
    pub fn into_tuple(self) -> Result<Vec<Nested<T>>> {
        match self {
            Nested::Tuple(items) => Ok(items),
            Nested::Leaf(_) => Err(KernelError::Structure {
                reason: "expected a tuple, got a single value".to_string(),
            }),
        }
    }

    /// Unwrap a tuple whose items are all leaves.
    pub fn into_leaves(self) -> Result<Vec<T>> {
        self.into_tuple()?
            .into_iter()
            .map(Nested::into_leaf)
            .collect()
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Nested::Leaf(value) => Some(value),
            Nested::Tuple(_) => None,
        }
    }

    /// Same tree, borrowing its leaves.
    pub fn as_ref(&self) -> Nested<&T> {
        match self {
            Nested::Leaf(value) => Nested::Leaf(value),
            Nested::Tuple(items) => Nested::Tuple(items.iter().map(Nested::as_ref).collect()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Nested::Leaf(_))
    }

    /// Every leaf, depth first.
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Nested::Leaf(value) => out.push(value),
            Nested::Tuple(items) => items.iter().for_each(|item| item.collect_leaves(out)),
        }
    }

    /// Apply a fallible function to every leaf, keeping the structure.
    pub fn try_map<U>(self, f: &mut impl FnMut(T) -> Result<U>) -> Result<Nested<U>> {
        match self {
            Nested::Leaf(value) => Ok(Nested::Leaf(f(value)?)),
            Nested::Tuple(items) => Ok(Nested::Tuple(
                items
                    .into_iter()
                    .map(|item| item.try_map(f))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Borrowing variant of [`Nested::try_map`].
    pub fn try_map_ref<U>(&self, f: &mut impl FnMut(&T) -> Result<U>) -> Result<Nested<U>> {
        match self {
            Nested::Leaf(value) => Ok(Nested::Leaf(f(value)?)),
            Nested::Tuple(items) => Ok(Nested::Tuple(
                items
                    .iter()
                    .map(|item| item.try_map_ref(f))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Pair up two trees of identical structure.
    pub fn zip<U>(self, other: Nested<U>) -> Result<Nested<(T, U)>> {
        match (self, other) {
            (Nested::Leaf(a), Nested::Leaf(b)) => Ok(Nested::Leaf((a, b))),
            (Nested::Tuple(a), Nested::Tuple(b)) if a.len() == b.len() => Ok(Nested::Tuple(
                a.into_iter()
                    .zip(b)
                    .map(|(x, y)| x.zip(y))
                    .collect::<Result<Vec<_>>>()?,
            )),
            _ => Err(KernelError::Structure {
                reason: "input trees have different structure".to_string(),
            }),
        }
    }
}

impl<T> From<T> for Nested<T> {
    fn from(value: T) -> Self {
        Nested::Leaf(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Nested<i32> {
        Nested::Tuple(vec![
            Nested::Leaf(1),
            Nested::Tuple(vec![Nested::Leaf(2), Nested::Leaf(3)]),
        ])
    }

    #[test]
    fn test_leaves_depth_first() {
        assert_eq!(tree().leaves(), vec![&1, &2, &3]);
    }

    #[test]
    fn test_try_map_keeps_structure() {
        let doubled = tree().try_map(&mut |x| Ok(x * 2)).unwrap();
        assert_eq!(doubled.leaves(), vec![&2, &4, &6]);
        assert!(!doubled.is_leaf());
    }

    #[test]
    fn test_try_map_propagates_error() {
        let result = tree().try_map(&mut |x| {
            if x == 2 {
                Err(KernelError::Structure {
                    reason: "two".into(),
                })
            } else {
                Ok(x)
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_zip_requires_same_structure() {
        assert!(tree().zip(tree()).is_ok());
        assert!(tree().zip(Nested::Leaf(0)).is_err());
    }

    #[test]
    fn test_into_leaf() {
        assert_eq!(Nested::Leaf(7).into_leaf().unwrap(), 7);
        assert!(tree().into_leaf().is_err());
    }
}
