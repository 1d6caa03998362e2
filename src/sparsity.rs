//! Jacobian block sparsity patterns.
//!
//! A sparsity pattern records the structurally nonzero positions of a Jacobian
//! block. Patterns are immutable once constructed; the function abstraction
//! memoizes one pattern per (output, input) pair. A pattern with no entries is
//! the canonical "no dependency" marker.

/// The set of structurally nonzero positions of an `nrow x ncol` matrix.
///
/// Entries are stored sorted in row-major order and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    nrow: usize,
    ncol: usize,
    entries: Vec<(usize, usize)>,
}

impl SparsityPattern {
    /// A fully dense pattern.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let mut entries = Vec::with_capacity(nrow * ncol);
        for r in 0..nrow {
            for c in 0..ncol {
                entries.push((r, c));
            }
        }
        SparsityPattern {
            nrow,
            ncol,
            entries,
        }
    }

    /// The canonical "no dependency" pattern: correct shape, zero entries.
    pub fn empty(nrow: usize, ncol: usize) -> Self {
        SparsityPattern {
            nrow,
            ncol,
            entries: Vec::new(),
        }
    }

    /// Builds a pattern from (row, col) positions. Entries are sorted and
    /// deduplicated; positions outside the shape are rejected.
    pub fn from_entries(nrow: usize, ncol: usize, mut entries: Vec<(usize, usize)>) -> Self {
        entries.retain(|&(r, c)| r < nrow && c < ncol);
        entries.sort_unstable();
        entries.dedup();
        SparsityPattern {
            nrow,
            ncol,
            entries,
        }
    }

    /// Number of rows.
    pub fn nrow(&self) -> usize {
        self.nrow
    }

    /// Number of columns.
    pub fn ncol(&self) -> usize {
        self.ncol
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    /// True if the pattern has no structural nonzeros (no dependency).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if every position is a structural nonzero.
    pub fn is_dense(&self) -> bool {
        self.entries.len() == self.nrow * self.ncol
    }

    /// True if (row, col) is a structural nonzero.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.entries.binary_search(&(row, col)).is_ok()
    }

    /// Iterates the structural nonzeros in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.entries.iter().copied()
    }
}
