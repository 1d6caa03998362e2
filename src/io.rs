//! Per-slot input/output storage for the function abstraction.
//!
//! Each input and output slot of a function owns one [`FunctionIo`]: the primal
//! value plus one buffer per configured forward and adjoint sensitivity
//! direction. Direction buffers are sized during `Function::init()` and never
//! resized afterwards.

use nalgebra::DMatrix;

/// Value and sensitivity storage for one input or output slot.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionIo {
    /// Primal value
    pub value: DMatrix<f64>,
    /// Forward sensitivity directions, one buffer per direction
    pub fwd: Vec<DMatrix<f64>>,
    /// Adjoint sensitivity directions, one buffer per direction
    pub adj: Vec<DMatrix<f64>>,
}

impl FunctionIo {
    /// Creates a zero-valued slot of the given shape with no direction storage.
    pub fn new(rows: usize, cols: usize) -> Self {
        FunctionIo {
            value: DMatrix::zeros(rows, cols),
            fwd: Vec::new(),
            adj: Vec::new(),
        }
    }

    /// Sizes the direction storage. Only called during `init()`.
    pub fn resize_directions(&mut self, nfwd: usize, nadj: usize) {
        let (rows, cols) = self.value.shape();
        self.fwd = (0..nfwd).map(|_| DMatrix::zeros(rows, cols)).collect();
        self.adj = (0..nadj).map(|_| DMatrix::zeros(rows, cols)).collect();
    }

    /// Number of scalar entries in the slot.
    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_storage_sized_at_init() {
        let mut io = FunctionIo::new(3, 1);
        assert!(io.fwd.is_empty());
        assert!(io.adj.is_empty());

        io.resize_directions(2, 1);
        assert_eq!(io.fwd.len(), 2);
        assert_eq!(io.adj.len(), 1);
        assert_eq!(io.fwd[0].shape(), (3, 1));
        assert_eq!(io.numel(), 3);
    }
}
