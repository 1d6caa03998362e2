//! Symbolic function kernels built from expression strings.
//!
//! A [`SymbolicKernel`] is the concrete, fully capable implementation of the
//! [`Kernel`](crate::function::Kernel) contract: input slots are ordered lists
//! of scalar variables, output slots are ordered lists of expressions over
//! those variables. Expressions are parsed with evalexpr, converted into the
//! crate's AST, simplified, and compiled into stack programs.
//!
//! The kernel derives structural Jacobian sparsity from AST variable
//! dependence and constructs Jacobian kernels by symbolic differentiation, so
//! functions built from it support the full sensitivity machinery.
//!
//! # Example
//!
//! ```
//! use daesens::symbolic::SymbolicKernel;
//!
//! let kernel = SymbolicKernel::builder("rates")
//!     .input_slot("x", &["s", "p"])
//!     .input_slot("k", &["vmax", "km"])
//!     .output_slot("rate", &["(vmax * s) / (km + s)", "-(vmax * s) / (km + s)"])
//!     .build()
//!     .unwrap();
//! assert_eq!(kernel.n_vars(), 4);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use evalexpr::build_operator_tree;
use itertools::Itertools;
use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::convert::{build_ast, expression_variables};
use crate::errors::FunctionError;
use crate::expr::Expr;
use crate::function::Kernel;
use crate::program::SlotProgram;
use crate::sparsity::SparsityPattern;

#[derive(Debug, Clone)]
pub(crate) struct InputSlot {
    pub name: String,
    pub vars: Vec<String>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputSlot {
    pub name: String,
    /// Entry expressions in column-major order
    pub asts: Vec<Box<Expr>>,
    pub program: SlotProgram,
    pub rows: usize,
    pub cols: usize,
}

/// Builder for [`SymbolicKernel`]: collect named slots, then `build()`.
pub struct SymbolicKernelBuilder {
    name: String,
    inputs: Vec<(String, Vec<String>)>,
    outputs: Vec<(String, Vec<String>)>,
}

impl SymbolicKernelBuilder {
    /// Adds an input slot holding the given scalar variables, in order.
    pub fn input_slot(mut self, name: &str, vars: &[&str]) -> Self {
        self.inputs
            .push((name.to_string(), vars.iter().map(|v| v.to_string()).collect()));
        self
    }

    /// Adds an output slot evaluating the given expressions, in order.
    pub fn output_slot(mut self, name: &str, exprs: &[&str]) -> Self {
        self.outputs
            .push((name.to_string(), exprs.iter().map(|e| e.to_string()).collect()));
        self
    }

    /// Parses, validates and compiles the kernel.
    pub fn build(self) -> Result<SymbolicKernel, FunctionError> {
        let (variable_map, input_slots) = SymbolicKernel::layout(&self.name, &self.inputs)?;

        let mut output_slots = Vec::with_capacity(self.outputs.len());
        for (slot_name, exprs) in &self.outputs {
            let mut asts = Vec::with_capacity(exprs.len());
            for text in exprs {
                let node = build_operator_tree(text)?;

                // Validate variables before conversion, for a better diagnostic
                for var in expression_variables(&node) {
                    if !variable_map.contains_key(&var) {
                        return Err(FunctionError::UnknownVariable {
                            function: self.name.clone(),
                            variable: var,
                        });
                    }
                }

                let ast = build_ast(&node, &variable_map)?;
                asts.push(ast.simplify());
            }
            let program = SlotProgram::compile(&asts);
            output_slots.push(OutputSlot {
                name: slot_name.clone(),
                rows: asts.len(),
                cols: 1,
                asts,
                program,
            });
        }

        Ok(SymbolicKernel {
            name: self.name,
            input_slots,
            output_slots,
            n_vars: variable_map.len(),
            variable_map,
        })
    }
}

/// A function kernel whose outputs are symbolic expressions of its inputs.
#[derive(Debug, Clone)]
pub struct SymbolicKernel {
    name: String,
    input_slots: Vec<InputSlot>,
    output_slots: Vec<OutputSlot>,
    variable_map: HashMap<String, u32>,
    n_vars: usize,
}

impl SymbolicKernel {
    /// Starts a builder for a kernel with the given name.
    pub fn builder(name: impl Into<String>) -> SymbolicKernelBuilder {
        SymbolicKernelBuilder {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Computes the flat variable layout of a slot list, rejecting duplicates.
    pub(crate) fn layout(
        name: &str,
        inputs: &[(String, Vec<String>)],
    ) -> Result<(HashMap<String, u32>, Vec<InputSlot>), FunctionError> {
        let mut variable_map = HashMap::new();
        let mut input_slots = Vec::with_capacity(inputs.len());
        let mut offset = 0usize;
        for (slot_name, vars) in inputs {
            for (pos, var) in vars.iter().enumerate() {
                if variable_map
                    .insert(var.clone(), (offset + pos) as u32)
                    .is_some()
                {
                    return Err(FunctionError::DuplicateVariable {
                        function: name.to_string(),
                        variable: var.clone(),
                    });
                }
            }
            input_slots.push(InputSlot {
                name: slot_name.clone(),
                vars: vars.clone(),
                offset,
            });
            offset += vars.len();
        }
        Ok((variable_map, input_slots))
    }

    /// Builds a kernel from already-constructed ASTs.
    ///
    /// Entry ASTs of each output slot are given in column-major order and must
    /// be indexed against the layout of `inputs`. Used by the integrator to
    /// assemble derived systems (Newton Jacobians, the backward problem)
    /// without a detour through strings.
    pub(crate) fn from_parts(
        name: String,
        inputs: Vec<(String, Vec<String>)>,
        outputs: Vec<(String, Vec<Box<Expr>>, usize, usize)>,
    ) -> Result<SymbolicKernel, FunctionError> {
        let (variable_map, input_slots) = SymbolicKernel::layout(&name, &inputs)?;
        let output_slots = outputs
            .into_iter()
            .map(|(slot_name, asts, rows, cols)| {
                debug_assert_eq!(asts.len(), rows * cols);
                let program = SlotProgram::compile(&asts);
                OutputSlot {
                    name: slot_name,
                    asts,
                    program,
                    rows,
                    cols,
                }
            })
            .collect();
        Ok(SymbolicKernel {
            name,
            input_slots,
            output_slots,
            n_vars: variable_map.len(),
            variable_map,
        })
    }

    /// Total number of scalar variables across all input slots.
    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    /// The map from variable name to flat input index.
    pub fn variables(&self) -> &HashMap<String, u32> {
        &self.variable_map
    }

    /// Flat index of a variable, if it exists.
    pub fn var_index(&self, name: &str) -> Option<u32> {
        self.variable_map.get(name).copied()
    }

    /// Variable names in flat index order.
    pub fn sorted_variables(&self) -> Vec<String> {
        self.variable_map
            .iter()
            .sorted_by_key(|(_, idx)| **idx)
            .map(|(var, _)| var.clone())
            .collect()
    }

    pub(crate) fn input_layout(&self) -> Vec<(String, Vec<String>)> {
        self.input_slots
            .iter()
            .map(|s| (s.name.clone(), s.vars.clone()))
            .collect()
    }

    /// Fresh symbolic placeholders for every input slot, shaped like the
    /// slots. Derived kernels evaluate over these instead of numeric values.
    pub fn symbolic_input(&self) -> Vec<Vec<Box<Expr>>> {
        self.input_slots
            .iter()
            .map(|slot| {
                slot.vars
                    .iter()
                    .enumerate()
                    .map(|(j, var)| Expr::var(var.clone(), (slot.offset + j) as u32))
                    .collect()
            })
            .collect()
    }

    pub(crate) fn output_asts(&self, oind: usize) -> &[Box<Expr>] {
        &self.output_slots[oind].asts
    }

    /// Gathers the per-slot input matrices into the flat variable vector.
    fn gather(&self, inputs: &[&DMatrix<f64>], flat: &mut [f64]) -> Result<(), FunctionError> {
        for (slot, input) in self.input_slots.iter().zip(inputs) {
            if input.len() != slot.vars.len() {
                return Err(FunctionError::ShapeMismatch {
                    function: self.name.clone(),
                    what: "input",
                    expected: slot.vars.len(),
                    got: input.len(),
                });
            }
            flat[slot.offset..slot.offset + slot.vars.len()].copy_from_slice(input.as_slice());
        }
        Ok(())
    }

    /// Batched primal evaluation over many flat input sets, in parallel.
    ///
    /// Each input set holds all variables in flat order; each result holds the
    /// concatenated output slots.
    pub fn eval_parallel(
        &self,
        input_sets: &[Vec<f64>],
    ) -> Result<Vec<Vec<f64>>, FunctionError> {
        for set in input_sets {
            if set.len() != self.n_vars {
                return Err(FunctionError::ShapeMismatch {
                    function: self.name.clone(),
                    what: "input",
                    expected: self.n_vars,
                    got: set.len(),
                });
            }
        }

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        let chunk_size = (input_sets.len() / (num_threads * 4)).max(1);
        let n_out: usize = self.output_slots.iter().map(|s| s.rows * s.cols).sum();

        Ok(input_sets
            .par_chunks(chunk_size)
            .map(|chunk| {
                let mut stack = Vec::new();
                chunk
                    .iter()
                    .map(|flat| {
                        let mut results = vec![0.0; n_out];
                        let mut start = 0;
                        for slot in &self.output_slots {
                            let end = start + slot.rows * slot.cols;
                            slot.program
                                .eval_into(flat, &mut results[start..end], &mut stack);
                            start = end;
                        }
                        results
                    })
                    .collect::<Vec<_>>()
            })
            .flatten()
            .collect())
    }
}

impl Kernel for SymbolicKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "SymbolicKernel"
    }

    fn num_inputs(&self) -> usize {
        self.input_slots.len()
    }

    fn num_outputs(&self) -> usize {
        self.output_slots.len()
    }

    fn input_shape(&self, iind: usize) -> (usize, usize) {
        (self.input_slots[iind].vars.len(), 1)
    }

    fn output_shape(&self, oind: usize) -> (usize, usize) {
        let slot = &self.output_slots[oind];
        (slot.rows, slot.cols)
    }

    fn eval(
        &self,
        inputs: &[&DMatrix<f64>],
        outputs: &mut [&mut DMatrix<f64>],
    ) -> Result<(), FunctionError> {
        let mut flat = vec![0.0; self.n_vars];
        self.gather(inputs, &mut flat)?;

        let mut stack = Vec::new();
        for (slot, out) in self.output_slots.iter().zip(outputs.iter_mut()) {
            slot.program
                .eval_into(&flat, out.as_mut_slice(), &mut stack);
            // A non-finite value poisons the whole step; report it as
            // recoverable so a driving solver can shrink the step and retry.
            if out.iter().any(|v| !v.is_finite()) {
                return Err(FunctionError::Recoverable {
                    function: self.name.clone(),
                    signal: 1,
                });
            }
        }
        Ok(())
    }

    fn supports_custom_jac_sparsity(&self) -> bool {
        true
    }

    fn jac_sparsity(&self, iind: usize, oind: usize) -> Option<SparsityPattern> {
        let in_slot = &self.input_slots[iind];
        let out_slot = &self.output_slots[oind];
        let mut entries = Vec::new();
        for (k, ast) in out_slot.asts.iter().enumerate() {
            for j in 0..in_slot.vars.len() {
                if ast.depends_on((in_slot.offset + j) as u32) {
                    entries.push((k, j));
                }
            }
        }
        Some(SparsityPattern::from_entries(
            out_slot.rows * out_slot.cols,
            in_slot.vars.len(),
            entries,
        ))
    }

    fn jacobian_kernel(
        &self,
        iind: usize,
        oind: usize,
    ) -> Result<Option<Arc<dyn Kernel>>, FunctionError> {
        let in_slot = &self.input_slots[iind];
        let out_slot = &self.output_slots[oind];
        let numel = out_slot.rows * out_slot.cols;

        // Column-major entries of the (numel x n_in_vars) block
        let mut derivs = Vec::with_capacity(numel * in_slot.vars.len());
        for var in &in_slot.vars {
            for ast in &out_slot.asts {
                derivs.push(ast.derivative(var).simplify());
            }
        }

        if derivs.iter().all(|d| d.is_zero()) {
            return Ok(None);
        }

        let kernel = SymbolicKernel::from_parts(
            format!("jac_{}_{}_{}", self.name, out_slot.name, in_slot.name),
            self.input_layout(),
            vec![(
                format!("jac_{}_{}", out_slot.name, in_slot.name),
                derivs,
                numel,
                in_slot.vars.len(),
            )],
        )?;
        Ok(Some(Arc::new(kernel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::eval_single_output;

    fn matrix(values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_column_slice(values.len(), 1, values)
    }

    #[test]
    fn test_build_and_eval() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x", "y", "z"])
            .output_slot("f", &["2*x + y", "x^2 + z"])
            .build()
            .unwrap();

        let x = matrix(&[1.0, 2.0, 3.0]);
        let ins = [&x];
        let mut out = DMatrix::zeros(2, 1);
        {
            let mut outs = [&mut out];
            kernel.eval(&ins, &mut outs).unwrap();
        }
        assert_eq!(out[(0, 0)], 4.0);
        assert_eq!(out[(1, 0)], 4.0);
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let err = SymbolicKernel::builder("sys")
            .input_slot("a", &["x"])
            .input_slot("b", &["x"])
            .output_slot("f", &["x"])
            .build()
            .unwrap_err();
        assert!(matches!(err, FunctionError::DuplicateVariable { .. }));
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let err = SymbolicKernel::builder("sys")
            .input_slot("x", &["x"])
            .output_slot("f", &["x + q"])
            .build()
            .unwrap_err();
        match err {
            FunctionError::UnknownVariable { variable, .. } => assert_eq!(variable, "q"),
            other => panic!("expected UnknownVariable, got {other:?}"),
        }
    }

    #[test]
    fn test_jacobian_kernel_values() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x", "y"])
            .output_slot("f", &["x^2 * y", "x * y^2"])
            .build()
            .unwrap();

        let jac = kernel.jacobian_kernel(0, 0).unwrap().unwrap();
        let x = matrix(&[2.0, 3.0]);
        let ins = [&x];
        let value = eval_single_output(jac.as_ref(), &ins).unwrap();
        // [[2xy, x^2], [y^2, 2xy]] at (2, 3)
        assert_eq!(value[(0, 0)], 12.0);
        assert_eq!(value[(0, 1)], 4.0);
        assert_eq!(value[(1, 0)], 9.0);
        assert_eq!(value[(1, 1)], 12.0);
    }

    #[test]
    fn test_jacobian_kernel_of_independent_block_is_none() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x"])
            .input_slot("u", &["u"])
            .output_slot("f", &["x^2"])
            .build()
            .unwrap();
        assert!(kernel.jacobian_kernel(1, 0).unwrap().is_none());
    }

    #[test]
    fn test_structural_sparsity() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x", "y"])
            .output_slot("f", &["x^2", "x + y"])
            .build()
            .unwrap();
        let sp = kernel.jac_sparsity(0, 0).unwrap();
        // f0 depends on x only; f1 on both
        assert!(sp.contains(0, 0));
        assert!(!sp.contains(0, 1));
        assert!(sp.contains(1, 0));
        assert!(sp.contains(1, 1));
    }

    #[test]
    fn test_non_finite_evaluation_is_recoverable() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x"])
            .output_slot("f", &["ln(x)"])
            .build()
            .unwrap();
        let x = matrix(&[-1.0]);
        let ins = [&x];
        let mut out = DMatrix::zeros(1, 1);
        let err = {
            let mut outs = [&mut out];
            kernel.eval(&ins, &mut outs).unwrap_err()
        };
        assert!(matches!(err, FunctionError::Recoverable { signal: 1, .. }));
    }

    #[test]
    fn test_eval_parallel() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x", "y"])
            .output_slot("f", &["x + y", "x * y"])
            .build()
            .unwrap();
        let sets = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        let results = kernel.eval_parallel(&sets).unwrap();
        assert_eq!(results, vec![
            vec![3.0, 2.0],
            vec![7.0, 12.0],
            vec![11.0, 30.0],
        ]);
    }

    #[test]
    fn test_symbolic_input_mirrors_slot_layout() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("x", &["x0", "x1"])
            .input_slot("u", &["u"])
            .output_slot("f", &["x0 + x1 + u"])
            .build()
            .unwrap();
        let symbolic = kernel.symbolic_input();
        assert_eq!(symbolic.len(), 2);
        assert_eq!(symbolic[0].len(), 2);
        assert_eq!(*symbolic[1][0], *Expr::var("u", 2));
    }

    #[test]
    fn test_sorted_variables_follow_slot_order() {
        let kernel = SymbolicKernel::builder("sys")
            .input_slot("b", &["beta"])
            .input_slot("a", &["alpha"])
            .output_slot("f", &["alpha + beta"])
            .build()
            .unwrap();
        assert_eq!(kernel.sorted_variables(), vec!["beta", "alpha"]);
        assert_eq!(kernel.var_index("alpha"), Some(1));
    }
}
