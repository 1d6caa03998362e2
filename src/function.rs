//! The polymorphic function abstraction.
//!
//! A [`Function`] wraps a [`Kernel`] (the actual evaluation core) together with
//! per-slot [`FunctionIo`] storage, a memoized Jacobian sparsity table and an
//! optional cache of constructed Jacobian kernels. The workflow is:
//!
//! 1. construct with a kernel and [`FunctionOptions`],
//! 2. call [`init`](Function::init) exactly once (allocates slots, direction
//!    storage and the sparsity table),
//! 3. set inputs, call [`evaluate`](Function::evaluate), read outputs and
//!    sensitivities, or derive new functions with
//!    [`jacobian`](Function::jacobian).
//!
//! Sensitivity propagation is sparsity-aware: forward directions compute
//! `fwd_sens[o] = Σ_i J_oi · fwd_seed[i]` and adjoint directions compute
//! `adj_sens[i] = Σ_o J_oiᵀ · adj_seed[o]`, skipping structurally empty blocks.
//!
//! # Example
//!
//! ```
//! use daesens::function::{Function, FunctionOptions};
//! use daesens::symbolic::SymbolicKernel;
//! use std::sync::Arc;
//!
//! let kernel = SymbolicKernel::builder("square")
//!     .input_slot("x", &["x"])
//!     .output_slot("y", &["x^2"])
//!     .build()
//!     .unwrap();
//!
//! let mut f = Function::new(Arc::new(kernel), FunctionOptions::default());
//! f.init().unwrap();
//! f.set_input(0, &[3.0]).unwrap();
//! f.evaluate(0, 0).unwrap();
//! assert_eq!(f.output(0).unwrap()[(0, 0)], 9.0);
//! ```

use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use colored::Colorize;
use nalgebra::{DMatrix, DVector};

use crate::errors::FunctionError;
use crate::io::FunctionIo;
use crate::sparsity::SparsityPattern;

/// Options recognized by the function abstraction.
#[derive(Debug, Clone)]
pub struct FunctionOptions {
    /// Treat the function as sparse (use structural sparsity where available)
    pub sparse: bool,
    /// Number of forward sensitivity directions allocated at init
    pub number_of_fwd_dir: usize,
    /// Number of adjoint sensitivity directions allocated at init
    pub number_of_adj_dir: usize,
    /// Verbose evaluation, for debugging
    pub verbose: bool,
    /// Keep references to constructed Jacobian kernels in order to avoid
    /// building identical Jacobians multiple times
    pub store_jacobians: bool,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        FunctionOptions {
            sparse: true,
            number_of_fwd_dir: 1,
            number_of_adj_dir: 1,
            verbose: false,
            store_jacobians: false,
        }
    }
}

/// A typed statistic value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
}

impl StatValue {
    /// The value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatValue::Int(v) => Some(*v),
            StatValue::Float(_) => None,
        }
    }

    /// The value as a float; integers are widened.
    pub fn as_float(&self) -> f64 {
        match self {
            StatValue::Int(v) => *v as f64,
            StatValue::Float(v) => *v,
        }
    }
}

/// A dictionary of named statistics, populated by evaluate/advance-type calls.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    values: HashMap<String, StatValue>,
}

impl Stats {
    pub fn set_int(&mut self, name: &str, value: i64) {
        self.values.insert(name.to_string(), StatValue::Int(value));
    }

    pub fn set_float(&mut self, name: &str, value: f64) {
        self.values
            .insert(name.to_string(), StatValue::Float(value));
    }

    pub fn get(&self, name: &str) -> Option<StatValue> {
        self.values.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// The polymorphic evaluation core behind a [`Function`].
///
/// Implementations provide slot shapes and primal evaluation; the optional
/// capabilities (custom Jacobian sparsity, symbolic Jacobian construction,
/// Hessians) are gated by flags so callers can check before dispatch instead
/// of relying on a throwing default.
pub trait Kernel: Send + Sync {
    /// The function's name, carried into diagnostics.
    fn name(&self) -> &str;

    /// A short label for the concrete kernel type, used in error messages.
    fn kind(&self) -> &'static str {
        "Kernel"
    }

    fn num_inputs(&self) -> usize;
    fn num_outputs(&self) -> usize;

    /// Shape (rows, cols) of an input slot.
    fn input_shape(&self, iind: usize) -> (usize, usize);

    /// Shape (rows, cols) of an output slot.
    fn output_shape(&self, oind: usize) -> (usize, usize);

    /// Evaluates all outputs from the given inputs.
    fn eval(
        &self,
        inputs: &[&DMatrix<f64>],
        outputs: &mut [&mut DMatrix<f64>],
    ) -> Result<(), FunctionError>;

    /// True if the kernel computes structural Jacobian sparsity itself.
    fn supports_custom_jac_sparsity(&self) -> bool {
        false
    }

    /// True if the kernel can construct Hessian kernels.
    fn supports_hessian(&self) -> bool {
        false
    }

    /// Structural sparsity of d output(oind) / d input(iind), or `None` to fall
    /// back to the dense default.
    fn jac_sparsity(&self, _iind: usize, _oind: usize) -> Option<SparsityPattern> {
        None
    }

    /// Constructs a kernel evaluating the Jacobian block d output(oind) /
    /// d input(iind) as a single matrix output over the same inputs. `None`
    /// means the block is structurally null.
    fn jacobian_kernel(
        &self,
        _iind: usize,
        _oind: usize,
    ) -> Result<Option<Arc<dyn Kernel>>, FunctionError> {
        Err(FunctionError::Unsupported {
            function: self.name().to_string(),
            kind: self.kind(),
            capability: "jacobian",
        })
    }

    /// Constructs a Hessian kernel. Only specialized kernels override this.
    fn hessian_kernel(&self, _iind: usize, _oind: usize) -> Result<Arc<dyn Kernel>, FunctionError> {
        Err(FunctionError::Unsupported {
            function: self.name().to_string(),
            kind: self.kind(),
            capability: "hessian",
        })
    }
}

/// Evaluates a single-output kernel into a freshly allocated matrix.
pub(crate) fn eval_single_output(
    kernel: &dyn Kernel,
    inputs: &[&DMatrix<f64>],
) -> Result<DMatrix<f64>, FunctionError> {
    let (rows, cols) = kernel.output_shape(0);
    let mut out = DMatrix::zeros(rows, cols);
    {
        let mut slots = [&mut out];
        kernel.eval(inputs, &mut slots)?;
    }
    Ok(out)
}

/// Evaluates every output of a kernel into freshly allocated matrices.
pub(crate) fn eval_all_outputs(
    kernel: &dyn Kernel,
    inputs: &[&DMatrix<f64>],
) -> Result<Vec<DMatrix<f64>>, FunctionError> {
    let mut outs: Vec<DMatrix<f64>> = (0..kernel.num_outputs())
        .map(|o| {
            let (rows, cols) = kernel.output_shape(o);
            DMatrix::zeros(rows, cols)
        })
        .collect();
    {
        let mut slots: Vec<&mut DMatrix<f64>> = outs.iter_mut().collect();
        kernel.eval(inputs, &mut slots)?;
    }
    Ok(outs)
}

/// A function: a kernel plus IO storage, Jacobian caches and statistics.
///
/// Cloning a function shares the kernel (and with it any symbolic structure)
/// while duplicating the IO buffers, so clones can be evaluated independently.
#[derive(Clone)]
pub struct Function {
    kernel: Arc<dyn Kernel>,
    options: FunctionOptions,
    inputs: Vec<FunctionIo>,
    outputs: Vec<FunctionIo>,
    /// (n_out x n_in) table of lazily populated, immutable sparsity patterns,
    /// indexed row-major by (oind, iind). Empty until `init()`.
    jac_sparsity: Vec<OnceCell<SparsityPattern>>,
    /// Constructed Jacobian kernels, keyed by (oind, iind). Only populated
    /// when `store_jacobians` is enabled; at most one entry per pair.
    jac_kernels: RefCell<HashMap<(usize, usize), Arc<dyn Kernel>>>,
    stats: Stats,
    initialized: bool,
}

impl Function {
    /// Wraps a kernel. The function is unusable until [`init`](Function::init)
    /// has been called.
    pub fn new(kernel: Arc<dyn Kernel>, options: FunctionOptions) -> Self {
        Function {
            kernel,
            options,
            inputs: Vec::new(),
            outputs: Vec::new(),
            jac_sparsity: Vec::new(),
            jac_kernels: RefCell::new(HashMap::new()),
            stats: Stats::default(),
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        self.kernel.name()
    }

    pub fn options(&self) -> &FunctionOptions {
        &self.options
    }

    pub fn num_inputs(&self) -> usize {
        self.kernel.num_inputs()
    }

    pub fn num_outputs(&self) -> usize {
        self.kernel.num_outputs()
    }

    pub fn is_init(&self) -> bool {
        self.initialized
    }

    /// Allocates slot buffers, direction storage and the Jacobian sparsity
    /// table. Must be called exactly once before any evaluation, sensitivity
    /// or Jacobian operation.
    pub fn init(&mut self) -> Result<(), FunctionError> {
        if self.initialized {
            return Err(FunctionError::AlreadyInitialized {
                function: self.name().to_string(),
            });
        }

        let n_in = self.kernel.num_inputs();
        let n_out = self.kernel.num_outputs();

        self.inputs = (0..n_in)
            .map(|i| {
                let (rows, cols) = self.kernel.input_shape(i);
                FunctionIo::new(rows, cols)
            })
            .collect();
        self.outputs = (0..n_out)
            .map(|o| {
                let (rows, cols) = self.kernel.output_shape(o);
                FunctionIo::new(rows, cols)
            })
            .collect();

        for io in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            io.resize_directions(self.options.number_of_fwd_dir, self.options.number_of_adj_dir);
        }

        // The empty (outputs x inputs) sparsity table
        self.jac_sparsity = (0..n_in * n_out).map(|_| OnceCell::new()).collect();

        self.initialized = true;
        self.log("init", "initialized");
        Ok(())
    }

    fn input_slot(&self, iind: usize) -> Result<&FunctionIo, FunctionError> {
        self.inputs
            .get(iind)
            .ok_or_else(|| FunctionError::InputIndex {
                function: self.name().to_string(),
                index: iind,
                count: self.inputs.len(),
            })
    }

    fn input_slot_mut(&mut self, iind: usize) -> Result<&mut FunctionIo, FunctionError> {
        let count = self.inputs.len();
        let name = self.name().to_string();
        self.inputs
            .get_mut(iind)
            .ok_or(FunctionError::InputIndex {
                function: name,
                index: iind,
                count,
            })
    }

    fn output_slot(&self, oind: usize) -> Result<&FunctionIo, FunctionError> {
        self.outputs
            .get(oind)
            .ok_or_else(|| FunctionError::OutputIndex {
                function: self.name().to_string(),
                index: oind,
                count: self.outputs.len(),
            })
    }

    fn output_slot_mut(&mut self, oind: usize) -> Result<&mut FunctionIo, FunctionError> {
        let count = self.outputs.len();
        let name = self.name().to_string();
        self.outputs
            .get_mut(oind)
            .ok_or(FunctionError::OutputIndex {
                function: name,
                index: oind,
                count,
            })
    }

    fn direction<'a>(
        &self,
        dirs: &'a [DMatrix<f64>],
        dir: usize,
        mode: &'static str,
    ) -> Result<&'a DMatrix<f64>, FunctionError> {
        dirs.get(dir).ok_or_else(|| FunctionError::DirectionIndex {
            function: self.name().to_string(),
            mode,
            index: dir,
            count: dirs.len(),
        })
    }

    /// Primal value of an input slot.
    pub fn input(&self, iind: usize) -> Result<&DMatrix<f64>, FunctionError> {
        Ok(&self.input_slot(iind)?.value)
    }

    /// Mutable primal value of an input slot.
    pub fn input_mut(&mut self, iind: usize) -> Result<&mut DMatrix<f64>, FunctionError> {
        Ok(&mut self.input_slot_mut(iind)?.value)
    }

    /// Primal value of an output slot.
    pub fn output(&self, oind: usize) -> Result<&DMatrix<f64>, FunctionError> {
        Ok(&self.output_slot(oind)?.value)
    }

    /// Mutable primal value of an output slot.
    pub fn output_mut(&mut self, oind: usize) -> Result<&mut DMatrix<f64>, FunctionError> {
        Ok(&mut self.output_slot_mut(oind)?.value)
    }

    /// Copies values into an input slot, checking the length.
    pub fn set_input(&mut self, iind: usize, values: &[f64]) -> Result<(), FunctionError> {
        let name = self.name().to_string();
        let slot = self.input_slot_mut(iind)?;
        if slot.numel() != values.len() {
            return Err(FunctionError::ShapeMismatch {
                function: name,
                what: "input",
                expected: slot.numel(),
                got: values.len(),
            });
        }
        slot.value.as_mut_slice().copy_from_slice(values);
        Ok(())
    }

    /// Forward seed of input `iind`, direction `dir`.
    pub fn fwd_seed(&self, iind: usize, dir: usize) -> Result<&DMatrix<f64>, FunctionError> {
        let slot = self.input_slot(iind)?;
        self.direction(&slot.fwd, dir, "forward")
    }

    /// Mutable forward seed of input `iind`, direction `dir`.
    pub fn fwd_seed_mut(
        &mut self,
        iind: usize,
        dir: usize,
    ) -> Result<&mut DMatrix<f64>, FunctionError> {
        let name = self.name().to_string();
        let slot = self.input_slot_mut(iind)?;
        let count = slot.fwd.len();
        slot.fwd
            .get_mut(dir)
            .ok_or(FunctionError::DirectionIndex {
                function: name,
                mode: "forward",
                index: dir,
                count,
            })
    }

    /// Forward sensitivity of output `oind`, direction `dir`.
    pub fn fwd_sens(&self, oind: usize, dir: usize) -> Result<&DMatrix<f64>, FunctionError> {
        let slot = self.output_slot(oind)?;
        self.direction(&slot.fwd, dir, "forward")
    }

    /// Adjoint seed of output `oind`, direction `dir`.
    pub fn adj_seed(&self, oind: usize, dir: usize) -> Result<&DMatrix<f64>, FunctionError> {
        let slot = self.output_slot(oind)?;
        self.direction(&slot.adj, dir, "adjoint")
    }

    /// Mutable adjoint seed of output `oind`, direction `dir`.
    pub fn adj_seed_mut(
        &mut self,
        oind: usize,
        dir: usize,
    ) -> Result<&mut DMatrix<f64>, FunctionError> {
        let name = self.name().to_string();
        let slot = self.output_slot_mut(oind)?;
        let count = slot.adj.len();
        slot.adj
            .get_mut(dir)
            .ok_or(FunctionError::DirectionIndex {
                function: name,
                mode: "adjoint",
                index: dir,
                count,
            })
    }

    /// Adjoint sensitivity of input `iind`, direction `dir`.
    pub fn adj_sens(&self, iind: usize, dir: usize) -> Result<&DMatrix<f64>, FunctionError> {
        let slot = self.input_slot(iind)?;
        self.direction(&slot.adj, dir, "adjoint")
    }

    fn require_init(&self, operation: &'static str) -> Result<(), FunctionError> {
        if self.initialized {
            Ok(())
        } else {
            Err(FunctionError::NotInitialized {
                function: self.name().to_string(),
                operation,
            })
        }
    }

    /// Evaluates the primal outputs plus `nfdir` forward and `nadir` adjoint
    /// sensitivity directions.
    pub fn evaluate(&mut self, nfdir: usize, nadir: usize) -> Result<(), FunctionError> {
        self.require_init("evaluate")?;
        if nfdir > self.options.number_of_fwd_dir {
            return Err(FunctionError::DirectionIndex {
                function: self.name().to_string(),
                mode: "forward",
                index: nfdir.saturating_sub(1),
                count: self.options.number_of_fwd_dir,
            });
        }
        if nadir > self.options.number_of_adj_dir {
            return Err(FunctionError::DirectionIndex {
                function: self.name().to_string(),
                mode: "adjoint",
                index: nadir.saturating_sub(1),
                count: self.options.number_of_adj_dir,
            });
        }

        // Primal evaluation
        {
            let ins: Vec<&DMatrix<f64>> = self.inputs.iter().map(|s| &s.value).collect();
            let mut outs: Vec<&mut DMatrix<f64>> =
                self.outputs.iter_mut().map(|s| &mut s.value).collect();
            self.kernel.eval(&ins, &mut outs)?;
        }

        // Directional derivatives through the memoized Jacobian blocks
        if nfdir > 0 || nadir > 0 {
            let n_in = self.inputs.len();
            let n_out = self.outputs.len();

            let mut blocks: Vec<(usize, usize, Arc<dyn Kernel>)> = Vec::new();
            for oind in 0..n_out {
                for iind in 0..n_in {
                    if self.jac_sparsity(iind, oind)?.is_empty() {
                        continue;
                    }
                    if let Some(kernel) = self.jacobian_block_kernel(oind, iind)? {
                        blocks.push((oind, iind, kernel));
                    }
                }
            }

            let mut jvals: Vec<(usize, usize, DMatrix<f64>)> = Vec::with_capacity(blocks.len());
            {
                let ins: Vec<&DMatrix<f64>> = self.inputs.iter().map(|s| &s.value).collect();
                for (oind, iind, kernel) in &blocks {
                    jvals.push((*oind, *iind, eval_single_output(kernel.as_ref(), &ins)?));
                }
            }

            for dir in 0..nfdir {
                for out in &mut self.outputs {
                    out.fwd[dir].fill(0.0);
                }
                for (oind, iind, jac) in &jvals {
                    let seed = DVector::from_column_slice(self.inputs[*iind].fwd[dir].as_slice());
                    let contribution = jac * &seed;
                    let sens = self.outputs[*oind].fwd[dir].as_mut_slice();
                    for (s, c) in sens.iter_mut().zip(contribution.iter()) {
                        *s += *c;
                    }
                }
            }

            for dir in 0..nadir {
                for inp in &mut self.inputs {
                    inp.adj[dir].fill(0.0);
                }
                for (oind, iind, jac) in &jvals {
                    let seed = DVector::from_column_slice(self.outputs[*oind].adj[dir].as_slice());
                    let contribution = jac.transpose() * &seed;
                    let sens = self.inputs[*iind].adj[dir].as_mut_slice();
                    for (s, c) in sens.iter_mut().zip(contribution.iter()) {
                        *s += *c;
                    }
                }
            }
        }

        let n_eval = self
            .stats
            .get("n_eval")
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        self.stats.set_int("n_eval", n_eval + 1);
        Ok(())
    }

    /// Returns the memoized sparsity pattern of d output(oind) / d input(iind).
    ///
    /// On the first request the pattern is asked of the kernel (falling back
    /// to a dense pattern); the answer is recorded and returned by reference
    /// for every subsequent call. A pattern without entries is the canonical
    /// "no dependency" marker.
    pub fn jac_sparsity(
        &self,
        iind: usize,
        oind: usize,
    ) -> Result<&SparsityPattern, FunctionError> {
        self.require_init("jacSparsity")?;
        let n_in = self.inputs.len();
        // Bounds through the slot accessors, for uniform diagnostics
        let in_numel = self.input_slot(iind)?.numel();
        let out_numel = self.output_slot(oind)?.numel();

        let cell = &self.jac_sparsity[oind * n_in + iind];
        Ok(cell.get_or_init(|| {
            if !self.options.sparse {
                return SparsityPattern::dense(out_numel, in_numel);
            }
            self.kernel
                .jac_sparsity(iind, oind)
                .unwrap_or_else(|| SparsityPattern::dense(out_numel, in_numel))
        }))
    }

    /// Returns the kernel evaluating Jacobian block (oind, iind), or `None` if
    /// the block is structurally null. With `store_jacobians` enabled the
    /// constructed kernel is cached and shared on repeated requests.
    pub(crate) fn jacobian_block_kernel(
        &self,
        oind: usize,
        iind: usize,
    ) -> Result<Option<Arc<dyn Kernel>>, FunctionError> {
        if self.jac_sparsity(iind, oind)?.is_empty() {
            return Ok(None);
        }

        if self.options.store_jacobians {
            if let Some(kernel) = self.jac_kernels.borrow().get(&(oind, iind)) {
                return Ok(Some(kernel.clone()));
            }
        }

        let built = self.kernel.jacobian_kernel(iind, oind)?;
        if let (true, Some(kernel)) = (self.options.store_jacobians, &built) {
            self.jac_kernels
                .borrow_mut()
                .insert((oind, iind), kernel.clone());
        }
        Ok(built)
    }

    /// Constructs a new function evaluating the requested Jacobian blocks.
    ///
    /// Each request is an (output, input) pair; a negative input index asks
    /// for the nondifferentiated output itself. Outputs appear in request
    /// order. A structurally null block becomes a constant zero matrix of
    /// shape (output numel x input numel). A single differentiated block
    /// bypasses the general composite path.
    ///
    /// The returned function is uninitialized.
    pub fn jacobian(&self, blocks: &[(usize, isize)]) -> Result<Function, FunctionError> {
        self.require_init("jacobian")?;

        // Validate all requests up front
        for &(oind, iind) in blocks {
            self.output_slot(oind)?;
            if iind >= 0 {
                self.input_slot(iind as usize)?;
            }
        }

        // Less overhead if only one Jacobian block is requested
        if blocks.len() == 1 && blocks[0].1 >= 0 {
            let (oind, iind) = (blocks[0].0, blocks[0].1 as usize);
            let kernel = match self.jacobian_block_kernel(oind, iind)? {
                Some(kernel) => kernel,
                None => Arc::new(ZeroKernel::for_block(self, oind, iind)) as Arc<dyn Kernel>,
            };
            return Ok(Function::new(kernel, self.options.clone()));
        }

        let mut parts = Vec::with_capacity(blocks.len());
        for &(oind, iind) in blocks {
            if iind < 0 {
                parts.push(JacPart::Raw(oind));
            } else {
                match self.jacobian_block_kernel(oind, iind as usize)? {
                    Some(kernel) => parts.push(JacPart::Block(kernel)),
                    None => parts.push(JacPart::Zero {
                        rows: self.outputs[oind].numel(),
                        cols: self.inputs[iind as usize].numel(),
                    }),
                }
            }
        }

        let kernel = JacobianKernel {
            name: format!("jac_{}", self.name()),
            base: self.kernel.clone(),
            parts,
        };
        Ok(Function::new(Arc::new(kernel), self.options.clone()))
    }

    /// Constructs a Hessian function. The base kernel contract does not
    /// implement this; only specialized kernels advertising
    /// `supports_hessian` do.
    pub fn hessian(&self, iind: usize, oind: usize) -> Result<Function, FunctionError> {
        self.require_init("hessian")?;
        if !self.kernel.supports_hessian() {
            return Err(FunctionError::Unsupported {
                function: self.name().to_string(),
                kind: self.kernel.kind(),
                capability: "hessian",
            });
        }
        let kernel = self.kernel.hessian_kernel(iind, oind)?;
        Ok(Function::new(kernel, self.options.clone()))
    }

    /// Reads a statistic, failing if no evaluate call has populated it yet.
    pub fn get_stat(&self, name: &str) -> Result<StatValue, FunctionError> {
        self.stats
            .get(name)
            .ok_or_else(|| FunctionError::StatNotSet {
                name: name.to_string(),
            })
    }

    pub(crate) fn log(&self, fcn: &str, msg: &str) {
        if self.options.verbose {
            println!(
                "{} In \"{}::{}\" --- {}",
                "daesens:".cyan(),
                self.name(),
                fcn,
                msg
            );
        }
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "function(\"{}\")", self.name())
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Function".cyan(), self.name())?;
        writeln!(
            f,
            "    {}: {} in, {} out",
            "Slots".cyan(),
            self.num_inputs(),
            self.num_outputs()
        )?;
        writeln!(f, "    {}: {}", "Initialized".cyan(), self.initialized)?;
        writeln!(f, "}}")
    }
}

/// A kernel evaluating a constant zero matrix: the materialization of a
/// structurally null Jacobian block.
struct ZeroKernel {
    name: String,
    input_shapes: Vec<(usize, usize)>,
    rows: usize,
    cols: usize,
}

impl ZeroKernel {
    fn for_block(base: &Function, oind: usize, iind: usize) -> ZeroKernel {
        ZeroKernel {
            name: format!("jac_{}_{}_{}", base.name(), oind, iind),
            input_shapes: (0..base.num_inputs())
                .map(|i| base.kernel.input_shape(i))
                .collect(),
            rows: base.outputs[oind].numel(),
            cols: base.inputs[iind].numel(),
        }
    }
}

impl Kernel for ZeroKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "ZeroKernel"
    }

    fn num_inputs(&self) -> usize {
        self.input_shapes.len()
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn input_shape(&self, iind: usize) -> (usize, usize) {
        self.input_shapes[iind]
    }

    fn output_shape(&self, _oind: usize) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn eval(
        &self,
        _inputs: &[&DMatrix<f64>],
        outputs: &mut [&mut DMatrix<f64>],
    ) -> Result<(), FunctionError> {
        outputs[0].fill(0.0);
        Ok(())
    }

    fn jac_sparsity(&self, iind: usize, _oind: usize) -> Option<SparsityPattern> {
        let (r, c) = self.input_shapes[iind];
        Some(SparsityPattern::empty(self.rows * self.cols, r * c))
    }
}

/// One output of a composite Jacobian function.
enum JacPart {
    /// The nondifferentiated output of the base function
    Raw(usize),
    /// A constructed Jacobian block
    Block(Arc<dyn Kernel>),
    /// A structurally null block, materialized as zeros
    Zero { rows: usize, cols: usize },
}

/// The composite kernel built by [`Function::jacobian`] for multi-block
/// requests: outputs are raw base outputs and Jacobian blocks in request order.
struct JacobianKernel {
    name: String,
    base: Arc<dyn Kernel>,
    parts: Vec<JacPart>,
}

impl Kernel for JacobianKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "JacobianKernel"
    }

    fn num_inputs(&self) -> usize {
        self.base.num_inputs()
    }

    fn num_outputs(&self) -> usize {
        self.parts.len()
    }

    fn input_shape(&self, iind: usize) -> (usize, usize) {
        self.base.input_shape(iind)
    }

    fn output_shape(&self, oind: usize) -> (usize, usize) {
        match &self.parts[oind] {
            JacPart::Raw(base_oind) => self.base.output_shape(*base_oind),
            JacPart::Block(kernel) => kernel.output_shape(0),
            JacPart::Zero { rows, cols } => (*rows, *cols),
        }
    }

    fn eval(
        &self,
        inputs: &[&DMatrix<f64>],
        outputs: &mut [&mut DMatrix<f64>],
    ) -> Result<(), FunctionError> {
        // Evaluate the base function once if any raw output is requested
        let base_outputs = if self.parts.iter().any(|p| matches!(p, JacPart::Raw(_))) {
            Some(eval_all_outputs(self.base.as_ref(), inputs)?)
        } else {
            None
        };

        for (part, out) in self.parts.iter().zip(outputs.iter_mut()) {
            match part {
                JacPart::Raw(base_oind) => {
                    out.copy_from(&base_outputs.as_ref().unwrap()[*base_oind]);
                }
                JacPart::Block(kernel) => {
                    let value = eval_single_output(kernel.as_ref(), inputs)?;
                    out.copy_from(&value);
                }
                JacPart::Zero { .. } => out.fill(0.0),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::SymbolicKernel;

    fn square_function() -> Function {
        let kernel = SymbolicKernel::builder("square")
            .input_slot("x", &["x"])
            .output_slot("y", &["x^2"])
            .build()
            .unwrap();
        Function::new(Arc::new(kernel), FunctionOptions::default())
    }

    fn two_slot_function() -> Function {
        // y0 depends only on x, y1 only on u
        let kernel = SymbolicKernel::builder("pair")
            .input_slot("x", &["x0", "x1"])
            .input_slot("u", &["u"])
            .output_slot("y0", &["x0 * x1"])
            .output_slot("y1", &["2 * u"])
            .build()
            .unwrap();
        Function::new(Arc::new(kernel), FunctionOptions::default())
    }

    #[test]
    fn test_access_before_init_is_index_error() {
        let f = square_function();
        assert!(matches!(
            f.input(0),
            Err(FunctionError::InputIndex { count: 0, .. })
        ));
        assert!(matches!(
            f.output(0),
            Err(FunctionError::OutputIndex { count: 0, .. })
        ));
    }

    #[test]
    fn test_init_exactly_once() {
        let mut f = square_function();
        f.init().unwrap();
        assert!(f.is_init());
        assert!(matches!(
            f.init(),
            Err(FunctionError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn test_index_errors_after_init() {
        let mut f = two_slot_function();
        f.init().unwrap();
        assert!(f.input(0).is_ok());
        assert!(f.input(1).is_ok());
        assert!(matches!(
            f.input(2),
            Err(FunctionError::InputIndex {
                index: 2,
                count: 2,
                ..
            })
        ));
        assert!(matches!(
            f.fwd_seed(0, 5),
            Err(FunctionError::DirectionIndex {
                mode: "forward",
                index: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_direction_storage_matches_options() {
        let kernel = SymbolicKernel::builder("f")
            .input_slot("x", &["x"])
            .output_slot("y", &["x"])
            .build()
            .unwrap();
        let mut f = Function::new(
            Arc::new(kernel),
            FunctionOptions {
                number_of_fwd_dir: 3,
                number_of_adj_dir: 0,
                ..FunctionOptions::default()
            },
        );
        f.init().unwrap();
        assert!(f.fwd_seed(0, 2).is_ok());
        assert!(f.fwd_seed(0, 3).is_err());
        assert!(f.adj_seed(0, 0).is_err());
    }

    #[test]
    fn test_evaluate_primal() {
        let mut f = square_function();
        f.init().unwrap();
        f.set_input(0, &[3.0]).unwrap();
        f.evaluate(0, 0).unwrap();
        assert_eq!(f.output(0).unwrap()[(0, 0)], 9.0);
    }

    #[test]
    fn test_jac_sparsity_is_memoized_and_identical() {
        let mut f = two_slot_function();
        f.init().unwrap();
        let first = f.jac_sparsity(0, 0).unwrap() as *const SparsityPattern;
        let second = f.jac_sparsity(0, 0).unwrap() as *const SparsityPattern;
        assert_eq!(first, second, "repeated calls must return the cached pattern");
    }

    #[test]
    fn test_jac_sparsity_requires_init() {
        let f = square_function();
        assert!(matches!(
            f.jac_sparsity(0, 0),
            Err(FunctionError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_no_dependency_pattern_is_empty() {
        let mut f = two_slot_function();
        f.init().unwrap();
        // y1 does not depend on the x slot
        let sp = f.jac_sparsity(0, 1).unwrap();
        assert!(sp.is_empty());
        assert_eq!((sp.nrow(), sp.ncol()), (1, 2));
        // y0 depends on both entries of x
        assert_eq!(f.jac_sparsity(0, 0).unwrap().nnz(), 2);
    }

    #[test]
    fn test_jacobian_value() {
        // y = x^2 => dy/dx at x=3 is 6
        let mut f = square_function();
        f.init().unwrap();
        let mut jac = f.jacobian(&[(0, 0)]).unwrap();
        jac.init().unwrap();
        jac.set_input(0, &[3.0]).unwrap();
        jac.evaluate(0, 0).unwrap();
        assert!((jac.output(0).unwrap()[(0, 0)] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_jacobian_raw_passthrough() {
        // Requesting (0, -1) returns the nondifferentiated output unchanged
        let mut f = square_function();
        f.init().unwrap();
        let mut jac = f.jacobian(&[(0, -1)]).unwrap();
        jac.init().unwrap();
        jac.set_input(0, &[4.0]).unwrap();
        jac.evaluate(0, 0).unwrap();
        assert_eq!(jac.output(0).unwrap()[(0, 0)], 16.0);
    }

    #[test]
    fn test_jacobian_of_independent_block_is_zero_matrix() {
        let mut f = two_slot_function();
        f.init().unwrap();
        // y1 (1x1) wrt x slot (2 entries): zero matrix of shape (1, 2)
        let mut jac = f.jacobian(&[(1, 0)]).unwrap();
        jac.init().unwrap();
        jac.set_input(0, &[5.0, 6.0]).unwrap();
        jac.set_input(1, &[7.0]).unwrap();
        jac.evaluate(0, 0).unwrap();
        let out = jac.output(0).unwrap();
        assert_eq!(out.shape(), (1, 2));
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_jacobian_mixed_blocks_in_request_order() {
        let mut f = two_slot_function();
        f.init().unwrap();
        let mut jac = f.jacobian(&[(0, -1), (0, 0), (1, 1)]).unwrap();
        jac.init().unwrap();
        jac.set_input(0, &[2.0, 3.0]).unwrap();
        jac.set_input(1, &[4.0]).unwrap();
        jac.evaluate(0, 0).unwrap();
        // raw y0 = x0*x1 = 6
        assert_eq!(jac.output(0).unwrap()[(0, 0)], 6.0);
        // d y0 / d x = [x1, x0] = [3, 2]
        assert_eq!(jac.output(1).unwrap()[(0, 0)], 3.0);
        assert_eq!(jac.output(1).unwrap()[(0, 1)], 2.0);
        // d y1 / d u = 2
        assert_eq!(jac.output(2).unwrap()[(0, 0)], 2.0);
    }

    #[test]
    fn test_store_jacobians_caches_kernel() {
        let kernel = SymbolicKernel::builder("f")
            .input_slot("x", &["x"])
            .output_slot("y", &["x^3"])
            .build()
            .unwrap();
        let mut f = Function::new(
            Arc::new(kernel),
            FunctionOptions {
                store_jacobians: true,
                ..FunctionOptions::default()
            },
        );
        f.init().unwrap();
        let first = f.jacobian_block_kernel(0, 0).unwrap().unwrap();
        let second = f.jacobian_block_kernel(0, 0).unwrap().unwrap();
        assert!(
            Arc::ptr_eq(&first, &second),
            "cached Jacobian kernel must be shared by reference"
        );
    }

    #[test]
    fn test_hessian_unsupported_names_kernel() {
        let mut f = square_function();
        f.init().unwrap();
        match f.hessian(0, 0) {
            Err(FunctionError::Unsupported {
                kind, capability, ..
            }) => {
                assert_eq!(capability, "hessian");
                assert_eq!(kind, "SymbolicKernel");
            }
            other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_forward_and_adjoint_propagation() {
        let mut f = square_function();
        f.init().unwrap();
        f.set_input(0, &[3.0]).unwrap();
        f.fwd_seed_mut(0, 0).unwrap()[(0, 0)] = 1.0;
        f.adj_seed_mut(0, 0).unwrap()[(0, 0)] = 1.0;
        f.evaluate(1, 1).unwrap();
        // dy = 2x * dx = 6
        assert!((f.fwd_sens(0, 0).unwrap()[(0, 0)] - 6.0).abs() < 1e-12);
        // adjoint of x picks up the same 2x
        assert!((f.adj_sens(0, 0).unwrap()[(0, 0)] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_stats_only_after_evaluate() {
        let mut f = square_function();
        f.init().unwrap();
        assert!(matches!(
            f.get_stat("n_eval"),
            Err(FunctionError::StatNotSet { .. })
        ));
        f.set_input(0, &[1.0]).unwrap();
        f.evaluate(0, 0).unwrap();
        assert_eq!(f.get_stat("n_eval").unwrap().as_int(), Some(1));
    }
}
