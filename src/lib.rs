//! Symbolic differentiation and adjoint sensitivity analysis for DAE
//! integrators.
//!
//! This crate provides a function abstraction with symbolic forward/adjoint
//! differentiation and Jacobian-block caching, coupled to a DAE integrator
//! that drives a native BDF solver through initialization, taping, forward
//! integration and backward (adjoint) integration. Expressions are parsed
//! with [evalexpr](https://github.com/ISibboI/evalexpr) and evaluated through
//! compiled stack programs.
//!
//! # Features
//!
//! - Symbolic differentiation of expression systems, with structural
//!   Jacobian sparsity and memoized Jacobian blocks
//! - Forward and adjoint sensitivity propagation through the chain rule
//! - A DAE integrator with consistent-initial-condition correction,
//!   quadratures, checkpoint taping and backward replay
//! - Native-solver error translation: recoverable failures shrink the step,
//!   fatal ones abort with a decoded flag and remediation hints
//!
//! # Example
//!
//! ```
//! use daesens::integrator::{Dae, Integrator, IntegratorOptions};
//!
//! // x' = -x, x(0) = 1: advancing to t = ln 2 halves the state
//! let dae = Dae::builder().state("x", "-x").build().unwrap();
//! let options = IntegratorOptions {
//!     t0: 0.0,
//!     tf: 1.0,
//!     ..IntegratorOptions::default()
//! };
//! let integrator = Integrator::new("decay", dae, options).unwrap();
//! let mut memory = integrator.init_memory().unwrap();
//! memory.reset(0.0, &[1.0], &[], &[]).unwrap();
//! let out = memory.advance(std::f64::consts::LN_2).unwrap();
//! assert!((out.x[0] - 0.5).abs() < 1e-3);
//! ```

pub use function::{Function, FunctionOptions};
pub use integrator::{Dae, Integrator, IntegratorMemory, IntegratorOptions};
pub use symbolic::SymbolicKernel;

pub mod prelude {
    pub use crate::errors::{ConvertError, FunctionError, IntegratorError};
    pub use crate::expr::Expr;
    pub use crate::function::{Function, FunctionOptions, Kernel, StatValue};
    pub use crate::integrator::{Dae, Integrator, IntegratorMemory, IntegratorOptions};
    pub use crate::sparsity::SparsityPattern;
    pub use crate::symbolic::SymbolicKernel;
}

/// Conversion from parsed expressions to the internal AST
pub mod convert;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// The polymorphic function abstraction with Jacobian caching
pub mod function;
/// DAE integration with adjoint sensitivities
pub mod integrator;
/// Per-slot input/output storage
pub mod io;
/// Flattened stack programs for expression evaluation
pub mod program;
/// Jacobian sparsity patterns
pub mod sparsity;
/// Symbolic function kernels
pub mod symbolic;
