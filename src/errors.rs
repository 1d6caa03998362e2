//! Error types for the daesens crate.
//!
//! This module defines the various error types that can occur during expression
//! parsing, function evaluation and DAE integration. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from evalexpr AST to internal representation
//! - `FunctionError`: Errors when working with the function abstraction (indexing,
//!   initialization state, unsupported capabilities, evaluation)
//! - `IntegratorError`: Errors raised by the integrator memory state machine and the
//!   native solver collaborator
//!
//! Each error type implements the standard Error trait and provides detailed error
//! messages. Errors propagate with `?` everywhere except inside native-solver
//! callbacks, where the callback bridge translates them into the solver's
//! recoverable/fatal integer flag convention.

use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from evalexpr AST to our internal AST
/// representation.
///
/// This enum represents various failure modes when converting the evalexpr expression
/// tree into our own AST format used for symbolic differentiation and compilation to
/// stack programs.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when trying to convert an exponent that is not a valid constant
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not a floating point number
    #[error("Expected float constant: {0}")]
    ConstOperator(String),
    /// Error when a variable is not found in the variable map
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
}

/// Errors raised by the function abstraction layer.
///
/// This enum covers expression-building failures (wrapping the lower parsing and
/// conversion layers), slot and direction indexing, initialization-state violations
/// and capabilities a concrete kernel does not implement.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// Error when parsing an expression string with evalexpr
    #[error("Failed to parse expression")]
    ParseError(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting from evalexpr AST to our internal AST representation
    #[error("Failed to build expression AST")]
    ConvertError(#[from] ConvertError),
    /// An input slot index outside `[0, count)`. Accessing slots before `init()`
    /// fails the same way, with a count of zero.
    #[error("In function '{function}': input {index} not in interval [0, {count})")]
    InputIndex {
        function: String,
        index: usize,
        count: usize,
    },
    /// An output slot index outside `[0, count)`
    #[error("In function '{function}': output {index} not in interval [0, {count})")]
    OutputIndex {
        function: String,
        index: usize,
        count: usize,
    },
    /// A sensitivity direction index outside the configured direction count
    #[error("In function '{function}': {mode} direction {index} not in interval [0, {count})")]
    DirectionIndex {
        function: String,
        mode: &'static str,
        index: usize,
        count: usize,
    },
    /// An operation that requires `init()` was invoked before it
    #[error("In function '{function}': '{operation}' called before init()")]
    NotInitialized {
        function: String,
        operation: &'static str,
    },
    /// `init()` was invoked a second time
    #[error("In function '{function}': init() called twice")]
    AlreadyInitialized { function: String },
    /// A capability the concrete kernel does not implement
    #[error("{capability} not defined for kernel '{function}' ({kind})")]
    Unsupported {
        function: String,
        kind: &'static str,
        capability: &'static str,
    },
    /// A variable referenced by an expression is not part of any input slot
    #[error("In function '{function}': variable not found: {variable}")]
    UnknownVariable { function: String, variable: String },
    /// The same variable name appears in more than one input slot
    #[error("In function '{function}': duplicate variable: {variable}")]
    DuplicateVariable { function: String, variable: String },
    /// A supplied buffer does not match the slot size
    #[error("In function '{function}': {what} length mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        function: String,
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A recoverable evaluation failure (e.g. a non-finite result). The callback
    /// bridge maps the signal to the solver's non-fatal flag so the step can be
    /// retried with a smaller step size.
    #[error("In function '{function}': recoverable evaluation failure (signal {signal})")]
    Recoverable { function: String, signal: i32 },
    /// A statistic was read before any evaluate call populated it
    #[error(
        "Statistic '{name}' has not been set. \
         Note: statistics are only set after an evaluate call"
    )]
    StatNotSet { name: String },
}

/// Errors raised by the integrator memory state machine.
///
/// Fatal initialization failures, caller-recoverable consistency failures and
/// stepping failures all carry the name of the failing native call together with
/// the decoded native flag, so diagnostics read the same way the native solver
/// documents them.
#[derive(Debug, Error)]
pub enum IntegratorError {
    /// Error bubbled up from the function abstraction
    #[error(transparent)]
    Function(#[from] FunctionError),
    /// Fatal native allocation or registration failure during `init_memory`;
    /// the integrator memory is unusable afterwards
    #[error("Integrator '{name}': initialization failed in '{call}': {reason}")]
    InitFailure {
        name: String,
        call: &'static str,
        reason: String,
    },
    /// The consistent-initial-condition correction failed. Non-fatal: the caller
    /// may retry with a different initial guess.
    #[error(
        "Module \"{call}\" returned flag {flag} (\"{name}\"). \
         Consult the solver documentation.{hints}"
    )]
    Consistency {
        call: &'static str,
        flag: i32,
        name: &'static str,
        hints: String,
    },
    /// A stepping call returned a non-success native flag
    #[error(
        "Module \"{call}\" returned flag {flag} (\"{name}\"). \
         Consult the solver documentation.{hints}"
    )]
    SolverStep {
        call: &'static str,
        flag: i32,
        name: &'static str,
        hints: String,
    },
    /// A statistic was read before any advance/retreat call populated it
    #[error(
        "Statistic '{name}' has not been set. \
         Note: statistics are only set after an advance or retreat call"
    )]
    StatNotSet { name: String },
    /// A named sub-function is missing from the registry (configuration error)
    #[error("Sub-function '{key}' has not been registered")]
    MissingSubfunction { key: String },
    /// A requested integration time lies outside the configured interval
    #[error(
        "Cannot integrate to {requested}: time must lie in [{t0}, {tf}] \
         (set stop_at_end to false to integrate past tf)"
    )]
    TimeOutOfRange { requested: f64, t0: f64, tf: f64 },
    /// An operation was invoked in the wrong state of the integrator memory
    #[error("Cannot {operation}: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: String,
    },
    /// A supplied buffer does not match the problem dimensions
    #[error("{what} length mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// An invalid problem description or option set
    #[error("Invalid integrator configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_error_message() {
        let err = FunctionError::InputIndex {
            function: "dae".to_string(),
            index: 3,
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "In function 'dae': input 3 not in interval [0, 2)"
        );
    }

    #[test]
    fn test_stat_not_set_mentions_evaluate() {
        let err = FunctionError::StatNotSet {
            name: "n_eval".to_string(),
        };
        assert!(err.to_string().contains("only set after an evaluate call"));
    }

    #[test]
    fn test_solver_step_carries_decoded_flag() {
        let err = IntegratorError::SolverStep {
            call: "solve",
            flag: -3,
            name: "CONV_FAIL",
            hints: String::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"solve\""));
        assert!(msg.contains("-3"));
        assert!(msg.contains("CONV_FAIL"));
    }
}
