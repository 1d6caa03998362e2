//! Expression module for representing mathematical expressions.
//!
//! This module defines the core expression types used to represent mathematical
//! expressions in a form that supports both symbolic differentiation and
//! compilation into flattened stack programs. The main types are:
//!
//! - `Expr`: An enum representing different kinds of mathematical expressions
//! - `VarRef`: A struct naming a variable and its index in the flat input vector
//!
//! The expression tree is built recursively using `Box<Expr>` for nested
//! expressions and can be:
//! - Symbolically differentiated to compute derivatives
//! - Simplified using algebraic rules
//! - Compiled into a stack program and evaluated efficiently at runtime
//! - Queried for the set of variables it structurally depends on
//!
//! # Symbolic Differentiation
//! The derivative method implements symbolic differentiation by recursively
//! applying calculus rules like:
//! - Product rule
//! - Quotient rule
//! - Chain rule
//! - Power rule
//! - Special function derivatives (exp, ln, sqrt, sin, cos)
//!
//! # Expression Simplification
//! The simplify method performs algebraic simplifications including:
//! - Constant folding (e.g. 2 + 3 → 5)
//! - Identity rules (e.g. x + 0 → x, x * 1 → x)
//! - Exponent rules (e.g. x^0 → 1, x^1 → x)
//! - Special function simplifications

use std::collections::BTreeSet;

/// Represents a reference to a variable in an expression.
///
/// Contains the variable's name (used for differentiation, which works by name)
/// and its index in the flat input vector (used for evaluation).
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: u32,
}

/// An expression tree node representing mathematical operations.
///
/// This enum represents different types of mathematical expressions that can be:
/// - Symbolically differentiated to compute derivatives
/// - Simplified using algebraic rules
/// - Compiled into a flattened stack program for evaluation
///
/// The expression tree is built recursively using `Box<Expr>` for nested expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to a variable
    Var(VarRef),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation of an expression by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

impl Expr {
    /// Creates a variable expression from a name and flat input index.
    pub fn var(name: impl Into<String>, index: u32) -> Box<Expr> {
        Box::new(Expr::Var(VarRef {
            name: name.into(),
            index,
        }))
    }

    /// Returns true if the expression is the constant zero.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    /// Collects the flat indices of all variables the expression references.
    ///
    /// This is the structural dependency query behind Jacobian sparsity: a
    /// Jacobian entry is structurally nonzero exactly when the output
    /// expression references the input variable.
    pub fn collect_var_indices(&self, indices: &mut BTreeSet<u32>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(var_ref) => {
                indices.insert(var_ref.index);
            }
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.collect_var_indices(indices);
                b.collect_var_indices(indices);
            }
            Expr::PowExpr(a, b) => {
                a.collect_var_indices(indices);
                b.collect_var_indices(indices);
            }
            Expr::Abs(e)
            | Expr::Neg(e)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e) => e.collect_var_indices(indices),
            Expr::Pow(e, _) | Expr::PowFloat(e, _) => e.collect_var_indices(indices),
        }
    }

    /// Returns true if the expression structurally depends on the variable
    /// with the given flat index.
    pub fn depends_on(&self, index: u32) -> bool {
        let mut indices = BTreeSet::new();
        self.collect_var_indices(&mut indices);
        indices.contains(&index)
    }

    /// Rebuilds the expression with variable indices looked up by name in `lookup`.
    ///
    /// Used when an expression built against one function's input layout is
    /// embedded into a function with a different layout (e.g. the forward DAE
    /// expressions reappearing inside the backward problem).
    pub fn reindex<F>(&self, lookup: &F) -> Option<Box<Expr>>
    where
        F: Fn(&str) -> Option<u32>,
    {
        let rebuilt = match self {
            Expr::Const(c) => Expr::Const(*c),
            Expr::Var(var_ref) => Expr::Var(VarRef {
                name: var_ref.name.clone(),
                index: lookup(&var_ref.name)?,
            }),
            Expr::Add(a, b) => Expr::Add(a.reindex(lookup)?, b.reindex(lookup)?),
            Expr::Sub(a, b) => Expr::Sub(a.reindex(lookup)?, b.reindex(lookup)?),
            Expr::Mul(a, b) => Expr::Mul(a.reindex(lookup)?, b.reindex(lookup)?),
            Expr::Div(a, b) => Expr::Div(a.reindex(lookup)?, b.reindex(lookup)?),
            Expr::PowExpr(a, b) => Expr::PowExpr(a.reindex(lookup)?, b.reindex(lookup)?),
            Expr::Abs(e) => Expr::Abs(e.reindex(lookup)?),
            Expr::Neg(e) => Expr::Neg(e.reindex(lookup)?),
            Expr::Exp(e) => Expr::Exp(e.reindex(lookup)?),
            Expr::Ln(e) => Expr::Ln(e.reindex(lookup)?),
            Expr::Sqrt(e) => Expr::Sqrt(e.reindex(lookup)?),
            Expr::Sin(e) => Expr::Sin(e.reindex(lookup)?),
            Expr::Cos(e) => Expr::Cos(e.reindex(lookup)?),
            Expr::Pow(e, n) => Expr::Pow(e.reindex(lookup)?, *n),
            Expr::PowFloat(e, c) => Expr::PowFloat(e.reindex(lookup)?, *c),
        };
        Some(Box::new(rebuilt))
    }

    /// Computes the symbolic derivative of the expression with respect to a variable.
    ///
    /// Differentiation works by variable name, applying the standard calculus
    /// rules recursively. The result is not simplified; call [`simplify`](Expr::simplify)
    /// on it to fold away the bookkeeping constants.
    pub fn derivative(&self, with_respect_to: &str) -> Box<Expr> {
        match self {
            Expr::Const(_) => Box::new(Expr::Const(0.0)),

            Expr::Var(var_ref) => {
                if var_ref.name == with_respect_to {
                    Box::new(Expr::Const(1.0))
                } else {
                    Box::new(Expr::Const(0.0))
                }
            }

            Expr::Add(left, right) => {
                // d/dx(f + g) = df/dx + dg/dx
                Box::new(Expr::Add(
                    left.derivative(with_respect_to),
                    right.derivative(with_respect_to),
                ))
            }

            Expr::Sub(left, right) => {
                // d/dx(f - g) = df/dx - dg/dx
                Box::new(Expr::Sub(
                    left.derivative(with_respect_to),
                    right.derivative(with_respect_to),
                ))
            }

            Expr::Mul(left, right) => {
                // d/dx(f * g) = f * dg/dx + g * df/dx
                Box::new(Expr::Add(
                    Box::new(Expr::Mul(left.clone(), right.derivative(with_respect_to))),
                    Box::new(Expr::Mul(right.clone(), left.derivative(with_respect_to))),
                ))
            }

            Expr::Div(left, right) => {
                // d/dx(f/g) = (g * df/dx - f * dg/dx) / g^2
                Box::new(Expr::Div(
                    Box::new(Expr::Sub(
                        Box::new(Expr::Mul(right.clone(), left.derivative(with_respect_to))),
                        Box::new(Expr::Mul(left.clone(), right.derivative(with_respect_to))),
                    )),
                    Box::new(Expr::Pow(right.clone(), 2)),
                ))
            }

            Expr::Abs(expr) => {
                // d/dx|f| = f/|f| * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Div(expr.clone(), Box::new(Expr::Abs(expr.clone())))),
                    expr.derivative(with_respect_to),
                ))
            }

            Expr::Pow(base, exp) => {
                // d/dx(f^n) = n * f^(n-1) * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Mul(
                        Box::new(Expr::Const(*exp as f64)),
                        Box::new(Expr::Pow(base.clone(), exp - 1)),
                    )),
                    base.derivative(with_respect_to),
                ))
            }

            Expr::PowFloat(base, exp) => {
                // d/dx(f^c) = c * f^(c-1) * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Mul(
                        Box::new(Expr::Const(*exp)),
                        Box::new(Expr::PowFloat(base.clone(), exp - 1.0)),
                    )),
                    base.derivative(with_respect_to),
                ))
            }

            Expr::PowExpr(base, exponent) => {
                // d/dx(f^g) = f^g * (g' * ln(f) + g * f'/f)
                Box::new(Expr::Mul(
                    Box::new(Expr::PowExpr(base.clone(), exponent.clone())),
                    Box::new(Expr::Add(
                        Box::new(Expr::Mul(
                            exponent.derivative(with_respect_to),
                            Box::new(Expr::Ln(base.clone())),
                        )),
                        Box::new(Expr::Mul(
                            exponent.clone(),
                            Box::new(Expr::Div(base.derivative(with_respect_to), base.clone())),
                        )),
                    )),
                ))
            }

            Expr::Exp(expr) => {
                // d/dx(e^f) = e^f * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Exp(expr.clone())),
                    expr.derivative(with_respect_to),
                ))
            }

            Expr::Ln(expr) => {
                // d/dx(ln(f)) = 1/f * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Div(Box::new(Expr::Const(1.0)), expr.clone())),
                    expr.derivative(with_respect_to),
                ))
            }

            Expr::Sqrt(expr) => {
                // d/dx(sqrt(f)) = 1/(2*sqrt(f)) * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Div(
                        Box::new(Expr::Const(1.0)),
                        Box::new(Expr::Mul(
                            Box::new(Expr::Const(2.0)),
                            Box::new(Expr::Sqrt(expr.clone())),
                        )),
                    )),
                    expr.derivative(with_respect_to),
                ))
            }

            Expr::Sin(expr) => {
                // d/dx(sin(f)) = cos(f) * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Cos(expr.clone())),
                    expr.derivative(with_respect_to),
                ))
            }

            Expr::Cos(expr) => {
                // d/dx(cos(f)) = -sin(f) * df/dx
                Box::new(Expr::Mul(
                    Box::new(Expr::Neg(Box::new(Expr::Sin(expr.clone())))),
                    expr.derivative(with_respect_to),
                ))
            }

            Expr::Neg(expr) => {
                // d/dx(-f) = -(df/dx)
                Box::new(Expr::Neg(expr.derivative(with_respect_to)))
            }
        }
    }

    /// Simplifies the expression by folding constants and applying basic algebraic rules.
    pub fn simplify(&self) -> Box<Expr> {
        match self {
            Expr::Const(_) | Expr::Var(_) => Box::new(self.clone()),

            Expr::Add(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a + b)),
                    (Expr::Const(c), _) if *c == 0.0 => r,
                    (_, Expr::Const(c)) if *c == 0.0 => l,
                    _ => Box::new(Expr::Add(l, r)),
                }
            }

            Expr::Sub(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a - b)),
                    (_, Expr::Const(c)) if *c == 0.0 => l,
                    (a, b) if a == b => Box::new(Expr::Const(0.0)),
                    (Expr::Const(c), _) if *c == 0.0 => Box::new(Expr::Neg(r)),
                    _ => Box::new(Expr::Sub(l, r)),
                }
            }

            Expr::Mul(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a * b)),
                    (Expr::Const(c), _) | (_, Expr::Const(c)) if *c == 0.0 => {
                        Box::new(Expr::Const(0.0))
                    }
                    (Expr::Const(c), _) if *c == 1.0 => r,
                    (_, Expr::Const(c)) if *c == 1.0 => l,
                    _ => Box::new(Expr::Mul(l, r)),
                }
            }

            Expr::Div(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) if *b != 0.0 => Box::new(Expr::Const(a / b)),
                    (Expr::Const(c), _) if *c == 0.0 => Box::new(Expr::Const(0.0)),
                    (_, Expr::Const(c)) if *c == 1.0 => l,
                    (a, b) if a == b => Box::new(Expr::Const(1.0)),
                    _ => Box::new(Expr::Div(l, r)),
                }
            }

            Expr::Abs(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => Box::new(Expr::Const(a.abs())),
                    Expr::Abs(_) => e,
                    _ => Box::new(Expr::Abs(e)),
                }
            }

            Expr::Neg(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => Box::new(Expr::Const(-a)),
                    Expr::Neg(inner) => inner.clone(),
                    _ => Box::new(Expr::Neg(e)),
                }
            }

            Expr::Pow(base, exp) => {
                let b = base.simplify();
                match (&*b, exp) {
                    (_, 0) => Box::new(Expr::Const(1.0)),
                    (_, 1) => b,
                    (Expr::Const(a), n) => Box::new(Expr::Const(a.powi(*n as i32))),
                    _ => Box::new(Expr::Pow(b, *exp)),
                }
            }

            Expr::PowFloat(base, exp) => {
                let b = base.simplify();
                match &*b {
                    _ if *exp == 0.0 => Box::new(Expr::Const(1.0)),
                    _ if *exp == 1.0 => b,
                    Expr::Const(a) => Box::new(Expr::Const(a.powf(*exp))),
                    _ => Box::new(Expr::PowFloat(b, *exp)),
                }
            }

            Expr::PowExpr(base, exponent) => {
                let b = base.simplify();
                let e = exponent.simplify();
                match &*e {
                    Expr::Const(c) if *c == 0.0 => Box::new(Expr::Const(1.0)),
                    Expr::Const(c) if *c == 1.0 => b,
                    Expr::Const(c) if c.fract() == 0.0 => Box::new(Expr::Pow(b, *c as i64)),
                    _ => Box::new(Expr::PowExpr(b, e)),
                }
            }

            Expr::Exp(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(c) if *c == 0.0 => Box::new(Expr::Const(1.0)),
                    Expr::Const(c) => Box::new(Expr::Const(c.exp())),
                    _ => Box::new(Expr::Exp(e)),
                }
            }

            Expr::Ln(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(c) if *c == 1.0 => Box::new(Expr::Const(0.0)),
                    Expr::Const(c) if *c > 0.0 => Box::new(Expr::Const(c.ln())),
                    _ => Box::new(Expr::Ln(e)),
                }
            }

            Expr::Sqrt(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(c) if *c >= 0.0 => Box::new(Expr::Const(c.sqrt())),
                    // sqrt(f^2) = |f|
                    Expr::Pow(inner, 2) => Box::new(Expr::Abs(inner.clone())),
                    _ => Box::new(Expr::Sqrt(e)),
                }
            }

            Expr::Sin(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(c) if *c == 0.0 => Box::new(Expr::Const(0.0)),
                    _ => Box::new(Expr::Sin(e)),
                }
            }

            Expr::Cos(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(c) if *c == 0.0 => Box::new(Expr::Const(1.0)),
                    _ => Box::new(Expr::Cos(e)),
                }
            }
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{}", c),
            Expr::Var(var_ref) => write!(f, "{}", var_ref.name),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Mul(a, b) => write!(f, "({} * {})", a, b),
            Expr::Div(a, b) => write!(f, "({} / {})", a, b),
            Expr::Abs(e) => write!(f, "|{}|", e),
            Expr::Pow(e, n) => write!(f, "({}^{})", e, n),
            Expr::PowFloat(e, c) => write!(f, "({}^{})", e, c),
            Expr::PowExpr(e, p) => write!(f, "({}^{})", e, p),
            Expr::Exp(e) => write!(f, "exp({})", e),
            Expr::Ln(e) => write!(f, "ln({})", e),
            Expr::Sqrt(e) => write!(f, "sqrt({})", e),
            Expr::Sin(e) => write!(f, "sin({})", e),
            Expr::Cos(e) => write!(f, "cos({})", e),
            Expr::Neg(e) => write!(f, "(-{})", e),
        }
    }
}
