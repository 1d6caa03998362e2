//! Conversion module for transforming evalexpr AST nodes into our internal
//! expression representation.
//!
//! This module handles converting the AST nodes from the evalexpr crate into our
//! own expression types that support symbolic differentiation and compilation to
//! stack programs. It maps variables, operators, and function calls into our
//! internal representation.
//!
//! The main entry point is the `build_ast` function which recursively traverses
//! the evalexpr AST and builds up our expression tree.

use std::collections::{HashMap, HashSet};

use crate::{
    errors::ConvertError,
    expr::{Expr, VarRef},
};
use evalexpr::{Node, Operator};

/// Converts an evalexpr AST node into our internal expression representation.
///
/// This function recursively traverses the evalexpr AST and builds up our own AST
/// representation that can be used for symbolic differentiation and evaluation.
///
/// # Arguments
/// * `node` - The evalexpr AST node to convert
/// * `var_map` - A mapping of variable names to their indices in the input array
///
/// # Returns
/// * `Result<Expr, ConvertError>` - The converted expression or an error if conversion fails
///
/// # Examples of supported operations:
/// * Basic arithmetic: +, -, *, /
/// * Variables: x, y, etc.
/// * Constants: floating point numbers
/// * Functions: abs(), ln(), log(), sqrt(), exp(), sin(), cos()
/// * Exponentiation: x^n with constant exponents
pub fn build_ast(node: &Node, var_map: &HashMap<String, u32>) -> Result<Expr, ConvertError> {
    match node.operator() {
        // Addition combines multiple children into a series of binary Add expressions
        Operator::Add => {
            let children = node.children();
            children
                .iter()
                .skip(1)
                .try_fold(build_ast(&children[0], var_map)?, |acc, child| {
                    Ok(Expr::Add(
                        Box::new(acc),
                        Box::new(build_ast(child, var_map)?),
                    ))
                })
        }
        // Multiplication combines multiple children into a series of binary Mul expressions
        Operator::Mul => {
            let children = node.children();
            children.iter().skip(1).try_fold(
                build_ast(&children[0], var_map)?,
                |acc, child| -> Result<Expr, ConvertError> {
                    Ok(Expr::Mul(
                        Box::new(acc),
                        Box::new(build_ast(child, var_map)?),
                    ))
                },
            )
        }
        Operator::Div => {
            let children = node.children();
            Ok(Expr::Div(
                Box::new(build_ast(&children[0], var_map)?),
                Box::new(build_ast(&children[1], var_map)?),
            ))
        }
        Operator::Sub => {
            let children = node.children();
            Ok(Expr::Sub(
                Box::new(build_ast(&children[0], var_map)?),
                Box::new(build_ast(&children[1], var_map)?),
            ))
        }
        // Constant value - must be numeric
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!(
                "Expected numeric constant: {:?}",
                value
            ))),
        },
        // Variable reference - looks up the variable's index in var_map
        Operator::VariableIdentifierRead { identifier } => {
            let index = var_map
                .get(identifier.as_str())
                .ok_or(ConvertError::VariableNotFound(format!(
                    "Variable not found: {:?}",
                    identifier
                )))?;
            Ok(Expr::Var(VarRef {
                name: identifier.to_string(),
                index: *index,
            }))
        }
        Operator::Neg => {
            let children = node.children();
            Ok(Expr::Neg(Box::new(build_ast(&children[0], var_map)?)))
        }
        // Function calls
        Operator::FunctionIdentifier { identifier } => {
            let children = node.children();
            match identifier.as_str() {
                "abs" => Ok(Expr::Abs(Box::new(build_ast(&children[0], var_map)?))),
                "ln" => Ok(Expr::Ln(Box::new(build_ast(&children[0], var_map)?))),
                "log" => Ok(Expr::Ln(Box::new(build_ast(&children[0], var_map)?))),
                "sqrt" => Ok(Expr::Sqrt(Box::new(build_ast(&children[0], var_map)?))),
                "exp" => Ok(Expr::Exp(Box::new(build_ast(&children[0], var_map)?))),
                "sin" => Ok(Expr::Sin(Box::new(build_ast(&children[0], var_map)?))),
                "cos" => Ok(Expr::Cos(Box::new(build_ast(&children[0], var_map)?))),
                _ => Err(ConvertError::UnsupportedFunction(format!(
                    "Unsupported function: {:?}",
                    identifier
                ))),
            }
        }
        // Root node - should have exactly one child
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_ast(&children[0], var_map)
            } else {
                Err(ConvertError::RootNode(format!(
                    "Expected single child for root node: {:?}",
                    children
                )))
            }
        }
        // Exponentiation - base can be any expression, exponent must be a constant
        Operator::Exp => {
            let children = node.children();
            if children.len() != 2 {
                return Err(ConvertError::ExpOperator(format!(
                    "Expected 2 children for Exp operator, got {}",
                    children.len()
                )));
            }

            if let Operator::Const { value } = children[1].operator() {
                match value {
                    evalexpr::Value::Int(exp) => {
                        Ok(Expr::Pow(Box::new(build_ast(&children[0], var_map)?), *exp))
                    }
                    evalexpr::Value::Float(exp) => Ok(Expr::PowFloat(
                        Box::new(build_ast(&children[0], var_map)?),
                        *exp,
                    )),
                    _ => Err(ConvertError::ExpOperator(format!(
                        "Expected numeric constant for exponent in Exp operator: {:?}",
                        value
                    ))),
                }
            } else {
                // Non-constant exponent: keep it symbolic
                Ok(Expr::PowExpr(
                    Box::new(build_ast(&children[0], var_map)?),
                    Box::new(build_ast(&children[1], var_map)?),
                ))
            }
        }
        // Any other operator is unsupported
        _ => Err(ConvertError::UnsupportedOperator(format!(
            "Unsupported operator: {:?}",
            node.operator()
        ))),
    }
}

/// Extracts all variable names referenced by a parsed expression tree.
///
/// Names are returned sorted, so slot layouts derived from them are stable.
pub fn expression_variables(node: &Node) -> Vec<String> {
    let mut symbols = HashSet::new();
    collect_variables(node, &mut symbols);

    let mut symbols: Vec<String> = symbols.into_iter().collect();
    symbols.sort();
    symbols
}

fn collect_variables(node: &Node, symbols: &mut HashSet<String>) {
    match node.operator() {
        Operator::VariableIdentifierRead { identifier } => {
            symbols.insert(identifier.to_string());
        }
        _ => {
            for child in node.children() {
                collect_variables(child, symbols);
            }
        }
    }
}
