//! DAE integrators with adjoint sensitivity support.
//!
//! An [`Integrator`] is built from a semi-explicit DAE description
//! (differential states x, algebraic states z, parameters p, time t):
//!
//! ```text
//! x' = ode(x, z, p, t)
//! 0  = alg(x, z, p, t)
//! q' = quad(x, z, p, t)
//! ```
//!
//! Construction derives every sub-function the solver needs symbolically and
//! registers it under a string key: the forward residual system "daeF", its
//! quadratures "quadF", the Newton iteration matrix "jacF", and, when the
//! adjoint problem is requested, the backward system "daeB" / "quadB" / "jacB"
//! obtained by transposed-Jacobian contraction of the forward expressions
//! against the adjoint states.
//!
//! The integrator itself is a definition object: [`Integrator::init_memory`]
//! creates independent [`IntegratorMemory`](memory::IntegratorMemory)
//! instances that own the native solver state and run the actual
//! integrations.
//!
//! # Example
//!
//! ```
//! use daesens::integrator::{Dae, Integrator, IntegratorOptions};
//!
//! let dae = Dae::builder()
//!     .state("x", "-x")
//!     .build()
//!     .unwrap();
//! let options = IntegratorOptions {
//!     t0: 0.0,
//!     tf: 1.0,
//!     ..IntegratorOptions::default()
//! };
//! let integrator = Integrator::new("decay", dae, options).unwrap();
//! let mut memory = integrator.init_memory().unwrap();
//! memory.reset(0.0, &[1.0], &[], &[]).unwrap();
//! let out = memory.advance(1.0).unwrap();
//! assert!((out.x[0] - (-1.0f64).exp()).abs() < 1e-3);
//! ```

pub mod bridge;
pub mod memory;
pub mod native;
pub(crate) mod tape;

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{FunctionError, IntegratorError};
use crate::expr::Expr;
use crate::function::{Function, FunctionOptions};
use crate::symbolic::SymbolicKernel;

pub use bridge::LinearSolverKernel;
pub use memory::{BackwardOutputs, ForwardOutputs, IntegratorMemory};
pub use native::{DaeCallbacks, DaeCallbacksB, NativeStats};

/// How the taped forward trajectory is interpolated during backward replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Cubic Hermite from the taped states and state derivatives
    #[default]
    Hermite,
    /// Piecewise linear
    Polynomial,
}

/// Which Newton-type linear solver the integrator memory attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolverPolicy {
    /// Dense LU of the assembled iteration matrix
    #[default]
    Dense,
    /// Band-masked assembly, dense factorization
    Banded { upper: usize, lower: usize },
    /// Preconditioned iterative refinement over the factorized matrix
    Iterative,
    /// A user-registered linear solver, looked up under "linsolF"/"linsolB"
    UserDefined,
}

/// Options of the integrator definition.
#[derive(Debug, Clone)]
pub struct IntegratorOptions {
    /// Start of the integration interval
    pub t0: f64,
    /// End of the integration interval
    pub tf: f64,
    pub reltol: f64,
    pub abstol: f64,
    /// Maximum number of internal steps per advance/retreat call
    pub max_num_steps: usize,
    /// Maximum internal step size; zero means unbounded
    pub max_step_size: f64,
    /// Refuse to integrate past `tf`
    pub stop_at_end: bool,
    /// Compute consistent initial conditions during reset
    pub calc_ic: bool,
    /// Compute consistent backward initial conditions; defaults to `calc_ic`
    pub calc_icb: Option<bool>,
    /// Exclude algebraic variables from the local error test
    pub suppress_algebraic: bool,
    /// Build the backward (adjoint) problem
    pub adjoint: bool,
    /// Initial values for the state derivatives used at reset
    pub init_xdot: Option<Vec<f64>>,
    /// Taped steps represented by one checkpoint
    pub steps_per_checkpoint: usize,
    /// Interpolation used for checkpoint replay
    pub interpolation: Interpolation,
    pub linear_solver: LinearSolverPolicy,
    pub verbose: bool,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        IntegratorOptions {
            t0: 0.0,
            tf: 1.0,
            reltol: 1e-6,
            abstol: 1e-8,
            max_num_steps: 10_000,
            max_step_size: 0.0,
            stop_at_end: true,
            calc_ic: true,
            calc_icb: None,
            suppress_algebraic: false,
            adjoint: false,
            init_xdot: None,
            steps_per_checkpoint: 20,
            interpolation: Interpolation::default(),
            linear_solver: LinearSolverPolicy::default(),
            verbose: false,
        }
    }
}

/// A semi-explicit DAE problem description.
#[derive(Debug, Clone)]
pub struct Dae {
    time: String,
    states: Vec<(String, String)>,
    algebraics: Vec<(String, String)>,
    parameters: Vec<String>,
    quadratures: Vec<(String, String)>,
}

impl Dae {
    pub fn builder() -> DaeBuilder {
        DaeBuilder {
            time: "t".to_string(),
            states: Vec::new(),
            algebraics: Vec::new(),
            parameters: Vec::new(),
            quadratures: Vec::new(),
        }
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn num_algebraics(&self) -> usize {
        self.algebraics.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn num_quadratures(&self) -> usize {
        self.quadratures.len()
    }
}

/// Builder for [`Dae`] problem descriptions.
pub struct DaeBuilder {
    time: String,
    states: Vec<(String, String)>,
    algebraics: Vec<(String, String)>,
    parameters: Vec<String>,
    quadratures: Vec<(String, String)>,
}

impl DaeBuilder {
    /// Renames the time variable (default "t").
    pub fn time(mut self, name: &str) -> Self {
        self.time = name.to_string();
        self
    }

    /// Adds a differential state with its right-hand side `x' = ode`.
    pub fn state(mut self, var: &str, ode: &str) -> Self {
        self.states.push((var.to_string(), ode.to_string()));
        self
    }

    /// Adds an algebraic state with its constraint residual `0 = alg`.
    pub fn algebraic(mut self, var: &str, alg: &str) -> Self {
        self.algebraics.push((var.to_string(), alg.to_string()));
        self
    }

    /// Adds a free parameter.
    pub fn parameter(mut self, name: &str) -> Self {
        self.parameters.push(name.to_string());
        self
    }

    /// Adds a quadrature output `q' = quad`.
    pub fn quadrature(mut self, name: &str, quad: &str) -> Self {
        self.quadratures.push((name.to_string(), quad.to_string()));
        self
    }

    pub fn build(self) -> Result<Dae, IntegratorError> {
        if self.states.is_empty() {
            return Err(IntegratorError::Config(
                "a DAE needs at least one differential state".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        let names = self
            .states
            .iter()
            .map(|(v, _)| v)
            .chain(self.algebraics.iter().map(|(v, _)| v))
            .chain(self.parameters.iter())
            .chain(self.quadratures.iter().map(|(v, _)| v))
            .chain(std::iter::once(&self.time));
        for name in names {
            if !seen.insert(name.clone()) {
                return Err(IntegratorError::Config(format!(
                    "duplicate variable name '{name}' in the DAE description"
                )));
            }
        }
        Ok(Dae {
            time: self.time,
            states: self.states,
            algebraics: self.algebraics,
            parameters: self.parameters,
            quadratures: self.quadratures,
        })
    }
}

/// Problem dimensions shared between the definition and its memories.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Dims {
    pub nx: usize,
    pub nz: usize,
    pub np: usize,
    pub nq: usize,
    pub nrx: usize,
    pub nrz: usize,
    /// Backward parameters: adjoint seeds of the forward quadratures
    pub nrp: usize,
    /// Backward quadratures: one per forward parameter
    pub nrq: usize,
}

/// The named sub-function registry of an integrator.
#[derive(Clone, Default)]
pub struct SubFunctions {
    map: HashMap<String, Function>,
}

impl SubFunctions {
    fn insert(&mut self, key: &str, function: Function) {
        self.map.insert(key.to_string(), function);
    }

    /// Looks up a sub-function; a missing key is a configuration error.
    pub fn get(&self, key: &str) -> Result<&Function, IntegratorError> {
        self.map
            .get(key)
            .ok_or_else(|| IntegratorError::MissingSubfunction {
                key: key.to_string(),
            })
    }

    pub fn get_mut(&mut self, key: &str) -> Result<&mut Function, IntegratorError> {
        self.map
            .get_mut(key)
            .ok_or_else(|| IntegratorError::MissingSubfunction {
                key: key.to_string(),
            })
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

type LinsolFactory = Box<dyn Fn() -> Box<dyn LinearSolverKernel> + Send + Sync>;

/// The integrator definition: a DAE plus every symbolically derived
/// sub-function. Create independent runnable instances with
/// [`init_memory`](Integrator::init_memory).
pub struct Integrator {
    name: String,
    options: IntegratorOptions,
    dims: Dims,
    funcs: SubFunctions,
    linsols: HashMap<String, LinsolFactory>,
}

impl std::fmt::Debug for Integrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrator")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("dims", &self.dims)
            .field("funcs", &self.funcs.map.keys().collect::<Vec<_>>())
            .field("linsols", &self.linsols.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Integrator {
    /// Builds the integrator and derives its sub-functions.
    pub fn new(
        name: impl Into<String>,
        dae: Dae,
        options: IntegratorOptions,
    ) -> Result<Self, IntegratorError> {
        let name = name.into();
        if options.tf <= options.t0 {
            return Err(IntegratorError::Config(format!(
                "tf ({}) must be greater than t0 ({})",
                options.tf, options.t0
            )));
        }
        if let Some(init_xdot) = &options.init_xdot {
            if init_xdot.len() != dae.num_states() {
                return Err(IntegratorError::Config(format!(
                    "option 'init_xdot' has incorrect length: expecting {}, got {}",
                    dae.num_states(),
                    init_xdot.len()
                )));
            }
        }

        let dims = Dims {
            nx: dae.num_states(),
            nz: dae.num_algebraics(),
            np: dae.num_parameters(),
            nq: dae.num_quadratures(),
            nrx: if options.adjoint { dae.num_states() } else { 0 },
            nrz: if options.adjoint { dae.num_algebraics() } else { 0 },
            nrp: if options.adjoint { dae.num_quadratures() } else { 0 },
            nrq: if options.adjoint { dae.num_parameters() } else { 0 },
        };

        let x_vars: Vec<&str> = dae.states.iter().map(|(v, _)| v.as_str()).collect();
        let z_vars: Vec<&str> = dae.algebraics.iter().map(|(v, _)| v.as_str()).collect();
        let p_vars: Vec<&str> = dae.parameters.iter().map(|p| p.as_str()).collect();
        let ode_exprs: Vec<&str> = dae.states.iter().map(|(_, e)| e.as_str()).collect();
        let alg_exprs: Vec<&str> = dae.algebraics.iter().map(|(_, e)| e.as_str()).collect();
        let quad_exprs: Vec<&str> = dae.quadratures.iter().map(|(_, e)| e.as_str()).collect();

        // Forward residual system
        let dae_f = SymbolicKernel::builder("daeF")
            .input_slot("x", &x_vars)
            .input_slot("z", &z_vars)
            .input_slot("p", &p_vars)
            .input_slot("t", &[dae.time.as_str()])
            .output_slot("ode", &ode_exprs)
            .output_slot("alg", &alg_exprs)
            .build()?;

        let mut funcs = SubFunctions::default();

        // Forward quadratures
        if dims.nq > 0 {
            let quad_f = SymbolicKernel::builder("quadF")
                .input_slot("x", &x_vars)
                .input_slot("z", &z_vars)
                .input_slot("p", &p_vars)
                .input_slot("t", &[dae.time.as_str()])
                .output_slot("quad", &quad_exprs)
                .build()?;
            funcs.insert("quadF", make_function(quad_f, &options, false)?);
        }

        // Newton iteration matrix for the forward problem:
        // [d ode/dx - cj*I, d ode/dz; d alg/dx, d alg/dz]
        let jac_f = build_newton_jacobian(
            "jacF",
            &dae_f,
            &[x_vars.clone(), z_vars.clone()],
            dims.nx,
            -1.0,
        )?;
        funcs.insert("jacF", make_function(jac_f, &options, false)?);

        // Backward (adjoint) problem, derived symbolically
        if options.adjoint {
            let (dae_b, quad_b) = build_backward_system(&dae, &dae_f, &dims)?;
            let rx_vars: Vec<String> = dae.states.iter().map(|(v, _)| format!("r{v}")).collect();
            let rz_vars: Vec<String> =
                dae.algebraics.iter().map(|(v, _)| format!("r{v}")).collect();
            let rx_refs: Vec<&str> = rx_vars.iter().map(|s| s.as_str()).collect();
            let rz_refs: Vec<&str> = rz_vars.iter().map(|s| s.as_str()).collect();
            let jac_b =
                build_newton_jacobian("jacB", &dae_b, &[rx_refs, rz_refs], dims.nrx, 1.0)?;
            funcs.insert("daeB", make_function(dae_b, &options, true)?);
            funcs.insert("quadB", make_function(quad_b, &options, false)?);
            funcs.insert("jacB", make_function(jac_b, &options, false)?);
        }

        funcs.insert("daeF", make_function(dae_f, &options, true)?);

        Ok(Integrator {
            name,
            options,
            dims,
            funcs,
            linsols: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    /// The named sub-function registry.
    pub fn functions(&self) -> &SubFunctions {
        &self.funcs
    }

    pub(crate) fn dims(&self) -> Dims {
        self.dims
    }

    /// Registers a linear-solver factory under a key ("linsolF" / "linsolB")
    /// for the user-defined linear-solver policy. One solver instance is
    /// created per integrator memory.
    pub fn register_linear_solver(
        &mut self,
        key: &str,
        factory: Box<dyn Fn() -> Box<dyn LinearSolverKernel> + Send + Sync>,
    ) {
        self.linsols.insert(key.to_string(), factory);
    }

    pub(crate) fn make_linear_solver(
        &self,
        key: &str,
    ) -> Result<Box<dyn LinearSolverKernel>, IntegratorError> {
        let factory = self
            .linsols
            .get(key)
            .ok_or_else(|| IntegratorError::MissingSubfunction {
                key: key.to_string(),
            })?;
        Ok(factory())
    }
}

fn make_function(
    kernel: SymbolicKernel,
    options: &IntegratorOptions,
    residual: bool,
) -> Result<Function, FunctionError> {
    let mut function = Function::new(
        Arc::new(kernel),
        FunctionOptions {
            sparse: true,
            // Residual systems answer Jacobian-times-vector queries through
            // their forward mode, so they carry one direction each way and
            // keep their Jacobian kernels alive across steps.
            number_of_fwd_dir: if residual { 1 } else { 0 },
            number_of_adj_dir: if residual { 1 } else { 0 },
            verbose: options.verbose,
            store_jacobians: residual,
        },
    );
    function.init()?;
    Ok(function)
}

/// Assembles the cj-shifted Newton matrix kernel of a residual system:
/// derivative entries of the stacked outputs wrt the stacked unknown slots,
/// with `sign * cj` added on the differential diagonal.
fn build_newton_jacobian(
    name: &str,
    system: &SymbolicKernel,
    unknown_slots: &[Vec<&str>],
    n_diff: usize,
    cj_sign: f64,
) -> Result<SymbolicKernel, FunctionError> {
    let mut inputs = system.input_layout();
    inputs.push(("cj".to_string(), vec!["cj".to_string()]));
    let (var_map, _) = SymbolicKernel::layout(name, &inputs)?;
    let cj_index = var_map["cj"];

    // Stacked rows: the differential then the algebraic residual slot
    let mut row_asts: Vec<&Expr> = Vec::new();
    row_asts.extend(system.output_asts(0).iter().map(|b| b.as_ref()));
    row_asts.extend(system.output_asts(1).iter().map(|b| b.as_ref()));
    // Stacked columns: the unknown variables in slot order
    let columns: Vec<&str> = unknown_slots.iter().flatten().copied().collect();
    let n = columns.len();
    debug_assert_eq!(row_asts.len(), n);

    let mut entries = Vec::with_capacity(n * n);
    for (j, var) in columns.iter().enumerate() {
        for (k, ast) in row_asts.iter().enumerate() {
            let mut entry = ast.derivative(var).simplify();
            if j == k && k < n_diff {
                let cj = Expr::var("cj", cj_index);
                entry = if cj_sign < 0.0 {
                    Box::new(Expr::Sub(entry, cj))
                } else {
                    Box::new(Expr::Add(entry, cj))
                };
                entry = entry.simplify();
            }
            entries.push(entry);
        }
    }

    SymbolicKernel::from_parts(
        name.to_string(),
        inputs,
        vec![("jac".to_string(), entries, n, n)],
    )
}

/// Derives the backward (adjoint) DAE and its quadratures from the forward
/// expressions: transposed-Jacobian contractions of ode/alg/quad against the
/// adjoint states rx, rz and the quadrature seeds rp.
fn build_backward_system(
    dae: &Dae,
    dae_f: &SymbolicKernel,
    dims: &Dims,
) -> Result<(SymbolicKernel, SymbolicKernel), FunctionError> {
    let rx_vars: Vec<String> = dae.states.iter().map(|(v, _)| format!("r{v}")).collect();
    let rz_vars: Vec<String> = dae.algebraics.iter().map(|(v, _)| format!("r{v}")).collect();
    let rp_vars: Vec<String> = dae.quadratures.iter().map(|(v, _)| format!("r{v}")).collect();
    let x_vars: Vec<String> = dae.states.iter().map(|(v, _)| v.clone()).collect();
    let z_vars: Vec<String> = dae.algebraics.iter().map(|(v, _)| v.clone()).collect();
    let p_vars: Vec<String> = dae.parameters.clone();

    let inputs: Vec<(String, Vec<String>)> = vec![
        ("rx".to_string(), rx_vars.clone()),
        ("rz".to_string(), rz_vars.clone()),
        ("rp".to_string(), rp_vars.clone()),
        ("x".to_string(), x_vars.clone()),
        ("z".to_string(), z_vars.clone()),
        ("p".to_string(), p_vars.clone()),
        ("t".to_string(), vec![dae.time.clone()]),
    ];
    let (var_map, _) = SymbolicKernel::layout("daeB", &inputs)?;
    let lookup = |name: &str| var_map.get(name).copied();

    let ode_asts = dae_f.output_asts(0);
    let alg_asts = dae_f.output_asts(1);
    // Quadrature expressions, parsed against the forward layout
    let mut quad_asts: Vec<Box<Expr>> = Vec::with_capacity(dae.quadratures.len());
    for (_, text) in &dae.quadratures {
        let node = evalexpr::build_operator_tree(text)?;
        let ast = crate::convert::build_ast(&node, dae_f.variables())?;
        quad_asts.push(ast.simplify());
    }

    // One contraction per unknown: sum_k seed_k * d f_k / d var
    let contract = |wrt: &str| -> Result<Box<Expr>, FunctionError> {
        let mut acc: Box<Expr> = Box::new(Expr::Const(0.0));
        let seeded: [(&[Box<Expr>], &[String]); 3] = [
            (ode_asts, rx_vars.as_slice()),
            (alg_asts, rz_vars.as_slice()),
            (quad_asts.as_slice(), rp_vars.as_slice()),
        ];
        for (asts, seeds) in seeded {
            for (k, ast) in asts.iter().enumerate() {
                let deriv = ast.derivative(wrt).simplify();
                if deriv.is_zero() {
                    continue;
                }
                let deriv =
                    deriv
                        .reindex(&lookup)
                        .ok_or_else(|| FunctionError::UnknownVariable {
                            function: "daeB".to_string(),
                            variable: wrt.to_string(),
                        })?;
                let seed = Expr::var(seeds[k].clone(), var_map[&seeds[k]]);
                acc = Box::new(Expr::Add(acc, Box::new(Expr::Mul(seed, deriv))));
            }
        }
        Ok(acc.simplify())
    };

    let mut rode = Vec::with_capacity(dims.nrx);
    for (v, _) in &dae.states {
        rode.push(contract(v)?);
    }
    let mut ralg = Vec::with_capacity(dims.nrz);
    for (v, _) in &dae.algebraics {
        ralg.push(contract(v)?);
    }
    let mut rquad = Vec::with_capacity(dims.nrq);
    for p in &dae.parameters {
        rquad.push(contract(p)?);
    }

    let nrx = rode.len();
    let nrz = ralg.len();
    let nrq = rquad.len();
    let dae_b = SymbolicKernel::from_parts(
        "daeB".to_string(),
        inputs.clone(),
        vec![
            ("rode".to_string(), rode, nrx, 1),
            ("ralg".to_string(), ralg, nrz, 1),
        ],
    )?;
    let quad_b = SymbolicKernel::from_parts(
        "quadB".to_string(),
        inputs,
        vec![("rquad".to_string(), rquad, nrq, 1)],
    )?;
    Ok((dae_b, quad_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> IntegratorOptions {
        IntegratorOptions {
            t0: 0.0,
            tf: 1.0,
            ..IntegratorOptions::default()
        }
    }

    #[test]
    fn test_dae_builder_rejects_duplicates_and_empty_systems() {
        let err = Dae::builder().build().unwrap_err();
        assert!(matches!(err, IntegratorError::Config(_)));

        let err = Dae::builder()
            .state("x", "-x")
            .parameter("x")
            .build()
            .unwrap_err();
        assert!(matches!(err, IntegratorError::Config(_)));
    }

    #[test]
    fn test_invalid_time_interval() {
        let dae = Dae::builder().state("x", "-x").build().unwrap();
        let err = Integrator::new(
            "bad",
            dae,
            IntegratorOptions {
                t0: 1.0,
                tf: 1.0,
                ..IntegratorOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, IntegratorError::Config(_)));
    }

    #[test]
    fn test_registry_holds_forward_functions() {
        let dae = Dae::builder()
            .state("x", "-x")
            .quadrature("q", "x")
            .build()
            .unwrap();
        let integrator = Integrator::new("fwd", dae, options()).unwrap();
        let funcs = integrator.functions();
        assert!(funcs.has("daeF"));
        assert!(funcs.has("quadF"));
        assert!(funcs.has("jacF"));
        assert!(!funcs.has("daeB"));
        assert!(matches!(
            funcs.get("daeB"),
            Err(IntegratorError::MissingSubfunction { .. })
        ));
    }

    #[test]
    fn test_registry_holds_backward_functions_when_adjoint() {
        let dae = Dae::builder()
            .state("x", "-p * x")
            .parameter("p")
            .quadrature("q", "x")
            .build()
            .unwrap();
        let integrator = Integrator::new(
            "adj",
            dae,
            IntegratorOptions {
                adjoint: true,
                ..options()
            },
        )
        .unwrap();
        let funcs = integrator.functions();
        for key in ["daeF", "quadF", "jacF", "daeB", "quadB", "jacB"] {
            assert!(funcs.has(key), "missing {key}");
        }
    }

    #[test]
    fn test_newton_matrix_is_cj_shifted() {
        // For x' = -x the iteration matrix is d(-x)/dx - cj = -1 - cj
        let dae = Dae::builder().state("x", "-x").build().unwrap();
        let integrator = Integrator::new("jac", dae, options()).unwrap();
        let mut jac_f = integrator.functions().get("jacF").unwrap().clone();
        jac_f.set_input(0, &[1.0]).unwrap();
        jac_f.set_input(1, &[]).unwrap();
        jac_f.set_input(2, &[]).unwrap();
        jac_f.set_input(3, &[0.0]).unwrap();
        jac_f.set_input(4, &[2.0]).unwrap();
        jac_f.evaluate(0, 0).unwrap();
        assert_eq!(jac_f.output(0).unwrap()[(0, 0)], -3.0);
    }

    #[test]
    fn test_backward_system_contraction() {
        // x' = -p*x, q' = x: rode = rx * (-p) + rq_seed * 1
        let dae = Dae::builder()
            .state("x", "-p * x")
            .parameter("p")
            .quadrature("q", "x")
            .build()
            .unwrap();
        let integrator = Integrator::new(
            "adj",
            dae,
            IntegratorOptions {
                adjoint: true,
                ..options()
            },
        )
        .unwrap();
        let mut dae_b = integrator.functions().get("daeB").unwrap().clone();
        // rx = 2, rq seed = 5, x = 1, p = 3, t = 0
        dae_b.set_input(0, &[2.0]).unwrap();
        dae_b.set_input(1, &[]).unwrap();
        dae_b.set_input(2, &[5.0]).unwrap();
        dae_b.set_input(3, &[1.0]).unwrap();
        dae_b.set_input(4, &[]).unwrap();
        dae_b.set_input(5, &[3.0]).unwrap();
        dae_b.set_input(6, &[0.0]).unwrap();
        dae_b.evaluate(0, 0).unwrap();
        // 2 * (-3) + 5 * 1 = -1
        assert_eq!(dae_b.output(0).unwrap()[(0, 0)], -1.0);
    }
}
