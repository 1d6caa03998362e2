//! The callback bridge between the native solver and the function registry.
//!
//! The native solver knows nothing about functions; it hands raw state
//! vectors to the callbacks of [`DaeCallbacks`]/[`DaeCallbacksB`]. The bridge
//! implements those traits over the named sub-function registry: each
//! callback packs the native vectors into the function's input slots under a
//! fixed convention (forward: x, z, p, t [, seeds]; backward: rx, rz, rp, x,
//! z, p, t [, seeds]), evaluates, and unpacks the outputs.
//!
//! Residual-type callbacks convert the plain right-hand-side evaluation into
//! the implicit residual form: the forward residual subtracts the state
//! derivative, the backward residual adds it, and Jacobian-times-vector
//! products additionally scale the seed by the Newton coefficient `cj`.
//!
//! Errors never cross the callback boundary: a recoverable evaluation
//! failure maps to the solver's positive non-fatal flag (the step shrinks
//! and retries); anything else is logged and reported as the fatal flag.

use colored::Colorize;
use nalgebra::{DMatrix, DVector, Dyn, LU};

use super::native::{DaeCallbacks, DaeCallbacksB};
use super::{Dims, LinearSolverPolicy, SubFunctions};
use crate::errors::{FunctionError, IntegratorError};

/// A Newton-type linear solver attached by policy. `factorize` is called from
/// the preconditioner-setup callback, `solve` from the preconditioner-solve
/// callback; returning false signals a recoverable failure.
pub trait LinearSolverKernel: Send + Sync {
    fn factorize(&mut self, matrix: &DMatrix<f64>) -> bool;
    fn solve(&self, b: &mut [f64]) -> bool;
}

/// Dense LU factorization (the default policy).
pub struct DenseLu {
    lu: Option<LU<f64, Dyn, Dyn>>,
}

impl DenseLu {
    pub fn new() -> Self {
        DenseLu { lu: None }
    }
}

impl Default for DenseLu {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolverKernel for DenseLu {
    fn factorize(&mut self, matrix: &DMatrix<f64>) -> bool {
        self.lu = Some(matrix.clone().lu());
        true
    }

    fn solve(&self, b: &mut [f64]) -> bool {
        let lu = match &self.lu {
            Some(lu) => lu,
            None => return false,
        };
        let mut rhs = DVector::from_column_slice(b);
        if lu.solve_mut(&mut rhs) {
            b.copy_from_slice(rhs.as_slice());
            true
        } else {
            false
        }
    }
}

/// Band-masked assembly: entries outside the band are dropped before the
/// (dense) factorization, matching a banded Jacobian callback.
pub struct BandedLu {
    upper: usize,
    lower: usize,
    inner: DenseLu,
}

impl BandedLu {
    pub fn new(upper: usize, lower: usize) -> Self {
        BandedLu {
            upper,
            lower,
            inner: DenseLu::new(),
        }
    }
}

impl LinearSolverKernel for BandedLu {
    fn factorize(&mut self, matrix: &DMatrix<f64>) -> bool {
        let (nrows, ncols) = matrix.shape();
        let mut banded = DMatrix::zeros(nrows, ncols);
        for col in 0..ncols {
            for row in 0..nrows {
                let keep = col <= row + self.upper && row <= col + self.lower;
                if keep {
                    banded[(row, col)] = matrix[(row, col)];
                }
            }
        }
        self.inner.factorize(&banded)
    }

    fn solve(&self, b: &mut [f64]) -> bool {
        self.inner.solve(b)
    }
}

/// The Newton point the last preconditioner setup was evaluated at, kept for
/// iterative refinement through Jacobian-times-vector products.
#[derive(Debug, Clone)]
struct NewtonPoint {
    t: f64,
    xz: Vec<f64>,
    rxz: Vec<f64>,
    cj: f64,
}

/// The typed context the native solver drives. One per integrator memory;
/// owns instance-private clones of the registry functions.
pub(crate) struct BridgeContext {
    dims: Dims,
    funcs: SubFunctions,
    p: DVector<f64>,
    rp: DVector<f64>,
    policy: LinearSolverPolicy,
    linsol: Box<dyn LinearSolverKernel>,
    linsol_b: Option<Box<dyn LinearSolverKernel>>,
    newton: Option<NewtonPoint>,
    newton_b: Option<NewtonPoint>,
}

impl BridgeContext {
    pub fn new(
        dims: Dims,
        funcs: SubFunctions,
        policy: LinearSolverPolicy,
        linsol: Box<dyn LinearSolverKernel>,
        linsol_b: Option<Box<dyn LinearSolverKernel>>,
    ) -> Self {
        BridgeContext {
            p: DVector::zeros(dims.np),
            rp: DVector::zeros(dims.nrp),
            dims,
            funcs,
            policy,
            linsol,
            linsol_b,
            newton: None,
            newton_b: None,
        }
    }

    pub fn set_parameters(&mut self, p: &[f64]) {
        self.p = DVector::from_column_slice(p);
    }

    pub fn set_backward_parameters(&mut self, rp: &[f64]) {
        self.rp = DVector::from_column_slice(rp);
    }

    /// Translates an error into the solver's flag convention: recoverable
    /// evaluation failures return the (positive) non-fatal flag, everything
    /// else is logged and fatal.
    fn translate(&self, what: &str, err: IntegratorError) -> i32 {
        match err {
            IntegratorError::Function(FunctionError::Recoverable { signal, .. }) => signal.max(1),
            err => {
                eprintln!("{} {} failed: {}", "daesens:".red().bold(), what, err);
                -1
            }
        }
    }

    /// Packs the forward arguments into "daeF"-layout slots 0..=3.
    fn pack_forward(
        function: &mut crate::function::Function,
        first_slot: usize,
        xz: &[f64],
        nx: usize,
        p: &DVector<f64>,
        t: f64,
    ) -> Result<(), FunctionError> {
        function.set_input(first_slot, &xz[..nx])?;
        function.set_input(first_slot + 1, &xz[nx..])?;
        function.set_input(first_slot + 2, p.as_slice())?;
        function.set_input(first_slot + 3, &[t])?;
        Ok(())
    }

    fn jtimes_forward(
        &mut self,
        t: f64,
        xz: &[f64],
        v: &[f64],
        jv: &mut [f64],
    ) -> Result<(), IntegratorError> {
        let nx = self.dims.nx;
        let p = self.p.clone();
        let f = self.funcs.get_mut("daeF")?;
        Self::pack_forward(f, 0, xz, nx, &p, t)?;
        f.fwd_seed_mut(0, 0)?
            .as_mut_slice()
            .copy_from_slice(&v[..nx]);
        f.fwd_seed_mut(1, 0)?
            .as_mut_slice()
            .copy_from_slice(&v[nx..]);
        f.fwd_seed_mut(2, 0)?.fill(0.0);
        f.fwd_seed_mut(3, 0)?.fill(0.0);
        f.evaluate(1, 0)?;
        jv[..nx].copy_from_slice(f.fwd_sens(0, 0)?.as_slice());
        jv[nx..].copy_from_slice(f.fwd_sens(1, 0)?.as_slice());
        Ok(())
    }

    fn jtimes_backward(
        &mut self,
        t: f64,
        xz: &[f64],
        rxz: &[f64],
        v: &[f64],
        jv: &mut [f64],
    ) -> Result<(), IntegratorError> {
        let (nx, nrx) = (self.dims.nx, self.dims.nrx);
        let p = self.p.clone();
        let rp = self.rp.clone();
        let f = self.funcs.get_mut("daeB")?;
        f.set_input(0, &rxz[..nrx])?;
        f.set_input(1, &rxz[nrx..])?;
        f.set_input(2, rp.as_slice())?;
        Self::pack_forward(f, 3, xz, nx, &p, t)?;
        f.fwd_seed_mut(0, 0)?
            .as_mut_slice()
            .copy_from_slice(&v[..nrx]);
        f.fwd_seed_mut(1, 0)?
            .as_mut_slice()
            .copy_from_slice(&v[nrx..]);
        for slot in 2..7 {
            f.fwd_seed_mut(slot, 0)?.fill(0.0);
        }
        f.evaluate(1, 0)?;
        jv[..nrx].copy_from_slice(f.fwd_sens(0, 0)?.as_slice());
        jv[nrx..].copy_from_slice(f.fwd_sens(1, 0)?.as_slice());
        Ok(())
    }

    /// One round of iterative refinement over the factorized preconditioner,
    /// used by the iterative linear-solver policy.
    fn refine(&mut self, b: &mut [f64], rhs0: &[f64], backward: bool) -> Result<(), IntegratorError> {
        let point = if backward {
            self.newton_b.clone()
        } else {
            self.newton.clone()
        };
        let point = match point {
            Some(point) => point,
            None => return Ok(()),
        };
        let mut jv = vec![0.0; b.len()];
        if backward {
            let v = b.to_vec();
            self.jtimes_backward(point.t, &point.xz, &point.rxz, &v, &mut jv)?;
            for (i, jvi) in jv.iter_mut().enumerate() {
                if i < self.dims.nrx {
                    *jvi += point.cj * v[i];
                }
            }
        } else {
            let v = b.to_vec();
            self.jtimes_forward(point.t, &point.xz, &v, &mut jv)?;
            for (i, jvi) in jv.iter_mut().enumerate() {
                if i < self.dims.nx {
                    *jvi -= point.cj * v[i];
                }
            }
        }
        let mut residual: Vec<f64> = rhs0.iter().zip(&jv).map(|(r, j)| r - j).collect();
        let solver: &dyn LinearSolverKernel = if backward {
            match self.linsol_b.as_deref() {
                Some(solver) => solver,
                None => return Ok(()),
            }
        } else {
            self.linsol.as_ref()
        };
        if solver.solve(&mut residual) {
            for (bi, c) in b.iter_mut().zip(&residual) {
                *bi += c;
            }
        }
        Ok(())
    }
}

impl DaeCallbacks for BridgeContext {
    fn residual(&mut self, t: f64, xz: &[f64], xzdot: &[f64], rr: &mut [f64]) -> i32 {
        let nx = self.dims.nx;
        let result: Result<(), IntegratorError> = (|| {
            let p = self.p.clone();
            let f = self.funcs.get_mut("daeF")?;
            Self::pack_forward(f, 0, xz, nx, &p, t)?;
            f.evaluate(0, 0)?;
            rr[..nx].copy_from_slice(f.output(0)?.as_slice());
            rr[nx..].copy_from_slice(f.output(1)?.as_slice());
            Ok(())
        })();
        match result {
            Ok(()) => {
                // Subtract the state derivative to get the implicit residual
                for i in 0..nx {
                    rr[i] -= xzdot[i];
                }
                0
            }
            Err(err) => self.translate("res", err),
        }
    }

    fn quad_rhs(&mut self, t: f64, xz: &[f64], _xzdot: &[f64], qdot: &mut [f64]) -> i32 {
        let nx = self.dims.nx;
        let result: Result<(), IntegratorError> = (|| {
            let p = self.p.clone();
            let f = self.funcs.get_mut("quadF")?;
            Self::pack_forward(f, 0, xz, nx, &p, t)?;
            f.evaluate(0, 0)?;
            qdot.copy_from_slice(f.output(0)?.as_slice());
            Ok(())
        })();
        match result {
            Ok(()) => 0,
            Err(err) => self.translate("rhsQ", err),
        }
    }

    fn jac_setup(&mut self, t: f64, xz: &[f64], _xzdot: &[f64], cj: f64) -> i32 {
        let nx = self.dims.nx;
        let result: Result<DMatrix<f64>, IntegratorError> = (|| {
            let p = self.p.clone();
            let f = self.funcs.get_mut("jacF")?;
            Self::pack_forward(f, 0, xz, nx, &p, t)?;
            f.set_input(4, &[cj])?;
            f.evaluate(0, 0)?;
            Ok(f.output(0)?.clone())
        })();
        match result {
            Ok(jac) => {
                if !self.linsol.factorize(&jac) {
                    return 1;
                }
                self.newton = Some(NewtonPoint {
                    t,
                    xz: xz.to_vec(),
                    rxz: Vec::new(),
                    cj,
                });
                0
            }
            Err(err) => self.translate("psetup", err),
        }
    }

    fn jac_solve(&mut self, b: &mut [f64]) -> i32 {
        let rhs0 = b.to_vec();
        if !self.linsol.solve(b) {
            return 1;
        }
        if self.policy == LinearSolverPolicy::Iterative {
            if let Err(err) = self.refine(b, &rhs0, false) {
                return self.translate("psolve", err);
            }
        }
        0
    }

    fn jac_times_vec(
        &mut self,
        t: f64,
        xz: &[f64],
        _xzdot: &[f64],
        v: &[f64],
        jv: &mut [f64],
        cj: f64,
    ) -> i32 {
        let nx = self.dims.nx;
        match self.jtimes_forward(t, xz, v, jv) {
            Ok(()) => {
                // Subtract the cj-scaled seed over the differential block
                for i in 0..nx {
                    jv[i] -= cj * v[i];
                }
                0
            }
            Err(err) => self.translate("jtimes", err),
        }
    }

    fn error_handler(&mut self, code: i32, module: &str, msg: &str) {
        eprintln!(
            "{} [{}] {} (flag {})",
            "daesens:".yellow().bold(),
            module,
            msg,
            code
        );
    }
}

impl DaeCallbacksB for BridgeContext {
    fn residual_b(
        &mut self,
        t: f64,
        xz: &[f64],
        _xzdot: &[f64],
        rxz: &[f64],
        rxzdot: &[f64],
        rr: &mut [f64],
    ) -> i32 {
        let (nx, nrx) = (self.dims.nx, self.dims.nrx);
        let result: Result<(), IntegratorError> = (|| {
            let p = self.p.clone();
            let rp = self.rp.clone();
            let f = self.funcs.get_mut("daeB")?;
            f.set_input(0, &rxz[..nrx])?;
            f.set_input(1, &rxz[nrx..])?;
            f.set_input(2, rp.as_slice())?;
            Self::pack_forward(f, 3, xz, nx, &p, t)?;
            f.evaluate(0, 0)?;
            rr[..nrx].copy_from_slice(f.output(0)?.as_slice());
            rr[nrx..].copy_from_slice(f.output(1)?.as_slice());
            Ok(())
        })();
        match result {
            Ok(()) => {
                // Add the state derivative to get the backward residual
                for i in 0..nrx {
                    rr[i] += rxzdot[i];
                }
                0
            }
            Err(err) => self.translate("resB", err),
        }
    }

    fn quad_rhs_b(
        &mut self,
        t: f64,
        xz: &[f64],
        _xzdot: &[f64],
        rxz: &[f64],
        _rxzdot: &[f64],
        rqdot: &mut [f64],
    ) -> i32 {
        let (nx, nrx) = (self.dims.nx, self.dims.nrx);
        let result: Result<(), IntegratorError> = (|| {
            let p = self.p.clone();
            let rp = self.rp.clone();
            let f = self.funcs.get_mut("quadB")?;
            f.set_input(0, &rxz[..nrx])?;
            f.set_input(1, &rxz[nrx..])?;
            f.set_input(2, rp.as_slice())?;
            Self::pack_forward(f, 3, xz, nx, &p, t)?;
            f.evaluate(0, 0)?;
            rqdot.copy_from_slice(f.output(0)?.as_slice());
            Ok(())
        })();
        match result {
            Ok(()) => {
                // Negate (note the definition of the backward quadrature)
                for q in rqdot.iter_mut() {
                    *q = -*q;
                }
                0
            }
            Err(err) => self.translate("rhsQB", err),
        }
    }

    fn jac_setup_b(
        &mut self,
        t: f64,
        xz: &[f64],
        _xzdot: &[f64],
        rxz: &[f64],
        _rxzdot: &[f64],
        cj: f64,
    ) -> i32 {
        let (nx, nrx) = (self.dims.nx, self.dims.nrx);
        let result: Result<DMatrix<f64>, IntegratorError> = (|| {
            let p = self.p.clone();
            let rp = self.rp.clone();
            let f = self.funcs.get_mut("jacB")?;
            f.set_input(0, &rxz[..nrx])?;
            f.set_input(1, &rxz[nrx..])?;
            f.set_input(2, rp.as_slice())?;
            Self::pack_forward(f, 3, xz, nx, &p, t)?;
            f.set_input(7, &[cj])?;
            f.evaluate(0, 0)?;
            Ok(f.output(0)?.clone())
        })();
        match result {
            Ok(jac) => {
                let linsol_b = match self.linsol_b.as_deref_mut() {
                    Some(linsol_b) => linsol_b,
                    None => return -1,
                };
                if !linsol_b.factorize(&jac) {
                    return 1;
                }
                self.newton_b = Some(NewtonPoint {
                    t,
                    xz: xz.to_vec(),
                    rxz: rxz.to_vec(),
                    cj,
                });
                0
            }
            Err(err) => self.translate("psetupB", err),
        }
    }

    fn jac_solve_b(&mut self, b: &mut [f64]) -> i32 {
        let rhs0 = b.to_vec();
        let solved = match self.linsol_b.as_deref() {
            Some(linsol_b) => linsol_b.solve(b),
            None => return -1,
        };
        if !solved {
            return 1;
        }
        if self.policy == LinearSolverPolicy::Iterative {
            if let Err(err) = self.refine(b, &rhs0, true) {
                return self.translate("psolveB", err);
            }
        }
        0
    }

    fn error_handler(&mut self, code: i32, module: &str, msg: &str) {
        DaeCallbacks::error_handler(self, code, module, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{Dae, Integrator, IntegratorOptions};

    fn decay_bridge(adjoint: bool) -> BridgeContext {
        let dae = Dae::builder()
            .state("x", "-x")
            .quadrature("q", "x")
            .build()
            .unwrap();
        let options = IntegratorOptions {
            t0: 0.0,
            tf: 1.0,
            adjoint,
            ..IntegratorOptions::default()
        };
        let integrator = Integrator::new("decay", dae, options).unwrap();
        let linsol_b: Option<Box<dyn LinearSolverKernel>> = if adjoint {
            Some(Box::new(DenseLu::new()))
        } else {
            None
        };
        BridgeContext::new(
            integrator.dims(),
            integrator.functions().clone(),
            LinearSolverPolicy::Dense,
            Box::new(DenseLu::new()),
            linsol_b,
        )
    }

    #[test]
    fn test_residual_subtracts_state_derivative() {
        let mut bridge = decay_bridge(false);
        let mut rr = [0.0];
        // F = -x - x' at x = 2, x' = -1: -2 + 1 = -1
        let flag = bridge.residual(0.0, &[2.0], &[-1.0], &mut rr);
        assert_eq!(flag, 0);
        assert!((rr[0] + 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_quad_rhs_evaluates_quadrature() {
        let mut bridge = decay_bridge(false);
        let mut qdot = [0.0];
        assert_eq!(bridge.quad_rhs(0.0, &[3.0], &[0.0], &mut qdot), 0);
        assert_eq!(qdot[0], 3.0);
    }

    #[test]
    fn test_jac_setup_and_solve() {
        let mut bridge = decay_bridge(false);
        // J = d(-x)/dx - cj = -1 - cj = -3 at cj = 2
        assert_eq!(bridge.jac_setup(0.0, &[1.0], &[-1.0], 2.0), 0);
        let mut b = [6.0];
        assert_eq!(bridge.jac_solve(&mut b), 0);
        assert!((b[0] + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_jac_times_vec_scales_by_cj() {
        let mut bridge = decay_bridge(false);
        let mut jv = [0.0];
        // (df/dx - cj) * v = (-1 - 2) * 5 = -15
        assert_eq!(bridge.jac_times_vec(0.0, &[1.0], &[-1.0], &[5.0], &mut jv, 2.0), 0);
        assert!((jv[0] + 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_residual_b_adds_state_derivative_and_transposes() {
        let mut bridge = decay_bridge(true);
        // rode = rx * d(-x)/dx = -rx; residual = rode + rx' = -3 + 1 = -2
        let mut rr = [0.0];
        let flag = bridge.residual_b(0.0, &[1.0], &[-1.0], &[3.0], &[1.0], &mut rr);
        assert_eq!(flag, 0);
        assert!((rr[0] + 2.0).abs() < 1e-14);
    }

    #[test]
    fn test_quad_rhs_b_negates() {
        let mut bridge = decay_bridge(true);
        // rquad wrt p is empty here (no parameters): nothing to write
        let mut rqdot: [f64; 0] = [];
        assert_eq!(
            bridge.quad_rhs_b(0.0, &[1.0], &[0.0], &[1.0], &[0.0], &mut rqdot),
            0
        );
    }

    #[test]
    fn test_missing_subfunction_is_fatal() {
        // No adjoint: "daeB" is not registered, the callback must fail fatally
        let mut bridge = decay_bridge(false);
        let mut rr = [0.0];
        let flag = bridge.residual_b(0.0, &[1.0], &[0.0], &[1.0], &[0.0], &mut rr);
        assert_eq!(flag, -1);
    }

    #[test]
    fn test_banded_mask_keeps_diagonal() {
        let mut banded = BandedLu::new(0, 0);
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 5.0, 7.0, 4.0]);
        assert!(banded.factorize(&m));
        // Only the diagonal survives the mask
        let mut b = [2.0, 4.0];
        assert!(banded.solve(&mut b));
        assert!((b[0] - 1.0).abs() < 1e-12);
        assert!((b[1] - 1.0).abs() < 1e-12);
    }
}
