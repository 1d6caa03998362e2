//! The integrator memory: solver-native state and the operation sequence.
//!
//! An [`IntegratorMemory`] owns the native solver instance, the state vectors
//! (`xz`, `xzdot` forward; `rxz`, `rxzdot` backward), the statistics
//! dictionary and the two once-guards of the adjoint machinery:
//! `is_init_taping` (checkpointing initialized before the first taped sweep)
//! and `is_init_adj` (backward problem created on the first backward reset,
//! re-initialized in place afterwards).
//!
//! The operation sequence is `init_memory` (on the definition) → `reset` →
//! `advance` (repeatable, re-entrant via `reset`) → `reset_b` → `retreat`.
//! Backward integration replays the checkpoints written during the taped
//! forward sweep; it never recomputes the forward trajectory. All native
//! buffers are instance-private, so independent memories of the same
//! definition can run in parallel.

use colored::Colorize;
use nalgebra::DVector;

use super::bridge::{BandedLu, BridgeContext, DenseLu, LinearSolverKernel};
use super::native::{flags, NativeDaeSolver, NativeStats};
use super::{Dims, Integrator, IntegratorOptions, LinearSolverPolicy};
use crate::errors::IntegratorError;
use crate::function::{StatValue, Stats};

/// Outputs of a forward [`advance`](IntegratorMemory::advance).
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutputs {
    /// Differential states at the requested time
    pub x: DVector<f64>,
    /// Algebraic states
    pub z: DVector<f64>,
    /// Quadratures
    pub q: DVector<f64>,
}

/// Outputs of a backward [`retreat`](IntegratorMemory::retreat).
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOutputs {
    /// Backward differential states
    pub rx: DVector<f64>,
    /// Backward algebraic states
    pub rz: DVector<f64>,
    /// Backward quadratures (parameter sensitivities)
    pub rq: DVector<f64>,
}

fn native_error(call: &'static str, flag: i32) -> IntegratorError {
    let name = flags::flag_name(flag);
    let hints = flags::remediation_hints(call, flag);
    if matches!(call, "calc_ic" | "calc_ic_b") {
        IntegratorError::Consistency {
            call,
            flag,
            name,
            hints,
        }
    } else {
        IntegratorError::SolverStep {
            call,
            flag,
            name,
            hints,
        }
    }
}

impl Integrator {
    /// Allocates an integrator memory: native buffers sized to the problem,
    /// callbacks registered, the linear solver attached by policy, quadrature
    /// state initialized, and backward buffers pre-allocated when the problem
    /// has adjoint unknowns. Any failure here is fatal; the memory is not
    /// created.
    pub fn init_memory(&self) -> Result<IntegratorMemory, IntegratorError> {
        let dims = self.dims();
        let opts = self.options().clone();
        let name = self.name().to_string();
        let n = dims.nx + dims.nz;

        let check = |call: &'static str, flag: i32| -> Result<(), IntegratorError> {
            if flag == flags::SUCCESS {
                Ok(())
            } else {
                Err(IntegratorError::InitFailure {
                    name: name.clone(),
                    call,
                    reason: format!("flag {} ({})", flag, flags::flag_name(flag)),
                })
            }
        };

        let mut id = vec![1.0; dims.nx];
        id.extend(std::iter::repeat(0.0).take(dims.nz));
        let mut native = NativeDaeSolver::new(n, dims.nq, id);
        check("set_tolerances", native.set_tolerances(opts.reltol, opts.abstol))?;
        check("set_max_num_steps", native.set_max_num_steps(opts.max_num_steps))?;
        check("set_max_step_size", native.set_max_step_size(opts.max_step_size))?;
        check(
            "set_suppress_alg",
            native.set_suppress_alg(opts.suppress_algebraic),
        )?;

        // Attach the Newton-type linear solver chosen by policy
        let linsol: Box<dyn LinearSolverKernel> = match opts.linear_solver {
            LinearSolverPolicy::Dense | LinearSolverPolicy::Iterative => Box::new(DenseLu::new()),
            LinearSolverPolicy::Banded { upper, lower } => Box::new(BandedLu::new(upper, lower)),
            LinearSolverPolicy::UserDefined => self.make_linear_solver("linsolF")?,
        };
        let linsol_b: Option<Box<dyn LinearSolverKernel>> = if opts.adjoint {
            Some(match opts.linear_solver {
                LinearSolverPolicy::Dense | LinearSolverPolicy::Iterative => {
                    Box::new(DenseLu::new())
                }
                LinearSolverPolicy::Banded { upper, lower } => {
                    Box::new(BandedLu::new(upper, lower))
                }
                LinearSolverPolicy::UserDefined => self.make_linear_solver("linsolB")?,
            })
        } else {
            None
        };

        // The bridge carries instance-private clones of the sub-functions
        let bridge = BridgeContext::new(
            dims,
            self.functions().clone(),
            opts.linear_solver,
            linsol,
            linsol_b,
        );

        let memory = IntegratorMemory {
            name,
            opts,
            dims,
            native,
            bridge,
            xz: DVector::zeros(n),
            xzdot: DVector::zeros(n),
            rxz: DVector::zeros(dims.nrx + dims.nrz),
            rxzdot: DVector::zeros(dims.nrx + dims.nrz),
            q: DVector::zeros(dims.nq),
            rq: DVector::zeros(dims.nrq),
            t: self.options().t0,
            is_init_taping: false,
            is_init_adj: false,
            has_reset: false,
            has_reset_b: false,
            ncheck: 0,
            stats: Stats::default(),
        };
        memory.log("init_memory", "memory allocated");
        Ok(memory)
    }
}

/// Runnable state of one integration: owns its native buffers exclusively
/// and releases them on drop.
pub struct IntegratorMemory {
    name: String,
    opts: IntegratorOptions,
    dims: Dims,
    native: NativeDaeSolver,
    bridge: BridgeContext,
    xz: DVector<f64>,
    xzdot: DVector<f64>,
    rxz: DVector<f64>,
    rxzdot: DVector<f64>,
    q: DVector<f64>,
    rq: DVector<f64>,
    /// Current forward internal time
    t: f64,
    /// Adjoint checkpointing initialized (set once, before any backward pass)
    is_init_taping: bool,
    /// Backward problem created (first backward reset), re-initialized in
    /// place afterwards
    is_init_adj: bool,
    has_reset: bool,
    has_reset_b: bool,
    ncheck: usize,
    stats: Stats,
}

impl IntegratorMemory {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current forward internal time.
    pub fn time(&self) -> f64 {
        self.t
    }

    /// Number of checkpoints written by taped forward sweeps.
    pub fn ncheckpoints(&self) -> usize {
        self.ncheck
    }

    fn log(&self, fcn: &str, msg: &str) {
        if self.opts.verbose {
            println!(
                "{} In \"{}::{}\" --- {}",
                "daesens:".cyan(),
                self.name,
                fcn,
                msg
            );
        }
    }

    fn check_len(
        what: &'static str,
        expected: usize,
        got: usize,
    ) -> Result<(), IntegratorError> {
        if expected == got {
            Ok(())
        } else {
            Err(IntegratorError::DimensionMismatch {
                what,
                expected,
                got,
            })
        }
    }

    /// Re-initializes the forward problem from primal values at the initial
    /// time. Re-entrant: may be called any number of times across independent
    /// runs without reallocating. Initializes adjoint checkpointing exactly
    /// once when the problem has backward unknowns, disables any stale
    /// forward-sensitivity mode, and corrects the initial conditions when
    /// `calc_ic` is set (a failure there is recoverable: retry with a
    /// different guess).
    pub fn reset(
        &mut self,
        t: f64,
        x: &[f64],
        z: &[f64],
        p: &[f64],
    ) -> Result<(), IntegratorError> {
        self.log("reset", "begin");
        let Dims { nx, nz, np, .. } = self.dims;
        Self::check_len("x", nx, x.len())?;
        Self::check_len("z", nz, z.len())?;
        Self::check_len("p", np, p.len())?;

        self.xz.as_mut_slice()[..nx].copy_from_slice(x);
        self.xz.as_mut_slice()[nx..].copy_from_slice(z);
        self.xzdot.fill(0.0);
        if let Some(init_xdot) = &self.opts.init_xdot {
            self.xzdot.as_mut_slice()[..nx].copy_from_slice(init_xdot);
        }
        self.bridge.set_parameters(p);

        // Initialize adjoint checkpointing exactly once
        if self.dims.nrx > 0 && !self.is_init_taping {
            let flag = self
                .native
                .adj_init(self.opts.steps_per_checkpoint, self.opts.interpolation);
            if flag != flags::SUCCESS {
                return Err(native_error("adj_init", flag));
            }
            self.is_init_taping = true;
            self.log("reset", "initialized taping");
        }

        let flag = self
            .native
            .reinit(t, self.xz.as_slice(), self.xzdot.as_slice());
        if flag != flags::SUCCESS {
            return Err(native_error("reinit", flag));
        }

        if self.dims.nq > 0 {
            self.q.fill(0.0);
            let flag = self.native.quad_reinit(self.q.as_slice());
            if flag != flags::SUCCESS {
                return Err(native_error("quad_reinit", flag));
            }
        }

        // Turn off any stale forward-sensitivity mode
        let flag = self.native.sens_toggle_off();
        if flag != flags::SUCCESS {
            return Err(native_error("sens_toggle_off", flag));
        }

        // Correct initial conditions, if requested
        if self.opts.calc_ic {
            let flag = self.native.calc_ic(&mut self.bridge, t);
            if flag != flags::SUCCESS {
                return Err(native_error("calc_ic", flag));
            }
            let flag = self
                .native
                .get_consistent_ic(self.xz.as_mut_slice(), self.xzdot.as_mut_slice());
            if flag != flags::SUCCESS {
                return Err(native_error("get_consistent_ic", flag));
            }
        }

        // Fresh tape for this run
        if self.dims.nrx > 0 {
            let flag = self.native.adj_reinit();
            if flag != flags::SUCCESS {
                return Err(native_error("adj_reinit", flag));
            }
        }

        if self.opts.stop_at_end {
            let flag = self.native.set_stop_time(self.opts.tf);
            if flag != flags::SUCCESS {
                return Err(native_error("set_stop_time", flag));
            }
        }

        self.t = t;
        self.has_reset = true;
        self.log("reset", "end");
        Ok(())
    }

    /// Advances forward integration to `t`. A no-op (pure output copy) if the
    /// internal time already matches within `1e-9`. Uses taped stepping when
    /// the problem has backward unknowns, so the trajectory is checkpointed
    /// for later replay. Refreshes the statistics dictionary after every
    /// call.
    pub fn advance(&mut self, t: f64) -> Result<ForwardOutputs, IntegratorError> {
        if !self.has_reset {
            return Err(IntegratorError::InvalidState {
                operation: "advance",
                reason: "reset() has not been called".to_string(),
            });
        }
        if t < self.opts.t0 || (self.opts.stop_at_end && t > self.opts.tf) {
            return Err(IntegratorError::TimeOutOfRange {
                requested: t,
                t0: self.opts.t0,
                tf: self.opts.tf,
            });
        }

        // Integrate, unless already at the desired time
        let ttol = 1e-9;
        if (self.t - t).abs() >= ttol {
            let flag = if self.dims.nrx > 0 {
                // Taped stepping: checkpoint the trajectory for the adjoint
                self.native.solve_f(t, &mut self.bridge, &mut self.ncheck)
            } else {
                self.native.solve(t, &mut self.bridge)
            };
            if flag != flags::SUCCESS && flag != flags::TSTOP_RETURN {
                let call = if self.dims.nrx > 0 { "solve_f" } else { "solve" };
                return Err(native_error(call, flag));
            }

            self.t = self.native.time();
            let flag = self
                .native
                .get_state(self.xz.as_mut_slice(), self.xzdot.as_mut_slice());
            if flag != flags::SUCCESS {
                return Err(native_error("get_state", flag));
            }
            if self.dims.nq > 0 {
                let mut tret = 0.0;
                let flag = self.native.get_quad(&mut tret, self.q.as_mut_slice());
                if flag != flags::SUCCESS {
                    return Err(native_error("get_quad", flag));
                }
            }
        }

        self.refresh_stats();

        let nx = self.dims.nx;
        Ok(ForwardOutputs {
            x: DVector::from_column_slice(&self.xz.as_slice()[..nx]),
            z: DVector::from_column_slice(&self.xz.as_slice()[nx..]),
            q: self.q.clone(),
        })
    }

    /// Resets the backward problem at time `t`. The first call creates it
    /// (backward state, tolerances, linear solver, backward quadratures);
    /// subsequent calls re-initialize in place. Corrects backward initial
    /// conditions when `calc_icb` (default: `calc_ic`) is set.
    pub fn reset_b(
        &mut self,
        t: f64,
        rx: &[f64],
        rz: &[f64],
        rp: &[f64],
    ) -> Result<(), IntegratorError> {
        self.log("reset_b", "begin");
        let Dims {
            nrx, nrz, nrp, nrq, ..
        } = self.dims;
        if nrx == 0 {
            return Err(IntegratorError::InvalidState {
                operation: "reset_b",
                reason: "the integrator was built without the adjoint problem".to_string(),
            });
        }
        if !self.has_reset {
            return Err(IntegratorError::InvalidState {
                operation: "reset_b",
                reason: "reset() has not been called".to_string(),
            });
        }
        Self::check_len("rx", nrx, rx.len())?;
        Self::check_len("rz", nrz, rz.len())?;
        Self::check_len("rp", nrp, rp.len())?;

        self.rxz.as_mut_slice()[..nrx].copy_from_slice(rx);
        self.rxz.as_mut_slice()[nrx..].copy_from_slice(rz);
        self.rxzdot.fill(0.0);
        self.bridge.set_backward_parameters(rp);

        if !self.is_init_adj {
            // First call: create the backward problem
            let mut id_b = vec![1.0; nrx];
            id_b.extend(std::iter::repeat(0.0).take(nrz));
            let flag = self.native.create_b(nrx + nrz, nrq, id_b);
            if flag != flags::SUCCESS {
                return Err(native_error("create_b", flag));
            }
            let flag = self
                .native
                .init_b(t, self.rxz.as_slice(), self.rxzdot.as_slice());
            if flag != flags::SUCCESS {
                return Err(native_error("init_b", flag));
            }
            let flag = self
                .native
                .set_tolerances_b(self.opts.reltol, self.opts.abstol);
            if flag != flags::SUCCESS {
                return Err(native_error("set_tolerances_b", flag));
            }
            let flag = self.native.set_max_num_steps_b(self.opts.max_num_steps);
            if flag != flags::SUCCESS {
                return Err(native_error("set_max_num_steps_b", flag));
            }
            let flag = self
                .native
                .set_suppress_alg_b(self.opts.suppress_algebraic);
            if flag != flags::SUCCESS {
                return Err(native_error("set_suppress_alg_b", flag));
            }
            self.is_init_adj = true;
            self.log("reset_b", "created backward problem");
        } else {
            // Re-initialize in place
            let flag = self
                .native
                .init_b(t, self.rxz.as_slice(), self.rxzdot.as_slice());
            if flag != flags::SUCCESS {
                return Err(native_error("reinit_b", flag));
            }
        }

        self.rq.fill(0.0);
        let flag = self.native.quad_reinit_b(self.rq.as_slice());
        if flag != flags::SUCCESS {
            return Err(native_error("quad_reinit_b", flag));
        }

        // Correct backward initial conditions, if requested
        if self.opts.calc_icb.unwrap_or(self.opts.calc_ic) {
            let flag = self.native.calc_ic_b(&mut self.bridge, t);
            if flag != flags::SUCCESS {
                return Err(native_error("calc_ic_b", flag));
            }
            let mut tret = 0.0;
            let flag = self.native.get_b(
                &mut tret,
                self.rxz.as_mut_slice(),
                self.rxzdot.as_mut_slice(),
            );
            if flag != flags::SUCCESS {
                return Err(native_error("get_b", flag));
            }
        }

        self.has_reset_b = true;
        self.log("reset_b", "end");
        Ok(())
    }

    /// Integrates the backward problem down to `t`, replaying the forward
    /// checkpoints through the taping mechanism. A no-op if `t` is not
    /// earlier than the current backward time. Refreshes backward statistics
    /// after every call.
    pub fn retreat(&mut self, t: f64) -> Result<BackwardOutputs, IntegratorError> {
        if !self.has_reset_b {
            return Err(IntegratorError::InvalidState {
                operation: "retreat",
                reason: "reset_b() has not been called".to_string(),
            });
        }

        let current = self.native.time_b().unwrap_or(self.opts.tf);
        if t < current {
            let flag = self.native.solve_b(t, &mut self.bridge);
            if flag < flags::SUCCESS {
                return Err(native_error("solve_b", flag));
            }
            let mut tret = 0.0;
            let flag = self.native.get_b(
                &mut tret,
                self.rxz.as_mut_slice(),
                self.rxzdot.as_mut_slice(),
            );
            if flag != flags::SUCCESS {
                return Err(native_error("get_b", flag));
            }
            if self.dims.nrq > 0 {
                let flag = self.native.get_quad_b(&mut tret, self.rq.as_mut_slice());
                if flag != flags::SUCCESS {
                    return Err(native_error("get_quad_b", flag));
                }
            }
        }

        self.refresh_stats_b();

        let nrx = self.dims.nrx;
        Ok(BackwardOutputs {
            rx: DVector::from_column_slice(&self.rxz.as_slice()[..nrx]),
            rz: DVector::from_column_slice(&self.rxz.as_slice()[nrx..]),
            rq: self.rq.clone(),
        })
    }

    /// Reads a statistic; fails with a not-set error before the first
    /// advance/retreat call populates the dictionary.
    pub fn get_stat(&self, name: &str) -> Result<StatValue, IntegratorError> {
        self.stats
            .get(name)
            .ok_or_else(|| IntegratorError::StatNotSet {
                name: name.to_string(),
            })
    }

    fn store_stats(&mut self, stats: NativeStats, suffix: &str) {
        let s = &mut self.stats;
        s.set_int(&format!("nsteps{suffix}"), stats.nsteps);
        s.set_int(&format!("nres_evals{suffix}"), stats.nres_evals);
        s.set_int(&format!("nlin_setups{suffix}"), stats.nlin_setups);
        s.set_int(&format!("netfails{suffix}"), stats.netfails);
        s.set_int(&format!("qlast{suffix}"), stats.qlast);
        s.set_int(&format!("qcur{suffix}"), stats.qcur);
        s.set_float(&format!("hinused{suffix}"), stats.hinused);
        s.set_float(&format!("hlast{suffix}"), stats.hlast);
        s.set_float(&format!("hcur{suffix}"), stats.hcur);
        s.set_float(&format!("tcur{suffix}"), stats.tcur);
    }

    fn refresh_stats(&mut self) {
        let stats = self.native.get_stats();
        self.store_stats(stats, "");
        let ncheck = self.native.ncheckpoints() as i64;
        self.stats.set_int("ncheck", ncheck);
    }

    fn refresh_stats_b(&mut self) {
        let stats = self.native.get_stats_b();
        self.store_stats(stats, "B");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{Dae, Integrator, Interpolation, LinearSolverPolicy};
    use std::f64::consts::LN_2;

    fn decay_integrator(adjoint: bool) -> Integrator {
        let dae = Dae::builder()
            .state("x", "-x")
            .quadrature("q", "x")
            .build()
            .unwrap();
        Integrator::new(
            "decay",
            dae,
            IntegratorOptions {
                t0: 0.0,
                tf: 2.0,
                adjoint,
                ..IntegratorOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_linear_ode_end_to_end() {
        // x' = -x, x(0) = 1: x(ln 2) = 0.5
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        let out = memory.advance(LN_2).unwrap();
        assert!(
            (out.x[0] - 0.5).abs() < 1e-3,
            "x(ln 2) = {}, expected 0.5",
            out.x[0]
        );
        // quadrature of x over [0, ln 2] is 0.5
        assert!((out.q[0] - 0.5).abs() < 1e-2, "q = {}", out.q[0]);
    }

    #[test]
    fn test_advance_before_reset_is_invalid_state() {
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        assert!(matches!(
            memory.advance(1.0),
            Err(IntegratorError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_advance_out_of_range() {
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        assert!(matches!(
            memory.advance(5.0),
            Err(IntegratorError::TimeOutOfRange { .. })
        ));
        assert!(matches!(
            memory.advance(-1.0),
            Err(IntegratorError::TimeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_reset_is_idempotent_in_effect() {
        // Two resets with identical inputs then an advance to the same time
        // must produce bit-identical outputs: no state leaks between runs
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();

        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        let first = memory.advance(1.0).unwrap();

        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        let second = memory.advance(1.0).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_advance_to_current_time_is_a_noop() {
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        let first = memory.advance(1.0).unwrap();
        let nsteps = memory.get_stat("nsteps").unwrap().as_int().unwrap();

        let second = memory.advance(1.0).unwrap();
        assert_eq!(first, second, "outputs must be returned unchanged");
        assert_eq!(
            memory.get_stat("nsteps").unwrap().as_int().unwrap(),
            nsteps,
            "no solver step may be taken"
        );
    }

    #[test]
    fn test_stats_before_advance_is_an_error() {
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        assert!(matches!(
            memory.get_stat("nsteps"),
            Err(IntegratorError::StatNotSet { .. })
        ));
        memory.advance(0.5).unwrap();
        assert!(memory.get_stat("nsteps").unwrap().as_int().unwrap() > 0);
        assert!(memory.get_stat("tcur").is_ok());
    }

    #[test]
    fn test_semi_explicit_dae_with_consistency_correction() {
        // x' = -z, 0 = z - x: equivalent to x' = -x. Start from an
        // inconsistent z guess; calc_ic must pull it onto the constraint.
        let dae = Dae::builder()
            .state("x", "-z")
            .algebraic("z", "z - x")
            .build()
            .unwrap();
        let integrator = Integrator::new(
            "dae",
            dae,
            IntegratorOptions {
                t0: 0.0,
                tf: 2.0,
                ..IntegratorOptions::default()
            },
        )
        .unwrap();
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[17.0], &[]).unwrap();
        let out = memory.advance(LN_2).unwrap();
        assert!(
            (out.x[0] - 0.5).abs() < 1e-3,
            "x(ln 2) = {}, expected 0.5",
            out.x[0]
        );
        assert!(
            (out.z[0] - out.x[0]).abs() < 1e-6,
            "algebraic constraint violated: z = {}, x = {}",
            out.z[0],
            out.x[0]
        );
    }

    #[test]
    fn test_backward_pass_produces_finite_sensitivities() {
        // x' = -p*x with quadrature q' = x; seed the adjoint at tf and
        // retreat to t0. All backward quantities must be finite.
        let dae = Dae::builder()
            .state("x", "-p * x")
            .parameter("p")
            .quadrature("q", "x")
            .build()
            .unwrap();
        let integrator = Integrator::new(
            "adjoint",
            dae,
            IntegratorOptions {
                t0: 0.0,
                tf: 1.0,
                adjoint: true,
                ..IntegratorOptions::default()
            },
        )
        .unwrap();
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[1.0]).unwrap();
        let out = memory.advance(1.0).unwrap();
        assert!((out.x[0] - (-1.0f64).exp()).abs() < 1e-3);
        assert!(memory.ncheckpoints() > 0, "taped sweep must checkpoint");

        memory.reset_b(1.0, &[1.0], &[], &[0.0]).unwrap();
        let back = memory.retreat(0.0).unwrap();
        assert!(back.rx[0].is_finite());
        assert!(back.rq[0].is_finite());
        // lambda(t) = exp(t - 1) for this problem: lambda(0) = e^-1
        assert!(
            (back.rx[0] - (-1.0f64).exp()).abs() < 1e-2,
            "rx(0) = {}, expected e^-1",
            back.rx[0]
        );
        assert!(memory.get_stat("nstepsB").unwrap().as_int().unwrap() > 0);

        // Backward reset is re-entrant: second pass re-initializes in place
        memory.reset(0.0, &[1.0], &[], &[1.0]).unwrap();
        memory.advance(1.0).unwrap();
        memory.reset_b(1.0, &[1.0], &[], &[0.0]).unwrap();
        let again = memory.retreat(0.0).unwrap();
        assert!((again.rx[0] - back.rx[0]).abs() < 1e-6);
    }

    #[test]
    fn test_reset_b_without_adjoint_is_invalid() {
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        assert!(matches!(
            memory.reset_b(1.0, &[1.0], &[], &[]),
            Err(IntegratorError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let integrator = decay_integrator(false);
        let mut memory = integrator.init_memory().unwrap();
        assert!(matches!(
            memory.reset(0.0, &[1.0, 2.0], &[], &[]),
            Err(IntegratorError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_banded_and_iterative_policies() {
        for policy in [
            LinearSolverPolicy::Banded { upper: 1, lower: 1 },
            LinearSolverPolicy::Iterative,
        ] {
            let dae = Dae::builder().state("x", "-x").build().unwrap();
            let integrator = Integrator::new(
                "policy",
                dae,
                IntegratorOptions {
                    t0: 0.0,
                    tf: 2.0,
                    linear_solver: policy,
                    ..IntegratorOptions::default()
                },
            )
            .unwrap();
            let mut memory = integrator.init_memory().unwrap();
            memory.reset(0.0, &[1.0], &[], &[]).unwrap();
            let out = memory.advance(LN_2).unwrap();
            assert!((out.x[0] - 0.5).abs() < 1e-3, "policy {policy:?}");
        }
    }

    #[test]
    fn test_user_defined_policy_requires_registered_solver() {
        let dae = Dae::builder().state("x", "-x").build().unwrap();
        let integrator = Integrator::new(
            "user",
            dae,
            IntegratorOptions {
                t0: 0.0,
                tf: 1.0,
                linear_solver: LinearSolverPolicy::UserDefined,
                ..IntegratorOptions::default()
            },
        )
        .unwrap();
        // "linsolF" has not been registered: a configuration error
        assert!(matches!(
            integrator.init_memory(),
            Err(IntegratorError::MissingSubfunction { .. })
        ));
    }

    #[test]
    fn test_user_defined_policy_with_registered_solver() {
        let dae = Dae::builder().state("x", "-x").build().unwrap();
        let mut integrator = Integrator::new(
            "user",
            dae,
            IntegratorOptions {
                t0: 0.0,
                tf: 2.0,
                linear_solver: LinearSolverPolicy::UserDefined,
                ..IntegratorOptions::default()
            },
        )
        .unwrap();
        integrator.register_linear_solver("linsolF", Box::new(|| Box::new(DenseLu::new())));
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        let out = memory.advance(LN_2).unwrap();
        assert!((out.x[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_polynomial_interpolation_mode() {
        let dae = Dae::builder().state("x", "-x").build().unwrap();
        let integrator = Integrator::new(
            "poly",
            dae,
            IntegratorOptions {
                t0: 0.0,
                tf: 1.0,
                adjoint: true,
                interpolation: Interpolation::Polynomial,
                ..IntegratorOptions::default()
            },
        )
        .unwrap();
        let mut memory = integrator.init_memory().unwrap();
        memory.reset(0.0, &[1.0], &[], &[]).unwrap();
        memory.advance(1.0).unwrap();
        memory.reset_b(1.0, &[1.0], &[], &[]).unwrap();
        let back = memory.retreat(0.0).unwrap();
        assert!(back.rx[0].is_finite());
    }
}
