//! Forward integration with an adjoint sweep.
//!
//! Integrates the parametric decay `x' = -p*x` with the quadrature `q' = x`
//! forward with taping enabled, then seeds the adjoint at the end time and
//! retreats back to the start, printing the parameter sensitivity the
//! backward quadrature accumulates along the way.

use daesens::integrator::{Dae, Integrator, IntegratorOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dae = Dae::builder()
        .state("x", "-p * x")
        .parameter("p")
        .quadrature("q", "x")
        .build()?;

    let integrator = Integrator::new(
        "decay",
        dae,
        IntegratorOptions {
            t0: 0.0,
            tf: 1.0,
            adjoint: true,
            ..IntegratorOptions::default()
        },
    )?;

    let mut memory = integrator.init_memory()?;

    // Forward sweep with taping
    memory.reset(0.0, &[1.0], &[], &[1.0])?;
    let out = memory.advance(1.0)?;
    println!("x(1)  = {:.6}  (exact e^-1 = {:.6})", out.x[0], (-1.0f64).exp());
    println!("q(1)  = {:.6}  (exact 1 - e^-1 = {:.6})", out.q[0], 1.0 - (-1.0f64).exp());
    println!("checkpoints stored: {}", memory.ncheckpoints());

    // Backward sweep: seed the adjoint of x at the end time
    memory.reset_b(1.0, &[1.0], &[], &[0.0])?;
    let back = memory.retreat(0.0)?;
    println!("lambda(0) = {:.6}  (exact e^-1 = {:.6})", back.rx[0], (-1.0f64).exp());
    println!("d x(1) / d p accumulated: {:.6}", back.rq[0]);

    println!(
        "forward steps: {}, backward steps: {}",
        memory.get_stat("nsteps")?.as_float(),
        memory.get_stat("nstepsB")?.as_float()
    );
    Ok(())
}
