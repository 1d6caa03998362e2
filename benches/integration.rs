//! # DAE Integration Benchmark
//!
//! Measures the two hot paths of the crate:
//!
//! 1. **Jacobian construction**: symbolic differentiation plus stack-program
//!    compilation for a coupled kinetic system, with and without the kernel
//!    cache.
//! 2. **Forward integration**: a full reset + advance sweep of a stiff-ish
//!    two-state decay chain, exercising the Newton corrector and the dense
//!    linear solver on every internal step.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use daesens::function::{Function, FunctionOptions};
use daesens::integrator::{Dae, Integrator, IntegratorOptions};
use daesens::symbolic::SymbolicKernel;

fn kinetics_kernel() -> SymbolicKernel {
    SymbolicKernel::builder("kinetics")
        .input_slot("x", &["s", "e", "c"])
        .input_slot("k", &["vmax", "km"])
        .output_slot(
            "rates",
            &[
                "-(vmax * s) / (km + s)",
                "(vmax * s) / (km + s) - 0.01 * e",
                "0.01 * e - 0.002 * c",
            ],
        )
        .build()
        .unwrap()
}

fn bench_jacobian_construction(c: &mut Criterion) {
    c.bench_function("jacobian_block_uncached", |b| {
        let mut f = Function::new(Arc::new(kinetics_kernel()), FunctionOptions::default());
        f.init().unwrap();
        b.iter(|| {
            let jac = f.jacobian(black_box(&[(0, 0)])).unwrap();
            black_box(jac);
        })
    });

    c.bench_function("jacobian_block_cached", |b| {
        let mut f = Function::new(
            Arc::new(kinetics_kernel()),
            FunctionOptions {
                store_jacobians: true,
                ..FunctionOptions::default()
            },
        );
        f.init().unwrap();
        b.iter(|| {
            let jac = f.jacobian(black_box(&[(0, 0)])).unwrap();
            black_box(jac);
        })
    });
}

fn bench_forward_integration(c: &mut Criterion) {
    let dae = Dae::builder()
        .state("a", "-50 * a")
        .state("b", "50 * a - b")
        .build()
        .unwrap();
    let integrator = Integrator::new(
        "chain",
        dae,
        IntegratorOptions {
            t0: 0.0,
            tf: 1.0,
            ..IntegratorOptions::default()
        },
    )
    .unwrap();

    c.bench_function("advance_decay_chain", |b| {
        let mut memory = integrator.init_memory().unwrap();
        b.iter(|| {
            memory.reset(0.0, &[1.0, 0.0], &[], &[]).unwrap();
            let out = memory.advance(black_box(1.0)).unwrap();
            black_box(out);
        })
    });
}

criterion_group!(benches, bench_jacobian_construction, bench_forward_integration);
criterion_main!(benches);
