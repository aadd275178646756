//! Driver scenarios on implicit systems.

use nalgebra::DVector;
use sf_core::{EvalResult, ToleranceSpec};
use sf_sim::{
    DaeSystem, DirkTableau, Integrator, IntegratorError, IntegratorOptions, MethodKind, Task,
};

/// Robertson kinetics with the conservation law as its third equation.
struct Robertson;

impl DaeSystem for Robertson {
    fn dimension(&self) -> usize {
        3
    }

    fn residual(
        &mut self,
        _t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> EvalResult<()> {
        out[0] = yp[0] + 0.04 * y[0] - 1.0e4 * y[1] * y[2];
        out[1] = yp[1] - 0.04 * y[0] + 1.0e4 * y[1] * y[2] + 3.0e7 * y[1] * y[1];
        out[2] = y[0] + y[1] + y[2] - 1.0;
        Ok(())
    }
}

fn robertson_options() -> IntegratorOptions {
    IntegratorOptions {
        tolerances: ToleranceSpec::vector(1e-4, vec![1e-8, 1e-12, 1e-6]),
        ..IntegratorOptions::bdf()
    }
}

fn initial() -> (DVector<f64>, DVector<f64>) {
    (
        DVector::from_vec(vec![1.0, 0.0, 0.0]),
        DVector::from_vec(vec![-0.04, 0.04, 0.0]),
    )
}

#[test]
fn robertson_dae_matches_reference() {
    let (y0, yp0) = initial();
    let mut integrator = Integrator::new_implicit(Robertson, 0.0, &y0, &yp0, robertson_options())
        .expect("consistent initial conditions");

    let mut y = DVector::zeros(3);
    let adv = integrator
        .advance(0.4, Task::Normal, &mut y)
        .expect("robertson should integrate");
    assert_eq!(adv.t, 0.4);

    assert!((y[0] - 9.8517e-1).abs() < 2e-4, "y1 = {}", y[0]);
    assert!((y[1] - 3.3864e-5).abs() < 0.02 * 3.3864e-5, "y2 = {}", y[1]);
    assert!((y[2] - 1.4794e-2).abs() < 2e-4, "y3 = {}", y[2]);
    assert!((y.sum() - 1.0).abs() < 1e-8);

    let stats = integrator.stats();
    assert!(stats.steps > 0);
    assert!(stats.jacobian_evals > 0);
    assert!(stats.h_initial > 0.0 && stats.h_initial < 4e-4);
}

#[test]
fn inconsistent_initial_conditions_are_rejected() {
    let (y0, _) = initial();
    let yp0 = DVector::from_vec(vec![0.0, 0.0, 0.0]);
    let err = Integrator::new_implicit(Robertson, 0.0, &y0, &yp0, robertson_options())
        .err()
        .expect("yp0 violates the first equation");
    assert!(matches!(err, IntegratorError::InvalidInput { .. }), "{err}");
}

#[test]
fn dirk_rejects_implicit_problems() {
    let (y0, yp0) = initial();
    let options = IntegratorOptions {
        method: IntegratorOptions::dirk(DirkTableau::Trbdf2).method,
        ..robertson_options()
    };
    assert!(matches!(options.method, MethodKind::Dirk(_)));
    let err = Integrator::new_implicit(Robertson, 0.0, &y0, &yp0, options)
        .err()
        .expect("DIRK is explicit-only");
    assert!(matches!(err, IntegratorError::InvalidInput { .. }));
}

#[test]
fn reinit_implicit_restarts_from_new_state() {
    let (y0, yp0) = initial();
    let mut integrator = Integrator::new_implicit(Robertson, 0.0, &y0, &yp0, robertson_options())
        .expect("consistent initial conditions");
    let mut y = DVector::zeros(3);
    integrator
        .advance(0.1, Task::Normal, &mut y)
        .expect("first run");
    let first = integrator.stats();

    integrator
        .reinit_implicit(0.0, &y0, &yp0)
        .expect("reinit with the same state");
    assert_eq!(integrator.stats().steps, 0);
    integrator
        .advance(0.1, Task::Normal, &mut y)
        .expect("second run");
    assert_eq!(first, integrator.stats());
}
