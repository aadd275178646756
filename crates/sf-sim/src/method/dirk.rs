//! Embedded diagonally implicit Runge-Kutta steps for explicit problems.

use crate::controller::OrderSelection;
use crate::error::{IntegratorError, SimResult};
use crate::method::tableau::Tableau;
use crate::method::{Attempt, hermite};
use crate::model::Model;
use crate::options::{DirkConfig, Predictor};
use crate::stage::{StageContext, StageInput, evaluation_failure};
use nalgebra::DVector;
use sf_core::{EvalResult, time_roundoff};
use sf_solver::{NonlinearFailure, NonlinearOutcome};

/// Largest extrapolation, in units of the previous step, the Hermite
/// predictor is trusted for.
const MAX_EXTRAPOLATION: f64 = 2.0;

#[derive(Clone, Debug)]
pub struct Dirk {
    tableau: Tableau,
    predictor: Predictor,
    stiffly_accurate: bool,
    t: f64,
    h: f64,
    y: DVector<f64>,
    f: DVector<f64>,
    /// Previous accepted point, once there is one.
    previous: Option<(f64, DVector<f64>, DVector<f64>)>,
    stages: Vec<DVector<f64>>,
    y_new: DVector<f64>,
    f_new: DVector<f64>,
    error: DVector<f64>,
    data: DVector<f64>,
    zpred: DVector<f64>,
    offset: DVector<f64>,
    delta: DVector<f64>,
    z: DVector<f64>,
}

impl Dirk {
    pub fn new(config: &DirkConfig, dimension: usize) -> Self {
        let tableau = Tableau::from_kind(config.tableau);
        let zeros = DVector::zeros(dimension);
        Self {
            predictor: config.predictor,
            stiffly_accurate: tableau.stiffly_accurate(),
            stages: vec![zeros.clone(); tableau.stages],
            tableau,
            t: 0.0,
            h: 0.0,
            y: zeros.clone(),
            f: zeros.clone(),
            previous: None,
            y_new: zeros.clone(),
            f_new: zeros.clone(),
            error: zeros.clone(),
            data: zeros.clone(),
            zpred: zeros.clone(),
            offset: zeros.clone(),
            delta: zeros.clone(),
            z: zeros,
        }
    }

    pub fn name(&self) -> &'static str {
        self.tableau.name
    }

    pub fn initialize(&mut self, t0: f64, y0: &DVector<f64>, f0: &DVector<f64>) {
        self.t = t0;
        self.h = 0.0;
        self.y.copy_from(y0);
        self.f.copy_from(f0);
        self.y_new.copy_from(y0);
        self.error.fill(0.0);
        self.previous = None;
    }

    pub(crate) fn attempt<M: Model>(
        &mut self,
        ctx: &mut StageContext<'_, M>,
        h: f64,
    ) -> SimResult<Attempt> {
        self.h = h;
        for i in 0..self.tableau.stages {
            let ti = self.t + self.tableau.c[i] * h;
            let aii = self.tableau.a[i][i];

            // data_i = y_n + h sum_{j<i} a_ij F_j
            self.data.copy_from(&self.y);
            for j in 0..i {
                let aij = self.tableau.a[i][j];
                if aij != 0.0 {
                    self.data.axpy(h * aij, &self.stages[j], 1.0);
                }
            }

            if aii == 0.0 {
                if i == 0 && self.tableau.c[0] == 0.0 {
                    self.stages[0].copy_from(&self.f);
                    continue;
                }
                self.z.copy_from(&self.data);
            } else {
                self.predict(ti);
                self.offset.copy_from(&self.zpred);
                self.offset -= &self.data;
                self.delta.fill(0.0);
                let stage = StageInput {
                    t: ti,
                    h,
                    gamma: h * aii,
                    zpred: &self.zpred,
                    offset: &self.offset,
                    error_scale: 1.0,
                };
                if let NonlinearOutcome::Failed(failure) = ctx.solve(&stage, &mut self.delta)? {
                    return Ok(Attempt::Failed(failure));
                }
                self.z.copy_from(&self.zpred);
                self.z += &self.delta;
            }

            let status = ctx.rhs(ti, &self.z, &mut self.stages[i]);
            if let Some(failure) = stage_failure(ti, status)? {
                return Ok(Attempt::Failed(failure));
            }
        }

        self.y_new.copy_from(&self.y);
        self.error.fill(0.0);
        for (j, fj) in self.stages.iter().enumerate() {
            let (bj, dj) = (self.tableau.b[j], self.tableau.d[j]);
            self.y_new.axpy(h * bj, fj, 1.0);
            self.error.axpy(h * (bj - dj), fj, 1.0);
        }

        let t_new = self.t + h;
        if self.stiffly_accurate {
            self.f_new.copy_from(&self.stages[self.tableau.stages - 1]);
        } else {
            let status = ctx.rhs(t_new, &self.y_new, &mut self.f_new);
            if let Some(failure) = stage_failure(t_new, status)? {
                return Ok(Attempt::Failed(failure));
            }
        }

        Ok(Attempt::Solved {
            orders: OrderSelection::Fixed,
        })
    }

    pub fn accept(&mut self) {
        let (mut y_old, mut f_old) = match self.previous.take() {
            Some((_, y, f)) => (y, f),
            None => (self.y.clone(), self.f.clone()),
        };
        y_old.copy_from(&self.y);
        f_old.copy_from(&self.f);
        self.previous = Some((self.t, y_old, f_old));

        self.y.copy_from(&self.y_new);
        self.f.copy_from(&self.f_new);
        self.t += self.h;
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub(crate) fn snap_time(&mut self, t: f64) {
        self.t = t;
    }

    pub fn current(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn solution(&self) -> &DVector<f64> {
        &self.y_new
    }

    pub fn local_error(&self) -> &DVector<f64> {
        &self.error
    }

    pub fn order(&self) -> usize {
        self.tableau.order
    }

    pub fn error_order(&self) -> usize {
        self.tableau.error_order()
    }

    /// Cubic Hermite output over the last accepted step.
    pub fn interpolate(&self, t: f64, out: &mut DVector<f64>) -> SimResult<()> {
        let t_start = self.previous.as_ref().map_or(self.t, |(t_old, _, _)| *t_old);
        let tol = time_roundoff(self.t, self.t - t_start);
        if t < t_start - tol || t > self.t + tol {
            return Err(IntegratorError::invalid(format!(
                "t = {t} is outside the last step [{t_start}, {}]",
                self.t
            )));
        }
        match &self.previous {
            Some((t_old, y_old, f_old)) => {
                hermite((*t_old, y_old, f_old), (self.t, &self.y, &self.f), t, out)
            }
            None => out.copy_from(&self.y),
        }
        Ok(())
    }

    fn predict(&mut self, ti: f64) {
        if self.predictor == Predictor::Hermite {
            if let Some((t_old, y_old, f_old)) = &self.previous {
                let last = self.t - t_old;
                if ti - self.t <= MAX_EXTRAPOLATION * last {
                    hermite(
                        (*t_old, y_old, f_old),
                        (self.t, &self.y, &self.f),
                        ti,
                        &mut self.zpred,
                    );
                    return;
                }
            }
        }
        self.zpred.copy_from(&self.y);
    }
}

/// Recoverable evaluation failures fail the attempt; fatal ones stop the run.
fn stage_failure(t: f64, status: EvalResult<()>) -> SimResult<Option<NonlinearFailure>> {
    match status {
        Ok(()) => Ok(None),
        Err(e) if e.is_recoverable() => Ok(Some(NonlinearFailure::Recoverable)),
        Err(e) => Err(evaluation_failure(t, e)),
    }
}
