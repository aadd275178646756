//! Linear system backends for the Newton matrix.
//!
//! Newton asks for `setup(M)` when it decides the cached factorization is
//! stale and for `solve(b)` once per iteration. A singular `M` is reported as
//! [`SolverError::Singular`], which the integrator treats as recoverable.

use crate::error::{SolverError, SolverResult};
use nalgebra::{DMatrix, DVector, Dyn, LU};
use serde::{Deserialize, Serialize};

pub trait LinearSolver {
    /// Factor `matrix` for subsequent solves.
    fn setup(&mut self, matrix: &DMatrix<f64>) -> SolverResult<()>;

    /// Overwrite `b` with `M^{-1} b` using the last factorization.
    fn solve(&self, b: &mut DVector<f64>) -> SolverResult<()>;

    fn name(&self) -> &'static str;
}

/// Which backend to build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    #[default]
    Dense,
    /// Banded matrix with `upper` super-diagonals and `lower` sub-diagonals.
    Banded { upper: usize, lower: usize },
}

impl LinearSolverKind {
    pub fn bandwidth(&self) -> Option<(usize, usize)> {
        match self {
            LinearSolverKind::Dense => None,
            LinearSolverKind::Banded { upper, lower } => Some((*upper, *lower)),
        }
    }
}

fn check_shape(matrix: &DMatrix<f64>) -> SolverResult<()> {
    if !matrix.is_square() {
        return Err(SolverError::ProblemSetup {
            what: format!(
                "Newton matrix must be square, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            ),
        });
    }
    if let Some(v) = matrix.iter().find(|v| !v.is_finite()) {
        return Err(SolverError::Numeric {
            what: format!("non-finite entry {v} in Newton matrix"),
        });
    }
    Ok(())
}

/// Dense LU with partial pivoting (nalgebra).
#[derive(Clone, Debug, Default)]
pub struct DenseLu {
    lu: Option<LU<f64, Dyn, Dyn>>,
}

impl DenseLu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinearSolver for DenseLu {
    fn setup(&mut self, matrix: &DMatrix<f64>) -> SolverResult<()> {
        check_shape(matrix)?;
        self.lu = None;
        let lu = matrix.clone().lu();
        if let Some(column) = lu.u().diagonal().iter().position(|d| *d == 0.0) {
            return Err(SolverError::Singular { column });
        }
        self.lu = Some(lu);
        Ok(())
    }

    fn solve(&self, b: &mut DVector<f64>) -> SolverResult<()> {
        let lu = self.lu.as_ref().ok_or_else(|| SolverError::Numeric {
            what: "solve called before a successful setup".to_string(),
        })?;
        if !lu.solve_mut(b) {
            return Err(SolverError::Numeric {
                what: "dense LU solve failed".to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dense-lu"
    }
}

/// Banded LU with partial pivoting.
///
/// Row interchanges widen the upper band to `upper + lower`; multipliers are
/// kept in the column they were produced in and replayed in order by `solve`.
#[derive(Clone, Debug)]
pub struct BandedLu {
    upper: usize,
    lower: usize,
    factors: DMatrix<f64>,
    pivots: Vec<usize>,
    factored: bool,
}

impl BandedLu {
    pub fn new(upper: usize, lower: usize) -> Self {
        Self {
            upper,
            lower,
            factors: DMatrix::zeros(0, 0),
            pivots: Vec::new(),
            factored: false,
        }
    }

    pub fn bandwidth(&self) -> (usize, usize) {
        (self.upper, self.lower)
    }
}

impl LinearSolver for BandedLu {
    fn setup(&mut self, matrix: &DMatrix<f64>) -> SolverResult<()> {
        check_shape(matrix)?;
        let n = matrix.nrows();
        self.factored = false;
        self.factors.clone_from(matrix);
        self.pivots.clear();
        self.pivots.resize(n, 0);
        let a = &mut self.factors;

        for k in 0..n {
            let last_row = (k + self.lower).min(n - 1);
            let last_col = (k + self.upper + self.lower).min(n - 1);

            let mut p = k;
            let mut best = a[(k, k)].abs();
            for i in k + 1..=last_row {
                if a[(i, k)].abs() > best {
                    best = a[(i, k)].abs();
                    p = i;
                }
            }
            if best == 0.0 {
                return Err(SolverError::Singular { column: k });
            }
            self.pivots[k] = p;
            if p != k {
                for j in k..=last_col {
                    a.swap((k, j), (p, j));
                }
            }

            let pivot = a[(k, k)];
            for i in k + 1..=last_row {
                let l = a[(i, k)] / pivot;
                a[(i, k)] = l;
                if l != 0.0 {
                    for j in k + 1..=last_col {
                        a[(i, j)] -= l * a[(k, j)];
                    }
                }
            }
        }
        self.factored = true;
        Ok(())
    }

    fn solve(&self, b: &mut DVector<f64>) -> SolverResult<()> {
        if !self.factored {
            return Err(SolverError::Numeric {
                what: "solve called before a successful setup".to_string(),
            });
        }
        let n = self.factors.nrows();
        if b.len() != n {
            return Err(SolverError::ProblemSetup {
                what: format!("right-hand side has length {}, expected {n}", b.len()),
            });
        }
        let a = &self.factors;

        for k in 0..n {
            let p = self.pivots[k];
            if p != k {
                b.swap_rows(k, p);
            }
            let bk = b[k];
            for i in k + 1..=(k + self.lower).min(n - 1) {
                b[i] -= a[(i, k)] * bk;
            }
        }
        for k in (0..n).rev() {
            let mut s = b[k];
            for j in k + 1..=(k + self.upper + self.lower).min(n - 1) {
                s -= a[(k, j)] * b[j];
            }
            b[k] = s / a[(k, k)];
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "banded-lu"
    }
}

/// Backend selected at configuration time.
#[derive(Clone, Debug)]
pub enum LinearBackend {
    Dense(DenseLu),
    Banded(BandedLu),
}

impl LinearBackend {
    pub fn from_kind(kind: LinearSolverKind) -> Self {
        match kind {
            LinearSolverKind::Dense => LinearBackend::Dense(DenseLu::new()),
            LinearSolverKind::Banded { upper, lower } => {
                LinearBackend::Banded(BandedLu::new(upper, lower))
            }
        }
    }
}

impl LinearSolver for LinearBackend {
    fn setup(&mut self, matrix: &DMatrix<f64>) -> SolverResult<()> {
        match self {
            LinearBackend::Dense(s) => s.setup(matrix),
            LinearBackend::Banded(s) => s.setup(matrix),
        }
    }

    fn solve(&self, b: &mut DVector<f64>) -> SolverResult<()> {
        match self {
            LinearBackend::Dense(s) => s.solve(b),
            LinearBackend::Banded(s) => s.solve(b),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LinearBackend::Dense(s) => s.name(),
            LinearBackend::Banded(s) => s.name(),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn banded_system() -> impl Strategy<Value = (usize, usize, DMatrix<f64>, DVector<f64>)> {
        (1usize..12, 0usize..4, 0usize..4).prop_flat_map(|(n, upper, lower)| {
            (
                Just(upper),
                Just(lower),
                proptest::collection::vec(-1.0..1.0_f64, n * n),
                proptest::collection::vec(-10.0..10.0_f64, n),
            )
                .prop_map(move |(upper, lower, entries, rhs)| {
                    let mut m = DMatrix::from_fn(n, n, |i, j| {
                        if j > i + upper || i > j + lower {
                            0.0
                        } else {
                            entries[i * n + j]
                        }
                    });
                    for i in 0..n {
                        let off: f64 = (0..n).filter(|&j| j != i).map(|j| m[(i, j)].abs()).sum();
                        m[(i, i)] = off + 1.0;
                    }
                    (upper, lower, m, DVector::from_vec(rhs))
                })
        })
    }

    proptest! {
        #[test]
        fn banded_and_dense_lu_agree((upper, lower, m, rhs) in banded_system()) {
            let mut dense = DenseLu::new();
            dense.setup(&m).unwrap();
            let mut x_dense = rhs.clone();
            dense.solve(&mut x_dense).unwrap();

            let mut banded = BandedLu::new(upper, lower);
            banded.setup(&m).unwrap();
            let mut x_band = rhs.clone();
            banded.solve(&mut x_band).unwrap();

            for i in 0..rhs.len() {
                prop_assert!(
                    (x_dense[i] - x_band[i]).abs() <= 1e-10 * (1.0 + x_dense[i].abs()),
                    "component {}: {} vs {}", i, x_dense[i], x_band[i]
                );
            }
        }
    }
}
