//! Butcher tableaus for diagonally implicit Runge-Kutta methods.

use serde::{Deserialize, Serialize};

/// Built-in DIRK tableaus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirkTableau {
    /// 2-stage SDIRK, order 2 with an order 1 embedding.
    Sdirk212,
    /// TR-BDF2 ESDIRK, order 2 with an order 3 embedding.
    Trbdf2,
    /// ARK3(2)4L[2]SA implicit part, order 3 with an order 2 embedding.
    #[default]
    Ark324,
}

/// Coefficients of an embedded DIRK pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Tableau {
    pub name: &'static str,
    pub stages: usize,
    /// Row-major lower-triangular `A`.
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
    /// Embedded weights.
    pub d: Vec<f64>,
    pub c: Vec<f64>,
    /// Order of the propagated solution.
    pub order: usize,
    /// Order of the embedded solution.
    pub embedded_order: usize,
}

impl Tableau {
    pub fn from_kind(kind: DirkTableau) -> Self {
        match kind {
            DirkTableau::Sdirk212 => Self::sdirk_2_1_2(),
            DirkTableau::Trbdf2 => Self::trbdf2(),
            DirkTableau::Ark324 => Self::ark324(),
        }
    }

    pub fn sdirk_2_1_2() -> Self {
        Self {
            name: "sdirk-2-1-2",
            stages: 2,
            a: vec![vec![1.0, 0.0], vec![-1.0, 1.0]],
            b: vec![0.5, 0.5],
            d: vec![1.0, 0.0],
            c: vec![1.0, 0.0],
            order: 2,
            embedded_order: 1,
        }
    }

    pub fn trbdf2() -> Self {
        let s2 = 2.0f64.sqrt();
        let g = (2.0 - s2) / 2.0;
        let w = s2 / 4.0;
        Self {
            name: "trbdf2",
            stages: 3,
            a: vec![vec![0.0, 0.0, 0.0], vec![g, g, 0.0], vec![w, w, g]],
            b: vec![w, w, g],
            d: vec![(1.0 - w) / 3.0, (3.0 * w + 1.0) / 3.0, g / 3.0],
            c: vec![0.0, 2.0 * g, 1.0],
            order: 2,
            embedded_order: 3,
        }
    }

    pub fn ark324() -> Self {
        let g = 1767732205903.0 / 4055673282236.0;
        let b = vec![
            1471266399579.0 / 7840856788654.0,
            -4482444167858.0 / 7529755066697.0,
            11266239266428.0 / 11593286722821.0,
            g,
        ];
        Self {
            name: "ark324l2sa",
            stages: 4,
            a: vec![
                vec![0.0, 0.0, 0.0, 0.0],
                vec![g, g, 0.0, 0.0],
                vec![
                    2746238789719.0 / 10658868560708.0,
                    -640167445237.0 / 6845629431997.0,
                    g,
                    0.0,
                ],
                b.clone(),
            ],
            b,
            d: vec![
                2756255671327.0 / 12835298489170.0,
                -10771552573575.0 / 22201958757719.0,
                9247589265047.0 / 10645013368117.0,
                2193209047091.0 / 5459859503100.0,
            ],
            c: vec![0.0, 1767732205903.0 / 2027836641118.0, 3.0 / 5.0, 1.0],
            order: 3,
            embedded_order: 2,
        }
    }

    /// Order used in the step-size exponent.
    pub fn error_order(&self) -> usize {
        self.order.min(self.embedded_order)
    }

    /// Whether the last stage equals the step solution at `t + h`.
    pub fn stiffly_accurate(&self) -> bool {
        let last = self.stages - 1;
        self.c[last] == 1.0 && self.a[last] == self.b
    }
}
