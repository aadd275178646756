//! Root detection on the dense output of accepted steps.
//!
//! Each search covers `[t_lo, t_hi]`, where `t_lo` is the end of the
//! previous search. Sign changes are bracketed with the Illinois variant of
//! the secant method; a component that is exactly zero at `t_lo` stays
//! inactive until it moves off zero.

use crate::error::SimResult;
use crate::options::RootDirection;
use serde::Serialize;
use sf_core::time_roundoff;

/// A root function that changed sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RootCrossing {
    pub index: usize,
    /// `+1` rising, `-1` falling.
    pub direction: i8,
}

#[derive(Clone, Debug)]
pub(crate) struct RootFinder {
    directions: Vec<RootDirection>,
    active: Vec<bool>,
    t_lo: f64,
    g_lo: Vec<f64>,
    g_hi: Vec<f64>,
    g_mid: Vec<f64>,
}

impl RootFinder {
    pub fn new(count: usize, directions: &[RootDirection]) -> Self {
        let directions = if directions.is_empty() {
            vec![RootDirection::Both; count]
        } else {
            directions.to_vec()
        };
        Self {
            directions,
            active: vec![true; count],
            t_lo: 0.0,
            g_lo: vec![0.0; count],
            g_hi: vec![0.0; count],
            g_mid: vec![0.0; count],
        }
    }

    pub fn count(&self) -> usize {
        self.g_lo.len()
    }

    /// Searched up to here.
    pub fn t_lo(&self) -> f64 {
        self.t_lo
    }

    pub fn initialize<G>(&mut self, t0: f64, mut g: G) -> SimResult<()>
    where
        G: FnMut(f64, &mut [f64]) -> SimResult<()>,
    {
        self.t_lo = t0;
        if self.count() == 0 {
            return Ok(());
        }
        g(t0, &mut self.g_lo)?;
        for (active, gi) in self.active.iter_mut().zip(&self.g_lo) {
            *active = *gi != 0.0;
        }
        Ok(())
    }

    /// Look for the first root in `(t_lo, t_hi]`; `g` evaluates the root
    /// functions on the current dense output.
    pub fn search<G>(&mut self, t_hi: f64, mut g: G) -> SimResult<Option<(f64, Vec<RootCrossing>)>>
    where
        G: FnMut(f64, &mut [f64]) -> SimResult<()>,
    {
        if self.count() == 0 || t_hi <= self.t_lo {
            return Ok(None);
        }
        g(t_hi, &mut self.g_hi)?;

        let eligible = self.active.clone();
        let tol = time_roundoff(t_hi, t_hi - self.t_lo);
        let (mut tlo, mut thi) = (self.t_lo, t_hi);

        if self.strongest_change(&eligible).is_some() {
            let mut alpha = 1.0;
            let mut side = 0;
            let mut side_prev = -1;
            while (thi - tlo).abs() > tol {
                let Some(imax) = self.strongest_change(&eligible) else {
                    break;
                };
                if side_prev == side {
                    alpha = if side == 2 { alpha * 2.0 } else { alpha * 0.5 };
                } else {
                    alpha = 1.0;
                }

                let (glo, ghi) = (self.g_lo[imax], self.g_hi[imax]);
                let mut tmid = thi - (thi - tlo) * ghi / (ghi - alpha * glo);
                let span = (thi - tlo).abs();
                // keep tmid off the bracket ends
                if (tmid - tlo).abs() < 0.5 * tol {
                    let frac = if span / tol > 5.0 { 0.1 } else { 0.5 * tol / span };
                    tmid = tlo + frac * (thi - tlo);
                }
                if (thi - tmid).abs() < 0.5 * tol {
                    let frac = if span / tol > 5.0 { 0.1 } else { 0.5 * tol / span };
                    tmid = thi - frac * (thi - tlo);
                }

                g(tmid, &mut self.g_mid)?;
                side_prev = side;
                if self.changes_between(&eligible, &self.g_lo, &self.g_mid) {
                    thi = tmid;
                    std::mem::swap(&mut self.g_hi, &mut self.g_mid);
                    side = 1;
                } else {
                    tlo = tmid;
                    std::mem::swap(&mut self.g_lo, &mut self.g_mid);
                    side = 2;
                }
            }
        }

        let mut crossings = Vec::new();
        for i in 0..self.count() {
            let (glo, ghi) = (self.g_lo[i], self.g_hi[i]);
            if self.crosses(&eligible, i, glo, ghi) {
                crossings.push(RootCrossing {
                    index: i,
                    direction: if ghi > glo { 1 } else { -1 },
                });
            }
        }

        self.t_lo = thi;
        self.g_lo.copy_from_slice(&self.g_hi);
        for (active, gi) in self.active.iter_mut().zip(&self.g_lo) {
            *active = *gi != 0.0;
        }

        if crossings.is_empty() {
            // a full interval without roots moves the search window forward
            self.t_lo = t_hi;
            Ok(None)
        } else {
            Ok(Some((thi, crossings)))
        }
    }

    fn crosses(&self, eligible: &[bool], i: usize, glo: f64, ghi: f64) -> bool {
        if !eligible[i] || !(ghi == 0.0 || glo * ghi < 0.0) {
            return false;
        }
        let sign = self.directions[i].sign();
        sign == 0.0 || sign * (ghi - glo) > 0.0
    }

    fn changes_between(&self, eligible: &[bool], lo: &[f64], hi: &[f64]) -> bool {
        (0..self.count()).any(|i| self.crosses(eligible, i, lo[i], hi[i]))
    }

    /// Component with a strict sign change whose secant root lies earliest.
    fn strongest_change(&self, eligible: &[bool]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for i in 0..self.count() {
            let (glo, ghi) = (self.g_lo[i], self.g_hi[i]);
            if glo * ghi < 0.0 && self.crosses(eligible, i, glo, ghi) {
                let frac = (ghi / (ghi - glo)).abs();
                if best.is_none_or(|(_, f)| frac > f) {
                    best = Some((i, frac));
                }
            }
        }
        best.map(|(i, _)| i)
    }
}
