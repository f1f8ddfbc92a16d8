//! Spherical-harmonics pointing model
//!
//! Each component of the correction (hour angle, declination) is expanded in
//! unnormalised real spherical harmonics `P_l^m(sin d) cos(m h)` and
//! `P_l^m(sin d) sin(m h)` of degree 1..=L+1, plus the same functions of
//! degree 1..=L weighted by `cos(d)`. That gives 3, 11 and 23 functions per
//! component for order L = 0, 1, 2. One parameter vector serves both pier
//! sides.

use serde::{Deserialize, Serialize};

use crate::fit::{enabled_points, LinearSystem};
use crate::{
    AlignmentError, AlignmentResult, Correction, PierSide, PointingModel, SyncDataPoint,
};

/// Highest supported harmonic order
pub const MAX_ORDER: usize = 2;

/// Associated Legendre function P_l^m(x) without Condon-Shortley phase
fn legendre(l: usize, m: usize, x: f64) -> f64 {
    let somx2 = (1.0 - x * x).max(0.0).sqrt();
    // P_m^m = (2m-1)!! (1-x^2)^(m/2)
    let mut pmm = 1.0;
    let mut odd = 1.0;
    for _ in 0..m {
        pmm *= odd * somx2;
        odd += 2.0;
    }
    if l == m {
        return pmm;
    }
    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmmp1;
    }
    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        pll = ((2 * ll - 1) as f64 * x * pmmp1 - (ll + m - 1) as f64 * pmm) / (ll - m) as f64;
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

/// Real harmonics of one degree: m = 0, then cos/sin pairs for m = 1..=l
fn push_degree(basis: &mut Vec<f64>, l: usize, h: f64, x: f64, weight: f64) {
    basis.push(weight * legendre(l, 0, x));
    for m in 1..=l {
        let p = legendre(l, m, x);
        let (sin_mh, cos_mh) = (m as f64 * h).sin_cos();
        basis.push(weight * p * cos_mh);
        basis.push(weight * p * sin_mh);
    }
}

/// Basis functions of one component at (h, d) in radians.
///
/// Degrees run from 1, so there is no Y00 term and a constant zero-point
/// is only approximated through the low degrees. Per component that is
/// degrees 1..=order+1 plus cos(d) times degrees 1..=order, giving 3, 11
/// and 23 functions, doubled for the two axes into 6, 22 and 46.
fn component_basis(order: usize, h: f64, d: f64) -> Vec<f64> {
    let x = d.sin();
    let mut basis = Vec::with_capacity(functions_per_component(order));
    for l in 1..=order + 1 {
        push_degree(&mut basis, l, h, x, 1.0);
    }
    for l in 1..=order {
        push_degree(&mut basis, l, h, x, d.cos());
    }
    basis
}

fn functions_per_component(order: usize) -> usize {
    let degrees = |n: usize| (1..=n).map(|l| 2 * l + 1).sum::<usize>();
    degrees(order + 1) + degrees(order)
}

/// Parameter count for an order: 6, 22 or 46
pub fn parameter_count(order: usize) -> AlignmentResult<usize> {
    if order > MAX_ORDER {
        return Err(AlignmentError::Configuration(format!(
            "order of spherical harmonics {} > {} not supported",
            order, MAX_ORDER
        )));
    }
    Ok(2 * functions_per_component(order))
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticalPointingModel {
    order: usize,
    /// Hour-angle coefficients followed by declination coefficients
    parameters: Option<Vec<f64>>,
    #[serde(default)]
    sync_points: Vec<SyncDataPoint>,
}

impl AnalyticalPointingModel {
    /// Fails for order > 2
    pub fn new(order: usize) -> AlignmentResult<Self> {
        parameter_count(order)?;
        Ok(Self {
            order,
            parameters: None,
            sync_points: Vec::new(),
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn parameter_count(&self) -> usize {
        2 * functions_per_component(self.order)
    }

    pub fn parameters(&self) -> Option<&[f64]> {
        self.parameters.as_deref()
    }
}

impl PointingModel for AnalyticalPointingModel {
    fn family(&self) -> &'static str {
        "spherical_harmonics"
    }

    fn correction(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<Correction> {
        let parameters = self
            .parameters
            .as_deref()
            .ok_or(AlignmentError::NotFitted(pier_side))?;
        let n = functions_per_component(self.order);
        let basis = component_basis(self.order, (hour_angle * 15.0).to_radians(), dec.to_radians());
        Ok(Correction {
            hour_angle: dot(&parameters[..n], &basis) / 15.0,
            dec: dot(&parameters[n..], &basis),
        })
    }

    /// Both sides share one expansion; the pier side argument is ignored
    fn fit(&mut self, points: &[SyncDataPoint], _pier_side: PierSide) -> AlignmentResult<()> {
        let n = functions_per_component(self.order);
        let mut ha_system = LinearSystem::new(n);
        let mut dec_system = LinearSystem::new(n);
        for (point, _) in enabled_points(points) {
            let basis = component_basis(
                self.order,
                (point.celestial_hour_angle() * 15.0).to_radians(),
                point.celestial_dec.to_radians(),
            );
            let (dha, ddec) = point.offsets();
            ha_system.push(basis.clone(), dha * 15.0);
            dec_system.push(basis, ddec);
        }
        let active = vec![true; n];
        let mut parameters = ha_system.solve(&active)?;
        parameters.extend(dec_system.solve(&active)?);
        self.parameters = Some(parameters);
        Ok(())
    }

    fn sync_points(&self) -> &[SyncDataPoint] {
        &self.sync_points
    }

    fn sync_points_mut(&mut self) -> &mut Vec<SyncDataPoint> {
        &mut self.sync_points
    }

    fn parameter_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("order {}", self.order)];
        if let Some(parameters) = &self.parameters {
            let n = functions_per_component(self.order);
            for (i, p) in parameters.iter().enumerate() {
                let (component, index) = if i < n { ("H", i) } else { ("D", i - n) };
                lines.push(format!("{}{:<6} {:>14.8}", component, index, p));
            }
        } else {
            lines.push("not fitted".to_string());
        }
        lines
    }

    fn validate(&self) -> AlignmentResult<()> {
        let count = parameter_count(self.order)?;
        match &self.parameters {
            Some(p) if p.len() != count => Err(AlignmentError::Configuration(format!(
                "spherical harmonics model of order {} expects {} parameters, found {}",
                self.order,
                count,
                p.len()
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_points::{sky_grid, synthetic};
    use crate::range_shift_hour_angle;

    #[test]
    fn test_parameter_counts_per_order() {
        assert_eq!(AnalyticalPointingModel::new(0).unwrap().parameter_count(), 6);
        assert_eq!(AnalyticalPointingModel::new(1).unwrap().parameter_count(), 22);
        assert_eq!(AnalyticalPointingModel::new(2).unwrap().parameter_count(), 46);
        for order in 0..=2 {
            assert_eq!(
                component_basis(order, 0.3, 0.2).len() * 2,
                parameter_count(order).unwrap()
            );
        }
    }

    #[test]
    fn test_order_three_fails_at_construction() {
        let err = AnalyticalPointingModel::new(3).unwrap_err();
        assert!(matches!(err, AlignmentError::Configuration(_)));
    }

    #[test]
    fn test_legendre_values() {
        let x = 0.4_f64;
        assert!((legendre(1, 0, x) - x).abs() < 1e-15);
        assert!((legendre(1, 1, x) - (1.0 - x * x).sqrt()).abs() < 1e-15);
        assert!((legendre(2, 0, x) - 0.5 * (3.0 * x * x - 1.0)).abs() < 1e-15);
        assert!((legendre(2, 1, x) - 3.0 * x * (1.0 - x * x).sqrt()).abs() < 1e-15);
        assert!((legendre(2, 2, x) - 3.0 * (1.0 - x * x)).abs() < 1e-14);
        assert!((legendre(3, 0, x) - 0.5 * (5.0 * x.powi(3) - 3.0 * x)).abs() < 1e-15);
    }

    #[test]
    fn test_fit_reproduces_generating_model() {
        let mut truth = AnalyticalPointingModel::new(1).unwrap();
        truth.parameters = Some((0..22).map(|i| 0.002 * ((i % 7) as f64 - 3.0)).collect());
        let points = synthetic(&sky_grid(), 5.0, |ha, dec, side| {
            truth.apply(ha, dec, side).unwrap()
        });

        let mut model = AnalyticalPointingModel::new(1).unwrap();
        model.fit(&points, PierSide::None).unwrap();

        let (raw_ha, raw_dec) = model.apply(-2.2, 35.0, PierSide::West).unwrap();
        let (expected_ha, expected_dec) = truth.apply(-2.2, 35.0, PierSide::West).unwrap();
        assert!((raw_ha - expected_ha).abs() < 1e-8);
        assert!((raw_dec - expected_dec).abs() < 1e-8);

        let (back_ha, back_dec) = model.apply_inverse(raw_ha, raw_dec, PierSide::West).unwrap();
        assert!(range_shift_hour_angle(back_ha + 2.2).abs() < 1e-9);
        assert!((back_dec - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_unfitted_model_refuses_to_apply() {
        let model = AnalyticalPointingModel::new(0).unwrap();
        assert!(matches!(
            model.apply(1.0, 10.0, PierSide::East),
            Err(AlignmentError::NotFitted(_))
        ));
    }
}
