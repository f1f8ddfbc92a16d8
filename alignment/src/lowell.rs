//! Lowell pointing model (Buie, "General analytical telescope pointing model")
//!
//! Two four-term expansions per pier side:
//!
//! - hour angle: `a0 + a1 sec(d) + a2 tan(d) + a3 cos(h) tan(d)`
//! - declination: `b0 + b1 sin(h) + b2 cos(h) + b3 d`
//!
//! with d in radians in the linear term. Coefficients are in degrees.

use serde::{Deserialize, Serialize};

use crate::fit::{enabled_points, parameter_row, requested_sides, LinearSystem, SideParameters};
use crate::{
    AlignmentError, AlignmentResult, Correction, PierSide, PointingModel, SyncDataPoint,
};

const TERMS: usize = 4;

fn ha_basis(h: f64, d: f64) -> Vec<f64> {
    vec![1.0, 1.0 / d.cos(), d.tan(), h.cos() * d.tan()]
}

fn dec_basis(h: f64, d: f64) -> Vec<f64> {
    vec![1.0, h.sin(), h.cos(), d]
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LowellPointingModel {
    ha_coefficients: SideParameters,
    dec_coefficients: SideParameters,
    #[serde(default)]
    sync_points: Vec<SyncDataPoint>,
}

impl LowellPointingModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hour-angle coefficients of one side
    pub fn ha_coefficients(&self, side: PierSide) -> AlignmentResult<&[f64]> {
        self.ha_coefficients.get(side)
    }

    /// Declination coefficients of one side
    pub fn dec_coefficients(&self, side: PierSide) -> AlignmentResult<&[f64]> {
        self.dec_coefficients.get(side)
    }
}

impl PointingModel for LowellPointingModel {
    fn family(&self) -> &'static str {
        "lowell"
    }

    fn correction(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<Correction> {
        let ha_coefficients = self.ha_coefficients.get(pier_side)?;
        let dec_coefficients = self.dec_coefficients.get(pier_side)?;
        let h = (hour_angle * 15.0).to_radians();
        let d = dec.to_radians();
        Ok(Correction {
            hour_angle: dot(ha_coefficients, &ha_basis(h, d)) / 15.0,
            dec: dot(dec_coefficients, &dec_basis(h, d)),
        })
    }

    fn fit(&mut self, points: &[SyncDataPoint], pier_side: PierSide) -> AlignmentResult<()> {
        let points = enabled_points(points);
        let mut fitted_any = false;
        for side in requested_sides(pier_side) {
            let mut ha_system = LinearSystem::new(TERMS);
            let mut dec_system = LinearSystem::new(TERMS);
            for (point, point_side) in &points {
                if *point_side != side {
                    continue;
                }
                let h = (point.celestial_hour_angle() * 15.0).to_radians();
                let d = point.celestial_dec.to_radians();
                let (dha, ddec) = point.offsets();
                ha_system.push(ha_basis(h, d), dha * 15.0);
                dec_system.push(dec_basis(h, d), ddec);
            }
            if ha_system.equations() == 0 {
                tracing::debug!("Lowell model: no sync points for pier side {}", side);
                continue;
            }
            let active = [true; TERMS];
            let ha = ha_system.solve(&active)?;
            let dec = dec_system.solve(&active)?;
            self.ha_coefficients.set(side, ha);
            self.dec_coefficients.set(side, dec);
            fitted_any = true;
        }
        if fitted_any {
            Ok(())
        } else {
            Err(AlignmentError::TooFewPoints {
                required: TERMS,
                available: 0,
            })
        }
    }

    fn sync_points(&self) -> &[SyncDataPoint] {
        &self.sync_points
    }

    fn sync_points_mut(&mut self) -> &mut Vec<SyncDataPoint> {
        &mut self.sync_points
    }

    fn parameter_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (prefix, parameters) in [("A", &self.ha_coefficients), ("B", &self.dec_coefficients)] {
            for i in 0..TERMS {
                let west = parameters.west.as_ref().map(|p| p[i]);
                let east = parameters.east.as_ref().map(|p| p[i]);
                lines.push(parameter_row(&format!("{}{}", prefix, i), west, east));
            }
        }
        lines
    }

    fn validate(&self) -> AlignmentResult<()> {
        self.ha_coefficients.check_len(TERMS, self.family())?;
        self.dec_coefficients.check_len(TERMS, self.family())
    }
}
