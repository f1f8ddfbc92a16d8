//! TPOINT-style physical pointing model
//!
//! Nine terms per pier side, all in degrees:
//!
//! | bit | term | meaning |
//! |-----|------|---------|
//! | 0 | IH  | hour angle zero point |
//! | 1 | ID  | declination zero point |
//! | 2 | CH  | collimation error |
//! | 3 | NP  | HA/Dec non-perpendicularity |
//! | 4 | MA  | polar axis left-right misalignment |
//! | 5 | ME  | polar axis vertical misalignment |
//! | 6 | TF  | tube flexure |
//! | 7 | FO  | fork flexure |
//! | 8 | DAF | declination axis flexure |
//!
//! ```text
//! dH = IH + CH sec(d) + NP tan(d) - MA cos(h) tan(d) + ME sin(h) tan(d)
//!      + TF cos(phi) sin(h) sec(d) - DAF (cos(phi) cos(h) + sin(phi) tan(d))
//! dD = ID + MA sin(h) + ME cos(h) + TF (cos(phi) cos(h) sin(d) - sin(phi) cos(d))
//!      + FO cos(h)
//! ```

use serde::{Deserialize, Serialize};

use crate::fit::{enabled_points, parameter_row, requested_sides, LinearSystem, SideParameters};
use crate::{
    AlignmentError, AlignmentResult, Correction, PierSide, PointingModel, SyncDataPoint,
};

pub(crate) const TPOINT_TERMS: usize = 9;
pub(crate) const TPOINT_NAMES: [&str; TPOINT_TERMS] =
    ["IH", "ID", "CH", "NP", "MA", "ME", "TF", "FO", "DAF"];

/// Rows of the nine physical terms at (h, d) in radians for latitude phi
pub(crate) fn tpoint_rows(h: f64, d: f64, phi: f64) -> (Vec<f64>, Vec<f64>) {
    let (sin_h, cos_h) = h.sin_cos();
    let (sin_d, cos_d) = d.sin_cos();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let tan_d = sin_d / cos_d;
    let sec_d = 1.0 / cos_d;

    let ha_row = vec![
        1.0,
        0.0,
        sec_d,
        tan_d,
        -cos_h * tan_d,
        sin_h * tan_d,
        cos_phi * sin_h * sec_d,
        0.0,
        -(cos_phi * cos_h + sin_phi * tan_d),
    ];
    let dec_row = vec![
        0.0,
        1.0,
        0.0,
        0.0,
        sin_h,
        cos_h,
        cos_phi * cos_h * sin_d - sin_phi * cos_d,
        cos_h,
        0.0,
    ];
    (ha_row, dec_row)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpointPointingModel {
    /// Site latitude in degrees
    latitude: f64,
    /// Bit i enables term i
    model_config: u32,
    parameters: SideParameters,
    #[serde(default)]
    sync_points: Vec<SyncDataPoint>,
}

impl TpointPointingModel {
    /// All nine terms enabled
    pub fn new(latitude: f64) -> Self {
        Self::with_config(latitude, (1 << TPOINT_TERMS) - 1)
    }

    pub fn with_config(latitude: f64, model_config: u32) -> Self {
        Self {
            latitude,
            model_config,
            parameters: SideParameters::default(),
            sync_points: Vec::new(),
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn model_config(&self) -> u32 {
        self.model_config
    }

    pub fn parameters(&self, side: PierSide) -> AlignmentResult<&[f64]> {
        self.parameters.get(side)
    }

    fn active_terms(&self) -> [bool; TPOINT_TERMS] {
        let mut active = [false; TPOINT_TERMS];
        for (i, flag) in active.iter_mut().enumerate() {
            *flag = self.model_config & (1 << i) != 0;
        }
        active
    }
}

impl PointingModel for TpointPointingModel {
    fn family(&self) -> &'static str {
        "tpoint"
    }

    fn correction(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<Correction> {
        let parameters = self.parameters.get(pier_side)?;
        let (ha_row, dec_row) = tpoint_rows(
            (hour_angle * 15.0).to_radians(),
            dec.to_radians(),
            self.latitude.to_radians(),
        );
        Ok(Correction {
            hour_angle: dot(parameters, &ha_row) / 15.0,
            dec: dot(parameters, &dec_row),
        })
    }

    fn fit(&mut self, points: &[SyncDataPoint], pier_side: PierSide) -> AlignmentResult<()> {
        let points = enabled_points(points);
        let phi = self.latitude.to_radians();
        let active = self.active_terms();
        let mut fitted_any = false;

        for side in requested_sides(pier_side) {
            let mut system = LinearSystem::new(TPOINT_TERMS);
            for (point, point_side) in &points {
                if *point_side != side {
                    continue;
                }
                let (ha_row, dec_row) = tpoint_rows(
                    (point.celestial_hour_angle() * 15.0).to_radians(),
                    point.celestial_dec.to_radians(),
                    phi,
                );
                let (dha, ddec) = point.offsets();
                system.push(ha_row, dha * 15.0);
                system.push(dec_row, ddec);
            }
            if system.equations() == 0 {
                tracing::debug!("Tpoint model: no sync points for pier side {}", side);
                continue;
            }
            let parameters = system.solve(&active)?;
            self.parameters.set(side, parameters);
            fitted_any = true;
        }

        if fitted_any {
            Ok(())
        } else {
            Err(AlignmentError::TooFewPoints {
                required: active.iter().filter(|a| **a).count(),
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
        let mut lines = vec![format!(
            "latitude {:.4} deg, config {:#011b}",
            self.latitude, self.model_config
        )];
        for (i, name) in TPOINT_NAMES.iter().enumerate() {
            lines.push(parameter_row(
                name,
                self.parameters.west.as_ref().map(|p| p[i]),
                self.parameters.east.as_ref().map(|p| p[i]),
            ));
        }
        lines
    }

    fn validate(&self) -> AlignmentResult<()> {
        if self.model_config >= 1 << TPOINT_TERMS {
            return Err(AlignmentError::Configuration(format!(
                "tpoint model config {:#b} uses more than {} bits",
                self.model_config, TPOINT_TERMS
            )));
        }
        self.parameters.check_len(TPOINT_TERMS, self.family())
    }
}
