//! General analytical pointing model
//!
//! The nine physical terms of the Tpoint model plus linear and quadratic
//! scale terms, each group switched by one bit of a [`ModelConfig`]. Bit 0
//! chooses between fitting each pier side on its own and one joint fit
//! shared by both sides.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::fit::{enabled_points, parameter_row, requested_sides, LinearSystem, SideParameters};
use crate::tpoint::{tpoint_rows, TPOINT_NAMES, TPOINT_TERMS};
use crate::{
    AlignmentError, AlignmentResult, Correction, PierSide, PointingModel, SyncDataPoint,
};

const TERMS: usize = TPOINT_TERMS + 4;
const NAMES: [&str; 4] = ["LH", "LD", "QH", "QD"];

/// 11-bit term selection of the general model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelConfig(u32);

impl ModelConfig {
    pub const SEPARATE_PIER_SIDES: ModelConfig = ModelConfig(1 << 0);
    /// IH, ID
    pub const OFFSETS: ModelConfig = ModelConfig(1 << 1);
    pub const COLLIMATION: ModelConfig = ModelConfig(1 << 2);
    pub const NON_PERPENDICULARITY: ModelConfig = ModelConfig(1 << 3);
    pub const POLAR_AXIS_HORIZONTAL: ModelConfig = ModelConfig(1 << 4);
    pub const POLAR_AXIS_VERTICAL: ModelConfig = ModelConfig(1 << 5);
    pub const TUBE_FLEXURE: ModelConfig = ModelConfig(1 << 6);
    pub const FORK_FLEXURE: ModelConfig = ModelConfig(1 << 7);
    pub const DEC_AXIS_FLEXURE: ModelConfig = ModelConfig(1 << 8);
    /// LH, LD
    pub const LINEAR_SCALE: ModelConfig = ModelConfig(1 << 9);
    /// QH, QD
    pub const QUADRATIC_SCALE: ModelConfig = ModelConfig(1 << 10);
    pub const ALL: ModelConfig = ModelConfig((1 << 11) - 1);

    pub fn from_bits(bits: u32) -> AlignmentResult<Self> {
        if bits > Self::ALL.0 {
            return Err(AlignmentError::Configuration(format!(
                "alignment config {:#b} uses more than 11 bits",
                bits
            )));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ModelConfig) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn separate_pier_sides(self) -> bool {
        self.contains(Self::SEPARATE_PIER_SIDES)
    }

    /// Active flag per model term
    fn active_terms(self) -> [bool; TERMS] {
        let bit = |b: u32| self.0 & (1 << b) != 0;
        let mut active = [false; TERMS];
        active[0] = bit(1);
        active[1] = bit(1);
        for (term, flag) in active.iter_mut().enumerate().take(TPOINT_TERMS).skip(2) {
            *flag = bit(term as u32);
        }
        active[9] = bit(9);
        active[10] = bit(9);
        active[11] = bit(10);
        active[12] = bit(10);
        active
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for ModelConfig {
    type Output = ModelConfig;

    fn bitor(self, rhs: Self) -> Self {
        ModelConfig(self.0 | rhs.0)
    }
}

/// Rows of all thirteen terms at (h, d) in radians
fn general_rows(h: f64, d: f64, phi: f64) -> (Vec<f64>, Vec<f64>) {
    let (mut ha_row, mut dec_row) = tpoint_rows(h, d, phi);
    ha_row.extend([h, 0.0, h * h, 0.0]);
    dec_row.extend([0.0, d, 0.0, d * d]);
    (ha_row, dec_row)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralAnalyticalPointingModel {
    /// Site latitude in degrees
    latitude: f64,
    config: ModelConfig,
    parameters: SideParameters,
    #[serde(default)]
    sync_points: Vec<SyncDataPoint>,
}

impl GeneralAnalyticalPointingModel {
    pub fn new(latitude: f64, config: ModelConfig) -> Self {
        Self {
            latitude,
            config,
            parameters: SideParameters::default(),
            sync_points: Vec::new(),
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn config(&self) -> ModelConfig {
        self.config
    }

    pub fn parameters(&self, side: PierSide) -> AlignmentResult<&[f64]> {
        self.parameters.get(side)
    }

    /// Pier side of a target at `hour_angle`. The hour-angle heuristic puts
    /// hour angle <= 0 on the West side; a mount pointing with the
    /// counterweight up sits on the other side.
    pub fn pier_side_from_hour_angle(hour_angle: f64, force_counterweight_up: bool) -> PierSide {
        let side = PierSide::from_hour_angle(hour_angle);
        if force_counterweight_up {
            side.opposite()
        } else {
            side
        }
    }
}

impl PointingModel for GeneralAnalyticalPointingModel {
    fn family(&self) -> &'static str {
        "general"
    }

    fn correction(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<Correction> {
        let parameters = self.parameters.get(pier_side)?;
        let (ha_row, dec_row) = general_rows(
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
        let active = self.config.active_terms();

        let build = |side: Option<PierSide>| {
            let mut system = LinearSystem::new(TERMS);
            for (point, point_side) in &points {
                if side.is_some_and(|s| s != *point_side) {
                    continue;
                }
                let (ha_row, dec_row) = general_rows(
                    (point.celestial_hour_angle() * 15.0).to_radians(),
                    point.celestial_dec.to_radians(),
                    phi,
                );
                let (dha, ddec) = point.offsets();
                system.push(ha_row, dha * 15.0);
                system.push(dec_row, ddec);
            }
            system
        };

        if !self.config.separate_pier_sides() {
            let parameters = build(None).solve(&active)?;
            self.parameters.set(PierSide::None, parameters);
            return Ok(());
        }

        let mut fitted_any = false;
        for side in requested_sides(pier_side) {
            let system = build(Some(side));
            if system.equations() == 0 {
                tracing::debug!("General model: no sync points for pier side {}", side);
                continue;
            }
            self.parameters.set(side, system.solve(&active)?);
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
            "latitude {:.4} deg, config {:#013b}{}",
            self.latitude,
            self.config.bits(),
            if self.config.separate_pier_sides() {
                ""
            } else {
                " (joint fit)"
            }
        )];
        for (i, name) in TPOINT_NAMES.iter().chain(NAMES.iter()).enumerate() {
            lines.push(parameter_row(
                name,
                self.parameters.west.as_ref().map(|p| p[i]),
                self.parameters.east.as_ref().map(|p| p[i]),
            ));
        }
        lines
    }

    fn validate(&self) -> AlignmentResult<()> {
        ModelConfig::from_bits(self.config.bits())?;
        self.parameters.check_len(TERMS, self.family())
    }
}
