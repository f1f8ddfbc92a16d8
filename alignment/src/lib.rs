//! Telescope pointing models
//!
//! Corrections between true ("celestial") sky coordinates and the raw
//! coordinates a mount reports, fitted by least squares from sync points.
//!
//! ## Conventions
//!
//! - Hour angle in hours, range-shifted into (-12, 12]
//! - Right ascension in hours, range-shifted into [0, 24)
//! - Declination in degrees
//! - `apply` maps true -> raw (the coordinates to send to the mount),
//!   `apply_inverse` maps raw -> true
//! - Model parameters are stored in degrees

mod error;
mod fit;
mod general;
mod harmonics;
mod lowell;
mod persist;
mod sync_data;
mod tpoint;

pub use error::{AlignmentError, AlignmentResult};
pub use general::{GeneralAnalyticalPointingModel, ModelConfig};
pub use harmonics::AnalyticalPointingModel;
pub use lowell::LowellPointingModel;
pub use persist::MODEL_FORMAT_VERSION;
pub use sync_data::{parse_sync_data_csv, read_sync_data_csv};
pub use tpoint::TpointPointingModel;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Iteration limit of `apply_inverse`
pub const INVERSE_MAX_ITERATIONS: usize = 100;
/// Convergence tolerance of `apply_inverse` (hours / degrees)
pub const INVERSE_TOLERANCE: f64 = 1e-12;

/// Shift an hour angle into (-12, 12]
pub fn range_shift_hour_angle(hour_angle: f64) -> f64 {
    let mut shifted = hour_angle % 24.0;
    if shifted > 12.0 {
        shifted -= 24.0;
    } else if shifted <= -12.0 {
        shifted += 24.0;
    }
    shifted
}

/// Shift a right ascension into [0, 24)
pub fn range_shift_right_ascension(ra: f64) -> f64 {
    let mut shifted = ra % 24.0;
    if shifted < 0.0 {
        shifted += 24.0;
    }
    if shifted >= 24.0 {
        shifted = 0.0;
    }
    shifted
}

/// Side of the pier the tube is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PierSide {
    West,
    East,
    /// Not reported by the device
    #[default]
    None,
}

impl PierSide {
    /// Fallback when the device does not report a side: hour angle <= 0 is West
    pub fn from_hour_angle(hour_angle: f64) -> Self {
        if range_shift_hour_angle(hour_angle) <= 0.0 {
            PierSide::West
        } else {
            PierSide::East
        }
    }

    /// This side, or the hour-angle fallback when it is None
    pub fn resolve(self, hour_angle: f64) -> Self {
        match self {
            PierSide::None => Self::from_hour_angle(hour_angle),
            side => side,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PierSide::West => PierSide::East,
            PierSide::East => PierSide::West,
            PierSide::None => PierSide::None,
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "West" | "WEST" | "west" => Some(PierSide::West),
            "East" | "EAST" | "east" => Some(PierSide::East),
            "None" | "NONE" | "none" => Some(PierSide::None),
            _ => None,
        }
    }
}

impl fmt::Display for PierSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PierSide::West => write!(f, "West"),
            PierSide::East => write!(f, "East"),
            PierSide::None => write!(f, "None"),
        }
    }
}

/// One calibration sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDataPoint {
    pub created: DateTime<Utc>,
    /// Local sidereal time in hours
    pub local_sidereal_time: f64,
    /// True position, RA in hours, Dec in degrees
    pub celestial_ra: f64,
    pub celestial_dec: f64,
    /// Position reported by the mount
    pub telescope_ra: f64,
    pub telescope_dec: f64,
    pub pier_side: PierSide,
    /// Disabled points are kept but excluded from fits
    pub enabled: bool,
}

impl SyncDataPoint {
    pub fn new(
        local_sidereal_time: f64,
        celestial_ra: f64,
        celestial_dec: f64,
        telescope_ra: f64,
        telescope_dec: f64,
        pier_side: PierSide,
    ) -> Self {
        Self {
            created: Utc::now(),
            local_sidereal_time,
            celestial_ra,
            celestial_dec,
            telescope_ra,
            telescope_dec,
            pier_side,
            enabled: true,
        }
    }

    /// True hour angle in hours
    pub fn celestial_hour_angle(&self) -> f64 {
        range_shift_hour_angle(self.local_sidereal_time - self.celestial_ra)
    }

    /// Raw hour angle in hours
    pub fn telescope_hour_angle(&self) -> f64 {
        range_shift_hour_angle(self.local_sidereal_time - self.telescope_ra)
    }

    /// Pier side with the hour-angle fallback applied
    pub fn resolved_pier_side(&self) -> PierSide {
        self.pier_side.resolve(self.celestial_hour_angle())
    }

    /// Observed raw - true offsets: hour angle in hours, declination in degrees
    pub fn offsets(&self) -> (f64, f64) {
        (
            range_shift_hour_angle(self.telescope_hour_angle() - self.celestial_hour_angle()),
            self.telescope_dec - self.celestial_dec,
        )
    }
}

/// Correction at one position: hour angle in hours, declination in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Correction {
    pub hour_angle: f64,
    pub dec: f64,
}

/// Capabilities shared by all pointing model families
pub trait PointingModel {
    /// Family tag used in model files
    fn family(&self) -> &'static str;

    /// raw - true offsets at a true position on the given (resolved) side
    fn correction(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<Correction>;

    /// Fit from the enabled points. `PierSide::None` fits every side the
    /// model distinguishes.
    fn fit(&mut self, points: &[SyncDataPoint], pier_side: PierSide) -> AlignmentResult<()>;

    fn sync_points(&self) -> &[SyncDataPoint];

    fn sync_points_mut(&mut self) -> &mut Vec<SyncDataPoint>;

    /// Human-readable parameter listing
    fn parameter_lines(&self) -> Vec<String>;

    /// Consistency check after loading
    fn validate(&self) -> AlignmentResult<()>;

    /// True -> raw
    fn apply(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<(f64, f64)> {
        let hour_angle = range_shift_hour_angle(hour_angle);
        let side = pier_side.resolve(hour_angle);
        let c = self.correction(hour_angle, dec, side)?;
        Ok((range_shift_hour_angle(hour_angle + c.hour_angle), dec + c.dec))
    }

    /// Raw -> true, solving `raw = t + f(t)` by fixed-point iteration
    fn apply_inverse(
        &self,
        hour_angle: f64,
        dec: f64,
        pier_side: PierSide,
    ) -> AlignmentResult<(f64, f64)> {
        let raw_ha = range_shift_hour_angle(hour_angle);
        let side = pier_side.resolve(raw_ha);
        let (mut ha, mut de) = (raw_ha, dec);
        for _ in 0..INVERSE_MAX_ITERATIONS {
            let c = self.correction(range_shift_hour_angle(ha), de, side)?;
            let next_ha = raw_ha - c.hour_angle;
            let next_dec = dec - c.dec;
            let converged = (next_ha - ha).abs() < INVERSE_TOLERANCE
                && (next_dec - de).abs() < INVERSE_TOLERANCE;
            ha = next_ha;
            de = next_dec;
            if !ha.is_finite() || !de.is_finite() {
                break;
            }
            if converged {
                return Ok((range_shift_hour_angle(ha), de));
            }
        }
        Err(AlignmentError::NoConvergence(INVERSE_MAX_ITERATIONS))
    }
}

/// Pointing model of one of the supported families
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlignmentModel {
    Lowell(LowellPointingModel),
    Tpoint(TpointPointingModel),
    SphericalHarmonics(AnalyticalPointingModel),
    General(GeneralAnalyticalPointingModel),
}

impl AlignmentModel {
    /// Load a model of whatever family the file holds
    pub fn create(path: impl AsRef<Path>) -> AlignmentResult<Self> {
        persist::read_model_file(path.as_ref())
    }

    fn inner(&self) -> &dyn PointingModel {
        match self {
            AlignmentModel::Lowell(m) => m,
            AlignmentModel::Tpoint(m) => m,
            AlignmentModel::SphericalHarmonics(m) => m,
            AlignmentModel::General(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn PointingModel {
        match self {
            AlignmentModel::Lowell(m) => m,
            AlignmentModel::Tpoint(m) => m,
            AlignmentModel::SphericalHarmonics(m) => m,
            AlignmentModel::General(m) => m,
        }
    }

    pub fn family(&self) -> &'static str {
        self.inner().family()
    }

    pub fn apply(&self, hour_angle: f64, dec: f64, pier_side: PierSide) -> AlignmentResult<(f64, f64)> {
        self.inner().apply(hour_angle, dec, pier_side)
    }

    pub fn apply_inverse(
        &self,
        hour_angle: f64,
        dec: f64,
        pier_side: PierSide,
    ) -> AlignmentResult<(f64, f64)> {
        self.inner().apply_inverse(hour_angle, dec, pier_side)
    }

    pub fn fit_model(&mut self, points: &[SyncDataPoint], pier_side: PierSide) -> AlignmentResult<()> {
        self.inner_mut().fit(points, pier_side)
    }

    /// Fit from the model's own sync points
    pub fn refit(&mut self, pier_side: PierSide) -> AlignmentResult<()> {
        let points = self.sync_points().to_vec();
        self.fit_model(&points, pier_side)
    }

    pub fn add_sync_data_point(&mut self, point: SyncDataPoint) {
        self.inner_mut().sync_points_mut().push(point);
    }

    pub fn sync_points(&self) -> &[SyncDataPoint] {
        self.inner().sync_points()
    }

    /// Toggle the enabled flag of one point; false when out of range
    pub fn set_sync_point_enabled(&mut self, index: usize, enabled: bool) -> bool {
        match self.inner_mut().sync_points_mut().get_mut(index) {
            Some(point) => {
                point.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Replace this model with the one stored at `path`; the file must hold
    /// the same family
    pub fn read_object(&mut self, path: impl AsRef<Path>) -> AlignmentResult<()> {
        let path = path.as_ref();
        let loaded = persist::read_model_file(path)?;
        if loaded.family() != self.family() {
            return Err(AlignmentError::FamilyMismatch {
                path: path.to_path_buf(),
                expected: self.family().to_string(),
                found: loaded.family().to_string(),
            });
        }
        *self = loaded;
        Ok(())
    }

    /// Write parameters, configuration and every sync point.
    ///
    /// Takes no pier side: the parameters of every fitted side are written,
    /// and reading the file back restores both.
    pub fn write_object(&self, path: impl AsRef<Path>) -> AlignmentResult<()> {
        persist::write_model_file(path.as_ref(), self)
    }

    /// Load only the sync points stored at `path`
    pub fn read_sync_data(path: impl AsRef<Path>) -> AlignmentResult<Vec<SyncDataPoint>> {
        Ok(persist::read_model_file(path.as_ref())?.sync_points().to_vec())
    }

    pub fn parameter_lines(&self) -> Vec<String> {
        self.inner().parameter_lines()
    }

    /// Log the parameters per pier side
    pub fn print_parameters(&self) {
        tracing::info!("Pointing model ({}):", self.family());
        for line in self.parameter_lines() {
            tracing::info!("  {}", line);
        }
    }

    pub(crate) fn validate(&self) -> AlignmentResult<()> {
        self.inner().validate()
    }
}

#[cfg(test)]
pub(crate) mod test_points {
    use super::*;

    /// Synthetic points whose raw coordinates are produced by `truth`
    pub fn synthetic<F>(positions: &[(f64, f64, PierSide)], lst: f64, truth: F) -> Vec<SyncDataPoint>
    where
        F: Fn(f64, f64, PierSide) -> (f64, f64),
    {
        positions
            .iter()
            .map(|&(ha, dec, side)| {
                let (raw_ha, raw_dec) = truth(ha, dec, side);
                SyncDataPoint::new(
                    lst,
                    range_shift_right_ascension(lst - ha),
                    dec,
                    range_shift_right_ascension(lst - raw_ha),
                    raw_dec,
                    side,
                )
            })
            .collect()
    }

    /// Well spread positions on both sides of the meridian
    pub fn sky_grid() -> Vec<(f64, f64, PierSide)> {
        let mut positions = Vec::new();
        for (i, dec) in [-25.0, -5.0, 10.0, 25.0, 40.0, 55.0, 70.0].iter().enumerate() {
            for (j, ha) in [-5.0, -3.0, -1.0].iter().enumerate() {
                let jitter = 0.13 * (i as f64) + 0.07 * (j as f64);
                positions.push((ha - jitter, dec + 1.7 * j as f64, PierSide::West));
                positions.push((-ha + jitter, dec - 1.3 * j as f64, PierSide::East));
            }
        }
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_angle_range_shift() {
        for x in [-100.5, -36.0, -12.0, -11.99, 0.0, 12.0, 12.01, 23.5, 24.0, 47.25, 1e6 + 0.5] {
            let shifted = range_shift_hour_angle(x);
            assert!(shifted > -12.0 && shifted <= 12.0, "{} -> {}", x, shifted);
            assert_eq!(range_shift_hour_angle(shifted), shifted);
            let turns = (x - shifted) / 24.0;
            assert!((turns - turns.round()).abs() < 1e-9, "{} -> {}", x, shifted);
        }
        assert_eq!(range_shift_hour_angle(-12.0), 12.0);
    }

    #[test]
    fn test_right_ascension_range_shift() {
        for x in [-0.5, 0.0, 23.999, 24.0, 25.5, -48.25] {
            let shifted = range_shift_right_ascension(x);
            assert!((0.0..24.0).contains(&shifted), "{} -> {}", x, shifted);
        }
        assert_eq!(range_shift_right_ascension(-0.5), 23.5);
        assert_eq!(range_shift_right_ascension(-1e-17), 0.0);
    }

    #[test]
    fn test_pier_side_fallback() {
        assert_eq!(PierSide::from_hour_angle(0.0), PierSide::West);
        assert_eq!(PierSide::from_hour_angle(-3.0), PierSide::West);
        assert_eq!(PierSide::from_hour_angle(0.1), PierSide::East);
        assert_eq!(PierSide::from_hour_angle(23.0), PierSide::West);
        assert_eq!(PierSide::East.resolve(-3.0), PierSide::East);
        assert_eq!(PierSide::None.resolve(3.0), PierSide::East);
        assert_eq!(PierSide::parse("West"), Some(PierSide::West));
        assert_eq!(PierSide::parse("north"), None);
    }

    #[test]
    fn test_sync_point_offsets_wrap_through_zero_ra() {
        let point = SyncDataPoint::new(1.0, 23.99, 20.0, 0.01, 19.98, PierSide::None);
        let (dha, ddec) = point.offsets();
        assert!((dha + 0.02).abs() < 1e-9);
        assert!((ddec + 0.02).abs() < 1e-9);
        assert_eq!(point.resolved_pier_side(), PierSide::East);
    }
}
