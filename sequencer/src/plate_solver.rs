//! Plate solving passthrough
//!
//! The acquisition does not solve images itself. Solver settings are
//! flattened to ordered key/value arguments and handed, together with the
//! frames to solve, to a [`PlateSolver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{ExecutionError, ExecutionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AlignmentDevice {
    #[default]
    TriangleSimilarity,
    PolygonMatching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Projection {
    #[default]
    Gnomonic,
    Stereographic,
    PlateCarree,
    Mercator,
    HammerAitoff,
    ZenithalEqualArea,
    Orthographic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateSolverParameters {
    pub catalog_name: String,
    pub auto_catalog: bool,
    pub limit_magnitude: i32,
    pub auto_limit_magnitude: bool,
    pub star_sensitivity: f32,
    pub noise_layers: i32,
    pub alignment_device: AlignmentDevice,
    pub distortion_correction: bool,
    pub spline_smoothing: f32,
    pub projection: Projection,
}

impl Default for PlateSolverParameters {
    fn default() -> Self {
        Self {
            catalog_name: "PPMXL".to_string(),
            auto_catalog: true,
            limit_magnitude: 12,
            auto_limit_magnitude: true,
            star_sensitivity: 0.5,
            noise_layers: 0,
            alignment_device: AlignmentDevice::TriangleSimilarity,
            distortion_correction: false,
            spline_smoothing: 0.025,
            projection: Projection::Gnomonic,
        }
    }
}

impl PlateSolverParameters {
    /// Settings in a fixed order, enum values by variant index
    pub fn to_arguments(&self) -> Vec<(String, String)> {
        vec![
            ("catalog".to_string(), self.catalog_name.clone()),
            ("autoCatalog".to_string(), self.auto_catalog.to_string()),
            ("limitMagnitude".to_string(), self.limit_magnitude.to_string()),
            ("autoLimitMagnitude".to_string(), self.auto_limit_magnitude.to_string()),
            ("starSensitivity".to_string(), self.star_sensitivity.to_string()),
            ("noiseLayers".to_string(), self.noise_layers.to_string()),
            ("alignmentDevice".to_string(), (self.alignment_device as i32).to_string()),
            ("distortionCorrection".to_string(), self.distortion_correction.to_string()),
            ("splineSmoothing".to_string(), self.spline_smoothing.to_string()),
            ("projection".to_string(), (self.projection as i32).to_string()),
        ]
    }
}

/// Solves a batch of frames, returning how many were solved
#[async_trait]
pub trait PlateSolver: Send + Sync {
    async fn solve(
        &self,
        files: &[PathBuf],
        parameters: &PlateSolverParameters,
    ) -> ExecutionResult<u32>;
}

/// Runs an external solver as `program key=value ... file ...`. The last
/// integer printed on stdout is taken as the number of solved frames.
#[derive(Debug, Clone)]
pub struct CommandPlateSolver {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl CommandPlateSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PlateSolver for CommandPlateSolver {
    async fn solve(
        &self,
        files: &[PathBuf],
        parameters: &PlateSolverParameters,
    ) -> ExecutionResult<u32> {
        let mut cmd = tokio::process::Command::new(&self.program);
        for (key, value) in parameters.to_arguments() {
            cmd.arg(format!("{}={}", key, value));
        }
        cmd.args(files);
        tracing::info!(
            "Running plate solver {} on {} frame(s)",
            self.program.display(),
            files.len()
        );

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecutionError::PlateSolver(format!(
                    "cannot run {}: {}",
                    self.program.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(ExecutionError::PlateSolver(format!(
                    "timed out after {} seconds",
                    self.timeout.as_secs()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::debug!("Plate solver output: {}", stdout);
        if !output.status.success() {
            return Err(ExecutionError::PlateSolver(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(stdout
            .split_whitespace()
            .rev()
            .find_map(|token| token.parse::<u32>().ok())
            .unwrap_or(0))
    }
}
