//! Linear least-squares solve shared by the model families.
//!
//! Rows are accumulated against the full set of model terms; a solve picks
//! the active columns, detects rank deficiency from the SVD and writes zeros
//! for inactive terms.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{AlignmentError, AlignmentResult, PierSide, SyncDataPoint};

/// Singular values below this fraction of the largest count as zero
const RANK_TOLERANCE: f64 = 1e-10;

/// Design matrix and right-hand side under construction
#[derive(Debug, Clone)]
pub(crate) struct LinearSystem {
    columns: usize,
    rows: Vec<Vec<f64>>,
    rhs: Vec<f64>,
}

impl LinearSystem {
    pub fn new(columns: usize) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            rhs: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<f64>, rhs: f64) {
        debug_assert_eq!(row.len(), self.columns);
        self.rows.push(row);
        self.rhs.push(rhs);
    }

    pub fn equations(&self) -> usize {
        self.rows.len()
    }

    /// Solve for the active columns. The result has one entry per column,
    /// zero for inactive ones.
    pub fn solve(&self, active: &[bool]) -> AlignmentResult<Vec<f64>> {
        let selected: Vec<usize> = (0..self.columns)
            .filter(|&c| active.get(c).copied().unwrap_or(false))
            .collect();
        let mut parameters = vec![0.0; self.columns];
        if selected.is_empty() {
            return Ok(parameters);
        }
        if self.rows.len() < selected.len() {
            return Err(AlignmentError::TooFewPoints {
                required: selected.len(),
                available: self.rows.len(),
            });
        }

        let a = DMatrix::<f64>::from_fn(self.rows.len(), selected.len(), |r, c| {
            self.rows[r][selected[c]]
        });
        let b = DVector::<f64>::from_column_slice(&self.rhs);
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(AlignmentError::Numerical(
                "design matrix contains non-finite values".into(),
            ));
        }

        let svd = a.svd(true, true);
        let largest = svd.singular_values.max();
        let threshold = largest * RANK_TOLERANCE;
        let rank = svd
            .singular_values
            .iter()
            .filter(|&&s| s > threshold)
            .count();
        if largest <= 0.0 || rank < selected.len() {
            return Err(AlignmentError::RankDeficient {
                rank,
                columns: selected.len(),
            });
        }

        let solution = svd
            .solve(&b, threshold)
            .map_err(|e| AlignmentError::Numerical(e.to_string()))?;
        if solution.iter().any(|v| !v.is_finite()) {
            return Err(AlignmentError::Numerical(
                "least-squares solution is not finite".into(),
            ));
        }
        for (c, value) in selected.iter().zip(solution.iter()) {
            parameters[*c] = *value;
        }
        Ok(parameters)
    }
}

/// Parameter vectors per pier side; None until fitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideParameters {
    pub west: Option<Vec<f64>>,
    pub east: Option<Vec<f64>>,
}

impl SideParameters {
    pub fn get(&self, side: PierSide) -> AlignmentResult<&[f64]> {
        let parameters = match side {
            PierSide::West => self.west.as_deref(),
            PierSide::East => self.east.as_deref(),
            PierSide::None => None,
        };
        parameters.ok_or(AlignmentError::NotFitted(side))
    }

    pub fn set(&mut self, side: PierSide, parameters: Vec<f64>) {
        match side {
            PierSide::West => self.west = Some(parameters),
            PierSide::East => self.east = Some(parameters),
            PierSide::None => {
                self.west = Some(parameters.clone());
                self.east = Some(parameters);
            }
        }
    }

    /// Every stored vector has `len` entries
    pub fn check_len(&self, len: usize, family: &str) -> AlignmentResult<()> {
        for (side, parameters) in [(PierSide::West, &self.west), (PierSide::East, &self.east)] {
            if let Some(p) = parameters {
                if p.len() != len {
                    return Err(AlignmentError::Configuration(format!(
                        "{} model expects {} parameters for {}, found {}",
                        family,
                        len,
                        side,
                        p.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Enabled points of a fit, each with its resolved pier side
pub(crate) fn enabled_points(points: &[SyncDataPoint]) -> Vec<(&SyncDataPoint, PierSide)> {
    points
        .iter()
        .filter(|p| p.enabled)
        .map(|p| (p, p.resolved_pier_side()))
        .collect()
}

/// Sides to fit for a request: None means both
pub(crate) fn requested_sides(side: PierSide) -> Vec<PierSide> {
    match side {
        PierSide::None => vec![PierSide::West, PierSide::East],
        side => vec![side],
    }
}

/// Format one named parameter row for `parameter_lines`
pub(crate) fn parameter_row(name: &str, west: Option<f64>, east: Option<f64>) -> String {
    let cell = |v: Option<f64>| match v {
        Some(v) => format!("{:>14.8}", v),
        None => format!("{:>14}", "-"),
    };
    format!("{:<8} W {}  E {}", name, cell(west), cell(east))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_solution_with_inactive_column() {
        let mut system = LinearSystem::new(3);
        // y = 2 + 3x, third column unused
        for x in [0.0, 1.0, 2.0, 5.0] {
            system.push(vec![1.0, x, x * x], 2.0 + 3.0 * x);
        }
        let solution = system.solve(&[true, true, false]).unwrap();
        assert!((solution[0] - 2.0).abs() < 1e-10);
        assert!((solution[1] - 3.0).abs() < 1e-10);
        assert_eq!(solution[2], 0.0);
    }

    #[test]
    fn test_too_few_equations() {
        let mut system = LinearSystem::new(3);
        system.push(vec![1.0, 0.0, 0.0], 1.0);
        let err = system.solve(&[true, true, true]).unwrap_err();
        assert!(matches!(
            err,
            AlignmentError::TooFewPoints {
                required: 3,
                available: 1
            }
        ));
    }

    #[test]
    fn test_collinear_columns_are_rank_deficient() {
        let mut system = LinearSystem::new(2);
        for x in [1.0, 2.0, 3.0] {
            system.push(vec![x, 2.0 * x], x);
        }
        let err = system.solve(&[true, true]).unwrap_err();
        assert!(matches!(err, AlignmentError::RankDeficient { rank: 1, columns: 2 }));
    }

    #[test]
    fn test_unfitted_side_is_reported() {
        let mut parameters = SideParameters::default();
        parameters.set(PierSide::West, vec![1.0]);
        assert!(parameters.get(PierSide::West).is_ok());
        assert!(matches!(
            parameters.get(PierSide::East),
            Err(AlignmentError::NotFitted(PierSide::East))
        ));
    }
}
