//! Sync-data CSV import
//!
//! One point per row:
//! `LST, celestialRA, celestialDec, telescopeRA, telescopeDec, West|East|None, true|false`.
//! Rows with another number of fields are skipped.

use std::path::Path;

use crate::{AlignmentError, AlignmentResult, PierSide, SyncDataPoint};

const FIELDS: usize = 7;

fn parse_number(token: &str, line: usize, field: &str) -> AlignmentResult<f64> {
    token.parse::<f64>().map_err(|_| AlignmentError::SyncData {
        line,
        message: format!("invalid {} '{}'", field, token),
    })
}

pub fn parse_sync_data_csv(text: &str) -> AlignmentResult<Vec<SyncDataPoint>> {
    let mut points = Vec::new();
    for (index, row) in text.lines().enumerate() {
        let line = index + 1;
        let tokens: Vec<&str> = row.split(',').map(str::trim).collect();
        if tokens.len() != FIELDS {
            if !row.trim().is_empty() {
                tracing::debug!("Skipping sync data line {} with {} fields", line, tokens.len());
            }
            continue;
        }
        let mut point = SyncDataPoint::new(
            parse_number(tokens[0], line, "local sidereal time")?,
            parse_number(tokens[1], line, "celestial RA")?,
            parse_number(tokens[2], line, "celestial Dec")?,
            parse_number(tokens[3], line, "telescope RA")?,
            parse_number(tokens[4], line, "telescope Dec")?,
            match tokens[5] {
                "West" => PierSide::West,
                "East" => PierSide::East,
                _ => PierSide::None,
            },
        );
        point.enabled = tokens[6] == "true";
        points.push(point);
    }
    Ok(points)
}

pub fn read_sync_data_csv(path: impl AsRef<Path>) -> AlignmentResult<Vec<SyncDataPoint>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| AlignmentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let points = parse_sync_data_csv(&text)?;
    tracing::info!("Read {} sync points from {}", points.len(), path.display());
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_rows_and_skips_malformed_ones() {
        let text = "\
12.5, 10.25, 45.0, 10.26, 44.98, West, true
12.6,11.0,-5.5,11.01,-5.49,East,false

# comment line
1,2,3
12.7, 3.5, 20.0, 3.49, 20.01, None, true
";
        let points = parse_sync_data_csv(text).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].pier_side, PierSide::West);
        assert!((points[0].celestial_ra - 10.25).abs() < 1e-12);
        assert!(points[0].enabled);
        assert_eq!(points[1].pier_side, PierSide::East);
        assert!(!points[1].enabled);
        assert!((points[1].telescope_dec + 5.49).abs() < 1e-12);
        assert_eq!(points[2].pier_side, PierSide::None);
    }

    #[test]
    fn test_bad_number_names_the_line() {
        let err = parse_sync_data_csv("1,2,3,4,5,West,true\n1,x,3,4,5,East,true\n").unwrap_err();
        assert!(matches!(err, AlignmentError::SyncData { line: 2, .. }));
    }

    #[test]
    fn test_read_from_file() {
        let path = std::env::temp_dir().join(format!("sync_{}.csv", uuid::Uuid::new_v4()));
        std::fs::write(&path, "5.0,4.0,30.0,4.01,30.02,West,true\n").unwrap();
        let points = read_sync_data_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(points.len(), 1);
        assert!((points[0].local_sidereal_time - 5.0).abs() < 1e-12);
    }
}
