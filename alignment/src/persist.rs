//! Model files
//!
//! A pretty-printed JSON document:
//!
//! ```json
//! { "format_version": 1, "model": { "type": "general", ... } }
//! ```

use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use crate::{AlignmentError, AlignmentModel, AlignmentResult};

/// Version written into every model file
pub const MODEL_FORMAT_VERSION: u64 = 1;

#[derive(Serialize)]
struct ModelFile<'a> {
    format_version: u64,
    model: &'a AlignmentModel,
}

fn format_error(path: &Path, message: impl Into<String>) -> AlignmentError {
    AlignmentError::Format {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Parse a model document; `path` only labels errors
pub(crate) fn parse_model(text: &str, path: &Path) -> AlignmentResult<AlignmentModel> {
    let mut document: Value =
        serde_json::from_str(text).map_err(|e| format_error(path, e.to_string()))?;

    let version = document
        .get("format_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| format_error(path, "missing format_version"))?;
    if version != MODEL_FORMAT_VERSION {
        return Err(format_error(
            path,
            format!(
                "unsupported format_version {} (expected {})",
                version, MODEL_FORMAT_VERSION
            ),
        ));
    }

    let model = document
        .get_mut("model")
        .map(Value::take)
        .ok_or_else(|| format_error(path, "missing model"))?;
    let model: AlignmentModel =
        serde_json::from_value(model).map_err(|e| format_error(path, e.to_string()))?;
    model.validate()?;
    Ok(model)
}

pub(crate) fn read_model_file(path: &Path) -> AlignmentResult<AlignmentModel> {
    let text = std::fs::read_to_string(path).map_err(|source| AlignmentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let model = parse_model(&text, path)?;
    tracing::debug!(
        "Loaded {} model with {} sync points from {}",
        model.family(),
        model.sync_points().len(),
        path.display()
    );
    Ok(model)
}

pub(crate) fn write_model_file(path: &Path, model: &AlignmentModel) -> AlignmentResult<()> {
    let document = ModelFile {
        format_version: MODEL_FORMAT_VERSION,
        model,
    };
    let text = serde_json::to_string_pretty(&document)
        .map_err(|e| format_error(path, e.to_string()))?;
    std::fs::write(path, text).map_err(|source| AlignmentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(
        "Wrote {} model with {} sync points to {}",
        model.family(),
        model.sync_points().len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_points::{sky_grid, synthetic};
    use crate::{
        AnalyticalPointingModel, GeneralAnalyticalPointingModel, LowellPointingModel, ModelConfig,
        PierSide, TpointPointingModel,
    };
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}_{}.json", name, uuid::Uuid::new_v4()))
    }

    fn mount(ha: f64, dec: f64, side: PierSide) -> (f64, f64) {
        let sign = if side == PierSide::West { 1.0 } else { -1.0 };
        (ha + 0.004 * sign + 0.001 * ha, dec - 0.03 + 0.0002 * dec)
    }

    fn fitted_models() -> Vec<AlignmentModel> {
        let mut points = synthetic(&sky_grid(), 6.5, mount);
        points[3].enabled = false;
        points[10].enabled = false;

        let mut models = vec![
            AlignmentModel::Lowell(LowellPointingModel::new()),
            AlignmentModel::Tpoint(TpointPointingModel::new(51.2)),
            AlignmentModel::SphericalHarmonics(AnalyticalPointingModel::new(0).unwrap()),
            AlignmentModel::General(GeneralAnalyticalPointingModel::new(
                51.2,
                ModelConfig::SEPARATE_PIER_SIDES | ModelConfig::OFFSETS | ModelConfig::COLLIMATION,
            )),
        ];
        for model in &mut models {
            for point in &points {
                model.add_sync_data_point(point.clone());
            }
            model.refit(PierSide::None).unwrap();
        }
        models
    }

    #[test]
    fn test_round_trip_preserves_points_and_corrections() {
        for model in fitted_models() {
            let path = temp_path(model.family());
            model.write_object(&path).unwrap();
            let loaded = AlignmentModel::create(&path).unwrap();
            std::fs::remove_file(&path).ok();

            assert_eq!(loaded.family(), model.family());
            assert_eq!(loaded.sync_points(), model.sync_points());
            assert!(!loaded.sync_points()[3].enabled);
            for (ha, dec, side) in [(-2.0, 10.0, PierSide::West), (3.5, 45.0, PierSide::East)] {
                assert_eq!(
                    loaded.apply(ha, dec, side).unwrap(),
                    model.apply(ha, dec, side).unwrap()
                );
                assert_eq!(
                    loaded.apply_inverse(ha, dec, side).unwrap(),
                    model.apply_inverse(ha, dec, side).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_read_object_rejects_other_family() {
        let models = fitted_models();
        let path = temp_path("family");
        models[0].write_object(&path).unwrap();

        let mut tpoint = models[1].clone();
        let err = tpoint.read_object(&path).unwrap_err();
        assert!(matches!(err, AlignmentError::FamilyMismatch { .. }));

        let mut lowell = AlignmentModel::Lowell(LowellPointingModel::new());
        lowell.read_object(&path).unwrap();
        assert_eq!(lowell, models[0]);

        let points = AlignmentModel::read_sync_data(&path).unwrap();
        assert_eq!(points.len(), sky_grid().len());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_bad_documents() {
        let path = Path::new("model.json");
        let unknown_version = r#"{ "format_version": 7, "model": { "type": "lowell" } }"#;
        assert!(matches!(
            parse_model(unknown_version, path),
            Err(AlignmentError::Format { .. })
        ));

        let unknown_tag = r#"{ "format_version": 1, "model": { "type": "banana" } }"#;
        assert!(matches!(
            parse_model(unknown_tag, path),
            Err(AlignmentError::Format { .. })
        ));

        let bad_order = r#"{ "format_version": 1,
            "model": { "type": "spherical_harmonics", "order": 3, "parameters": null } }"#;
        assert!(matches!(
            parse_model(bad_order, path),
            Err(AlignmentError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = AlignmentModel::create(temp_path("missing")).unwrap_err();
        assert!(matches!(err, AlignmentError::Io { .. }));
    }
}
