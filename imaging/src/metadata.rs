//! Acquisition metadata
//!
//! Extracts what a downloaded frame already says about itself from its
//! keywords, adds the acquisition keywords downstream tools rely on, and
//! maps everything to named image properties.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::fits::{FitsHeader, FitsKeyword};
use crate::sexagesimal::{dec_to_sexagesimal, parse_sexagesimal, ra_to_sexagesimal, to_sexagesimal};

/// Equinox of the coordinates written by `set_coordinates`
pub const J2000: f64 = 2000.0;

/// What the keywords of a frame tell about it. Lengths are in meters,
/// coordinates in degrees, the sidereal time in hours.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub camera_name: Option<String>,
    pub frame_type: Option<String>,
    pub filter_name: Option<String>,
    pub exposure_time: Option<f64>,
    pub sensor_temperature: Option<f64>,
    pub x_pixel_size: Option<f64>,
    pub y_pixel_size: Option<f64>,
    pub x_binning: Option<u32>,
    pub y_binning: Option<u32>,
    pub x_origin: Option<u32>,
    pub y_origin: Option<u32>,

    pub telescope_name: Option<String>,
    pub focal_length: Option<f64>,
    pub aperture: Option<f64>,
    pub aperture_area: Option<f64>,
    pub telescope_pier_side: Option<String>,

    pub object_name: Option<String>,
    pub observation_start: Option<DateTime<Utc>>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub equinox: Option<f64>,
    pub local_sidereal_time: Option<f64>,
    pub geographic_longitude: Option<f64>,
    pub geographic_latitude: Option<f64>,
    pub geographic_height: Option<f64>,
    /// Epoch-of-date pointing of the mount
    pub eod_ra: Option<f64>,
    pub eod_dec: Option<f64>,
}

fn parse_date_obs(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|t| t.and_utc())
}

impl ImageMetadata {
    pub fn from_header(header: &FitsHeader) -> Self {
        let mut data = ImageMetadata::default();
        for k in header.keywords() {
            let value = k.stripped_value();
            let number = || value.trim().parse::<f64>().ok();
            let unsigned = || value.trim().parse::<u32>().ok();
            match k.name.as_str() {
                "INSTRUME" => data.camera_name = Some(value.clone()),
                "FRAME" | "IMAGETYP" => data.frame_type = Some(value.clone()),
                "FILTER" => data.filter_name = Some(value.clone()),
                "EXPTIME" => data.exposure_time = number(),
                "CCD-TEMP" => data.sensor_temperature = number(),
                "PIXSIZE1" => data.x_pixel_size = number(),
                "PIXSIZE2" => data.y_pixel_size = number(),
                "XBINNING" => data.x_binning = unsigned(),
                "YBINNING" => data.y_binning = unsigned(),
                "XORGSUBF" => data.x_origin = unsigned(),
                "YORGSUBF" => data.y_origin = unsigned(),
                "TELESCOP" => data.telescope_name = Some(value.clone()),
                "FOCALLEN" => data.focal_length = number().map(|v| v / 1000.0),
                "APTDIA" => data.aperture = number().map(|v| v / 1000.0),
                "APTAREA" => data.aperture_area = number().map(|v| v / 1000.0),
                "PIERSIDE" => data.telescope_pier_side = Some(value.to_uppercase()),
                "OBJNAME" | "OBJECT" => data.object_name = Some(value.clone()),
                "DATE-OBS" => data.observation_start = parse_date_obs(value.trim()),
                "OBJCTRA" => data.ra = parse_sexagesimal(&value).ok().map(|h| h * 15.0),
                "OBJCTDEC" => data.dec = parse_sexagesimal(&value).ok(),
                "EQUINOX" => data.equinox = number(),
                "LOCALLST" => data.local_sidereal_time = parse_sexagesimal(&value).ok(),
                "SITELONG" => data.geographic_longitude = number(),
                "SITELAT" => data.geographic_latitude = number(),
                "SITEELEV" => data.geographic_height = number(),
                _ => {}
            }
        }
        if data.equinox.is_none() && data.ra.is_some() && data.dec.is_some() {
            data.equinox = Some(J2000);
        }
        data
    }
}

/// Replace OBJNAME/OBJECT values, or add OBJECT
pub fn set_object_name(header: &mut FitsHeader, name: &str) {
    header.replace_or_add(
        &["OBJNAME", "OBJECT"],
        FitsKeyword::text("OBJECT", name, "Name of observed object"),
    );
}

/// LOCALLST as `HH:MM:SS.ss`
pub fn set_local_sidereal_time(header: &mut FitsHeader, hours: f64) {
    header.set(FitsKeyword::text(
        "LOCALLST",
        &to_sexagesimal(hours, 2, false, ':'),
        "Local sidereal time (LST) - after exposure",
    ));
}

pub fn set_pier_side(header: &mut FitsHeader, west: bool) {
    let keyword = if west {
        FitsKeyword::text("PIERSIDE", "West", "Counterweight pointing East.")
    } else {
        FitsKeyword::text("PIERSIDE", "East", "Counterweight pointing West.")
    };
    header.set(keyword);
}

pub fn set_focal_length(header: &mut FitsHeader, millimeters: f64) {
    let rounded = (millimeters * 1000.0).round() / 1000.0;
    header.set(FitsKeyword::number("FOCALLEN", rounded, "Focal length (mm)"));
}

/// OBJCTRA/OBJCTDEC in sexagesimal and EQUINOX 2000.0. `ra` and `dec` are
/// GCRS degrees.
pub fn set_coordinates(header: &mut FitsHeader, ra: f64, dec: f64) {
    header.set(FitsKeyword::text(
        "OBJCTRA",
        &ra_to_sexagesimal(ra / 15.0),
        "Right ascension of the center of the image",
    ));
    header.set(FitsKeyword::text(
        "OBJCTDEC",
        &dec_to_sexagesimal(dec),
        "Declination of the center of the image",
    ));
    header.set(FitsKeyword::number(
        "EQUINOX",
        J2000,
        "Coordinates referred to GCRS / J2000.0",
    ));
}

/// COMMENT and HISTORY records naming the acquiring software
pub fn add_acquisition_history(header: &mut FitsHeader, software: &str, process: &str) {
    header.push(FitsKeyword::commentary("COMMENT", &format!("Acquired with {}", software)));
    header.push(FitsKeyword::commentary(
        "HISTORY",
        &format!("Acquired with {} process", process),
    ));
}

/// Value of a named image property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    Real(f64),
    Integer(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageProperty {
    pub id: String,
    pub value: PropertyValue,
}

impl ImageProperty {
    fn text(id: &str, value: &str) -> Self {
        Self {
            id: id.to_string(),
            value: PropertyValue::Text(value.to_string()),
        }
    }

    fn real(id: &str, value: f64) -> Self {
        Self {
            id: id.to_string(),
            value: PropertyValue::Real(value),
        }
    }

    fn integer(id: &str, value: u32) -> Self {
        Self {
            id: id.to_string(),
            value: PropertyValue::Integer(value),
        }
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Named properties of a frame
pub fn image_properties(data: &ImageMetadata) -> Vec<ImageProperty> {
    let mut properties = Vec::new();
    let mut real = |id: &str, v: Option<f64>| {
        if let Some(v) = v {
            properties.push(ImageProperty::real(id, v));
        }
    };
    real("Instrument:ExposureTime", data.exposure_time.map(|v| round(v, 4)));
    real("Instrument:Telescope:FocalLength", data.focal_length.map(|v| round(v, 3)));
    real("Instrument:Telescope:Aperture", data.aperture.map(|v| round(v, 3)));
    real("Instrument:Telescope:CollectingArea", data.aperture_area.map(|v| round(v, 3)));
    real("Instrument:Telescope:Pointing:RA", data.eod_ra);
    real("Instrument:Telescope:Pointing:Dec", data.eod_dec);
    real("Instrument:Sensor:Temperature", data.sensor_temperature);
    real("Instrument:Sensor:XPixelSize", data.x_pixel_size.map(|v| round(v, 3)));
    real("Instrument:Sensor:YPixelSize", data.y_pixel_size.map(|v| round(v, 3)));
    real("Observation:Location:Longitude", data.geographic_longitude);
    real("Observation:Location:Latitude", data.geographic_latitude);
    real("Observation:Location:Elevation", data.geographic_height);
    real("Observation:Center:RA", data.ra);
    real("Observation:Center:Dec", data.dec);

    let texts = [
        ("Instrument:Camera:Name", &data.camera_name),
        ("Instrument:Telescope:Name", &data.telescope_name),
        ("Instrument:Filter:Name", &data.filter_name),
        ("Observation:Image:Type", &data.frame_type),
        ("Observation:Object:Name", &data.object_name),
    ];
    for (id, value) in texts {
        if let Some(value) = value {
            properties.push(ImageProperty::text(id, value));
        }
    }

    let integers = [
        ("Instrument:Camera:XBinning", data.x_binning),
        ("Instrument:Camera:YBinning", data.y_binning),
        ("Instrument:Camera:XOrigin", data.x_origin),
        ("Instrument:Camera:YOrigin", data.y_origin),
    ];
    for (id, value) in integers {
        if let Some(value) = value {
            properties.push(ImageProperty::integer(id, value));
        }
    }

    if let Some(start) = data.observation_start {
        properties.push(ImageProperty::text(
            "Observation:Time:Start",
            &start.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        ));
    }

    match data.equinox {
        Some(equinox) => {
            properties.push(ImageProperty::real("Observation:Equinox", equinox));
            if equinox == J2000 {
                properties.push(ImageProperty::text("Observation:CelestialReferenceSystem", "GCRS"));
            }
        }
        None => properties.push(ImageProperty::text("Observation:CelestialReferenceSystem", "True")),
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::tests::sample_image;
    use crate::FitsImage;

    fn property<'a>(properties: &'a [ImageProperty], id: &str) -> Option<&'a PropertyValue> {
        properties.iter().find(|p| p.id == id).map(|p| &p.value)
    }

    #[test]
    fn test_metadata_from_camera_keywords() {
        let image = sample_image(vec![
            FitsKeyword::text("INSTRUME", "CCD Simulator", ""),
            FitsKeyword::number("EXPTIME", 12.5, ""),
            FitsKeyword::integer("XBINNING", 2, ""),
            FitsKeyword::number("FOCALLEN", 800.0, ""),
            FitsKeyword::text("DATE-OBS", "2024-03-01T21:15:30.250", ""),
            FitsKeyword::text("OBJCTRA", "05 30 00.000", ""),
            FitsKeyword::text("OBJCTDEC", "-12 15 00.00", ""),
        ]);
        let data = ImageMetadata::from_header(&image.header);
        assert_eq!(data.camera_name.as_deref(), Some("CCD Simulator"));
        assert_eq!(data.exposure_time, Some(12.5));
        assert_eq!(data.x_binning, Some(2));
        assert_eq!(data.focal_length, Some(0.8));
        assert!((data.ra.unwrap() - 82.5).abs() < 1e-9);
        assert!((data.dec.unwrap() + 12.25).abs() < 1e-9);
        assert_eq!(data.equinox, Some(J2000));

        let properties = image_properties(&data);
        assert_eq!(
            property(&properties, "Observation:Time:Start"),
            Some(&PropertyValue::Text("2024-03-01T21:15:30.250Z".into()))
        );
        assert_eq!(
            property(&properties, "Observation:CelestialReferenceSystem"),
            Some(&PropertyValue::Text("GCRS".into()))
        );
        assert_eq!(
            property(&properties, "Instrument:Camera:XBinning"),
            Some(&PropertyValue::Integer(2))
        );
    }

    #[test]
    fn test_acquisition_keywords_replace_existing_records() {
        let mut image = sample_image(vec![
            FitsKeyword::text("OBJNAME", "unknown", ""),
            FitsKeyword::text("OBJCTRA", "00 00 00", ""),
            FitsKeyword::number("EQUINOX", 2024.2, ""),
        ]);
        set_object_name(&mut image.header, "M 81");
        set_coordinates(&mut image.header, 148.8882, 69.0653);
        set_local_sidereal_time(&mut image.header, 9.5);
        set_pier_side(&mut image.header, true);
        set_focal_length(&mut image.header, 530.00049);
        add_acquisition_history(&mut image.header, "skybridge 0.3", "CcdFrame");

        let loaded = FitsImage::parse(&image.to_bytes()).unwrap();
        let header = &loaded.header;
        assert_eq!(header.get_string("OBJNAME").as_deref(), Some("M 81"));
        assert!(!header.contains("OBJECT"));
        assert_eq!(header.get_string("OBJCTRA").as_deref(), Some("09 55 33.168"));
        assert_eq!(header.get_string("OBJCTDEC").as_deref(), Some("+69 03 55.08"));
        assert_eq!(header.get_float("EQUINOX"), Some(2000.0));
        assert_eq!(header.get_string("LOCALLST").as_deref(), Some("09:30:00.00"));
        assert_eq!(header.get_string("PIERSIDE").as_deref(), Some("West"));
        assert_eq!(header.get_float("FOCALLEN"), Some(530.0));
        assert_eq!(
            header.keywords().iter().filter(|k| k.name == "EQUINOX").count(),
            1
        );

        let data = ImageMetadata::from_header(header);
        assert_eq!(data.object_name.as_deref(), Some("M 81"));
        assert!((data.local_sidereal_time.unwrap() - 9.5).abs() < 1e-9);
        assert_eq!(data.telescope_pier_side.as_deref(), Some("WEST"));
    }

    #[test]
    fn test_true_equinox_without_coordinates() {
        let properties = image_properties(&ImageMetadata::default());
        assert_eq!(
            properties,
            vec![ImageProperty::text("Observation:CelestialReferenceSystem", "True")]
        );
        let json = serde_json::to_string(&properties).unwrap();
        assert!(json.contains("\"value\":\"True\""));
    }
}
