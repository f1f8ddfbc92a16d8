//! Sexagesimal text for coordinate keywords

use crate::{ImagingError, ImagingResult};

/// Three-item sexagesimal rendering of `value` with `precision` decimals in
/// the seconds field. Rounding carries into minutes and degrees.
pub fn to_sexagesimal(value: f64, precision: usize, sign: bool, separator: char) -> String {
    let scale = 10u64.pow(precision as u32);
    let total = (value.abs() * 3600.0 * scale as f64).round() as u64;
    let fraction = total % scale;
    let seconds = (total / scale) % 60;
    let minutes = (total / scale / 60) % 60;
    let degrees = total / scale / 3600;

    let mut text = String::new();
    if value < 0.0 && total != 0 {
        text.push('-');
    } else if sign {
        text.push('+');
    }
    text.push_str(&format!("{:02}{}{:02}{}{:02}", degrees, separator, minutes, separator, seconds));
    if precision > 0 {
        text.push_str(&format!(".{:0width$}", fraction, width = precision));
    }
    text
}

/// Right ascension in hours, `HH MM SS.sss`, wrapped into [0, 24)
pub fn ra_to_sexagesimal(hours: f64) -> String {
    let hours = hours.rem_euclid(24.0);
    // Anything that rounds up to a full day is 00 00 00.000
    let last_millisecond = 24.0 - 0.5 / 3_600_000.0;
    let hours = if hours >= last_millisecond { 0.0 } else { hours };
    to_sexagesimal(hours, 3, false, ' ')
}

/// Declination in degrees, `+DD MM SS.ss`
pub fn dec_to_sexagesimal(degrees: f64) -> String {
    to_sexagesimal(degrees, 2, true, ' ')
}

/// Parse one to three items separated by blanks or colons
pub fn parse_sexagesimal(text: &str) -> ImagingResult<f64> {
    let trimmed = text.trim();
    let negative = trimmed.starts_with('-');
    let items: Vec<&str> = trimmed
        .trim_start_matches(['+', '-'])
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() || items.len() > 3 {
        return Err(ImagingError::Sexagesimal(text.to_string()));
    }

    let mut value = 0.0;
    let mut unit = 1.0;
    for item in items {
        let number: f64 = item
            .parse()
            .map_err(|_| ImagingError::Sexagesimal(text.to_string()))?;
        if number < 0.0 {
            return Err(ImagingError::Sexagesimal(text.to_string()));
        }
        value += number / unit;
        unit *= 60.0;
    }
    Ok(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_formats() {
        assert_eq!(ra_to_sexagesimal(5.5), "05 30 00.000");
        assert_eq!(dec_to_sexagesimal(-12.25), "-12 15 00.00");
        assert_eq!(dec_to_sexagesimal(45.0 + 6.0 / 60.0 + 7.891 / 3600.0), "+45 06 07.89");
        assert_eq!(to_sexagesimal(23.5, 2, false, ':'), "23:30:00.00");
    }

    #[test]
    fn test_rounding_carries() {
        assert_eq!(ra_to_sexagesimal(1.0 - 1e-9), "01 00 00.000");
        assert_eq!(dec_to_sexagesimal(-1e-9), "+00 00 00.00");
        assert_eq!(ra_to_sexagesimal(23.99999999), "00 00 00.000");
        assert_eq!(ra_to_sexagesimal(24.0), "00 00 00.000");
        assert_eq!(ra_to_sexagesimal(-1.0), "23 00 00.000");
        assert_eq!(ra_to_sexagesimal(23.9999), "23 59 59.640");
    }

    #[test]
    fn test_parse() {
        assert!((parse_sexagesimal("05 30 00.0").unwrap() - 5.5).abs() < 1e-12);
        assert!((parse_sexagesimal("-12:15:00").unwrap() + 12.25).abs() < 1e-12);
        assert!((parse_sexagesimal("+10 30").unwrap() - 10.5).abs() < 1e-12);
        assert!(parse_sexagesimal("abc").is_err());
        assert!(parse_sexagesimal("").is_err());
    }
}
