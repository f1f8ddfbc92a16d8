//! Image file-name templates
//!
//! | Token | Expands to |
//! |-------|------------|
//! | `%f`  | frame type prefix (LIGHT, BIAS, DARK, FLAT) |
//! | `%b`  | binning, `2x2` |
//! | `%e`  | exposure time in seconds, three decimals |
//! | `%F`  | filter name (empty when unknown) |
//! | `%T`  | sensor temperature, signed, two decimals (empty when unknown) |
//! | `%t`  | UTC timestamp `2024-03-01T22:15:07` |
//! | `%d`  | UTC date `2024-03-01` |
//! | `%n`  | 1-based exposure number, three digits |
//! | `%u`  | random UUID |
//! | `%%`  | literal `%` |
//!
//! Unknown tokens are dropped.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Values a template can refer to
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub frame_type: String,
    pub binning: (u32, u32),
    pub exposure_time: f64,
    pub filter_name: Option<String>,
    pub temperature: Option<f64>,
    /// 0-based
    pub exposure_number: u32,
    pub now: DateTime<Utc>,
}

impl TemplateContext {
    pub fn new(frame_type: &str) -> Self {
        Self {
            frame_type: frame_type.to_string(),
            binning: (1, 1),
            exposure_time: 0.0,
            filter_name: None,
            temperature: None,
            exposure_number: 0,
            now: Utc::now(),
        }
    }

    pub fn with_binning(mut self, x: u32, y: u32) -> Self {
        self.binning = (x, y);
        self
    }

    pub fn with_exposure(mut self, exposure_time: f64) -> Self {
        self.exposure_time = exposure_time;
        self
    }

    pub fn with_filter(mut self, filter_name: Option<String>) -> Self {
        self.filter_name = filter_name;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_exposure_number(mut self, exposure_number: u32) -> Self {
        self.exposure_number = exposure_number;
        self
    }

    pub fn with_time(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

pub fn expand_template(template: &str, context: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('f') => out.push_str(&context.frame_type),
            Some('b') => out.push_str(&format!("{}x{}", context.binning.0, context.binning.1)),
            Some('e') => out.push_str(&format!("{:.3}", context.exposure_time)),
            Some('F') => {
                if let Some(filter) = &context.filter_name {
                    out.push_str(filter);
                }
            }
            Some('T') => {
                if let Some(temperature) = context.temperature {
                    out.push_str(&format!("{:+.2}", temperature));
                }
            }
            Some('t') => out.push_str(&context.now.format("%Y-%m-%dT%H:%M:%S").to_string()),
            Some('d') => out.push_str(&context.now.format("%Y-%m-%d").to_string()),
            Some('n') => out.push_str(&format!("{:03}", context.exposure_number + 1)),
            Some('u') => out.push_str(&Uuid::new_v4().to_string()),
            Some('%') => out.push('%'),
            Some(other) => tracing::debug!("Dropping unknown template token %{}", other),
            None => {}
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context() -> TemplateContext {
        TemplateContext::new("LIGHT")
            .with_binning(2, 2)
            .with_exposure(30.0)
            .with_filter(Some("Ha".to_string()))
            .with_exposure_number(4)
            .with_time(Utc.with_ymd_and_hms(2024, 3, 1, 22, 15, 7).unwrap())
    }

    #[test]
    fn test_default_client_template() {
        assert_eq!(
            expand_template("%f_B%b_E%e_%F_%n", &context()),
            "LIGHT_B2x2_E30.000_Ha_005"
        );
    }

    #[test]
    fn test_time_temperature_and_literals() {
        let ctx = context().with_temperature(Some(-10.0));
        assert_eq!(
            expand_template("%d/%t_%T_100%%", &ctx),
            "2024-03-01/2024-03-01T22:15:07_-10.00_100%"
        );
    }

    #[test]
    fn test_missing_values_and_unknown_tokens() {
        let ctx = TemplateContext::new("DARK");
        assert_eq!(expand_template(" %f_%F%T%q_%n %", &ctx), "DARK__001");
    }

    #[test]
    fn test_uuid_is_unique() {
        let ctx = TemplateContext::new("FLAT");
        let a = expand_template("%u", &ctx);
        let b = expand_template("%u", &ctx);
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }
}
