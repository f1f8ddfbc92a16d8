//! Rendering of Number values through their printf-style element format.
//!
//! Besides the usual `%f`, `%e`, `%g` and `%d` conversions INDI drivers use
//! `%<w>.<f>m` for sexagesimal output, where `f` selects the precision:
//! 3 = `d:mm`, 5 = `d:mm.m`, 6 = `d:mm:ss`, 8 = `d:mm:ss.s`, 9 = `d:mm:ss.ss`.

/// Parsed `%[flags][width][.precision]conv` directive
#[derive(Debug, Clone, Copy, PartialEq)]
struct Directive {
    left_align: bool,
    plus_sign: bool,
    zero_pad: bool,
    width: usize,
    precision: Option<usize>,
    conversion: char,
}

fn parse_directive(format: &str) -> Option<(usize, usize, Directive)> {
    let start = format.find('%')?;
    let bytes = format.as_bytes();
    let mut i = start + 1;
    let mut directive = Directive {
        left_align: false,
        plus_sign: false,
        zero_pad: false,
        width: 0,
        precision: None,
        conversion: 'f',
    };

    while i < bytes.len() {
        match bytes[i] {
            b'-' => directive.left_align = true,
            b'+' => directive.plus_sign = true,
            b'0' => directive.zero_pad = true,
            b' ' | b'#' => {}
            _ => break,
        }
        i += 1;
    }
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        directive.width = directive.width * 10 + usize::from(bytes[i] - b'0');
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let mut precision = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            precision = precision * 10 + usize::from(bytes[i] - b'0');
            i += 1;
        }
        directive.precision = Some(precision);
    }
    // length modifiers
    while i < bytes.len() && matches!(bytes[i], b'l' | b'h' | b'L') {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }
    directive.conversion = char::from(bytes[i]);
    Some((start, i + 1, directive))
}

/// Format `value` with an INDI element format string. Text around the
/// directive is kept; an unusable format falls back to plain `Display`.
pub fn format_number(value: f64, format: &str) -> String {
    let Some((start, end, directive)) = parse_directive(format) else {
        return value.to_string();
    };

    let body = match directive.conversion {
        'm' => sexagesimal(value, directive.precision.unwrap_or(6)),
        'f' | 'F' => fixed(value, directive.precision.unwrap_or(6), directive.plus_sign),
        'e' | 'E' => exponent(value, directive.precision.unwrap_or(6), directive.plus_sign),
        'g' | 'G' => general(value, directive.precision.unwrap_or(6), directive.plus_sign),
        'd' | 'i' | 'u' => {
            let v = value.round() as i64;
            if directive.plus_sign && v >= 0 {
                format!("+{}", v)
            } else {
                v.to_string()
            }
        }
        _ => return value.to_string(),
    };

    let padded = pad(&body, &directive);
    format!("{}{}{}", &format[..start], padded, &format[end..])
}

fn pad(body: &str, directive: &Directive) -> String {
    let width = directive.width;
    if body.len() >= width {
        return body.to_string();
    }
    let fill = width - body.len();
    if directive.left_align {
        format!("{}{}", body, " ".repeat(fill))
    } else if directive.zero_pad && directive.conversion != 'm' {
        let (sign, digits) = match body.strip_prefix(['-', '+']) {
            Some(rest) => (&body[..1], rest),
            None => ("", body),
        };
        format!("{}{}{}", sign, "0".repeat(fill), digits)
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn fixed(value: f64, precision: usize, plus_sign: bool) -> String {
    let s = format!("{:.*}", precision, value);
    if plus_sign && value >= 0.0 {
        format!("+{}", s)
    } else {
        s
    }
}

/// printf-style exponent: two digit minimum with explicit sign
fn exponent(value: f64, precision: usize, plus_sign: bool) -> String {
    let s = format!("{:.*e}", precision, value);
    let s = match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => s,
    };
    if plus_sign && value >= 0.0 {
        format!("+{}", s)
    } else {
        s
    }
}

fn general(value: f64, precision: usize, plus_sign: bool) -> String {
    let precision = precision.max(1);
    if value == 0.0 {
        return if plus_sign { "+0".into() } else { "0".into() };
    }
    let exp = value.abs().log10().floor() as i32;
    let s = if exp < -4 || exp >= precision as i32 {
        let s = exponent(value, precision - 1, false);
        match s.split_once('e') {
            Some((mantissa, e)) => format!("{}e{}", trim_fraction(mantissa), e),
            None => s,
        }
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    };
    if plus_sign && value >= 0.0 {
        format!("+{}", s)
    } else {
        s
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn sexagesimal(value: f64, precision: usize) -> String {
    let fracbase: u64 = match precision {
        9 => 360_000,
        8 => 36_000,
        6 => 3_600,
        5 => 600,
        _ => 60,
    };
    let negative = value < 0.0;
    let n = (value.abs() * fracbase as f64).round() as u64;
    let d = n / fracbase;
    let f = n % fracbase;
    let sign = if negative && n > 0 { "-" } else { "" };

    match fracbase {
        60 => format!("{}{}:{:02}", sign, d, f),
        600 => format!("{}{}:{:02}.{}", sign, d, f / 10, f % 10),
        3_600 => format!("{}{}:{:02}:{:02}", sign, d, f / 60, f % 60),
        36_000 => format!("{}{}:{:02}:{:02}.{}", sign, d, f / 600, (f / 10) % 60, f % 10),
        _ => format!(
            "{}{}:{:02}:{:02}.{:02}",
            sign,
            d,
            f / 6_000,
            (f / 100) % 60,
            f % 100
        ),
    }
}
