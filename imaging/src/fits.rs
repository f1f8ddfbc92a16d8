//! FITS header I/O
//!
//! Reads the primary header of a FITS file as an ordered list of keyword
//! records and writes it back with the data unit untouched.
//!
//! FITS format:
//! - 2880-byte blocks
//! - Header with 80-character keyword records, closed by END
//! - Data in big-endian format, zero-padded to a block

use std::path::Path;

use crate::{ImagingError, ImagingResult};

const BLOCK: usize = 2880;
const CARD: usize = 80;

/// Typed view of a keyword value
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// COMMENT, HISTORY and blank records
    Comment(String),
}

impl FitsValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            FitsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FitsValue::Integer(i) => Some(*i),
            FitsValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FitsValue::Float(f) => Some(*f),
            FitsValue::Integer(i) => Some(*i as f64),
            FitsValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FitsValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// One header record. `value` holds the raw value text, strings with their
/// quotes.
#[derive(Debug, Clone, PartialEq)]
pub struct FitsKeyword {
    pub name: String,
    pub value: String,
    pub comment: String,
}

impl FitsKeyword {
    pub fn new(name: &str, value: &str, comment: &str) -> Self {
        Self {
            name: name.to_uppercase(),
            value: value.to_string(),
            comment: comment.to_string(),
        }
    }

    pub fn text(name: &str, value: &str, comment: &str) -> Self {
        Self::new(name, &quote(value), comment)
    }

    pub fn number(name: &str, value: f64, comment: &str) -> Self {
        Self::new(name, &format_real(value), comment)
    }

    pub fn integer(name: &str, value: i64, comment: &str) -> Self {
        Self::new(name, &value.to_string(), comment)
    }

    pub fn logical(name: &str, value: bool, comment: &str) -> Self {
        Self::new(name, if value { "T" } else { "F" }, comment)
    }

    /// COMMENT / HISTORY record
    pub fn commentary(name: &str, text: &str) -> Self {
        Self::new(name, "", text)
    }

    pub fn is_commentary(&self) -> bool {
        self.value.is_empty() && matches!(self.name.as_str(), "COMMENT" | "HISTORY" | "")
    }

    /// Value with string delimiters removed
    pub fn stripped_value(&self) -> String {
        match unquote(&self.value) {
            Some(s) => s,
            None => self.value.trim().to_string(),
        }
    }

    pub fn typed_value(&self) -> FitsValue {
        if self.is_commentary() {
            return FitsValue::Comment(self.comment.clone());
        }
        parse_fits_value(&self.value)
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn unquote(value: &str) -> Option<String> {
    let inner = value.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'").trim_end().to_string())
}

/// Real value text that always carries a decimal point or exponent
fn format_real(value: f64) -> String {
    let text = format!("{}", value);
    if text.contains(['.', 'e', 'E']) || !value.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Parse a FITS value from string
fn parse_fits_value(s: &str) -> FitsValue {
    let s = s.trim();

    if let Some(text) = unquote(s) {
        return FitsValue::String(text);
    }
    if s == "T" {
        return FitsValue::Boolean(true);
    }
    if s == "F" {
        return FitsValue::Boolean(false);
    }
    if let Ok(i) = s.parse::<i64>() {
        return FitsValue::Integer(i);
    }
    if let Ok(f) = s.replace('D', "E").replace('d', "e").parse::<f64>() {
        return FitsValue::Float(f);
    }
    FitsValue::String(s.to_string())
}

/// Ordered keyword records of one header, END excluded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    keywords: Vec<FitsKeyword>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keywords(keywords: Vec<FitsKeyword>) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &[FitsKeyword] {
        &self.keywords
    }

    pub fn keywords_mut(&mut self) -> &mut Vec<FitsKeyword> {
        &mut self.keywords
    }

    pub fn get(&self, name: &str) -> Option<&FitsKeyword> {
        let name = name.to_uppercase();
        self.keywords.iter().find(|k| k.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(FitsKeyword::stripped_value)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|k| k.typed_value().as_i64())
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|k| k.typed_value().as_f64())
    }

    /// Append a record
    pub fn push(&mut self, keyword: FitsKeyword) {
        self.keywords.push(keyword);
    }

    /// Replace the value and comment of every record named like one of
    /// `names`; append `keyword` when none exists. Returns true when a
    /// record was replaced.
    pub fn replace_or_add(&mut self, names: &[&str], keyword: FitsKeyword) -> bool {
        let mut replaced = false;
        for existing in self
            .keywords
            .iter_mut()
            .filter(|k| names.iter().any(|n| k.name.eq_ignore_ascii_case(n)))
        {
            existing.value = keyword.value.clone();
            existing.comment = keyword.comment.clone();
            replaced = true;
        }
        if !replaced {
            self.keywords.push(keyword);
        }
        replaced
    }

    /// Replace a record of the same name, or append it
    pub fn set(&mut self, keyword: FitsKeyword) -> bool {
        let name = keyword.name.clone();
        self.replace_or_add(&[name.as_str()], keyword)
    }

    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.keywords.len();
        self.keywords.retain(|k| !k.name.eq_ignore_ascii_case(name));
        before - self.keywords.len()
    }
}

/// Sample layout of the primary data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    pub bitpix: i64,
    pub axes: Vec<usize>,
}

impl PixelFormat {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bitpix.unsigned_abs() / 8) as usize
    }

    pub fn sample_count(&self) -> usize {
        if self.axes.is_empty() {
            0
        } else {
            self.axes.iter().product()
        }
    }

    pub fn data_bytes(&self) -> usize {
        self.sample_count() * self.bytes_per_sample()
    }

    pub fn is_floating_point(&self) -> bool {
        self.bitpix < 0
    }
}

/// Primary header plus the raw data unit that follows it
#[derive(Debug, Clone, PartialEq)]
pub struct FitsImage {
    pub header: FitsHeader,
    data: Vec<u8>,
}

impl FitsImage {
    pub fn new(header: FitsHeader, data: Vec<u8>) -> Self {
        Self { header, data }
    }

    pub fn read(path: &Path) -> ImagingResult<Self> {
        let bytes = std::fs::read(path).map_err(|source| ImagingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> ImagingResult<Self> {
        let mut keywords = Vec::new();
        let mut offset = 0;
        let mut ended = false;
        while !ended {
            let block = bytes
                .get(offset..offset + BLOCK)
                .ok_or_else(|| ImagingError::InvalidFits("header is not terminated by END".into()))?;
            offset += BLOCK;
            for record in block.chunks_exact(CARD) {
                let record: String = record
                    .iter()
                    .map(|&b| if b.is_ascii() { b as char } else { '?' })
                    .collect();
                let name = record[..8].trim();
                if name == "END" {
                    ended = true;
                    break;
                }
                if name.is_empty() && record[8..].trim().is_empty() {
                    continue;
                }
                keywords.push(parse_card(&record));
            }
        }

        let image = Self {
            header: FitsHeader::from_keywords(keywords),
            data: bytes[offset..].to_vec(),
        };
        match image.header.keywords().first() {
            Some(k) if k.name == "SIMPLE" => {}
            _ => return Err(ImagingError::InvalidFits("first keyword is not SIMPLE".into())),
        }
        let format = image.pixel_format()?;
        if image.data.len() < format.data_bytes() {
            return Err(ImagingError::InvalidFits(format!(
                "data unit holds {} bytes, {} expected",
                image.data.len(),
                format.data_bytes()
            )));
        }
        Ok(image)
    }

    pub fn pixel_format(&self) -> ImagingResult<PixelFormat> {
        let bitpix = self
            .header
            .get_int("BITPIX")
            .ok_or_else(|| ImagingError::MissingKeyword("BITPIX".to_string()))?;
        if !matches!(bitpix, 8 | 16 | 32 | 64 | -32 | -64) {
            return Err(ImagingError::InvalidFits(format!("unsupported BITPIX {}", bitpix)));
        }
        let naxis = self
            .header
            .get_int("NAXIS")
            .ok_or_else(|| ImagingError::MissingKeyword("NAXIS".to_string()))?;
        let mut axes = Vec::new();
        for n in 1..=naxis {
            let name = format!("NAXIS{}", n);
            let length = self
                .header
                .get_int(&name)
                .ok_or(ImagingError::MissingKeyword(name))?;
            axes.push(length.max(0) as usize);
        }
        Ok(PixelFormat { bitpix, axes })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((self.header.keywords().len() + 1) * CARD + self.data.len());
        for keyword in self.header.keywords() {
            bytes.extend_from_slice(&format_card(keyword));
        }
        bytes.extend_from_slice(&format_card(&FitsKeyword::new("END", "", "")));
        pad(&mut bytes, b' ');
        bytes.extend_from_slice(&self.data);
        pad(&mut bytes, 0);
        bytes
    }

    pub fn write(&self, path: &Path) -> ImagingResult<()> {
        std::fs::write(path, self.to_bytes()).map_err(|source| ImagingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn pad(bytes: &mut Vec<u8>, fill: u8) {
    let padding = (BLOCK - bytes.len() % BLOCK) % BLOCK;
    bytes.resize(bytes.len() + padding, fill);
}

/// Split one 80-character record into name, value and comment
fn parse_card(record: &str) -> FitsKeyword {
    let name = record[..8].trim();
    if &record[8..10] != "= " {
        return FitsKeyword::commentary(name, record[8..].trim_end());
    }

    let field = &record[10..];
    let trimmed = field.trim_start();
    let (value, rest) = if trimmed.starts_with('\'') {
        // closing quote is the first single quote not doubled
        let chars: Vec<char> = trimmed.chars().collect();
        let mut end = None;
        let mut i = 1;
        while i < chars.len() {
            if chars[i] == '\'' {
                if chars.get(i + 1) == Some(&'\'') {
                    i += 2;
                    continue;
                }
                end = Some(i);
                break;
            }
            i += 1;
        }
        match end {
            Some(end) => {
                let split = chars[..=end].iter().map(|c| c.len_utf8()).sum::<usize>();
                (trimmed[..split].to_string(), &trimmed[split..])
            }
            None => (trimmed.trim_end().to_string(), ""),
        }
    } else {
        match trimmed.find('/') {
            Some(idx) => (trimmed[..idx].trim().to_string(), &trimmed[idx..]),
            None => (trimmed.trim().to_string(), ""),
        }
    };
    let comment = rest
        .trim_start()
        .strip_prefix('/')
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    FitsKeyword {
        name: name.to_string(),
        value,
        comment,
    }
}

/// Write a single keyword record
fn format_card(keyword: &FitsKeyword) -> [u8; CARD] {
    let mut record = [b' '; CARD];
    let mut text = format!("{:<8}", keyword.name);
    text.truncate(8);

    if keyword.is_commentary() {
        text.push_str(&keyword.comment);
    } else if keyword.name != "END" {
        text.push_str("= ");
        if keyword.value.starts_with('\'') {
            // strings start at column 11
            text.push_str(&keyword.value);
        } else {
            // numbers and logicals are right-justified ending at column 30
            text.push_str(&format!("{:>20}", keyword.value));
        }
        if !keyword.comment.is_empty() {
            text.push_str(" / ");
            text.push_str(&keyword.comment);
        }
    }

    let bytes = text.as_bytes();
    let len = bytes.len().min(CARD);
    record[..len].copy_from_slice(&bytes[..len]);
    record
}
