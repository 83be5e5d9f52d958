use crate::errors::{AppError, AppResult};
use crate::models::TransformationRule;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const CURRENCY_SYMBOLS: [char; 3] = ['$', '€', '£'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnmappedReason {
    EmptyCell,
    UnparseableNumber,
    NoRegexMatch,
    EnumMiss,
}

impl UnmappedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyCell => "empty cell",
            Self::UnparseableNumber => "unparseable number",
            Self::NoRegexMatch => "no regex match",
            Self::EnumMiss => "enum value not mapped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    Mapped(String),
    Unmapped(UnmappedReason),
}

#[derive(Debug, Clone)]
enum CompiledKind {
    Passthrough,
    Number {
        decimal_separator: char,
        factor: Option<f64>,
    },
    Extract {
        regex: Regex,
        group: usize,
    },
    Recode {
        table: HashMap<String, String>,
    },
}

/// A transformation rule validated and prepared for repeated application.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    kind: CompiledKind,
}

impl CompiledRule {
    pub fn compile(rule: Option<&TransformationRule>) -> AppResult<Self> {
        let kind = match rule {
            None | Some(TransformationRule::None) => CompiledKind::Passthrough,
            Some(TransformationRule::ParseNumber { decimal_separator }) => {
                if !matches!(decimal_separator, '.' | ',') {
                    return Err(AppError::Configuration(format!(
                        "parseNumber decimal separator must be '.' or ',', got '{}'",
                        decimal_separator
                    )));
                }
                CompiledKind::Number {
                    decimal_separator: *decimal_separator,
                    factor: None,
                }
            }
            Some(TransformationRule::Scale { factor }) => {
                if !factor.is_finite() || *factor == 0.0 {
                    return Err(AppError::Configuration(format!(
                        "scale factor must be a finite non-zero number, got {}",
                        factor
                    )));
                }
                CompiledKind::Number {
                    decimal_separator: '.',
                    factor: Some(*factor),
                }
            }
            Some(TransformationRule::RegexExtract { pattern, group }) => {
                let regex = Regex::new(pattern).map_err(|error| {
                    AppError::Configuration(format!("invalid regexExtract pattern '{}': {}", pattern, error))
                })?;
                if *group >= regex.captures_len() {
                    return Err(AppError::Configuration(format!(
                        "regexExtract group {} does not exist in pattern '{}'",
                        group, pattern
                    )));
                }
                CompiledKind::Extract { regex, group: *group }
            }
            Some(TransformationRule::MapEnum { table }) => {
                if table.is_empty() {
                    return Err(AppError::Configuration("mapEnum table is empty".to_string()));
                }
                let mut normalized = HashMap::with_capacity(table.len());
                for (key, value) in table {
                    let key = normalize_key(key);
                    if normalized.insert(key.clone(), value.clone()).is_some() {
                        return Err(AppError::Configuration(format!(
                            "mapEnum table has duplicate key '{}'",
                            key
                        )));
                    }
                }
                CompiledKind::Recode { table: normalized }
            }
        };
        Ok(Self { kind })
    }

    pub fn apply(&self, raw: &str) -> CellOutcome {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellOutcome::Unmapped(UnmappedReason::EmptyCell);
        }

        match &self.kind {
            CompiledKind::Passthrough => CellOutcome::Mapped(trimmed.to_string()),
            CompiledKind::Number {
                decimal_separator,
                factor,
            } => match parse_number(trimmed, *decimal_separator) {
                Some(value) => {
                    let scaled = factor.map(|factor| value * factor).unwrap_or(value);
                    if scaled.is_finite() {
                        CellOutcome::Mapped(format_number(scaled))
                    } else {
                        CellOutcome::Unmapped(UnmappedReason::UnparseableNumber)
                    }
                }
                None => CellOutcome::Unmapped(UnmappedReason::UnparseableNumber),
            },
            CompiledKind::Extract { regex, group } => regex
                .captures(trimmed)
                .and_then(|captures| captures.get(*group))
                .map(|found| found.as_str().trim())
                .filter(|found| !found.is_empty())
                .map(|found| CellOutcome::Mapped(found.to_string()))
                .unwrap_or(CellOutcome::Unmapped(UnmappedReason::NoRegexMatch)),
            CompiledKind::Recode { table } => table
                .get(&normalize_key(trimmed))
                .map(|value| CellOutcome::Mapped(value.clone()))
                .unwrap_or(CellOutcome::Unmapped(UnmappedReason::EnumMiss)),
        }
    }
}

/// Parses a spreadsheet number: currency symbols, a trailing `%`, whitespace and
/// the thousands separator are dropped; `(12)` is negative. No rounding.
pub fn parse_number(raw: &str, decimal_separator: char) -> Option<f64> {
    let mut text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let mut negative = false;
    if text.len() > 2 && text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = text[1..text.len() - 1].trim();
    }
    let text = text.strip_suffix('%').unwrap_or(text).trim();

    let thousands = if decimal_separator == ',' { '.' } else { ',' };
    let mut normalized = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch == thousands || ch.is_whitespace() || CURRENCY_SYMBOLS.contains(&ch) {
            continue;
        }
        if ch == decimal_separator {
            normalized.push('.');
        } else if ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E') {
            normalized.push(ch);
        } else {
            return None;
        }
    }

    let value = normalized.parse::<f64>().ok().filter(|value| value.is_finite())?;
    Some(if negative { -value } else { value })
}

pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}
