//! Number, unit and year parsing for cell text.

use regex::Regex;
use std::sync::LazyLock;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3}(,\d{3})+|\d+)(\.\d+)?$|^\.\d+$").unwrap());

static HEADER_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[(（]\s*([^()（）]{1,16}?)\s*[)）]\s*$").unwrap());

const CURRENCY_PREFIXES: &[&str] = &["US$", "$", "€", "£", "¥", "￥", "RMB", "USD", "EUR"];

/// Longest first so "亿元" wins over "元".
const SUFFIX_UNITS: &[&str] = &["亿元", "万元", "元", "bn", "%", "k", "m"];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNumber {
    pub value: f64,
    pub unit: Option<String>,
}

impl ParsedNumber {
    pub fn is_percent(&self) -> bool {
        self.unit.as_deref() == Some("%")
    }
}

/// Parses cell text such as `1,234.5`, `(1,234)`, `-3%`, `$12m` or `3.5亿元`.
/// The value keeps the scale as written; the scale word lands in `unit`.
pub fn parse_number(raw: &str) -> Option<ParsedNumber> {
    let mut s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') && s.len() > 2 {
        negative = true;
        s = s[1..s.len() - 1].trim();
    }
    if let Some(rest) = s.strip_prefix('-').or_else(|| s.strip_prefix('−')) {
        negative = !negative;
        s = rest.trim_start();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.trim_start();
    }

    let mut units: Vec<&str> = Vec::new();
    for prefix in CURRENCY_PREFIXES {
        if let Some(rest) = s.strip_prefix(prefix) {
            units.push(prefix);
            s = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.trim_start();
    }

    for suffix in SUFFIX_UNITS {
        if s.len() > suffix.len() {
            let cut = s.len() - suffix.len();
            if s.is_char_boundary(cut) && s[cut..].eq_ignore_ascii_case(suffix) {
                units.push(suffix);
                s = s[..cut].trim_end();
                break;
            }
        }
    }

    if !NUMBER_RE.is_match(s) {
        return None;
    }
    let digits: String = s.chars().filter(|c| *c != ',').collect();
    let value: f64 = digits.parse().ok()?;

    Some(ParsedNumber {
        value: if negative { -value } else { value },
        unit: (!units.is_empty()).then(|| units.join(" ")),
    })
}

pub fn is_numeric(raw: &str) -> bool {
    parse_number(raw).is_some()
}

/// Unit written in trailing parentheses of a header, e.g. "Revenue (USD m)".
pub fn header_unit(label: &str) -> Option<String> {
    HEADER_UNIT_RE
        .captures(label)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|u| !u.is_empty() && years_in(u).is_empty())
}

/// Four-digit years 1900-2099 appearing in `text`.
pub fn years_in(text: &str) -> Vec<u32> {
    let mut years = Vec::new();
    let mut run = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            run.push(ch);
            continue;
        }
        if run.len() == 4 && (run.starts_with("19") || run.starts_with("20")) {
            if let Ok(year) = run.parse() {
                years.push(year);
            }
        }
        run.clear();
    }
    years
}

/// A label that is nothing but a year, such as "2023", "FY2023" or "2023年".
pub fn is_year_label(text: &str) -> bool {
    let trimmed = text.trim();
    let years = years_in(trimmed);
    if years.len() != 1 {
        return false;
    }
    let rest: String = trimmed
        .replace(&years[0].to_string(), "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    matches!(rest.to_lowercase().as_str(), "" | "fy" | "年" | "e" | "a")
}

/// Short display form used in templates.
pub fn format_value(value: f64) -> String {
    if value.fract().abs() < 1e-9 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}
