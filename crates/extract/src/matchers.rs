//! Pluggable cell type heuristics. Matchers run in order and the first one
//! that claims a sample decides its type.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::numeric::is_numeric;
use crate::schema::CellType;

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^(
            \d{4}[-/]\d{1,2}([-/]\d{1,2})?
          | \d{4}\.\d{1,2}\.\d{1,2}
          | \d{1,2}[-/.]\d{1,2}[-/.]\d{2,4}
          | (q[1-4]|h[12])\s*[-/]?\s*'?\d{2,4}
          | \d{4}\s*(q[1-4]|h[12])
          | (jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+(\d{1,2},?\s+)?\d{4}
          | \d{1,2}\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{4}
          | \d{4}年(\d{1,2}月(\d{1,2}日)?)?
          | \d{1,2}月\d{1,2}日
        )$",
    )
    .unwrap()
});

pub fn is_date(raw: &str) -> bool {
    DATE_RE.is_match(raw.trim())
}

pub trait CellMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Type of the non-empty `sample`, or `None` to defer to the next matcher.
    fn classify(&self, sample: &[&str]) -> Option<CellType>;
}

/// Claims samples whose values are mostly numbers.
pub struct NumericMatcher {
    pub min_ratio: f64,
}

impl CellMatcher for NumericMatcher {
    fn name(&self) -> &'static str {
        "numeric"
    }

    fn classify(&self, sample: &[&str]) -> Option<CellType> {
        let hits = sample.iter().filter(|v| is_numeric(v) && !is_date(v)).count();
        (ratio(hits, sample.len()) >= self.min_ratio).then_some(CellType::Numeric)
    }
}

pub struct DateMatcher {
    pub min_ratio: f64,
}

impl CellMatcher for DateMatcher {
    fn name(&self) -> &'static str {
        "date"
    }

    fn classify(&self, sample: &[&str]) -> Option<CellType> {
        let hits = sample.iter().filter(|v| is_date(v)).count();
        (ratio(hits, sample.len()) >= self.min_ratio).then_some(CellType::Date)
    }
}

/// Few distinct values repeated across a reasonably sized sample.
pub struct CategoricalMatcher {
    pub min_sample: usize,
    pub max_distinct_ratio: f64,
}

impl CellMatcher for CategoricalMatcher {
    fn name(&self) -> &'static str {
        "categorical"
    }

    fn classify(&self, sample: &[&str]) -> Option<CellType> {
        if sample.len() < self.min_sample {
            return None;
        }
        let distinct: HashSet<String> = sample.iter().map(|v| v.trim().to_lowercase()).collect();
        (ratio(distinct.len(), sample.len()) <= self.max_distinct_ratio).then_some(CellType::Categorical)
    }
}

/// Fallback that accepts anything.
pub struct TextMatcher;

impl CellMatcher for TextMatcher {
    fn name(&self) -> &'static str {
        "text"
    }

    fn classify(&self, _sample: &[&str]) -> Option<CellType> {
        Some(CellType::Text)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Ordered matcher list shared by the analyzer and the enhancer.
pub struct TypeClassifier {
    matchers: Vec<Box<dyn CellMatcher>>,
}

impl Default for TypeClassifier {
    fn default() -> Self {
        Self {
            matchers: vec![
                Box::new(NumericMatcher { min_ratio: 0.8 }),
                Box::new(DateMatcher { min_ratio: 0.8 }),
                Box::new(CategoricalMatcher {
                    min_sample: 4,
                    max_distinct_ratio: 0.5,
                }),
                Box::new(TextMatcher),
            ],
        }
    }
}

impl TypeClassifier {
    pub fn with_matchers(matchers: Vec<Box<dyn CellMatcher>>) -> Self {
        Self { matchers }
    }

    /// Inserts a matcher ahead of the built-in ones.
    pub fn prepend(mut self, matcher: Box<dyn CellMatcher>) -> Self {
        self.matchers.insert(0, matcher);
        self
    }

    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    pub fn classify<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> CellType {
        let sample: Vec<&str> = values
            .into_iter()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        if sample.is_empty() {
            return CellType::Empty;
        }
        self.matchers
            .iter()
            .find_map(|m| m.classify(&sample))
            .unwrap_or(CellType::Text)
    }

    pub fn classify_value(&self, value: &str) -> CellType {
        self.classify(std::iter::once(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_matcher_order() {
        let classifier = TypeClassifier::default();
        assert_eq!(classifier.matcher_names(), vec!["numeric", "date", "categorical", "text"]);

        assert_eq!(classifier.classify(["1,200", "(30)", "4.5%"]), CellType::Numeric);
        assert_eq!(classifier.classify(["2023-01-31", "2023-02-28"]), CellType::Date);
        assert_eq!(
            classifier.classify(["North", "South", "North", "South", "North"]),
            CellType::Categorical
        );
        assert_eq!(classifier.classify(["Revenue", "Cost of sales"]), CellType::Text);
        assert_eq!(classifier.classify(["1234.56", "2023.5"]), CellType::Numeric);
        assert_eq!(classifier.classify(["", "  "]), CellType::Empty);
    }

    #[test]
    fn test_dates() {
        for d in ["2023-06-30", "30/06/2023", "Q3 2023", "2023Q3", "Jun 2023", "2023年6月", "FY2023"] {
            if d == "FY2023" {
                assert!(!is_date(d));
            } else {
                assert!(is_date(d), "{d}");
            }
        }
    }

    struct YesNo;

    impl CellMatcher for YesNo {
        fn name(&self) -> &'static str {
            "yes_no"
        }

        fn classify(&self, sample: &[&str]) -> Option<CellType> {
            sample
                .iter()
                .all(|v| matches!(v.to_lowercase().as_str(), "yes" | "no"))
                .then_some(CellType::Categorical)
        }
    }

    #[test]
    fn test_custom_matcher_runs_first() {
        let classifier = TypeClassifier::default().prepend(Box::new(YesNo));
        assert_eq!(classifier.classify(["yes", "no"]), CellType::Categorical);
        assert_eq!(classifier.classify(["12"]), CellType::Numeric);
    }
}
