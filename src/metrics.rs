use regex::Regex;
use std::sync::OnceLock;

/// Direction of a metric, derived from percentage values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricTone {
    Positive,
    Negative,
    Neutral,
}

impl MetricTone {
    pub fn marker(self) -> &'static str {
        match self {
            MetricTone::Positive => "+",
            MetricTone::Negative => "-",
            MetricTone::Neutral => " ",
        }
    }
}

fn leading_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?").expect("valid number pattern")
    })
}

/// Parse the numeric prefix of a display value, ignoring what follows ("12.5%" -> 12.5).
pub fn parse_leading_f64(value: &str) -> Option<f64> {
    leading_number()
        .find(value.trim_start())
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Numeric value of a percentage metric, `None` if the value is not a percentage.
pub fn percent_value(value: &str) -> Option<f64> {
    if !value.contains('%') {
        return None;
    }
    parse_leading_f64(value)
}

/// Classify a display value: percentages are positive or negative by sign, everything else is neutral.
pub fn classify(value: &str) -> MetricTone {
    match percent_value(value) {
        Some(v) if v > 0.0 => MetricTone::Positive,
        Some(v) if v < 0.0 => MetricTone::Negative,
        _ => MetricTone::Neutral,
    }
}

/// Percentage metrics as (label, value) pairs for charting.
pub fn percent_metrics(metrics: &[(String, String)]) -> Vec<(String, f64)> {
    metrics
        .iter()
        .filter_map(|(label, value)| percent_value(value).map(|v| (label.clone(), v)))
        .collect()
}

/// Compute metrics (mean, median, 25th percentile, 75th percentile) from values
pub fn compute_metrics(values: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}
