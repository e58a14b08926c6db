//! Terminal rendering of analysis outcomes.
//!
//! Renderers are projections of controller outcomes; nothing they do feeds back
//! into the delivery state.

use crate::metrics::{self, MetricTone};
use crate::model::AnalysisPayload;
use crate::summary;
use std::io::Write;
use tokio::sync::mpsc;

const BAR_WIDTH: usize = 30;
const TEXT_WIDTH: usize = 76;

/// Consumer of terminal outcomes.
pub trait Renderer: Send {
    fn render_success(&mut self, ticker: &str, payload: &AnalysisPayload);
    fn render_error(&mut self, reason: &str);
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn render_success(&mut self, ticker: &str, payload: &AnalysisPayload) {
        (**self).render_success(ticker, payload);
    }

    fn render_error(&mut self, reason: &str) {
        (**self).render_error(reason);
    }
}

/// Output line routing for stdout/stderr writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
pub fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Human-readable cards, a percentage bar chart, and narrative sections.
pub struct TextRenderer {
    out: mpsc::UnboundedSender<OutputLine>,
}

impl TextRenderer {
    pub fn new(out: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self { out }
    }
}

impl Renderer for TextRenderer {
    fn render_success(&mut self, ticker: &str, payload: &AnalysisPayload) {
        for line in build_text_report(ticker, payload) {
            let _ = self.out.send(OutputLine::Stdout(line));
        }
    }

    fn render_error(&mut self, reason: &str) {
        let _ = self.out.send(OutputLine::Stderr(format!("Error: {reason}")));
    }
}

/// Payload (or error) as pretty JSON on stdout, for scripting.
pub struct JsonRenderer {
    out: mpsc::UnboundedSender<OutputLine>,
}

impl JsonRenderer {
    pub fn new(out: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self { out }
    }

    fn emit(&self, value: serde_json::Value) {
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        let _ = self.out.send(OutputLine::Stdout(text));
    }
}

impl Renderer for JsonRenderer {
    fn render_success(&mut self, ticker: &str, payload: &AnalysisPayload) {
        self.emit(serde_json::json!({ "ticker": ticker, "result": payload }));
    }

    fn render_error(&mut self, reason: &str) {
        self.emit(serde_json::json!({ "error": reason }));
    }
}

/// Build the text report for a completed analysis.
pub fn build_text_report(ticker: &str, payload: &AnalysisPayload) -> Vec<String> {
    let mut lines = vec![format!("== {ticker} ==")];

    let metrics = payload.financial_metrics();
    if !metrics.is_empty() {
        lines.push("Financial Metrics".to_string());
        let label_width = metrics.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
        for (label, value) in &metrics {
            let tone = metrics::classify(value);
            lines.push(format!(
                "  {} {:<label_width$}  {}",
                tone.marker(),
                label,
                value
            ));
        }
        lines.extend(percent_chart(&metrics::percent_metrics(&metrics)));
    }

    if let Some(text) = payload.analysis_summary() {
        lines.push("Analysis Summary".to_string());
        for section in summary::split_sections(text) {
            if let Some(title) = section.title.as_deref() {
                lines.push(format!("  [{title}]"));
            }
            for l in summary::wrap(&section.body, TEXT_WIDTH) {
                lines.push(format!("    {l}"));
            }
        }
    }

    if lines.len() == 1 {
        lines.push("(no metrics or summary in result)".to_string());
    }
    lines
}

/// Horizontal bars scaled to the largest magnitude.
fn percent_chart(points: &[(String, f64)]) -> Vec<String> {
    if points.is_empty() {
        return Vec::new();
    }
    let mut lines = Vec::new();
    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    match metrics::compute_metrics(&values) {
        Some((mean, median, _, _)) => lines.push(format!(
            "Percentage Values (avg {mean:.2}% med {median:.2}%)"
        )),
        None => lines.push("Percentage Values".to_string()),
    }

    let label_width = points.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    let max_abs = values.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    for (label, value) in points {
        let len = if max_abs > 0.0 {
            ((value.abs() / max_abs) * BAR_WIDTH as f64).round() as usize
        } else {
            0
        };
        let glyph = match metrics::classify(&format!("{value}%")) {
            MetricTone::Positive => "█",
            MetricTone::Negative => "▒",
            MetricTone::Neutral => "·",
        };
        lines.push(format!(
            "  {:<label_width$} |{:<BAR_WIDTH$} {value:.2}%",
            label,
            glyph.repeat(len)
        ));
    }
    lines
}
