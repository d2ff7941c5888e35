//! Token usage and cost report over the transaction stream.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use crate::core::types::{TokenUsage, TransactionStatus};
use crate::io::audit::{Transaction, read_jsonl};
use crate::io::config::PricingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    All,
    /// Transactions whose UTC date is the `YYYY-MM-DD` passed as `today`.
    Today,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageReport {
    pub transactions: usize,
    pub successes: usize,
    pub failures: usize,
    pub usage: TokenUsage,
    pub estimated_cost: f64,
    /// Ledger lines that could not be decoded.
    pub skipped_lines: usize,
}

pub fn estimate_cost(usage: TokenUsage, pricing: &PricingConfig) -> f64 {
    (usage.input_tokens as f64 / 1_000_000.0) * pricing.input_per_1m
        + (usage.output_tokens as f64 / 1_000_000.0) * pricing.output_per_1m
}

/// Sum the transaction stream at `path`. `today` is only used with
/// [`Timeframe::Today`].
pub fn aggregate_usage(
    path: &Path,
    timeframe: Timeframe,
    today: &str,
    pricing: &PricingConfig,
) -> Result<UsageReport> {
    let (transactions, skipped_lines) = read_jsonl::<Transaction>(path)?;
    let mut report = UsageReport {
        skipped_lines,
        ..UsageReport::default()
    };
    for tx in transactions
        .iter()
        .filter(|tx| timeframe == Timeframe::All || tx.timestamp_utc.starts_with(today))
    {
        report.transactions += 1;
        match tx.status {
            TransactionStatus::Success => report.successes += 1,
            TransactionStatus::Failure => report.failures += 1,
        }
        report.usage.accumulate(tx.usage);
    }
    report.estimated_cost = estimate_cost(report.usage, pricing);
    Ok(report)
}

pub fn render(report: &UsageReport, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}");
    let _ = writeln!(
        out,
        "  transactions   {:>10}  ({} success, {} failure)",
        report.transactions, report.successes, report.failures
    );
    let _ = writeln!(out, "  input tokens   {:>10}", report.usage.input_tokens);
    let _ = writeln!(out, "  output tokens  {:>10}", report.usage.output_tokens);
    let _ = writeln!(out, "  total tokens   {:>10}", report.usage.total_tokens);
    let _ = writeln!(out, "  est. cost      {:>10.4}", report.estimated_cost);
    if report.skipped_lines > 0 {
        let _ = writeln!(out, "  ({} malformed ledger lines skipped)", report.skipped_lines);
    }
    out
}
