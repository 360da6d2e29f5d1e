//! Plain-text rendering of batch and analysis results for the terminal.

use std::fmt::Write as _;

use blindeval_core::analysis::{
    AnalysisReport, Attribution, BinarySummary, CategoricalSummary, Summary, WinTally,
};
use blindeval_core::ledger::RejectedLine;
use blindeval_core::stats::Describe;
use blindeval_pipeline::dispatcher::BatchReport;
use serde::Serialize;

const RULE: &str = "--------------------------------------------------------------------------------";

/// Tally line plus one line per failed job.
pub fn format_batch<T>(title: &str, report: &BatchReport<T>) -> String {
    let mut out = String::new();
    writeln!(out, "{RULE}\n{title}: {}", report.tally()).ok();
    writeln!(out, "  elapsed: {:.1}s", report.elapsed.as_secs_f64()).ok();
    for (job_id, error) in report.failures() {
        writeln!(out, "  FAILED {job_id}: {error}").ok();
    }
    out
}

fn format_tally(tally: &WinTally) -> String {
    let wins = tally
        .wins
        .iter()
        .map(|(producer, wins)| format!("{producer} {wins}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} comparisons: {wins}, ties {}", tally.comparisons, tally.ties)
}

fn format_describe(d: &Describe) -> String {
    format!(
        "mean {:.1}, std {:.1}, min {:.0}, max {:.0} (n={})",
        d.mean, d.std, d.min, d.max, d.n
    )
}

fn write_binary(out: &mut String, binary: &BinarySummary) {
    writeln!(out, "{RULE}\nBinary preference").ok();
    writeln!(out, "  overall: {}", format_tally(&binary.overall)).ok();

    let test = &binary.test;
    let opponent = test.opponent.as_deref().unwrap_or("others");
    writeln!(
        out,
        "  {} vs {opponent}: {} - {} over {} trials (ties {:?})",
        test.focus_producer, test.focus_wins, test.opponent_wins, test.trials, test.tie_policy,
    )
    .ok();
    match (test.p_value, test.effect_size_points) {
        (Some(p), Some(effect)) => {
            writeln!(out, "  exact binomial p = {p:.4}, win-rate difference {effect:+.1} points").ok();
        }
        _ => {
            writeln!(out, "  not enough decisive comparisons for a significance test").ok();
        }
    }

    writeln!(out, "  per rater:").ok();
    for (rater, tally) in &binary.per_rater {
        writeln!(out, "    {rater}: {}", format_tally(tally)).ok();
    }
    writeln!(out, "  per item:").ok();
    for (item, tally) in &binary.per_item {
        writeln!(out, "    {item}: {}", format_tally(tally)).ok();
    }
}

fn write_categorical(out: &mut String, categorical: &CategoricalSummary) {
    writeln!(out, "{RULE}\nCategorical scores").ok();
    writeln!(out, "  overall: {}", format_describe(&categorical.overall)).ok();
    for (producer, scores) in &categorical.per_producer {
        writeln!(out, "  {producer}: {}", format_describe(scores)).ok();
    }
    writeln!(out, "  mean deduction by category:").ok();
    for category in &categorical.category_means {
        writeln!(out, "    {:<14} {:.2}", category.category.as_str(), category.mean_deduction).ok();
    }
    writeln!(out, "  per item:").ok();
    for (item, scores) in &categorical.per_item {
        let labels = scores
            .labels
            .iter()
            .map(|l| {
                let who = l.producer.as_deref().unwrap_or("?");
                format!("{} ({who}) {:.1} ± {:.1} n={}", l.label, l.scores.mean, l.scores.std, l.scores.n)
            })
            .collect::<Vec<_>>()
            .join("; ");
        let diff = scores
            .focus_minus_other
            .map(|d| format!(", difference {d:+.1}"))
            .unwrap_or_default();
        writeln!(out, "    {item}: {labels}{diff}").ok();
    }
}

/// Human-readable analysis summary.
pub fn format_summary(summary: &Summary) -> String {
    let mut out = String::new();
    if let Some(batch) = &summary.batch {
        writeln!(out, "Batch: {batch}").ok();
    }
    writeln!(out, "Judgment rows: {}", summary.rows).ok();
    if summary.other_batch_rows > 0 {
        writeln!(out, "Rows from other batches ignored: {}", summary.other_batch_rows).ok();
    }
    if summary.degraded {
        let unassigned = summary
            .attribution
            .iter()
            .filter(|(_, a)| **a == Attribution::RecordedOnly)
            .count();
        writeln!(
            out,
            "WARNING: degraded attribution, {unassigned} item(s) de-blinded from recorded producers only"
        )
        .ok();
    }
    if let Some(binary) = &summary.binary {
        write_binary(&mut out, binary);
    }
    if let Some(categorical) = &summary.categorical {
        write_categorical(&mut out, categorical);
    }
    if !summary.findings.is_empty() {
        writeln!(out, "{RULE}\nIntegrity findings ({})", summary.findings.len()).ok();
        for finding in &summary.findings {
            writeln!(out, "  - {finding}").ok();
        }
    }
    out
}

/// `summarize --json` output: the report plus every ledger line that
/// could not be decoded.
#[derive(Serialize)]
struct SummaryDocument<'a> {
    report: &'a AnalysisReport,
    rejected: &'a [RejectedLine],
}

pub fn summary_json(
    report: &AnalysisReport,
    rejected: &[RejectedLine],
) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&SummaryDocument { report, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use blindeval_core::ledger::LedgerSnapshot;
    use std::collections::BTreeMap;

    #[test]
    fn tally_lists_every_producer() {
        let tally = WinTally {
            comparisons: 10,
            wins: BTreeMap::from([("alpha".to_string(), 7), ("beta".to_string(), 2)]),
            ties: 1,
        };
        assert_eq!(format_tally(&tally), "10 comparisons: alpha 7, beta 2, ties 1");
    }

    #[test]
    fn empty_batch_report() {
        let text = format_batch("Inference", &BatchReport::<()>::default());
        assert!(text.contains("Inference: 0 succeeded, 0 failed (0 total)"));
        assert!(!text.contains("FAILED"));
    }

    #[test]
    fn json_summary_carries_rejected_lines() {
        let body = b"{\"not\": \"a row\"}\n\n";
        let snapshot = LedgerSnapshot::parse(body, None);
        assert!(snapshot.judgments.is_empty());

        let text = summary_json(&AnalysisReport::NoData, &snapshot.rejected).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["report"]["status"], "no_data");
        let rejected = doc["rejected"].as_array().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0]["line"], 1);
        assert!(!rejected[0]["message"].as_str().unwrap().is_empty());
    }

    #[test]
    fn json_summary_with_clean_ledger_has_empty_rejected() {
        let text = summary_json(&AnalysisReport::NoData, &[]).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["rejected"], serde_json::json!([]));
    }
}
