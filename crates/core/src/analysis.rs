//! Aggregation of the score ledger into per-item, per-rater and overall
//! summaries.
//!
//! One ledger holds every batch and item keys repeat across batches, so
//! rows are scoped to [`AnalysisOptions::batch`] before the assignment
//! of that batch de-blinds them.
//!
//! Judgments are first attributed to producers through the blind
//! assignment. Items without an assignment fall back to the producer
//! recorded on the row and are marked [`Attribution::RecordedOnly`]; the
//! whole report is then flagged degraded.
//!
//! Binary and categorical rows are partitioned before any statistic is
//! computed. Data-integrity problems (duplicate submissions, half-written
//! pairs, impossible binary sums, mixed modes, producer mismatches) are
//! collected as [`IntegrityFinding`]s and never merged silently.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::batch::BatchId;
use crate::blinding::{BlindAssignment, BlindLabel};
use crate::judgment::{validate_pair, BinaryScore, Judgment, JudgmentMode, RubricCategory, Verdict};
use crate::stats::{self, Describe};
use crate::types::{ItemKey, ProducerId, RaterId};

/// Null hypothesis for the binomial test: no preference.
const NULL_WIN_PROBABILITY: f64 = 0.5;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Whether tied comparisons count as binomial trials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Ties are trials that the focus producer did not win.
    #[default]
    CountAsTrials,
    /// Ties are dropped from the trial total.
    Exclude,
}

impl TiePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "count" | "count_as_trials" | "include" => Some(Self::CountAsTrials),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Only rows recorded against this batch are analyzed. `None` takes
    /// every row, which is only meaningful for a single-batch ledger.
    pub batch: Option<BatchId>,
    /// Producer "A" of the significance test. Defaults to the
    /// lexicographically first producer seen.
    pub focus_producer: Option<ProducerId>,
    pub tie_policy: TiePolicy,
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// How an item's labels were mapped back to producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    /// Through the persisted blind assignment.
    Assigned,
    /// No assignment: the producer recorded on the row was trusted.
    RecordedOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityFinding {
    /// The same rater judged the same item more than once.
    DuplicateSubmission {
        item: ItemKey,
        rater_id: RaterId,
        mode: JudgmentMode,
        submissions: usize,
    },
    /// Label row counts differ, so at least one comparison is half-written.
    IncompletePair {
        item: ItemKey,
        rater_id: RaterId,
        mode: JudgmentMode,
        red_rows: usize,
        yellow_rows: usize,
    },
    /// Binary scores of a rater's comparisons on an item do not add up.
    BadBinarySum {
        item: ItemKey,
        rater_id: RaterId,
        sum: f64,
        expected: f64,
    },
    /// A rater has both binary and categorical rows for one item.
    MixedModes { item: ItemKey, rater_id: RaterId },
    /// The producer recorded on a row disagrees with the assignment.
    ProducerMismatch {
        item: ItemKey,
        label: BlindLabel,
        recorded: ProducerId,
        assigned: ProducerId,
    },
}

impl fmt::Display for IntegrityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateSubmission {
                item,
                rater_id,
                mode,
                submissions,
            } => write!(
                f,
                "{rater_id} submitted {submissions} {mode} judgments for {item}"
            ),
            Self::IncompletePair {
                item,
                rater_id,
                mode,
                red_rows,
                yellow_rows,
            } => write!(
                f,
                "{rater_id} has an incomplete {mode} pair for {item} (red: {red_rows}, yellow: {yellow_rows})"
            ),
            Self::BadBinarySum {
                item,
                rater_id,
                sum,
                expected,
            } => write!(
                f,
                "{rater_id}'s binary scores for {item} sum to {sum}, expected {expected}"
            ),
            Self::MixedModes { item, rater_id } => {
                write!(f, "{rater_id} mixed binary and categorical judgments for {item}")
            }
            Self::ProducerMismatch {
                item,
                label,
                recorded,
                assigned,
            } => write!(
                f,
                "{item}/{label}: recorded producer {recorded} but assignment says {assigned}"
            ),
        }
    }
}

/// Win counts for a group of binary comparisons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WinTally {
    pub comparisons: u64,
    /// Decisive wins per producer. Every producer seen in the group is
    /// present, possibly with zero.
    pub wins: BTreeMap<ProducerId, u64>,
    pub ties: u64,
}

impl WinTally {
    pub fn wins_for(&self, producer: &str) -> u64 {
        self.wins.get(producer).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignificanceTest {
    pub focus_producer: ProducerId,
    /// The other producer, when exactly one exists.
    pub opponent: Option<ProducerId>,
    pub focus_wins: u64,
    pub opponent_wins: u64,
    pub tie_policy: TiePolicy,
    pub trials: u64,
    /// `None` when there are no trials.
    pub p_value: Option<f64>,
    /// `(focus_wins - opponent_wins) / trials * 100`.
    pub effect_size_points: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinarySummary {
    pub overall: WinTally,
    pub per_item: BTreeMap<ItemKey, WinTally>,
    pub per_rater: BTreeMap<RaterId, WinTally>,
    pub test: SignificanceTest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelStats {
    pub label: BlindLabel,
    /// Producer behind the label, when it could be attributed.
    pub producer: Option<ProducerId>,
    /// `n` is the number of raters who scored this label.
    pub scores: Describe,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemScores {
    pub labels: Vec<LabelStats>,
    /// Mean score of the focus producer minus the other producer.
    pub focus_minus_other: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryMean {
    pub category: RubricCategory,
    pub mean_deduction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoricalSummary {
    pub overall: Describe,
    pub per_item: BTreeMap<ItemKey, ItemScores>,
    pub per_producer: BTreeMap<ProducerId, Describe>,
    pub category_means: Vec<CategoryMean>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub batch: Option<BatchId>,
    pub rows: usize,
    /// Ledger rows skipped because they belong to another batch.
    pub other_batch_rows: usize,
    pub binary: Option<BinarySummary>,
    pub categorical: Option<CategoricalSummary>,
    pub attribution: BTreeMap<ItemKey, Attribution>,
    /// No assignment at all, or at least one item attributed from recorded
    /// producers only.
    pub degraded: bool,
    pub findings: Vec<IntegrityFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisReport {
    NoData,
    Summary(Box<Summary>),
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// A judgment with the producer it is attributed to.
struct Attributed<'a> {
    judgment: &'a Judgment,
    producer: &'a str,
}

/// Reduce the judgment table to summaries.
pub fn analyze(
    judgments: &[Judgment],
    assignment: Option<&BlindAssignment>,
    options: &AnalysisOptions,
) -> AnalysisReport {
    let scoped: Vec<&Judgment> = judgments
        .iter()
        .filter(|j| options.batch.as_ref().map_or(true, |batch| j.batch == *batch))
        .collect();
    let other_batch_rows = judgments.len() - scoped.len();
    if other_batch_rows > 0 {
        tracing::debug!(
            batch = ?options.batch,
            skipped = other_batch_rows,
            "Ignoring ledger rows from other batches",
        );
    }
    if scoped.is_empty() {
        return AnalysisReport::NoData;
    }
    if assignment.is_none() {
        tracing::warn!("No blind assignment available; attributing judgments from recorded producers");
    }

    let mut findings = Vec::new();
    let mut attribution = BTreeMap::new();
    let rows = attribute(&scoped, assignment, &mut attribution, &mut findings);
    check_integrity(&rows, &mut findings);

    let focus = options
        .focus_producer
        .clone()
        .or_else(|| rows.iter().map(|r| r.producer).min().map(str::to_string))
        .unwrap_or_default();

    let (binary, categorical): (Vec<&Attributed>, Vec<&Attributed>) = rows
        .iter()
        .partition(|r| r.judgment.mode() == JudgmentMode::Binary);

    let degraded = assignment.is_none()
        || attribution.values().any(|a| *a == Attribution::RecordedOnly);

    AnalysisReport::Summary(Box::new(Summary {
        batch: options.batch.clone(),
        rows: scoped.len(),
        other_batch_rows,
        binary: summarize_binary(&binary, &focus, options.tie_policy),
        categorical: summarize_categorical(&categorical, &focus),
        attribution,
        degraded,
        findings,
    }))
}

fn attribute<'a>(
    judgments: &[&'a Judgment],
    assignment: Option<&'a BlindAssignment>,
    attribution: &mut BTreeMap<ItemKey, Attribution>,
    findings: &mut Vec<IntegrityFinding>,
) -> Vec<Attributed<'a>> {
    let mut mismatches = BTreeSet::new();
    judgments
        .iter()
        .map(|&j| {
            let assigned = assignment.and_then(|a| a.deblind(&j.item, j.label));
            let producer = match assigned {
                Some(assigned) => {
                    attribution.insert(j.item.clone(), Attribution::Assigned);
                    if *assigned != j.producer
                        && mismatches.insert((j.item.as_str(), j.label, j.producer.as_str()))
                    {
                        findings.push(IntegrityFinding::ProducerMismatch {
                            item: j.item.clone(),
                            label: j.label,
                            recorded: j.producer.clone(),
                            assigned: assigned.clone(),
                        });
                    }
                    assigned.as_str()
                }
                None => {
                    attribution.insert(j.item.clone(), Attribution::RecordedOnly);
                    j.producer.as_str()
                }
            };
            Attributed {
                judgment: j,
                producer,
            }
        })
        .collect()
}

fn check_integrity(rows: &[Attributed<'_>], findings: &mut Vec<IntegrityFinding>) {
    let mut groups: BTreeMap<(&str, &str, &str), Vec<&Judgment>> = BTreeMap::new();
    for row in rows {
        let j = row.judgment;
        groups
            .entry((j.batch.as_str(), j.item.as_str(), j.rater_id.as_str()))
            .or_default()
            .push(j);
    }

    for ((_, item, rater_id), group) in groups {
        let modes: BTreeSet<JudgmentMode> = group.iter().map(|j| j.mode()).collect();
        if modes.len() > 1 {
            findings.push(IntegrityFinding::MixedModes {
                item: item.to_string(),
                rater_id: rater_id.to_string(),
            });
        }

        for mode in modes {
            let of_mode: Vec<&&Judgment> = group.iter().filter(|j| j.mode() == mode).collect();
            let red_rows = of_mode.iter().filter(|j| j.label == BlindLabel::Red).count();
            let yellow_rows = of_mode.len() - red_rows;

            if red_rows != yellow_rows {
                findings.push(IntegrityFinding::IncompletePair {
                    item: item.to_string(),
                    rater_id: rater_id.to_string(),
                    mode,
                    red_rows,
                    yellow_rows,
                });
                continue;
            }
            if red_rows > 1 {
                findings.push(IntegrityFinding::DuplicateSubmission {
                    item: item.to_string(),
                    rater_id: rater_id.to_string(),
                    mode,
                    submissions: red_rows,
                });
            }
            if mode == JudgmentMode::Binary {
                let sum: f64 = of_mode.iter().map(|j| j.verdict.score()).sum();
                let expected = red_rows as f64;
                let consistent = match of_mode.as_slice() {
                    [a, b] => validate_pair(a, b).is_ok(),
                    _ => sum == expected,
                };
                if !consistent {
                    findings.push(IntegrityFinding::BadBinarySum {
                        item: item.to_string(),
                        rater_id: rater_id.to_string(),
                        sum,
                        expected,
                    });
                }
            }
        }
    }
}

fn tally(rows: &[&Attributed<'_>]) -> WinTally {
    let mut count = 0u64;
    let mut wins: BTreeMap<ProducerId, u64> = BTreeMap::new();
    for row in rows {
        count += 1;
        let slot = wins.entry(row.producer.to_string()).or_insert(0);
        if row.judgment.verdict == Verdict::Binary(BinaryScore::Win) {
            *slot += 1;
        }
    }
    let comparisons = count / 2;
    let decided: u64 = wins.values().sum();
    WinTally {
        comparisons,
        ties: comparisons.saturating_sub(decided),
        wins,
    }
}

fn summarize_binary(
    rows: &[&Attributed<'_>],
    focus: &str,
    tie_policy: TiePolicy,
) -> Option<BinarySummary> {
    if rows.is_empty() {
        return None;
    }

    let overall = tally(rows);

    let mut by_item: BTreeMap<&str, Vec<&Attributed>> = BTreeMap::new();
    let mut by_rater: BTreeMap<&str, Vec<&Attributed>> = BTreeMap::new();
    for &row in rows {
        by_item.entry(row.judgment.item.as_str()).or_default().push(row);
        by_rater.entry(row.judgment.rater_id.as_str()).or_default().push(row);
    }
    let per_item = by_item
        .into_iter()
        .map(|(item, group)| (item.to_string(), tally(&group)))
        .collect();
    let per_rater = by_rater
        .into_iter()
        .map(|(rater, group)| (rater.to_string(), tally(&group)))
        .collect();

    let focus_wins = overall.wins_for(focus);
    let opponents: Vec<&ProducerId> = overall.wins.keys().filter(|p| p.as_str() != focus).collect();
    let opponent_wins: u64 = opponents.iter().map(|p| overall.wins_for(p)).sum();
    let opponent = match opponents.as_slice() {
        [only] => Some(only.to_string()),
        _ => None,
    };

    let trials = match tie_policy {
        TiePolicy::CountAsTrials => overall.comparisons,
        TiePolicy::Exclude => focus_wins + opponent_wins,
    };
    let test = SignificanceTest {
        focus_producer: focus.to_string(),
        opponent,
        focus_wins,
        opponent_wins,
        tie_policy,
        trials,
        p_value: stats::binomial_two_sided(focus_wins, trials, NULL_WIN_PROBABILITY),
        effect_size_points: stats::win_rate_difference(focus_wins, opponent_wins, trials),
    };

    Some(BinarySummary {
        overall,
        per_item,
        per_rater,
        test,
    })
}

fn summarize_categorical(rows: &[&Attributed<'_>], focus: &str) -> Option<CategoricalSummary> {
    let all_scores: Vec<f64> = rows.iter().map(|r| r.judgment.verdict.score()).collect();
    let overall = stats::describe(&all_scores)?;

    let mut by_item_label: BTreeMap<(&str, BlindLabel), (Option<&str>, Vec<f64>)> = BTreeMap::new();
    let mut by_producer: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut category_totals = [0u64; 5];

    for row in rows {
        let j = row.judgment;
        let score = j.verdict.score();
        let entry = by_item_label
            .entry((j.item.as_str(), j.label))
            .or_insert_with(|| (Some(row.producer), Vec::new()));
        if entry.0 != Some(row.producer) {
            entry.0 = None;
        }
        entry.1.push(score);
        by_producer.entry(row.producer).or_default().push(score);

        if let Verdict::Categorical(deductions) = &j.verdict {
            for (slot, (_, points)) in category_totals.iter_mut().zip(deductions.iter()) {
                *slot += u64::from(points);
            }
        }
    }

    let mut per_item: BTreeMap<ItemKey, ItemScores> = BTreeMap::new();
    for ((item, label), (producer, scores)) in by_item_label {
        let Some(described) = stats::describe(&scores) else {
            continue;
        };
        per_item
            .entry(item.to_string())
            .or_insert_with(|| ItemScores {
                labels: Vec::new(),
                focus_minus_other: None,
            })
            .labels
            .push(LabelStats {
                label,
                producer: producer.map(str::to_string),
                scores: described,
            });
    }
    for scores in per_item.values_mut() {
        scores.focus_minus_other = focus_difference(&scores.labels, focus);
    }

    let per_producer = by_producer
        .into_iter()
        .filter_map(|(producer, scores)| Some((producer.to_string(), stats::describe(&scores)?)))
        .collect();

    let n = rows.len() as f64;
    let category_means = RubricCategory::ALL
        .into_iter()
        .zip(category_totals)
        .map(|(category, total)| CategoryMean {
            category,
            mean_deduction: total as f64 / n,
        })
        .collect();

    Some(CategoricalSummary {
        overall,
        per_item,
        per_producer,
        category_means,
    })
}

fn focus_difference(labels: &[LabelStats], focus: &str) -> Option<f64> {
    let [a, b] = labels else {
        return None;
    };
    match (a.producer.as_deref(), b.producer.as_deref()) {
        (Some(pa), Some(pb)) if pa == focus && pb != focus => Some(a.scores.mean - b.scores.mean),
        (Some(pa), Some(pb)) if pb == focus && pa != focus => Some(b.scores.mean - a.scores.mean),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
