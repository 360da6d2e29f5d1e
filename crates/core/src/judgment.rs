//! Judgments recorded by raters.
//!
//! A comparison of one item by one rater always produces exactly two
//! [`Judgment`]s, one per blind label. Binary judgments carry a preference
//! score; categorical judgments carry itemized rubric deductions. The two
//! shapes are a tagged [`Verdict`] and are only flattened into the ledger's
//! fixed column set at the storage boundary (see [`crate::ledger`]).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::blinding::{BlindAssignment, BlindLabel};
use crate::error::CoreError;
use crate::types::{ItemKey, ProducerId, RaterId, Timestamp};

/// Best possible categorical score.
pub const MAX_SCORE: u32 = 100;

/// Largest deduction accepted for a single category.
pub const MAX_CATEGORY_DEDUCTION: u32 = 100;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgmentMode {
    Binary,
    /// Older ledgers call this mode `detailed`.
    #[serde(alias = "detailed")]
    Categorical,
}

impl JudgmentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Categorical => "categorical",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "categorical" | "detailed" => Ok(Self::Categorical),
            other => Err(CoreError::Validation(format!(
                "Unknown judgment mode '{other}'. Must be one of: binary, categorical"
            ))),
        }
    }
}

impl fmt::Display for JudgmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rubric
// ---------------------------------------------------------------------------

/// The five categorical deduction categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RubricCategory {
    Coverage,
    Order,
    Verb,
    Specificity,
    Hallucination,
}

impl RubricCategory {
    pub const ALL: [RubricCategory; 5] = [
        RubricCategory::Coverage,
        RubricCategory::Order,
        RubricCategory::Verb,
        RubricCategory::Specificity,
        RubricCategory::Hallucination,
    ];

    /// Column name in the ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coverage => "coverage",
            Self::Order => "order",
            Self::Verb => "verb",
            Self::Specificity => "specificity",
            Self::Hallucination => "hallucination",
        }
    }

    /// Points deducted per offending instance.
    pub fn points_per_instance(self) -> u32 {
        match self {
            Self::Coverage => 5,
            Self::Order => 4,
            Self::Verb => 3,
            Self::Specificity => 3,
            Self::Hallucination => 10,
        }
    }

    /// Question shown to raters.
    pub fn prompt(self) -> &'static str {
        match self {
            Self::Coverage => "How many steps are missing?",
            Self::Order => "How many steps are out of order?",
            Self::Verb => "How many verbs are wrong?",
            Self::Specificity => "How many objects, hands or tools are wrong or missing?",
            Self::Hallucination => "How many steps are made up?",
        }
    }
}

impl fmt::Display for RubricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points lost per rubric category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deductions {
    pub coverage: u32,
    pub order: u32,
    pub verb: u32,
    pub specificity: u32,
    pub hallucination: u32,
}

impl Deductions {
    /// Build deductions from instance counts, applying each category's
    /// per-instance weight.
    pub fn from_instances(counts: [(RubricCategory, u32); 5]) -> Self {
        let mut deductions = Self::default();
        for (category, count) in counts {
            deductions.set(category, count.saturating_mul(category.points_per_instance()));
        }
        deductions
    }

    pub fn get(&self, category: RubricCategory) -> u32 {
        match category {
            RubricCategory::Coverage => self.coverage,
            RubricCategory::Order => self.order,
            RubricCategory::Verb => self.verb,
            RubricCategory::Specificity => self.specificity,
            RubricCategory::Hallucination => self.hallucination,
        }
    }

    pub fn set(&mut self, category: RubricCategory, points: u32) {
        match category {
            RubricCategory::Coverage => self.coverage = points,
            RubricCategory::Order => self.order = points,
            RubricCategory::Verb => self.verb = points,
            RubricCategory::Specificity => self.specificity = points,
            RubricCategory::Hallucination => self.hallucination = points,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RubricCategory, u32)> + '_ {
        RubricCategory::ALL.into_iter().map(|c| (c, self.get(c)))
    }

    pub fn total(&self) -> u32 {
        self.iter().map(|(_, points)| points).sum()
    }

    /// `100 - total`, floored at zero.
    pub fn score(&self) -> u32 {
        MAX_SCORE.saturating_sub(self.total())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (category, points) in self.iter() {
            if points > MAX_CATEGORY_DEDUCTION {
                return Err(CoreError::Validation(format!(
                    "Deduction for {category} must be between 0 and {MAX_CATEGORY_DEDUCTION}, got {points}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Binary scores
// ---------------------------------------------------------------------------

/// Score of one label in a binary comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryScore {
    Loss,
    Tie,
    Win,
}

impl BinaryScore {
    pub fn value(self) -> f64 {
        match self {
            Self::Loss => 0.0,
            Self::Tie => 0.5,
            Self::Win => 1.0,
        }
    }

    /// Accepts exactly 0, 0.5 or 1.
    pub fn from_value(value: f64) -> Result<Self, CoreError> {
        if value == 0.0 {
            Ok(Self::Loss)
        } else if value == 0.5 {
            Ok(Self::Tie)
        } else if value == 1.0 {
            Ok(Self::Win)
        } else {
            Err(CoreError::Validation(format!(
                "Binary score must be 0, 0.5 or 1, got {value}"
            )))
        }
    }
}

/// What a rater picked in binary mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryChoice {
    Prefer(BlindLabel),
    Tie,
}

impl BinaryChoice {
    /// Accepts a label name or `tie`.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        if value.trim().eq_ignore_ascii_case("tie") {
            return Ok(Self::Tie);
        }
        BlindLabel::parse(value).map(Self::Prefer)
    }

    pub fn score_for(self, label: BlindLabel) -> BinaryScore {
        match self {
            Self::Tie => BinaryScore::Tie,
            Self::Prefer(winner) if winner == label => BinaryScore::Win,
            Self::Prefer(_) => BinaryScore::Loss,
        }
    }
}

// ---------------------------------------------------------------------------
// Judgment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Binary(BinaryScore),
    Categorical(Deductions),
}

impl Verdict {
    pub fn mode(&self) -> JudgmentMode {
        match self {
            Self::Binary(_) => JudgmentMode::Binary,
            Self::Categorical(_) => JudgmentMode::Categorical,
        }
    }

    /// Numeric score: 0 / 0.5 / 1 for binary, 0..=100 for categorical.
    pub fn score(&self) -> f64 {
        match self {
            Self::Binary(score) => score.value(),
            Self::Categorical(deductions) => f64::from(deductions.score()),
        }
    }
}

/// One rater's score for one labeled output.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub timestamp: Timestamp,
    /// Batch whose blind assignment was shown to the rater.
    pub batch: BatchId,
    pub rater_id: RaterId,
    pub item: ItemKey,
    pub label: BlindLabel,
    /// Producer behind `label` when the judgment was recorded.
    pub producer: ProducerId,
    pub verdict: Verdict,
    pub notes: String,
}

impl Judgment {
    pub fn mode(&self) -> JudgmentMode {
        self.verdict.mode()
    }
}

// ---------------------------------------------------------------------------
// Pairs
// ---------------------------------------------------------------------------

/// Everything shared by the two rows of one comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub timestamp: Timestamp,
    pub batch: BatchId,
    pub rater_id: RaterId,
    pub item: ItemKey,
    pub red: ProducerId,
    pub yellow: ProducerId,
    pub notes: String,
}

impl Comparison {
    /// Look up the producers behind both labels for `item` in `batch`'s
    /// assignment.
    pub fn from_assignment(
        assignment: &BlindAssignment,
        batch: &BatchId,
        item: &str,
        rater_id: RaterId,
        timestamp: Timestamp,
        notes: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let producer = |label| {
            assignment
                .deblind(item, label)
                .cloned()
                .ok_or_else(|| CoreError::NotFound {
                    entity: "blind assignment",
                    key: format!("{item}/{label}"),
                })
        };
        Ok(Self {
            timestamp,
            batch: batch.clone(),
            rater_id,
            item: item.to_string(),
            red: producer(BlindLabel::Red)?,
            yellow: producer(BlindLabel::Yellow)?,
            notes: notes.into(),
        })
    }

    pub fn producer(&self, label: BlindLabel) -> &ProducerId {
        match label {
            BlindLabel::Red => &self.red,
            BlindLabel::Yellow => &self.yellow,
        }
    }

    fn row(&self, label: BlindLabel, verdict: Verdict) -> Judgment {
        Judgment {
            timestamp: self.timestamp,
            batch: self.batch.clone(),
            rater_id: self.rater_id.clone(),
            item: self.item.clone(),
            label,
            producer: self.producer(label).clone(),
            verdict,
            notes: self.notes.clone(),
        }
    }

    /// The two binary rows for `choice`. Scores always sum to 1.
    pub fn binary(&self, choice: BinaryChoice) -> JudgmentPair {
        JudgmentPair {
            rows: BlindLabel::ALL
                .map(|label| self.row(label, Verdict::Binary(choice.score_for(label)))),
        }
    }

    /// The two categorical rows.
    pub fn categorical(&self, red: Deductions, yellow: Deductions) -> Result<JudgmentPair, CoreError> {
        red.validate()?;
        yellow.validate()?;
        Ok(JudgmentPair {
            rows: [
                self.row(BlindLabel::Red, Verdict::Categorical(red)),
                self.row(BlindLabel::Yellow, Verdict::Categorical(yellow)),
            ],
        })
    }
}

/// Both rows of one comparison, constructed so the pair invariant holds.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgmentPair {
    rows: [Judgment; 2],
}

impl JudgmentPair {
    pub fn rows(&self) -> &[Judgment; 2] {
        &self.rows
    }

    pub fn into_rows(self) -> [Judgment; 2] {
        self.rows
    }
    #[cfg(test)]
    pub(crate) fn from_rows_unchecked(rows: [Judgment; 2]) -> Self {
        Self { rows }
    }
}

/// Check that two rows form a valid comparison: same batch, item, rater
/// and mode, distinct labels, and binary scores summing to exactly 1.
pub fn validate_pair(a: &Judgment, b: &Judgment) -> Result<(), CoreError> {
    if a.batch != b.batch || a.item != b.item || a.rater_id != b.rater_id {
        return Err(CoreError::Validation(
            "Judgment pair must share batch, item and rater".to_string(),
        ));
    }
    if a.label == b.label {
        return Err(CoreError::Validation(format!(
            "Judgment pair for {} uses label {} twice",
            a.item, a.label
        )));
    }
    match (&a.verdict, &b.verdict) {
        (Verdict::Binary(x), Verdict::Binary(y)) => {
            let sum = x.value() + y.value();
            if sum != 1.0 {
                return Err(CoreError::Validation(format!(
                    "Binary scores for {} by {} sum to {sum}, expected 1",
                    a.item, a.rater_id
                )));
            }
            Ok(())
        }
        (Verdict::Categorical(_), Verdict::Categorical(_)) => Ok(()),
        _ => Err(CoreError::Validation(format!(
            "Judgment pair for {} by {} mixes modes",
            a.item, a.rater_id
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
