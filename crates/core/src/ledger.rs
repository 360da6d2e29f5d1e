//! The append-only score ledger.
//!
//! The ledger is a single object in an [`ObjectStore`] holding one JSON
//! object per line, always with the same column set:
//!
//! | Column          | Binary rows        | Categorical rows        |
//! |-----------------|--------------------|-------------------------|
//! | `timestamp`     | RFC 3339 UTC       | RFC 3339 UTC            |
//! | `batch`         | `run_…` batch id   | `run_…` batch id        |
//! | `rater_id`      | rater              | rater                   |
//! | `item`          | item key           | item key                |
//! | `label`         | `red` / `yellow`   | `red` / `yellow`        |
//! | `producer`      | producer           | producer                |
//! | `mode`          | `binary`           | `categorical`           |
//! | `coverage` .. `hallucination` | `null` | points deducted     |
//! | `score`         | 0, 0.5 or 1        | 0..=100                 |
//! | `notes`         | free text          | free text               |
//!
//! One ledger serves every batch; item keys repeat across batches, so
//! consumers scope rows by `batch` before de-blinding.
//!
//! Appends never replace or merge rows. Each append is a read-modify-write
//! made conditional on the version that was read; a concurrent writer makes
//! the write fail its precondition and the append retries on fresh data.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::blinding::BlindLabel;
use crate::error::CoreError;
use crate::judgment::{
    validate_pair, BinaryScore, Deductions, Judgment, JudgmentMode, JudgmentPair, Verdict,
};
use crate::storage::{ObjectStore, ObjectVersion, PutMode, StorageError};
use crate::types::{ItemKey, ProducerId, RaterId, Timestamp};

/// Column order of the ledger (and of the CSV export).
pub const LEDGER_COLUMNS: [&str; 14] = [
    "timestamp",
    "batch",
    "rater_id",
    "item",
    "label",
    "producer",
    "mode",
    "coverage",
    "order",
    "verb",
    "specificity",
    "hallucination",
    "score",
    "notes",
];

/// Conditional write attempts before an append gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Base delay between conflicting attempts; grows linearly.
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("score ledger '{key}' kept changing underneath; gave up after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("failed to encode ledger row: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("refusing to append invalid judgment pair: {0}")]
    InvalidPair(CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LedgerError> for CoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Contention { .. } => CoreError::Conflict(err.to_string()),
            LedgerError::Encode(e) => CoreError::Internal(e.to_string()),
            LedgerError::InvalidPair(e) => e,
            LedgerError::Storage(e) => CoreError::Storage(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Row format
// ---------------------------------------------------------------------------

/// One ledger line, flattened from a [`Judgment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub timestamp: Timestamp,
    pub batch: BatchId,
    pub rater_id: RaterId,
    pub item: ItemKey,
    pub label: BlindLabel,
    pub producer: ProducerId,
    pub mode: JudgmentMode,
    pub coverage: Option<u32>,
    pub order: Option<u32>,
    pub verb: Option<u32>,
    pub specificity: Option<u32>,
    pub hallucination: Option<u32>,
    pub score: f64,
    #[serde(default)]
    pub notes: String,
}

impl From<&Judgment> for LedgerRow {
    fn from(j: &Judgment) -> Self {
        let deductions = match &j.verdict {
            Verdict::Categorical(d) => Some(*d),
            Verdict::Binary(_) => None,
        };
        Self {
            timestamp: j.timestamp,
            batch: j.batch.clone(),
            rater_id: j.rater_id.clone(),
            item: j.item.clone(),
            label: j.label,
            producer: j.producer.clone(),
            mode: j.mode(),
            coverage: deductions.map(|d| d.coverage),
            order: deductions.map(|d| d.order),
            verb: deductions.map(|d| d.verb),
            specificity: deductions.map(|d| d.specificity),
            hallucination: deductions.map(|d| d.hallucination),
            score: j.verdict.score(),
            notes: j.notes.clone(),
        }
    }
}

impl TryFrom<LedgerRow> for Judgment {
    type Error = CoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let fields = [
            row.coverage,
            row.order,
            row.verb,
            row.specificity,
            row.hallucination,
        ];
        let verdict = match row.mode {
            JudgmentMode::Binary => {
                if fields.iter().any(Option::is_some) {
                    return Err(CoreError::Validation(
                        "binary row carries category deductions".to_string(),
                    ));
                }
                Verdict::Binary(BinaryScore::from_value(row.score)?)
            }
            JudgmentMode::Categorical => {
                let [Some(coverage), Some(order), Some(verb), Some(specificity), Some(hallucination)] =
                    fields
                else {
                    return Err(CoreError::Validation(
                        "categorical row is missing a category deduction".to_string(),
                    ));
                };
                let deductions = Deductions {
                    coverage,
                    order,
                    verb,
                    specificity,
                    hallucination,
                };
                if f64::from(deductions.score()) != row.score {
                    return Err(CoreError::Validation(format!(
                        "categorical score {} does not match deductions (expected {})",
                        row.score,
                        deductions.score()
                    )));
                }
                Verdict::Categorical(deductions)
            }
        };
        Ok(Judgment {
            timestamp: row.timestamp,
            batch: row.batch,
            rater_id: row.rater_id,
            item: row.item,
            label: row.label,
            producer: row.producer,
            verdict,
            notes: row.notes,
        })
    }
}

fn encode_rows<'a>(rows: impl IntoIterator<Item = &'a Judgment>) -> Result<String, LedgerError> {
    let mut out = String::new();
    for judgment in rows {
        out.push_str(&serde_json::to_string(&LedgerRow::from(judgment))?);
        out.push('\n');
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A ledger line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedLine {
    /// 1-based line number.
    pub line: usize,
    pub message: String,
}

/// The ledger as read at one version.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub judgments: Vec<Judgment>,
    pub rejected: Vec<RejectedLine>,
    /// `None` when the ledger object does not exist yet.
    pub version: Option<ObjectVersion>,
}

impl LedgerSnapshot {
    /// Decode a ledger body. Bad lines (including invalid UTF-8) are
    /// collected, not fatal.
    pub fn parse(body: &[u8], version: Option<ObjectVersion>) -> Self {
        let mut snapshot = Self {
            version,
            ..Default::default()
        };
        for (idx, raw) in body.split(|b| *b == b'\n').enumerate() {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let decoded = std::str::from_utf8(raw)
                .map_err(|e| format!("invalid UTF-8: {e}"))
                .and_then(|line| serde_json::from_str::<LedgerRow>(line).map_err(|e| e.to_string()))
                .and_then(|row| Judgment::try_from(row).map_err(|e| e.to_string()));
            match decoded {
                Ok(judgment) => snapshot.judgments.push(judgment),
                Err(message) => snapshot.rejected.push(RejectedLine {
                    line: idx + 1,
                    message,
                }),
            }
        }
        snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty()
    }

    /// Rows recorded against `batch`.
    pub fn batch_judgments(&self, batch: &BatchId) -> Vec<Judgment> {
        self.judgments
            .iter()
            .filter(|j| j.batch == *batch)
            .cloned()
            .collect()
    }

    /// Items `rater_id` has at least one row for in `batch`.
    pub fn judged_items(&self, rater_id: &str, batch: &BatchId) -> BTreeSet<ItemKey> {
        self.judgments
            .iter()
            .filter(|j| j.rater_id == rater_id && j.batch == *batch)
            .map(|j| j.item.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Handle to the ledger object.
#[derive(Clone)]
pub struct ScoreLedger {
    store: Arc<dyn ObjectStore>,
    key: String,
    max_attempts: u32,
}

impl ScoreLedger {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the whole ledger. A missing object is an empty ledger.
    pub async fn load(&self) -> Result<LedgerSnapshot, LedgerError> {
        let snapshot = match self.store.get(&self.key).await? {
            Some(object) => LedgerSnapshot::parse(&object.body, Some(object.version)),
            None => LedgerSnapshot::default(),
        };
        if !snapshot.rejected.is_empty() {
            tracing::warn!(
                key = %self.key,
                rejected = snapshot.rejected.len(),
                "Score ledger contains undecodable lines",
            );
        }
        Ok(snapshot)
    }

    /// Append one judgment.
    pub async fn append(&self, judgment: &Judgment) -> Result<(), LedgerError> {
        self.append_encoded(encode_rows([judgment])?, 1).await
    }

    /// Append both rows of a comparison in one write.
    pub async fn append_pair(&self, pair: &JudgmentPair) -> Result<(), LedgerError> {
        let [red, yellow] = pair.rows();
        validate_pair(red, yellow).map_err(LedgerError::InvalidPair)?;
        self.append_encoded(encode_rows(pair.rows())?, 2).await
    }

    async fn append_encoded(&self, lines: String, rows: usize) -> Result<(), LedgerError> {
        for attempt in 1..=self.max_attempts {
            let (mut body, mode) = match self.store.get(&self.key).await? {
                Some(object) => (object.body, PutMode::IfMatch(object.version)),
                None => (Vec::new(), PutMode::Create),
            };
            if !body.is_empty() && !body.ends_with(b"\n") {
                body.push(b'\n');
            }
            body.extend_from_slice(lines.as_bytes());

            match self.store.put(&self.key, body, mode).await {
                Ok(_) => {
                    tracing::debug!(key = %self.key, rows, attempt, "Appended to score ledger");
                    return Ok(());
                }
                Err(StorageError::PreconditionFailed { .. }) => {
                    tracing::warn!(key = %self.key, attempt, "Score ledger changed concurrently, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LedgerError::Contention {
            key: self.key.clone(),
            attempts: self.max_attempts,
        })
    }
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

/// Render judgments as CSV with [`LEDGER_COLUMNS`] as the header.
/// Deductions are empty cells in binary rows.
pub fn to_csv(judgments: &[Judgment]) -> String {
    let mut output = LEDGER_COLUMNS.join(",");
    output.push('\n');

    for j in judgments {
        let row = LedgerRow::from(j);
        let cell = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();
        writeln!(
            output,
            "{},{},\"{}\",\"{}\",{},\"{}\",{},{},{},{},{},{},{},\"{}\"",
            row.timestamp.to_rfc3339(),
            row.batch,
            escape_csv(&row.rater_id),
            escape_csv(&row.item),
            row.label,
            escape_csv(&row.producer),
            row.mode,
            cell(row.coverage),
            cell(row.order),
            cell(row.verb),
            cell(row.specificity),
            cell(row.hallucination),
            row.score,
            escape_csv(&row.notes),
        )
        .ok();
    }

    output
}

/// Double quotes become double-double quotes.
fn escape_csv(s: &str) -> String {
    s.replace('"', "\"\"")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
