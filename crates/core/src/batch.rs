//! Batch identity and object-key layout.
//!
//! A batch (run) is one evaluation cycle over a fixed item pool and a fixed
//! producer pair. Every component takes the batch explicitly; resolving
//! "the most recent batch" happens once, in [`resolve_latest`], called by
//! the entry point.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! {prefix}/run_YYYYMMDD_HHMMSS/
//!     json/{item}_{producer}.json
//!     color_mapping.json
//!     subtitles/{item}.ass
//!     videos/{item}_comparison.mp4
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::storage::join_key;
use crate::types::{ItemKey, ProducerId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Every batch directory name starts with this prefix.
pub const BATCH_PREFIX: &str = "run_";

/// File name of the persisted blind assignment inside a batch.
pub const ASSIGNMENT_FILE: &str = "color_mapping.json";

/// Source video extensions recognised when listing items (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi"];

/// Maximum length of a producer name.
const MAX_PRODUCER_LEN: usize = 64;

// ---------------------------------------------------------------------------
// BatchId
// ---------------------------------------------------------------------------

/// Identifier of one evaluation batch, e.g. `run_20251004_135336`.
///
/// Identifiers created by [`BatchId::from_timestamp`] sort chronologically
/// under plain string ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchId(String);

impl BatchId {
    /// Build a batch id from a creation time.
    pub fn from_timestamp(ts: Timestamp) -> Self {
        Self(format!("{BATCH_PREFIX}{}", ts.format("%Y%m%d_%H%M%S")))
    }

    /// Parse and validate an operator-supplied batch id.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let value = value.trim().trim_matches('/');
        if !value.starts_with(BATCH_PREFIX) || value.len() == BATCH_PREFIX.len() {
            return Err(CoreError::Validation(format!(
                "Batch id '{value}' must start with '{BATCH_PREFIX}'"
            )));
        }
        if value.contains('/') || value.contains("..") {
            return Err(CoreError::Validation(format!(
                "Batch id '{value}' must be a single path segment"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BatchId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BatchId> for String {
    fn from(id: BatchId) -> Self {
        id.0
    }
}

/// Pick the most recent batch. Returns `None` for an empty input.
pub fn resolve_latest(candidates: impl IntoIterator<Item = BatchId>) -> Option<BatchId> {
    candidates.into_iter().max()
}

/// Extract the distinct batch ids found in a listing of keys under `prefix`.
pub fn batch_ids_from_keys(prefix: &str, keys: &[String]) -> Vec<BatchId> {
    let prefix = prefix.trim_matches('/');
    let mut ids: Vec<BatchId> = keys
        .iter()
        .filter_map(|key| {
            let rest = if prefix.is_empty() {
                key.as_str()
            } else {
                key.strip_prefix(prefix)?.strip_prefix('/')?
            };
            let segment = rest.split('/').next()?;
            BatchId::parse(segment).ok()
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Object keys of one batch under a storage prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    prefix: String,
    batch: BatchId,
}

impl BatchLayout {
    pub fn new(prefix: &str, batch: BatchId) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            batch,
        }
    }

    pub fn batch(&self) -> &BatchId {
        &self.batch
    }

    pub fn root(&self) -> String {
        join_key(&[&self.prefix, self.batch.as_str()])
    }

    /// Prefix under which all candidate outputs of the batch live.
    pub fn outputs_prefix(&self) -> String {
        format!("{}/json/", self.root())
    }

    pub fn output_key(&self, item: &str, producer: &str) -> String {
        format!("{}{item}_{producer}.json", self.outputs_prefix())
    }

    pub fn assignment_key(&self) -> String {
        format!("{}/{ASSIGNMENT_FILE}", self.root())
    }

    pub fn subtitle_key(&self, item: &str) -> String {
        format!("{}/subtitles/{item}.ass", self.root())
    }

    pub fn video_key(&self, item: &str) -> String {
        format!("{}/videos/{item}_comparison.mp4", self.root())
    }
}

/// Split an output key's file name `{item}_{producer}.json` on the last
/// underscore. Returns `None` for anything else.
pub fn parse_output_key(key: &str) -> Option<(ItemKey, ProducerId)> {
    let file = key.rsplit('/').next()?;
    let stem = file.strip_suffix(".json")?;
    if file == ASSIGNMENT_FILE {
        return None;
    }
    let (item, producer) = stem.rsplit_once('_')?;
    if item.is_empty() || producer.is_empty() {
        return None;
    }
    Some((item.to_string(), producer.to_string()))
}

/// Group output keys by item, then by producer.
pub fn group_outputs(keys: &[String]) -> BTreeMap<ItemKey, BTreeMap<ProducerId, String>> {
    let mut grouped: BTreeMap<ItemKey, BTreeMap<ProducerId, String>> = BTreeMap::new();
    for key in keys {
        if let Some((item, producer)) = parse_output_key(key) {
            grouped.entry(item).or_default().insert(producer, key.clone());
        }
    }
    grouped
}

// ---------------------------------------------------------------------------
// Source items
// ---------------------------------------------------------------------------

/// Map source video keys directly under `prefix` (not in sub-folders) to
/// their item keys (file stems).
pub fn source_items(prefix: &str, keys: &[String]) -> BTreeMap<ItemKey, String> {
    let prefix = prefix.trim_matches('/');
    keys.iter()
        .filter_map(|key| {
            let rest = if prefix.is_empty() {
                key.as_str()
            } else {
                key.strip_prefix(prefix)?.strip_prefix('/')?
            };
            if rest.contains('/') {
                return None;
            }
            let (stem, ext) = rest.rsplit_once('.')?;
            let ext = ext.to_ascii_lowercase();
            if stem.is_empty() || !VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            Some((stem.to_string(), key.clone()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a producer name.
///
/// Rules:
/// - Must not be empty or exceed `MAX_PRODUCER_LEN` characters.
/// - Only alphanumeric, hyphen, or dot characters. Underscores are
///   reserved as the item/producer separator in output keys.
pub fn validate_producer_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Producer name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_PRODUCER_LEN {
        return Err(CoreError::Validation(format!(
            "Producer name must not exceed {MAX_PRODUCER_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(CoreError::Validation(format!(
            "Producer name '{name}' may only contain alphanumeric, hyphen, or dot characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
