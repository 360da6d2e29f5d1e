//! Blind label assignment.
//!
//! Raters see two outputs per item under opaque colour labels instead of
//! producer names. Each item's producer -> label bijection is drawn
//! independently from a process-level random source, persisted once per
//! batch, and used by the analysis stage to map judgments back to
//! producers.

use std::collections::BTreeMap;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::storage::{ObjectStore, PutMode, StorageError};
use crate::types::{ItemKey, ProducerId};

// ---------------------------------------------------------------------------
// BlindLabel
// ---------------------------------------------------------------------------

/// The two opaque labels shown to raters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlindLabel {
    Red,
    Yellow,
}

impl BlindLabel {
    /// Both labels in canonical order.
    pub const ALL: [BlindLabel; 2] = [BlindLabel::Red, BlindLabel::Yellow];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
        }
    }

    /// The opposite label.
    pub fn other(self) -> Self {
        match self {
            Self::Red => Self::Yellow,
            Self::Yellow => Self::Red,
        }
    }

    /// Parse a label name (case-insensitive).
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "red" => Ok(Self::Red),
            "yellow" => Ok(Self::Yellow),
            other => Err(CoreError::Validation(format!(
                "Unknown blind label '{other}'. Must be one of: red, yellow"
            ))),
        }
    }

    /// ASS `&HBBGGRR&` colour used when burning subtitles.
    pub fn ass_colour(self) -> &'static str {
        match self {
            Self::Red => "&H000000FF",
            Self::Yellow => "&H0000FFFF",
        }
    }
}

impl fmt::Display for BlindLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Items that could not be (fully) assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentWarning {
    /// Fewer than two producers; the item is skipped.
    TooFewProducers { item: ItemKey, found: usize },
    /// More than two producers; only the first two (sorted) are paired.
    ExtraProducers {
        item: ItemKey,
        ignored: Vec<ProducerId>,
    },
}

impl fmt::Display for AssignmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewProducers { item, found } => {
                write!(f, "skipping {item}: only {found} producer output(s)")
            }
            Self::ExtraProducers { item, ignored } => {
                write!(f, "{item}: ignoring extra producers {}", ignored.join(", "))
            }
        }
    }
}

/// Result of [`BlindAssignment::generate`].
#[derive(Debug, Clone)]
pub struct AssignmentOutcome {
    pub assignment: BlindAssignment,
    pub warnings: Vec<AssignmentWarning>,
}

// ---------------------------------------------------------------------------
// BlindAssignment
// ---------------------------------------------------------------------------

/// Per-item producer -> label mapping.
///
/// Serialized as `{"item": {"producer": "red", "other": "yellow"}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlindAssignment {
    items: BTreeMap<ItemKey, BTreeMap<ProducerId, BlindLabel>>,
}

impl BlindAssignment {
    /// Assign labels using the thread-local random source.
    pub fn generate(items: &BTreeMap<ItemKey, Vec<ProducerId>>) -> AssignmentOutcome {
        Self::generate_with_rng(items, &mut rand::rng())
    }

    /// Assign labels using the given random source.
    pub fn generate_with_rng<R: Rng + ?Sized>(
        items: &BTreeMap<ItemKey, Vec<ProducerId>>,
        rng: &mut R,
    ) -> AssignmentOutcome {
        let mut assignment = Self::default();
        let mut warnings = Vec::new();

        for (item, producers) in items {
            let mut producers: Vec<ProducerId> = producers.clone();
            producers.sort();
            producers.dedup();

            if producers.len() < 2 {
                warnings.push(AssignmentWarning::TooFewProducers {
                    item: item.clone(),
                    found: producers.len(),
                });
                continue;
            }
            if producers.len() > 2 {
                warnings.push(AssignmentWarning::ExtraProducers {
                    item: item.clone(),
                    ignored: producers.split_off(2),
                });
            }

            let mut labels = BlindLabel::ALL;
            labels.shuffle(rng);
            let mapping = producers.into_iter().zip(labels).collect();
            assignment.items.insert(item.clone(), mapping);
        }

        for warning in &warnings {
            tracing::warn!(%warning, "Blind assignment");
        }

        AssignmentOutcome {
            assignment,
            warnings,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.contains_key(item)
    }

    /// Mapping for one item.
    pub fn item(&self, item: &str) -> Option<&BTreeMap<ProducerId, BlindLabel>> {
        self.items.get(item)
    }

    pub fn items(&self) -> impl Iterator<Item = (&ItemKey, &BTreeMap<ProducerId, BlindLabel>)> {
        self.items.iter()
    }

    /// Label shown for a producer's output on an item.
    pub fn label_for(&self, item: &str, producer: &str) -> Option<BlindLabel> {
        self.items.get(item)?.get(producer).copied()
    }

    /// Producer behind a label on an item.
    pub fn deblind(&self, item: &str, label: BlindLabel) -> Option<&ProducerId> {
        self.items
            .get(item)?
            .iter()
            .find(|(_, l)| **l == label)
            .map(|(p, _)| p)
    }

    /// Check that every item is a two-producer bijection.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (item, mapping) in &self.items {
            if mapping.len() != 2 {
                return Err(CoreError::Validation(format!(
                    "Item '{item}' maps {} producers; expected exactly 2",
                    mapping.len()
                )));
            }
            let mut labels: Vec<BlindLabel> = mapping.values().copied().collect();
            labels.sort();
            if labels != BlindLabel::ALL {
                return Err(CoreError::Validation(format!(
                    "Item '{item}' reuses a label: {mapping:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec_pretty(self).map_err(|e| CoreError::Internal(e.to_string()))
    }

    /// Parse and validate a persisted assignment.
    pub fn from_json_bytes(key: &str, bytes: &[u8]) -> Result<Self, CoreError> {
        let assignment: Self = serde_json::from_slice(bytes).map_err(|e| CoreError::Malformed {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        assignment.validate().map_err(|e| CoreError::Malformed {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(assignment)
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Persist an assignment. Existing assignments are never replaced unless
/// `overwrite` is set.
pub async fn save_assignment(
    store: &dyn ObjectStore,
    key: &str,
    assignment: &BlindAssignment,
    overwrite: bool,
) -> Result<(), CoreError> {
    let mode = if overwrite {
        PutMode::Overwrite
    } else {
        PutMode::Create
    };
    match store.put(key, assignment.to_json_bytes()?, mode).await {
        Ok(_) => Ok(()),
        Err(StorageError::PreconditionFailed { .. }) => Err(CoreError::Conflict(format!(
            "Blind assignment already exists at '{key}'"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Load a persisted assignment. Returns `Ok(None)` when none was saved.
pub async fn load_assignment(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<BlindAssignment>, CoreError> {
    match store.get(key).await? {
        Some(object) => BlindAssignment::from_json_bytes(key, &object.body).map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pool(n: usize) -> BTreeMap<ItemKey, Vec<ProducerId>> {
        (0..n)
            .map(|i| {
                (
                    format!("sample{i}"),
                    vec!["finetuned".to_string(), "baseline".to_string()],
                )
            })
            .collect()
    }

    // -- generate -------------------------------------------------------------

    #[test]
    fn every_item_gets_a_bijection() {
        let outcome = BlindAssignment::generate(&pool(25));
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.assignment.len(), 25);
        outcome.assignment.validate().unwrap();
        for (item, mapping) in outcome.assignment.items() {
            assert_eq!(mapping.len(), 2, "{item}");
            assert_ne!(mapping["finetuned"], mapping["baseline"]);
        }
    }

    #[test]
    fn items_are_randomized_independently() {
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = BlindAssignment::generate_with_rng(&pool(64), &mut rng);
        let red_for_finetuned = outcome
            .assignment
            .items()
            .filter(|(_, m)| m["finetuned"] == BlindLabel::Red)
            .count();
        // Both orientations must occur across 64 independent draws.
        assert!(red_for_finetuned > 0 && red_for_finetuned < 64);
    }

    #[test]
    fn too_few_producers_skipped_with_warning() {
        let mut items = pool(2);
        items.insert("lonely".to_string(), vec!["finetuned".to_string()]);
        let outcome = BlindAssignment::generate(&items);
        assert!(!outcome.assignment.contains("lonely"));
        assert_eq!(
            outcome.warnings,
            vec![AssignmentWarning::TooFewProducers {
                item: "lonely".to_string(),
                found: 1
            }]
        );
    }

    #[test]
    fn extra_producers_reported() {
        let mut items = BTreeMap::new();
        items.insert(
            "a".to_string(),
            vec!["m3".to_string(), "m1".to_string(), "m2".to_string()],
        );
        let outcome = BlindAssignment::generate(&items);
        let mapping = outcome.assignment.item("a").unwrap();
        assert!(mapping.contains_key("m1") && mapping.contains_key("m2"));
        assert_matches!(
            &outcome.warnings[..],
            [AssignmentWarning::ExtraProducers { ignored, .. }] if ignored == &vec!["m3".to_string()]
        );
    }

    // -- deblind --------------------------------------------------------------

    #[test]
    fn deblind_then_reblind_returns_label() {
        let outcome = BlindAssignment::generate(&pool(5));
        for (item, _) in outcome.assignment.items() {
            for label in BlindLabel::ALL {
                let producer = outcome.assignment.deblind(item, label).unwrap();
                assert_eq!(outcome.assignment.label_for(item, producer), Some(label));
            }
        }
    }

    #[test]
    fn unknown_item_is_none() {
        let outcome = BlindAssignment::generate(&pool(1));
        assert_eq!(outcome.assignment.deblind("missing", BlindLabel::Red), None);
        assert_eq!(outcome.assignment.label_for("sample0", "missing"), None);
    }

    // -- persistence ----------------------------------------------------------

    #[test]
    fn json_shape_matches_color_mapping() {
        let json = br#"{"sample1": {"finetuned": "red", "baseline": "yellow"}}"#;
        let assignment = BlindAssignment::from_json_bytes("k", json).unwrap();
        assert_eq!(assignment.label_for("sample1", "finetuned"), Some(BlindLabel::Red));
        assert_eq!(assignment.deblind("sample1", BlindLabel::Yellow).unwrap(), "baseline");
    }

    #[test]
    fn reused_label_rejected_on_load() {
        let json = br#"{"sample1": {"finetuned": "red", "baseline": "red"}}"#;
        assert_matches!(
            BlindAssignment::from_json_bytes("k", json),
            Err(CoreError::Malformed { .. })
        );
    }

    #[tokio::test]
    async fn save_is_create_only() {
        let store = MemoryStore::new();
        let assignment = BlindAssignment::generate(&pool(3)).assignment;

        save_assignment(&store, "run_1/color_mapping.json", &assignment, false)
            .await
            .unwrap();
        let again = save_assignment(&store, "run_1/color_mapping.json", &assignment, false).await;
        assert_matches!(again, Err(CoreError::Conflict(_)));

        let loaded = load_assignment(&store, "run_1/color_mapping.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, assignment);
    }

    #[tokio::test]
    async fn missing_assignment_loads_as_none() {
        let store = MemoryStore::new();
        assert!(load_assignment(&store, "run_1/color_mapping.json")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn label_parse() {
        assert_eq!(BlindLabel::parse("RED").unwrap(), BlindLabel::Red);
        assert!(BlindLabel::parse("blue").is_err());
        assert_eq!(BlindLabel::Red.other(), BlindLabel::Yellow);
    }
}
