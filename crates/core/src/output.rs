//! Candidate outputs: one producer's description of one item.
//!
//! A payload is either a list of time-bounded segments or free-form
//! numbered steps. Model responses that do not parse degrade to an
//! error-tagged placeholder instead of failing the batch.
//!
//! The persisted JSON shapes are:
//!
//! ```text
//! {"cutSegments": [{"start", "end", "label", "description"}, ...]}
//! {"cutSegments": [], "error": "...", "raw_response": "..."}
//! {"format": "numbered_list", "steps": "1. ...\n2. ..."}
//! {"error": "..."}
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::storage::ObjectStore;
use crate::types::{ItemKey, ProducerId};

/// Error message stored when a structured response cannot be parsed.
pub const PARSE_FAILURE_MESSAGE: &str = "Failed to parse JSON";

/// `MM:SS`, `MM:SS.ss` or `H:MM:SS(.ss)`.
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d+):)?(\d{1,3}):(\d{1,2}(?:\.\d+)?)$").expect("valid regex")
});

/// Step numbers such as `1.` or `12)` at the start of the text or after
/// whitespace.
static STEP_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(\d+)[.)]\s+").expect("valid regex"));

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The two payload shapes a producer can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Segments,
    NumberedList,
}

/// Tag value written alongside numbered-list payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepsTag {
    #[serde(rename = "numbered_list")]
    NumberedList,
}

/// One time-bounded step of a segment payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
}

impl Segment {
    pub fn start_secs(&self) -> Option<f64> {
        parse_timestamp(&self.start)
    }

    pub fn end_secs(&self) -> Option<f64> {
        parse_timestamp(&self.end)
    }
}

/// Persisted payload of a candidate output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidatePayload {
    Steps {
        format: StepsTag,
        steps: String,
    },
    Segments {
        #[serde(rename = "cutSegments")]
        cut_segments: Vec<Segment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_response: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl CandidatePayload {
    /// Placeholder written when the model call itself failed.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            error: message.into(),
        }
    }

    /// Format tag, or `None` for a failed call.
    pub fn format(&self) -> Option<PayloadFormat> {
        match self {
            Self::Steps { .. } => Some(PayloadFormat::NumberedList),
            Self::Segments { .. } => Some(PayloadFormat::Segments),
            Self::Failed { .. } => None,
        }
    }

    /// Error message for failed calls and parse placeholders.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Steps { .. } => None,
            Self::Segments { error, .. } => error.as_deref(),
            Self::Failed { error } => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// Number of steps: segments, or numbered lines of a step list.
    pub fn step_count(&self) -> usize {
        match self {
            Self::Steps { steps, .. } => steps
                .lines()
                .map(str::trim)
                .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
                .count(),
            Self::Segments { cut_segments, .. } => cut_segments.len(),
            Self::Failed { .. } => 0,
        }
    }

    /// Ordered step texts for display, regardless of payload shape.
    pub fn step_texts(&self) -> Vec<String> {
        match self {
            Self::Steps { steps, .. } => split_steps(steps),
            Self::Segments { cut_segments, .. } => cut_segments
                .iter()
                .map(|s| s.description.clone())
                .collect(),
            Self::Failed { .. } => Vec::new(),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec_pretty(self).map_err(|e| CoreError::Internal(e.to_string()))
    }

    pub fn from_json_bytes(key: &str, bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Malformed {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

/// One producer's output for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateOutput {
    pub item: ItemKey,
    pub producer: ProducerId,
    pub payload: CandidatePayload,
}

#[derive(Deserialize)]
struct SegmentDocument {
    #[serde(rename = "cutSegments")]
    cut_segments: Vec<Segment>,
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Remove markdown code-fence lines (```` ``` ```` / ```` ```json ````)
/// wrapping a response.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Turn a raw model response into a payload of the expected shape.
///
/// Never fails: an unparseable structured response becomes an empty
/// segment list tagged with [`PARSE_FAILURE_MESSAGE`] and the raw text.
pub fn parse_response(raw: &str, expected: PayloadFormat) -> CandidatePayload {
    match expected {
        PayloadFormat::NumberedList => CandidatePayload::Steps {
            format: StepsTag::NumberedList,
            steps: raw.trim().to_string(),
        },
        PayloadFormat::Segments => {
            let cleaned = strip_code_fences(raw);
            match serde_json::from_str::<SegmentDocument>(&cleaned) {
                Ok(doc) => CandidatePayload::Segments {
                    cut_segments: doc.cut_segments,
                    error: None,
                    raw_response: None,
                },
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        preview = %cleaned.chars().take(200).collect::<String>(),
                        "Model response is not a valid segment document",
                    );
                    CandidatePayload::Segments {
                        cut_segments: Vec::new(),
                        error: Some(PARSE_FAILURE_MESSAGE.to_string()),
                        raw_response: Some(cleaned),
                    }
                }
            }
        }
    }
}

/// Split numbered instruction text into its steps (numbers removed).
///
/// Handles both one-step-per-line and run-together text such as
/// `"1. Pick up the screw 2. Insert it"`. Text without any numbering is
/// returned as one step per non-empty line.
pub fn split_steps(text: &str) -> Vec<String> {
    let starts: Vec<(usize, usize)> = STEP_NUMBER_RE
        .captures_iter(text)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let number = c.get(1)?;
            Some((number.start(), whole.end()))
        })
        .collect();

    if starts.is_empty() {
        return text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &(_, body_start))| {
            let body_end = starts.get(i + 1).map_or(text.len(), |&(next, _)| next);
            text[body_start..body_end].trim().to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `MM:SS`, `MM:SS.ss` or `H:MM:SS(.ss)` into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let caps = TIMESTAMP_RE.captures(value.trim())?;
    let hours: f64 = match caps.get(1) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0.0,
    };
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a persisted payload. A missing object is a `NotFound` error.
pub async fn load_payload(store: &dyn ObjectStore, key: &str) -> Result<CandidatePayload, CoreError> {
    let object = store.get(key).await?.ok_or_else(|| CoreError::NotFound {
        entity: "candidate output",
        key: key.to_string(),
    })?;
    CandidatePayload::from_json_bytes(key, &object.body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SEGMENTS_JSON: &str = r#"{"cutSegments":[
        {"start":"00:00","end":"00:05","label":"pick_item","description":"Pick up an item"},
        {"start":"00:05","end":"00:10.50","label":"align_item","description":"Align the item"}
    ]}"#;

    // -- strip_code_fences ----------------------------------------------------

    #[test]
    fn fences_removed() {
        let wrapped = format!("```json\n{SEGMENTS_JSON}\n```");
        assert_eq!(strip_code_fences(&wrapped), SEGMENTS_JSON.trim());
    }

    #[test]
    fn unfenced_text_only_trimmed() {
        assert_eq!(strip_code_fences("  {\"a\":1}\n"), "{\"a\":1}");
    }

    // -- parse_response -------------------------------------------------------

    #[test]
    fn parses_fenced_segments() {
        let payload = parse_response(&format!("```\n{SEGMENTS_JSON}\n```"), PayloadFormat::Segments);
        assert_eq!(payload.format(), Some(PayloadFormat::Segments));
        assert_eq!(payload.step_count(), 2);
        assert!(!payload.is_error());
    }

    #[test]
    fn unparseable_segments_degrade_to_placeholder() {
        let payload = parse_response("Sure! Here are the steps...", PayloadFormat::Segments);
        assert_matches!(
            &payload,
            CandidatePayload::Segments { cut_segments, error: Some(e), raw_response: Some(raw) }
                if cut_segments.is_empty() && e == PARSE_FAILURE_MESSAGE && raw.starts_with("Sure!")
        );
        assert_eq!(payload.step_count(), 0);
    }

    #[test]
    fn numbered_list_kept_verbatim() {
        let payload = parse_response("1. Pick up the screw\n2. Insert it\n", PayloadFormat::NumberedList);
        assert_eq!(payload.format(), Some(PayloadFormat::NumberedList));
        assert_eq!(payload.step_count(), 2);
    }

    // -- serialization --------------------------------------------------------

    #[test]
    fn persisted_shapes_round_trip() {
        let steps = parse_response("1. A\n2. B", PayloadFormat::NumberedList);
        let json: serde_json::Value = serde_json::from_slice(&steps.to_json_bytes().unwrap()).unwrap();
        assert_eq!(json["format"], "numbered_list");

        let parsed = CandidatePayload::from_json_bytes("k", br#"{"error":"quota exceeded"}"#).unwrap();
        assert_eq!(parsed, CandidatePayload::failed("quota exceeded"));
        assert_eq!(parsed.format(), None);

        let placeholder = CandidatePayload::from_json_bytes(
            "k",
            br#"{"cutSegments":[],"error":"Failed to parse JSON","raw_response":"x"}"#,
        )
        .unwrap();
        assert_eq!(placeholder.format(), Some(PayloadFormat::Segments));
        assert!(placeholder.is_error());
    }

    #[test]
    fn malformed_document_is_reported_with_key() {
        let err = CandidatePayload::from_json_bytes("run_1/json/a_m.json", b"[1,2]").unwrap_err();
        assert_matches!(err, CoreError::Malformed { key, .. } if key == "run_1/json/a_m.json");
    }

    // -- split_steps ----------------------------------------------------------

    #[test]
    fn split_steps_multiline() {
        assert_eq!(
            split_steps("1. Pick up the screw\n2. Insert the screw\n3. Tighten"),
            vec!["Pick up the screw", "Insert the screw", "Tighten"]
        );
    }

    #[test]
    fn split_steps_run_together() {
        assert_eq!(
            split_steps("1. Pick up the 2.5mm screw 2. Insert it"),
            vec!["Pick up the 2.5mm screw", "Insert it"]
        );
    }

    #[test]
    fn split_steps_unnumbered_lines() {
        assert_eq!(split_steps("Pick\n\nPlace\n"), vec!["Pick", "Place"]);
    }

    // -- parse_timestamp ------------------------------------------------------

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("00:05"), Some(5.0));
        assert!((parse_timestamp("01:44.44").unwrap() - 104.44).abs() < 1e-9);
        assert_eq!(parse_timestamp("1:02:03"), Some(3723.0));
        assert_eq!(parse_timestamp("abc"), None);
    }
}
