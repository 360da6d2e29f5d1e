//! Inference batch: every source item through every producer.
//!
//! Each (item, producer) pair is one dispatcher job that calls the model
//! and persists the parsed payload to `{batch}/json/{item}_{producer}.json`.
//! A response that does not parse is stored as an error-tagged placeholder
//! and counts as a success; a failed model call stores `{"error": ...}`
//! and counts as a failure.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use blindeval_core::batch::{source_items, validate_producer_name, BatchLayout};
use blindeval_core::error::CoreError;
use blindeval_core::output::{parse_response, CandidatePayload, PayloadFormat};
use blindeval_core::storage::{ObjectStore, PutMode, StorageError};
use blindeval_core::types::{ItemKey, ProducerId};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{BatchReport, Job, JobError, TaskDispatcher};
use crate::model_client::{ModelClient, ModelRequest};

/// Worker limit for inference batches.
pub const DEFAULT_INFERENCE_CONCURRENCY: usize = 20;

const DEFAULT_PROMPT: &str = r#"You are watching an egocentric video of a factory operator performing a task. Identify every step of the task in order. Do not miss any step the operator performs, and do not invent steps that are not shown.

Track the state of the object being manipulated after each step and check that the sequence of steps is consistent with it.

Example:
{
  "cutSegments": [
    {"start": "00:00", "end": "00:05", "label": "pick_item", "description": "The operator picks up an item from the tray"},
    {"start": "00:05", "end": "00:10", "label": "align_item", "description": "The operator aligns the item against the fixture"},
    {"start": "00:10", "end": "00:15", "label": "secure_item", "description": "The operator presses the item down to secure it"}
  ]
}

Return only a valid JSON object with exactly this structure, without markdown or any other text."#;

const GRANULAR_PROMPT: &str = r#"Identify the task steps performed in this egocentric factory video and return them as JSON:

{cutSegments:[{start,end,label,description}]}

- Timestamps use the format MM:SS.ss (minutes, seconds, hundredths).
- Always write two decimal places for seconds, e.g. 01:44.44.
- The output must be strictly valid JSON matching the schema above.
- Do not write anything outside the JSON."#;

const NUMBERED_PROMPT: &str = r#"You are watching an egocentric video recorded by a factory worker performing a task. Write the sequence of steps as clear instructions for doing this job, as an ordered numbered list with one concise action per line.

Phrase each step as an instruction ("Pick up the screw from the bin"), not as a description ("The worker picks up a screw").

Only describe what the wearer does with their hands, tools and materials. Ignore people in the background and camera movement. Do not include timestamps or JSON.

Only include steps that are visible in the video."#;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Whole-batch inference failures. Per-job failures are in the report.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("no source videos found under '{0}'")]
    NoItems(String),

    #[error("no producers configured")]
    NoProducers,

    #[error("producer '{0}' is configured more than once")]
    DuplicateProducer(ProducerId),

    #[error("unknown prompt style '{0}' (expected default, granular or numbered)")]
    UnknownPromptStyle(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// Which instruction text a producer is sent with the video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptStyle {
    /// Segments with `MM:SS` timestamps.
    Default,
    /// Segments with `MM:SS.ss` timestamps.
    Granular,
    /// Free-form numbered instruction list.
    Numbered,
}

impl PromptStyle {
    pub const ALL: [PromptStyle; 3] = [Self::Default, Self::Granular, Self::Numbered];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Granular => "granular",
            Self::Numbered => "numbered",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InferenceError> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|style| style.as_str() == value)
            .ok_or(InferenceError::UnknownPromptStyle(value))
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::Default => DEFAULT_PROMPT,
            Self::Granular => GRANULAR_PROMPT,
            Self::Numbered => NUMBERED_PROMPT,
        }
    }

    pub fn expected_format(self) -> PayloadFormat {
        match self {
            Self::Default | Self::Granular => PayloadFormat::Segments,
            Self::Numbered => PayloadFormat::NumberedList,
        }
    }
}

impl fmt::Display for PromptStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

/// One model under evaluation.
#[derive(Clone)]
pub struct ProducerSpec {
    name: ProducerId,
    prompt: Option<PromptStyle>,
    client: Arc<dyn ModelClient>,
}

impl ProducerSpec {
    /// `prompt: None` sends the video alone and expects a segment document.
    pub fn new(
        name: impl Into<ProducerId>,
        prompt: Option<PromptStyle>,
        client: Arc<dyn ModelClient>,
    ) -> Result<Self, InferenceError> {
        let name = name.into();
        validate_producer_name(&name)?;
        Ok(Self {
            name,
            prompt,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(&self) -> Option<PromptStyle> {
        self.prompt
    }

    pub fn expected_format(&self) -> PayloadFormat {
        self.prompt
            .map_or(PayloadFormat::Segments, PromptStyle::expected_format)
    }
}

impl fmt::Debug for ProducerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSpec")
            .field("name", &self.name)
            .field("prompt", &self.prompt)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Result of one successful inference job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRecord {
    pub item: ItemKey,
    pub producer: ProducerId,
    pub format: Option<PayloadFormat>,
    /// Segments, or numbered lines of a step list.
    pub steps: usize,
    /// The response did not parse and a placeholder was stored.
    pub parse_failed: bool,
}

/// List the source videos directly under `source_prefix`.
///
/// Fails when there are none: an inference batch without items is an
/// operator error, not an empty success.
pub async fn discover_items(
    store: &dyn ObjectStore,
    source_prefix: &str,
) -> Result<BTreeMap<ItemKey, String>, InferenceError> {
    let keys = store.list(source_prefix).await?;
    let items = source_items(source_prefix, &keys);
    if items.is_empty() {
        return Err(InferenceError::NoItems(store.object_uri(source_prefix)));
    }
    tracing::info!(count = items.len(), prefix = %source_prefix, "Discovered source videos");
    Ok(items)
}

/// Run every item through every producer and persist the outputs.
///
/// `items` maps item keys to their source video object keys. Returns once
/// every job is terminal; per-job failures are in the report.
pub async fn run_inference(
    store: Arc<dyn ObjectStore>,
    layout: &BatchLayout,
    items: &BTreeMap<ItemKey, String>,
    producers: &[ProducerSpec],
    dispatcher: &TaskDispatcher,
    cancel: Option<CancellationToken>,
) -> Result<BatchReport<InferenceRecord>, InferenceError> {
    if producers.is_empty() {
        return Err(InferenceError::NoProducers);
    }
    let mut seen = BTreeSet::new();
    for producer in producers {
        if !seen.insert(producer.name()) {
            return Err(InferenceError::DuplicateProducer(producer.name.clone()));
        }
    }

    for producer in producers {
        tracing::info!(
            producer = %producer.name,
            prompt = producer.prompt.map_or("none", PromptStyle::as_str),
            "Producer configured",
        );
    }

    let mut jobs = Vec::with_capacity(items.len() * producers.len());
    for (item, source_key) in items {
        for producer in producers {
            jobs.push(inference_job(
                Arc::clone(&store),
                layout,
                item,
                source_key,
                producer,
                cancel.clone(),
            ));
        }
    }

    let report = dispatcher
        .run_with(jobs, |outcome| match &outcome.result {
            Ok(record) => tracing::info!(
                item = %record.item,
                producer = %record.producer,
                steps = record.steps,
                parse_failed = record.parse_failed,
                "Inference stored",
            ),
            Err(e) => tracing::warn!(job_id = %outcome.job_id, error = %e, "Inference failed"),
        })
        .await;
    Ok(report)
}

fn inference_job(
    store: Arc<dyn ObjectStore>,
    layout: &BatchLayout,
    item: &str,
    source_key: &str,
    producer: &ProducerSpec,
    cancel: Option<CancellationToken>,
) -> Job<InferenceRecord> {
    let job_id = format!("{item}/{}", producer.name);
    let output_key = layout.output_key(item, &producer.name);
    let request = ModelRequest::new(
        store.object_uri(source_key),
        producer.prompt.map(|p| p.text().to_string()),
    );
    let expected = producer.expected_format();
    let client = Arc::clone(&producer.client);
    let item = item.to_string();
    let producer = producer.name.clone();

    Job::new(job_id, async move {
        let is_cancelled = || cancel.as_ref().is_some_and(|c| c.is_cancelled());
        if is_cancelled() {
            return Err(JobError::Cancelled);
        }

        tracing::debug!(item = %item, producer = %producer, uri = %request.video_uri, "Calling model");
        let (payload, call_error) = match client.generate(&request).await {
            Ok(text) => (parse_response(&text, expected), None),
            Err(e) => (CandidatePayload::failed(e.to_string()), Some(e.to_string())),
        };

        if is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let body = payload
            .to_json_bytes()
            .map_err(|e| JobError::Persist(e.to_string()))?;
        store
            .put(&output_key, body, PutMode::Overwrite)
            .await
            .map_err(|e| JobError::Persist(e.to_string()))?;

        if let Some(message) = call_error {
            return Err(JobError::Compute(message));
        }
        Ok(InferenceRecord {
            item,
            producer,
            format: payload.format(),
            steps: payload.step_count(),
            parse_failed: payload.is_error(),
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use crate::model_client::ModelError;

    struct Silent;

    #[async_trait]
    impl ModelClient for Silent {
        async fn generate(&self, _request: &ModelRequest) -> Result<String, ModelError> {
            Err(ModelError::EmptyResponse)
        }
    }

    // -- PromptStyle ----------------------------------------------------------

    #[test]
    fn prompt_style_parse_is_case_insensitive() {
        assert_eq!(PromptStyle::parse("Granular").unwrap(), PromptStyle::Granular);
        assert_matches!(
            PromptStyle::parse("verbose"),
            Err(InferenceError::UnknownPromptStyle(s)) if s == "verbose"
        );
    }

    #[test]
    fn numbered_prompt_expects_step_list() {
        assert_eq!(PromptStyle::Numbered.expected_format(), PayloadFormat::NumberedList);
        assert_eq!(PromptStyle::Granular.expected_format(), PayloadFormat::Segments);
        assert!(PromptStyle::Granular.text().contains("MM:SS.ss"));
    }

    // -- ProducerSpec ---------------------------------------------------------

    #[test]
    fn producer_without_prompt_expects_segments() {
        let spec = ProducerSpec::new("finetuned", None, Arc::new(Silent)).unwrap();
        assert_eq!(spec.expected_format(), PayloadFormat::Segments);
    }

    #[test]
    fn producer_name_with_underscore_rejected() {
        assert_matches!(
            ProducerSpec::new("gemini_pro", None, Arc::new(Silent)),
            Err(InferenceError::Core(CoreError::Validation(_)))
        );
    }
}
