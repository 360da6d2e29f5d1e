//! Integration tests for the inference and render batches over an
//! in-memory store, with scripted model and renderer collaborators.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use async_trait::async_trait;
use blindeval_core::batch::{BatchId, BatchLayout};
use blindeval_core::blinding::{load_assignment, BlindLabel};
use blindeval_core::error::CoreError;
use blindeval_core::output::{load_payload, CandidatePayload, PayloadFormat, PARSE_FAILURE_MESSAGE};
use blindeval_core::storage::{MemoryStore, ObjectStore, PutMode};
use blindeval_pipeline::dispatcher::{BatchTally, JobError, TaskDispatcher};
use blindeval_pipeline::ffmpeg::{FfmpegError, PanelText};
use blindeval_pipeline::inference::{
    discover_items, run_inference, InferenceError, ProducerSpec, PromptStyle,
};
use blindeval_pipeline::model_client::{ModelClient, ModelError, ModelRequest};
use blindeval_pipeline::render::{
    run_render, ComparisonKind, MediaRenderer, RenderError, RenderOptions,
};

const SOURCE_PREFIX: &str = "videos";
const SEGMENTS: &str = "```json\n{\"cutSegments\":[\
{\"start\":\"00:00\",\"end\":\"00:05\",\"label\":\"pick\",\"description\":\"Pick up the part\"},\
{\"start\":\"00:05\",\"end\":\"00:09\",\"label\":\"place\",\"description\":\"Place it in the jig\"}]}\n```";

fn layout() -> BatchLayout {
    BatchLayout::new("inference_runs", BatchId::parse("run_20250115_103000").unwrap())
}

async fn store_with_sources(items: &[&str]) -> Arc<dyn ObjectStore> {
    let store = MemoryStore::new();
    for item in items {
        store
            .put(&format!("{SOURCE_PREFIX}/{item}.mp4"), b"video".to_vec(), PutMode::Overwrite)
            .await
            .unwrap();
    }
    store
        .put("videos/archive/old.mp4", b"video".to_vec(), PutMode::Overwrite)
        .await
        .unwrap();
    Arc::new(store)
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Replies per item; items without a reply fail with HTTP 500.
#[derive(Default)]
struct ScriptedModel {
    replies: HashMap<&'static str, &'static str>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    fn new(replies: &[(&'static str, &'static str)]) -> Self {
        Self {
            replies: replies.iter().copied().collect(),
            requests: Mutex::default(),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .iter()
            .find(|(item, _)| request.video_uri.ends_with(&format!("/{item}.mp4")))
            .map(|(_, reply)| reply.to_string())
            .ok_or_else(|| ModelError::ApiError {
                status: 500,
                body: "internal error".to_string(),
            })
    }
}

/// Writes a marker file instead of running ffmpeg.
#[derive(Default)]
struct RecordingRenderer {
    panels: Mutex<Vec<[PanelText; 2]>>,
}

#[async_trait]
impl MediaRenderer for RecordingRenderer {
    async fn burn_subtitles(
        &self,
        video: &Path,
        subtitles: &Path,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        assert!(video.exists());
        assert!(subtitles.exists());
        tokio::fs::write(output, b"burned").await?;
        Ok(())
    }

    async fn render_panel(
        &self,
        video: &Path,
        panels: &[PanelText; 2],
        output: &Path,
    ) -> Result<(), FfmpegError> {
        assert!(video.exists());
        self.panels.lock().unwrap().push(panels.clone());
        tokio::fs::write(output, b"panel").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test: inference batch
// ---------------------------------------------------------------------------

/// One unparseable response becomes a placeholder success; one failed call
/// is stored as `{"error"}` and is the only failure in the tally.
#[tokio::test]
async fn inference_isolates_parse_and_call_failures() {
    let store = store_with_sources(&["sample1", "sample2"]).await;
    let items = discover_items(store.as_ref(), SOURCE_PREFIX).await.unwrap();
    assert_eq!(items.len(), 2);

    let finetuned = Arc::new(ScriptedModel::new(&[
        ("sample1", SEGMENTS),
        ("sample2", "I could not find any steps."),
    ]));
    let baseline = Arc::new(ScriptedModel::new(&[("sample1", "1. Pick up the part\n2. Place it")]));
    let producers = vec![
        ProducerSpec::new("finetuned", None, finetuned.clone()).unwrap(),
        ProducerSpec::new("baseline", Some(PromptStyle::Numbered), baseline.clone()).unwrap(),
    ];

    let layout = layout();
    let report = run_inference(
        Arc::clone(&store),
        &layout,
        &items,
        &producers,
        &TaskDispatcher::new(4),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.tally(), BatchTally { succeeded: 3, failed: 1 });
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures[0].0, "sample2/baseline");
    assert_matches!(failures[0].1, JobError::Compute(msg) if msg.contains("500"));

    let records: BTreeMap<_, _> = report.successes().collect();
    assert_eq!(records["sample1/finetuned"].steps, 2);
    assert_eq!(records["sample1/baseline"].format, Some(PayloadFormat::NumberedList));
    assert_eq!(records["sample1/baseline"].steps, 2);
    assert!(records["sample2/finetuned"].parse_failed);

    let placeholder = load_payload(store.as_ref(), &layout.output_key("sample2", "finetuned"))
        .await
        .unwrap();
    assert_eq!(placeholder.error(), Some(PARSE_FAILURE_MESSAGE));
    let failed = load_payload(store.as_ref(), &layout.output_key("sample2", "baseline"))
        .await
        .unwrap();
    assert_matches!(failed, CandidatePayload::Failed { error } if error.contains("500"));

    let sent = finetuned.requests.lock().unwrap().clone();
    assert!(sent.iter().all(|r| r.prompt.is_none() && r.mime_type == "video/mp4"));
    assert!(sent.iter().any(|r| r.video_uri == "memory://videos/sample1.mp4"));
    let sent = baseline.requests.lock().unwrap().clone();
    assert!(sent
        .iter()
        .all(|r| r.prompt.as_deref() == Some(PromptStyle::Numbered.text())));
}

#[tokio::test]
async fn inference_without_sources_is_fatal() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    assert_matches!(
        discover_items(store.as_ref(), SOURCE_PREFIX).await,
        Err(InferenceError::NoItems(_))
    );
}

#[tokio::test]
async fn duplicate_producer_names_rejected() {
    let store = store_with_sources(&["sample1"]).await;
    let model = Arc::new(ScriptedModel::default());
    let producers = vec![
        ProducerSpec::new("finetuned", None, model.clone()).unwrap(),
        ProducerSpec::new("finetuned", None, model).unwrap(),
    ];
    let items = discover_items(store.as_ref(), SOURCE_PREFIX).await.unwrap();
    let result = run_inference(
        store,
        &layout(),
        &items,
        &producers,
        &TaskDispatcher::new(1),
        None,
    )
    .await;
    assert_matches!(result, Err(InferenceError::DuplicateProducer(name)) if name == "finetuned");
}

// ---------------------------------------------------------------------------
// Test: render batch
// ---------------------------------------------------------------------------

async fn put_payload(store: &dyn ObjectStore, key: &str, payload: CandidatePayload) {
    store
        .put(key, payload.to_json_bytes().unwrap(), PutMode::Overwrite)
        .await
        .unwrap();
}

/// Renders subtitles for segment pairs and a panel for step lists, uploads
/// both, saves the assignment once, and leaves no scratch files behind.
#[tokio::test]
async fn render_uploads_videos_and_assignment() {
    let store = store_with_sources(&["sample1", "sample2"]).await;
    let layout = layout();
    let segments = blindeval_core::output::parse_response(SEGMENTS, PayloadFormat::Segments);
    let steps = blindeval_core::output::parse_response("1. Pick\n2. Place", PayloadFormat::NumberedList);
    for (item, producer, payload) in [
        ("sample1", "finetuned", segments.clone()),
        ("sample1", "baseline", segments.clone()),
        ("sample2", "finetuned", segments),
        ("sample2", "baseline", steps),
        ("sample3", "finetuned", CandidatePayload::failed("timeout")),
        ("sample3", "baseline", CandidatePayload::failed("timeout")),
    ] {
        put_payload(store.as_ref(), &layout.output_key(item, producer), payload).await;
    }

    let sources = blindeval_core::batch::source_items(
        SOURCE_PREFIX,
        &store.list(SOURCE_PREFIX).await.unwrap(),
    );
    let scratch = tempfile::tempdir().unwrap();
    let options = RenderOptions {
        scratch_dir: scratch.path().to_path_buf(),
        force_assignment: false,
    };
    let renderer = Arc::new(RecordingRenderer::default());

    let outcome = run_render(
        Arc::clone(&store),
        &layout,
        &sources,
        renderer.clone(),
        &options,
        &TaskDispatcher::new(4),
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.assignment.len(), 3);
    assert_eq!(outcome.missing_sources, vec!["sample3".to_string()]);
    assert!(outcome.skipped_items.is_empty());
    assert!(outcome.unassigned_items.is_empty());
    assert_eq!(outcome.report.tally(), BatchTally { succeeded: 2, failed: 0 });

    let saved = load_assignment(store.as_ref(), &layout.assignment_key())
        .await
        .unwrap();
    assert_eq!(saved.as_ref(), Some(&outcome.assignment));

    let records: BTreeMap<_, _> = outcome.report.successes().collect();
    assert_eq!(records["sample1"].kind, ComparisonKind::Subtitles);
    assert_eq!(records["sample2"].kind, ComparisonKind::Panel);
    assert_eq!(records["sample2"].subtitle_key, None);

    let video = store.get(&layout.video_key("sample1")).await.unwrap().unwrap();
    assert_eq!(video.body, b"burned");
    let ass = store.get(&layout.subtitle_key("sample1")).await.unwrap().unwrap();
    let ass = String::from_utf8(ass.body).unwrap();
    assert!(ass.contains("Pick up the part"));
    assert!(!ass.contains("finetuned") && !ass.contains("baseline"));

    let panels = renderer.panels.lock().unwrap().clone();
    assert_eq!(panels.len(), 1);
    let labels: Vec<_> = panels[0].iter().map(|p| p.label).collect();
    assert_eq!(labels, BlindLabel::ALL);

    let batch_scratch = scratch.path().join(layout.batch().as_str());
    let mut leftovers = tokio::fs::read_dir(&batch_scratch).await.unwrap();
    assert!(leftovers.next_entry().await.unwrap().is_none());

    assert!(!outcome.reused_assignment);
    let rerun = run_render(
        Arc::clone(&store),
        &layout,
        &sources,
        renderer,
        &options,
        &TaskDispatcher::new(4),
        None,
    )
    .await
    .unwrap();
    assert!(rerun.reused_assignment);
    assert_eq!(rerun.assignment, outcome.assignment);
}

/// Saving over an existing assignment conflicts; only a forced render
/// generates a new one.
#[tokio::test]
async fn only_forced_render_replaces_assignment() {
    let store = store_with_sources(&["sample1"]).await;
    let layout = layout();
    let payload = blindeval_core::output::parse_response(SEGMENTS, PayloadFormat::Segments);
    for producer in ["finetuned", "baseline"] {
        put_payload(store.as_ref(), &layout.output_key("sample1", producer), payload.clone()).await;
    }
    let scratch = tempfile::tempdir().unwrap();

    let first = blindeval_core::blinding::BlindAssignment::generate(&BTreeMap::from([(
        "sample1".to_string(),
        vec!["baseline".to_string(), "finetuned".to_string()],
    )]))
    .assignment;
    blindeval_core::blinding::save_assignment(store.as_ref(), &layout.assignment_key(), &first, false)
        .await
        .unwrap();
    let second = blindeval_core::blinding::save_assignment(
        store.as_ref(),
        &layout.assignment_key(),
        &first,
        false,
    )
    .await;
    assert_matches!(second, Err(CoreError::Conflict(_)));

    let forced = run_render(
        Arc::clone(&store),
        &layout,
        &BTreeMap::new(),
        Arc::new(RecordingRenderer::default()),
        &RenderOptions {
            scratch_dir: scratch.path().to_path_buf(),
            force_assignment: true,
        },
        &TaskDispatcher::new(4),
        None,
    )
    .await
    .unwrap();
    assert!(!forced.reused_assignment);
    assert_eq!(forced.missing_sources, vec!["sample1".to_string()]);
}

/// A reused assignment can drift from the batch outputs: assigned items
/// without outputs and output items without an assignment are both
/// reported instead of dropped.
#[tokio::test]
async fn reused_assignment_drift_is_reported() {
    let store = store_with_sources(&["sample1", "sample2", "sample9"]).await;
    let layout = layout();
    let payload = blindeval_core::output::parse_response(SEGMENTS, PayloadFormat::Segments);
    for item in ["sample1", "sample2"] {
        for producer in ["finetuned", "baseline"] {
            put_payload(store.as_ref(), &layout.output_key(item, producer), payload.clone()).await;
        }
    }
    let stale: blindeval_core::blinding::BlindAssignment = serde_json::from_str(
        r#"{
            "sample1": {"baseline": "red", "finetuned": "yellow"},
            "sample9": {"baseline": "yellow", "finetuned": "red"}
        }"#,
    )
    .unwrap();
    blindeval_core::blinding::save_assignment(store.as_ref(), &layout.assignment_key(), &stale, false)
        .await
        .unwrap();

    let sources = blindeval_core::batch::source_items(
        SOURCE_PREFIX,
        &store.list(SOURCE_PREFIX).await.unwrap(),
    );
    let scratch = tempfile::tempdir().unwrap();
    let outcome = run_render(
        Arc::clone(&store),
        &layout,
        &sources,
        Arc::new(RecordingRenderer::default()),
        &RenderOptions {
            scratch_dir: scratch.path().to_path_buf(),
            force_assignment: false,
        },
        &TaskDispatcher::new(4),
        None,
    )
    .await
    .unwrap();

    assert!(outcome.reused_assignment);
    assert_eq!(outcome.skipped_items, vec!["sample9".to_string()]);
    assert_eq!(outcome.unassigned_items, vec!["sample2".to_string()]);
    assert!(outcome.missing_sources.is_empty());
    assert_eq!(outcome.report.tally(), BatchTally { succeeded: 1, failed: 0 });
    assert!(store.get(&layout.video_key("sample2")).await.unwrap().is_none());
}

#[tokio::test]
async fn render_without_outputs_is_fatal() {
    let store = store_with_sources(&["sample1"]).await;
    let scratch = tempfile::tempdir().unwrap();
    let result = run_render(
        store,
        &layout(),
        &BTreeMap::new(),
        Arc::new(RecordingRenderer::default()),
        &RenderOptions {
            scratch_dir: scratch.path().to_path_buf(),
            force_assignment: false,
        },
        &TaskDispatcher::new(4),
        None,
    )
    .await;
    assert_matches!(result, Err(RenderError::NoOutputs(_)));
}
