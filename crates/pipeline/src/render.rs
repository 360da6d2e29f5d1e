//! Render batch: blind assignment plus one comparison video per item.
//!
//! The assignment is generated and persisted first, so a render batch that
//! fails halfway still leaves a usable mapping for the videos it did
//! produce. A later run reuses that mapping unless forced, so re-rendered
//! items keep their colours. Each item is then one two-step dispatcher job:
//! render locally in the scratch directory, then upload the video (and
//! subtitle file).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use blindeval_core::batch::{group_outputs, BatchLayout};
use blindeval_core::blinding::{
    load_assignment, save_assignment, AssignmentWarning, BlindAssignment, BlindLabel,
};
use blindeval_core::error::CoreError;
use blindeval_core::output::{load_payload, CandidatePayload};
use blindeval_core::storage::{ObjectStore, PutMode, StorageError};
use blindeval_core::subtitles::build_ass;
use blindeval_core::types::{ItemKey, ProducerId};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{BatchReport, Job, TaskDispatcher};
use crate::ffmpeg::{self, FfmpegError, PanelText};

/// Worker limit for render batches.
pub const DEFAULT_RENDER_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("no candidate outputs found under '{0}'")]
    NoOutputs(String),

    #[error("output of '{producer}' for '{item}' is an error placeholder: {message}")]
    FailedOutput {
        item: ItemKey,
        producer: ProducerId,
        message: String,
    },

    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("scratch directory error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Renderer seam
// ---------------------------------------------------------------------------

/// The external media tool.
#[async_trait]
pub trait MediaRenderer: Send + Sync {
    async fn burn_subtitles(
        &self,
        video: &Path,
        subtitles: &Path,
        output: &Path,
    ) -> Result<(), FfmpegError>;

    async fn render_panel(
        &self,
        video: &Path,
        panels: &[PanelText; 2],
        output: &Path,
    ) -> Result<(), FfmpegError>;
}

/// Renders with the `ffmpeg` binary on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegRenderer;

#[async_trait]
impl MediaRenderer for FfmpegRenderer {
    async fn burn_subtitles(
        &self,
        video: &Path,
        subtitles: &Path,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        ffmpeg::burn_subtitles(video, subtitles, output).await
    }

    async fn render_panel(
        &self,
        video: &Path,
        panels: &[PanelText; 2],
        output: &Path,
    ) -> Result<(), FfmpegError> {
        ffmpeg::render_step_panel(video, panels, output).await
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// How one item's comparison video is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonKind {
    /// Both payloads are segment lists: two subtitle tracks.
    Subtitles,
    /// At least one payload is a step list: side-by-side panel.
    Panel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonPlan {
    Subtitles { ass: String, skipped_segments: usize },
    Panel([PanelText; 2]),
}

impl ComparisonPlan {
    pub fn kind(&self) -> ComparisonKind {
        match self {
            Self::Subtitles { .. } => ComparisonKind::Subtitles,
            Self::Panel(_) => ComparisonKind::Panel,
        }
    }
}

/// Decide how to draw an item from its two blinded payloads (in
/// [`BlindLabel::ALL`] order).
///
/// Error placeholders are refused: a comparison with one side missing
/// would reveal which producer failed.
pub fn plan_comparison(
    item: &str,
    sides: [(BlindLabel, &ProducerId, &CandidatePayload); 2],
) -> Result<ComparisonPlan, RenderError> {
    for (_, producer, payload) in &sides {
        if let Some(message) = payload.error() {
            return Err(RenderError::FailedOutput {
                item: item.to_string(),
                producer: (*producer).clone(),
                message: message.to_string(),
            });
        }
    }

    match (sides[0].2, sides[1].2) {
        (
            CandidatePayload::Segments { cut_segments: a, .. },
            CandidatePayload::Segments { cut_segments: b, .. },
        ) => {
            let (ass, skipped_segments) =
                build_ass(&[(sides[0].0, a.as_slice()), (sides[1].0, b.as_slice())]);
            Ok(ComparisonPlan::Subtitles {
                ass,
                skipped_segments,
            })
        }
        _ => Ok(ComparisonPlan::Panel(sides.map(|(label, _, payload)| PanelText {
            label,
            steps: payload.step_texts(),
        }))),
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Local working directory for downloads and ffmpeg output.
    pub scratch_dir: PathBuf,
    /// Generate a new assignment even if the batch already has one.
    pub force_assignment: bool,
}

/// Result of one successful render job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRecord {
    pub item: ItemKey,
    pub kind: ComparisonKind,
    pub video_key: String,
    pub subtitle_key: Option<String>,
    /// Segments left out of the subtitles because their times were invalid.
    pub skipped_segments: usize,
}

#[derive(Debug)]
pub struct RenderOutcome {
    pub assignment: BlindAssignment,
    /// The batch already had an assignment and it was kept.
    pub reused_assignment: bool,
    pub warnings: Vec<AssignmentWarning>,
    /// Assigned items without a source video; not rendered.
    pub missing_sources: Vec<ItemKey>,
    /// Assigned items whose outputs are absent or do not cover both
    /// labels; not rendered.
    pub skipped_items: Vec<ItemKey>,
    /// Items with outputs that a reused assignment does not cover; not
    /// rendered until the assignment is regenerated.
    pub unassigned_items: Vec<ItemKey>,
    pub report: BatchReport<RenderRecord>,
}

/// Everything one render job needs, owned.
#[derive(Debug, Clone)]
struct ItemRender {
    item: ItemKey,
    source_key: String,
    /// (label, producer, output key) in [`BlindLabel::ALL`] order.
    sides: [(BlindLabel, ProducerId, String); 2],
    work_dir: PathBuf,
    video_key: String,
    subtitle_key: String,
}

/// Rendered files waiting for upload.
#[derive(Debug)]
struct LocalRender {
    video: PathBuf,
    subtitles: Option<PathBuf>,
    kind: ComparisonKind,
    skipped_segments: usize,
}

/// Load or generate the blind assignment for a batch, then render one
/// comparison video per assigned item.
///
/// `sources` maps item keys to source video object keys. Fails as a whole
/// only when the batch has no outputs or the assignment cannot be saved.
pub async fn run_render(
    store: Arc<dyn ObjectStore>,
    layout: &BatchLayout,
    sources: &BTreeMap<ItemKey, String>,
    renderer: Arc<dyn MediaRenderer>,
    options: &RenderOptions,
    dispatcher: &TaskDispatcher,
    cancel: Option<CancellationToken>,
) -> Result<RenderOutcome, RenderError> {
    let prefix = layout.outputs_prefix();
    let keys = store.list(&prefix).await?;
    let grouped = group_outputs(&keys);
    if grouped.is_empty() {
        return Err(RenderError::NoOutputs(store.object_uri(&prefix)));
    }

    let assignment_key = layout.assignment_key();
    let existing = if options.force_assignment {
        None
    } else {
        load_assignment(store.as_ref(), &assignment_key).await?
    };
    let (assignment, warnings, reused) = match existing {
        Some(assignment) => {
            tracing::info!(
                items = assignment.len(),
                key = %assignment_key,
                "Reusing existing blind assignment",
            );
            (assignment, Vec::new(), true)
        }
        None => {
            let producers: BTreeMap<ItemKey, Vec<ProducerId>> = grouped
                .iter()
                .map(|(item, outputs)| (item.clone(), outputs.keys().cloned().collect()))
                .collect();
            let outcome = BlindAssignment::generate(&producers);
            for warning in &outcome.warnings {
                tracing::warn!(warning = %warning, "Blind assignment warning");
            }
            save_assignment(
                store.as_ref(),
                &assignment_key,
                &outcome.assignment,
                options.force_assignment,
            )
            .await?;
            tracing::info!(
                items = outcome.assignment.len(),
                key = %assignment_key,
                "Blind assignment saved",
            );
            (outcome.assignment, outcome.warnings, false)
        }
    };

    let unassigned_items: Vec<ItemKey> = grouped
        .keys()
        .filter(|item| !assignment.contains(item))
        .cloned()
        .collect();
    for item in &unassigned_items {
        tracing::warn!(
            item = %item,
            key = %assignment_key,
            "Item has outputs but no blind assignment, skipping render",
        );
    }

    let mut jobs = Vec::new();
    let mut missing_sources = Vec::new();
    let mut skipped_items = Vec::new();
    for (item, mapping) in assignment.items() {
        let Some(source_key) = sources.get(item) else {
            tracing::warn!(item = %item, "No source video for item, skipping render");
            missing_sources.push(item.clone());
            continue;
        };
        let Some(outputs) = grouped.get(item) else {
            tracing::warn!(item = %item, "Assigned item has no outputs in this batch, skipping render");
            skipped_items.push(item.clone());
            continue;
        };
        let side = |label: BlindLabel| -> Option<(BlindLabel, ProducerId, String)> {
            let (producer, _) = mapping.iter().find(|(_, l)| **l == label)?;
            let key = outputs.get(producer)?;
            Some((label, producer.clone(), key.clone()))
        };
        let (Some(red), Some(yellow)) = (side(BlindLabel::Red), side(BlindLabel::Yellow)) else {
            tracing::warn!(item = %item, "Outputs do not cover both labels, skipping render");
            skipped_items.push(item.clone());
            continue;
        };

        let task = ItemRender {
            item: item.clone(),
            source_key: source_key.clone(),
            sides: [red, yellow],
            work_dir: options
                .scratch_dir
                .join(layout.batch().as_str())
                .join(item),
            video_key: layout.video_key(item),
            subtitle_key: layout.subtitle_key(item),
        };
        jobs.push(render_job(
            Arc::clone(&store),
            Arc::clone(&renderer),
            task,
            cancel.clone(),
        ));
    }

    let report = dispatcher
        .run_with(jobs, |outcome| match &outcome.result {
            Ok(record) => tracing::info!(
                item = %record.item,
                video_key = %record.video_key,
                skipped_segments = record.skipped_segments,
                "Comparison video uploaded",
            ),
            Err(e) => tracing::warn!(job_id = %outcome.job_id, error = %e, "Render failed"),
        })
        .await;

    Ok(RenderOutcome {
        assignment,
        reused_assignment: reused,
        warnings,
        missing_sources,
        skipped_items,
        unassigned_items,
        report,
    })
}

fn render_job(
    store: Arc<dyn ObjectStore>,
    renderer: Arc<dyn MediaRenderer>,
    task: ItemRender,
    cancel: Option<CancellationToken>,
) -> Job<RenderRecord> {
    let job_id = task.item.clone();
    let compute = {
        let store = Arc::clone(&store);
        let task = task.clone();
        async move {
            let result = render_locally(store.as_ref(), renderer.as_ref(), &task).await;
            if result.is_err() {
                remove_work_dir(&task.work_dir).await;
            }
            result
        }
    };
    let persist = move |local: LocalRender| async move {
        let result = upload_render(store.as_ref(), &task, &local).await;
        remove_work_dir(&task.work_dir).await;
        result
    };
    Job::two_step(job_id, compute, persist, cancel)
}

async fn render_locally(
    store: &dyn ObjectStore,
    renderer: &dyn MediaRenderer,
    task: &ItemRender,
) -> Result<LocalRender, RenderError> {
    let [(red_label, red_producer, red_key), (yellow_label, yellow_producer, yellow_key)] =
        &task.sides;
    let red = load_payload(store, red_key).await?;
    let yellow = load_payload(store, yellow_key).await?;
    let plan = plan_comparison(
        &task.item,
        [
            (*red_label, red_producer, &red),
            (*yellow_label, yellow_producer, &yellow),
        ],
    )?;

    tokio::fs::create_dir_all(&task.work_dir).await?;
    let extension = task
        .source_key
        .rsplit_once('.')
        .map_or("mp4", |(_, ext)| ext);
    let source = task.work_dir.join(format!("source.{extension}"));
    store.download_to(&task.source_key, &source).await?;
    let video = task.work_dir.join(format!("{}_comparison.mp4", task.item));

    tracing::debug!(item = %task.item, kind = ?plan.kind(), "Rendering comparison");
    let kind = plan.kind();
    match plan {
        ComparisonPlan::Subtitles {
            ass,
            skipped_segments,
        } => {
            let subtitles = task.work_dir.join(format!("{}.ass", task.item));
            tokio::fs::write(&subtitles, ass).await?;
            renderer.burn_subtitles(&source, &subtitles, &video).await?;
            Ok(LocalRender {
                video,
                subtitles: Some(subtitles),
                kind,
                skipped_segments,
            })
        }
        ComparisonPlan::Panel(panels) => {
            renderer.render_panel(&source, &panels, &video).await?;
            Ok(LocalRender {
                video,
                subtitles: None,
                kind,
                skipped_segments: 0,
            })
        }
    }
}

async fn upload_render(
    store: &dyn ObjectStore,
    task: &ItemRender,
    local: &LocalRender,
) -> Result<RenderRecord, RenderError> {
    store
        .upload_from(&task.video_key, &local.video, PutMode::Overwrite)
        .await?;
    let subtitle_key = match &local.subtitles {
        Some(path) => {
            store
                .upload_from(&task.subtitle_key, path, PutMode::Overwrite)
                .await?;
            Some(task.subtitle_key.clone())
        }
        None => None,
    };
    Ok(RenderRecord {
        item: task.item.clone(),
        kind: local.kind,
        video_key: task.video_key.clone(),
        subtitle_key,
        skipped_segments: local.skipped_segments,
    })
}

async fn remove_work_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Failed to clean scratch directory");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use blindeval_core::output::{Segment, StepsTag};

    fn segments(description: &str) -> CandidatePayload {
        CandidatePayload::Segments {
            cut_segments: vec![Segment {
                start: "00:00".to_string(),
                end: "00:04".to_string(),
                label: "step".to_string(),
                description: description.to_string(),
            }],
            error: None,
            raw_response: None,
        }
    }

    fn steps(text: &str) -> CandidatePayload {
        CandidatePayload::Steps {
            format: StepsTag::NumberedList,
            steps: text.to_string(),
        }
    }

    // -- plan_comparison ------------------------------------------------------

    #[test]
    fn two_segment_payloads_become_subtitles() {
        let (a, b) = ("alpha".to_string(), "beta".to_string());
        let (pa, pb) = (segments("pick"), segments("place"));
        let plan = plan_comparison(
            "sample1",
            [(BlindLabel::Red, &b, &pb), (BlindLabel::Yellow, &a, &pa)],
        )
        .unwrap();
        assert_matches!(&plan, ComparisonPlan::Subtitles { ass, skipped_segments: 0 }
            if ass.contains(",Red,,0,0,0,,place") && ass.contains(",Yellow,,0,0,0,,pick"));
    }

    #[test]
    fn step_list_switches_to_panel() {
        let (a, b) = ("alpha".to_string(), "beta".to_string());
        let (pa, pb) = (steps("1. Pick\n2. Place"), segments("grab"));
        let plan = plan_comparison(
            "sample1",
            [(BlindLabel::Red, &a, &pa), (BlindLabel::Yellow, &b, &pb)],
        )
        .unwrap();
        assert_eq!(plan.kind(), ComparisonKind::Panel);
        let ComparisonPlan::Panel(panels) = plan else {
            unreachable!()
        };
        assert_eq!(panels[0].steps, vec!["Pick", "Place"]);
        assert_eq!(panels[1].label, BlindLabel::Yellow);
        assert_eq!(panels[1].steps, vec!["grab"]);
    }

    #[test]
    fn error_placeholder_refused() {
        let (a, b) = ("alpha".to_string(), "beta".to_string());
        let (pa, pb) = (CandidatePayload::failed("timeout"), segments("grab"));
        assert_matches!(
            plan_comparison(
                "sample1",
                [(BlindLabel::Red, &a, &pa), (BlindLabel::Yellow, &b, &pb)],
            ),
            Err(RenderError::FailedOutput { producer, .. }) if producer == "alpha"
        );
    }
}
