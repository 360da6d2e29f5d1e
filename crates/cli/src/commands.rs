//! Subcommand handlers. Each returns `Ok(true)` on full success and
//! `Ok(false)` when a batch finished with failed jobs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use blindeval_cloud::S3Store;
use blindeval_core::analysis::{analyze, AnalysisOptions, AnalysisReport, TiePolicy};
use blindeval_core::batch::{
    batch_ids_from_keys, group_outputs, resolve_latest, source_items, BatchId, BatchLayout,
};
use blindeval_core::blinding::{load_assignment, save_assignment, BlindAssignment, BlindLabel};
use blindeval_core::judgment::{BinaryChoice, Comparison, Deductions, RubricCategory};
use blindeval_core::ledger::{to_csv, ScoreLedger};
use blindeval_core::output::load_payload;
use blindeval_core::sampling::{RaterIdSource, RaterSampler, RaterSession};
use blindeval_core::storage::{LocalStore, ObjectStore};
use blindeval_core::types::{ItemKey, ProducerId};
use blindeval_pipeline::dispatcher::TaskDispatcher;
use blindeval_pipeline::ffmpeg::check_ffmpeg;
use blindeval_pipeline::inference::{discover_items, run_inference, ProducerSpec};
use blindeval_pipeline::model_client::HttpModelClient;
use blindeval_pipeline::render::{run_render, FfmpegRenderer, RenderOptions};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{parse_prompt_setting, EvalConfig, StorageConfig};
use crate::report::{format_batch, format_summary, summary_json};

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Configuration plus the opened object store.
pub struct Context {
    config: EvalConfig,
    store: Arc<dyn ObjectStore>,
}

impl Context {
    pub async fn open(config: EvalConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match &config.storage {
            StorageConfig::Local { root } => {
                tokio::fs::create_dir_all(root)
                    .await
                    .with_context(|| format!("Failed to create storage root {}", root.display()))?;
                Arc::new(LocalStore::new(root.clone()))
            }
            StorageConfig::S3 {
                bucket,
                endpoint_url,
            } => Arc::new(S3Store::connect(bucket.clone(), endpoint_url.as_deref()).await),
        };
        tracing::info!(store = %store.describe(), "Object store ready");
        Ok(Self { config, store })
    }

    fn layout(&self, batch: BatchId) -> BatchLayout {
        BatchLayout::new(&self.config.inference_prefix, batch)
    }

    fn ledger(&self) -> ScoreLedger {
        ScoreLedger::new(Arc::clone(&self.store), self.config.scores_key.clone())
    }

    async fn batch_ids(&self) -> Result<Vec<BatchId>> {
        let keys = self
            .store
            .list(&self.config.inference_prefix)
            .await
            .context("Failed to list batches")?;
        Ok(batch_ids_from_keys(&self.config.inference_prefix, &keys))
    }

    /// The requested batch, or the most recent one.
    async fn resolve_batch(&self, requested: Option<&str>) -> Result<BatchLayout> {
        let batch = match requested {
            Some(id) => BatchId::parse(id)?,
            None => resolve_latest(self.batch_ids().await?).with_context(|| {
                format!(
                    "No batches found under {}",
                    self.store.object_uri(&self.config.inference_prefix)
                )
            })?,
        };
        tracing::info!(batch = %batch, "Using batch");
        Ok(self.layout(batch))
    }

    async fn require_assignment(&self, layout: &BatchLayout) -> Result<BlindAssignment> {
        load_assignment(self.store.as_ref(), &layout.assignment_key())
            .await?
            .with_context(|| {
                format!(
                    "Batch {} has no blind assignment yet; run `blindeval render` or `blindeval assign` first",
                    layout.batch()
                )
            })
    }
}

/// Cancel the token on Ctrl-C so running jobs stop before persisting.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling remaining jobs");
            child.cancel();
        }
    });
    token
}

// ---------------------------------------------------------------------------
// infer
// ---------------------------------------------------------------------------

pub struct InferArgs {
    pub batch: Option<String>,
    pub model1_prompt: Option<String>,
    pub model2_prompt: Option<String>,
    pub concurrency: Option<usize>,
}

pub async fn infer(ctx: &Context, args: InferArgs) -> Result<bool> {
    let batch = match args.batch.as_deref() {
        Some(id) => BatchId::parse(id)?,
        None => BatchId::from_timestamp(Utc::now()),
    };
    let layout = ctx.layout(batch);
    let items = discover_items(ctx.store.as_ref(), &ctx.config.source_video_prefix).await?;

    let overrides = [args.model1_prompt, args.model2_prompt];
    let mut producers = Vec::with_capacity(2);
    for (n, (model, prompt_override)) in ctx.config.models.iter().zip(overrides).enumerate() {
        let endpoint = model
            .endpoint
            .clone()
            .with_context(|| format!("MODEL{}_ENDPOINT must be set to run inference", n + 1))?;
        let prompt = match prompt_override {
            Some(value) => parse_prompt_setting(&value)?,
            None => model.prompt,
        };
        let client = Arc::new(HttpModelClient::new(endpoint, ctx.config.model_api_key.clone()));
        producers.push(ProducerSpec::new(model.name.clone(), prompt, client)?);
    }

    let dispatcher =
        TaskDispatcher::new(args.concurrency.unwrap_or(ctx.config.inference_concurrency));
    tracing::info!(
        batch = %layout.batch(),
        items = items.len(),
        concurrency = dispatcher.concurrency(),
        "Starting inference",
    );
    let report = run_inference(
        Arc::clone(&ctx.store),
        &layout,
        &items,
        &producers,
        &dispatcher,
        Some(cancel_on_ctrl_c()),
    )
    .await?;

    for (job_id, record) in report.successes() {
        if record.parse_failed {
            println!("  {job_id}: response did not parse, placeholder stored");
        }
    }
    print!("{}", format_batch("Inference", &report));
    println!("Outputs: {}", ctx.store.object_uri(&layout.outputs_prefix()));
    Ok(report.all_succeeded())
}

// ---------------------------------------------------------------------------
// assign
// ---------------------------------------------------------------------------

pub async fn assign(ctx: &Context, batch: Option<&str>, force: bool) -> Result<bool> {
    let layout = ctx.resolve_batch(batch).await?;
    let keys = ctx.store.list(&layout.outputs_prefix()).await?;
    let producers: BTreeMap<ItemKey, Vec<ProducerId>> = group_outputs(&keys)
        .into_iter()
        .map(|(item, outputs)| (item, outputs.into_keys().collect()))
        .collect();

    let outcome = BlindAssignment::generate(&producers);
    for warning in &outcome.warnings {
        println!("  warning: {warning}");
    }
    if outcome.assignment.is_empty() {
        bail!("Batch {} has no item with two producer outputs", layout.batch());
    }
    save_assignment(
        ctx.store.as_ref(),
        &layout.assignment_key(),
        &outcome.assignment,
        force,
    )
    .await?;
    println!(
        "Blind assignment for {} items saved to {}",
        outcome.assignment.len(),
        ctx.store.object_uri(&layout.assignment_key())
    );
    Ok(true)
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

pub async fn render(
    ctx: &Context,
    batch: Option<&str>,
    force_assignment: bool,
    concurrency: Option<usize>,
) -> Result<bool> {
    let version = check_ffmpeg()
        .await
        .context("ffmpeg is required for rendering (apt-get install ffmpeg)")?;
    tracing::info!(ffmpeg = %version, "ffmpeg found");

    let layout = ctx.resolve_batch(batch).await?;
    let prefix = &ctx.config.source_video_prefix;
    let sources = source_items(prefix, &ctx.store.list(prefix).await?);
    let options = RenderOptions {
        scratch_dir: ctx.config.scratch_dir.clone(),
        force_assignment,
    };
    let dispatcher = TaskDispatcher::new(concurrency.unwrap_or(ctx.config.render_concurrency));

    let outcome = run_render(
        Arc::clone(&ctx.store),
        &layout,
        &sources,
        Arc::new(FfmpegRenderer),
        &options,
        &dispatcher,
        Some(cancel_on_ctrl_c()),
    )
    .await?;

    for warning in &outcome.warnings {
        println!("  warning: {warning}");
    }
    for item in &outcome.missing_sources {
        println!("  warning: {item}: no source video, not rendered");
    }
    for item in &outcome.skipped_items {
        println!("  warning: {item}: outputs missing for an assigned label, not rendered");
    }
    for item in &outcome.unassigned_items {
        println!("  warning: {item}: not in the reused assignment, not rendered");
    }
    if outcome.reused_assignment {
        println!("Reused the existing blind assignment (pass --force-assignment to regenerate)");
    }
    print!("{}", format_batch("Render", &outcome.report));
    Ok(outcome.report.all_succeeded())
}

// ---------------------------------------------------------------------------
// session / rate
// ---------------------------------------------------------------------------

fn rater_source(rater: Option<String>) -> RaterIdSource {
    match rater {
        Some(id) => RaterIdSource::UserSupplied(id),
        None => RaterIdSource::SessionRandom,
    }
}

async fn open_session(
    ctx: &Context,
    batch: &BatchId,
    assignment: &BlindAssignment,
    rater_id: String,
) -> Result<RaterSession> {
    let pool: Vec<ItemKey> = assignment.items().map(|(item, _)| item.clone()).collect();
    let sampler = RaterSampler::new(ctx.config.sample_size);
    let judged = ctx.ledger().load().await?.judged_items(&rater_id, batch);
    Ok(RaterSession::resume(&sampler, rater_id, &pool, &judged))
}

pub async fn session(ctx: &Context, batch: Option<&str>, rater: Option<String>) -> Result<bool> {
    let layout = ctx.resolve_batch(batch).await?;
    let assignment = ctx.require_assignment(&layout).await?;
    let rater_id = rater_source(rater).resolve()?;
    let session = open_session(ctx, layout.batch(), &assignment, rater_id).await?;

    println!(
        "Rater {}: {}/{} items judged",
        session.rater_id(),
        session.progress(),
        session.items().len()
    );
    for (i, item) in session.items().iter().enumerate() {
        let status = if i < session.progress() { "done" } else { "pending" };
        println!("  {}. {item} [{status}]", i + 1);
    }

    let Some(item) = session.current() else {
        println!("All sampled items are judged. Thank you!");
        return Ok(true);
    };

    println!("\nNext item: {item}");
    println!("  video: {}", ctx.store.object_uri(&layout.video_key(item)));
    for label in BlindLabel::ALL {
        let Some(producer) = assignment.deblind(item, label) else {
            continue;
        };
        let key = layout.output_key(item, producer);
        println!("\n  [{}]", label.as_str().to_uppercase());
        match load_payload(ctx.store.as_ref(), &key).await {
            Ok(payload) => {
                for (n, step) in payload.step_texts().iter().enumerate() {
                    println!("    {}. {step}", n + 1);
                }
            }
            Err(e) => {
                tracing::warn!(item = %item, label = %label, error = %e, "Output unavailable");
                println!("    (output unavailable)");
            }
        }
    }
    println!(
        "\nRecord with: blindeval rate --batch {} --rater {} --item {item} --prefer red|yellow|tie",
        layout.batch(),
        session.rater_id()
    );
    Ok(true)
}

/// What the rater decided for one comparison.
pub enum RatingInput {
    Binary(String),
    Categorical { red: String, yellow: String },
}

pub struct RateArgs {
    pub batch: Option<String>,
    pub rater: String,
    pub item: Option<String>,
    pub rating: RatingInput,
    pub notes: String,
}

/// Parse instance counts such as `coverage=1,verb=2`. Empty or `none` is
/// a perfect score.
pub fn parse_deductions(value: &str) -> Result<Deductions> {
    let mut counts = RubricCategory::ALL.map(|c| (c, 0u32));
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(Deductions::default());
    }
    for part in value.split(',') {
        let (name, count) = part
            .split_once('=')
            .with_context(|| format!("Expected category=count, got '{part}'"))?;
        let name = name.trim().to_ascii_lowercase();
        let slot = counts
            .iter_mut()
            .find(|(c, _)| c.as_str() == name)
            .with_context(|| {
                format!("Unknown category '{name}' (coverage, order, verb, specificity, hallucination)")
            })?;
        slot.1 = count
            .trim()
            .parse()
            .with_context(|| format!("Count for {name} must be a non-negative integer"))?;
    }
    let deductions = Deductions::from_instances(counts);
    deductions.validate()?;
    Ok(deductions)
}

pub async fn rate(ctx: &Context, args: RateArgs) -> Result<bool> {
    let layout = ctx.resolve_batch(args.batch.as_deref()).await?;
    let assignment = ctx.require_assignment(&layout).await?;
    let rater_id = rater_source(Some(args.rater)).resolve()?;
    let session = open_session(ctx, layout.batch(), &assignment, rater_id.clone()).await?;

    let item = match args.item {
        Some(item) => {
            if !session.items().contains(&item) {
                tracing::warn!(item = %item, rater = %rater_id, "Item is not in this rater's sample");
            }
            item
        }
        None => session
            .current()
            .cloned()
            .context("All sampled items are already judged; pass --item to add another")?,
    };

    let comparison = Comparison::from_assignment(
        &assignment,
        layout.batch(),
        &item,
        rater_id,
        Utc::now(),
        args.notes,
    )?;
    let pair = match &args.rating {
        RatingInput::Binary(choice) => comparison.binary(BinaryChoice::parse(choice)?),
        RatingInput::Categorical { red, yellow } => {
            comparison.categorical(parse_deductions(red)?, parse_deductions(yellow)?)?
        }
    };
    ctx.ledger()
        .append_pair(&pair)
        .await
        .context("Failed to record judgment")?;

    let scores = pair
        .rows()
        .iter()
        .map(|row| format!("{} {}", row.label, row.verdict.score()))
        .collect::<Vec<_>>()
        .join(", ");
    println!("Recorded {item}: {scores}");
    Ok(true)
}

// ---------------------------------------------------------------------------
// summarize / export-scores / batches
// ---------------------------------------------------------------------------

pub struct SummarizeArgs {
    pub batch: Option<String>,
    pub json: bool,
    pub focus: Option<String>,
    pub ties: Option<String>,
}

pub async fn summarize(ctx: &Context, args: SummarizeArgs) -> Result<bool> {
    let layout = ctx.resolve_batch(args.batch.as_deref()).await?;
    let snapshot = ctx.ledger().load().await.context("Score ledger is unreachable")?;
    let assignment = load_assignment(ctx.store.as_ref(), &layout.assignment_key()).await?;
    if assignment.is_none() {
        tracing::warn!(batch = %layout.batch(), "No blind assignment, de-blinding from recorded producers");
    }

    let tie_policy = match args.ties.as_deref() {
        Some(value) => TiePolicy::parse(value)
            .with_context(|| format!("--ties must be 'count' or 'exclude', got '{value}'"))?,
        None => TiePolicy::default(),
    };
    let options = AnalysisOptions {
        batch: Some(layout.batch().clone()),
        focus_producer: args.focus,
        tie_policy,
    };
    let report = analyze(&snapshot.judgments, assignment.as_ref(), &options);

    if args.json {
        println!("{}", summary_json(&report, &snapshot.rejected)?);
        return Ok(true);
    }
    if !snapshot.rejected.is_empty() {
        println!("{} ledger line(s) could not be decoded:", snapshot.rejected.len());
        for rejected in &snapshot.rejected {
            println!("  line {}: {}", rejected.line, rejected.message);
        }
    }
    match report {
        AnalysisReport::NoData => println!("No judgments recorded yet."),
        AnalysisReport::Summary(summary) => print!("{}", format_summary(&summary)),
    }
    Ok(true)
}

pub async fn export_scores(ctx: &Context, output: Option<PathBuf>) -> Result<bool> {
    let snapshot = ctx.ledger().load().await.context("Score ledger is unreachable")?;
    let csv = to_csv(&snapshot.judgments);
    match output {
        Some(path) => {
            tokio::fs::write(&path, csv)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported {} rows to {}", snapshot.judgments.len(), path.display());
        }
        None => print!("{csv}"),
    }
    Ok(true)
}

pub async fn batches(ctx: &Context) -> Result<bool> {
    let ids = ctx.batch_ids().await?;
    if ids.is_empty() {
        println!(
            "No batches under {}",
            ctx.store.object_uri(&ctx.config.inference_prefix)
        );
        return Ok(true);
    }
    let latest = resolve_latest(ids.iter().cloned());
    for id in &ids {
        let marker = if Some(id) == latest.as_ref() { " (latest)" } else { "" };
        println!("{id}{marker}");
    }
    Ok(true)
}
