use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use blindeval_core::sampling::DEFAULT_SAMPLE_SIZE;
use blindeval_pipeline::inference::{PromptStyle, DEFAULT_INFERENCE_CONCURRENCY};
use blindeval_pipeline::render::DEFAULT_RENDER_CONCURRENCY;

/// Where batches, outputs and the ledger are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local { root: PathBuf },
    S3 { bucket: String, endpoint_url: Option<String> },
}

/// One model under evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub name: String,
    pub endpoint: Option<String>,
    /// `None` sends the video without a prompt.
    pub prompt: Option<PromptStyle>,
}

/// Evaluation configuration loaded from environment variables.
///
/// Defaults suit a local run against `./data`. Command-line flags override
/// individual values.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub storage: StorageConfig,
    pub inference_prefix: String,
    pub scores_key: String,
    pub source_video_prefix: String,
    pub inference_concurrency: usize,
    pub render_concurrency: usize,
    pub sample_size: usize,
    pub models: [ModelConfig; 2],
    pub model_api_key: Option<String>,
    pub scratch_dir: PathBuf,
}

impl EvalConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                      |
    /// |-------------------------|------------------------------|
    /// | `STORAGE_BACKEND`       | `local` (`local` or `s3`)    |
    /// | `LOCAL_STORAGE_ROOT`    | `./data`                     |
    /// | `S3_BUCKET`             | required when backend is s3  |
    /// | `S3_ENDPOINT_URL`       | AWS default                  |
    /// | `INFERENCE_PREFIX`      | `inference_runs`             |
    /// | `SCORES_KEY`            | `scores/scores.jsonl`        |
    /// | `SOURCE_VIDEO_PREFIX`   | `videos`                     |
    /// | `INFERENCE_CONCURRENCY` | `20`                         |
    /// | `RENDER_CONCURRENCY`    | `4`                          |
    /// | `SAMPLE_SIZE`           | `3`                          |
    /// | `MODEL1_NAME`           | `model1`                     |
    /// | `MODEL1_ENDPOINT`       | unset                        |
    /// | `MODEL1_PROMPT`         | `default` (or `none`)        |
    /// | `MODEL2_NAME`           | `model2`                     |
    /// | `MODEL2_ENDPOINT`       | unset                        |
    /// | `MODEL2_PROMPT`         | `default` (or `none`)        |
    /// | `MODEL_API_KEY`         | unset                        |
    /// | `SCRATCH_DIR`           | `$TMPDIR/blindeval`          |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let storage = match or("STORAGE_BACKEND", "local").to_ascii_lowercase().as_str() {
            "local" => StorageConfig::Local {
                root: PathBuf::from(or("LOCAL_STORAGE_ROOT", "./data")),
            },
            "s3" => StorageConfig::S3 {
                bucket: var("S3_BUCKET").context("S3_BUCKET must be set when STORAGE_BACKEND=s3")?,
                endpoint_url: var("S3_ENDPOINT_URL"),
            },
            other => bail!("STORAGE_BACKEND must be 'local' or 's3', got '{other}'"),
        };

        let model = |n: u8| -> Result<ModelConfig> {
            let prompt_var = format!("MODEL{n}_PROMPT");
            Ok(ModelConfig {
                name: or(&format!("MODEL{n}_NAME"), &format!("model{n}")),
                endpoint: var(&format!("MODEL{n}_ENDPOINT")),
                prompt: parse_prompt_setting(&or(&prompt_var, "default"))
                    .with_context(|| format!("invalid {prompt_var}"))?,
            })
        };

        Ok(Self {
            storage,
            inference_prefix: or("INFERENCE_PREFIX", "inference_runs"),
            scores_key: or("SCORES_KEY", "scores/scores.jsonl"),
            source_video_prefix: or("SOURCE_VIDEO_PREFIX", "videos"),
            inference_concurrency: parse_var(
                var("INFERENCE_CONCURRENCY"),
                "INFERENCE_CONCURRENCY",
                DEFAULT_INFERENCE_CONCURRENCY,
            )?,
            render_concurrency: parse_var(
                var("RENDER_CONCURRENCY"),
                "RENDER_CONCURRENCY",
                DEFAULT_RENDER_CONCURRENCY,
            )?,
            sample_size: parse_var(var("SAMPLE_SIZE"), "SAMPLE_SIZE", DEFAULT_SAMPLE_SIZE)?,
            models: [model(1)?, model(2)?],
            model_api_key: var("MODEL_API_KEY"),
            scratch_dir: var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("blindeval")),
        })
    }
}

/// `none` disables the prompt; anything else must name a prompt style.
pub fn parse_prompt_setting(value: &str) -> Result<Option<PromptStyle>> {
    if value.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    Ok(Some(PromptStyle::parse(value)?))
}

fn parse_var<T>(value: Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}
