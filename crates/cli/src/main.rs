//! `blindeval` -- blind A/B evaluation of model-generated video step
//! descriptions.
//!
//! Typical flow: `infer` runs both models over the source videos, `render`
//! assigns blind colours and uploads comparison videos, raters use
//! `session` and `rate`, and `summarize` de-blinds and tests the results.
//!
//! Configuration comes from the environment (see [`config::EvalConfig`]);
//! a `.env` file is loaded when present.

mod commands;
mod config;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::{Context, InferArgs, RateArgs, RatingInput, SummarizeArgs};
use config::EvalConfig;

const DEFAULT_LOG_FILTER: &str =
    "blindeval_cli=info,blindeval_core=info,blindeval_pipeline=info,blindeval_cloud=info";

#[derive(Parser)]
#[command(name = "blindeval", version, about = "Blind A/B evaluation of video step descriptions")]
struct Cli {
    /// Batch to operate on (`run_YYYYMMDD_HHMMSS`). Defaults to the latest.
    #[arg(long, global = true, env = "BATCH_ID")]
    batch: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both models over every source video into a new batch
    Infer {
        /// Prompt for model 1 (default, granular, numbered or none)
        #[arg(long)]
        model1_prompt: Option<String>,
        /// Prompt for model 2 (default, granular, numbered or none)
        #[arg(long)]
        model2_prompt: Option<String>,
        /// Maximum concurrent model calls
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Create the blind colour assignment for a batch
    Assign {
        /// Replace an existing assignment
        #[arg(long)]
        force: bool,
    },
    /// Render and upload comparison videos
    Render {
        /// Generate a fresh assignment even if one exists
        #[arg(long)]
        force_assignment: bool,
        /// Maximum concurrent renders
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show a rater's sampled items and the next comparison
    #[command(group(ArgGroup::new("who").required(true).args(["rater", "random"])))]
    Session {
        #[arg(long)]
        rater: Option<String>,
        /// Use a random throwaway rater id
        #[arg(long)]
        random: bool,
    },
    /// Record a judgment for one item
    #[command(group(ArgGroup::new("verdict").required(true).args(["prefer", "red"])))]
    Rate {
        #[arg(long)]
        rater: String,
        /// Item to judge. Defaults to the rater's next pending item
        #[arg(long)]
        item: Option<String>,
        /// Binary preference: red, yellow or tie
        #[arg(long, conflicts_with_all = ["red", "yellow"])]
        prefer: Option<String>,
        /// Categorical issues for red, e.g. `coverage=1,verb=2` or `none`
        #[arg(long, requires = "yellow")]
        red: Option<String>,
        /// Categorical issues for yellow
        #[arg(long, requires = "red")]
        yellow: Option<String>,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// De-blind the ledger and print statistics
    Summarize {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
        /// Producer treated as the focus of the significance test
        #[arg(long)]
        focus: Option<String>,
        /// How ties enter the binomial test: count or exclude
        #[arg(long)]
        ties: Option<String>,
    },
    /// Export the score ledger as CSV
    ExportScores {
        /// Output file. Defaults to stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// List inference batches
    Batches,
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let ctx = Context::open(EvalConfig::from_env()?).await?;
    let batch = cli.batch;

    match cli.command {
        Commands::Infer {
            model1_prompt,
            model2_prompt,
            concurrency,
        } => {
            commands::infer(
                &ctx,
                InferArgs {
                    batch,
                    model1_prompt,
                    model2_prompt,
                    concurrency,
                },
            )
            .await
        }
        Commands::Assign { force } => commands::assign(&ctx, batch.as_deref(), force).await,
        Commands::Render {
            force_assignment,
            concurrency,
        } => commands::render(&ctx, batch.as_deref(), force_assignment, concurrency).await,
        Commands::Session { rater, .. } => commands::session(&ctx, batch.as_deref(), rater).await,
        Commands::Rate {
            rater,
            item,
            prefer,
            red,
            yellow,
            notes,
        } => {
            let rating = match (prefer, red, yellow) {
                (Some(choice), _, _) => RatingInput::Binary(choice),
                (None, Some(red), Some(yellow)) => RatingInput::Categorical { red, yellow },
                _ => anyhow::bail!("Pass --prefer, or both --red and --yellow"),
            };
            commands::rate(
                &ctx,
                RateArgs {
                    batch,
                    rater,
                    item,
                    rating,
                    notes,
                },
            )
            .await
        }
        Commands::Summarize { json, focus, ties } => {
            commands::summarize(
                &ctx,
                SummarizeArgs {
                    batch,
                    json,
                    focus,
                    ties,
                },
            )
            .await
        }
        Commands::ExportScores { output } => commands::export_scores(&ctx, output).await,
        Commands::Batches => commands::batches(&ctx).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            tracing::warn!("Finished with failed jobs");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rate_needs_a_verdict() {
        assert!(Cli::try_parse_from(["blindeval", "rate", "--rater", "ann"]).is_err());
        assert!(Cli::try_parse_from(["blindeval", "rate", "--rater", "ann", "--red", "none"]).is_err());
        assert!(Cli::try_parse_from([
            "blindeval", "rate", "--rater", "ann", "--prefer", "red", "--red", "none", "--yellow", "none"
        ])
        .is_err());
    }

    #[test]
    fn rate_accepts_categorical_scores() {
        let cli = Cli::try_parse_from([
            "blindeval", "--batch", "run_20240101_120000", "rate", "--rater", "ann", "--red",
            "coverage=1", "--yellow", "none",
        ])
        .unwrap();
        assert_eq!(cli.batch.as_deref(), Some("run_20240101_120000"));
        assert!(matches!(cli.command, Commands::Rate { red: Some(_), yellow: Some(_), .. }));
    }

    #[test]
    fn session_requires_rater_or_random() {
        assert!(Cli::try_parse_from(["blindeval", "session"]).is_err());
        assert!(Cli::try_parse_from(["blindeval", "session", "--random"]).is_ok());
    }
}
