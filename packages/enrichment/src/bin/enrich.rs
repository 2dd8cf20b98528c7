//! Enrich a CSV of websites from the command line.
//!
//! ```text
//! enrich companies.csv --instructions "What do they sell?" \
//!     --column "Industry=Name the industry in two words" --rows 50
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use enrichment::{
    AccountContext, AccountId, AdditionalColumn, AnalysisPlan, BatchRequest, BillingStatus,
    CancellationToken, MemoryQuotaLedger, Pipeline, PipelineConfig, ProgressEvent, QuotaLedger,
    SecretString, ServiceTier, Table,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "enrich", about = "Scrape websites listed in a CSV and analyse them with an LLM")]
struct Args {
    /// Input CSV with a Websites/Sites/Domains column
    input: PathBuf,

    /// Output CSV; defaults to <input>_enriched.csv
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Instructions for the Analysis column
    #[arg(short, long, default_value = "")]
    instructions: String,

    /// Extra output column as NAME=INSTRUCTIONS (repeatable)
    #[arg(short = 'c', long = "column", value_parser = parse_column)]
    columns: Vec<AdditionalColumn>,

    /// Input column whose value is added to every prompt (repeatable)
    #[arg(long = "context-column")]
    context_columns: Vec<String>,

    /// Column holding the targets; detected when omitted
    #[arg(long)]
    target_column: Option<String>,

    #[arg(short, long, default_value = enrichment::types::plan::DEFAULT_MODEL)]
    model: String,

    /// Only process the first N rows
    #[arg(long)]
    rows: Option<usize>,

    /// Monthly row allowance of the account
    #[arg(long, env = "ENRICH_QUOTA_LIMIT", default_value_t = 1_000)]
    quota_limit: u64,

    /// Rows already used this period
    #[arg(long, env = "ENRICH_QUOTA_USED", default_value_t = 0)]
    quota_used: u64,

    /// Service tier; derived from the quota limit when omitted
    #[arg(long, env = "ENRICH_TIER")]
    tier: Option<ServiceTier>,

    /// Fixed worker count, overriding the tier
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Print a JSON summary of the batch to stdout
    #[arg(long)]
    json: bool,
}

fn parse_column(raw: &str) -> std::result::Result<AdditionalColumn, String> {
    let (name, instructions) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=INSTRUCTIONS, got {:?}", raw))?;
    Ok(AdditionalColumn::new(name.trim(), instructions.trim()))
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    input.with_file_name(format!("{}_enriched.csv", stem))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,enrichment=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::from_env().context("Invalid ENRICH_* configuration")?;
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let table = Table::from_csv_bytes(&bytes).context("Failed to parse input CSV")?;
    if table.is_empty() {
        bail!("{} has no data rows", args.input.display());
    }

    let mut account = AccountContext::new(AccountId(1), args.quota_limit).with_used(args.quota_used);
    if let Some(tier) = args.tier {
        account = account.with_tier(tier);
    }

    let ledger = Arc::new(MemoryQuotaLedger::new());
    ledger.register(&account).await;

    let pipeline =
        Pipeline::new(config, ledger.clone()).context("Failed to build HTTP client")?;

    let mut plan = AnalysisPlan::new(args.instructions)
        .with_model(args.model)
        .with_context_columns(args.context_columns);
    for column in args.columns {
        plan = plan.with_column(column);
    }

    let mut request = BatchRequest::new(table, plan, SecretString::from(args.api_key));
    if let Some(column) = args.target_column {
        request = request.with_target_column(column);
    }
    if let Some(rows) = args.rows {
        request = request.with_row_limit(rows);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing rows in flight");
                cancel.cancel();
            }
        });
    }

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let reporter = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            tracing::info!(
                current = event.current,
                total = event.total,
                success = event.success_count,
                errors = event.error_count,
                "Progress {}%",
                event.percent()
            );
        }
    });

    let outcome = pipeline
        .run(&account, request, Arc::new(progress_tx), cancel)
        .await
        .context("Batch failed")?;
    reporter.await.ok();

    let output = args.output.unwrap_or_else(|| default_output(&args.input));
    tokio::fs::write(&output, outcome.to_csv_bytes()?)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let quota = ledger.account(account.account_id).await?;
    tracing::info!(
        output = %output.display(),
        completed = outcome.state.completed,
        success = outcome.state.success_count,
        errors = outcome.state.error_count,
        cancelled = outcome.state.cancelled,
        used = quota.used,
        limit = quota.limit,
        "Done"
    );

    if let BillingStatus::Pending { reason, .. } = &outcome.billing {
        tracing::warn!(%reason, "Usage could not be recorded");
    }

    if args.json {
        let summary = serde_json::json!({
            "output": output.display().to_string(),
            "state": outcome.state,
            "billing": outcome.billing,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}
