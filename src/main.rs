use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod aggregate;
mod attrs;
mod batch;
mod cascade;
mod cmd;
mod config;
mod consolidate;
mod extractor;
mod io_util;
mod model;
mod ocr;
mod output;
mod prelude;
mod store;
#[cfg(test)]
mod testutil;
mod ui;

/// Extract structured financial attributes from PDF statements at scale.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - FINSIGHT_BUCKET: Bucket holding both inputs and outputs.
  - FINSIGHT_INPUT_PREFIX, FINSIGHT_OUTPUT_PREFIX (optional): Key prefixes
    within FINSIGHT_BUCKET (defaults: "input" and "output").
  - FINSIGHT_INPUT_BUCKET, FINSIGHT_OUTPUT_BUCKET: Legacy separate-bucket
    mode, used when FINSIGHT_BUCKET is not set.
  - FINSIGHT_MODEL (optional): Chat model to use.
  - OPENAI_API_KEY: The API key for the chat model.
  - OPENAI_API_BASE (optional): Override the model server URL.

  Standard AWS environment variables and credential files are used for S3.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Extract attributes from a batch of stored PDFs.
    Extract(cmd::extract::ExtractOpts),
    /// Recompute reports from previously saved extraction files.
    Consolidate(cmd::consolidate::ConsolidateOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Extract(opts) => opts.output_path.is_none(),
            Cmd::Consolidate(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Extract(extract_opts) => {
            cmd::extract::cmd_extract(ui, extract_opts).await?;
        }
        Cmd::Consolidate(consolidate_opts) => {
            cmd::consolidate::cmd_consolidate(consolidate_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
