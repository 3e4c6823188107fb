//! The `extract` subcommand: the full pipeline over a batch of stored PDFs.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    aggregate::summarize_batch,
    attrs::load_schema,
    batch::{BatchCoordinator, BatchOptions},
    cascade::TextExtractionCascade,
    config::AppConfig,
    consolidate::ConsolidationEngine,
    extractor::AttributeExtractor,
    io_util::write_text,
    model::OpenAiModel,
    ocr::{PdfToCairoRasterizer, TesseractRecognizer},
    output::OutputWriter,
    prelude::*,
    store::{BlobStore, LocalStore, S3Store},
    ui::Ui,
};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// Path to the attribute schema JSON file.
    #[clap(long = "schema", value_name = "FILE")]
    pub schema_path: PathBuf,

    /// Specific object keys to process. When omitted, every PDF at the
    /// input location is processed.
    #[clap(value_name = "KEY")]
    pub keys: Vec<String>,

    /// How many documents to process at once.
    #[clap(short = 'j', long = "jobs", default_value = "3")]
    pub jobs: usize,

    /// Per-document processing budget, in seconds.
    #[clap(long, default_value = "300")]
    pub timeout: u64,

    /// Model API timeout per call, in seconds.
    #[clap(long, default_value = "120")]
    pub model_timeout: u64,

    /// Use `DIR/input` and `DIR/output` on the local filesystem instead of
    /// object storage.
    #[clap(long, value_name = "DIR")]
    pub local_root: Option<PathBuf>,

    /// The output path for the batch report JSON.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let config = AppConfig::from_env()?;
    let schema = Arc::new(load_schema(&opts.schema_path).await?);

    let (store, input_location, output_location): (Arc<dyn BlobStore>, String, String) =
        match &opts.local_root {
            Some(root) => (
                Arc::new(LocalStore::new(root)),
                "input".to_owned(),
                "output".to_owned(),
            ),
            None => {
                let storage = config.storage_required()?;
                (
                    Arc::new(S3Store::new().await?),
                    storage.input_location(),
                    storage.output_location(),
                )
            }
        };

    let keys = if opts.keys.is_empty() {
        store
            .list(&input_location)
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .collect::<Vec<_>>()
    } else {
        opts.keys.clone()
    };
    if keys.is_empty() {
        return Err(anyhow!("no PDF documents found at {input_location}"));
    }
    info!(documents = keys.len(), input_location = %input_location, "processing batch");

    let cascade = TextExtractionCascade::new(
        Arc::new(PdfToCairoRasterizer::new()),
        Arc::new(TesseractRecognizer::new()),
    );
    let model = Arc::new(OpenAiModel::new(
        &config.model,
        Duration::from_secs(opts.model_timeout),
    )?);
    let extractor = AttributeExtractor::new(model)?;
    let coordinator = BatchCoordinator::new(
        store.clone(),
        cascade,
        extractor,
        schema.clone(),
        BatchOptions {
            concurrency: opts.jobs,
            timeout: Duration::from_secs(opts.timeout),
        },
    );

    let docs = coordinator.process_batch(&ui, &input_location, &keys).await;
    let summary = summarize_batch(&docs, &schema);
    let consolidation = ConsolidationEngine::default().consolidate(&docs);

    let writer = OutputWriter::new(store, &output_location);
    let manifest = writer.write_all(&docs, &summary, &consolidation).await;
    for problem in &manifest.errors {
        error!("{problem}");
    }

    let report = serde_json::json!({
        "summary": summary,
        "consolidation": consolidation,
        "outputs": manifest,
    });
    write_text(
        opts.output_path.as_deref(),
        &serde_json::to_string_pretty(&report).context("failed to serialize report")?,
    )
    .await
}
