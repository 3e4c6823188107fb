//! The `consolidate` subcommand: re-run aggregation and consolidation over
//! previously saved individual extraction files, without re-extracting.

use std::collections::BTreeSet;

use clap::Args;
use tokio::fs;

use crate::{
    aggregate::summarize_batch,
    attrs::{AttributeDef, DocumentExtraction, load_schema},
    consolidate::ConsolidationEngine,
    io_util::write_text,
    prelude::*,
};

/// Consolidate command line arguments.
#[derive(Debug, Args)]
pub struct ConsolidateOpts {
    /// Previously saved individual extraction JSON files.
    #[clap(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Attribute schema file. When omitted, the summary covers the union of
    /// attributes found in the input files.
    #[clap(long = "schema", value_name = "FILE")]
    pub schema_path: Option<PathBuf>,

    /// The output path for the report JSON.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `consolidate` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_consolidate(opts: &ConsolidateOpts) -> Result<()> {
    let mut docs = vec![];
    for path in &opts.files {
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {:?}", path.display()))?;
        let doc: DocumentExtraction = serde_json::from_str(&json)
            .with_context(|| format!("cannot parse {:?}", path.display()))?;
        docs.push(doc);
    }

    let schema = match &opts.schema_path {
        Some(path) => load_schema(path).await?,
        None => derived_schema(&docs),
    };

    let summary = summarize_batch(&docs, &schema);
    let consolidation = ConsolidationEngine::default().consolidate(&docs);
    let report = serde_json::json!({
        "summary": summary,
        "consolidation": consolidation,
    });
    write_text(
        opts.output_path.as_deref(),
        &serde_json::to_string_pretty(&report).context("failed to serialize report")?,
    )
    .await
}

/// A synthetic schema covering every attribute the input documents mention.
fn derived_schema(docs: &[DocumentExtraction]) -> Vec<AttributeDef> {
    docs.iter()
        .flat_map(|doc| doc.attributes.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|name| AttributeDef {
            name: name.clone(),
            description: String::new(),
            data_type: Default::default(),
            required: false,
        })
        .collect()
}
