//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    aggregate::BatchSummary, attrs::{AttributeDef, DocumentExtraction},
    consolidate::Consolidation, io_util::write_text, output::OutputManifest, prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// One attribute definition, as found in a schema file.
    AttributeDef,
    /// A fully processed document.
    DocumentExtraction,
    /// The per-batch quality report.
    BatchSummary,
    /// The multi-year consolidation report.
    Consolidation,
    /// The list of saved output files.
    OutputManifest,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::AttributeDef => schema_for!(AttributeDef),
        SchemaType::DocumentExtraction => schema_for!(DocumentExtraction),
        SchemaType::BatchSummary => schema_for!(BatchSummary),
        SchemaType::Consolidation => schema_for!(Consolidation),
        SchemaType::OutputManifest => schema_for!(OutputManifest),
    };
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    write_text(schema_opts.output_path.as_deref(), &schema_str).await
}
