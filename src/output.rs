//! Report persistence.
//!
//! Saves one JSON document per extraction, a flat consolidated CSV, and a
//! batch summary JSON, then collects locators and download links into a
//! manifest. Failing to save one individual document is recorded, not fatal.

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use schemars::JsonSchema;

use crate::{
    aggregate::BatchSummary, attrs::DocumentExtraction, consolidate::Consolidation,
    prelude::*, store::BlobStore,
};

/// One saved report file.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct SavedFile {
    /// Key within the output location.
    pub key: String,
    /// Backend locator, e.g. `s3://bucket/key` or `file:///path`.
    pub locator: String,
    /// Time-limited download URL, when the backend supports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Everything written for one batch, plus any save failures.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct OutputManifest {
    pub files: Vec<SavedFile>,
    pub errors: Vec<String>,
}

/// Writes batch outputs to a [`BlobStore`] location.
pub struct OutputWriter {
    store: Arc<dyn BlobStore>,
    location: String,
}

impl OutputWriter {
    pub fn new(store: Arc<dyn BlobStore>, location: &str) -> Self {
        Self {
            store,
            location: location.to_owned(),
        }
    }

    /// Save everything for a finished batch.
    #[instrument(level = "debug", skip_all, fields(location = %self.location))]
    pub async fn write_all(
        &self,
        docs: &[DocumentExtraction],
        summary: &BatchSummary,
        consolidation: &Consolidation,
    ) -> OutputManifest {
        let mut manifest = OutputManifest::default();
        for doc in docs {
            match self.save_individual(doc).await {
                Ok(file) => manifest.files.push(file),
                Err(err) => manifest.errors.push(format!(
                    "cannot save document {:?}: {err:#}",
                    doc.extraction.filename
                )),
            }
        }
        match self.save_consolidated_csv(docs).await {
            Ok(file) => manifest.files.push(file),
            Err(err) => manifest
                .errors
                .push(format!("cannot save consolidated CSV: {err:#}")),
        }
        match self.save_summary(summary, consolidation).await {
            Ok(file) => manifest.files.push(file),
            Err(err) => manifest
                .errors
                .push(format!("cannot save batch summary: {err:#}")),
        }
        manifest
    }

    /// Save one document's full extraction record as JSON.
    pub async fn save_individual(&self, doc: &DocumentExtraction) -> Result<SavedFile> {
        let key = format!(
            "individual/{}_{}.json",
            file_stem(&doc.extraction.filename),
            timestamp()
        );
        let json = serde_json::to_vec_pretty(doc)
            .context("cannot serialize document extraction")?;
        self.save(&key, &json, "application/json").await
    }

    /// Save a flat CSV: one row per document, one column per attribute.
    pub async fn save_consolidated_csv(
        &self,
        docs: &[DocumentExtraction],
    ) -> Result<SavedFile> {
        let attribute_names = docs
            .iter()
            .flat_map(|doc| doc.attributes.keys())
            .collect::<BTreeSet<_>>();

        let mut writer = csv::Writer::from_writer(vec![]);
        let mut header = vec!["filename", "extraction_method", "confidence_score"];
        header.extend(attribute_names.iter().map(|name| name.as_str()));
        writer.write_record(&header).context("cannot write CSV header")?;

        for doc in docs {
            let mut row = vec![
                doc.extraction.filename.clone(),
                serde_json::to_value(doc.metadata.extraction_method)
                    .context("cannot serialize extraction method")?
                    .as_str()
                    .unwrap_or_default()
                    .to_owned(),
                format!("{:.4}", doc.metadata.confidence_score),
            ];
            for name in &attribute_names {
                let value = doc.attributes.get(*name).and_then(|a| a.value.as_ref());
                row.push(csv_cell(value));
            }
            writer.write_record(&row).context("cannot write CSV row")?;
        }

        let bytes = writer.into_inner().context("cannot finish CSV")?;
        let key = format!("consolidated_{}.csv", timestamp());
        self.save(&key, &bytes, "text/csv").await
    }

    /// Save the batch summary and consolidation as one JSON report.
    pub async fn save_summary(
        &self,
        summary: &BatchSummary,
        consolidation: &Consolidation,
    ) -> Result<SavedFile> {
        let report = serde_json::json!({
            "summary": summary,
            "consolidation": consolidation,
        });
        let json =
            serde_json::to_vec_pretty(&report).context("cannot serialize summary")?;
        let key = format!("summary_{}.json", timestamp());
        self.save(&key, &json, "application/json").await
    }

    async fn save(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<SavedFile> {
        let locator = self
            .store
            .store(&self.location, key, bytes, content_type)
            .await?;
        let download_url = self.store.presign(&self.location, key).await?;
        info!(key = %key, locator = %locator, "saved report file");
        Ok(SavedFile {
            key: key.to_owned(),
            locator,
            download_url,
        })
    }
}

/// A filename reduced to a key-safe stem: extension dropped, path
/// separators and spaces replaced.
fn file_stem(filename: &str) -> String {
    let name = filename.rsplit('/').next().unwrap_or(filename);
    let stem = name.strip_suffix(".pdf").or_else(|| name.strip_suffix(".PDF")).unwrap_or(name);
    stem.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}
