//! Batch processing with bounded concurrency.
//!
//! One slow or broken document must never take down a batch: every per-item
//! failure mode, including the overall per-item timeout, collapses into a
//! placeholder [`DocumentExtraction`] and the batch carries on.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt as _, stream};

use crate::{
    attrs::{AttributeDef, DocumentExtraction},
    cascade::TextExtractionCascade,
    extractor::AttributeExtractor,
    prelude::*,
    store::BlobStore,
    ui::{ProgressConfig, Ui},
};

/// Tuning knobs for a batch run.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// How many documents to process at once.
    pub concurrency: usize,
    /// Wall-clock budget per document, covering download, text extraction
    /// and the model call.
    pub timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Runs the full pipeline over a set of stored documents.
pub struct BatchCoordinator {
    store: Arc<dyn BlobStore>,
    cascade: TextExtractionCascade,
    extractor: AttributeExtractor,
    schema: Arc<Vec<AttributeDef>>,
    opts: BatchOptions,
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        cascade: TextExtractionCascade,
        extractor: AttributeExtractor,
        schema: Arc<Vec<AttributeDef>>,
        opts: BatchOptions,
    ) -> Self {
        Self {
            store,
            cascade,
            extractor,
            schema,
            opts,
        }
    }

    /// Process every key in the batch. Always returns exactly one result per
    /// input key, in completion order.
    #[instrument(level = "debug", skip_all, fields(location, documents = keys.len()))]
    pub async fn process_batch(
        &self,
        ui: &Ui,
        location: &str,
        keys: &[String],
    ) -> Vec<DocumentExtraction> {
        let pb = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄 ",
                msg: "Extracting",
                done_msg: "Extraction done",
            },
            keys.len() as u64,
        );
        stream::iter(keys)
            .map(|key| {
                let pb = pb.clone();
                async move {
                    let result = match tokio::time::timeout(
                        self.opts.timeout,
                        self.process_one(location, key),
                    )
                    .await
                    {
                        Ok(doc) => doc,
                        Err(_) => {
                            warn!(key = %key, "document processing timed out");
                            DocumentExtraction::failed(
                                basename(key),
                                &self.schema,
                                &format!(
                                    "processing timed out after {}s",
                                    self.opts.timeout.as_secs()
                                ),
                            )
                        }
                    };
                    pb.inc(1);
                    result
                }
            })
            .buffer_unordered(self.opts.concurrency.max(1))
            .collect()
            .await
    }

    async fn process_one(&self, location: &str, key: &str) -> DocumentExtraction {
        let bytes = match self.store.fetch(location, key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %key, "cannot fetch document: {err:#}");
                return DocumentExtraction::failed(
                    basename(key),
                    &self.schema,
                    &format!("{err:#}"),
                );
            }
        };
        let extraction = self.cascade.extract(&bytes, basename(key)).await;
        let (attributes, mut metadata) =
            self.extractor.extract(&extraction.text, &self.schema).await;
        metadata.extraction_method = extraction.method;
        DocumentExtraction {
            extraction,
            attributes,
            metadata,
        }
    }
}

/// The basename of an object key. Keys can carry storage prefixes, but
/// report filenames use the bare document name.
fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        cascade::ExtractionMethod,
        model::GenerativeModel,
        ocr::{OcrWord, OpticalRecognizer, PageRasterizer},
        store::LocalStore,
        testutil::pdf_with_text,
    };

    struct NoRasterizer;

    #[async_trait]
    impl PageRasterizer for NoRasterizer {
        async fn rasterize(
            &self,
            _pdf: &[u8],
            _dpi: u32,
            _max_pages: usize,
        ) -> Result<Vec<Vec<u8>>> {
            Err(anyhow!("no rasterizer in this test"))
        }
    }

    struct NoRecognizer;

    #[async_trait]
    impl OpticalRecognizer for NoRecognizer {
        async fn recognize(&self, _png: &[u8]) -> Result<Vec<OcrWord>> {
            Err(anyhow!("no recognizer in this test"))
        }
    }

    /// A model that replies with a fixed extraction after an optional delay.
    struct CannedModel {
        delay: Duration,
    }

    #[async_trait]
    impl GenerativeModel for CannedModel {
        async fn invoke(
            &self,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({
                "extracted_attributes": {
                    "Total Revenue": {
                        "value": "1500000",
                        "confidence_breakdown": {
                            "text_clarity": 1.0,
                            "exact_match": 1.0,
                            "context_match": 1.0,
                            "format_validity": 1.0
                        }
                    }
                }
            })
            .to_string())
        }
    }

    fn schema() -> Arc<Vec<AttributeDef>> {
        Arc::new(
            serde_json::from_value(json!([
                {"name": "Total Revenue", "data_type": "currency"}
            ]))
            .unwrap(),
        )
    }

    fn coordinator(
        store: Arc<dyn BlobStore>,
        delay: Duration,
        opts: BatchOptions,
    ) -> BatchCoordinator {
        let cascade =
            TextExtractionCascade::new(Arc::new(NoRasterizer), Arc::new(NoRecognizer));
        let extractor =
            AttributeExtractor::new(Arc::new(CannedModel { delay })).unwrap();
        BatchCoordinator::new(store, cascade, extractor, schema(), opts)
    }

    async fn seeded_store() -> Result<(tempfile::TempDir, Arc<LocalStore>)> {
        let tmpdir = tempfile::tempdir()?;
        let store = LocalStore::new(tmpdir.path());
        let pdf = pdf_with_text(&[
            "Annual Report 2023. Total Revenue: $1,500,000 across all segments.",
            "Net Income: $250,000. Total Assets: $4,000,000.",
        ]);
        store.store("docs", "a.pdf", &pdf, "application/pdf").await?;
        store.store("docs", "b.pdf", &pdf, "application/pdf").await?;
        Ok((tmpdir, Arc::new(store)))
    }

    #[tokio::test]
    async fn one_bad_document_does_not_poison_the_batch() -> Result<()> {
        let (_tmpdir, store) = seeded_store().await?;
        let coordinator =
            coordinator(store, Duration::ZERO, BatchOptions::default());
        let keys = vec![
            "a.pdf".to_owned(),
            "missing.pdf".to_owned(),
            "b.pdf".to_owned(),
        ];
        let ui = Ui::init();
        let results = coordinator.process_batch(&ui, "docs", &keys).await;

        assert_eq!(results.len(), 3);
        let failed = results
            .iter()
            .find(|doc| doc.extraction.filename == "missing.pdf")
            .unwrap();
        assert!(failed.metadata.error.is_some());
        assert!(failed.attributes["Total Revenue"].value.is_none());

        for doc in results
            .iter()
            .filter(|doc| doc.extraction.filename != "missing.pdf")
        {
            assert_eq!(doc.extraction.method, ExtractionMethod::Native);
            assert_eq!(doc.metadata.extraction_method, ExtractionMethod::Native);
            assert_eq!(
                doc.attributes["Total Revenue"].value,
                Some(json!("1500000"))
            );
            assert!(doc.metadata.error.is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn filenames_are_key_basenames() -> Result<()> {
        let (_tmpdir, store) = seeded_store().await?;
        let coordinator =
            coordinator(store, Duration::ZERO, BatchOptions::default());
        let keys = vec![
            "a.pdf".to_owned(),
            "2023/reports/missing.pdf".to_owned(),
        ];
        let ui = Ui::init();
        let results = coordinator.process_batch(&ui, "docs", &keys).await;

        assert_eq!(results.len(), 2);
        let failed = results
            .iter()
            .find(|doc| doc.metadata.error.is_some())
            .unwrap();
        assert_eq!(failed.extraction.filename, "missing.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn slow_documents_time_out_into_placeholders() -> Result<()> {
        let (_tmpdir, store) = seeded_store().await?;
        let opts = BatchOptions {
            concurrency: 2,
            timeout: Duration::from_millis(25),
        };
        let coordinator = coordinator(store, Duration::from_secs(5), opts);
        let keys = vec!["a.pdf".to_owned(), "b.pdf".to_owned()];
        let ui = Ui::init();
        let results = coordinator.process_batch(&ui, "docs", &keys).await;

        assert_eq!(results.len(), 2);
        for doc in &results {
            let error = doc.metadata.error.as_deref().unwrap();
            assert!(error.contains("timed out"));
            assert_eq!(doc.attributes.len(), 1);
        }
        Ok(())
    }
}
