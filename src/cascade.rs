//! The text-extraction cascade.
//!
//! We try a series of strategies in priority order, from cheapest to most
//! expensive: the PDF's own text layer (two different readers), then OCR.
//! Extraction never fails outright. Problems degrade the result and are
//! recorded on it, so one bad document can't take down a batch.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use schemars::JsonSchema;

use crate::{
    ocr::{OpticalRecognizer, PageRasterizer},
    prelude::*,
};

/// Confidence assigned to text read from the PDF's own text layer.
const NATIVE_CONFIDENCE: f64 = 0.95;

/// Confidence assigned to text recovered by the alternate reader.
const ALTERNATE_CONFIDENCE: f64 = 0.90;

/// Confidence assigned when the final text is too short to trust.
const INSUFFICIENT_CONFIDENCE: f64 = 0.1;

/// A strategy whose trimmed text is longer than this wins outright and stops
/// the cascade.
const WIN_THRESHOLD_CHARS: usize = 100;

/// Results with trimmed text shorter than this are downgraded to
/// [`INSUFFICIENT_CONFIDENCE`].
const SUFFICIENCY_FLOOR_CHARS: usize = 50;

/// OCR processes at most this many pages of a document.
const OCR_MAX_PAGES: usize = 10;

/// Rasterization resolution for OCR, 2x the PDF-standard 72 DPI.
const OCR_DPI: u32 = 144;

/// OCR words at or below this engine confidence (0-100) are discarded.
const OCR_WORD_CONFIDENCE_FLOOR: f32 = 30.0;

/// How a document's text was obtained.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// The PDF's own text layer, via `pdf-extract`.
    Native,
    /// The text layer as recovered by `lopdf`.
    Alternate,
    /// Rasterized pages run through OCR.
    Ocr,
    /// No strategy produced text.
    #[default]
    None,
}

/// The outcome of running the cascade on one document.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default)]
pub struct ExtractionResult {
    /// The document's filename or object key.
    pub filename: String,
    /// The extracted text, possibly empty.
    pub text: String,
    /// Our confidence in `text`, 0.0 to 1.0. Serialized as
    /// `confidence_score`, which is what downstream consumers read.
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    /// Which strategy produced `text`. Serialized as `extraction_method`.
    #[serde(rename = "extraction_method")]
    pub method: ExtractionMethod,
    /// The document's page count, when we could determine it.
    pub page_count: Option<usize>,
    /// Did we treat this document as scanned images?
    pub has_images: bool,
    /// Does the result contain any non-whitespace text?
    pub has_text: bool,
    /// Wall-clock processing time in seconds.
    pub processing_time: f64,
    /// Problems encountered along the way.
    pub errors: Vec<String>,
}

/// A strategy's output, before we decide whether it wins.
struct Candidate {
    method: ExtractionMethod,
    text: String,
    confidence: f64,
}

impl Candidate {
    fn trimmed_len(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// Extracts text from PDF bytes, trying progressively more expensive
/// strategies.
pub struct TextExtractionCascade {
    rasterizer: Arc<dyn PageRasterizer>,
    recognizer: Arc<dyn OpticalRecognizer>,
}

impl TextExtractionCascade {
    pub fn new(
        rasterizer: Arc<dyn PageRasterizer>,
        recognizer: Arc<dyn OpticalRecognizer>,
    ) -> Self {
        Self {
            rasterizer,
            recognizer,
        }
    }

    /// Extract text from `bytes`. This does not return an error. Failures
    /// are recorded on the result instead.
    #[instrument(level = "debug", skip_all, fields(filename))]
    pub async fn extract(&self, bytes: &[u8], filename: &str) -> ExtractionResult {
        let started = Instant::now();
        let mut result = ExtractionResult {
            filename: filename.to_owned(),
            ..Default::default()
        };

        if !looks_like_pdf(bytes) {
            result
                .errors
                .push("not a PDF document (magic bytes do not match)".to_owned());
            return finish(result, started);
        }

        match page_count(bytes).await {
            Ok(count) => result.page_count = Some(count),
            Err(err) => warn!(filename, "could not determine page count: {err:#}"),
        }

        // Try each strategy in priority order. The first one to clear the win
        // threshold stops the cascade. If nobody clears it, we keep the
        // longest text any strategy produced.
        let mut chosen: Option<Candidate> = None;
        let mut longest: Option<Candidate> = None;

        match native_text(bytes).await {
            Ok(text) => place(
                Candidate {
                    method: ExtractionMethod::Native,
                    text,
                    confidence: NATIVE_CONFIDENCE,
                },
                &mut chosen,
                &mut longest,
            ),
            Err(err) => result.errors.push(format!("native reader: {err:#}")),
        }

        if chosen.is_none() {
            match alternate_text(bytes).await {
                Ok(text) => place(
                    Candidate {
                        method: ExtractionMethod::Alternate,
                        text,
                        confidence: ALTERNATE_CONFIDENCE,
                    },
                    &mut chosen,
                    &mut longest,
                ),
                Err(err) => result.errors.push(format!("alternate reader: {err:#}")),
            }
        }

        if chosen.is_none() {
            result.has_images = true;
            match self.ocr_text(bytes).await {
                Ok(candidate) => place(candidate, &mut chosen, &mut longest),
                Err(err) => result.errors.push(format!("ocr: {err:#}")),
            }
        }

        if let Some(candidate) = chosen.or(longest) {
            result.method = candidate.method;
            result.confidence = candidate.confidence;
            result.text = candidate.text;
        }

        finish(result, started)
    }

    /// Rasterize up to the first [`OCR_MAX_PAGES`] pages and recognize each.
    /// Document confidence is the mean per-page average word confidence,
    /// averaged over the pages that yielded text.
    async fn ocr_text(&self, bytes: &[u8]) -> Result<Candidate> {
        let pages = self
            .rasterizer
            .rasterize(bytes, OCR_DPI, OCR_MAX_PAGES)
            .await?;
        if pages.is_empty() {
            return Err(anyhow!("rasterization produced no pages"));
        }

        let mut page_texts = vec![];
        let mut page_confidences = vec![];
        for (idx, png) in pages.iter().enumerate() {
            let words = match self.recognizer.recognize(png).await {
                Ok(words) => words,
                Err(err) => {
                    warn!(page = idx + 1, "OCR failed for page: {err:#}");
                    continue;
                }
            };
            let kept = words
                .iter()
                .filter(|w| w.confidence > OCR_WORD_CONFIDENCE_FLOOR)
                .collect::<Vec<_>>();
            if kept.is_empty() {
                continue;
            }
            page_texts.push(
                kept.iter()
                    .map(|w| w.word.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            page_confidences.push(
                kept.iter().map(|w| f64::from(w.confidence)).sum::<f64>()
                    / kept.len() as f64,
            );
        }

        if page_texts.is_empty() {
            return Err(anyhow!("OCR produced no text on any page"));
        }
        let confidence = page_confidences.iter().sum::<f64>()
            / page_confidences.len() as f64
            / 100.0;
        Ok(Candidate {
            method: ExtractionMethod::Ocr,
            text: page_texts.join("\n\n"),
            confidence,
        })
    }
}

/// Record a candidate: either it wins outright, or it becomes the fallback
/// if its text is the longest seen so far.
fn place(candidate: Candidate, chosen: &mut Option<Candidate>, longest: &mut Option<Candidate>) {
    if candidate.trimmed_len() > WIN_THRESHOLD_CHARS {
        *chosen = Some(candidate);
    } else if longest
        .as_ref()
        .is_none_or(|best| candidate.trimmed_len() > best.trimmed_len())
    {
        *longest = Some(candidate);
    }
}

/// Apply the sufficiency floor and fill in the bookkeeping fields. The floor
/// is unconditional: even a total failure reports 0.1, not 0.0.
fn finish(mut result: ExtractionResult, started: Instant) -> ExtractionResult {
    let trimmed_len = result.text.trim().chars().count();
    result.has_text = trimmed_len > 0;
    if trimmed_len < SUFFICIENCY_FLOOR_CHARS {
        result.confidence = INSUFFICIENT_CONFIDENCE;
        result
            .errors
            .push("insufficient text extracted".to_owned());
    }
    result.processing_time =
        (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
    result
}

/// Do these bytes look like a PDF?
fn looks_like_pdf(bytes: &[u8]) -> bool {
    infer::get(bytes).is_some_and(|kind| kind.mime_type() == "application/pdf")
}

/// Read the text layer with `pdf-extract`. The parser is known to panic on
/// some malformed documents, so we contain panics and report them as errors.
async fn native_text(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        panic::catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem(&bytes)
        }))
        .map_err(|_| anyhow!("text layer parser panicked"))?
        .context("cannot read text layer")
    })
    .await
    .context("text layer task failed")?
}

/// Read the text layer with `lopdf`, which recovers some documents that
/// `pdf-extract` cannot parse.
async fn alternate_text(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        let doc = lopdf::Document::load_mem(&bytes).context("cannot parse PDF")?;
        let pages = doc.get_pages().keys().copied().collect::<Vec<u32>>();
        doc.extract_text(&pages).context("cannot read page text")
    })
    .await
    .context("alternate reader task failed")?
}

/// Count pages with `lopdf`. Best-effort.
async fn page_count(bytes: &[u8]) -> Result<usize> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        let doc = lopdf::Document::load_mem(&bytes).context("cannot parse PDF")?;
        Ok(doc.get_pages().len())
    })
    .await
    .context("page count task failed")?
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use super::*;
    use crate::{ocr::OcrWord, testutil::pdf_with_text};

    /// A rasterizer that always fails, for text-layer-only tests.
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

    /// A rasterizer that returns a fixed number of dummy pages.
    struct StubRasterizer {
        pages: usize,
    }

    #[async_trait]
    impl PageRasterizer for StubRasterizer {
        async fn rasterize(
            &self,
            _pdf: &[u8],
            _dpi: u32,
            max_pages: usize,
        ) -> Result<Vec<Vec<u8>>> {
            Ok(vec![vec![0u8; 8]; self.pages.min(max_pages)])
        }
    }

    /// A recognizer that replays canned per-page word lists.
    struct StubRecognizer {
        pages: Mutex<VecDeque<Vec<OcrWord>>>,
    }

    impl StubRecognizer {
        fn new(pages: Vec<Vec<OcrWord>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
            }
        }
    }

    #[async_trait]
    impl OpticalRecognizer for StubRecognizer {
        async fn recognize(&self, _png: &[u8]) -> Result<Vec<OcrWord>> {
            Ok(self
                .pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }
    }

    fn text_only_cascade() -> TextExtractionCascade {
        TextExtractionCascade::new(
            Arc::new(NoRasterizer),
            Arc::new(StubRecognizer::new(vec![])),
        )
    }

    fn words(specs: &[(&str, f32)]) -> Vec<OcrWord> {
        specs
            .iter()
            .map(|(word, confidence)| OcrWord {
                word: (*word).to_owned(),
                confidence: *confidence,
            })
            .collect()
    }

    #[tokio::test]
    async fn native_text_layer_wins() {
        let pdf = pdf_with_text(&[
            "Annual Report for Fiscal Year 2023",
            "Total Revenue: $1,500,000 across all operating segments",
            "Net Income: $250,000 after taxes and one-time charges",
        ]);
        let result = text_only_cascade().extract(&pdf, "report.pdf").await;
        assert_eq!(result.method, ExtractionMethod::Native);
        assert_eq!(result.confidence, 0.95);
        assert!(result.has_text);
        assert!(!result.has_images);
        assert!(result.text.contains("1,500,000"));
        assert_eq!(result.page_count, Some(1));
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn short_but_sufficient_text_keeps_native_confidence() {
        // 60-ish trimmed chars: below the win threshold, above the floor.
        let pdf = pdf_with_text(&["Total Revenue: $1,500,000 and Net Income: $250,000 (FY23)"]);
        let result = text_only_cascade().extract(&pdf, "short.pdf").await;
        assert_eq!(result.method, ExtractionMethod::Native);
        assert_eq!(result.confidence, 0.95);
        // The cascade fell through to OCR looking for something longer.
        assert!(result.has_images);
    }

    #[tokio::test]
    async fn insufficient_text_is_downgraded() {
        let pdf = pdf_with_text(&["Revenue: $5"]);
        let result = text_only_cascade().extract(&pdf, "stub.pdf").await;
        assert_ne!(result.method, ExtractionMethod::None);
        assert_eq!(result.confidence, 0.1);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("insufficient text"))
        );
    }

    #[tokio::test]
    async fn non_pdf_bytes_degrade_gracefully() {
        let result = text_only_cascade()
            .extract(b"just some plain text", "notes.txt")
            .await;
        assert_eq!(result.method, ExtractionMethod::None);
        assert!(!result.has_text);
        assert!(result.errors.iter().any(|e| e.contains("not a PDF")));
        // Even a total failure gets the sufficiency downgrade, not 0.0.
        assert_eq!(result.confidence, 0.1);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("insufficient text"))
        );
    }

    #[tokio::test]
    async fn total_strategy_failure_is_downgraded_like_short_text() {
        // Valid magic bytes, garbage body: every strategy runs and fails,
        // and no text is produced at all.
        let result = text_only_cascade()
            .extract(b"%PDF-1.7 but nothing else of substance", "broken.pdf")
            .await;
        assert!(!result.has_text);
        assert_eq!(result.confidence, 0.1);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("insufficient text"))
        );
    }

    #[tokio::test]
    async fn extraction_is_idempotent() {
        let pdf = pdf_with_text(&["Quarterly filing, Q2 2024. Total Revenue: $310,000."]);
        let cascade = text_only_cascade();
        let first = cascade.extract(&pdf, "q2.pdf").await;
        let second = cascade.extract(&pdf, "q2.pdf").await;
        assert_eq!(first.method, second.method);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.text, second.text);
    }

    #[tokio::test]
    async fn ocr_confidence_ignores_empty_pages() {
        // A real PDF whose text layer is too short, forcing OCR.
        let pdf = pdf_with_text(&["scan"]);
        // Enough words that the OCR candidate clears the win threshold.
        let filler = ["balance", "sheet", "statement", "operating", "activities",
            "depreciation", "amortization", "receivable", "payable", "equity"];
        let mut page_one = words(&filler.map(|w| (w, 80.0_f32)));
        page_one.extend(words(&[("smudge", 12.0)]));
        let mut page_three = words(&filler.map(|w| (w, 70.0_f32)));
        page_three.extend(words(&[("Revenue", 90.0)]));
        let recognizer = StubRecognizer::new(vec![
            page_one,
            // Page two: nothing above the word-confidence floor.
            words(&[("noise", 5.0), ("blur", 29.9)]),
            page_three,
        ]);
        let cascade = TextExtractionCascade::new(
            Arc::new(StubRasterizer { pages: 3 }),
            Arc::new(recognizer),
        );

        let result = cascade.extract(&pdf, "scan.pdf").await;
        assert_eq!(result.method, ExtractionMethod::Ocr);
        assert!(result.has_images);
        // Page averages: 80 and (70 * 10 + 90) / 11. Page two yielded no
        // text and is excluded from the document average.
        let expected = (80.0 + (70.0 * 10.0 + 90.0) / 11.0) / 2.0 / 100.0;
        assert!((result.confidence - expected).abs() < 1e-9);
        assert!(result.text.contains("Revenue"));
        assert!(!result.text.contains("smudge"));
        assert!(!result.text.contains("noise"));
    }

    #[tokio::test]
    async fn ocr_with_no_legible_words_reports_error() {
        let pdf = pdf_with_text(&["x"]);
        let cascade = TextExtractionCascade::new(
            Arc::new(StubRasterizer { pages: 2 }),
            Arc::new(StubRecognizer::new(vec![
                words(&[("??", 3.0)]),
                vec![],
            ])),
        );
        let result = cascade.extract(&pdf, "blank.pdf").await;
        // The one-character text layer is still the best candidate.
        assert!(result.errors.iter().any(|e| e.contains("OCR produced no text")));
        assert_eq!(result.confidence, 0.1);
    }
}
