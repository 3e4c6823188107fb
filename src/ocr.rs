//! OCR support for scanned PDFs.
//!
//! We rasterize pages with Poppler's `pdftocairo` CLI tool and recognize text
//! with the `tesseract` CLI tool. Both live behind traits so that the
//! extraction cascade can be tested without either tool installed.

use std::{process::Output, sync::LazyLock, time::Duration};

use regex::Regex;
use tokio::{fs, process::Command};

use crate::prelude::*;

/// A regex matching error lines in command output.
static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler complains about damaged xref tables even when it recovers and
/// renders the document fine. Treat those as warnings.
static HARMLESS_ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of command output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_LINE.is_match(line) && !HARMLESS_ERROR_LINE.is_match(line)
}

/// Check whether a command succeeded, including commands which exit 0 but
/// print errors to stderr.
fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    check_stderr_lines: bool,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %String::from_utf8_lossy(&output.stdout),
        "Standard output from command"
    );
    if !stderr.is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if check_stderr_lines && stderr.lines().any(is_error_line) {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// A single recognized word, with the engine's confidence on a 0-100 scale.
#[derive(Clone, Debug, PartialEq)]
pub struct OcrWord {
    /// The recognized text.
    pub word: String,
    /// Engine confidence, 0-100.
    pub confidence: f32,
}

/// Render PDF pages to PNG images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Rasterize up to `max_pages` pages of `pdf` at `dpi`, returning one PNG
    /// per page, in page order.
    async fn rasterize(&self, pdf: &[u8], dpi: u32, max_pages: usize)
    -> Result<Vec<Vec<u8>>>;
}

/// Recognize the words in a page image.
#[async_trait]
pub trait OpticalRecognizer: Send + Sync {
    /// Recognize all words in a PNG image.
    async fn recognize(&self, png: &[u8]) -> Result<Vec<OcrWord>>;
}

/// A [`PageRasterizer`] wrapping Poppler's `pdftocairo` CLI tool.
#[non_exhaustive]
pub struct PdfToCairoRasterizer {}

impl PdfToCairoRasterizer {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PdfToCairoRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageRasterizer for PdfToCairoRasterizer {
    #[instrument(level = "debug", skip_all, fields(dpi, max_pages))]
    async fn rasterize(
        &self,
        pdf: &[u8],
        dpi: u32,
        max_pages: usize,
    ) -> Result<Vec<Vec<u8>>> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("rasterize")?;
        let input_path = tmpdir.path().join("input.pdf");
        fs::write(&input_path, pdf)
            .await
            .context("cannot write pdftocairo input file")?;

        // Run pdftocairo to convert the PDF to PNG files. It will add page
        // digits to the output filename, zero-padded so they sort lexically.
        let out_path = tmpdir.path().join("page");
        let output = Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-l")
            .arg(max_pages.to_string())
            .arg(&input_path)
            .arg(&out_path)
            .output()
            .await
            .context("cannot run pdftocairo (is poppler-utils installed?)")?;
        check_for_command_failure("pdftocairo", &output, true)?;

        // Collect the PNG files in page order.
        let mut paths = vec![];
        let mut entries = fs::read_dir(tmpdir.path())
            .await
            .context("cannot read rasterizer output directory")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("cannot read rasterizer output directory")?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "png") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut pages = vec![];
        for path in paths {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("cannot read {:?}", path.display()))?;
            pages.push(bytes);
        }
        Ok(pages)
    }
}

/// An [`OpticalRecognizer`] wrapping the `tesseract` CLI tool, using TSV
/// output so we get per-word confidence values.
pub struct TesseractRecognizer {
    /// How long to allow a single page to take.
    page_timeout: Duration,
}

impl TesseractRecognizer {
    pub fn new() -> Self {
        Self {
            page_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OpticalRecognizer for TesseractRecognizer {
    #[instrument(level = "debug", skip_all)]
    async fn recognize(&self, png: &[u8]) -> Result<Vec<OcrWord>> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_base = tmpdir.path().join("output");
        fs::write(&input_path, png)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file.
        let run = Command::new("tesseract")
            .arg(&input_path)
            .arg(&output_base)
            .arg("tsv")
            .output();
        let output = tokio::time::timeout(self.page_timeout, run)
            .await
            .map_err(|_| anyhow!("tesseract timed out"))?
            .context("cannot run tesseract (is it installed?)")?;
        check_for_command_failure("tesseract", &output, false)?;

        // Read and parse the TSV output.
        let tsv = fs::read_to_string(output_base.with_extension("tsv"))
            .await
            .context("cannot read tesseract output file")?;
        Ok(parse_tesseract_tsv(&tsv))
    }
}

/// Parse tesseract's TSV output into words.
///
/// Rows with a confidence of -1 describe layout structure (blocks, lines),
/// not words, and are skipped.
fn parse_tesseract_tsv(tsv: &str) -> Vec<OcrWord> {
    let mut words = vec![];
    for line in tsv.lines().skip(1) {
        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.len() < 12 {
            continue;
        }
        let Ok(confidence) = fields[10].parse::<f32>() else {
            continue;
        };
        let text = fields[11].trim();
        if confidence < 0.0 || text.is_empty() {
            continue;
        }
        words.push(OcrWord {
            word: text.to_owned(),
            confidence,
        });
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[test]
    fn tsv_parsing_skips_structural_rows() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
            1\t1\t0\t0\t0\t0\t0\t0\t612\t792\t-1\t\n\
            4\t1\t1\t1\t1\t0\t72\t72\t468\t14\t-1\t\n\
            5\t1\t1\t1\t1\t1\t72\t72\t60\t14\t96.5\tTotal\n\
            5\t1\t1\t1\t1\t2\t140\t72\t80\t14\t91.0\tRevenue\n\
            5\t1\t1\t1\t1\t3\t228\t72\t10\t14\t12.0\t~\n";
        let words = parse_tesseract_tsv(tsv);
        assert_eq!(words.len(), 3);
        assert_eq!(words[0].word, "Total");
        assert_eq!(words[0].confidence, 96.5);
        assert_eq!(words[2].confidence, 12.0);
    }

    #[test]
    fn tsv_parsing_skips_whitespace_only_words() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
            5\t1\t1\t1\t1\t1\t72\t72\t60\t14\t95.0\t \n";
        assert!(parse_tesseract_tsv(tsv).is_empty());
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils and tesseract to be installed"]
    async fn rasterize_and_recognize_roundtrip() -> Result<()> {
        let pdf = crate::testutil::pdf_with_text(&["Total Revenue: $1,000,000"]);
        let rasterizer = PdfToCairoRasterizer::new();
        let pages = rasterizer.rasterize(&pdf, 144, 10).await?;
        assert!(!pages.is_empty());
        let recognizer = TesseractRecognizer::new();
        let words = recognizer.recognize(&pages[0]).await?;
        assert!(!words.is_empty());
        Ok(())
    }
}
