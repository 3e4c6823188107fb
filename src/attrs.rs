//! Attribute schemas and extracted-value records.
//!
//! An attribute schema is a JSON file describing what to pull out of each
//! document. The records in this module are the pipeline's main currency:
//! they flow from the extractor through aggregation and consolidation to the
//! output writer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use tokio::fs;

use crate::{
    cascade::{ExtractionMethod, ExtractionResult},
    prelude::*,
};

/// Sub-factor weights for the confidence formula.
const WEIGHT_TEXT_CLARITY: f64 = 0.25;
const WEIGHT_EXACT_MATCH: f64 = 0.30;
const WEIGHT_CONTEXT_MATCH: f64 = 0.25;
const WEIGHT_FORMAT_VALIDITY: f64 = 0.20;

/// The expected type of an attribute's value.
///
/// Schemas in the wild contain type names we don't know. Those parse as
/// [`DataType::Text`] rather than failing the whole schema.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Currency,
    Number,
    Date,
    Percentage,
    #[default]
    #[serde(other)]
    Text,
}

impl DataType {
    /// A human-readable name, used when describing the attribute to the
    /// model.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Currency => "currency",
            DataType::Number => "number",
            DataType::Date => "date",
            DataType::Percentage => "percentage",
            DataType::Text => "text",
        }
    }
}

/// One attribute to extract from each document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct AttributeDef {
    /// The attribute's name, e.g. "Total Revenue".
    pub name: String,
    /// What the attribute means and where it's typically found.
    #[serde(default)]
    pub description: String,
    /// The expected value type.
    #[serde(default)]
    pub data_type: DataType,
    /// Should we treat a missing value as a problem?
    #[serde(default)]
    pub required: bool,
}

/// Load an attribute schema from a JSON file. Attribute order is preserved;
/// duplicate names are rejected.
pub async fn load_schema(path: &Path) -> Result<Vec<AttributeDef>> {
    let json = fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read schema file {:?}", path.display()))?;
    let schema = parse_schema(&json)
        .with_context(|| format!("invalid schema file {:?}", path.display()))?;
    Ok(schema)
}

fn parse_schema(json: &str) -> Result<Vec<AttributeDef>> {
    let schema: Vec<AttributeDef> =
        serde_json::from_str(json).context("cannot parse attribute list")?;
    if schema.is_empty() {
        return Err(anyhow!("schema contains no attributes"));
    }
    let mut seen = BTreeSet::new();
    for attr in &schema {
        if !seen.insert(attr.name.as_str()) {
            return Err(anyhow!("duplicate attribute name {:?}", attr.name));
        }
    }
    Ok(schema)
}

/// The four sub-factors behind an attribute confidence score.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default)]
pub struct ConfidenceBreakdown {
    /// How legible was the source text?
    pub text_clarity: f64,
    /// Was the value stated verbatim, or inferred?
    pub exact_match: f64,
    /// Did the surrounding context support the reading?
    pub context_match: f64,
    /// Does the value fit the attribute's declared type?
    pub format_validity: f64,
}

impl ConfidenceBreakdown {
    /// Clamp every sub-factor to [0, 1]. NaN becomes 0.
    pub fn clamped(&self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self {
            text_clarity: clamp(self.text_clarity),
            exact_match: clamp(self.exact_match),
            context_match: clamp(self.context_match),
            format_validity: clamp(self.format_validity),
        }
    }

    /// The weighted confidence score. Model-reported totals are never
    /// trusted; callers recompute confidence with this.
    pub fn weighted(&self) -> f64 {
        let c = self.clamped();
        WEIGHT_TEXT_CLARITY * c.text_clarity
            + WEIGHT_EXACT_MATCH * c.exact_match
            + WEIGHT_CONTEXT_MATCH * c.context_match
            + WEIGHT_FORMAT_VALIDITY * c.format_validity
    }
}

/// An extracted value for one attribute of one document.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default)]
pub struct AttributeValue {
    /// The extracted value, or `None` when the document doesn't state it.
    pub value: Option<Value>,
    /// Recomputed weighted confidence, 0.0 to 1.0.
    pub confidence: f64,
    /// The sub-factors behind `confidence`.
    pub confidence_breakdown: ConfidenceBreakdown,
    /// The text the value was read from, when the model quoted it.
    pub source_text: Option<String>,
    /// The model's explanation of how it arrived at the value.
    pub reasoning: Option<String>,
}

impl AttributeValue {
    /// A "nothing found" entry: null value, zero confidence.
    pub fn null() -> Self {
        Self::default()
    }
}

/// Bookkeeping for one document's attribute-extraction run.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default)]
pub struct ExtractionMetadata {
    /// When the extraction ran.
    pub processing_date: DateTime<Utc>,
    /// Document-level confidence: the mean of the per-attribute confidences.
    pub confidence_score: f64,
    /// How the document's text was obtained.
    pub extraction_method: ExtractionMethod,
    /// Set when attribute extraction failed and the attributes are
    /// placeholder nulls.
    pub error: Option<String>,
}

impl Default for ExtractionMetadata {
    fn default() -> Self {
        Self {
            processing_date: Utc::now(),
            confidence_score: 0.0,
            extraction_method: ExtractionMethod::default(),
            error: None,
        }
    }
}

/// Everything we know about one processed document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DocumentExtraction {
    /// The text-extraction outcome.
    pub extraction: ExtractionResult,
    /// One entry per schema attribute, keyed by attribute name. The key set
    /// always mirrors the schema exactly.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Run metadata. Serialized as `extraction_metadata`, which is what
    /// downstream consumers read.
    #[serde(rename = "extraction_metadata")]
    pub metadata: ExtractionMetadata,
}

impl DocumentExtraction {
    /// A placeholder for a document that failed outright: every schema
    /// attribute null at zero confidence, with the failure recorded in both
    /// the extraction errors and the metadata.
    pub fn failed(filename: &str, schema: &[AttributeDef], error: &str) -> Self {
        let extraction = ExtractionResult {
            filename: filename.to_owned(),
            errors: vec![error.to_owned()],
            ..Default::default()
        };
        let attributes = schema
            .iter()
            .map(|attr| (attr.name.clone(), AttributeValue::null()))
            .collect();
        let metadata = ExtractionMetadata {
            error: Some(error.to_owned()),
            ..Default::default()
        };
        Self {
            extraction,
            attributes,
            metadata,
        }
    }
}
