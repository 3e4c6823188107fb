//! Batch quality reporting.
//!
//! After a batch runs, we summarize how trustworthy the results are: a
//! quality band per document, and min/avg/max confidence statistics per
//! attribute, broken down by the four confidence sub-factors.

use std::collections::BTreeMap;

use schemars::JsonSchema;

use crate::{
    attrs::{AttributeDef, AttributeValue, DocumentExtraction},
    cascade::ExtractionMethod,
    prelude::*,
};

/// Documents at or above this confidence are "high" quality.
const HIGH_QUALITY_THRESHOLD: f64 = 0.8;

/// Documents at or above this confidence are "medium" quality.
const MEDIUM_QUALITY_THRESHOLD: f64 = 0.6;

/// A document counts as a successful extraction above this confidence.
const SUCCESS_THRESHOLD: f64 = 0.5;

/// Coarse quality rating for one document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    High,
    Medium,
    Low,
}

impl QualityBand {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= HIGH_QUALITY_THRESHOLD {
            QualityBand::High
        } else if confidence >= MEDIUM_QUALITY_THRESHOLD {
            QualityBand::Medium
        } else {
            QualityBand::Low
        }
    }
}

/// Min/avg/max over a non-empty sample set.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Stats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl Stats {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            avg: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Statistics over the documents where an attribute was actually found.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AttributeStatBlock {
    pub confidence: Stats,
    pub text_clarity: Stats,
    pub exact_match: Stats,
    pub context_match: Stats,
    pub format_validity: Stats,
}

/// Per-attribute quality. `samples: 0` with no stat block is the defined
/// no-data state, not an error.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AttributeStats {
    /// How many documents yielded a non-null value for this attribute.
    pub samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<AttributeStatBlock>,
}

/// One document's line in the quality report.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DocumentQuality {
    pub filename: String,
    pub confidence: f64,
    pub quality: QualityBand,
    pub successful: bool,
    pub extraction_method: ExtractionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The quality report for one batch.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct BatchSummary {
    pub document_count: usize,
    pub successful_extractions: usize,
    pub failed_extractions: usize,
    pub average_confidence: f64,
    pub documents: Vec<DocumentQuality>,
    /// Keyed by schema attribute name, every schema attribute present.
    pub attributes: BTreeMap<String, AttributeStats>,
}

/// Summarize a finished batch against its schema.
pub fn summarize_batch(
    docs: &[DocumentExtraction],
    schema: &[AttributeDef],
) -> BatchSummary {
    let documents = docs
        .iter()
        .map(|doc| {
            let confidence = doc.metadata.confidence_score;
            DocumentQuality {
                filename: doc.extraction.filename.clone(),
                confidence,
                quality: QualityBand::from_confidence(confidence),
                successful: confidence > SUCCESS_THRESHOLD,
                extraction_method: doc.metadata.extraction_method,
                error: doc.metadata.error.clone(),
            }
        })
        .collect::<Vec<_>>();

    let successful_extractions = documents.iter().filter(|d| d.successful).count();
    let average_confidence = if documents.is_empty() {
        0.0
    } else {
        documents.iter().map(|d| d.confidence).sum::<f64>() / documents.len() as f64
    };

    let attributes = schema
        .iter()
        .map(|attr| {
            let found = docs
                .iter()
                .filter_map(|doc| doc.attributes.get(&attr.name))
                .filter(|value| value.value.is_some())
                .collect::<Vec<_>>();
            (attr.name.clone(), attribute_stats(&found))
        })
        .collect();

    BatchSummary {
        document_count: docs.len(),
        successful_extractions,
        failed_extractions: docs.len() - successful_extractions,
        average_confidence,
        documents,
        attributes,
    }
}

fn attribute_stats(found: &[&AttributeValue]) -> AttributeStats {
    let collect = |f: fn(&AttributeValue) -> f64| {
        found.iter().map(|v| f(v)).collect::<Vec<_>>()
    };
    let stats = (|| {
        Some(AttributeStatBlock {
            confidence: Stats::from_values(&collect(|v| v.confidence))?,
            text_clarity: Stats::from_values(
                &collect(|v| v.confidence_breakdown.text_clarity),
            )?,
            exact_match: Stats::from_values(
                &collect(|v| v.confidence_breakdown.exact_match),
            )?,
            context_match: Stats::from_values(
                &collect(|v| v.confidence_breakdown.context_match),
            )?,
            format_validity: Stats::from_values(
                &collect(|v| v.confidence_breakdown.format_validity),
            )?,
        })
    })();
    AttributeStats {
        samples: found.len(),
        stats,
    }
}
