//! Attribute extraction over a chat model.
//!
//! Given a document's text and an attribute schema, we build a prompt, run
//! the model once, and normalize whatever comes back into a fully-populated
//! attribute map. Like the cascade, this never fails: a model or parse
//! problem produces a placeholder result with the error recorded.

use std::{collections::BTreeMap, sync::Arc};

use handlebars::Handlebars;
use serde_json::json;

use crate::{
    attrs::{
        AttributeDef, AttributeValue, ConfidenceBreakdown, ExtractionMetadata,
    },
    model::GenerativeModel,
    prelude::*,
};

/// Document text is truncated to this many characters before submission, to
/// stay inside model context limits.
const TEXT_BUDGET_CHARS: usize = 8000;

/// Maximum completion tokens per extraction call.
const MAX_COMPLETION_TOKENS: u32 = 2000;

/// Extraction runs nearly deterministic.
const TEMPERATURE: f32 = 0.1;

/// System prompt. The JSON example keeps braces on separate lines so the
/// template never contains a literal `{{`.
const SYSTEM_TEMPLATE: &str = "\
You are a financial document analysis expert. Your task is to extract specific financial attributes from document text.

Extract the following attributes:
{{#each attributes}}
- {{name}}: {{description}} (Type: {{data_type}}, Required: {{required}})
{{/each}}

Return the results in this exact JSON format:
{
  \"extracted_attributes\": {
    \"attribute_name\": {
      \"value\": \"extracted_value_or_null\",
      \"confidence\": 0.95,
      \"confidence_breakdown\": {
        \"text_clarity\": 0.95,
        \"exact_match\": 0.90,
        \"context_match\": 0.98,
        \"format_validity\": 0.92
      },
      \"source_text\": \"relevant_text_snippet\",
      \"extraction_reasoning\": \"Brief explanation of why this value was selected\"
    }
  }
}

CONFIDENCE SCORING GUIDELINES:

For each attribute, calculate confidence based on these factors:

1. TEXT_CLARITY (0.0-1.0): How clear and readable is the source text?
2. EXACT_MATCH (0.0-1.0): How well does the found text match the attribute description?
3. CONTEXT_MATCH (0.0-1.0): Is the value found in the right context/section?
4. FORMAT_VALIDITY (0.0-1.0): Is the extracted value in the expected format?

OVERALL CONFIDENCE CALCULATION:
confidence = (text_clarity * 0.25) + (exact_match * 0.30) + (context_match * 0.25) + (format_validity * 0.20)

EXTRACTION GUIDELINES:
- For currency values, extract numbers only (no currency symbols)
- For dates, use YYYY-MM-DD format
- If an attribute cannot be found, set value to null and confidence to 0
- Always provide confidence scores between 0 and 1
- Include relevant source text snippets for verification
- Provide brief reasoning for each extraction
";

/// User prompt.
const USER_TEMPLATE: &str = "\
Please analyze the following financial document text and extract the requested attributes.
Return the results in JSON format with the exact attribute names as keys.
If an attribute cannot be found, set its value to null and confidence to 0.

Financial Document Text:
{{text}}
";

/// Extracts schema attributes from document text via a [`GenerativeModel`].
pub struct AttributeExtractor {
    model: Arc<dyn GenerativeModel>,
    handlebars: Handlebars<'static>,
}

impl AttributeExtractor {
    pub fn new(model: Arc<dyn GenerativeModel>) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("system", SYSTEM_TEMPLATE)
            .context("error in system prompt template")?;
        handlebars
            .register_template_string("user", USER_TEMPLATE)
            .context("error in user prompt template")?;
        Ok(Self { model, handlebars })
    }

    /// Extract all schema attributes from `text`. Never errors: failures
    /// yield a null-filled attribute map with `metadata.error` set.
    #[instrument(level = "debug", skip_all, fields(text_len = text.len()))]
    pub async fn extract(
        &self,
        text: &str,
        schema: &[AttributeDef],
    ) -> (BTreeMap<String, AttributeValue>, ExtractionMetadata) {
        match self.try_extract(text, schema).await {
            Ok(attributes) => {
                let confidence_score = mean_confidence(&attributes);
                let metadata = ExtractionMetadata {
                    confidence_score,
                    ..Default::default()
                };
                (attributes, metadata)
            }
            Err(err) => {
                error!("attribute extraction failed: {err:#}");
                fallback(schema, &format!("{err:#}"))
            }
        }
    }

    async fn try_extract(
        &self,
        text: &str,
        schema: &[AttributeDef],
    ) -> Result<BTreeMap<String, AttributeValue>> {
        let truncated = text.chars().take(TEXT_BUDGET_CHARS).collect::<String>();
        let system = self
            .handlebars
            .render("system", &json!({ "attributes": schema }))
            .context("error rendering system prompt")?;
        let user = self
            .handlebars
            .render("user", &json!({ "text": truncated }))
            .context("error rendering user prompt")?;

        let reply = self
            .model
            .invoke(&system, &user, MAX_COMPLETION_TOKENS, TEMPERATURE)
            .await?;
        let parsed = parse_model_json(&reply)?;
        Ok(normalize(&parsed, schema))
    }
}

/// Parse the model's reply as JSON: strict first, then recover a JSON object
/// embedded in surrounding prose.
fn parse_model_json(reply: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(reply) {
        return Ok(value);
    }
    let start = reply.find('{');
    let end = reply.rfind('}');
    if let (Some(start), Some(end)) = (start, end)
        && start < end
    {
        serde_json::from_str(&reply[start..=end])
            .context("model reply contained malformed JSON")
    } else {
        Err(anyhow!("model reply contained no JSON object"))
    }
}

/// Normalize the parsed reply into exactly one entry per schema attribute.
///
/// Self-reported confidence totals are untrusted: we clamp the sub-factors
/// and recompute every confidence with the fixed weighted formula. Values
/// are accepted only as strings or numbers.
fn normalize(parsed: &Value, schema: &[AttributeDef]) -> BTreeMap<String, AttributeValue> {
    let root = parsed
        .get("extracted_attributes")
        .filter(|v| v.is_object())
        .unwrap_or(parsed);

    let mut attributes = BTreeMap::new();
    for attr in schema {
        let entry = root.get(&attr.name);
        attributes.insert(attr.name.clone(), normalize_entry(entry));
    }
    attributes
}

fn normalize_entry(entry: Option<&Value>) -> AttributeValue {
    let Some(entry) = entry else {
        return AttributeValue::null();
    };

    let value = entry
        .get("value")
        .filter(|v| v.is_string() || v.is_number())
        .cloned();
    let confidence_breakdown = entry
        .get("confidence_breakdown")
        .and_then(|v| {
            serde_json::from_value::<ConfidenceBreakdown>(v.clone()).ok()
        })
        .unwrap_or_default()
        .clamped();
    let string_field = |name: &str| {
        entry
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };

    AttributeValue {
        value,
        confidence: confidence_breakdown.weighted(),
        confidence_breakdown,
        source_text: string_field("source_text"),
        reasoning: string_field("extraction_reasoning").or_else(|| string_field("reasoning")),
    }
}

/// The mean per-attribute confidence, or 0.0 for an empty map.
fn mean_confidence(attributes: &BTreeMap<String, AttributeValue>) -> f64 {
    if attributes.is_empty() {
        return 0.0;
    }
    attributes.values().map(|v| v.confidence).sum::<f64>() / attributes.len() as f64
}

/// A null-filled result for when the model call or parse failed.
fn fallback(
    schema: &[AttributeDef],
    error: &str,
) -> (BTreeMap<String, AttributeValue>, ExtractionMetadata) {
    let attributes = schema
        .iter()
        .map(|attr| (attr.name.clone(), AttributeValue::null()))
        .collect();
    let metadata = ExtractionMetadata {
        error: Some(error.to_owned()),
        ..Default::default()
    };
    (attributes, metadata)
}
