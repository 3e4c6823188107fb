//! Multi-year consolidation.
//!
//! Groups extracted documents by reporting year, rolls flow fields up as
//! sums and stock fields as means, and derives a year-over-year percent
//! change series. Everything is BTreeMap-based, so the output is
//! deterministic and independent of input order.

use std::collections::BTreeMap;

use regex::Regex;
use schemars::JsonSchema;
use std::sync::LazyLock;

use crate::{attrs::DocumentExtraction, prelude::*};

/// The attribute that carries the reporting year.
pub const YEAR_ATTRIBUTE: &str = "Report Year";

/// The attribute that carries the reporting quarter, when present.
pub const QUARTER_ATTRIBUTE: &str = "Report Quarter";

/// A 4-digit year embedded in a longer string, e.g. "FY2023".
static EMBEDDED_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(19|20)\d{2}").expect("failed to compile regex"));

/// Which fields to sum and which to average when rolling up a year.
///
/// Flow quantities (revenue, income) add across statements; stock
/// quantities (assets, liabilities) are snapshots and are averaged instead.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ConsolidationConfig {
    pub summed_fields: Vec<String>,
    pub averaged_fields: Vec<String>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            summed_fields: vec!["Total Revenue".to_owned(), "Net Income".to_owned()],
            averaged_fields: vec![
                "Total Assets".to_owned(),
                "Total Liabilities".to_owned(),
            ],
        }
    }
}

/// Field name to rolled-up value, for one year or quarter.
pub type FieldValues = BTreeMap<String, f64>;

/// The result of consolidating a batch.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Consolidation {
    /// Fewer than two distinct reporting years; trend analysis is not
    /// meaningful.
    InsufficientData { distinct_years: usize },
    Report {
        /// Rolled-up values per year.
        yearly: BTreeMap<i64, FieldValues>,
        /// Percent change versus the previous year. The earliest year has
        /// no predecessor and does not appear; a field whose previous value
        /// was zero is omitted for that year.
        year_over_year: BTreeMap<i64, FieldValues>,
        /// Rolled-up values per "YYYY-Qn" key. Present only when at least
        /// one document carried quarter data.
        #[serde(skip_serializing_if = "Option::is_none")]
        quarterly: Option<BTreeMap<String, FieldValues>>,
    },
}

/// Rolls batches up into yearly and quarterly views.
#[derive(Clone, Debug, Default)]
pub struct ConsolidationEngine {
    config: ConsolidationConfig,
}

impl ConsolidationEngine {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    /// Consolidate a batch. Documents without a coercible year are excluded.
    #[instrument(level = "debug", skip_all, fields(documents = docs.len()))]
    pub fn consolidate(&self, docs: &[DocumentExtraction]) -> Consolidation {
        let mut by_year: BTreeMap<i64, Vec<&DocumentExtraction>> = BTreeMap::new();
        for doc in docs {
            let Some(year) = attribute_value(doc, YEAR_ATTRIBUTE).and_then(coerce_year)
            else {
                debug!(
                    filename = %doc.extraction.filename,
                    "no usable reporting year, excluded from consolidation"
                );
                continue;
            };
            by_year.entry(year).or_default().push(doc);
        }

        if by_year.len() < 2 {
            return Consolidation::InsufficientData {
                distinct_years: by_year.len(),
            };
        }

        let yearly: BTreeMap<i64, FieldValues> = by_year
            .iter()
            .map(|(year, docs)| (*year, self.roll_up(docs)))
            .collect();
        let year_over_year = year_over_year(&yearly);
        let quarterly = self.quarterly(docs);

        Consolidation::Report {
            yearly,
            year_over_year,
            quarterly,
        }
    }

    /// Sum the flow fields and average the stock fields over a group.
    fn roll_up(&self, docs: &[&DocumentExtraction]) -> FieldValues {
        let mut values = FieldValues::new();
        for field in &self.config.summed_fields {
            let found = field_values(docs, field);
            if !found.is_empty() {
                values.insert(field.clone(), found.iter().sum());
            }
        }
        for field in &self.config.averaged_fields {
            let found = field_values(docs, field);
            if !found.is_empty() {
                values.insert(
                    field.clone(),
                    found.iter().sum::<f64>() / found.len() as f64,
                );
            }
        }
        values
    }

    fn quarterly(
        &self,
        docs: &[DocumentExtraction],
    ) -> Option<BTreeMap<String, FieldValues>> {
        let mut by_quarter: BTreeMap<String, Vec<&DocumentExtraction>> = BTreeMap::new();
        for doc in docs {
            let year = attribute_value(doc, YEAR_ATTRIBUTE).and_then(coerce_year);
            let quarter = attribute_value(doc, QUARTER_ATTRIBUTE).and_then(coerce_quarter);
            if let (Some(year), Some(quarter)) = (year, quarter) {
                by_quarter
                    .entry(format!("{year}-Q{quarter}"))
                    .or_default()
                    .push(doc);
            }
        }
        if by_quarter.is_empty() {
            return None;
        }
        Some(
            by_quarter
                .iter()
                .map(|(key, docs)| (key.clone(), self.roll_up(docs)))
                .collect(),
        )
    }
}

/// Percent change between consecutive years, per field.
fn year_over_year(yearly: &BTreeMap<i64, FieldValues>) -> BTreeMap<i64, FieldValues> {
    let mut changes = BTreeMap::new();
    let years = yearly.keys().copied().collect::<Vec<_>>();
    for pair in years.windows(2) {
        let (prev_year, year) = (pair[0], pair[1]);
        let mut fields = FieldValues::new();
        for (field, value) in &yearly[&year] {
            let Some(prev) = yearly[&prev_year].get(field) else {
                continue;
            };
            if *prev == 0.0 {
                // No defined percent change from a zero base.
                continue;
            }
            fields.insert(field.clone(), (value - prev) / prev * 100.0);
        }
        changes.insert(year, fields);
    }
    changes
}

fn attribute_value<'a>(doc: &'a DocumentExtraction, name: &str) -> Option<&'a Value> {
    doc.attributes.get(name)?.value.as_ref()
}

fn field_values(docs: &[&DocumentExtraction], field: &str) -> Vec<f64> {
    docs.iter()
        .filter_map(|doc| attribute_value(doc, field))
        .filter_map(numeric_value)
        .collect()
}

/// Coerce a reporting-year value to an integer year. Accepts numbers,
/// numeric strings, and 4-digit years embedded in strings like "FY2023".
fn coerce_year(value: &Value) -> Option<i64> {
    let year = if let Some(year) = value.as_i64() {
        year
    } else if let Some(s) = value.as_str() {
        let s = s.trim();
        match s.parse::<i64>() {
            Ok(year) => year,
            Err(_) => EMBEDDED_YEAR.find(s)?.as_str().parse().ok()?,
        }
    } else {
        return None;
    };
    (1900..2100).contains(&year).then_some(year)
}

/// Coerce a quarter value: 1-4 as a number, "3", or "Q3".
fn coerce_quarter(value: &Value) -> Option<u8> {
    let quarter = if let Some(q) = value.as_i64() {
        q
    } else if let Some(s) = value.as_str() {
        let s = s.trim();
        let s = s.strip_prefix(['Q', 'q']).unwrap_or(s);
        s.parse::<i64>().ok()?
    } else {
        return None;
    };
    (1..=4).contains(&quarter).then_some(quarter as u8)
}

/// Parse a numeric attribute value, tolerating currency formatting:
/// "$1,500,000", "12.5%", and accountant's "(2,000)" negatives.
fn numeric_value(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    let (s, negative) = match s.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (inner, true),
        None => (s, false),
    };
    let cleaned = s
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '%' | ' '))
        .collect::<String>();
    let n = cleaned.parse::<f64>().ok()?;
    Some(if negative { -n } else { n })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        attrs::{AttributeValue, ExtractionMetadata},
        cascade::ExtractionResult,
    };

    fn doc(fields: &[(&str, Value)]) -> DocumentExtraction {
        let attributes = fields
            .iter()
            .map(|(name, value)| {
                (
                    (*name).to_owned(),
                    AttributeValue {
                        value: Some(value.clone()),
                        confidence: 0.9,
                        ..Default::default()
                    },
                )
            })
            .collect();
        DocumentExtraction {
            extraction: ExtractionResult::default(),
            attributes,
            metadata: ExtractionMetadata::default(),
        }
    }

    fn three_year_batch() -> Vec<DocumentExtraction> {
        vec![
            doc(&[("Report Year", json!(2021)), ("Total Revenue", json!(100))]),
            doc(&[("Report Year", json!("FY2022")), ("Total Revenue", json!("150"))]),
            doc(&[("Report Year", json!("2023")), ("Total Revenue", json!("$120"))]),
        ]
    }

    #[test]
    fn year_over_year_series_skips_earliest_year() {
        let engine = ConsolidationEngine::default();
        let Consolidation::Report {
            yearly,
            year_over_year,
            quarterly,
        } = engine.consolidate(&three_year_batch())
        else {
            panic!("expected a report");
        };

        assert_eq!(yearly[&2021]["Total Revenue"], 100.0);
        assert_eq!(yearly[&2022]["Total Revenue"], 150.0);
        assert_eq!(yearly[&2023]["Total Revenue"], 120.0);

        assert!(!year_over_year.contains_key(&2021));
        assert!((year_over_year[&2022]["Total Revenue"] - 50.0).abs() < 1e-9);
        assert!((year_over_year[&2023]["Total Revenue"] - -20.0).abs() < 1e-9);
        assert!(quarterly.is_none());
    }

    #[test]
    fn consolidation_is_order_independent_and_idempotent() {
        let engine = ConsolidationEngine::default();
        let mut reversed = three_year_batch();
        reversed.reverse();
        let a = engine.consolidate(&three_year_batch());
        let b = engine.consolidate(&reversed);
        let c = engine.consolidate(&three_year_batch());
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn fewer_than_two_years_is_insufficient() {
        let engine = ConsolidationEngine::default();
        let docs = vec![
            doc(&[("Report Year", json!(2023)), ("Total Revenue", json!(100))]),
            doc(&[("Report Year", json!(2023)), ("Total Revenue", json!(200))]),
            doc(&[("Report Year", json!("unknown"))]),
        ];
        assert_eq!(
            engine.consolidate(&docs),
            Consolidation::InsufficientData { distinct_years: 1 }
        );
    }

    #[test]
    fn zero_base_year_has_no_defined_change() {
        let engine = ConsolidationEngine::default();
        let docs = vec![
            doc(&[("Report Year", json!(2021)), ("Total Revenue", json!(0))]),
            doc(&[("Report Year", json!(2022)), ("Total Revenue", json!(100))]),
        ];
        let Consolidation::Report { year_over_year, .. } = engine.consolidate(&docs)
        else {
            panic!("expected a report");
        };
        assert!(!year_over_year[&2022].contains_key("Total Revenue"));
    }

    #[test]
    fn flow_fields_sum_and_stock_fields_average() {
        let engine = ConsolidationEngine::default();
        let docs = vec![
            doc(&[
                ("Report Year", json!(2022)),
                ("Total Revenue", json!(100)),
                ("Total Assets", json!(1000)),
            ]),
            doc(&[
                ("Report Year", json!(2022)),
                ("Total Revenue", json!(200)),
                ("Total Assets", json!(2000)),
            ]),
            doc(&[("Report Year", json!(2023)), ("Total Revenue", json!(50))]),
        ];
        let Consolidation::Report { yearly, .. } = engine.consolidate(&docs) else {
            panic!("expected a report");
        };
        assert_eq!(yearly[&2022]["Total Revenue"], 300.0);
        assert_eq!(yearly[&2022]["Total Assets"], 1500.0);
        assert!(!yearly[&2023].contains_key("Total Assets"));
    }

    #[test]
    fn quarterly_grouping_appears_only_with_quarter_data() {
        let engine = ConsolidationEngine::default();
        let docs = vec![
            doc(&[
                ("Report Year", json!(2022)),
                ("Report Quarter", json!("Q1")),
                ("Total Revenue", json!(100)),
            ]),
            doc(&[
                ("Report Year", json!(2022)),
                ("Report Quarter", json!(1)),
                ("Total Revenue", json!(50)),
            ]),
            doc(&[("Report Year", json!(2023)), ("Total Revenue", json!(80))]),
        ];
        let Consolidation::Report { quarterly, .. } = engine.consolidate(&docs) else {
            panic!("expected a report");
        };
        let quarterly = quarterly.unwrap();
        assert_eq!(quarterly["2022-Q1"]["Total Revenue"], 150.0);
    }

    #[test]
    fn year_and_quarter_coercion() {
        assert_eq!(coerce_year(&json!(2023)), Some(2023));
        assert_eq!(coerce_year(&json!("2023")), Some(2023));
        assert_eq!(coerce_year(&json!("FY2023")), Some(2023));
        assert_eq!(coerce_year(&json!("fiscal year 1999 (audited)")), Some(1999));
        assert_eq!(coerce_year(&json!("203")), None);
        assert_eq!(coerce_year(&json!(12)), None);
        assert_eq!(coerce_year(&json!(null)), None);

        assert_eq!(coerce_quarter(&json!(3)), Some(3));
        assert_eq!(coerce_quarter(&json!("3")), Some(3));
        assert_eq!(coerce_quarter(&json!("Q4")), Some(4));
        assert_eq!(coerce_quarter(&json!("q2")), Some(2));
        assert_eq!(coerce_quarter(&json!(5)), None);
        assert_eq!(coerce_quarter(&json!("H1")), None);
    }

    #[test]
    fn numeric_values_tolerate_currency_formatting() {
        assert_eq!(numeric_value(&json!(1500000)), Some(1500000.0));
        assert_eq!(numeric_value(&json!("$1,500,000")), Some(1500000.0));
        assert_eq!(numeric_value(&json!("12.5%")), Some(12.5));
        assert_eq!(numeric_value(&json!("(2,000)")), Some(-2000.0));
        assert_eq!(numeric_value(&json!("n/a")), None);
    }
}
