//! Environment-based configuration.
//!
//! Configuration problems are fatal: we validate everything up front and
//! refuse to start, rather than failing halfway through a batch.

use crate::prelude::*;

/// Default model to use when `FINSIGHT_MODEL` is not set.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Where our documents live.
///
/// We support a single bucket with input/output prefixes, or (for older
/// deployments) two separate buckets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageConfig {
    /// One bucket holding both input and output objects, under prefixes.
    SingleBucket {
        bucket: String,
        input_prefix: String,
        output_prefix: String,
    },

    /// Separate input and output buckets.
    SeparateBuckets {
        input_bucket: String,
        output_bucket: String,
    },
}

impl StorageConfig {
    /// The location (`bucket` or `bucket/prefix`) to list and fetch PDFs from.
    pub fn input_location(&self) -> String {
        match self {
            StorageConfig::SingleBucket {
                bucket,
                input_prefix,
                ..
            } => format!("{bucket}/{input_prefix}"),
            StorageConfig::SeparateBuckets { input_bucket, .. } => input_bucket.clone(),
        }
    }

    /// The location to store extraction outputs in.
    pub fn output_location(&self) -> String {
        match self {
            StorageConfig::SingleBucket {
                bucket,
                output_prefix,
                ..
            } => format!("{bucket}/{output_prefix}"),
            StorageConfig::SeparateBuckets { output_bucket, .. } => output_bucket.clone(),
        }
    }
}

/// Application configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Storage configuration, if any was provided. Commands that talk to
    /// object storage fail fast when this is `None`.
    pub storage: Option<StorageConfig>,

    /// The model to use for attribute extraction.
    pub model: String,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Load configuration using a caller-supplied variable lookup. Split out
    /// from [`AppConfig::from_env`] so tests don't need to mutate the process
    /// environment.
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |name: &str| get(name).filter(|v| !v.trim().is_empty());

        let storage = if let Some(bucket) = non_empty("FINSIGHT_BUCKET") {
            Some(StorageConfig::SingleBucket {
                bucket,
                input_prefix: non_empty("FINSIGHT_INPUT_PREFIX")
                    .unwrap_or_else(|| "input".to_owned()),
                output_prefix: non_empty("FINSIGHT_OUTPUT_PREFIX")
                    .unwrap_or_else(|| "output".to_owned()),
            })
        } else {
            match (
                non_empty("FINSIGHT_INPUT_BUCKET"),
                non_empty("FINSIGHT_OUTPUT_BUCKET"),
            ) {
                (Some(input_bucket), Some(output_bucket)) => {
                    Some(StorageConfig::SeparateBuckets {
                        input_bucket,
                        output_bucket,
                    })
                }
                (None, None) => None,
                (Some(_), None) => {
                    return Err(anyhow!(
                        "FINSIGHT_INPUT_BUCKET is set but FINSIGHT_OUTPUT_BUCKET is not"
                    ));
                }
                (None, Some(_)) => {
                    return Err(anyhow!(
                        "FINSIGHT_OUTPUT_BUCKET is set but FINSIGHT_INPUT_BUCKET is not"
                    ));
                }
            }
        };
        if storage.is_none() {
            warn!("no object storage configured (set FINSIGHT_BUCKET)");
        }

        let model = non_empty("FINSIGHT_MODEL").unwrap_or_else(|| {
            info!("FINSIGHT_MODEL not set, using default: {}", DEFAULT_MODEL);
            DEFAULT_MODEL.to_owned()
        });

        Ok(Self { storage, model })
    }

    /// Get our storage configuration, or fail with an actionable error.
    pub fn storage_required(&self) -> Result<&StorageConfig> {
        self.storage.as_ref().ok_or_else(|| {
            anyhow!(
                "no object storage configured: set FINSIGHT_BUCKET (plus optional \
                 FINSIGHT_INPUT_PREFIX/FINSIGHT_OUTPUT_PREFIX), or \
                 FINSIGHT_INPUT_BUCKET and FINSIGHT_OUTPUT_BUCKET, or pass --local-root"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn single_bucket_mode_with_default_prefixes() {
        let get = lookup(&[("FINSIGHT_BUCKET", "statements")]);
        let config = AppConfig::from_lookup(&get).unwrap();
        let storage = config.storage.unwrap();
        assert_eq!(storage.input_location(), "statements/input");
        assert_eq!(storage.output_location(), "statements/output");
    }

    #[test]
    fn separate_bucket_mode() {
        let get = lookup(&[
            ("FINSIGHT_INPUT_BUCKET", "statements-in"),
            ("FINSIGHT_OUTPUT_BUCKET", "statements-out"),
        ]);
        let config = AppConfig::from_lookup(&get).unwrap();
        let storage = config.storage.unwrap();
        assert_eq!(storage.input_location(), "statements-in");
        assert_eq!(storage.output_location(), "statements-out");
    }

    #[test]
    fn half_configured_buckets_are_fatal() {
        let get = lookup(&[("FINSIGHT_INPUT_BUCKET", "statements-in")]);
        assert!(AppConfig::from_lookup(&get).is_err());
    }

    #[test]
    fn missing_storage_is_allowed_until_required() {
        let get = lookup(&[("FINSIGHT_MODEL", "gpt-4.1")]);
        let config = AppConfig::from_lookup(&get).unwrap();
        assert_eq!(config.model, "gpt-4.1");
        assert!(config.storage.is_none());
        assert!(config.storage_required().is_err());
    }
}
