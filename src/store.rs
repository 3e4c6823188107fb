//! Blob storage for input documents and saved reports.
//!
//! A "location" is either a bare bucket name or `bucket/prefix`. The
//! [`LocalStore`] maps the same shape onto a directory tree, which keeps
//! offline runs and tests honest.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client, presigning::PresigningConfig, primitives::ByteStream,
};
use chrono::{DateTime, TimeZone, Utc};
use tokio::fs;

use crate::prelude::*;

/// Refuse to download objects larger than this.
const MAX_FETCH_BYTES: i64 = 100 * 1024 * 1024;

/// How long presigned download links stay valid.
const PRESIGN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// One stored object.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobEntry {
    /// The object's key. Valid as a `fetch` argument for the same location.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last-modified time, when the backend reports one.
    pub modified: Option<DateTime<Utc>>,
}

/// Where documents and reports live.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List the PDF objects at `location`, newest first.
    async fn list(&self, location: &str) -> Result<Vec<BlobEntry>>;

    /// Download one object. `key` is a key previously returned by `list` for
    /// this location.
    async fn fetch(&self, location: &str, key: &str) -> Result<Vec<u8>>;

    /// Store bytes under `location`/`key`, returning a locator string for
    /// logs and manifests.
    async fn store(
        &self,
        location: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String>;

    /// A time-limited download URL for a stored object, where the backend
    /// supports one.
    async fn presign(&self, location: &str, key: &str) -> Result<Option<String>>;
}

/// Split a location into bucket and optional key prefix.
fn split_location(location: &str) -> (&str, Option<&str>) {
    match location.split_once('/') {
        Some((bucket, prefix)) if !prefix.is_empty() => (bucket, Some(prefix)),
        Some((bucket, _)) => (bucket, None),
        None => (location, None),
    }
}

/// Join an optional prefix and a key.
fn prefixed_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_owned(),
    }
}

fn is_pdf_key(key: &str) -> bool {
    key.to_ascii_lowercase().ends_with(".pdf")
}

/// Sort newest first. Objects without a modification time sort last.
fn sort_newest_first(entries: &mut [BlobEntry]) {
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.key.cmp(&b.key)));
}

/// A [`BlobStore`] backed by S3.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Create a store using the default AWS credential chain.
    pub async fn new() -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
        Ok(Self {
            client: Client::new(&config),
        })
    }
}

#[async_trait]
impl BlobStore for S3Store {
    #[instrument(level = "debug", skip(self))]
    async fn list(&self, location: &str) -> Result<Vec<BlobEntry>> {
        let (bucket, prefix) = split_location(location);
        let mut request = self.client.list_objects_v2().bucket(bucket);
        if let Some(prefix) = prefix {
            request = request.prefix(format!("{}/", prefix.trim_end_matches('/')));
        }

        let mut entries = vec![];
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page =
                page.with_context(|| format!("cannot list s3://{location}"))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if !is_pdf_key(key) {
                    continue;
                }
                entries.push(BlobEntry {
                    key: key.to_owned(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified: object.last_modified().and_then(|t| {
                        Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single()
                    }),
                });
            }
        }
        sort_newest_first(&mut entries);
        Ok(entries)
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, location: &str, key: &str) -> Result<Vec<u8>> {
        let (bucket, _) = split_location(location);
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("cannot stat s3://{bucket}/{key}"))?;
        if let Some(size) = head.content_length()
            && size > MAX_FETCH_BYTES
        {
            return Err(anyhow!(
                "s3://{bucket}/{key} is {size} bytes, over the {MAX_FETCH_BYTES} byte limit"
            ));
        }

        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("cannot download s3://{bucket}/{key}"))?;
        let bytes = object
            .body
            .collect()
            .await
            .with_context(|| format!("cannot read body of s3://{bucket}/{key}"))?;
        Ok(bytes.into_bytes().to_vec())
    }

    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    async fn store(
        &self,
        location: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        let (bucket, prefix) = split_location(location);
        let full_key = prefixed_key(prefix, key);
        self.client
            .put_object()
            .bucket(bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .with_context(|| format!("cannot upload s3://{bucket}/{full_key}"))?;
        Ok(format!("s3://{bucket}/{full_key}"))
    }

    #[instrument(level = "debug", skip(self))]
    async fn presign(&self, location: &str, key: &str) -> Result<Option<String>> {
        let (bucket, prefix) = split_location(location);
        let full_key = prefixed_key(prefix, key);
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(&full_key)
            .presigned(
                PresigningConfig::expires_in(PRESIGN_EXPIRY)
                    .context("invalid presign expiry")?,
            )
            .await
            .with_context(|| format!("cannot presign s3://{bucket}/{full_key}"))?;
        Ok(Some(presigned.uri().to_string()))
    }
}

/// A [`BlobStore`] backed by a local directory tree.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, location: &str) -> PathBuf {
        let (bucket, prefix) = split_location(location);
        let mut dir = self.root.join(bucket);
        if let Some(prefix) = prefix {
            dir = dir.join(prefix);
        }
        dir
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn list(&self, location: &str) -> Result<Vec<BlobEntry>> {
        let dir = self.dir(location);
        let mut entries = vec![];
        let mut read_dir = fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot list {:?}", dir.display()))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("cannot list {:?}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_pdf_key(&name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .with_context(|| format!("cannot stat {:?}", entry.path().display()))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            entries.push(BlobEntry {
                key: name,
                size: metadata.len(),
                modified,
            });
        }
        sort_newest_first(&mut entries);
        Ok(entries)
    }

    async fn fetch(&self, location: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.dir(location).join(key);
        fs::read(&path)
            .await
            .with_context(|| format!("cannot read {:?}", path.display()))
    }

    async fn store(
        &self,
        location: &str,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String> {
        let path = self.dir(location).join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {:?}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("cannot write {:?}", path.display()))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn presign(&self, _location: &str, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
