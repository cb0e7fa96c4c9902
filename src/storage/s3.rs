//! S3 backend (also serves R2 through a custom endpoint)

use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator, Scheme};
use crate::storage::{
    decode_mtime, encode_mtime, r2, ByteStream, LockState, LockToken, LockingStore, ObjectStore,
    MTIME_METADATA_KEY,
};
use crate::transfer::{self, LocalSource};
use crate::types::{Attributes, Checksum, Resource};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{ChecksumAlgorithm, ChecksumMode};
use aws_sdk_s3::Client;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;

/// Concurrent HEAD requests while listing
const HEAD_CONCURRENCY: usize = 32;

/// S3 (or S3-compatible) backend with a lazily built client
#[derive(Clone)]
pub struct S3Store {
    scheme: Scheme,
    client: Arc<OnceCell<Client>>,
}

impl Default for S3Store {
    fn default() -> Self {
        Self::new()
    }
}

impl S3Store {
    /// AWS S3 using the ambient credential chain
    pub fn new() -> Self {
        Self::with_scheme(Scheme::S3)
    }

    pub(crate) fn with_scheme(scheme: Scheme) -> Self {
        Self {
            scheme,
            client: Arc::new(OnceCell::new()),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                match self.scheme {
                    Scheme::R2 => r2::build_client().await,
                    _ => build_aws_client().await,
                }
            })
            .await
    }

    fn err<E>(&self, context: &str, err: E) -> Error
    where
        E: std::error::Error + 'static,
    {
        Error::backend(
            self.scheme.backend_name(),
            format!("{}: {}", context, DisplayErrorContext(&err)),
        )
    }

    fn attributes_from_head(&self, bucket: &str, key: &str, head: &HeadObjectOutput) -> Attributes {
        let size = head.content_length().unwrap_or(0).max(0) as u64;
        let mod_time = head
            .metadata()
            .and_then(|m| m.get(MTIME_METADATA_KEY))
            .and_then(|v| decode_mtime(v))
            .or_else(|| {
                head.last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok())
            });

        let checksum = match head.checksum_crc32_c().and_then(decode_crc32c) {
            Some(crc) => Checksum::known(crc),
            None => {
                let store = self.clone();
                let bucket = bucket.to_string();
                let key = key.to_string();
                Checksum::lazy(move || {
                    let store = store.clone();
                    let bucket = bucket.clone();
                    let key = key.clone();
                    async move { store.stream_crc32c(&bucket, &key).await }
                })
            }
        };

        Attributes::new(size, mod_time, checksum).with_relative_path(locator::file_name(key))
    }

    /// CRC32C by reading the whole object
    async fn stream_crc32c(&self, bucket: &str, key: &str) -> Result<u32> {
        let output = self
            .client()
            .await?
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.err("get_object", e))?;

        let mut body = output.body;
        let mut crc = 0u32;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| self.err("reading object body", e))?
        {
            crc = crc32c::crc32c_append(crc, &chunk);
        }
        Ok(crc)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadObjectOutput>> {
        let result = self
            .client()
            .await?
            .head_object()
            .bucket(bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(output)),
            Err(e) if matches!(e.code(), Some("NotFound") | Some("NoSuchKey")) => Ok(None),
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => Ok(None),
            Err(e) => Err(self.err("head_object", e)),
        }
    }
}

async fn build_aws_client() -> Result<Client> {
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    if sdk_config.credentials_provider().is_none() {
        return Err(Error::config("no AWS credentials found"));
    }
    Ok(Client::new(&sdk_config))
}

/// Decode the base64, big-endian CRC32C S3 reports
fn decode_crc32c(value: &str) -> Option<u32> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(value)
        .ok()?;
    let bytes = <[u8; 4]>::try_from(raw.as_slice()).ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn is_precondition_failure(code: Option<&str>) -> bool {
    matches!(
        code,
        Some("PreconditionFailed") | Some("ConditionalRequestConflict")
    )
}

#[async_trait]
impl ObjectStore for S3Store {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    async fn init(&self, _bucket: &str) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn attributes(&self, bucket: &str, path: &str) -> Result<Option<Attributes>> {
        if path.is_empty() || path.ends_with('/') {
            return Ok(None);
        }
        Ok(self
            .head(bucket, path)
            .await?
            .map(|head| self.attributes_from_head(bucket, path, &head)))
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Resource>> {
        let client = self.client().await?;
        let mut request = client.list_objects_v2().bucket(bucket).prefix(prefix);
        if !recursive {
            request = request.delimiter("/");
        }

        let mut keys = Vec::new();
        let mut results = Vec::new();
        let mut paginator = request.into_paginator().send();
        while let Some(page) = paginator.next().await {
            let output = page.map_err(|e| self.err("list_objects_v2", e))?;

            for obj in output.contents() {
                if let Some(key) = obj.key().filter(|k| !k.ends_with('/')) {
                    keys.push(key.to_string());
                }
            }
            for common in output.common_prefixes() {
                if let Some(p) = common.prefix() {
                    results.push(Resource::directory(Locator::remote(self.scheme, bucket, p)));
                }
            }
        }

        tracing::debug!(bucket, prefix, objects = keys.len(), "Listed prefix");

        let heads: Vec<(String, Option<Attributes>)> = futures::stream::iter(keys)
            .map(|key| async move {
                let attrs = self.attributes(bucket, &key).await?;
                Ok::<_, Error>((key, attrs))
            })
            .buffer_unordered(HEAD_CONCURRENCY)
            .try_collect()
            .await?;

        for (key, attrs) in heads {
            // Deleted between list and head
            let Some(attrs) = attrs else { continue };
            let attrs = attrs.with_relative_path(locator::relative_to(prefix, &key));
            results.push(Resource::object(Locator::remote(self.scheme, bucket, key), attrs));
        }

        results.sort_by(|a, b| a.locator.path.cmp(&b.locator.path));
        Ok(results)
    }

    async fn peek_keys(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let output = self
            .client()
            .await?
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(i32::try_from(limit).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|e| self.err("list_objects_v2", e))?;

        Ok(output
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        self.client()
            .await?
            .delete_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| self.err("delete_object", e))?;
        tracing::debug!(bucket, key = path, "Deleted");
        Ok(())
    }

    async fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<()> {
        self.client()
            .await?
            .copy_object()
            .copy_source(format!("{}/{}", src_bucket, src))
            .bucket(dst_bucket)
            .key(dst)
            .send()
            .await
            .map_err(|e| self.err("copy_object", e))?;
        tracing::debug!(src_bucket, src, dst_bucket, dst, "Copied");
        Ok(())
    }

    async fn cat(&self, bucket: &str, path: &str) -> Result<Bytes> {
        let output = self
            .client()
            .await?
            .get_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| match e.code() {
                Some("NoSuchKey") => Error::not_found(path),
                _ => self.err("get_object", e),
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| self.err("reading object body", e))?
            .into_bytes();
        Ok(bytes)
    }

    async fn open_range(
        &self,
        bucket: &str,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream> {
        use tokio_util::io::ReaderStream;

        let output = self
            .client()
            .await?
            .get_object()
            .bucket(bucket)
            .key(path)
            .range(format!("bytes={}-{}", start, end.saturating_sub(1)))
            .send()
            .await
            .map_err(|e| self.err("get_object", e))?;

        let backend = self.scheme.backend_name();
        let stream = ReaderStream::new(output.body.into_async_read()).map(move |result| {
            result.map_err(|e| Error::backend(backend, format!("reading object stream: {}", e)))
        });
        Ok(Box::pin(stream))
    }

    async fn upload(&self, ctx: &Context, src: &Path, bucket: &str, path: &str) -> Result<()> {
        let source = LocalSource::open(src).await?;
        let body = AwsByteStream::from_path(&source.path)
            .await
            .map_err(|e| self.err("opening upload body", e))?;

        let sink = ctx
            .progress
            .new_sink(source.size, format!("Uploading [{}]", locator::file_name(path)));

        let mut request = self
            .client()
            .await?
            .put_object()
            .bucket(bucket)
            .key(path)
            .checksum_algorithm(ChecksumAlgorithm::Crc32C)
            .body(body);
        if let Some(mtime) = source.mtime_metadata() {
            request = request.metadata(MTIME_METADATA_KEY, mtime);
        }
        request
            .send()
            .await
            .map_err(|e| self.err("put_object", e))?;

        sink.advance(source.size);
        sink.finish();
        tracing::debug!(src = %src.display(), bucket, key = path, "Uploaded");
        Ok(())
    }

    /// Buffers the reader: `put_object` needs the body length up front
    async fn write(
        &self,
        bucket: &str,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut body = Vec::new();
        data.read_to_end(&mut body)
            .await
            .map_err(|e| Error::io(format!("reading body for {}", path), e))?;
        let size = body.len();

        self.client()
            .await?
            .put_object()
            .bucket(bucket)
            .key(path)
            .checksum_algorithm(ChecksumAlgorithm::Crc32C)
            .metadata(MTIME_METADATA_KEY, encode_mtime(SystemTime::now()))
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(|e| self.err("put_object", e))?;

        tracing::debug!(bucket, key = path, bytes = size, "Written");
        Ok(())
    }

    async fn download(
        &self,
        ctx: &Context,
        bucket: &str,
        path: &str,
        dst: &Path,
        force_checksum: bool,
    ) -> Result<()> {
        transfer::download(ctx, Arc::new(self.clone()), bucket, path, dst, force_checksum).await
    }

    fn locking(&self) -> Option<&dyn LockingStore> {
        Some(self)
    }
}

/// Conditional writes keyed on the ETag
#[async_trait]
impl LockingStore for S3Store {
    async fn create_if_absent(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
    ) -> Result<Option<LockToken>> {
        let result = self
            .client()
            .await?
            .put_object()
            .bucket(bucket)
            .key(path)
            .if_none_match("*")
            .body(AwsByteStream::from(body))
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output
                    .e_tag()
                    .ok_or_else(|| Error::backend(self.name(), "put_object returned no ETag"))?;
                Ok(Some(LockToken::ETag(etag.to_string())))
            }
            Err(e) if is_precondition_failure(e.code()) => Ok(None),
            Err(e) => Err(self.err("conditional put_object", e)),
        }
    }

    async fn lock_state(&self, bucket: &str, path: &str) -> Result<Option<LockState>> {
        let Some(head) = self.head(bucket, path).await? else {
            return Ok(None);
        };
        let etag = head
            .e_tag()
            .ok_or_else(|| Error::backend(self.name(), "head_object returned no ETag"))?;
        let last_modified = head
            .last_modified()
            .and_then(|t| SystemTime::try_from(*t).ok())
            .ok_or_else(|| Error::backend(self.name(), "head_object returned no last-modified"))?;

        Ok(Some(LockState {
            token: LockToken::ETag(etag.to_string()),
            last_modified,
        }))
    }

    async fn delete_if_matches(&self, bucket: &str, path: &str, token: &LockToken) -> Result<bool> {
        let LockToken::ETag(etag) = token else {
            return Ok(false);
        };

        let result = self
            .client()
            .await?
            .delete_object()
            .bucket(bucket)
            .key(path)
            .if_match(etag)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_precondition_failure(e.code()) => Ok(false),
            Err(e) if matches!(e.code(), Some("NoSuchKey") | Some("NotFound")) => Ok(false),
            Err(e) => Err(self.err("conditional delete_object", e)),
        }
    }
}
