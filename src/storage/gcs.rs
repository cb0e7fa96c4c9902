//! Google Cloud Storage backend using the object_store crate

use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator, Scheme};
use crate::storage::{
    decode_mtime, encode_mtime, ByteStream, LockState, LockToken, LockingStore, ObjectStore,
    MTIME_METADATA_KEY,
};
use crate::transfer::{self, LocalSource};
use crate::types::{Attributes, Checksum, Resource};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes as ObjectAttributes, GetOptions, GetRange, ObjectMeta,
    ObjectStore as _, ObjectStoreExt as _, PutMode, PutMultipartOptions, PutOptions, PutPayload,
    WriteMultipart,
};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Environment variable naming a service account key file
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const HEAD_CONCURRENCY: usize = 32;
const UPLOAD_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Google Cloud Storage backend with one client per bucket
#[derive(Clone, Default)]
pub struct GcsStore {
    clients: Arc<DashMap<String, Arc<GoogleCloudStorage>>>,
}

impl GcsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, bucket: &str) -> Result<Arc<GoogleCloudStorage>> {
        if let Some(client) = self.clients.get(bucket) {
            return Ok(client.clone());
        }

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = std::env::var_os(CREDENTIALS_ENV) {
            let path = Path::new(&path);
            if !path.is_file() {
                return Err(Error::config(format!(
                    "{} points to a missing file: {}",
                    CREDENTIALS_ENV,
                    path.display()
                )));
            }
            builder = builder.with_application_credentials(path.to_string_lossy());
        }

        let client = Arc::new(builder.build().map_err(|e| {
            Error::config(format!("creating GCS client for bucket {}: {}", bucket, e))
        })?);
        self.clients.insert(bucket.to_string(), client.clone());
        tracing::debug!(bucket, "GCS client configured");
        Ok(client)
    }

    fn err(context: &str, err: object_store::Error) -> Error {
        Error::backend("gcs", format!("{}: {}", context, err))
    }

    fn attributes_from(
        &self,
        bucket: &str,
        meta: &ObjectMeta,
        attributes: &ObjectAttributes,
    ) -> Attributes {
        let key = meta.location.to_string();
        let mod_time = attributes
            .get(&Attribute::Metadata(MTIME_METADATA_KEY.into()))
            .and_then(|v| decode_mtime(v.as_ref()))
            .or_else(|| Some(meta.last_modified.into()));

        let store = self.clone();
        let bucket = bucket.to_string();
        let lazy_key = key.clone();
        let checksum = Checksum::lazy(move || {
            let store = store.clone();
            let bucket = bucket.clone();
            let key = lazy_key.clone();
            async move { store.stream_crc32c(&bucket, &key).await }
        });

        Attributes::new(meta.size, mod_time, checksum).with_relative_path(locator::file_name(&key))
    }

    /// CRC32C by reading the whole object; the client does not expose the
    /// stored value
    async fn stream_crc32c(&self, bucket: &str, key: &str) -> Result<u32> {
        let result = self
            .client(bucket)?
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| Self::err("reading object", e))?;

        let mut stream = result.into_stream();
        let mut crc = 0u32;
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| Self::err("reading object stream", e))?
        {
            crc = crc32c::crc32c_append(crc, &chunk);
        }
        Ok(crc)
    }

    /// Stream an object into another bucket, keeping its metadata and
    /// modification time
    async fn stream_copy(
        &self,
        src_bucket: &str,
        src: &str,
        dst_bucket: &str,
        dst: &str,
    ) -> Result<()> {
        let source = match self.client(src_bucket)?.get(&ObjectPath::from(src)).await {
            Ok(r) => r,
            Err(object_store::Error::NotFound { .. }) => return Err(Error::not_found(src)),
            Err(e) => return Err(Self::err("reading object", e)),
        };
        let options = PutMultipartOptions {
            attributes: carried_attributes(&source.meta, &source.attributes),
            ..Default::default()
        };

        let upload = self
            .client(dst_bucket)?
            .put_multipart_opts(&ObjectPath::from(dst), options)
            .await
            .map_err(|e| Self::err("starting copy upload", e))?;
        let mut writer = WriteMultipart::new(upload);
        let mut stream = source.into_stream();

        let pumped = async {
            while let Some(chunk) = stream
                .try_next()
                .await
                .map_err(|e| Self::err("reading object stream", e))?
            {
                writer
                    .wait_for_capacity(4)
                    .await
                    .map_err(|e| Self::err("uploading part", e))?;
                writer.put(chunk);
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = pumped {
            if let Err(abort) = writer.abort().await {
                tracing::debug!(bucket = dst_bucket, key = dst, error = %abort, "Failed to abort copy upload");
            }
            return Err(e);
        }

        writer
            .finish()
            .await
            .map_err(|e| Self::err("completing copy upload", e))?;
        Ok(())
    }

    fn token_from(e_tag: Option<String>, version: Option<String>) -> Option<LockToken> {
        match version.and_then(|v| v.parse::<u64>().ok()) {
            Some(generation) => Some(LockToken::Generation(generation)),
            None => e_tag.map(LockToken::ETag),
        }
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn scheme(&self) -> Scheme {
        Scheme::Gs
    }

    async fn init(&self, bucket: &str) -> Result<()> {
        self.client(bucket).map(|_| ())
    }

    async fn attributes(&self, bucket: &str, path: &str) -> Result<Option<Attributes>> {
        if path.is_empty() || path.ends_with('/') {
            return Ok(None);
        }
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self
            .client(bucket)?
            .get_opts(&ObjectPath::from(path), options)
            .await
        {
            Ok(result) => Ok(Some(self.attributes_from(
                bucket,
                &result.meta,
                &result.attributes,
            ))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::err("reading object metadata", e)),
        }
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Resource>> {
        let client = self.client(bucket)?;
        let object_prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));

        let mut results = Vec::new();
        let keys: Vec<String> = if recursive {
            client
                .list(object_prefix.as_ref())
                .map_ok(|meta| meta.location.to_string())
                .try_collect()
                .await
                .map_err(|e| Self::err("listing objects", e))?
        } else {
            let listing = client
                .list_with_delimiter(object_prefix.as_ref())
                .await
                .map_err(|e| Self::err("listing objects", e))?;
            for dir in listing.common_prefixes {
                let dir = locator::as_directory(dir.as_ref());
                results.push(Resource::directory(Locator::remote(Scheme::Gs, bucket, dir)));
            }
            listing
                .objects
                .into_iter()
                .map(|meta| meta.location.to_string())
                .collect()
        };

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
            let Some(attrs) = attrs else { continue };
            let attrs = attrs.with_relative_path(locator::relative_to(prefix, &key));
            results.push(Resource::object(Locator::remote(Scheme::Gs, bucket, key), attrs));
        }

        results.sort_by(|a, b| a.locator.path.cmp(&b.locator.path));
        Ok(results)
    }

    async fn peek_keys(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let client = self.client(bucket)?;
        let object_prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        client
            .list(object_prefix.as_ref())
            .take(limit)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| Self::err("listing objects", e))
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        match self.client(bucket)?.delete(&ObjectPath::from(path)).await {
            Ok(()) => {}
            Err(object_store::Error::NotFound { .. }) => return Err(Error::not_found(path)),
            Err(e) => return Err(Self::err("deleting object", e)),
        }
        tracing::debug!(bucket, key = path, "Deleted");
        Ok(())
    }

    async fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<()> {
        if src_bucket != dst_bucket {
            // A client is bound to one bucket; copy across buckets by streaming
            self.stream_copy(src_bucket, src, dst_bucket, dst).await?;
        } else {
            self.client(src_bucket)?
                .copy(&ObjectPath::from(src), &ObjectPath::from(dst))
                .await
                .map_err(|e| Self::err("copying object", e))?;
        }
        tracing::debug!(src_bucket, src, dst_bucket, dst, "Copied");
        Ok(())
    }

    async fn cat(&self, bucket: &str, path: &str) -> Result<Bytes> {
        let result = match self.client(bucket)?.get(&ObjectPath::from(path)).await {
            Ok(r) => r,
            Err(object_store::Error::NotFound { .. }) => return Err(Error::not_found(path)),
            Err(e) => return Err(Self::err("reading object", e)),
        };
        result
            .bytes()
            .await
            .map_err(|e| Self::err("reading object bytes", e))
    }

    async fn open_range(
        &self,
        bucket: &str,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream> {
        let options = GetOptions {
            range: Some(GetRange::Bounded(start..end)),
            ..Default::default()
        };
        let result = self
            .client(bucket)?
            .get_opts(&ObjectPath::from(path), options)
            .await
            .map_err(|e| Self::err("reading object range", e))?;

        let stream = result
            .into_stream()
            .map_err(|e| Self::err("reading object stream", e));
        Ok(Box::pin(stream))
    }

    async fn upload(&self, ctx: &Context, src: &Path, bucket: &str, path: &str) -> Result<()> {
        let source = LocalSource::open(src).await?;
        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|e| Error::io(format!("opening {}", src.display()), e))?;

        let mut attributes = ObjectAttributes::new();
        if let Some(mtime) = source.mtime_metadata() {
            attributes.insert(Attribute::Metadata(MTIME_METADATA_KEY.into()), mtime.into());
        }
        let options = PutMultipartOptions {
            attributes,
            ..Default::default()
        };

        let upload = self
            .client(bucket)?
            .put_multipart_opts(&ObjectPath::from(path), options)
            .await
            .map_err(|e| Self::err("starting upload", e))?;
        let mut writer = WriteMultipart::new(upload);

        let sink = ctx
            .progress
            .new_sink(source.size, format!("Uploading [{}]", locator::file_name(path)));
        let mut buf = vec![0u8; UPLOAD_BUF_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| Error::io(format!("reading {}", src.display()), e))?;
            if n == 0 {
                break;
            }
            writer
                .wait_for_capacity(4)
                .await
                .map_err(|e| Self::err("uploading part", e))?;
            writer.write(&buf[..n]);
            sink.advance(n as u64);
        }

        writer
            .finish()
            .await
            .map_err(|e| Self::err("completing upload", e))?;
        sink.finish();
        tracing::debug!(src = %src.display(), bucket, key = path, "Uploaded");
        Ok(())
    }

    async fn write(
        &self,
        bucket: &str,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut attributes = ObjectAttributes::new();
        attributes.insert(
            Attribute::Metadata(MTIME_METADATA_KEY.into()),
            encode_mtime(SystemTime::now()).into(),
        );
        let options = PutMultipartOptions {
            attributes,
            ..Default::default()
        };

        let upload = self
            .client(bucket)?
            .put_multipart_opts(&ObjectPath::from(path), options)
            .await
            .map_err(|e| Self::err("starting write", e))?;
        let mut writer = WriteMultipart::new(upload);

        let mut buf = vec![0u8; UPLOAD_BUF_SIZE];
        let mut written = 0u64;
        let pumped = async {
            loop {
                let n = data
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::io(format!("reading body for {}", path), e))?;
                if n == 0 {
                    return Ok::<_, Error>(());
                }
                writer
                    .wait_for_capacity(4)
                    .await
                    .map_err(|e| Self::err("uploading part", e))?;
                writer.write(&buf[..n]);
                written += n as u64;
            }
        }
        .await;

        if let Err(e) = pumped {
            if let Err(abort) = writer.abort().await {
                tracing::debug!(bucket, key = path, error = %abort, "Failed to abort write");
            }
            return Err(e);
        }

        writer
            .finish()
            .await
            .map_err(|e| Self::err("completing write", e))?;
        tracing::debug!(bucket, key = path, bytes = written, "Written");
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

/// Create-if-absent through `PutMode::Create`; release compares the current
/// generation before deleting, which leaves a short race window
#[async_trait]
impl LockingStore for GcsStore {
    async fn create_if_absent(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
    ) -> Result<Option<LockToken>> {
        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .client(bucket)?
            .put_opts(&ObjectPath::from(path), PutPayload::from(body), options)
            .await
        {
            Ok(result) => Self::token_from(result.e_tag, result.version)
                .map(Some)
                .ok_or_else(|| Error::backend("gcs", "conditional write returned no token")),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Ok(None),
            Err(e) => Err(Self::err("conditional write", e)),
        }
    }

    async fn lock_state(&self, bucket: &str, path: &str) -> Result<Option<LockState>> {
        match self.client(bucket)?.head(&ObjectPath::from(path)).await {
            Ok(meta) => {
                let token = Self::token_from(meta.e_tag, meta.version)
                    .ok_or_else(|| Error::backend("gcs", "object metadata has no token"))?;
                Ok(Some(LockState {
                    token,
                    last_modified: meta.last_modified.into(),
                }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::err("reading lock metadata", e)),
        }
    }

    async fn delete_if_matches(&self, bucket: &str, path: &str, token: &LockToken) -> Result<bool> {
        match self.lock_state(bucket, path).await? {
            Some(state) if &state.token == token => {
                match self.client(bucket)?.delete(&ObjectPath::from(path)).await {
                    Ok(()) => Ok(true),
                    Err(object_store::Error::NotFound { .. }) => Ok(false),
                    Err(e) => Err(Self::err("deleting lock", e)),
                }
            }
            _ => Ok(false),
        }
    }
}

/// Attributes for a copy of an object: everything the source carries, with
/// the modification time pinned to the source's
fn carried_attributes(meta: &ObjectMeta, attributes: &ObjectAttributes) -> ObjectAttributes {
    let mut carried = attributes.clone();
    let key = Attribute::Metadata(MTIME_METADATA_KEY.into());
    if carried.get(&key).is_none() {
        carried.insert(key, encode_mtime(meta.last_modified.into()).into());
    }
    carried
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn meta(last_modified_secs: u64) -> ObjectMeta {
        ObjectMeta {
            location: ObjectPath::from("dir/file.bin"),
            last_modified: (UNIX_EPOCH + Duration::from_secs(last_modified_secs)).into(),
            size: 42,
            e_tag: None,
            version: None,
        }
    }

    fn carried_mtime(attributes: &ObjectAttributes) -> Option<std::time::SystemTime> {
        attributes
            .get(&Attribute::Metadata(MTIME_METADATA_KEY.into()))
            .and_then(|v| decode_mtime(v.as_ref()))
    }

    #[test]
    fn test_copy_keeps_source_mtime_metadata() {
        let source_mtime = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let mut source = ObjectAttributes::new();
        source.insert(
            Attribute::Metadata(MTIME_METADATA_KEY.into()),
            encode_mtime(source_mtime).into(),
        );
        source.insert(Attribute::ContentType, "text/plain".into());

        let carried = carried_attributes(&meta(1_700_000_000), &source);
        assert_eq!(carried_mtime(&carried), Some(source_mtime));
        assert_eq!(
            carried.get(&Attribute::ContentType).map(|v| v.as_ref().to_string()),
            Some("text/plain".to_string())
        );
    }

    #[test]
    fn test_copy_pins_update_time_when_source_has_no_mtime() {
        let carried = carried_attributes(&meta(1_650_000_000), &ObjectAttributes::new());
        assert_eq!(
            carried_mtime(&carried),
            Some(UNIX_EPOCH + Duration::from_secs(1_650_000_000))
        );
    }

    #[test]
    fn test_token_prefers_generation() {
        assert_eq!(
            GcsStore::token_from(Some("abc".into()), Some("1712".into())),
            Some(LockToken::Generation(1712))
        );
        assert_eq!(
            GcsStore::token_from(Some("abc".into()), None),
            Some(LockToken::ETag("abc".into()))
        );
        assert_eq!(GcsStore::token_from(None, None), None);
    }
}
