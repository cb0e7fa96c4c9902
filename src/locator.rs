//! Resource locators (`scheme://bucket/path` or a local path) and path helpers

use crate::error::{Error, Result};
use std::fmt;
use std::path::Path;

/// Backend scheme of a locator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    /// Local filesystem
    Local,
    /// Google Cloud Storage
    Gs,
    /// AWS S3
    S3,
    /// Cloudflare R2
    R2,
}

impl Scheme {
    /// URL scheme prefix ("" for local)
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "",
            Scheme::Gs => "gs",
            Scheme::S3 => "s3",
            Scheme::R2 => "r2",
        }
    }

    /// Human-readable backend name (for errors and logs)
    pub fn backend_name(&self) -> &'static str {
        match self {
            Scheme::Local => "local",
            Scheme::Gs => "gcs",
            Scheme::S3 => "s3",
            Scheme::R2 => "r2",
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gs" => Some(Scheme::Gs),
            "s3" => Some(Scheme::S3),
            "r2" => Some(Scheme::R2),
            _ => None,
        }
    }
}

/// Identifies a backend instance and a resource within it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub scheme: Scheme,
    /// Bucket name, empty for local paths
    pub bucket: String,
    /// Object key, or an absolute path for local resources
    pub path: String,
}

impl Locator {
    /// Parse a locator string
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((scheme, rest)) = s.split_once("://") {
            let scheme = Scheme::from_prefix(scheme).ok_or_else(|| Error::InvalidLocator {
                locator: s.to_string(),
                reason: format!("unsupported scheme '{}'", scheme),
            })?;
            return Self::parse_remote(scheme, s, rest);
        }

        if s.is_empty() {
            return Err(Error::InvalidLocator {
                locator: s.to_string(),
                reason: "empty path".to_string(),
            });
        }

        Ok(Self::local(absolute(s)?))
    }

    /// Split `bucket/key` on the first '/'; the key is kept byte for byte
    fn parse_remote(scheme: Scheme, s: &str, rest: &str) -> Result<Self> {
        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(Error::InvalidLocator {
                locator: s.to_string(),
                reason: "missing bucket name".to_string(),
            });
        }

        Ok(Self {
            scheme,
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }

    /// Build a local locator from an absolute path
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Local,
            bucket: String::new(),
            path: path.into(),
        }
    }

    /// Build a remote locator
    pub fn remote(scheme: Scheme, bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme,
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Same backend and bucket, different path
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            scheme: self.scheme,
            bucket: self.bucket.clone(),
            path: path.into(),
        }
    }

    /// Check if this locator is remote
    pub fn is_remote(&self) -> bool {
        self.scheme != Scheme::Local
    }

    /// Convert back to a locator string
    pub fn to_uri(&self) -> String {
        match self.scheme {
            Scheme::Local => self.path.clone(),
            scheme if self.path.is_empty() => format!("{}://{}", scheme.as_str(), self.bucket),
            scheme => format!("{}://{}/{}", scheme.as_str(), self.bucket, self.path),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

/// Make a local path absolute without touching the filesystem, keeping a trailing '/'
fn absolute(s: &str) -> Result<String> {
    if Path::new(s).is_absolute() {
        return Ok(s.to_string());
    }
    let cwd = std::env::current_dir().map_err(|e| Error::io("resolving working directory", e))?;
    let rel = s.trim_start_matches("./");
    let base = cwd.to_string_lossy();
    if rel.is_empty() || rel == "." {
        return Ok(base.into_owned());
    }
    Ok(join(&base, rel))
}

/// Join a directory and a relative path with a single '/'
pub fn join(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        return rel.to_string();
    }
    if rel.is_empty() {
        return dir.to_string();
    }
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        rel.trim_start_matches('/')
    )
}

/// Path of `path` relative to `dir`; unchanged if `path` is not under `dir`
pub fn relative_to(dir: &str, path: &str) -> String {
    match path.strip_prefix(dir) {
        Some(rest) => rest.trim_start_matches('/').to_string(),
        None => path.to_string(),
    }
}

/// Ensure a non-empty prefix ends with exactly one '/'
pub fn as_directory(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }
    format!("{}/", prefix.trim_end_matches('/'))
}

/// Last path component
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Where `src_path` under `src_root` lands under `dst_root`
pub fn destination_for(src_root: &str, src_path: &str, dst_root: &str) -> String {
    join(dst_root, &relative_to(src_root, src_path))
}

/// True if `sub` is `path` itself or lies under it component-wise
pub fn is_sub_path(sub: &str, path: &str) -> bool {
    if !sub.starts_with(path) {
        return false;
    }
    if path.is_empty() || path.ends_with('/') || sub.len() == path.len() {
        return true;
    }
    sub.as_bytes()[path.len()] == b'/'
}
