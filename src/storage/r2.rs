//! Cloudflare R2 through its S3-compatible endpoint

use crate::error::{Error, Result};
use crate::locator::Scheme;
use crate::storage::S3Store;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use serde::Deserialize;
use std::path::Path;

/// Environment variable naming the credentials file
pub const CREDENTIALS_ENV: &str = "R2_CREDENTIALS";

/// Contents of the R2 credentials file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct R2Credentials {
    pub account_id: String,
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl R2Credentials {
    /// Read credentials from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "reading R2 credentials {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!(
                "parsing R2 credentials {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Read credentials from the file named by `R2_CREDENTIALS`
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CREDENTIALS_ENV)
            .ok_or_else(|| Error::config(format!("{} is not set", CREDENTIALS_ENV)))?;
        Self::load(Path::new(&path))
    }

    pub fn endpoint_url(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }
}

/// S3 backend configured for R2
pub fn r2_store() -> S3Store {
    S3Store::with_scheme(Scheme::R2)
}

pub(crate) async fn build_client() -> Result<Client> {
    let creds = R2Credentials::from_env()?;
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .endpoint_url(creds.endpoint_url())
        .region(Region::new("auto"))
        .credentials_provider(Credentials::new(
            creds.access_key_id.clone(),
            creds.access_key_secret.clone(),
            None,
            None,
            "r2-credentials-file",
        ))
        .build();

    tracing::debug!(account = %creds.account_id, "R2 client configured");
    Ok(Client::from_conf(s3_config))
}
