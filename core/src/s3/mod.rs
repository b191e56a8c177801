use std::path::Path;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use log::{debug, info};

use crate::error::{BackupError, Result};
use crate::spool::sanitize;
use crate::store::settings::UserSettings;

/// Where rehydrated dumps land before being handed to callers.
pub const DOWNLOAD_SUBDIR: &str = "velld-s3-downloads";

const DEFAULT_REGION: &str = "us-east-1";

/// Validated S3 configuration extracted from a user's settings. Construction
/// is the only place the "enabled but incomplete" state is detected, so the
/// error surfaces at upload/rehydrate time rather than at settings-save time.
#[derive(Debug, Clone)]
pub struct S3Params {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub path_prefix: String,
    pub purge_local: bool,
}

impl S3Params {
    /// Expects internal (decrypted) settings.
    pub fn from_settings(settings: &UserSettings) -> Result<Self> {
        if !settings.s3_enabled {
            return Err(BackupError::S3Config("s3_enabled"));
        }
        if settings.s3_endpoint.is_empty() {
            return Err(BackupError::S3Config("s3_endpoint"));
        }
        if settings.s3_bucket.is_empty() {
            return Err(BackupError::S3Config("s3_bucket"));
        }
        if settings.s3_access_key.is_empty() {
            return Err(BackupError::S3Config("s3_access_key"));
        }
        if settings.s3_secret_key.is_empty() {
            return Err(BackupError::S3Config("s3_secret_key"));
        }

        let region = if settings.s3_region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            settings.s3_region.clone()
        };

        Ok(S3Params {
            endpoint: settings.s3_endpoint.clone(),
            region,
            bucket: settings.s3_bucket.clone(),
            access_key: settings.s3_access_key.clone(),
            secret_key: settings.s3_secret_key.clone(),
            use_ssl: settings.s3_use_ssl,
            path_prefix: settings.s3_path_prefix.clone(),
            purge_local: settings.s3_purge_local,
        })
    }

    fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.endpoint)
    }

    /// `[path_prefix/]<sanitized-connection-name>/<file_name>`
    pub fn object_key(&self, connection_name: &str, file_name: &str) -> String {
        let folder = sanitize(connection_name);
        if self.path_prefix.is_empty() {
            format!("{folder}/{file_name}")
        } else {
            format!("{}/{folder}/{file_name}", self.path_prefix)
        }
    }
}

/// Rewrites the first occurrence of the old sanitized connection name in an
/// object key after a connection rename. A no-op when the sanitized names
/// match, which is what makes the rename idempotent.
pub fn rewrite_key(key: &str, old_name: &str, new_name: &str) -> String {
    let old = sanitize(old_name);
    let new = sanitize(new_name);
    if old == new {
        return key.to_string();
    }
    key.replacen(&old, &new, 1)
}

/// Thin client over an S3-compatible endpoint, bucket fixed at connect time.
#[derive(Clone)]
pub struct S3Mirror {
    client: Client,
    bucket: String,
}

impl S3Mirror {
    /// Builds the client and guarantees the bucket exists, creating it
    /// (region-scoped) on first use.
    pub async fn connect(params: &S3Params) -> Result<Self> {
        let credentials = Credentials::new(
            params.access_key.clone(),
            params.secret_key.clone(),
            None,
            None,
            "user-settings",
        );

        let shared = aws_config::from_env()
            .region(Region::new(params.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(params.endpoint_url())
            .load()
            .await;

        // S3-compatible stores rarely speak virtual-host addressing.
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(config);

        let mirror = S3Mirror {
            client,
            bucket: params.bucket.clone(),
        };
        mirror.ensure_bucket(&params.region).await?;
        Ok(mirror)
    }

    async fn ensure_bucket(&self, region: &str) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        info!("creating s3 bucket '{}'", self.bucket);
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| BackupError::S3Transport(format!("create bucket failed: {e}")))?;
        Ok(())
    }

    pub async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        debug!("uploading {} to s3://{}/{}", path.display(), self.bucket, key);
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| BackupError::S3Transport(format!("cannot read {}: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::S3Transport(format!("put object failed: {e}")))?;
        Ok(())
    }

    pub async fn fetch_to(&self, key: &str, dest: &Path) -> Result<()> {
        debug!("downloading s3://{}/{} to {}", self.bucket, key, dest.display());
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::S3Transport(format!("get object failed: {e}")))?;
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| BackupError::S3Transport(format!("download aborted: {e}")))?;
        tokio::fs::write(dest, data.into_bytes()).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .is_ok())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        debug!("deleting s3://{}/{}", self.bucket, key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::S3Transport(format!("delete object failed: {e}")))?;
        Ok(())
    }

    /// Copy-then-delete; atomic per object, so a failure leaves the old key
    /// readable.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        if old_key == new_key {
            return Ok(());
        }
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, old_key))
            .key(new_key)
            .send()
            .await
            .map_err(|e| BackupError::S3Transport(format!("copy object failed: {e}")))?;
        self.remove(old_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured_settings() -> UserSettings {
        let mut settings = UserSettings::empty("u1");
        settings.s3_enabled = true;
        settings.s3_endpoint = "localhost:9000".into();
        settings.s3_bucket = "b".into();
        settings.s3_access_key = "k".into();
        settings.s3_secret_key = "s".into();
        settings.s3_path_prefix = "p".into();
        settings
    }

    #[test]
    fn params_require_every_field() {
        let mut settings = configured_settings();
        settings.s3_bucket = String::new();
        assert!(matches!(
            S3Params::from_settings(&settings),
            Err(BackupError::S3Config("s3_bucket"))
        ));

        let mut settings = configured_settings();
        settings.s3_enabled = false;
        assert!(matches!(
            S3Params::from_settings(&settings),
            Err(BackupError::S3Config("s3_enabled"))
        ));
    }

    #[test]
    fn region_defaults_when_blank() {
        let params = S3Params::from_settings(&configured_settings()).expect("params");
        assert_eq!(params.region, "us-east-1");
        assert_eq!(params.endpoint_url(), "http://localhost:9000");
    }

    #[test]
    fn object_keys_embed_prefix_and_sanitized_name() {
        let params = S3Params::from_settings(&configured_settings()).expect("params");
        assert_eq!(
            params.object_key("pg one", "shop_20260301_000000.sql"),
            "p/pg_one/shop_20260301_000000.sql"
        );

        let mut settings = configured_settings();
        settings.s3_path_prefix = String::new();
        let bare = S3Params::from_settings(&settings).expect("params");
        assert_eq!(bare.object_key("pg1", "f.sql"), "pg1/f.sql");
    }

    #[test]
    fn rename_rewrites_first_occurrence_only() {
        assert_eq!(
            rewrite_key("p/old_name/f.sql", "old name", "New Name!!"),
            "p/New_Name_/f.sql"
        );
        // Applying the rename twice leaves the key unchanged.
        let once = rewrite_key("p/old_name/f.sql", "old name", "new");
        assert_eq!(rewrite_key(&once, "old name", "new"), once);
        // Same sanitized name in and out is a no-op.
        assert_eq!(rewrite_key("p/x/f.sql", "x!", "x?"), "p/x/f.sql");
    }
}
