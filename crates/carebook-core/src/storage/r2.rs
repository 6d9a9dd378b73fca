//! Cloudflare R2 blob transport.

use std::env;

use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    Client,
};
use aws_types::region::Region;
use chrono::{DateTime, Utc};

use super::{validate_blob_name, BlobTransport, RemoteFile};
use crate::error::{AuthErrorKind, NetworkErrorKind, StorageErrorKind};
use crate::{Error, Result};

const ENV_ACCOUNT_ID: &str = "R2_ACCOUNT_ID";
const ENV_BUCKET: &str = "R2_BUCKET";
const ENV_ACCESS_KEY_ID: &str = "R2_ACCESS_KEY_ID";
const ENV_SECRET_ACCESS_KEY: &str = "R2_SECRET_ACCESS_KEY";

/// Cloudflare R2 configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct R2Config {
    /// Cloudflare account identifier.
    pub account_id: String,
    /// R2 bucket name.
    pub bucket: String,
    /// Access key id for S3-compatible auth.
    pub access_key_id: String,
    /// Secret access key for S3-compatible auth.
    pub secret_access_key: String,
}

impl std::fmt::Debug for R2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R2Config")
            .field("account_id", &self.account_id)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl R2Config {
    /// Load R2 configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no R2 variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        parse_config(lookup)
    }

    /// Cloudflare R2 S3-compatible endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }
}

/// Backup blobs stored under a key prefix in an R2 bucket.
///
/// The blob id is the full object key; the name is the key without prefix.
#[derive(Clone, Debug)]
pub struct R2BlobTransport {
    config: R2Config,
    prefix: String,
}

impl R2BlobTransport {
    #[must_use]
    pub fn new(config: R2Config, prefix: &str) -> Self {
        Self {
            config,
            prefix: normalize_prefix(prefix),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &R2Config {
        &self.config
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_key(&self, name: &str) -> Result<String> {
        Ok(format!("{}{}", self.prefix, validate_blob_name(name)?))
    }

    fn object_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)
            .filter(|name| !name.is_empty() && !name.contains('/'))
    }

    fn s3_client(&self) -> Client {
        build_s3_client(&self.config)
    }

    async fn put(&self, object_key: &str, bytes: &[u8]) -> Result<()> {
        self.s3_client()
            .put_object()
            .bucket(&self.config.bucket)
            .key(object_key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|error| transport_error("put_object", &self.config.bucket, object_key, &error))?;
        Ok(())
    }
}

impl BlobTransport for R2BlobTransport {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let object_key = self.object_key(name)?;
        self.put(&object_key, bytes).await?;
        tracing::debug!("Uploaded {} bytes to R2 key {object_key}", bytes.len());
        Ok(object_key)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let object_key = normalize_object_key(id)?;
        let response = self
            .s3_client()
            .get_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|error| {
                transport_error("get_object", &self.config.bucket, &object_key, &error)
            })?;

        let payload = response.body.collect().await.map_err(|error| {
            Error::network(
                NetworkErrorKind::NoConnectivity,
                format!(
                    "R2 get_object body failed for {}/{object_key}: {error}",
                    self.config.bucket
                ),
            )
        })?;

        Ok(payload.into_bytes().to_vec())
    }

    async fn list(&self) -> Result<Vec<RemoteFile>> {
        let client = self.s3_client();
        let mut files = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|error| {
                    transport_error("list_objects_v2", &self.config.bucket, &self.prefix, &error)
                })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let Some(name) = self.object_name(key) else {
                    continue;
                };
                let modified = object
                    .last_modified()
                    .and_then(|time| {
                        DateTime::<Utc>::from_timestamp(time.secs(), time.subsec_nanos())
                    })
                    .unwrap_or_else(Utc::now);
                files.push(RemoteFile {
                    id: key.to_string(),
                    name: name.to_string(),
                    size: object
                        .size()
                        .and_then(|size| u64::try_from(size).ok())
                        .unwrap_or_default(),
                    created_time: modified,
                    modified_time: modified,
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(files)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let object_key = normalize_object_key(id)?;
        self.s3_client()
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|error| {
                transport_error("delete_object", &self.config.bucket, &object_key, &error)
            })?;
        Ok(())
    }

    async fn update(&self, id: &str, name: &str, bytes: &[u8]) -> Result<String> {
        let old_key = normalize_object_key(id)?;
        let new_key = self.object_key(name)?;
        self.put(&new_key, bytes).await?;
        if old_key != new_key {
            self.delete(&old_key).await?;
        }
        Ok(new_key)
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<R2Config>> {
    let account_id = lookup(ENV_ACCOUNT_ID).map(|value| value.trim().to_string());
    let bucket = lookup(ENV_BUCKET).map(|value| value.trim().to_string());
    let access_key_id = lookup(ENV_ACCESS_KEY_ID).map(|value| value.trim().to_string());
    let secret_access_key = lookup(ENV_SECRET_ACCESS_KEY).map(|value| value.trim().to_string());

    let any_present = account_id.is_some()
        || bucket.is_some()
        || access_key_id.is_some()
        || secret_access_key.is_some();

    if !any_present {
        return Ok(None);
    }

    let required = |value: Option<String>, key: &'static str, missing: &mut Vec<&'static str>| {
        let value = value.filter(|value| !value.is_empty());
        if value.is_none() {
            missing.push(key);
        }
        value.unwrap_or_default()
    };

    let mut missing = Vec::new();
    let config = R2Config {
        account_id: required(account_id, ENV_ACCOUNT_ID, &mut missing),
        bucket: required(bucket, ENV_BUCKET, &mut missing),
        access_key_id: required(access_key_id, ENV_ACCESS_KEY_ID, &mut missing),
        secret_access_key: required(secret_access_key, ENV_SECRET_ACCESS_KEY, &mut missing),
    };

    if !missing.is_empty() {
        return Err(Error::InvalidInput(format!(
            "R2 configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    }

    Ok(Some(config))
}

fn build_s3_client(config: &R2Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "carebook-core-r2-transport",
    );

    let sdk_config = aws_sdk_s3::config::Builder::new()
        .region(Region::new("auto"))
        .credentials_provider(credentials)
        .endpoint_url(config.endpoint_url())
        .force_path_style(true)
        .build();

    Client::from_conf(sdk_config)
}

/// Map an SDK failure onto the transport error families.
fn transport_error<E>(
    operation: &str,
    bucket: &str,
    object_key: &str,
    error: &SdkError<E, HttpResponse>,
) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!(
        "R2 {operation} failed for {bucket}/{object_key}: {}",
        DisplayErrorContext(error)
    );

    match error {
        SdkError::TimeoutError(_) => Error::network(NetworkErrorKind::Timeout, message),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            Error::network(NetworkErrorKind::Timeout, message)
        }
        SdkError::DispatchFailure(_) => Error::network(NetworkErrorKind::NoConnectivity, message),
        SdkError::ConstructionFailure(_) => Error::InvalidInput(message),
        _ => match error.raw_response().map(|response| response.status().as_u16()) {
            Some(status) => error_for_status(status, message),
            None => Error::network(NetworkErrorKind::ServerError, message),
        },
    }
}

fn error_for_status(status: u16, message: String) -> Error {
    match status {
        401 => Error::authentication(AuthErrorKind::InvalidCredentials, message),
        403 => Error::authentication(AuthErrorKind::PermissionDenied, message),
        404 => Error::storage(StorageErrorKind::NotFound, message),
        429 => Error::network(NetworkErrorKind::RateLimited, message),
        507 => Error::storage(StorageErrorKind::InsufficientSpace, message),
        500..=599 => Error::network(NetworkErrorKind::ServerError, message),
        _ => Error::InvalidInput(message),
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    }
}

fn normalize_object_key(object_key: &str) -> Result<String> {
    let object_key = object_key.trim().trim_matches('/').to_string();
    if object_key.is_empty() {
        return Err(Error::InvalidInput(
            "R2 object key cannot be empty".to_string(),
        ));
    }
    Ok(object_key)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<R2Config>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    fn config() -> R2Config {
        R2Config {
            account_id: "account-1".to_string(),
            bucket: "bucket-a".to_string(),
            access_key_id: "AKID123".to_string(),
            secret_access_key: "SECRET123".to_string(),
        }
    }

    #[test]
    fn parse_config_none_returns_none() {
        let map = HashMap::new();
        assert!(parse_from_map(&map).unwrap().is_none());
    }

    #[test]
    fn parse_config_requires_all_required_values() {
        let mut map = HashMap::new();
        map.insert(ENV_ACCOUNT_ID, "account");
        map.insert(ENV_BUCKET, "bucket");

        let err = parse_from_map(&map).unwrap_err();
        match err {
            Error::InvalidInput(message) => {
                assert!(message.contains(ENV_ACCESS_KEY_ID));
                assert!(message.contains(ENV_SECRET_ACCESS_KEY));
                assert!(!message.contains(ENV_BUCKET));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_accepts_valid_values() {
        let mut map = HashMap::new();
        map.insert(ENV_ACCOUNT_ID, " account-1 ");
        map.insert(ENV_BUCKET, "bucket-a");
        map.insert(ENV_ACCESS_KEY_ID, "AKID123");
        map.insert(ENV_SECRET_ACCESS_KEY, "SECRET123");

        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(config, super::tests::config());
        assert_eq!(
            config.endpoint_url(),
            "https://account-1.r2.cloudflarestorage.com"
        );
    }

    #[test]
    fn debug_output_redacts_secret() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("SECRET123"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn keys_are_prefixed_and_names_recovered() {
        let transport = R2BlobTransport::new(config(), "/carebook/");
        assert_eq!(transport.prefix(), "carebook/");

        let key = transport.object_key("clinic_backup_c1.enc").unwrap();
        assert_eq!(key, "carebook/clinic_backup_c1.enc");
        assert_eq!(transport.object_name(&key), Some("clinic_backup_c1.enc"));
        assert_eq!(transport.object_name("carebook/nested/x.enc"), None);
        assert_eq!(transport.object_name("other/x.enc"), None);
        assert!(transport.object_key("../escape").is_err());

        let bare = R2BlobTransport::new(config(), "  ");
        assert_eq!(bare.object_key("x.enc").unwrap(), "x.enc");
    }

    #[test]
    fn status_codes_map_to_error_families() {
        let message = || "boom".to_string();
        assert!(error_for_status(401, message()).requires_reauthentication());
        assert!(error_for_status(403, message()).requires_reauthentication());
        assert!(error_for_status(429, message()).is_retryable());
        assert!(error_for_status(503, message()).is_retryable());
        assert!(matches!(
            error_for_status(404, message()),
            Error::Storage {
                kind: StorageErrorKind::NotFound,
                ..
            }
        ));
        assert!(!error_for_status(400, message()).is_retryable());
    }

    #[test]
    fn normalize_object_key_rejects_empty() {
        let err = normalize_object_key("   ").unwrap_err();
        match err {
            Error::InvalidInput(message) => assert!(message.contains("object key")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    #[ignore = "Requires local R2 env vars in process environment or .env"]
    fn from_env_loads_real_r2_config() {
        let _ = dotenvy::dotenv();

        let config = R2Config::from_env()
            .expect("R2 env parsing should not error")
            .expect("R2 config should be present");

        assert!(!config.account_id.trim().is_empty());
        assert!(!config.bucket.trim().is_empty());
        assert_eq!(
            config.endpoint_url(),
            format!("https://{}.r2.cloudflarestorage.com", config.account_id)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "Requires local R2 env vars plus network access"]
    async fn r2_blob_roundtrip_upload_list_download_delete() {
        let _ = dotenvy::dotenv();

        let config = R2Config::from_env()
            .expect("R2 env parsing should not error")
            .expect("R2 config should be present");
        let transport = R2BlobTransport::new(config, "carebook-integration/");
        let name = format!("roundtrip-{}.bin", uuid::Uuid::now_v7());

        let id = transport
            .upload(&name, b"r2-roundtrip-test")
            .await
            .unwrap_or_else(|error| panic!("R2 upload failed: {error}"));

        let listed = transport.find_by_name(&name).await.unwrap();
        assert_eq!(listed.map(|file| file.id), Some(id.clone()));
        assert_eq!(transport.download(&id).await.unwrap(), b"r2-roundtrip-test");

        transport
            .delete(&id)
            .await
            .unwrap_or_else(|error| panic!("R2 delete failed for key '{id}': {error}"));
    }
}
