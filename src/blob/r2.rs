//! S3-compatible (Cloudflare R2) backend
//!
//! Objects live at `{bucket}/{folder}/{filename}`; the handle is
//! `r2-{folder}:{filename}`. Requests are signed with AWS Signature V4.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

use super::{file_safe, hash_fragment, BackendKind, BlobBackend, BlobHandle};
use crate::config::R2Config;
use crate::error::{Result, StorageError};

const BACKEND: &str = "r2";
const SERVICE: &str = "s3";

type HmacSha256 = Hmac<Sha256>;

pub struct R2Store {
    client: Client,
    endpoint: String,
    bucket: String,
    region: String,
    folder: String,
    access_key_id: String,
    secret_access_key: String,
}

impl R2Store {
    pub fn new(config: &R2Config) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| StorageError::Config(format!("r2 http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            folder: config.folder.trim_matches('/').to_string(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
        })
    }

    /// Percent-encoded object path, used both in the URL and the signature
    fn object_path(&self, folder: &str, filename: &str) -> String {
        let mut path = format!("/{}", urlencoding::encode(&self.bucket));
        for segment in folder.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(&urlencoding::encode(segment));
        }
        path.push('/');
        path.push_str(&urlencoding::encode(filename));
        path
    }

    fn split_handle<'a>(&self, handle: &'a BlobHandle) -> Result<(&'a str, &'a str)> {
        handle
            .id
            .split_once(':')
            .filter(|(_, filename)| !filename.is_empty())
            .ok_or_else(|| StorageError::InvalidHandle(handle.to_string()))
    }

    /// Build a signed request for `path`
    fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: &[u8],
        content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<reqwest::RequestBuilder> {
        let url = reqwest::Url::parse(&format!("{}{}", self.endpoint, path))
            .map_err(|e| StorageError::Config(format!("r2 endpoint: {}", e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::Config("r2 endpoint has no host".into())),
        };

        let payload_hash = hex::encode(Sha256::digest(payload));
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = BTreeMap::new();
        if let Some(content_type) = content_type {
            headers.insert("content-type".to_string(), content_type.to_string());
        }
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());

        let credentials = Credentials {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            region: &self.region,
        };
        let authorization =
            authorization_header(&credentials, method.as_str(), path, &headers, &payload_hash, &amz_date)?;

        let mut request = self.client.request(method, url);
        for (name, value) in &headers {
            // reqwest derives Host from the URL
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        Ok(request.header(reqwest::header::AUTHORIZATION, authorization))
    }
}

pub(crate) struct Credentials<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Config(format!("signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// AWS Signature V4 `Authorization` value.
///
/// `headers` must hold every signed header, lowercase-named; `amz_date` is
/// the `x-amz-date` value. No query string is signed.
pub(crate) fn authorization_header(
    credentials: &Credentials<'_>,
    method: &str,
    canonical_uri: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    amz_date: &str,
) -> Result<String> {
    let date = &amz_date[..8.min(amz_date.len())];
    let scope = format!("{}/{}/{}/aws4_request", date, credentials.region, SERVICE);

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{}", credentials.secret_access_key).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, credentials.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, signed_headers, signature
    ))
}

#[async_trait]
impl BlobBackend for R2Store {
    fn kind(&self) -> BackendKind {
        BackendKind::R2
    }

    async fn put(&self, course_id: &str, hash: &str, bytes: &[u8]) -> Result<BlobHandle> {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let filename = format!(
            "{}-{}-{}-{}.json",
            file_safe(course_id),
            now.timestamp_millis(),
            hash_fragment(hash, 12),
            &suffix[..8]
        );
        let path = self.object_path(&self.folder, &filename);

        let response = self
            .signed(reqwest::Method::PUT, &path, bytes, Some("application/json"), now)?
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BACKEND, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::unavailable(BACKEND, format!("PUT {}: {}", status, body)));
        }

        debug!(course_id = %course_id, filename = %filename, "Uploaded blob to r2");
        Ok(BlobHandle::new(BackendKind::R2, format!("{}:{}", self.folder, filename)))
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        let (folder, filename) = self.split_handle(handle)?;
        let path = self.object_path(folder, filename);

        let response = self
            .signed(reqwest::Method::GET, &path, b"", None, Utc::now())?
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BACKEND, e))?;

        match response.status() {
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| StorageError::unavailable(BACKEND, e))?;
                Ok(bytes.to_vec())
            }
            StatusCode::NOT_FOUND => Err(StorageError::BlobNotFound(handle.to_string())),
            status => Err(StorageError::unavailable(BACKEND, format!("GET {}", status))),
        }
    }
}
