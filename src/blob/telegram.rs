//! Telegram Bot API backend
//!
//! Blobs are uploaded as documents to a private chat. The returned
//! `file_id` is the handle; downloads go through `getFile`.

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{file_safe, hash_fragment, BackendKind, BlobBackend, BlobHandle};
use crate::config::TelegramConfig;
use crate::error::{Result, StorageError};

const BACKEND: &str = "telegram";

pub struct TelegramTransport {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    max_upload_bytes: usize,
}

/// Bot API envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct Document {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| StorageError::Config(format!("telegram http client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.bot_token, file_path)
    }

    async fn resolve_file_path(&self, handle: &BlobHandle) -> Result<String> {
        let response = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", handle.id.as_str())])
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BACKEND, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::BlobNotFound(handle.to_string()));
        }

        let body: ApiResponse<File> = response
            .json()
            .await
            .map_err(|e| StorageError::unavailable(BACKEND, e))?;

        if !body.ok {
            let description = body.description.unwrap_or_default();
            // Bot API answers 400 "Bad Request: invalid file_id" for unknown files
            if status == StatusCode::BAD_REQUEST && description.contains("file") {
                return Err(StorageError::BlobNotFound(handle.to_string()));
            }
            return Err(StorageError::unavailable(
                BACKEND,
                format!("getFile {}: {}", status, description),
            ));
        }

        body.result
            .and_then(|file| file.file_path)
            .ok_or_else(|| StorageError::BlobNotFound(handle.to_string()))
    }
}

#[async_trait]
impl BlobBackend for TelegramTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Telegram
    }

    async fn put(&self, course_id: &str, hash: &str, bytes: &[u8]) -> Result<BlobHandle> {
        if bytes.len() > self.max_upload_bytes {
            return Err(StorageError::TooLarge {
                backend: BACKEND.to_string(),
                size: bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let filename = format!("{}-{}.json", file_safe(course_id), hash_fragment(hash, 12));
        let document = multipart::Part::bytes(bytes.to_vec())
            .file_name(filename)
            .mime_str("application/json")
            .map_err(|e| StorageError::unavailable(BACKEND, e))?;
        let form = multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", format!("course:{} hash:{}", course_id, hash_fragment(hash, 12)))
            .part("document", document);

        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BACKEND, e))?;

        let status = response.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(StorageError::TooLarge {
                backend: BACKEND.to_string(),
                size: bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let body: ApiResponse<Message> = response
            .json()
            .await
            .map_err(|e| StorageError::unavailable(BACKEND, format!("{}: {}", status, e)))?;

        if !body.ok {
            return Err(StorageError::unavailable(
                BACKEND,
                format!("sendDocument {}: {}", status, body.description.unwrap_or_default()),
            ));
        }

        let file_id = body
            .result
            .and_then(|message| message.document)
            .map(|document| document.file_id)
            .ok_or_else(|| StorageError::unavailable(BACKEND, "sendDocument returned no document"))?;

        debug!(course_id = %course_id, file_id = %file_id, "Uploaded blob to telegram");
        Ok(BlobHandle::new(BackendKind::Telegram, file_id))
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        let file_path = self.resolve_file_path(handle).await?;

        let response = self
            .client
            .get(self.file_url(&file_path))
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
            status => Err(StorageError::unavailable(BACKEND, format!("download {}", status))),
        }
    }
}
