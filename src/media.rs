//! Attachment resolution: fetch media bytes and pick a filename.

use crate::clock::Clock;
use crate::config::MediaConfig;
use crate::content::{MediaDescriptor, MessageKind};
use anyhow::Context;
use chrono::NaiveDate;
use std::time::Duration;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum MediaFetchError {
    #[error("no media url available for message '{message_id}'")]
    MissingUrl { message_id: String },

    #[error("media request to '{url}' failed: {reason}")]
    Request { url: String, reason: String },

    #[error("media request to '{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("media at '{url}' exceeds size limit: {size_bytes} bytes > {max_bytes} bytes")]
    TooLarge {
        url: String,
        size_bytes: usize,
        max_bytes: usize,
    },
}

/// What the fetch collaborator needs to locate one media blob.
#[derive(Debug, Clone, Copy)]
pub struct MediaRequest<'a> {
    pub message_id: &'a str,
    pub url: Option<&'a str>,
}

/// Network collaborator that downloads media bytes.
pub trait MediaFetcher {
    fn fetch(&self, request: &MediaRequest<'_>) -> Result<Vec<u8>, MediaFetchError>;
}

/// Blocking HTTP fetcher.
///
/// With `provider_url` configured, bytes come from the provider's
/// `/messages/{id}/media` endpoint (the provider decrypts them); otherwise the
/// descriptor url is fetched directly.
pub struct HttpMediaFetcher {
    client: reqwest::blocking::Client,
    provider_url: Option<String>,
    api_key: Option<String>,
    max_bytes: usize,
}

impl HttpMediaFetcher {
    pub fn new(config: &MediaConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build media HTTP client")?;
        Ok(Self {
            client,
            provider_url: config
                .provider_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            max_bytes: config.max_bytes,
        })
    }

    fn media_url(&self, request: &MediaRequest<'_>) -> Result<String, MediaFetchError> {
        if let Some(base) = &self.provider_url {
            let encoded_id = urlencoding::encode(request.message_id);
            return Ok(format!("{base}/messages/{encoded_id}/media"));
        }
        request
            .url
            .filter(|url| !url.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| MediaFetchError::MissingUrl {
                message_id: request.message_id.to_string(),
            })
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn fetch(&self, request: &MediaRequest<'_>) -> Result<Vec<u8>, MediaFetchError> {
        let url = self.media_url(request)?;

        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().map_err(|e| MediaFetchError::Request {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaFetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        if let Some(declared) = response.content_length() {
            let declared = usize::try_from(declared).unwrap_or(usize::MAX);
            if declared > self.max_bytes {
                return Err(MediaFetchError::TooLarge {
                    url,
                    size_bytes: declared,
                    max_bytes: self.max_bytes,
                });
            }
        }

        let bytes = response.bytes().map_err(|e| MediaFetchError::Request {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        if bytes.len() > self.max_bytes {
            return Err(MediaFetchError::TooLarge {
                url,
                size_bytes: bytes.len(),
                max_bytes: self.max_bytes,
            });
        }

        Ok(bytes.to_vec())
    }
}

/// Downloaded media ready to be attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

pub struct AttachmentResolver<'a> {
    fetcher: &'a dyn MediaFetcher,
    clock: &'a dyn Clock,
}

impl<'a> AttachmentResolver<'a> {
    pub fn new(fetcher: &'a dyn MediaFetcher, clock: &'a dyn Clock) -> Self {
        Self { fetcher, clock }
    }

    pub fn resolve(
        &self,
        kind: MessageKind,
        media: &MediaDescriptor,
        message_id: &str,
    ) -> Result<ResolvedAttachment, MediaFetchError> {
        let data = self.fetcher.fetch(&MediaRequest {
            message_id,
            url: media.url.as_deref(),
        })?;

        Ok(ResolvedAttachment {
            file_name: attachment_file_name(kind, media, message_id, self.clock.today()),
            mime_type: media
                .mimetype
                .as_deref()
                .map(base_mime_type)
                .filter(|mime| !mime.is_empty())
                .unwrap_or(DEFAULT_MIME_TYPE)
                .to_string(),
            data,
        })
    }
}

/// Provided `fileName` verbatim, else `{category}_{message_id}_{YYYYMMDD}.{ext}`.
pub fn attachment_file_name(
    kind: MessageKind,
    media: &MediaDescriptor,
    message_id: &str,
    date: NaiveDate,
) -> String {
    if let Some(name) = media.file_name.as_deref().filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }

    let category = kind.attachment_category().unwrap_or("file");
    let extension = extension_for_mime(media.mimetype.as_deref().unwrap_or(DEFAULT_MIME_TYPE));
    format!(
        "{category}_{}_{}.{extension}",
        file_name_component(message_id),
        date.format("%Y%m%d")
    )
}

/// Replace path separators and control characters so the id stays one
/// file-name component.
fn file_name_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Mimetype without parameters (`audio/ogg; codecs=opus` → `audio/ogg`).
fn base_mime_type(mimetype: &str) -> &str {
    mimetype.split(';').next().unwrap_or_default().trim()
}

/// Canonical file extension for a mimetype, ignoring parameters.
pub fn extension_for_mime(mimetype: &str) -> String {
    let base = base_mime_type(mimetype).to_ascii_lowercase();
    let subtype = base.split_once('/').map_or(base.as_str(), |(_, sub)| sub);

    let known = match subtype {
        "jpeg" | "jpg" | "pjpeg" => Some("jpeg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        "ogg" => Some("ogg"),
        "opus" => Some("opus"),
        "mpeg" | "mp3" => Some("mp3"),
        "mp4" => Some("mp4"),
        "aac" => Some("aac"),
        "amr" => Some("amr"),
        "pdf" => Some("pdf"),
        "plain" => Some("txt"),
        "csv" => Some("csv"),
        "zip" => Some("zip"),
        "msword" => Some("doc"),
        "vnd.ms-excel" => Some("xls"),
        "vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        "vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Some("xlsx"),
        "vnd.openxmlformats-officedocument.presentationml.presentation" => Some("pptx"),
        _ => None,
    };
    if let Some(ext) = known {
        return ext.to_string();
    }

    let sanitized: String = subtype
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if sanitized.is_empty() || base == DEFAULT_MIME_TYPE {
        "bin".to_string()
    } else {
        sanitized
    }
}
