//! Message content (outbound and inbound) and synchronous validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};
use crate::id::{MessageId, SessionId, TenantId};

/// Longest accepted text body (provider limit).
pub const MAX_TEXT_LEN: usize = 4096;

/// Largest accepted inline media buffer.
pub const MAX_MEDIA_BYTES: usize = 16 * 1024 * 1024;

/// Where the bytes of a media message come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum MediaSource {
    Url(String),
    Buffer(Vec<u8>),
}

/// What is being sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MessageContent {
    Text {
        text: String,
        quoted_id: Option<String>,
    },
    Media {
        source: MediaSource,
        mimetype: String,
        caption: Option<String>,
        filename: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        address: Option<String>,
        name: Option<String>,
    },
}

impl MessageContent {
    /// Job name used when this content is queued.
    pub fn job_name(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "send_text",
            MessageContent::Media { .. } => "send_media",
            MessageContent::Location { .. } => "send_location",
        }
    }

    /// Text the deduplicator fingerprints for this content.
    ///
    /// Media starts with the sha256 of its bytes or full url, so distinct
    /// files stay distinct however the key prefix is cut.
    pub fn dedup_content(&self) -> String {
        match self {
            MessageContent::Text { text, .. } => text.clone(),
            MessageContent::Media {
                source,
                mimetype,
                caption,
                ..
            } => {
                let digest = match source {
                    MediaSource::Url(url) => Sha256::digest(url.as_bytes()),
                    MediaSource::Buffer(bytes) => Sha256::digest(bytes),
                };
                format!(
                    "media:{}:{mimetype}:{}",
                    hex::encode(digest),
                    caption.as_deref().unwrap_or("")
                )
            }
            MessageContent::Location {
                latitude,
                longitude,
                ..
            } => format!("location:{latitude},{longitude}"),
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        match self {
            MessageContent::Text { text, .. } => {
                if text.trim().is_empty() {
                    return Err(GatewayError::validation("text must not be empty"));
                }
                if text.chars().count() > MAX_TEXT_LEN {
                    return Err(GatewayError::validation(format!(
                        "text longer than {MAX_TEXT_LEN} characters"
                    )));
                }
            }
            MessageContent::Media {
                source, mimetype, ..
            } => {
                match source {
                    MediaSource::Url(url) => {
                        if !(url.starts_with("http://") || url.starts_with("https://")) {
                            return Err(GatewayError::validation(
                                "media url must be http(s)",
                            ));
                        }
                    }
                    MediaSource::Buffer(bytes) => {
                        if bytes.is_empty() {
                            return Err(GatewayError::validation("media buffer is empty"));
                        }
                        if bytes.len() > MAX_MEDIA_BYTES {
                            return Err(GatewayError::validation(format!(
                                "media buffer larger than {MAX_MEDIA_BYTES} bytes"
                            )));
                        }
                    }
                }
                let mut parts = mimetype.splitn(2, '/');
                let (top, sub) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
                if top.is_empty() || sub.is_empty() {
                    return Err(GatewayError::validation(format!(
                        "invalid mimetype {mimetype:?}"
                    )));
                }
            }
            MessageContent::Location {
                latitude,
                longitude,
                ..
            } => {
                if !latitude.is_finite() || !(-90.0..=90.0).contains(latitude) {
                    return Err(GatewayError::validation("latitude out of range"));
                }
                if !longitude.is_finite() || !(-180.0..=180.0).contains(longitude) {
                    return Err(GatewayError::validation("longitude out of range"));
                }
            }
        }
        Ok(())
    }
}

/// A message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Provider-side recipient address (phone number or chat id).
    pub to: String,
    pub content: MessageContent,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, content: MessageContent) -> Self {
        Self {
            to: to.into(),
            content,
        }
    }

    pub fn text(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            to,
            MessageContent::Text {
                text: text.into(),
                quoted_id: None,
            },
        )
    }

    pub fn validate(&self) -> GatewayResult<()> {
        validate_recipient(&self.to)?;
        self.content.validate()
    }
}

/// A message received from the channel, queued for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    /// Provider-side sender address.
    pub from: String,
    pub body: String,
    pub provider_message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        from: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            tenant_id,
            session_id,
            from: from.into(),
            body: body.into(),
            provider_message_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        validate_recipient(&self.from)?;
        if self.body.len() > MAX_TEXT_LEN * 4 {
            return Err(GatewayError::validation("inbound body too large"));
        }
        Ok(())
    }
}

/// Recipients are provider addresses: non-empty, no whitespace, bounded.
pub fn validate_recipient(to: &str) -> GatewayResult<()> {
    if to.is_empty() {
        return Err(GatewayError::validation("recipient must not be empty"));
    }
    if to.len() > 128 {
        return Err(GatewayError::validation("recipient longer than 128 characters"));
    }
    if to.chars().any(char::is_whitespace) {
        return Err(GatewayError::validation("recipient must not contain whitespace"));
    }
    Ok(())
}
