//! Wire types for Baileys webhook deliveries.
//!
//! The outer envelope is decoded strictly, but each raw message stays a
//! `serde_json::Value` until it is processed so that one malformed entry
//! cannot reject the whole batch.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Event name carrying new or re-delivered messages.
pub const MESSAGES_UPSERT: &str = "messages.upsert";

/// `{event, data, webhookVerifyToken?}` as posted by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_verify_token: Option<String>,
}

impl EventEnvelope {
    pub fn is_messages_upsert(&self) -> bool {
        self.event == MESSAGES_UPSERT
    }

    /// Decode the `data` node of a `messages.upsert` event.
    pub fn upsert_data(&self) -> Result<UpsertData, serde_json::Error> {
        if self.data.is_null() {
            return Ok(UpsertData::default());
        }
        UpsertData::deserialize(&self.data)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertData {
    /// `notify` for live traffic, `append` for history sync.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub id: String,
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub remote_jid_alt: Option<String>,
    #[serde(default)]
    pub from_me: Option<bool>,
    #[serde(default)]
    pub addressing_mode: Option<String>,
}

impl MessageKey {
    pub fn from_me(&self) -> bool {
        self.from_me.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub message_timestamp: Option<i64>,
    /// Content node; shape is resolved by the unwrapper and classifier.
    #[serde(default)]
    pub message: Value,
}

impl RawMessage {
    pub fn decode(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.push_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Best-effort extraction of the provider message id from an undecodable entry.
pub fn peek_message_id(value: &Value) -> Option<String> {
    value
        .get("key")
        .and_then(|key| key.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Timestamps arrive as numbers, numeric strings, or protobuf `Long` objects.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Object(map) => {
            let low = map.get("low").and_then(Value::as_i64).unwrap_or(0);
            let high = map.get("high").and_then(Value::as_i64).unwrap_or(0);
            Some((high << 32) | (low & 0xFFFF_FFFF))
        }
        _ => None,
    })
}
