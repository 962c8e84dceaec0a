use serde::Serialize;
use serde_json::Value;

/// Closed set of content shapes the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    PlainText,
    ExtendedText,
    Image,
    Document,
    DocumentWithCaption,
    Audio,
    Reaction,
    Unsupported,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlainText => "plain_text",
            Self::ExtendedText => "extended_text",
            Self::Image => "image",
            Self::Document => "document",
            Self::DocumentWithCaption => "document_with_caption",
            Self::Audio => "audio",
            Self::Reaction => "reaction",
            Self::Unsupported => "unsupported",
        }
    }

    /// Filename prefix for generated attachment names; `None` for kinds without media.
    pub fn attachment_category(self) -> Option<&'static str> {
        match self {
            Self::Image => Some("image"),
            Self::Audio => Some("audio"),
            Self::Document | Self::DocumentWithCaption => Some("document"),
            Self::PlainText | Self::ExtendedText | Self::Reaction | Self::Unsupported => None,
        }
    }
}

/// Media pointer as carried on image/document/audio nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub url: Option<String>,
    pub mimetype: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedMessage {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media: Option<MediaDescriptor>,
    /// `key.id` of the message a reaction points at.
    pub reaction_target_id: Option<String>,
    /// `contextInfo.stanzaId` of a quoted message.
    pub quoted_external_id: Option<String>,
}

impl ClassifiedMessage {
    fn new(kind: MessageKind, content: Option<String>) -> Self {
        Self {
            kind,
            content,
            media: None,
            reaction_target_id: None,
            quoted_external_id: None,
        }
    }

    pub fn unsupported() -> Self {
        Self::new(MessageKind::Unsupported, Some(String::new()))
    }

    pub fn is_reaction(&self) -> bool {
        self.kind == MessageKind::Reaction
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind == MessageKind::Unsupported
    }

    /// External id this message should be linked to, if any.
    pub fn reply_target_id(&self) -> Option<&str> {
        self.reaction_target_id
            .as_deref()
            .or(self.quoted_external_id.as_deref())
    }
}

/// Content keys in match priority order. `documentWithCaptionMessage` must
/// precede `documentMessage` because it wraps one.
const CONTENT_KEYS: [(&str, MessageKind); 7] = [
    ("conversation", MessageKind::PlainText),
    ("extendedTextMessage", MessageKind::ExtendedText),
    ("imageMessage", MessageKind::Image),
    ("documentWithCaptionMessage", MessageKind::DocumentWithCaption),
    ("documentMessage", MessageKind::Document),
    ("audioMessage", MessageKind::Audio),
    ("reactionMessage", MessageKind::Reaction),
];

/// Map an unwrapped content node to its kind and extracted fields.
pub fn classify(node: &Value) -> ClassifiedMessage {
    CONTENT_KEYS
        .iter()
        .find_map(|(key, kind)| node.get(*key).and_then(|inner| extract(*kind, inner)))
        .unwrap_or_else(ClassifiedMessage::unsupported)
}

fn extract(kind: MessageKind, inner: &Value) -> Option<ClassifiedMessage> {
    match kind {
        MessageKind::PlainText => extract_plain_text(inner),
        MessageKind::ExtendedText => extract_extended_text(inner),
        MessageKind::Image => extract_media(kind, inner, true),
        MessageKind::Document | MessageKind::Audio => extract_media(kind, inner, false),
        MessageKind::DocumentWithCaption => extract_document_with_caption(inner),
        MessageKind::Reaction => extract_reaction(inner),
        MessageKind::Unsupported => None,
    }
}

fn extract_plain_text(inner: &Value) -> Option<ClassifiedMessage> {
    let text = inner.as_str()?;
    Some(ClassifiedMessage::new(
        MessageKind::PlainText,
        Some(text.to_string()),
    ))
}

fn extract_extended_text(inner: &Value) -> Option<ClassifiedMessage> {
    let text = string_field(inner, "text")?;
    let mut classified = ClassifiedMessage::new(MessageKind::ExtendedText, Some(text));
    classified.quoted_external_id = quoted_id(inner);
    Some(classified)
}

fn extract_media(kind: MessageKind, inner: &Value, with_caption: bool) -> Option<ClassifiedMessage> {
    if !inner.is_object() {
        return None;
    }
    let content = if with_caption {
        string_field(inner, "caption")
    } else {
        None
    };
    let mut classified = ClassifiedMessage::new(kind, content);
    classified.media = Some(MediaDescriptor {
        url: string_field(inner, "url"),
        mimetype: string_field(inner, "mimetype"),
        file_name: string_field(inner, "fileName"),
    });
    classified.quoted_external_id = quoted_id(inner);
    Some(classified)
}

fn extract_document_with_caption(inner: &Value) -> Option<ClassifiedMessage> {
    let document = inner.get("message")?.get("documentMessage")?;
    extract_media(MessageKind::DocumentWithCaption, document, true)
}

fn extract_reaction(inner: &Value) -> Option<ClassifiedMessage> {
    if !inner.is_object() {
        return None;
    }
    let emoji = string_field(inner, "text").unwrap_or_default();
    let mut classified = ClassifiedMessage::new(MessageKind::Reaction, Some(emoji));
    classified.reaction_target_id = inner
        .get("key")
        .and_then(|key| string_field(key, "id"));
    Some(classified)
}

fn quoted_id(inner: &Value) -> Option<String> {
    inner
        .get("contextInfo")
        .and_then(|context| string_field(context, "stanzaId"))
}

fn string_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
