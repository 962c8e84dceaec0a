use serde_json::Value;

/// Upper bound on nested wrappers; malformed payloads stop here.
pub const MAX_UNWRAP_DEPTH: usize = 4;

/// Wrapper kinds whose `message` child is the real content node.
const WRAPPER_KEYS: [&str; 5] = [
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "deviceSentMessage",
];

/// Descend through transport wrappers (disappearing, view-once, device-sent)
/// until a plain content node is reached.
///
/// The outer key, timestamp and sender live outside the content node and are
/// untouched by this.
pub fn unwrap(node: &Value) -> &Value {
    let mut current = node;
    for _ in 0..MAX_UNWRAP_DEPTH {
        match inner_message(current) {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

fn inner_message(node: &Value) -> Option<&Value> {
    WRAPPER_KEYS
        .iter()
        .find_map(|key| node.get(*key).and_then(|wrapper| wrapper.get("message")))
        .filter(|inner| inner.is_object())
}
