//! Content-node handling: strip transport wrappers, then classify.

pub mod classifier;
pub mod envelope;

pub use classifier::{classify, ClassifiedMessage, MediaDescriptor, MessageKind};
pub use envelope::{unwrap, MAX_UNWRAP_DEPTH};

/// Unwrap and classify a raw content node in one step.
pub fn normalize(node: &serde_json::Value) -> ClassifiedMessage {
    classify(unwrap(node))
}
