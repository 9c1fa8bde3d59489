use thiserror::Error;

/// Errors raised while encoding, decoding, or publishing bus messages.
#[derive(Debug, Error)]
pub enum BusError {
  /// A payload could not be serialized.
  #[error("failed to encode payload for '{topic}': {source}")]
  Encode {
    topic: String,
    #[source]
    source: serde_json::Error,
  },

  /// A payload did not match the shape expected for its topic.
  #[error("malformed payload on '{topic}': {source}")]
  Decode {
    topic: String,
    #[source]
    source: serde_json::Error,
  },

  /// The receiving side of the transport is gone.
  #[error("bus closed")]
  Closed,
}
