//! UTF-8 JSON wire codec for envelopes.
//!
//! The whole envelope is serialized, not just the payload, so a consumer can
//! reconstruct identity and tracing metadata from the body alone even when
//! broker properties are stripped by an intermediary.
//!
//! Decoding distinguishes an out-of-set kind tag
//! ([`EnvelopeError::UnknownKind`]) from structurally malformed bytes
//! ([`EnvelopeError::Decode`]); both are fatal and never retried.

use crate::envelope::{Envelope, EventKind};
use crate::error::EnvelopeError;

/// Encode an envelope to its UTF-8 JSON wire body.
///
/// # Errors
///
/// Returns [`EnvelopeError::Encode`] if serialization fails; with the closed
/// payload set this indicates a programming error, not a data problem.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(envelope).map_err(|e| EnvelopeError::Encode(e.to_string()))
}

/// Decode a wire body back into an envelope.
///
/// # Errors
///
/// Returns [`EnvelopeError::UnknownKind`] when the payload discriminator
/// names a kind outside the closed set, and [`EnvelopeError::Decode`] for any
/// other parse failure.
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) => Ok(envelope),
        Err(err) => Err(classify_decode_failure(bytes, &err)),
    }
}

/// A failed full decode is either an unknown kind tag (the tag parses but is
/// outside the enum) or genuinely malformed bytes.
fn classify_decode_failure(bytes: &[u8], err: &serde_json::Error) -> EnvelopeError {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
        let tag = value
            .get("payload")
            .and_then(|payload| payload.get("kind"))
            .and_then(serde_json::Value::as_str);
        if let Some(tag) = tag {
            if EventKind::from_wire_tag(tag).is_none() {
                return EnvelopeError::UnknownKind(tag.to_string());
            }
        }
    }
    EnvelopeError::Decode(err.to_string())
}
